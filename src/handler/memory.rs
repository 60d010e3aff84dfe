//! In-memory producer and sink

use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::buffer::{BufferFlags, BufferHeader};
use crate::error::HandlerError;
use crate::handler::{CaptureHandler, FillResult};

struct Source {
    data: Bytes,
    pos: usize,
}

/// Feeds input from a byte slice and collects consumed output in memory
pub struct MemoryHandler {
    name: String,
    source: Mutex<Source>,
    chunk_limit: Option<usize>,
    output: Mutex<Vec<u8>>,
    flags: Mutex<Vec<BufferFlags>>,
    consumed: AtomicUsize,
}

impl MemoryHandler {
    /// Sink only: has no input data
    pub fn sink(name: impl Into<String>) -> Self {
        Self::source(name, Bytes::new())
    }

    /// Producer that hands out `data` and also records anything consumed
    pub fn source(name: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            source: Mutex::new(Source {
                data: data.into(),
                pos: 0,
            }),
            chunk_limit: None,
            output: Mutex::new(Vec::new()),
            flags: Mutex::new(Vec::new()),
            consumed: AtomicUsize::new(0),
        }
    }

    /// Cap how many bytes one fill may produce
    pub fn with_chunk_size(mut self, chunk: usize) -> Self {
        self.chunk_limit = Some(chunk.max(1));
        self
    }

    /// Everything consumed so far, in order
    pub fn output(&self) -> Vec<u8> {
        self.output.lock().clone()
    }

    /// Number of buffers consumed
    pub fn buffers_consumed(&self) -> usize {
        self.consumed.load(Ordering::SeqCst)
    }

    /// Flags of every consumed buffer, in order
    pub fn flags_seen(&self) -> Vec<BufferFlags> {
        self.flags.lock().clone()
    }

    /// Input bytes not yet handed out
    pub fn remaining(&self) -> usize {
        let source = self.source.lock();
        source.data.len() - source.pos
    }
}

impl CaptureHandler for MemoryHandler {
    fn name(&self) -> &str {
        &self.name
    }

    fn fill(&self, buffer: &mut [u8]) -> Result<FillResult, HandlerError> {
        let mut source = self.source.lock();
        let remaining = source.data.len() - source.pos;
        let n = remaining
            .min(buffer.len())
            .min(self.chunk_limit.unwrap_or(usize::MAX));
        buffer[..n].copy_from_slice(&source.data[source.pos..source.pos + n]);
        source.pos += n;

        if source.pos == source.data.len() {
            Ok(FillResult::end(n))
        } else {
            Ok(FillResult::data(n))
        }
    }

    fn consume(&self, buffer: &BufferHeader) -> Result<(), HandlerError> {
        self.output.lock().extend_from_slice(buffer.data());
        self.flags.lock().push(buffer.flags());
        self.consumed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
