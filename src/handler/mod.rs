//! Capture handlers: the producers and sinks at the edges of a pipeline
//!
//! A [`CaptureHandler`] fills input buffers with data and consumes finished
//! output buffers. It is called synchronously from the driver thread and
//! only ever borrows a buffer for the duration of the call.
//!
//! - [`StreamCaptureHandler`]: reads from / writes to files
//! - [`MemoryHandler`]: in-memory source and sink
//! - [`FrameCollector`]: reassembles complete frames for analysis consumers

pub mod frame;
pub mod memory;
pub mod stream;

pub use frame::{Frame, FrameCollector};
pub use memory::MemoryHandler;
pub use stream::StreamCaptureHandler;

use crate::buffer::BufferHeader;
use crate::error::HandlerError;

/// Outcome of filling one input buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FillResult {
    pub bytes_written: usize,
    pub end_of_data: bool,
}

impl FillResult {
    pub fn data(bytes_written: usize) -> Self {
        Self {
            bytes_written,
            end_of_data: false,
        }
    }

    /// Final fill; `bytes_written` may be zero
    pub fn end(bytes_written: usize) -> Self {
        Self {
            bytes_written,
            end_of_data: true,
        }
    }
}

/// Producer and/or sink attached to a port
///
/// Methods take `&self`; implementations use interior mutability where they
/// keep state. Neither method may keep a reference to the buffer.
pub trait CaptureHandler: Send + Sync {
    /// Human-readable name for logging
    fn name(&self) -> &str;

    /// Write up to `buffer.len()` bytes of input data
    ///
    /// Default implementation has no data to give.
    fn fill(&self, buffer: &mut [u8]) -> Result<FillResult, HandlerError> {
        let _ = buffer;
        Ok(FillResult::end(0))
    }

    /// Take the payload of a finished output buffer
    ///
    /// Default implementation discards it.
    fn consume(&self, buffer: &BufferHeader) -> Result<(), HandlerError> {
        let _ = buffer;
        Ok(())
    }
}
