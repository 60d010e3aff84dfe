//! Hardware stage binding
//!
//! The accelerator itself is external. The engine only sees it through
//! [`HardwareStage`]: opaque capability queries per port, format commit,
//! port enable/disable with a completion callback, and buffer submission.
//! Completion callbacks fire on the stage's own threads, in no particular
//! order relative to the driver.

pub mod loopback;

pub use loopback::{LoopbackConfig, LoopbackStage, SourceConfig};

use thiserror::Error;

use crate::buffer::BufferHeader;
use crate::error::Error;
use crate::port::{PortCallback, PortFormat, PortId};

/// Buffer limits a port reports once its format is committed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortCapabilities {
    pub buffer_num_min: usize,
    pub buffer_num_recommended: usize,
    pub buffer_size_min: usize,
    pub buffer_size_recommended: usize,
}

impl PortCapabilities {
    pub fn new(buffer_num: usize, buffer_size: usize) -> Self {
        Self {
            buffer_num_min: buffer_num,
            buffer_num_recommended: buffer_num,
            buffer_size_min: buffer_size,
            buffer_size_recommended: buffer_size,
        }
    }

    /// Buffer count to allocate: the larger of recommended and minimum
    pub fn buffer_num(&self) -> usize {
        self.buffer_num_recommended.max(self.buffer_num_min)
    }

    /// Buffer size to allocate: the larger of recommended and minimum
    pub fn buffer_size(&self) -> usize {
        self.buffer_size_recommended.max(self.buffer_size_min)
    }

    /// Apply caller overrides, never going below the hardware minimum
    pub fn negotiate(&self, num: Option<usize>, size: Option<usize>) -> (usize, usize) {
        (
            num.map_or(self.buffer_num(), |n| n.max(self.buffer_num_min)),
            size.map_or(self.buffer_size(), |s| s.max(self.buffer_size_min)),
        )
    }
}

/// A submission the stage refused; the buffer is handed back
#[derive(Error, Debug)]
#[error("submit failed: {error}")]
pub struct SubmitError {
    pub error: Error,
    pub buffer: BufferHeader,
}

impl SubmitError {
    pub fn new(error: impl Into<Error>, buffer: BufferHeader) -> Self {
        Self {
            error: error.into(),
            buffer,
        }
    }
}

/// Binding to one hardware processing stage
pub trait HardwareStage: Send + Sync {
    /// Stage name for logging
    fn name(&self) -> &str;

    fn input_count(&self) -> usize;

    fn output_count(&self) -> usize;

    /// Recommended and minimum buffer limits for `port` under its current format
    fn capabilities(&self, port: &PortId) -> Result<PortCapabilities, crate::error::HardwareError>;

    /// Commit a negotiated format to `port`
    fn commit(&self, port: &PortId, format: &PortFormat) -> Result<(), crate::error::HardwareError>;

    /// Start delivering completions for `port` to `callback`
    fn enable_port(&self, port: &PortId, callback: PortCallback) -> Result<(), crate::error::HardwareError>;

    /// Stop `port`
    ///
    /// Every buffer the stage holds for the port is handed back through the
    /// callback, though possibly after this returns.
    fn disable_port(&self, port: &PortId) -> Result<(), crate::error::HardwareError>;

    /// Hand a buffer to the stage
    fn submit(&self, port: &PortId, buffer: BufferHeader) -> Result<(), SubmitError>;

    /// Enable the stage as a whole
    fn enable(&self) -> Result<(), crate::error::HardwareError>;

    /// Disable the stage as a whole
    fn disable(&self) -> Result<(), crate::error::HardwareError>;
}
