//! Buffer subsystem: headers, queues and pools

pub mod header;
pub mod pool;
pub mod queue;

pub use header::{BufferFlags, BufferHeader, Command};
pub use pool::{BufferPool, PoolStats, SlotState};
pub use queue::BufferQueue;
