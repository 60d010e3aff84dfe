//! # MMAL Pipeline
//!
//! Buffer-pool, port and callback driven streaming engine for hardware media
//! pipelines (camera capture, encode, decode).
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────────────┐
//! │                         DRIVER THREAD (pipeline::driver)                   │
//! │                                                                           │
//! │   Capture Handler                                       Capture Handler   │
//! │   (producer: fill)                                       (sink: consume)  │
//! │         │                                                      ▲          │
//! │         ▼                                                      │          │
//! │  ┌─────────────┐  acquire   ┌────────────────────────────┐  pop │          │
//! │  │ Input Pool  │──────────▶ │ Priming → AwaitingSignal → │◀─────┤          │
//! │  │ (free queue)│            │ DrainingOutput → (loop)    │      │          │
//! │  └─────────────┘            └─────────────┬──────────────┘  ┌───┴───────┐  │
//! │         ▲                                 │ send            │ Working   │  │
//! │         │ release                         │                 │ Queue     │  │
//! └─────────┼─────────────────────────────────┼─────────────────┴───▲───────┴──┘
//!           │                                 ▼                     │ push
//! ┌─────────┼─────────────────────────────────────────────────────────┼────────┐
//! │         │            HARDWARE STAGE (hardware::HardwareStage)      │        │
//! │  ┌──────┴──────┐      ┌──────────────────────────┐      ┌─────────┴─────┐  │
//! │  │ Input port  │────▶ │   accelerator / worker   │────▶ │  Output port  │  │
//! │  │ callback    │      │   (own threads)          │      │  callback     │  │
//! │  └─────────────┘      └──────────────────────────┘      └───────────────┘  │
//! │        sets input trigger                           sets output trigger   │
//! └───────────────────────────────────────────────────────────────────────────┘
//!
//!   Connection: output callback ──submit──▶ downstream input (zero copy)
//!               downstream input callback ──release──▶ upstream output pool
//! ```
//!
//! A buffer is always in exactly one place: a pool's free queue, the
//! hardware, a working queue, or a local variable on the driver thread.

pub mod buffer;
pub mod component;
pub mod config;
pub mod error;
pub mod handler;
pub mod hardware;
pub mod pipeline;
pub mod port;

pub use error::{Error, Result};

/// Engine-wide constants
pub mod constants {
    /// Width alignment applied to configured resolutions
    pub const WIDTH_ALIGN: u32 = 32;

    /// Height alignment applied to configured resolutions
    pub const HEIGHT_ALIGN: u32 = 16;

    /// Upper bound on memory one pool may allocate
    pub const MAX_POOL_BYTES: usize = 1 << 30;

    /// Default longest wait for a trigger before rechecking cancellation
    pub const DEFAULT_WAKE_INTERVAL_MS: u64 = 100;

    /// Poll slice used while draining a port
    pub const DRAIN_SLICE_MS: u64 = 10;

    /// Drain cap used when tearing down after a failure
    pub const TEARDOWN_DRAIN_MS: u64 = 1000;
}
