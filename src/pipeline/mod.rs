//! Pipeline execution: the driver loop and the protocols it runs
//!
//! - [`Driver`]: primes input, waits for completions, dispatches output
//! - [`format_change`]: drain and reallocate an output whose format changed
//! - [`CancelToken`]: cooperative cancellation, including timed captures

pub mod cancel;
pub mod driver;
pub mod format_change;

pub use cancel::CancelToken;
pub use driver::{Driver, DriverReport, DriverState, Termination};
pub use format_change::{FormatChangeOutcome, FormatChangeState};
