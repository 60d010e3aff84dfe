//! Mid-stream output format renegotiation
//!
//! ```text
//!   Flowing ──FormatChanged──▶ Draining ──pool full──▶ Reallocating ──▶ Flowing
//! ```
//!
//! Runs synchronously on the driver thread. The driver submits nothing to
//! the port until it returns.

use std::fmt;
use std::time::Duration;

use crate::buffer::{BufferHeader, PoolStats};
use crate::error::Result;
use crate::hardware::PortCapabilities;
use crate::port::{Port, PortFormat};

/// Phase of a format change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormatChangeState {
    Flowing,
    Draining,
    Reallocating,
}

impl fmt::Display for FormatChangeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FormatChangeState::Flowing => write!(f, "flowing"),
            FormatChangeState::Draining => write!(f, "draining"),
            FormatChangeState::Reallocating => write!(f, "reallocating"),
        }
    }
}

/// What a completed format change did
#[derive(Debug, Clone)]
pub struct FormatChangeOutcome {
    pub old_format: PortFormat,
    pub new_format: PortFormat,
    /// Buffers released from the working queue while draining
    pub drained: usize,
    /// Old pool, taken once every buffer was home
    pub before: PoolStats,
    /// Freshly built pool
    pub after: PoolStats,
}

/// Apply a format-changed `event` received on `port`
///
/// Disables the port, releases the event, and waits until every buffer of
/// the old pool is back. The old pool is then destroyed, `format` committed,
/// and a new pool built from the buffer limits the hardware reports for the
/// new format. Finally the port is re-enabled; refilling it is left to the
/// caller.
pub fn handle(
    port: &Port,
    event: BufferHeader,
    format: PortFormat,
    drain_timeout: Option<Duration>,
) -> Result<FormatChangeOutcome> {
    let old_format = port.format();
    tracing::info!("Received format changed event on {}", port.name());
    tracing::info!("-- Format changed from --\n{}", describe(port, &old_format, None));
    tracing::info!("-- To --\n{}", describe(port, &format, None));

    transition(port, FormatChangeState::Draining);
    port.stop()?;
    if let Err(e) = event.release() {
        tracing::warn!("Failed to release format change event: {}", e);
    }
    let drained = port.drain(drain_timeout)?;
    let before = port.pool_stats().unwrap_or_default();

    transition(port, FormatChangeState::Reallocating);
    port.destroy_pool()?;
    let caps = port.commit(format)?;
    let after = port.create_pool(caps.buffer_num(), caps.buffer_size())?;
    let new_format = port.format();
    tracing::info!("{}", describe(port, &new_format, Some(&caps)));

    port.enable()?;
    transition(port, FormatChangeState::Flowing);

    Ok(FormatChangeOutcome {
        old_format,
        new_format,
        drained,
        before,
        after,
    })
}

fn transition(port: &Port, state: FormatChangeState) {
    tracing::debug!("{} format change: {}", port.name(), state);
}

fn describe(port: &Port, format: &PortFormat, caps: Option<&PortCapabilities>) -> String {
    let mut out = format!(
        "Port type: {}\nFourCC: {}\nWidth: {}\nHeight: {}\nCrop: {}, {}, {}, {}\nFrame rate: {}, {}",
        port.kind(),
        format.encoding,
        format.resolution.width,
        format.resolution.height,
        format.crop.x,
        format.crop.y,
        format.crop.width,
        format.crop.height,
        format.framerate.num,
        format.framerate.den
    );
    if let Some(caps) = caps {
        out.push_str(&format!(
            "\nBuffers num: {} (opt {}, min {}). Size: {} (opt {}, min {})",
            format.buffer_num,
            caps.buffer_num_recommended,
            caps.buffer_num_min,
            format.buffer_size,
            caps.buffer_size_recommended,
            caps.buffer_size_min
        ));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::Command;
    use crate::port::tests::HeldStage;
    use crate::port::{CallbackRegistry, Encoding, PortConfig, PortId, Resolution};
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_drains_then_rebuilds_from_new_limits() {
        let stage = HeldStage::new(PortCapabilities::new(3, 1024));
        let port = Port::new("decoder", PortId::output(0), stage.clone(), Arc::new(CallbackRegistry::new()));
        port.configure(&PortConfig::new(Encoding::I420).with_resolution(32, 16)).unwrap();
        port.enable().unwrap();
        port.send_all_free().unwrap();
        assert_eq!(port.pool_stats().unwrap().in_flight, 3);

        // Hardware reports new limits and returns its buffers late
        *stage.caps.lock() = PortCapabilities::new(5, 4096);
        let held = stage.take();
        let callback = port.callback();
        let returner = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            for buffer in held {
                callback.complete(buffer);
            }
        });

        let new_format = PortFormat::new(Encoding::I420, Resolution::new(64, 32));
        let event = BufferHeader::event(Command::FormatChanged(new_format.clone()));
        let outcome = handle(&port, event, new_format, None).unwrap();
        returner.join().unwrap();

        assert_eq!(outcome.drained, 3);
        assert_eq!(outcome.before.free, outcome.before.buffer_num);
        assert_eq!(outcome.before.buffer_num, 3);
        assert_eq!((outcome.after.buffer_num, outcome.after.buffer_size), (5, 4096));
        assert_eq!(outcome.new_format.resolution, Resolution::new(64, 32));
        assert!(port.is_enabled());
        assert_eq!(port.send_all_free().unwrap(), 5);
    }

    #[test]
    fn test_drain_timeout_aborts() {
        let stage = HeldStage::new(PortCapabilities::new(2, 512));
        let port = Port::new("decoder", PortId::output(0), stage.clone(), Arc::new(CallbackRegistry::new()));
        port.configure(&PortConfig::new(Encoding::I420).with_resolution(32, 16)).unwrap();
        port.enable().unwrap();
        port.send_all_free().unwrap();

        let event = BufferHeader::event(Command::FormatChanged(PortFormat::default()));
        let err = handle(&port, event, PortFormat::default(), Some(Duration::from_millis(20))).unwrap_err();
        assert!(matches!(
            err,
            crate::error::Error::Pipeline(crate::error::PipelineError::DrainTimeout { outstanding: 2, .. })
        ));
        assert!(!port.is_enabled());
    }
}
