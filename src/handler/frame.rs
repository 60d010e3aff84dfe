//! Frame reassembly for analysis consumers
//!
//! Encoders and cameras may split one frame across several buffers. The
//! collector appends payloads until it sees `FRAME_END` (or end of stream)
//! and then hands the complete frame to a channel, so consumers such as
//! motion detection never touch pool or queue internals.

use bytes::{Bytes, BytesMut};
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::buffer::{BufferFlags, BufferHeader};
use crate::error::HandlerError;
use crate::handler::CaptureHandler;

/// One complete frame
#[derive(Debug, Clone)]
pub struct Frame {
    pub index: u64,
    pub data: Bytes,
    pub keyframe: bool,
    pub pts: Option<i64>,
}

struct Partial {
    data: BytesMut,
    keyframe: bool,
    pts: Option<i64>,
}

/// Sink that emits whole frames over a bounded channel
pub struct FrameCollector {
    partial: Mutex<Partial>,
    tx: Sender<Frame>,
    frames: AtomicU64,
    dropped: AtomicU64,
}

impl FrameCollector {
    /// Create a collector and the receiving end for its frames
    ///
    /// When the receiver falls `capacity` frames behind, new frames are
    /// dropped rather than stalling the driver.
    pub fn new(capacity: usize) -> (Self, Receiver<Frame>) {
        let (tx, rx) = bounded(capacity.max(1));
        let collector = Self {
            partial: Mutex::new(Partial {
                data: BytesMut::new(),
                keyframe: false,
                pts: None,
            }),
            tx,
            frames: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        };
        (collector, rx)
    }

    /// Frames delivered to the channel
    pub fn frame_count(&self) -> u64 {
        self.frames.load(Ordering::Relaxed)
    }

    /// Frames dropped because the consumer was too slow
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl CaptureHandler for FrameCollector {
    fn name(&self) -> &str {
        "frame-collector"
    }

    fn consume(&self, buffer: &BufferHeader) -> Result<(), HandlerError> {
        let mut partial = self.partial.lock();
        if partial.data.is_empty() {
            partial.pts = buffer.pts();
        }
        partial.data.extend_from_slice(buffer.data());
        partial.keyframe |= buffer.flags().contains(BufferFlags::KEYFRAME);

        let complete = buffer.flags().contains(BufferFlags::FRAME_END) || buffer.is_end_of_stream();
        if !complete || partial.data.is_empty() {
            return Ok(());
        }

        let frame = Frame {
            index: self.frames.load(Ordering::Relaxed),
            data: partial.data.split().freeze(),
            keyframe: std::mem::take(&mut partial.keyframe),
            pts: partial.pts.take(),
        };
        match self.tx.try_send(frame) {
            Ok(()) => {
                self.frames.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::debug!("Frame consumer is behind, dropping frame");
                Ok(())
            }
            Err(TrySendError::Disconnected(_)) => {
                Err(HandlerError::custom("frame receiver disconnected"))
            }
        }
    }
}
