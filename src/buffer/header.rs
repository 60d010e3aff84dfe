//! Buffer headers exchanged between software and the hardware stage
//!
//! A [`BufferHeader`] is a move-only handle: holding it *is* custody. It can
//! sit in exactly one queue, one in-flight hardware operation or one local
//! variable at a time, and returning it to its pool consumes it.

use bytes::BytesMut;
use std::fmt;
use std::ops::{BitOr, BitOrAssign};
use std::sync::{Arc, Weak};

use crate::buffer::pool::BufferPool;
use crate::error::PoolError;
use crate::port::format::{fourcc, PortFormat};

/// Buffer flag set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct BufferFlags(u32);

impl BufferFlags {
    pub const NONE: Self = Self(0);
    pub const END_OF_STREAM: Self = Self(1 << 0);
    pub const FRAME_START: Self = Self(1 << 1);
    pub const FRAME_END: Self = Self(1 << 2);
    pub const FRAME: Self = Self(Self::FRAME_START.0 | Self::FRAME_END.0);
    pub const KEYFRAME: Self = Self(1 << 3);
    pub const DISCONTINUITY: Self = Self(1 << 4);
    pub const CONFIG: Self = Self(1 << 5);
    pub const ENCRYPTED: Self = Self(1 << 6);
    pub const CODEC_SIDE_INFO: Self = Self(1 << 7);
    pub const SNAPSHOT: Self = Self(1 << 8);
    pub const CORRUPTED: Self = Self(1 << 9);
    pub const TRANSMISSION_FAILED: Self = Self(1 << 10);

    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: Self) {
        self.0 &= !other.0;
    }
}

impl BitOr for BufferFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for BufferFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// Out-of-band event carried by a buffer instead of data
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// The stage altered its output format; the new format travels with the event
    FormatChanged(PortFormat),
    EndOfStream,
    Error(i32),
    ParameterChanged(u32),
}

impl Command {
    pub const FORMAT_CHANGED: u32 = fourcc(b"EFCH");
    pub const END_OF_STREAM: u32 = fourcc(b"EEOS");
    pub const ERROR: u32 = fourcc(b"ERRO");
    pub const PARAMETER_CHANGED: u32 = fourcc(b"EPCH");

    /// Non-zero command code identifying the event
    pub fn code(&self) -> u32 {
        match self {
            Command::FormatChanged(_) => Self::FORMAT_CHANGED,
            Command::EndOfStream => Self::END_OF_STREAM,
            Command::Error(_) => Self::ERROR,
            Command::ParameterChanged(_) => Self::PARAMETER_CHANGED,
        }
    }
}

/// Position of a buffer inside its owning pool's arena
#[derive(Clone)]
pub(crate) struct Slot {
    pub(crate) pool: Weak<BufferPool>,
    pub(crate) key: u64,
    pub(crate) index: usize,
}

/// Handle to one fixed-capacity memory block plus its metadata
pub struct BufferHeader {
    data: BytesMut,
    length: usize,
    offset: usize,
    flags: BufferFlags,
    command: Option<Command>,
    pts: Option<i64>,
    slot: Option<Slot>,
}

impl BufferHeader {
    pub(crate) fn pooled(data: BytesMut, slot: Slot) -> Self {
        Self {
            data,
            length: 0,
            offset: 0,
            flags: BufferFlags::NONE,
            command: None,
            pts: None,
            slot: Some(slot),
        }
    }

    /// Create an event buffer owned by the hardware binding rather than a pool
    pub fn event(command: Command) -> Self {
        Self {
            data: BytesMut::new(),
            length: 0,
            offset: 0,
            flags: BufferFlags::NONE,
            command: Some(command),
            pts: None,
            slot: None,
        }
    }

    /// Total memory available in this buffer
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Number of valid payload bytes
    pub fn length(&self) -> usize {
        self.length
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn flags(&self) -> BufferFlags {
        self.flags
    }

    pub fn set_flags(&mut self, flags: BufferFlags) {
        self.flags = flags;
    }

    pub fn insert_flags(&mut self, flags: BufferFlags) {
        self.flags.insert(flags);
    }

    pub fn pts(&self) -> Option<i64> {
        self.pts
    }

    pub fn set_pts(&mut self, pts: Option<i64>) {
        self.pts = pts;
    }

    pub fn command(&self) -> Option<&Command> {
        self.command.as_ref()
    }

    /// Command code; zero for data buffers
    pub fn cmd(&self) -> u32 {
        self.command.as_ref().map_or(0, Command::code)
    }

    pub fn is_event(&self) -> bool {
        self.command.is_some()
    }

    pub fn is_end_of_stream(&self) -> bool {
        self.flags.contains(BufferFlags::END_OF_STREAM)
            || matches!(self.command, Some(Command::EndOfStream))
    }

    /// Valid payload bytes
    pub fn data(&self) -> &[u8] {
        &self.data[self.offset..self.offset + self.length]
    }

    /// Whole writable region, used by producers to fill the buffer
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data[..]
    }

    /// Mark `length` bytes from the start of the buffer as valid payload
    pub fn set_length(&mut self, length: usize) {
        self.offset = 0;
        self.length = length.min(self.capacity());
    }

    /// Copy as much of `bytes` as fits and return how many were written
    pub fn write(&mut self, bytes: &[u8]) -> usize {
        let n = bytes.len().min(self.capacity());
        self.data[..n].copy_from_slice(&bytes[..n]);
        self.offset = 0;
        self.length = n;
        n
    }

    /// Structural validity check applied before a buffer is trusted
    pub fn check_state(&self) -> bool {
        let in_bounds = self
            .offset
            .checked_add(self.length)
            .is_some_and(|end| end <= self.capacity());
        in_bounds && (self.is_event() || self.slot.is_some())
    }

    /// Index of this buffer inside its pool, if it came from one
    pub fn slot_index(&self) -> Option<usize> {
        self.slot.as_ref().map(|slot| slot.index)
    }

    /// Return the buffer to the pool that owns it
    ///
    /// Event buffers and buffers whose pool has already been torn down are
    /// simply dropped.
    pub fn release(self) -> Result<(), PoolError> {
        match self.origin() {
            Some(pool) => pool.release(self),
            None => {
                if !self.is_event() && self.slot.is_some() {
                    tracing::debug!("Dropping buffer whose pool is gone");
                }
                Ok(())
            }
        }
    }

    pub(crate) fn slot(&self) -> Option<&Slot> {
        self.slot.as_ref()
    }

    /// Pool this buffer belongs to, if it is still alive
    pub(crate) fn origin(&self) -> Option<Arc<BufferPool>> {
        self.slot.as_ref().and_then(|slot| slot.pool.upgrade())
    }

    pub(crate) fn reset(&mut self) {
        self.length = 0;
        self.offset = 0;
        self.flags = BufferFlags::NONE;
        self.command = None;
        self.pts = None;
    }

    /// Second handle to the same slot; only tests may forge one
    #[cfg(test)]
    pub(crate) fn forge_duplicate(&self) -> Self {
        Self {
            data: BytesMut::zeroed(self.capacity()),
            length: 0,
            offset: 0,
            flags: BufferFlags::NONE,
            command: None,
            pts: None,
            slot: self.slot.clone(),
        }
    }
}

impl fmt::Debug for BufferHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferHeader")
            .field("slot", &self.slot_index())
            .field("capacity", &self.capacity())
            .field("length", &self.length)
            .field("offset", &self.offset)
            .field("flags", &format_args!("{:#06x}", self.flags.bits()))
            .field("cmd", &format_args!("{:#010x}", self.cmd()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags() {
        let mut flags = BufferFlags::FRAME_END | BufferFlags::KEYFRAME;
        assert!(flags.contains(BufferFlags::FRAME_END));
        assert!(!flags.contains(BufferFlags::FRAME));

        flags.insert(BufferFlags::FRAME_START);
        assert!(flags.contains(BufferFlags::FRAME));

        flags.remove(BufferFlags::KEYFRAME);
        assert!(!flags.contains(BufferFlags::KEYFRAME));
    }

    #[test]
    fn test_event_buffer() {
        let event = BufferHeader::event(Command::EndOfStream);
        assert!(event.is_event());
        assert!(event.is_end_of_stream());
        assert_eq!(event.cmd(), Command::END_OF_STREAM);
        assert!(event.check_state());
        assert!(event.release().is_ok());
    }

    #[test]
    fn test_command_codes_are_nonzero() {
        for cmd in [
            Command::FormatChanged(PortFormat::default()),
            Command::EndOfStream,
            Command::Error(-1),
            Command::ParameterChanged(7),
        ] {
            assert_ne!(cmd.code(), 0);
        }
    }
}
