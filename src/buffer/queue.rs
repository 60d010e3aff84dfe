//! Thread-safe FIFO of buffer headers
//!
//! Used both as a pool's free list and as a port's working queue. Push and
//! pop are serialized under one lock, so order is strict FIFO no matter how
//! many threads push.

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::buffer::header::BufferHeader;

/// FIFO of buffer headers with blocking and non-blocking retrieval
pub struct BufferQueue {
    items: Mutex<VecDeque<BufferHeader>>,
    changed: Condvar,
}

impl BufferQueue {
    /// Create an empty queue
    pub fn new() -> Self {
        Self::with_capacity(0)
    }

    /// Create an empty queue with room for `capacity` headers
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity)),
            changed: Condvar::new(),
        }
    }

    /// Append a buffer to the tail
    pub fn push(&self, buffer: BufferHeader) {
        let mut items = self.items.lock();
        items.push_back(buffer);
        // Both poppers and length waiters sleep on the same condvar
        self.changed.notify_all();
    }

    /// Pop from the head without blocking
    /// Returns None if the queue is empty
    pub fn try_pop(&self) -> Option<BufferHeader> {
        self.items.lock().pop_front()
    }

    /// Pop from the head, waiting as long as it takes
    pub fn pop(&self) -> BufferHeader {
        let mut items = self.items.lock();
        loop {
            if let Some(buffer) = items.pop_front() {
                return buffer;
            }
            self.changed.wait(&mut items);
        }
    }

    /// Pop from the head, waiting at most `timeout`
    pub fn pop_timeout(&self, timeout: Duration) -> Option<BufferHeader> {
        let deadline = Instant::now() + timeout;
        let mut items = self.items.lock();
        loop {
            if let Some(buffer) = items.pop_front() {
                return Some(buffer);
            }
            if self.changed.wait_until(&mut items, deadline).timed_out() {
                return items.pop_front();
            }
        }
    }

    /// Wait until the queue holds at least `len` headers
    /// Returns false if `timeout` elapsed first
    pub fn wait_for_len(&self, len: usize, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut items = self.items.lock();
        while items.len() < len {
            match deadline {
                Some(deadline) => {
                    if self.changed.wait_until(&mut items, deadline).timed_out() {
                        return items.len() >= len;
                    }
                }
                None => self.changed.wait(&mut items),
            }
        }
        true
    }

    /// Remove every queued header, head first
    pub fn drain(&self) -> Vec<BufferHeader> {
        self.items.lock().drain(..).collect()
    }

    /// Check if queue is empty
    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    /// Get current queue length
    pub fn len(&self) -> usize {
        self.items.lock().len()
    }
}

impl Default for BufferQueue {
    fn default() -> Self {
        Self::new()
    }
}
