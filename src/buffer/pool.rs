//! Fixed-size buffer pools
//!
//! A pool pre-allocates `buffer_num` buffers of `buffer_size` bytes and keeps
//! the idle ones on a [`BufferQueue`] free list. Every slot also carries a
//! custody state in the pool's arena, and each custody transfer (acquire,
//! submit, complete, release) is checked against it. Handles minted before a
//! resize or destroy carry an old pool key and are rejected as stale.

use bytes::BytesMut;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use crate::buffer::header::{BufferHeader, Slot};
use crate::buffer::queue::BufferQueue;
use crate::constants::MAX_POOL_BYTES;
use crate::error::PoolError;

static NEXT_POOL_KEY: AtomicU64 = AtomicU64::new(1);

/// Who holds a buffer right now
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// On the free list
    Free,
    /// Taken by the driver, not yet submitted
    Acquired,
    /// Owned by the hardware stage
    InFlight,
    /// Returned by the hardware, waiting in a working queue or being dispatched
    Completed,
}

/// Snapshot of a pool's custody counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolStats {
    pub buffer_num: usize,
    pub buffer_size: usize,
    pub free: usize,
    pub acquired: usize,
    pub in_flight: usize,
    pub completed: usize,
}

impl PoolStats {
    /// Buffers not on the free list
    pub fn outstanding(&self) -> usize {
        self.acquired + self.in_flight + self.completed
    }

    /// Every buffer is accounted for exactly once
    pub fn is_conserved(&self) -> bool {
        self.free + self.outstanding() == self.buffer_num
    }
}

struct Arena {
    key: u64,
    buffer_size: usize,
    slots: Vec<SlotState>,
}

impl Arena {
    fn count(&self, state: SlotState) -> usize {
        self.slots.iter().filter(|s| **s == state).count()
    }
}

/// Fixed collection of buffers backed by a free queue
pub struct BufferPool {
    name: String,
    free: BufferQueue,
    arena: Mutex<Arena>,
    this: Weak<BufferPool>,
}

impl BufferPool {
    /// Allocate a pool of `buffer_num` buffers of `buffer_size` bytes
    pub fn new(
        name: impl Into<String>,
        buffer_num: usize,
        buffer_size: usize,
    ) -> Result<Arc<Self>, PoolError> {
        let name = name.into();
        let memory = allocate(buffer_num, buffer_size)?;
        let key = NEXT_POOL_KEY.fetch_add(1, Ordering::Relaxed);

        let pool = Arc::new_cyclic(|this: &Weak<BufferPool>| {
            let free = BufferQueue::with_capacity(buffer_num);
            for (index, data) in memory.into_iter().enumerate() {
                free.push(BufferHeader::pooled(data, slot(this, key, index)));
            }
            BufferPool {
                name,
                free,
                arena: Mutex::new(Arena {
                    key,
                    buffer_size,
                    slots: vec![SlotState::Free; buffer_num],
                }),
                this: this.clone(),
            }
        });

        tracing::debug!(
            "Created pool for {}: {} buffers of {} bytes",
            pool.name,
            buffer_num,
            buffer_size
        );
        Ok(pool)
    }

    /// Take a free buffer without blocking
    ///
    /// Returns None when every buffer is outstanding; this is backpressure,
    /// not an error.
    pub fn acquire(&self) -> Option<BufferHeader> {
        let mut arena = self.arena.lock();
        loop {
            let buffer = self.free.try_pop()?;
            match self.index_in(&arena, &buffer) {
                Some(index) if arena.slots[index] == SlotState::Free => {
                    arena.slots[index] = SlotState::Acquired;
                    return Some(buffer);
                }
                slot => {
                    // Free list and arena disagree; never hand this header out
                    tracing::error!(
                        "Discarding header {:?} from free list of {} (slot state {:?})",
                        buffer.slot_index(),
                        self.name,
                        slot.map(|index| arena.slots[index])
                    );
                }
            }
        }
    }

    /// Return a buffer to the free list
    ///
    /// Releasing a buffer that is already free, owned by the hardware, or not
    /// from this pool is a protocol violation and is rejected.
    pub fn release(&self, mut buffer: BufferHeader) -> Result<(), PoolError> {
        let mut arena = self.arena.lock();
        let index = self.owned_index(&arena, &buffer)?;
        match arena.slots[index] {
            SlotState::Acquired | SlotState::Completed => {
                arena.slots[index] = SlotState::Free;
            }
            SlotState::Free => return Err(PoolError::NotOutstanding(index)),
            SlotState::InFlight => return Err(PoolError::InFlight(index)),
        }
        buffer.reset();
        // Pushed under the arena lock so a resize cannot slip in between
        self.free.push(buffer);
        Ok(())
    }

    /// Record that a freshly acquired `buffer` is being handed to the hardware
    ///
    /// A buffer the hardware has already returned must be released and
    /// acquired again first.
    pub fn mark_in_flight(&self, buffer: &BufferHeader) -> Result<(), PoolError> {
        let mut arena = self.arena.lock();
        let index = self.owned_index(&arena, buffer)?;
        match arena.slots[index] {
            SlotState::Acquired => {
                arena.slots[index] = SlotState::InFlight;
                Ok(())
            }
            SlotState::Completed => Err(PoolError::NotAcquired(index)),
            SlotState::InFlight => Err(PoolError::InFlight(index)),
            SlotState::Free => Err(PoolError::NotOutstanding(index)),
        }
    }

    /// Record that a completed `buffer` is passed straight on to another
    /// stage through a connection, without going back to the free list
    pub fn mark_forwarded(&self, buffer: &BufferHeader) -> Result<(), PoolError> {
        let mut arena = self.arena.lock();
        let index = self.owned_index(&arena, buffer)?;
        match arena.slots[index] {
            SlotState::Completed => {
                arena.slots[index] = SlotState::InFlight;
                Ok(())
            }
            SlotState::Acquired => Err(PoolError::NotCompleted(index)),
            SlotState::InFlight => Err(PoolError::InFlight(index)),
            SlotState::Free => Err(PoolError::NotOutstanding(index)),
        }
    }

    /// Record that the hardware has handed `buffer` back
    pub fn mark_completed(&self, buffer: &BufferHeader) -> Result<(), PoolError> {
        let mut arena = self.arena.lock();
        let index = self.owned_index(&arena, buffer)?;
        match arena.slots[index] {
            SlotState::InFlight => {
                arena.slots[index] = SlotState::Completed;
                Ok(())
            }
            _ => Err(PoolError::NotInFlight(index)),
        }
    }

    /// Replace every buffer with `buffer_num` new ones of `buffer_size` bytes
    ///
    /// Only valid while no buffer is outstanding. Handles from before the
    /// resize become stale.
    pub fn resize(&self, buffer_num: usize, buffer_size: usize) -> Result<(), PoolError> {
        let mut arena = self.arena.lock();
        let outstanding = arena.slots.len() - arena.count(SlotState::Free);
        if outstanding > 0 {
            return Err(PoolError::Outstanding(outstanding));
        }
        let memory = allocate(buffer_num, buffer_size)?;
        let key = NEXT_POOL_KEY.fetch_add(1, Ordering::Relaxed);

        drop(self.free.drain());
        for (index, data) in memory.into_iter().enumerate() {
            self.free.push(BufferHeader::pooled(data, slot(&self.this, key, index)));
        }
        *arena = Arena {
            key,
            buffer_size,
            slots: vec![SlotState::Free; buffer_num],
        };

        tracing::info!(
            "Resized pool for {}: {} buffers of {} bytes",
            self.name,
            buffer_num,
            buffer_size
        );
        Ok(())
    }

    /// Free all buffer memory
    ///
    /// Fails if any buffer is still outstanding; the pool is left intact in
    /// that case.
    pub fn destroy(&self) -> Result<(), PoolError> {
        let mut arena = self.arena.lock();
        let outstanding = arena.slots.len() - arena.count(SlotState::Free);
        if outstanding > 0 {
            return Err(PoolError::Outstanding(outstanding));
        }
        drop(self.free.drain());
        arena.slots.clear();
        arena.key = NEXT_POOL_KEY.fetch_add(1, Ordering::Relaxed);
        tracing::debug!("Destroyed pool for {}", self.name);
        Ok(())
    }

    /// Wait until every buffer is back on the free list
    pub fn wait_until_full(&self, timeout: Option<Duration>) -> bool {
        self.free.wait_for_len(self.buffer_num(), timeout)
    }

    /// Custody counters; always sum to `buffer_num`
    pub fn stats(&self) -> PoolStats {
        let arena = self.arena.lock();
        PoolStats {
            buffer_num: arena.slots.len(),
            buffer_size: arena.buffer_size,
            free: arena.count(SlotState::Free),
            acquired: arena.count(SlotState::Acquired),
            in_flight: arena.count(SlotState::InFlight),
            completed: arena.count(SlotState::Completed),
        }
    }

    /// Custody state of one slot
    pub fn slot_state(&self, index: usize) -> Option<SlotState> {
        self.arena.lock().slots.get(index).copied()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn buffer_num(&self) -> usize {
        self.arena.lock().slots.len()
    }

    pub fn buffer_size(&self) -> usize {
        self.arena.lock().buffer_size
    }

    /// Length of the free queue
    pub fn free_len(&self) -> usize {
        self.free.len()
    }

    /// Every buffer is sitting on the free queue
    pub fn is_full(&self) -> bool {
        self.free_len() == self.buffer_num()
    }

    fn index_in(&self, arena: &Arena, buffer: &BufferHeader) -> Option<usize> {
        buffer
            .slot()
            .filter(|slot| slot.key == arena.key && slot.index < arena.slots.len())
            .map(|slot| slot.index)
    }

    fn owned_index(&self, arena: &Arena, buffer: &BufferHeader) -> Result<usize, PoolError> {
        let slot = buffer.slot().ok_or(PoolError::ForeignBuffer)?;
        if !Weak::ptr_eq(&slot.pool, &self.this) {
            return Err(PoolError::ForeignBuffer);
        }
        self.index_in(arena, buffer).ok_or(PoolError::StaleBuffer)
    }
}

fn slot(pool: &Weak<BufferPool>, key: u64, index: usize) -> Slot {
    Slot {
        pool: pool.clone(),
        key,
        index,
    }
}

fn allocate(buffer_num: usize, buffer_size: usize) -> Result<Vec<BytesMut>, PoolError> {
    if buffer_num == 0 || buffer_size == 0 {
        return Err(PoolError::InvalidDimensions {
            num: buffer_num,
            size: buffer_size,
        });
    }
    let total = buffer_num
        .checked_mul(buffer_size)
        .filter(|total| *total <= MAX_POOL_BYTES)
        .ok_or(PoolError::AllocationFailed(buffer_num.saturating_mul(buffer_size)))?;
    tracing::trace!("Allocating {} bytes of buffer memory", total);

    Ok((0..buffer_num).map(|_| BytesMut::zeroed(buffer_size)).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_acquire_until_exhausted() {
        let pool = BufferPool::new("test", 4, 64).unwrap();

        let held: Vec<_> = (0..4).map(|_| pool.acquire().unwrap()).collect();
        assert!(pool.acquire().is_none());
        assert_eq!(pool.stats().acquired, 4);
        assert!(pool.stats().is_conserved());

        let mut held = held.into_iter();
        let first = held.next().unwrap();
        let index = first.slot_index().unwrap();
        pool.release(first).unwrap();

        let again = pool.acquire().unwrap();
        assert_eq!(again.slot_index(), Some(index));
        assert!(pool.acquire().is_none());
    }

    #[test]
    fn test_custody_transitions() {
        let pool = BufferPool::new("test", 2, 16).unwrap();
        let buffer = pool.acquire().unwrap();
        let index = buffer.slot_index().unwrap();

        pool.mark_in_flight(&buffer).unwrap();
        assert_eq!(pool.slot_state(index), Some(SlotState::InFlight));
        assert_eq!(pool.mark_in_flight(&buffer), Err(PoolError::InFlight(index)));

        pool.mark_completed(&buffer).unwrap();
        assert_eq!(pool.mark_completed(&buffer), Err(PoolError::NotInFlight(index)));

        pool.release(buffer).unwrap();
        assert_eq!(pool.slot_state(index), Some(SlotState::Free));
        assert!(pool.is_full());
    }

    #[test]
    fn test_completed_buffer_cannot_be_resubmitted() {
        let pool = BufferPool::new("test", 2, 16).unwrap();
        let buffer = pool.acquire().unwrap();
        let index = buffer.slot_index().unwrap();
        pool.mark_in_flight(&buffer).unwrap();
        pool.mark_completed(&buffer).unwrap();

        let err = pool.mark_in_flight(&buffer).unwrap_err();
        assert_eq!(err, PoolError::NotAcquired(index));
        assert!(err.is_protocol_violation());
        assert_eq!(pool.slot_state(index), Some(SlotState::Completed));

        pool.release(buffer).unwrap();
        let again = pool.acquire().unwrap();
        pool.mark_in_flight(&again).unwrap();
    }

    #[test]
    fn test_forward_only_from_completed() {
        let pool = BufferPool::new("test", 1, 16).unwrap();
        let buffer = pool.acquire().unwrap();
        assert_eq!(pool.mark_forwarded(&buffer), Err(PoolError::NotCompleted(0)));

        pool.mark_in_flight(&buffer).unwrap();
        assert_eq!(pool.mark_forwarded(&buffer), Err(PoolError::InFlight(0)));

        pool.mark_completed(&buffer).unwrap();
        pool.mark_forwarded(&buffer).unwrap();
        assert_eq!(pool.slot_state(0), Some(SlotState::InFlight));
    }

    #[test]
    fn test_acquire_skips_header_the_arena_does_not_list_as_free() {
        let pool = BufferPool::new("test", 2, 16).unwrap();
        let buffer = pool.acquire().unwrap();
        // A second header for an outstanding slot lands on the free list
        pool.free.push(buffer.forge_duplicate());

        let other = pool.acquire().unwrap();
        assert_ne!(other.slot_index(), buffer.slot_index());
        assert!(pool.acquire().is_none());
        assert_eq!(pool.free_len(), 0);

        let stats = pool.stats();
        assert_eq!(stats.acquired, 2);
        assert!(stats.is_conserved());
    }

    #[test]
    fn test_concurrent_release_and_resize_keep_free_list_consistent() {
        let pool = BufferPool::new("test", 4, 16).unwrap();
        for round in 0..200 {
            let held: Vec<_> = std::iter::from_fn(|| pool.acquire()).collect();
            let releaser = {
                let pool = pool.clone();
                std::thread::spawn(move || {
                    for buffer in held {
                        pool.release(buffer).unwrap();
                    }
                })
            };
            // Resize succeeds only once everything is home, never in between
            while pool.resize(4, 16 + round % 3).is_err() {
                std::thread::yield_now();
            }
            releaser.join().unwrap();

            assert_eq!(pool.free_len(), 4);
            let fresh: Vec<_> = std::iter::from_fn(|| pool.acquire()).collect();
            assert_eq!(fresh.len(), 4);
            for buffer in fresh {
                pool.release(buffer).unwrap();
            }
        }
    }

    #[test]
    fn test_release_in_flight_rejected() {
        let pool = BufferPool::new("test", 1, 16).unwrap();
        let buffer = pool.acquire().unwrap();
        pool.mark_in_flight(&buffer).unwrap();

        let forged = buffer.forge_duplicate();
        assert_eq!(pool.release(forged), Err(PoolError::InFlight(0)));
    }

    #[test]
    fn test_double_release_rejected() {
        let pool = BufferPool::new("test", 2, 16).unwrap();
        let buffer = pool.acquire().unwrap();
        let forged = buffer.forge_duplicate();

        pool.release(buffer).unwrap();
        let err = pool.release(forged).unwrap_err();
        assert_eq!(err, PoolError::NotOutstanding(0));
        assert!(err.is_protocol_violation());
        assert_eq!(pool.free_len(), 2);
    }

    #[test]
    fn test_release_to_foreign_pool_rejected() {
        let a = BufferPool::new("a", 1, 16).unwrap();
        let b = BufferPool::new("b", 1, 16).unwrap();
        let buffer = a.acquire().unwrap();
        assert_eq!(b.release(buffer.forge_duplicate()), Err(PoolError::ForeignBuffer));
        a.release(buffer).unwrap();
    }

    #[test]
    fn test_header_release_routes_to_origin() {
        let pool = BufferPool::new("test", 3, 16).unwrap();
        let buffer = pool.acquire().unwrap();
        buffer.release().unwrap();
        assert!(pool.is_full());
    }

    #[test]
    fn test_resize_requires_all_free() {
        let pool = BufferPool::new("test", 2, 16).unwrap();
        let buffer = pool.acquire().unwrap();
        let forged = buffer.forge_duplicate();
        assert_eq!(pool.resize(4, 32), Err(PoolError::Outstanding(1)));

        pool.release(buffer).unwrap();
        pool.resize(4, 32).unwrap();

        let stats = pool.stats();
        assert_eq!(stats.buffer_num, 4);
        assert_eq!(stats.buffer_size, 32);
        assert_eq!(pool.free_len(), 4);
        assert_eq!(pool.acquire().unwrap().capacity(), 32);

        // Handles minted before the resize are stale
        assert_eq!(pool.release(forged), Err(PoolError::StaleBuffer));
    }

    #[test]
    fn test_destroy_with_outstanding_fails() {
        let pool = BufferPool::new("test", 2, 16).unwrap();
        let buffer = pool.acquire().unwrap();
        assert_eq!(pool.destroy(), Err(PoolError::Outstanding(1)));
        pool.release(buffer).unwrap();
        pool.destroy().unwrap();
        assert_eq!(pool.buffer_num(), 0);
    }

    #[test]
    fn test_invalid_dimensions() {
        assert!(matches!(
            BufferPool::new("test", 0, 16),
            Err(PoolError::InvalidDimensions { .. })
        ));
        assert!(matches!(
            BufferPool::new("test", 2, MAX_POOL_BYTES),
            Err(PoolError::AllocationFailed(_))
        ));
    }

    #[derive(Debug, Clone)]
    enum Op {
        Acquire,
        Submit(usize),
        Complete(usize),
        Release(usize),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            Just(Op::Acquire),
            (0usize..8).prop_map(Op::Submit),
            (0usize..8).prop_map(Op::Complete),
            (0usize..8).prop_map(Op::Release),
        ]
    }

    proptest! {
        #[test]
        fn prop_conservation(num in 1usize..8, ops in proptest::collection::vec(op(), 0..64)) {
            let pool = BufferPool::new("prop", num, 8).unwrap();
            let mut acquired: Vec<BufferHeader> = Vec::new();
            let mut in_flight: Vec<BufferHeader> = Vec::new();
            let mut completed: Vec<BufferHeader> = Vec::new();

            for op in ops {
                match op {
                    Op::Acquire => {
                        let got = pool.acquire();
                        prop_assert_eq!(got.is_some(), pool.stats().acquired > acquired.len());
                        acquired.extend(got);
                    }
                    Op::Submit(i) if !acquired.is_empty() => {
                        let buffer = acquired.remove(i % acquired.len());
                        pool.mark_in_flight(&buffer).unwrap();
                        in_flight.push(buffer);
                    }
                    Op::Complete(i) if !in_flight.is_empty() => {
                        let buffer = in_flight.remove(i % in_flight.len());
                        pool.mark_completed(&buffer).unwrap();
                        completed.push(buffer);
                    }
                    Op::Release(i) if !completed.is_empty() => {
                        pool.release(completed.remove(i % completed.len())).unwrap();
                    }
                    _ => {}
                }

                let stats = pool.stats();
                prop_assert!(stats.is_conserved());
                prop_assert_eq!(stats.acquired, acquired.len());
                prop_assert_eq!(stats.in_flight, in_flight.len());
                prop_assert_eq!(stats.completed, completed.len());
                prop_assert_eq!(stats.free, pool.free_len());
            }
        }
    }
}
