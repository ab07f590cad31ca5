// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Receive work-item pool: `R` pre-allocated, maximum-message-size buffers per peer. A
//! buffer is always in exactly one of two states — posted (sitting in this pool,
//! available to the next arriving message) or held (handed to a dispatch handler) — so
//! `posted_count() + held_count() == R` always.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};

use spin::Mutex;

/// A receive buffer, either pulled from a peer's pre-posted pool or forged locally (for
/// example a self-addressed message that never touched the wire). Only pool-origin items
/// may be recycled back to the fabric.
pub struct ReceiveItem {
    origin: Origin,
    pub buffer: Box<[u8]>,
    pub len: usize,
}

enum Origin {
    Pool,
    Forged,
}

pub struct ReceivePool {
    max_message_size: usize,
    capacity: u32,
    available: Mutex<VecDeque<Box<[u8]>>>,
    held: AtomicU32,
}

impl ReceivePool {
    pub fn new(capacity: u32, max_message_size: usize) -> Self {
        let mut available = VecDeque::with_capacity(capacity as usize);
        for _ in 0..capacity {
            available.push_back(vec![0u8; max_message_size].into_boxed_slice());
        }

        Self {
            max_message_size,
            capacity,
            available: Mutex::new(available),
            held: AtomicU32::new(0),
        }
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn posted_count(&self) -> u32 {
        self.available.lock().len() as u32
    }

    pub fn held_count(&self) -> u32 {
        self.held.load(Ordering::Acquire)
    }

    /// Take a posted buffer off the pool for an arriving message. Returns `None` if the
    /// pool is momentarily drained (all R buffers held by handlers) — this should not
    /// happen in steady state since handlers are expected to return items quickly.
    pub fn take(&self, len: usize) -> Option<ReceiveItem> {
        let buffer = self.available.lock().pop_front()?;
        self.held.fetch_add(1, Ordering::AcqRel);
        Some(ReceiveItem {
            origin: Origin::Pool,
            buffer,
            len,
        })
    }

    /// A buffer the dispatcher synthesized locally (not backed by this pool).
    pub fn forge(&self, len: usize) -> ReceiveItem {
        ReceiveItem {
            origin: Origin::Forged,
            buffer: vec![0u8; self.max_message_size].into_boxed_slice(),
            len,
        }
    }

    /// Hand the buffer back to the fabric once its consumer is done with it.
    ///
    /// # Panics
    /// Panics if `item` was forged rather than taken from this pool — the dispatch
    /// registry's free policy must call `release` instead for forged buffers.
    pub fn recycle(&self, item: ReceiveItem) {
        match item.origin {
            Origin::Pool => {
                self.available.lock().push_back(item.buffer);
                self.held.fetch_sub(1, Ordering::AcqRel);
            }
            Origin::Forged => panic!("attempted to recycle a forged receive item"),
        }
    }

    /// Release a buffer the consumer is done with, without returning it to the fabric
    /// (either it was forged, or a poll-mode bulk read is still holding a pointer inside
    /// the buffer and the caller has decided the item will never see the wire again).
    pub fn release(&self, item: ReceiveItem) {
        if matches!(item.origin, Origin::Pool) {
            self.held.fetch_sub(1, Ordering::AcqRel);
        }
        drop(item);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn posted_plus_held_is_always_r() {
        let pool = ReceivePool::new(8, 256);
        assert_eq!(pool.posted_count() + pool.held_count(), 8);

        let item = pool.take(10).unwrap();
        assert_eq!(pool.posted_count() + pool.held_count(), 8);
        assert_eq!(pool.held_count(), 1);

        pool.recycle(item);
        assert_eq!(pool.held_count(), 0);
        assert_eq!(pool.posted_count(), 8);
    }

    #[test]
    fn exhaustion_reports_none_without_losing_buffers() {
        let pool = ReceivePool::new(2, 64);
        let a = pool.take(1).unwrap();
        let b = pool.take(1).unwrap();
        assert!(pool.take(1).is_none());

        pool.recycle(a);
        pool.recycle(b);
        assert_eq!(pool.posted_count(), 2);
    }

    #[test]
    fn forged_items_are_released_not_recycled() {
        let pool = ReceivePool::new(1, 64);
        let forged = pool.forge(10);
        assert_eq!(pool.held_count(), 0);
        pool.release(forged);
        assert_eq!(pool.posted_count(), 1);
    }
}
