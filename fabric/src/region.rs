// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Memory-region pool: per-peer, per-pool-kind bitmap of `K` registered
//! I/O region slots. `K` is fixed at 64 so the bitmap is a single `u64`.
//!
//! Contract: the same slot must never be bound concurrently, and a caller must never post
//! an operation referencing a slot that has already been released — `acquire`/`release`
//! are the only way to observe or change a slot's Free/Bound state.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use log::{debug, trace};

use crate::error::{Error, Result};

pub const SLOTS_PER_POOL: u32 = 64;

/// The three pool-kinds: a generic bulk-transfer region, and the two sentinel regions
/// used by polled-mode writes (one holding this node's own sentinel bytes, one mirroring
/// the peer's).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PoolKind {
    Bulk,
    LocalSentinel,
    PeerSentinel,
}

pub const POOL_KINDS: [PoolKind; 3] = [PoolKind::Bulk, PoolKind::LocalSentinel, PoolKind::PeerSentinel];

/// A bound region: where it points and the key a remote access must present.
#[derive(Debug, Clone, Copy)]
pub struct RegionBinding {
    pub dma_addr: u64,
    pub length: u32,
    pub key: u32,
}

/// Ops a region pool needs from the peer's queue pair to carry out a bind. Kept as a
/// trait so `region.rs` does not need to know about `io_uring` or TCP.
pub trait RegionPort {
    /// Post an (unsignaled) invalidate of a previously bound slot.
    fn post_invalidate(&self, slot: u16);
    /// Post an (unsignaled) re-registration of a slot against a fresh binding.
    fn post_register(&self, slot: u16, binding: RegionBinding);
}

struct SlotBookkeeping {
    binding: RegionBinding,
    /// Set once `post_invalidate`+`post_register` have both been posted for this
    /// binding, before the slot is handed back to a caller.
    invalidate_posted: bool,
}

/// A single `(peer, kind)` pool: `SLOTS_PER_POOL` slots tracked by one bitmap word.
pub struct RegionPool {
    bitmap: AtomicU64,
    next_key: AtomicU32,
    slots: [spin::Mutex<Option<SlotBookkeeping>>; SLOTS_PER_POOL as usize],
}

impl Default for RegionPool {
    fn default() -> Self {
        Self::new()
    }
}

impl RegionPool {
    pub fn new() -> Self {
        Self {
            bitmap: AtomicU64::new(0),
            next_key: AtomicU32::new(1),
            slots: std::array::from_fn(|_| spin::Mutex::new(None)),
        }
    }

    /// Number of currently Bound slots (the bitmap's population count).
    pub fn bound_count(&self) -> u32 {
        self.bitmap.load(Ordering::Acquire).count_ones()
    }

    /// Scan for a clear bit and claim it; retries with a short yield for up to
    /// `max_attempts` iterations before reporting `PoolExhausted`, a transient condition
    /// the caller is expected to retry.
    pub fn acquire(&self, max_attempts: u32) -> Result<u16> {
        for attempt in 0..max_attempts.max(1) {
            let mut bitmap = self.bitmap.load(Ordering::Acquire);
            loop {
                // SLOTS_PER_POOL is fixed at 64, so every bit of the word is a real slot.
                let free = !bitmap;
                if free == 0 {
                    break;
                }
                let slot = free.trailing_zeros();
                let new_bitmap = bitmap | (1u64 << slot);
                match self.bitmap.compare_exchange_weak(
                    bitmap,
                    new_bitmap,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => {
                        trace!("region slot {slot} acquired");
                        return Ok(slot as u16);
                    }
                    Err(observed) => {
                        bitmap = observed;
                        continue;
                    }
                }
            }

            if attempt + 1 < max_attempts {
                std::thread::yield_now();
                std::thread::sleep(Duration::from_micros(50));
            }
        }

        Err(Error::PoolExhausted)
    }

    /// Rebind `slot` to a fresh virtual range with a fresh key, posting
    /// `invalidate -> register` as an unsignaled chain so the slot is remote-reachable by
    /// the time a subsequent signaled work-request completes.
    pub fn bind(&self, slot: u16, dma_addr: u64, length: u32, port: &impl RegionPort) -> u32 {
        debug_assert!(self.is_bound(slot), "bind called on a slot that was not acquired");

        let key = self.next_key.fetch_add(1, Ordering::Relaxed);
        let binding = RegionBinding { dma_addr, length, key };

        port.post_invalidate(slot);
        port.post_register(slot, binding);

        let mut bookkeeping = self.slots[slot as usize].lock();
        *bookkeeping = Some(SlotBookkeeping {
            binding,
            invalidate_posted: true,
        });

        key
    }

    pub fn binding(&self, slot: u16) -> RegionBinding {
        self.slots[slot as usize]
            .lock()
            .as_ref()
            .expect("binding() called on an unbound slot")
            .binding
    }

    fn is_bound(&self, slot: u16) -> bool {
        self.bitmap.load(Ordering::Acquire) & (1u64 << slot) != 0
    }

    /// Clears the bit and asserts it was previously set.
    pub fn release(&self, slot: u16) {
        let mut bookkeeping = self.slots[slot as usize].lock();
        let had_binding = bookkeeping.take();
        drop(bookkeeping);
        assert!(
            had_binding.map(|b| b.invalidate_posted).unwrap_or(false),
            "release of a slot with no completed bind"
        );

        let mask = !(1u64 << slot);
        let prev = self.bitmap.fetch_and(mask, Ordering::AcqRel);
        assert!(prev & !mask != 0, "release() called on a slot that was already Free");
        trace!("region slot {slot} released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullPort;
    impl RegionPort for NullPort {
        fn post_invalidate(&self, _slot: u16) {}
        fn post_register(&self, _slot: u16, _binding: RegionBinding) {}
    }

    #[test]
    fn acquire_bind_release_round_trip() {
        let pool = RegionPool::new();
        let slot = pool.acquire(1).unwrap();
        assert_eq!(pool.bound_count(), 1);

        let key = pool.bind(slot, 0x1000, 4096, &NullPort);
        assert_eq!(pool.binding(slot).key, key);

        pool.release(slot);
        assert_eq!(pool.bound_count(), 0);
    }

    #[test]
    fn exhaustion_after_64_acquires() {
        let pool = RegionPool::new();
        let mut slots = Vec::new();
        for _ in 0..SLOTS_PER_POOL {
            slots.push(pool.acquire(1).unwrap());
        }
        assert!(pool.acquire(1).is_err());
        assert_eq!(pool.bound_count(), SLOTS_PER_POOL);

        for slot in slots {
            pool.release(slot);
        }
        assert_eq!(pool.bound_count(), 0);
    }

    #[test]
    fn rebind_uses_a_fresh_key_each_time() {
        let pool = RegionPool::new();
        let slot = pool.acquire(1).unwrap();
        let key_a = pool.bind(slot, 0x1000, 4096, &NullPort);
        pool.release(slot);

        let slot = pool.acquire(1).unwrap();
        let key_b = pool.bind(slot, 0x2000, 4096, &NullPort);
        assert_ne!(key_a, key_b);
    }
}
