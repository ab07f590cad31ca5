// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! The peer control block: everything this node keeps about one remote node `j != my_id`.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Condvar, Mutex};

use crate::mesh::NodeId;
use crate::port::QueuePair;
use crate::recv_pool::ReceivePool;
use crate::region::{RegionBinding, RegionPool, RegionPort};
use crate::ring::RingAllocator;
use crate::wait::WaitStation;

/// The connection-state register, plus a wakeable waiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Idle,
    AddrResolved,
    RouteResolved,
    ConnectRequest,
    Connected,
    Error,
}

pub struct ConnRegister {
    state: Mutex<ConnState>,
    condvar: Condvar,
}

impl Default for ConnRegister {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnRegister {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ConnState::Idle),
            condvar: Condvar::new(),
        }
    }

    pub fn get(&self) -> ConnState {
        *self.state.lock().unwrap()
    }

    pub fn transition(&self, next: ConnState) {
        *self.state.lock().unwrap() = next;
        self.condvar.notify_all();
    }

    /// Block until the state is `Connected` or `Error`. Cancellation is by transitioning
    /// to `Error` and broadcasting.
    pub fn wait_connected(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        while !matches!(*state, ConnState::Connected | ConnState::Error) {
            state = self.condvar.wait(state).unwrap();
        }
        matches!(*state, ConnState::Connected)
    }

    pub fn is_error(&self) -> bool {
        matches!(self.get(), ConnState::Error)
    }
}

/// Adapts a `QueuePair` to the narrow interface `RegionPool::bind` needs, so `region.rs`
/// never has to know about `io_uring`.
pub struct PortRegionAdapter<'a>(pub &'a QueuePair);

impl RegionPort for PortRegionAdapter<'_> {
    fn post_invalidate(&self, slot: u16) {
        self.0.post_invalidate(slot);
    }

    fn post_register(&self, slot: u16, _binding: RegionBinding) {
        self.0.post_register(slot);
    }
}

pub struct Peer {
    /// The remote node this control block talks to.
    pub id: NodeId,
    /// This node's own id, stamped into every outgoing header's `from_node` field —
    /// distinct from `id`, which names the far end of the connection.
    pub owner_id: NodeId,
    pub qp: QueuePair,

    /// Pool-kind `Bulk`: rebindable regions for acknowledged reads/writes and the inline
    /// polled-write variant.
    pub bulk_pool: RegionPool,

    /// Pool-kind `LocalSentinel`: `K` one-byte sentinel slots this node owns; a peer's
    /// notify-variant polled write flips one of these bytes to signal completion without
    /// a reply message. Registered once, as a whole, under a single key — unlike
    /// `bulk_pool`, individual slots never rebind, so `local_sentinel_pool`'s bitmap is
    /// used purely to track which byte is currently claimed by an in-flight operation,
    /// never its `bind`/key machinery.
    pub local_sentinel_pool: RegionPool,
    local_sentinel_bytes: Box<[u8]>,
    sentinel_key: u32,

    /// Pool-kind `PeerSentinel` is not separately instantiated as a `RegionPool` here: it
    /// has no locally-bound slots, since slot occupancy is owned by the *initiator's* own
    /// local-sentinel pool. This field is the single learned (base address, key) pair for
    /// the peer's sentinel region, advertised once via the bootstrap key-exchange. See
    /// DESIGN.md for the full rationale.
    peer_sentinel: Mutex<Option<(u64, u32)>>,

    pub recv_pool: ReceivePool,
    /// Stages outbound small-message buffers for `channel::send`. Bulk and bootstrap
    /// traffic post heap `Vec`s directly instead, since they are either large one-off
    /// transfers or run before this peer's ring even matters.
    pub ring: RingAllocator,
    pub conn: ConnRegister,

    /// Wakes a blocked `channel::send` once its signaled send completes.
    pub send_station: WaitStation<()>,
    /// Wakes a blocked bulk-acknowledged initiator once the responder's reply arrives.
    pub reply_station: WaitStation<Vec<u8>>,

    next_tag: AtomicU32,
}

impl Peer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: NodeId,
        owner_id: NodeId,
        qp: QueuePair,
        receive_items: u32,
        max_message_size: usize,
        ring_chunks: usize,
        ring_chunk_size: usize,
    ) -> Self {
        Self {
            id,
            owner_id,
            qp,
            bulk_pool: RegionPool::new(),
            local_sentinel_pool: RegionPool::new(),
            local_sentinel_bytes: vec![0u8; crate::region::SLOTS_PER_POOL as usize].into_boxed_slice(),
            sentinel_key: 1,
            peer_sentinel: Mutex::new(None),
            recv_pool: ReceivePool::new(receive_items, max_message_size),
            ring: RingAllocator::new(ring_chunks, ring_chunk_size),
            conn: ConnRegister::new(),
            send_station: WaitStation::new(),
            reply_station: WaitStation::new(),
            next_tag: AtomicU32::new(1),
        }
    }

    pub fn next_tag(&self) -> u32 {
        self.next_tag.fetch_add(1, Ordering::Relaxed)
    }

    /// The base address and single key covering the whole local-sentinel byte array, as
    /// advertised once to the peer during the bootstrap key-exchange.
    pub fn register_local_sentinel(&self) -> (u64, u32) {
        (self.local_sentinel_bytes.as_ptr() as u64, self.sentinel_key)
    }

    pub fn sentinel_key(&self) -> u32 {
        self.sentinel_key
    }

    pub fn local_sentinel_byte_addr(&self, slot: u16) -> u64 {
        (unsafe { self.local_sentinel_bytes.as_ptr().add(slot as usize) }) as u64
    }

    /// # Safety
    /// `slot` must be `< region::SLOTS_PER_POOL`.
    pub unsafe fn read_local_sentinel(&self, slot: u16) -> u8 {
        std::ptr::read_volatile(self.local_sentinel_bytes.as_ptr().add(slot as usize))
    }

    pub fn clear_local_sentinel(&self, slot: u16) {
        // SAFETY: slot indexes within local_sentinel_bytes by construction.
        unsafe {
            std::ptr::write_volatile(
                self.local_sentinel_bytes.as_ptr().add(slot as usize) as *mut u8,
                0,
            )
        };
    }

    pub fn set_peer_sentinel(&self, addr: u64, key: u32) {
        *self.peer_sentinel.lock().unwrap() = Some((addr, key));
    }

    pub fn peer_sentinel(&self) -> Option<(u64, u32)> {
        *self.peer_sentinel.lock().unwrap()
    }

    /// Fail every outstanding waiter on this peer and mark the connection `Error`. Used
    /// when a fabric fault is observed (connection loss mid-operation).
    pub fn fault(&self) {
        self.conn.transition(ConnState::Error);
        self.send_station.fail_all(|| crate::error::Error::PeerUnreachable(self.id));
        self.reply_station
            .fail_all(|| crate::error::Error::PeerUnreachable(self.id));
    }
}
