// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Small-message channel: a signaled send plus a blocking wait for its own
//! completion. No reply is expected — the message is simply handed to the fabric and the
//! caller finds out once the local send has gone out.
//!
//! Outbound buffers are staged out of the peer's chunked ring allocator rather than a fresh
//! heap allocation per call: the dispatcher encodes a typed message and this channel stages
//! it, with the ring backing the buffer where one is available. The ring yields under load
//! the same way the region pool does: a bounded number of short retries before reporting
//! `PoolExhausted` to the caller.

use std::time::Duration;

use crate::error::{Error, Result};
use crate::mesh::Mesh;
use crate::peer::Peer;
use crate::wire::Header;

const RING_RETRY_ATTEMPTS: u32 = 8;
const RING_RETRY_INTERVAL: Duration = Duration::from_micros(50);

/// The largest payload `send` will carry, one `MaxMessageSize`-sized receive buffer minus
/// the header, matching the pre-posted pool on the other end.
pub fn max_payload_size(mesh: &Mesh) -> usize {
    mesh.config.max_message_size - crate::wire::HEADER_LEN
}

/// Send `payload` to `peer_id` tagged with application message type `msg_type`, and block
/// until the local send completes.
///
/// # Panics
/// Panics if `payload` exceeds `max_payload_size` (a fatal bug, not a runtime condition:
/// the caller is expected to know `MaxMessageSize` up front) or if `peer_id == my_id`
/// (rejected as `Error::InvalidPeer` instead, since a caller might reasonably compute a
/// peer id at runtime from data it does not otherwise validate).
pub fn send(mesh: &Mesh, peer_id: crate::mesh::NodeId, msg_type: u16, payload: &[u8]) -> Result<()> {
    if peer_id == mesh.config.my_id {
        return Err(Error::InvalidPeer);
    }
    assert!(
        msg_type < crate::dispatch::TYPE_MAX as u16,
        "message type {msg_type} collides with a reserved bulk/bootstrap control type"
    );
    assert!(
        payload.len() <= max_payload_size(mesh),
        "payload of {} bytes exceeds the channel's max message size",
        payload.len()
    );

    let peer = mesh.peer(peer_id)?;
    send_to_peer(peer, msg_type, payload)
}

pub(crate) fn send_to_peer(peer: &Peer, msg_type: u16, payload: &[u8]) -> Result<()> {
    if peer.conn.is_error() {
        return Err(Error::PeerUnreachable(peer.id));
    }

    let total_len = crate::wire::HEADER_LEN + payload.len();
    let header = Header::new(msg_type, peer.owner_id, total_len as u32);

    let mut block = None;
    for attempt in 0..RING_RETRY_ATTEMPTS {
        if let Some(b) = peer.ring.get(total_len) {
            block = Some(b);
            break;
        }
        if attempt + 1 < RING_RETRY_ATTEMPTS {
            std::thread::sleep(RING_RETRY_INTERVAL);
        }
    }
    let mut block = block.ok_or(Error::PoolExhausted)?;

    // SAFETY: `block` was just allocated with exactly `total_len` bytes of payload
    // capacity, and nothing else holds a reference to it until `post_send` takes
    // ownership below.
    let slice = unsafe { block.as_mut_slice() };
    header.encode((&mut slice[..crate::wire::HEADER_LEN]).try_into().unwrap());
    slice[crate::wire::HEADER_LEN..].copy_from_slice(payload);

    let tag = peer.next_tag();
    peer.send_station.register(tag);
    peer.qp.post_send(tag as u64, block);
    peer.send_station.wait(tag)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[should_panic(expected = "exceeds the channel's max message size")]
    fn oversize_payload_is_a_fatal_bug() {
        let config = crate::mesh::MeshConfig {
            my_id: 0,
            nodes: vec!["127.0.0.1:0".parse().unwrap(), "127.0.0.1:0".parse().unwrap()],
            region_slots_per_kind: 64,
            receive_items_per_peer: 4,
            ring_chunks: 2,
            ring_chunk_size: 4096,
            max_message_size: 64,
        };
        let oversize = vec![0u8; 128];
        let mesh = crate::mesh::Mesh::from_parts(config, vec![None, None], crate::dispatch::DispatchRegistry::new());
        let _ = send(&mesh, 1, 1, &oversize);
    }
}
