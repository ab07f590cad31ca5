// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Key-exchange bootstrap: once a peer's connection reaches `Connected`,
//! each side posts its local-sentinel region's base address and key to the other, so the
//! notify variant of a polled write has somewhere to land. Runs synchronously, before any
//! completion-engine thread exists for the peer, with the same deterministic
//! lower-id-first ordering `connection::establish_mesh` already uses to avoid a two-node
//! send/send deadlock.

use std::time::Duration;

use log::info;

use crate::mesh::{MeshConfig, NodeId};
use crate::peer::Peer;
use crate::port::RawCompletion;

const POLL_INTERVAL: Duration = Duration::from_micros(200);
const PAYLOAD_LEN: usize = 12; // addr:u64 + key:u32

/// Exchange sentinel bindings with every connected peer. Must run after
/// `connection::establish_mesh` and before `completion::spawn_all`.
pub fn run(config: &MeshConfig, peers: &[Option<Peer>]) -> crate::error::Result<()> {
    for peer_id in 0..config.node_count() as NodeId {
        if peer_id == config.my_id {
            continue;
        }
        let peer = peers[peer_id as usize]
            .as_ref()
            .expect("bootstrap runs after every peer has connected");

        if config.my_id < peer_id {
            send_binding(peer)?;
            recv_binding(peer)?;
        } else {
            recv_binding(peer)?;
            send_binding(peer)?;
        }

        info!("sentinel key exchange with node {peer_id} complete");
    }
    Ok(())
}

fn send_binding(peer: &Peer) -> crate::error::Result<()> {
    let (addr, key) = peer.register_local_sentinel();
    let mut buf = [0u8; PAYLOAD_LEN];
    buf[0..8].copy_from_slice(&addr.to_ne_bytes());
    buf[8..12].copy_from_slice(&key.to_ne_bytes());

    let tag = peer.next_tag();
    peer.qp.post_send(tag as u64, buf.to_vec());
    busy_wait_send(peer, tag)
}

fn recv_binding(peer: &Peer) -> crate::error::Result<()> {
    let buf = busy_wait_recv(peer, PAYLOAD_LEN)?;
    let addr = u64::from_ne_bytes(buf[0..8].try_into().unwrap());
    let key = u32::from_ne_bytes(buf[8..12].try_into().unwrap());
    peer.set_peer_sentinel(addr, key);
    Ok(())
}

/// Busy-poll the peer's completion queue for the specific send tag we are waiting on.
/// Bootstrap predates the peer's completion-engine thread, so it drains the ring itself
/// instead of relying on `Peer::send_station` being serviced by anyone else.
fn busy_wait_send(peer: &Peer, tag: u32) -> crate::error::Result<()> {
    loop {
        for completion in peer.qp.drain() {
            if let RawCompletion::Send { tag: completed, .. } = completion {
                if completed as u32 == tag {
                    return Ok(());
                }
            }
        }
        std::thread::sleep(POLL_INTERVAL);
    }
}

fn busy_wait_recv(peer: &Peer, len: usize) -> crate::error::Result<Vec<u8>> {
    let item = peer
        .recv_pool
        .take(len)
        .expect("bootstrap is the first consumer of the receive pool");
    peer.qp.post_recv(item);

    loop {
        for completion in peer.qp.drain() {
            if let RawCompletion::Receive { item: received } = completion {
                let bytes = received.buffer[..received.len].to_vec();
                peer.recv_pool.recycle(received);
                return Ok(bytes);
            }
        }
        std::thread::sleep(POLL_INTERVAL);
    }
}
