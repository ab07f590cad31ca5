// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Completion engine: one draining loop per peer, classifying each completion and
//! routing it to the small-message dispatcher, the bulk engine, or a waiting caller.
//! Dispatch runs synchronously on the draining thread, the "low-latency" variant; see
//! DESIGN.md for the tradeoff against a worker-pool handoff.

use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{error, trace};

use crate::bulk;
use crate::mesh::{Mesh, NodeId};
use crate::peer::{ConnState, Peer};
use crate::port::RawCompletion;
use crate::wire::Header;

/// How long a drain loop sleeps between empty polls of its peer's completion queue. Real
/// RDMA verbs would block on a completion-channel fd instead; see `port::QueuePair::drain`
/// for why this transport polls instead.
const IDLE_POLL_INTERVAL: Duration = Duration::from_micros(200);

/// Spawn one drain thread per peer and return their handles (owned by the caller, usually
/// `fabricd`, so the process can join them at shutdown).
pub fn spawn_all(mesh: &'static Mesh) -> Vec<JoinHandle<()>> {
    mesh.peer_ids()
        .map(|id| {
            thread::Builder::new()
                .name(format!("fabric-cq-{id}"))
                .spawn(move || run_peer_loop(mesh, id))
                .expect("failed to spawn completion-engine thread")
        })
        .collect()
}

fn run_peer_loop(mesh: &'static Mesh, peer_id: NodeId) {
    let peer = mesh.peer(peer_id).expect("peer_ids() only yields connected peers");
    replenish_recv_pool(peer);

    loop {
        if peer.conn.is_error() {
            trace!("completion loop for node {peer_id} exiting: connection in Error state");
            return;
        }

        let completions = peer.qp.drain();
        if completions.is_empty() {
            thread::sleep(IDLE_POLL_INTERVAL);
            continue;
        }

        for completion in completions {
            handle_completion(mesh, peer, completion);
        }
    }
}

fn handle_completion(mesh: &'static Mesh, peer: &'static Peer, completion: RawCompletion) {
    match completion {
        RawCompletion::Send { tag, payload } => {
            if let crate::port::SendPayload::Ring(block) = payload {
                peer.ring.put(block);
            }
            peer.send_station.fulfil(tag as u32, ());
        }
        RawCompletion::Invalidate { slot } => {
            trace!("local invalidate completed for node {} slot {slot}", peer.id);
        }
        RawCompletion::Register { slot } => {
            trace!("local register completed for node {} slot {slot}", peer.id);
        }
        RawCompletion::ConnectionFault => {
            error!("fabric fault on connection to node {}", peer.id);
            peer.fault();
        }
        RawCompletion::Receive { item } => {
            let header = Header::decode(&item.buffer[..item.len]);
            // A completion's claimed origin must match the peer control block whose ring
            // produced it: each peer has its own ring, so this can only be violated by a
            // header-construction bug, never by legitimate peer behavior.
            assert_eq!(
                header.from_node, peer.id,
                "completion from node {} claimed to be from node {}",
                peer.id, header.from_node
            );

            if header.is_rdma {
                if header.rdma_ack {
                    if header.msg_type == bulk::MSG_TYPE_BULK_REPLY {
                        bulk::handle_reply(&item, peer);
                        peer.recv_pool.recycle(item);
                    } else {
                        bulk::handle_ack_request(peer.id, &header, &item, peer);
                        peer.recv_pool.recycle(item);
                    }
                } else {
                    bulk::handle_unacked_write(peer.id, &header, &item, peer);
                    peer.recv_pool.recycle(item);
                }
            } else {
                mesh.dispatch.dispatch(peer.id, &header, item, &peer.recv_pool);
            }

            replenish_recv_pool(peer);
        }
    }
}

/// Keep the peer's receive pool topped up: pull every currently-available buffer back out
/// and post it as a fresh receive work request, so exactly `R` buffers are always either
/// posted to the fabric or in a handler's hands.
fn replenish_recv_pool(peer: &Peer) {
    while let Some(item) = peer.recv_pool.take(0) {
        peer.qp.post_recv(item);
    }
}

/// # Panics
/// Panics if the connection never reached `Connected` — callers must not start the
/// completion loop until `connection::establish_mesh` has returned.
pub fn assert_connected(peer: &Peer) {
    assert!(
        matches!(peer.conn.get(), ConnState::Connected),
        "completion engine started for node {} before its connection was established",
        peer.id
    );
}
