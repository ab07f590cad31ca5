// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Connection manager: brings the N-way mesh up deterministically so no
//! two nodes race to open the same edge from both ends. For peers `(i, j)`, `min(i, j)`
//! connects and `max(i, j)` accepts — grounded in `rpcbind`'s own "well-known port, one
//! listener, many short-lived clients" shape, generalized to a fixed mesh of persistent
//! edges instead of one-shot RPC calls.

use std::net::{TcpListener, TcpStream};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use log::{info, warn};

use crate::error::Result;
use crate::mesh::{MeshConfig, NodeId};
use crate::peer::{ConnState, Peer};
use crate::port::QueuePair;

const CONNECT_RETRY_INTERVAL: Duration = Duration::from_millis(100);
const CONNECT_RETRY_ATTEMPTS: u32 = 200;
const QUEUE_ENTRIES: u32 = 256;

/// Connect to every peer with a smaller id, accept from every peer with a larger one, and
/// return a `peers[id]` table the same shape as `config.nodes` (`None` at `my_id`).
pub fn establish_mesh(config: &MeshConfig) -> Result<Vec<Option<Peer>>> {
    let my_id = config.my_id;
    let node_count = config.node_count();

    let accept_count = my_id as usize;
    let listener = TcpListener::bind(("0.0.0.0", config.nodes[my_id as usize].port()))?;
    info!("node {my_id} listening on {}", listener.local_addr()?);

    let (accepted_tx, accepted_rx) = mpsc::channel::<(NodeId, TcpStream)>();
    let accept_handle = if accept_count > 0 {
        Some(thread::spawn(move || {
            accept_loop(listener, accept_count, accepted_tx)
        }))
    } else {
        None
    };

    let mut streams: Vec<Option<TcpStream>> = (0..node_count).map(|_| None).collect();

    for peer_id in (my_id as usize + 1)..node_count {
        let addr = config.nodes[peer_id];
        let stream = connect_with_retry(addr)?;
        announce_self(&stream, my_id)?;
        streams[peer_id] = Some(stream);
    }

    if let Some(handle) = accept_handle {
        for _ in 0..accept_count {
            let (peer_id, stream) = accepted_rx
                .recv()
                .expect("accept thread exited before delivering every expected connection");
            streams[peer_id as usize] = Some(stream);
        }
        handle
            .join()
            .expect("mesh accept thread panicked during bring-up");
    }

    let mut peers = Vec::with_capacity(node_count);
    for (peer_id, stream) in streams.into_iter().enumerate() {
        let peer_id = peer_id as NodeId;
        if peer_id == my_id {
            peers.push(None);
            continue;
        }

        let stream = stream.expect("every non-self peer index has a stream by construction");
        let qp = QueuePair::new(stream, QUEUE_ENTRIES)?;
        let peer = Peer::new(
            peer_id,
            my_id,
            qp,
            config.receive_items_per_peer,
            config.max_message_size,
            config.ring_chunks,
            config.ring_chunk_size,
        );

        // The static address table already resolved the peer's address and the connect
        // (or accept) above already established the route: walk the remaining states in
        // sequence so `ConnRegister` always reflects the full connection state machine rather
        // than jumping straight to `Connected`.
        peer.conn.transition(ConnState::AddrResolved);
        peer.conn.transition(ConnState::RouteResolved);
        peer.conn.transition(ConnState::ConnectRequest);
        peer.conn.transition(ConnState::Connected);

        info!("mesh edge to node {peer_id} is up");
        peers.push(Some(peer));
    }

    Ok(peers)
}

fn accept_loop(listener: TcpListener, expected: usize, tx: mpsc::Sender<(NodeId, TcpStream)>) {
    let mut remaining = expected;
    while remaining > 0 {
        match listener.accept() {
            Ok((stream, addr)) => match read_announced_id(&stream) {
                Ok(peer_id) => {
                    if tx.send((peer_id, stream)).is_err() {
                        return;
                    }
                    remaining -= 1;
                }
                Err(e) => warn!("dropping connection from {addr}: {e}"),
            },
            Err(e) => warn!("mesh accept failed: {e}"),
        }
    }
}

fn connect_with_retry(addr: std::net::SocketAddr) -> Result<TcpStream> {
    let mut last_err = None;
    for attempt in 0..CONNECT_RETRY_ATTEMPTS {
        match TcpStream::connect(addr) {
            Ok(stream) => return Ok(stream),
            Err(e) => {
                if attempt == 0 {
                    info!("waiting for {addr} to accept connections");
                }
                last_err = Some(e);
                thread::sleep(CONNECT_RETRY_INTERVAL);
            }
        }
    }
    Err(last_err.expect("loop runs at least once").into())
}

/// A connecting node identifies itself with a single byte, since the acceptor's listener
/// fans in connections from every lower-indexed peer and must match each one back to a
/// node id.
fn announce_self(stream: &TcpStream, my_id: NodeId) -> Result<()> {
    use std::io::Write;
    (&*stream).write_all(&[my_id])?;
    Ok(())
}

fn read_announced_id(stream: &TcpStream) -> Result<NodeId> {
    use std::io::Read;
    let mut buf = [0u8; 1];
    (&*stream).read_exact(&mut buf)?;
    Ok(buf[0])
}
