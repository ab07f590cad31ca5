// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Node identity, the node table, and the process-wide mesh singleton.
//!
//! The table of per-peer control blocks, the handler table, and the node-id array are
//! process-wide and initialized once at bring-up, modeled here as a lazily-built
//! `OnceLock<Mesh>` plus the atomics each component already owns, rather than scattered
//! globals.

use std::net::SocketAddr;
use std::sync::OnceLock;

use log::info;

use crate::connection;
use crate::dispatch::DispatchRegistry;
use crate::error::{Error, Result};
use crate::peer::Peer;

/// This subsystem's compile-time bound is expressed as a byte on the wire
/// (`from_node:u8`), so `NodeId` never needs to be wider than `u8`.
pub type NodeId = u8;

/// Tunables that would otherwise be scattered magic numbers across every component.
#[derive(Debug, Clone)]
pub struct MeshConfig {
    pub my_id: NodeId,
    pub nodes: Vec<SocketAddr>,
    pub region_slots_per_kind: u32,
    pub receive_items_per_peer: u32,
    pub ring_chunks: usize,
    pub ring_chunk_size: usize,
    pub max_message_size: usize,
}

impl MeshConfig {
    pub const DEFAULT_PORT: u16 = 10453;
    pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 16 * 1024;

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }
}

/// The fully-connected mesh: this node's view of every peer, the dispatch registry, and
/// the static configuration the whole subsystem was brought up with.
pub struct Mesh {
    pub config: MeshConfig,
    peers: Vec<Option<Peer>>,
    pub dispatch: DispatchRegistry,
}

impl Mesh {
    /// Every peer index other than `my_id`.
    pub fn peer_ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        (0..self.config.node_count() as NodeId).filter(move |&id| id != self.config.my_id)
    }

    pub fn peer(&self, id: NodeId) -> Result<&Peer> {
        self.peers
            .get(id as usize)
            .and_then(|p| p.as_ref())
            .ok_or(Error::InvalidPeer)
    }

    pub(crate) fn from_parts(
        config: MeshConfig,
        peers: Vec<Option<Peer>>,
        dispatch: DispatchRegistry,
    ) -> Self {
        Self {
            config,
            peers,
            dispatch,
        }
    }
}

static MESH: OnceLock<Mesh> = OnceLock::new();

/// Bring the mesh up: connect to every lower-indexed peer, accept from every
/// higher-indexed one, bootstrap the sentinel key exchange, and install the result as
/// the process-wide singleton. Must be called at most once per process.
pub fn bootstrap(config: MeshConfig, dispatch: DispatchRegistry) -> Result<&'static Mesh> {
    assert!(
        (config.my_id as usize) < config.node_count(),
        "my_id out of range of the node table"
    );

    info!(
        "bringing up mesh: node {} of {}",
        config.my_id,
        config.node_count()
    );

    let peers = connection::establish_mesh(&config)?;
    crate::bootstrap::run(&config, &peers)?;
    let mesh = Mesh::from_parts(config, peers, dispatch);

    MESH.set(mesh)
        .unwrap_or_else(|_| panic!("fabric::mesh::bootstrap called more than once"));

    Ok(global())
}

/// # Panics
/// Panics if `bootstrap` has not yet completed — every client of the fabric runs after
/// mesh bring-up, so this is a programming error, not a runtime condition.
pub fn global() -> &'static Mesh {
    MESH.get().expect("fabric mesh has not been bootstrapped")
}

/// Best-effort match of this node's id to a local interface address. Returns `None` if no
/// table entry matches any local interface; callers fall back to an explicit `--node-id`.
pub fn resolve_my_id(nodes: &[SocketAddr]) -> Option<NodeId> {
    let local_addrs = nix::ifaddrs::getifaddrs().ok()?;
    let local_ips: Vec<std::net::IpAddr> = local_addrs
        .filter_map(|ifaddr| ifaddr.address)
        .filter_map(|addr| addr.as_sockaddr_in().map(|v4| std::net::IpAddr::V4(v4.ip())))
        .collect();

    nodes
        .iter()
        .position(|addr| local_ips.contains(&addr.ip()))
        .map(|idx| idx as NodeId)
}
