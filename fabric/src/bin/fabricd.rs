// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

use std::fs;
use std::net::SocketAddr;

use clap::Parser;
use log::info;

use fabric::dispatch::DispatchRegistry;
use fabric::mesh::{self, MeshConfig};

#[derive(Parser)]
struct Cli {
    /// This node's index into the node table. Auto-detected from local interface
    /// addresses if omitted.
    #[arg(long)]
    node_id: Option<u8>,

    /// Path to a file of `id,ipv4:port` lines describing the mesh, or a comma-separated
    /// inline list of `ipv4:port` (index order is node id order).
    #[arg(long)]
    nodes: String,

    #[arg(long, default_value_t = MeshConfig::DEFAULT_PORT)]
    port: u16,

    #[arg(long, default_value_t = 64)]
    region_slots: u32,

    #[arg(long, default_value_t = 128)]
    receive_items: u32,

    #[arg(long, default_value_t = 4096)]
    chunk_size: usize,

    #[arg(long, default_value_t = 8)]
    chunks: usize,

    /// Overrides `RUST_LOG` for this process (e.g. `debug`, `fabric=trace`).
    #[arg(long)]
    log_level: Option<String>,
}

fn main() {
    let args = Cli::parse();
    match &args.log_level {
        Some(level) => env_logger::Builder::new().parse_filters(level).init(),
        None => env_logger::init(),
    }

    let nodes = parse_nodes(&args.nodes, args.port);
    let my_id = args
        .node_id
        .unwrap_or_else(|| mesh::resolve_my_id(&nodes).expect("pass --node-id: could not auto-detect this node's id from local interfaces"));

    let config = MeshConfig {
        my_id,
        nodes,
        region_slots_per_kind: args.region_slots,
        receive_items_per_peer: args.receive_items,
        ring_chunks: args.chunks,
        ring_chunk_size: args.chunk_size,
        max_message_size: MeshConfig::DEFAULT_MAX_MESSAGE_SIZE,
    };

    info!("fabricd starting as node {} of {}", config.my_id, config.node_count());

    let dispatch = DispatchRegistry::new();
    let mesh = mesh::bootstrap(config, dispatch).expect("mesh bring-up failed");

    let handles = fabric::completion::spawn_all(mesh);
    info!("mesh is up, {} completion threads running", handles.len());

    for handle in handles {
        handle.join().expect("a completion-engine thread panicked");
    }
}

/// Accepts either a path to a file of `id,ipv4:port` lines, or (for quick manual runs) a
/// bare comma-separated list of `ipv4:port` entries in node-id order.
fn parse_nodes(spec: &str, default_port: u16) -> Vec<SocketAddr> {
    let text = fs::read_to_string(spec).unwrap_or_else(|_| spec.to_string());

    let mut entries: Vec<(usize, SocketAddr)> = Vec::new();
    for (line_no, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let (id, addr_str) = match line.split_once(',') {
            Some((id, addr)) => (
                id.trim().parse().expect("node table line has a non-numeric id"),
                addr.trim(),
            ),
            None => (line_no, line),
        };

        let addr = resolve_addr(addr_str, default_port);
        entries.push((id, addr));
    }

    entries.sort_by_key(|(id, _)| *id);
    entries.into_iter().map(|(_, addr)| addr).collect()
}

fn resolve_addr(addr_str: &str, default_port: u16) -> SocketAddr {
    if let Ok(addr) = addr_str.parse() {
        return addr;
    }
    format!("{addr_str}:{default_port}")
        .parse()
        .unwrap_or_else(|e| panic!("invalid node address '{addr_str}': {e}"))
}
