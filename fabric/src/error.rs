// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

use std::fmt;

use crate::mesh::NodeId;

/// Errors surfaced to clients of the fabric.
///
/// Invariant violations (bad message type, header magic, region double-bind, size
/// overflow) are not represented here: they are fatal bugs and cause a `panic!` at the
/// point of detection, matching how `rpc_protocol` treats protocol decode bugs.
#[derive(Debug)]
pub enum Error {
    /// The peer's connection has entered the `Error` state; any subsequent operation on
    /// it fails fast.
    PeerUnreachable(NodeId),

    /// A pool (region slots, receive items, ring allocator) was exhausted. This is
    /// always transient: the caller is expected to yield and retry.
    PoolExhausted,

    /// An operation targeted `peer == my_id`.
    InvalidPeer,

    /// An I/O failure from the underlying transport.
    Io(std::io::Error),
}

impl std::error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::PeerUnreachable(id) => write!(f, "peer {id} is unreachable"),
            Self::PoolExhausted => write!(f, "pool exhausted"),
            Self::InvalidPeer => write!(f, "invalid peer (self-send is unsupported)"),
            Self::Io(e) => write!(f, "I/O error: {e}"),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
