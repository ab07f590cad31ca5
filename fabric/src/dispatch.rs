// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Dispatch / handler registry: a fixed-size table of handler functions
//! keyed by message type, and the owner of the reclaim policy for delivered buffers.
//!
//! Registration is one-shot at initialization; double-registration is a fatal bug, the
//! same treatment `rpc_protocol`'s `ProcedureMap` gives a duplicate procedure number.

use crate::mesh::NodeId;
use crate::recv_pool::ReceiveItem;
use crate::wire::Header;

/// What a handler tells the dispatcher to do with the buffer it was handed.
pub enum ReclaimPolicy {
    /// The buffer came from the peer's pre-posted pool and the handler is done with it:
    /// re-post it to the fabric.
    Recycle,
    /// The buffer was a local allocation (self-message, reply-path construction), or a
    /// poll-mode bulk transfer still holds a pointer inside it: drop it without
    /// re-posting.
    Free,
}

pub type Handler = fn(from: NodeId, header: &Header, payload: &[u8]) -> ReclaimPolicy;

/// The number of distinct message types this build supports. Message headers whose
/// `type` falls outside `[0, TYPE_MAX)` are a completion-engine fatal bug.
pub const TYPE_MAX: usize = 256;

pub struct DispatchRegistry {
    handlers: [Option<Handler>; TYPE_MAX],
}

impl Default for DispatchRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl DispatchRegistry {
    pub fn new() -> Self {
        Self {
            handlers: [None; TYPE_MAX],
        }
    }

    /// # Panics
    /// Panics on double-registration of the same message type — a fatal bug, not a
    /// recoverable condition.
    pub fn register(&mut self, msg_type: u16, handler: Handler) {
        let slot = &mut self.handlers[msg_type as usize];
        assert!(
            slot.is_none(),
            "message type {msg_type} already has a registered handler"
        );
        *slot = Some(handler);
    }

    /// Look up the handler for a completion's message type, dispatch to it, and apply
    /// its reclaim policy to the buffer.
    ///
    /// # Panics
    /// Panics if no handler is registered for `header.msg_type`.
    pub fn dispatch(&self, from: NodeId, header: &Header, item: ReceiveItem, pool: &crate::recv_pool::ReceivePool) {
        let handler = self.handlers[header.msg_type as usize].unwrap_or_else(|| {
            panic!(
                "no handler registered for message type {} (from node {from})",
                header.msg_type
            )
        });

        let policy = handler(from, header, &item.buffer[..item.len]);
        match policy {
            ReclaimPolicy::Recycle => pool.recycle(item),
            ReclaimPolicy::Free => pool.release(item),
        }
    }

    pub fn has_handler(&self, msg_type: u16) -> bool {
        self.handlers[msg_type as usize].is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop_handler(_from: NodeId, _header: &Header, _payload: &[u8]) -> ReclaimPolicy {
        ReclaimPolicy::Recycle
    }

    #[test]
    fn registers_and_finds_handler() {
        let mut registry = DispatchRegistry::new();
        registry.register(7, noop_handler);
        assert!(registry.has_handler(7));
        assert!(!registry.has_handler(8));
    }

    #[test]
    #[should_panic(expected = "already has a registered handler")]
    fn double_registration_is_fatal() {
        let mut registry = DispatchRegistry::new();
        registry.register(7, noop_handler);
        registry.register(7, noop_handler);
    }
}
