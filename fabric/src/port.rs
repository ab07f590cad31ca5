// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! The per-peer queue pair: one `IoUring` instance standing in for this subsystem's
//! reference deployment target, real RDMA verbs (queue pair + completion queue).
//! `Send`/`Recv` opcodes carry real bytes over a TCP byte stream (the stand-in
//! reliable-connected fabric), and `Nop` stands in for the region pool's local
//! invalidate/register-region work requests, which have no wire-visible effect on this
//! transport — only local bookkeeping.
//!
//! Grounded directly in `rpc_protocol::server::ring`'s `Operation`/`Box::into_raw`
//! user-data pattern, generalized from "one ring for the whole listener" to "one ring per
//! connected peer," matching this subsystem's per-peer completion stream requirement.

use std::io;
use std::net::TcpStream;
use std::os::fd::AsRawFd;
use std::sync::Mutex;

use io_uring::{opcode, squeue, types, IoUring};
use log::warn;

use crate::recv_pool::ReceiveItem;
use crate::ring::Block;

/// The memory a posted send is reading from. `Ring`-backed sends stage their bytes in a
/// peer's chunked ring allocator (C1) the way the small-message channel does; other
/// callers (bulk replies, bootstrap) just hand over a heap `Vec` since they have no
/// shared ring to return the block to. Either way the buffer must outlive the send
/// completion, which is why it rides inside `Operation` rather than being dropped after
/// `post_send` returns.
pub enum SendPayload {
    Heap(Vec<u8>),
    Ring(Block),
}

impl SendPayload {
    fn as_ptr_len(&self) -> (*const u8, u32) {
        match self {
            // SAFETY: both variants point at memory this payload exclusively owns until
            // the send completes.
            Self::Heap(buf) => (buf.as_ptr(), buf.len() as u32),
            Self::Ring(block) => (block.as_ptr() as *const u8, block.len() as u32),
        }
    }
}

impl From<Vec<u8>> for SendPayload {
    fn from(buf: Vec<u8>) -> Self {
        Self::Heap(buf)
    }
}

impl From<Block> for SendPayload {
    fn from(block: Block) -> Self {
        Self::Ring(block)
    }
}

/// A completion, classified the way the completion engine requires.
pub enum RawCompletion {
    /// `payload` is handed back so a ring-backed send can be `put` back to its
    /// allocator; heap-backed sends just drop it.
    Send { tag: u64, payload: SendPayload },
    Receive { item: ReceiveItem },
    Invalidate { slot: u16 },
    Register { slot: u16 },
    /// The peer closed its end, or an opcode we don't recognize came back: the completion
    /// engine marks the connection `Error`.
    ConnectionFault,
}

enum Operation {
    Send { tag: u64, payload: SendPayload },
    Recv { item: ReceiveItem },
    Invalidate { slot: u16 },
    Register { slot: u16 },
}

impl Operation {
    /// Leak `self` and expose its provenance so the raw pointer can be reconstructed from
    /// a completion's `user_data` later.
    fn to_u64(self: Box<Self>) -> u64 {
        Box::into_raw(self).expose_provenance() as u64
    }

    /// # Safety
    /// `p` must be a value previously returned by `Operation::to_u64`, not yet consumed.
    unsafe fn from_u64(p: u64) -> Box<Self> {
        Box::from_raw(std::ptr::with_exposed_provenance::<Self>(p as usize) as *mut Self)
    }
}

pub struct QueuePair {
    ring: Mutex<IoUring>,
    stream: TcpStream,
}

impl QueuePair {
    pub fn new(stream: TcpStream, entries: u32) -> io::Result<Self> {
        stream.set_nodelay(true)?;
        Ok(Self {
            ring: Mutex::new(IoUring::new(entries)?),
            stream,
        })
    }

    fn fd(&self) -> types::Fd {
        types::Fd(self.stream.as_raw_fd())
    }

    /// Post a signaled send. `tag` is an opaque correlation id the caller chooses (for
    /// example a wait-station tag) and is echoed back in the matching `RawCompletion`.
    /// Accepts anything `SendPayload` can come from: a plain `Vec<u8>`, or a `Block`
    /// staged out of a ring allocator.
    pub fn post_send(&self, tag: u64, payload: impl Into<SendPayload>) {
        let op = Box::new(Operation::Send { tag, payload: payload.into() });
        let (ptr, len) = match op.as_ref() {
            Operation::Send { payload, .. } => payload.as_ptr_len(),
            _ => unreachable!(),
        };

        let entry = opcode::Send::new(self.fd(), ptr, len)
            .build()
            .user_data(op.to_u64());

        self.push(&entry);
    }

    /// Post a receive work request against a buffer pulled from the peer's receive pool.
    pub fn post_recv(&self, item: ReceiveItem) {
        let ptr = item.buffer.as_ptr() as *mut u8;
        let len = item.buffer.len() as u32;
        let op = Box::new(Operation::Recv { item });

        let entry = opcode::Recv::new(self.fd(), ptr, len)
            .build()
            .user_data(op.to_u64());

        self.push(&entry);
    }

    /// Post an unsignaled invalidate of `slot`. On this transport, invalidation has no
    /// wire-visible effect: it is local bookkeeping only, but it still round-trips
    /// through the completion classifier so the "local-invalidate completion -> log
    /// only" policy applies uniformly regardless of what backs the queue pair.
    pub fn post_invalidate(&self, slot: u16) {
        let op = Box::new(Operation::Invalidate { slot });
        let entry = opcode::Nop::new().build().user_data(op.to_u64());
        self.push(&entry);
    }

    /// Post an unsignaled re-registration of `slot`.
    pub fn post_register(&self, slot: u16) {
        let op = Box::new(Operation::Register { slot });
        let entry = opcode::Nop::new().build().user_data(op.to_u64());
        self.push(&entry);
    }

    fn push(&self, entry: &squeue::Entry) {
        let mut ring = self.ring.lock().unwrap();
        // SAFETY: every operation pushed here carries its associated buffer (if any)
        // alive inside the boxed `Operation` whose pointer becomes `user_data`; the
        // buffer is only freed when `drain` reconstructs and drops that box.
        unsafe {
            ring.submission()
                .push(entry)
                .expect("submission queue full");
        }
        if let Err(e) = ring.submit() {
            warn!("io_uring_enter (submit) failed: {e}");
        }
    }

    /// Drain whatever completions are currently available, without blocking the caller
    /// for longer than a short poll interval. Production RDMA verbs would block on a
    /// completion-channel fd; this transport instead polls `io_uring_enter` briefly so
    /// the same per-peer mutex is never held across an unbounded wait, keeping
    /// concurrent `post_*` calls from other threads responsive (see DESIGN.md).
    pub fn drain(&self) -> Vec<RawCompletion> {
        let mut ring = self.ring.lock().unwrap();
        if let Err(e) = ring.submit() {
            warn!("io_uring_enter (submit) failed while draining: {e}");
        }

        let mut out = Vec::new();
        for cqe in ring.completion() {
            let user_data = cqe.user_data();
            // SAFETY: user_data was produced by Operation::to_u64 for every entry we
            // ever pushed; nothing else posts to this ring.
            let op = unsafe { Operation::from_u64(user_data) };
            let result = cqe.result();

            out.push(match *op {
                Operation::Send { tag, payload } => {
                    if result < 0 {
                        RawCompletion::ConnectionFault
                    } else {
                        RawCompletion::Send { tag, payload }
                    }
                }
                Operation::Recv { mut item } => {
                    if result <= 0 {
                        RawCompletion::ConnectionFault
                    } else {
                        item.len = result as usize;
                        RawCompletion::Receive { item }
                    }
                }
                Operation::Invalidate { slot } => RawCompletion::Invalidate { slot },
                Operation::Register { slot } => RawCompletion::Register { slot },
            });
        }

        out
    }
}
