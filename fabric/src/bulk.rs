// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Bulk transfer engine: one-sided read/write over a remote region the
//! caller already knows the address and key of (how the two sides learned that address is
//! outside this subsystem's scope, same as real RDMA applications exchange it over their
//! own control channel — `channel::send` is one natural way to do that exchange, but
//! `bulk` itself only performs the transfer).
//!
//! On this transport, "one-sided" is realized by the *responder* performing the memory
//! copy into or out of the region it itself owns and registered — the initiator never
//! touches that memory directly, preserving one-sided semantics as observed from the
//! API even though the transport underneath is two-sided.
//! Acknowledged operations round-trip a reply through `Peer::reply_station`; polled
//! operations do not, and the reader side either inspects the payload itself (inline
//! variant) or polls a dedicated sentinel byte (notify variant).

use log::{error, trace};

use crate::mesh::NodeId;
use crate::peer::Peer;
use crate::recv_pool::ReceiveItem;
use crate::wire::{Header, RdmaHeader, HEADER_LEN, RDMA_SUBHEADER_LEN};

/// Reserved message types living above `dispatch::TYPE_MAX` so they can never collide
/// with an application-registered handler.
pub const MSG_TYPE_BULK_READ_REQUEST: u16 = 0xFFF0;
pub const MSG_TYPE_BULK_WRITE_REQUEST: u16 = 0xFFF1;
pub const MSG_TYPE_BULK_REPLY: u16 = 0xFFF2;
pub const MSG_TYPE_POLLED_WRITE: u16 = 0xFFF3;
pub const MSG_TYPE_SENTINEL_NOTIFY: u16 = 0xFFF4;
pub const MSG_TYPE_POLLED_WRITE_INLINE: u16 = 0xFFF5;

/// Inline-variant framing overhead: 4-byte little-endian length + 1-byte head flag + a
/// matching 1-byte tail flag, so a reader can tell a still-landing write from a complete
/// one without a separate sentinel.
pub const INLINE_FRAME_OVERHEAD: usize = 6;
const INLINE_DATA_FLAG: u8 = 0x01;

/// Build the self-describing `[len:u32le][flag:u8][payload][flag:u8]` frame the responder
/// writes into the initiator's buffer for a polled inline write.
fn build_inline_frame(payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(payload.len() + INLINE_FRAME_OVERHEAD);
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.push(INLINE_DATA_FLAG);
    frame.extend_from_slice(payload);
    frame.push(INLINE_DATA_FLAG);
    frame
}

/// Reader-side helper: given a buffer a polled inline write targeted, decode the frame if
/// both the head and tail flags are set (the payload has fully landed). `capacity` is the
/// caller's destination buffer length, used to bound the length read from the frame's own
/// header against a corrupt or still-landing write.
pub fn poll_inline(buf: &[u8], capacity: usize) -> Option<&[u8]> {
    if buf.len() < INLINE_FRAME_OVERHEAD {
        return None;
    }
    let len = u32::from_le_bytes(buf[0..4].try_into().unwrap()) as usize;
    if buf[4] != INLINE_DATA_FLAG || len > capacity || len + INLINE_FRAME_OVERHEAD > buf.len() {
        return None;
    }
    let tail_offset = 5 + len;
    if buf[tail_offset] != INLINE_DATA_FLAG {
        return None;
    }
    Some(&buf[5..tail_offset])
}

/// Where a caller's remote region lives: the address and key a peer previously advertised
/// (via `advertise_region`/`advertise_sentinel`, forwarded over whatever channel the
/// caller's application protocol uses), plus the region-pool slot it occupies so the
/// responder can cross-check the key against its own bookkeeping.
#[derive(Debug, Clone, Copy)]
pub struct RemoteRegion {
    pub addr: u64,
    pub key: u32,
    pub slot: u16,
}

/// Register a local buffer in this peer's bulk pool and return the `(address, key, slot)`
/// triple a remote initiator needs to target it with a one-sided read or write.
pub fn advertise_region(peer: &Peer, buf: &mut [u8]) -> crate::error::Result<RemoteRegion> {
    let port = crate::peer::PortRegionAdapter(&peer.qp);
    let slot = peer.bulk_pool.acquire(8)?;
    let addr = buf.as_mut_ptr() as u64;
    let key = peer.bulk_pool.bind(slot, addr, buf.len() as u32, &port);
    Ok(RemoteRegion { addr, key, slot })
}

pub fn release_region(peer: &Peer, remote: RemoteRegion) {
    peer.bulk_pool.release(remote.slot);
}

/// Acknowledged one-sided read: the responder copies `dest.len()` bytes starting at
/// `remote.addr` out of its own memory and replies with them.
pub fn read(peer: &Peer, remote: RemoteRegion, dest: &mut [u8]) -> crate::error::Result<()> {
    if peer.conn.is_error() {
        return Err(crate::error::Error::PeerUnreachable(peer.id));
    }

    let port = crate::peer::PortRegionAdapter(&peer.qp);
    let local_slot = peer.bulk_pool.acquire(8)?;
    peer.bulk_pool.bind(local_slot, dest.as_ptr() as u64, dest.len() as u32, &port);

    let tag = peer.next_tag();
    peer.reply_station.register(tag);

    let mut buf = vec![0u8; HEADER_LEN + RDMA_SUBHEADER_LEN];
    let header = Header {
        is_rdma: true,
        rdma_ack: true,
        is_write: false,
        ..Header::new(MSG_TYPE_BULK_READ_REQUEST, peer.owner_id, buf.len() as u32)
    };
    header.encode((&mut buf[..HEADER_LEN]).try_into().unwrap());

    let rdma = RdmaHeader {
        peer_addr: remote.addr,
        peer_key: remote.key,
        transfer_size: dest.len() as u32,
        reply_type: 0,
        region_slot: remote.slot,
        rendezvous_tag: tag,
        local_dma_addr: dest.as_ptr() as u64,
    };
    rdma.encode((&mut buf[HEADER_LEN..]).try_into().unwrap());

    peer.qp.post_send(tag as u64, buf);

    let payload = peer.reply_station.wait(tag)?;
    peer.bulk_pool.release(local_slot);

    let n = payload.len().min(dest.len());
    dest[..n].copy_from_slice(&payload[..n]);
    Ok(())
}

/// Acknowledged one-sided write: `src` is copied into the responder's memory at
/// `remote.addr`, and the initiator blocks until the responder has confirmed the copy
/// landed.
pub fn write(peer: &Peer, remote: RemoteRegion, src: &[u8]) -> crate::error::Result<()> {
    let tag = post_write(peer, remote, src, true, MSG_TYPE_BULK_WRITE_REQUEST)?;
    peer.reply_station.wait(tag)?;
    Ok(())
}

/// Polled one-sided write, inline variant: the initiator returns once the local send
/// completes (`Issued -> LocalDone`); the responder then writes a self-describing
/// `[len][flag][payload][flag]` frame (`build_inline_frame`) into the caller's buffer, and
/// the reader recovers the payload with `poll_inline` once both flags are observed set —
/// no reply message and no separate sentinel write are needed. `remote`'s buffer must have
/// at least `src.len() + INLINE_FRAME_OVERHEAD` bytes of room: the transfer size for this
/// variant is capped at `MaxMessageSize - INLINE_FRAME_OVERHEAD`.
pub fn write_polled_inline(peer: &Peer, remote: RemoteRegion, src: &[u8]) -> crate::error::Result<()> {
    let tag = post_write(peer, remote, src, false, MSG_TYPE_POLLED_WRITE_INLINE)?;
    // No reply is ever posted for the unacknowledged path: LocalDone is the local send's
    // own completion, which `channel`'s send_station already races to fulfil. We only
    // need to observe that completion here, not the (nonexistent) peer reply.
    peer.send_station.wait(tag)?;
    Ok(())
}

/// Polled one-sided write, notify variant: after the payload lands, a second, separate
/// one-byte write flips the peer's dedicated sentinel slot so the reader can detect
/// completion by polling `Peer::read_local_sentinel` instead of inspecting the payload.
pub fn write_polled_notify(peer: &Peer, remote: RemoteRegion, src: &[u8], sentinel_slot: u16) -> crate::error::Result<()> {
    let tag = post_write(peer, remote, src, false, MSG_TYPE_POLLED_WRITE)?;
    peer.send_station.wait(tag)?;

    let (sentinel_addr, sentinel_key) = peer
        .peer_sentinel()
        .expect("write_polled_notify called before the bootstrap key-exchange completed");

    let mut buf = vec![0u8; HEADER_LEN + RDMA_SUBHEADER_LEN + 1];
    let header = Header {
        is_rdma: true,
        rdma_ack: false,
        is_write: true,
        ..Header::new(MSG_TYPE_SENTINEL_NOTIFY, peer.owner_id, buf.len() as u32)
    };
    header.encode((&mut buf[..HEADER_LEN]).try_into().unwrap());

    let sentinel_tag = peer.next_tag();
    let rdma = RdmaHeader {
        peer_addr: sentinel_addr + sentinel_slot as u64,
        peer_key: sentinel_key,
        transfer_size: 1,
        reply_type: 0,
        region_slot: sentinel_slot,
        rendezvous_tag: sentinel_tag,
        local_dma_addr: 0,
    };
    rdma.encode((&mut buf[HEADER_LEN..HEADER_LEN + RDMA_SUBHEADER_LEN]).try_into().unwrap());
    buf[HEADER_LEN + RDMA_SUBHEADER_LEN] = 0x01;

    peer.send_station.register(sentinel_tag);
    peer.qp.post_send(sentinel_tag as u64, buf);
    peer.send_station.wait(sentinel_tag)?;

    let _ = src;
    Ok(())
}

/// Reader-side helper for the notify variant: non-destructively check, and if set,
/// consume the peer's sentinel slot.
pub fn poll_notify(peer: &Peer, slot: u16) -> bool {
    // SAFETY: slot indexes within the fixed-size local sentinel array by construction.
    let set = unsafe { peer.read_local_sentinel(slot) } != 0;
    if set {
        peer.clear_local_sentinel(slot);
    }
    set
}

fn post_write(
    peer: &Peer,
    remote: RemoteRegion,
    src: &[u8],
    ack: bool,
    msg_type: u16,
) -> crate::error::Result<u32> {
    if peer.conn.is_error() {
        return Err(crate::error::Error::PeerUnreachable(peer.id));
    }

    let tag = peer.next_tag();
    if ack {
        // The initiator only waits on the responder's reply; the local send's own
        // completion is not separately observed on this path.
        peer.reply_station.register(tag);
    } else {
        // No reply is ever posted for the unacknowledged path: the caller waits on the
        // local send completing instead.
        peer.send_station.register(tag);
    }

    let mut buf = vec![0u8; HEADER_LEN + RDMA_SUBHEADER_LEN + src.len()];
    let header = Header {
        is_rdma: true,
        rdma_ack: ack,
        is_write: true,
        ..Header::new(msg_type, peer.owner_id, buf.len() as u32)
    };
    header.encode((&mut buf[..HEADER_LEN]).try_into().unwrap());

    let rdma = RdmaHeader {
        peer_addr: remote.addr,
        peer_key: remote.key,
        transfer_size: src.len() as u32,
        reply_type: 0,
        region_slot: remote.slot,
        rendezvous_tag: tag,
        local_dma_addr: 0,
    };
    rdma.encode((&mut buf[HEADER_LEN..HEADER_LEN + RDMA_SUBHEADER_LEN]).try_into().unwrap());
    buf[HEADER_LEN + RDMA_SUBHEADER_LEN..].copy_from_slice(src);

    peer.qp.post_send(tag as u64, buf);
    Ok(tag)
}

/// Completion-engine entry point: `header` classified as an acknowledged bulk request
/// (`is_rdma && rdma_ack && msg_type != MSG_TYPE_BULK_REPLY`) that targets us as the
/// responder. Performs the copy, replies, and hands `item` back to the caller to recycle.
pub fn handle_ack_request(from: NodeId, header: &Header, item: &ReceiveItem, peer: &Peer) {
    let rdma = RdmaHeader::decode(&item.buffer[HEADER_LEN..HEADER_LEN + RDMA_SUBHEADER_LEN]);
    check_region_key(peer, rdma.region_slot, rdma.peer_key);

    let target = std::ptr::with_exposed_provenance_mut::<u8>(rdma.peer_addr as usize);
    let reply_payload = if header.is_write {
        let payload = &item.buffer[HEADER_LEN + RDMA_SUBHEADER_LEN..item.len];
        // SAFETY: peer_addr/transfer_size name a region this node itself registered and
        // advertised via `advertise_region`; the key check above guards against a stale
        // or forged slot reference.
        unsafe { std::ptr::copy_nonoverlapping(payload.as_ptr(), target, payload.len()) };
        Vec::new()
    } else {
        let mut out = vec![0u8; rdma.transfer_size as usize];
        // SAFETY: see above.
        unsafe { std::ptr::copy_nonoverlapping(target, out.as_mut_ptr(), out.len()) };
        out
    };

    trace!(
        "bulk {} request from node {from}, slot {}, {} bytes",
        if header.is_write { "write" } else { "read" },
        rdma.region_slot,
        rdma.transfer_size
    );

    send_reply(peer, rdma.rendezvous_tag, rdma.region_slot, reply_payload);
}

/// Completion-engine entry point: an unacknowledged one-sided write landed — either a
/// generic polled bulk write, or a one-byte sentinel notify.
pub fn handle_unacked_write(from: NodeId, header: &Header, item: &ReceiveItem, peer: &Peer) {
    let rdma = RdmaHeader::decode(&item.buffer[HEADER_LEN..HEADER_LEN + RDMA_SUBHEADER_LEN]);

    if header.msg_type == MSG_TYPE_SENTINEL_NOTIFY {
        check_sentinel_key(peer, rdma.peer_key);
        debug_assert!(
            (rdma.region_slot as u32) < crate::region::SLOTS_PER_POOL,
            "sentinel slot out of range"
        );
        let byte = item.buffer[HEADER_LEN + RDMA_SUBHEADER_LEN];
        // SAFETY: peer_addr is this node's own local-sentinel base address plus an
        // in-range slot offset, computed by the initiator from the (address, key) this
        // node advertised in the bootstrap key-exchange.
        unsafe {
            std::ptr::write_volatile(
                std::ptr::with_exposed_provenance_mut::<u8>(rdma.peer_addr as usize),
                byte,
            )
        };
        trace!("sentinel slot {} notified by node {from}", rdma.region_slot);
        return;
    }

    check_region_key(peer, rdma.region_slot, rdma.peer_key);
    let payload = &item.buffer[HEADER_LEN + RDMA_SUBHEADER_LEN..item.len];
    let target = std::ptr::with_exposed_provenance_mut::<u8>(rdma.peer_addr as usize);

    if header.msg_type == MSG_TYPE_POLLED_WRITE_INLINE {
        let frame = build_inline_frame(payload);
        // SAFETY: the initiator reserved `payload.len() + INLINE_FRAME_OVERHEAD` bytes
        // at `peer_addr` before sending the request (see `write_polled_inline`).
        unsafe { std::ptr::copy_nonoverlapping(frame.as_ptr(), target, frame.len()) };
        trace!(
            "polled inline write from node {from}, slot {}, {} bytes",
            rdma.region_slot,
            payload.len()
        );
        return;
    }

    // SAFETY: see handle_ack_request.
    unsafe { std::ptr::copy_nonoverlapping(payload.as_ptr(), target, payload.len()) };
    trace!(
        "polled write from node {from}, slot {}, {} bytes",
        rdma.region_slot,
        payload.len()
    );
}

/// Completion-engine entry point for `MSG_TYPE_BULK_REPLY`.
pub fn handle_reply(item: &ReceiveItem, peer: &Peer) {
    let rdma = RdmaHeader::decode(&item.buffer[HEADER_LEN..HEADER_LEN + RDMA_SUBHEADER_LEN]);
    let payload = item.buffer[HEADER_LEN + RDMA_SUBHEADER_LEN..item.len].to_vec();
    peer.reply_station.fulfil(rdma.rendezvous_tag, payload);
}

/// `request_slot` is the region slot the initiator supplied on its request; the reply
/// echoes it back unchanged, per the initiator's `read`/`write` releasing that same slot
/// once the reply arrives.
fn send_reply(peer: &Peer, tag: u32, request_slot: u16, payload: Vec<u8>) {
    let mut buf = vec![0u8; HEADER_LEN + RDMA_SUBHEADER_LEN + payload.len()];
    let header = Header {
        is_rdma: true,
        rdma_ack: true,
        is_write: false,
        ..Header::new(MSG_TYPE_BULK_REPLY, peer.owner_id, buf.len() as u32)
    };
    header.encode((&mut buf[..HEADER_LEN]).try_into().unwrap());

    let rdma = RdmaHeader {
        peer_addr: 0,
        peer_key: 0,
        transfer_size: payload.len() as u32,
        reply_type: 0,
        region_slot: request_slot,
        rendezvous_tag: tag,
        local_dma_addr: 0,
    };
    rdma.encode((&mut buf[HEADER_LEN..HEADER_LEN + RDMA_SUBHEADER_LEN]).try_into().unwrap());
    buf[HEADER_LEN + RDMA_SUBHEADER_LEN..].copy_from_slice(&payload);

    // Fire-and-forget from the responder's perspective: nobody on this side waits on it.
    peer.qp.post_send(u64::MAX, buf);
}

fn check_region_key(peer: &Peer, slot: u16, presented_key: u32) {
    let expected = peer.bulk_pool.binding(slot).key;
    if expected != presented_key {
        error!(
            "bulk op against node {} presented key {presented_key} for slot {slot}, expected {expected}",
            peer.id
        );
        panic!("region key mismatch on slot {slot}");
    }
}

fn check_sentinel_key(peer: &Peer, presented_key: u32) {
    let expected = peer.sentinel_key();
    if expected != presented_key {
        error!(
            "sentinel notify from node {} presented key {presented_key}, expected {expected}",
            peer.id
        );
        panic!("sentinel key mismatch for node {}", peer.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inline_frame_matches_scenario_byte_layout() {
        // A 1024-byte inline write lands len=1024 little-endian in the first 4 bytes,
        // 0x01 in byte 4, 1024 payload bytes, then 0x01 again in position 1029.
        let payload = vec![0xABu8; 1024];
        let frame = build_inline_frame(&payload);

        assert_eq!(frame.len(), 1024 + INLINE_FRAME_OVERHEAD);
        assert_eq!(&frame[0..4], &1024u32.to_le_bytes());
        assert_eq!(frame[4], 0x01);
        assert_eq!(&frame[5..1029], payload.as_slice());
        assert_eq!(frame[1029], 0x01);
    }

    #[test]
    fn poll_inline_recovers_payload_once_both_flags_land() {
        let payload = b"inline-signal!!!";
        let frame = build_inline_frame(payload);

        assert_eq!(poll_inline(&frame, payload.len()), Some(payload.as_slice()));
    }

    #[test]
    fn poll_inline_rejects_a_frame_still_landing() {
        let payload = b"partial";
        let mut frame = build_inline_frame(payload);
        // Truncate as if only the head half of the one-sided write has landed so far.
        let tail = frame.len() - 1;
        frame[tail] = 0x00;

        assert_eq!(poll_inline(&frame, payload.len()), None);
    }
}
