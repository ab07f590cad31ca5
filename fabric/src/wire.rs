// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Bit-exact message header encoding for this subsystem's wire format.
//!
//! ```text
//! offset  size  field
//!  0      2     type
//!  2      1     priority
//!  3      1     flags:   bit0=is_rdma, bit1=rdma_ack, bit2=is_write
//!  4      1     from_node
//!  5      1     reserved
//!  6      2     reserved
//!  8      4     total_size (including this header)
//! ```
//!
//! If `is_rdma` is set, a 40-byte RDMA sub-header immediately follows:
//! `peer_addr:u64`, `peer_key:u32`, `transfer_size:u32`, `reply_type:u16`,
//! `region_slot:u16`, `rendezvous_tag:u32`, `local_dma_addr:u64`, 8 bytes padding.
//!
//! All multi-byte fields are host-endian on the wire: only identical kernel/process
//! builds interoperate, so there is no cross-endian negotiation here. We fix the layout
//! relative to a little-endian reference and always encode/decode with
//! `to_ne_bytes`/`from_ne_bytes`, matching a build where every node runs the same image.

use crate::mesh::NodeId;

pub const HEADER_LEN: usize = 12;
pub const RDMA_SUBHEADER_LEN: usize = 40;

const FLAG_IS_RDMA: u8 = 1 << 0;
const FLAG_RDMA_ACK: u8 = 1 << 1;
const FLAG_IS_WRITE: u8 = 1 << 2;

/// A decoded message header. Bulk-carrying fields are only meaningful when `is_rdma`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub msg_type: u16,
    pub priority: u8,
    pub is_rdma: bool,
    pub rdma_ack: bool,
    pub is_write: bool,
    pub from_node: NodeId,
    pub total_size: u32,
}

/// The 40-byte bulk-transfer sub-header, present only when `Header::is_rdma` is set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RdmaHeader {
    pub peer_addr: u64,
    pub peer_key: u32,
    pub transfer_size: u32,
    pub reply_type: u16,
    pub region_slot: u16,
    pub rendezvous_tag: u32,
    pub local_dma_addr: u64,
}

impl Header {
    pub fn new(msg_type: u16, from_node: NodeId, total_size: u32) -> Self {
        Self {
            msg_type,
            priority: 0,
            is_rdma: false,
            rdma_ack: false,
            is_write: false,
            from_node,
            total_size,
        }
    }

    fn flags(&self) -> u8 {
        let mut flags = 0u8;
        if self.is_rdma {
            flags |= FLAG_IS_RDMA;
        }
        if self.rdma_ack {
            flags |= FLAG_RDMA_ACK;
        }
        if self.is_write {
            flags |= FLAG_IS_WRITE;
        }
        flags
    }

    pub fn encode(&self, out: &mut [u8; HEADER_LEN]) {
        out[0..2].copy_from_slice(&self.msg_type.to_ne_bytes());
        out[2] = self.priority;
        out[3] = self.flags();
        out[4] = self.from_node as u8;
        out[5] = 0;
        out[6..8].copy_from_slice(&0u16.to_ne_bytes());
        out[8..12].copy_from_slice(&self.total_size.to_ne_bytes());
    }

    /// Decode a header from a complete buffer. A fatal bug (truncated buffer) panics:
    /// the completion engine never hands a short buffer to this function.
    pub fn decode(buf: &[u8]) -> Self {
        assert!(buf.len() >= HEADER_LEN, "truncated message header");

        let msg_type = u16::from_ne_bytes([buf[0], buf[1]]);
        let priority = buf[2];
        let flags = buf[3];
        let from_node = buf[4] as NodeId;
        let total_size = u32::from_ne_bytes([buf[8], buf[9], buf[10], buf[11]]);

        Self {
            msg_type,
            priority,
            is_rdma: flags & FLAG_IS_RDMA != 0,
            rdma_ack: flags & FLAG_RDMA_ACK != 0,
            is_write: flags & FLAG_IS_WRITE != 0,
            from_node,
            total_size,
        }
    }
}

impl RdmaHeader {
    pub fn encode(&self, out: &mut [u8; RDMA_SUBHEADER_LEN]) {
        out[0..8].copy_from_slice(&self.peer_addr.to_ne_bytes());
        out[8..12].copy_from_slice(&self.peer_key.to_ne_bytes());
        out[12..16].copy_from_slice(&self.transfer_size.to_ne_bytes());
        out[16..18].copy_from_slice(&self.reply_type.to_ne_bytes());
        out[18..20].copy_from_slice(&self.region_slot.to_ne_bytes());
        out[20..24].copy_from_slice(&self.rendezvous_tag.to_ne_bytes());
        out[24..32].copy_from_slice(&self.local_dma_addr.to_ne_bytes());
        out[32..40].fill(0);
    }

    pub fn decode(buf: &[u8]) -> Self {
        assert!(buf.len() >= RDMA_SUBHEADER_LEN, "truncated RDMA sub-header");

        Self {
            peer_addr: u64::from_ne_bytes(buf[0..8].try_into().unwrap()),
            peer_key: u32::from_ne_bytes(buf[8..12].try_into().unwrap()),
            transfer_size: u32::from_ne_bytes(buf[12..16].try_into().unwrap()),
            reply_type: u16::from_ne_bytes(buf[16..18].try_into().unwrap()),
            region_slot: u16::from_ne_bytes(buf[18..20].try_into().unwrap()),
            rendezvous_tag: u32::from_ne_bytes(buf[20..24].try_into().unwrap()),
            local_dma_addr: u64::from_ne_bytes(buf[24..32].try_into().unwrap()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trips() {
        let header = Header {
            msg_type: 7,
            priority: 3,
            is_rdma: true,
            rdma_ack: true,
            is_write: false,
            from_node: 2,
            total_size: 128,
        };

        let mut buf = [0u8; HEADER_LEN];
        header.encode(&mut buf);
        assert_eq!(Header::decode(&buf), header);
    }

    #[test]
    fn rdma_subheader_round_trips() {
        let rdma = RdmaHeader {
            peer_addr: 0xdead_beef_0000_1111,
            peer_key: 42,
            transfer_size: 8192,
            reply_type: 9,
            region_slot: 5,
            rendezvous_tag: 77,
            local_dma_addr: 0x1234_5678,
        };

        let mut buf = [0u8; RDMA_SUBHEADER_LEN];
        rdma.encode(&mut buf);
        assert_eq!(RdmaHeader::decode(&buf), rdma);
    }
}
