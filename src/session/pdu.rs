// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Outgoing PDUs and the bounded per-connection pool they live in.
//!
//! A `TxPdu` keeps its parts immutable once staged: the 48-byte header,
//! the borrowed data segment, the pad length and the precomputed data
//! digest. The sender derives the scatter-gather frame from these parts
//! on every transmission, so a retransmission reproduces the original
//! bytes without saved-vector bookkeeping; only ExpStatSN and the header
//! digest are stamped per transmission.

use bytes::Bytes;
use zerocopy::FromBytes;

use crate::{
    models::{
        common::{Bhs, HEADER_LEN, pad4},
        digest,
        opcode::Opcode,
    },
    session::connection::ConnParams,
    status::Status,
    transport::WireFrame,
};

bitflags::bitflags! {
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
    pub struct PduFlags: u8 {
        /// Sitting on the send queue.
        const INQUEUE = 0x01;
        /// Owned by the sender or queued for (re)transmission; never
        /// freed or re-queued while set.
        const BUSY = 0x02;
        /// Head-insert on the send queue.
        const PRIORITY = 0x04;
    }
}

/// What happens to the PDU after transmission.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PduDisp {
    /// Sender frees it after the write.
    #[default]
    Free = 0,
    /// Retained by the owning CCB for retransmission.
    Wait = 1,
}

/// Stable handle into a connection's `PduPool`. The serial makes stale
/// handles harmless after slot reuse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PduId {
    index: u16,
    serial: u16,
}

#[derive(Debug)]
pub struct TxPdu {
    pub hdr: [u8; HEADER_LEN],
    pub data: Bytes,
    pub pad: usize,
    pub data_digest: Option<u32>,
    /// Whether a header digest slot follows the BHS on the wire.
    pub header_digest_slot: bool,
    pub disp: PduDisp,
    pub flags: PduFlags,
    /// ITT of the owning CCB for status-bearing PDUs.
    pub owner: Option<u32>,
}

impl Default for TxPdu {
    fn default() -> Self {
        Self {
            hdr: [0u8; HEADER_LEN],
            data: Bytes::default(),
            pad: usize::default(),
            data_digest: Option::default(),
            header_digest_slot: bool::default(),
            disp: PduDisp::default(),
            flags: PduFlags::default(),
            owner: Option::default(),
        }
    }
}

impl TxPdu {
    /// Typed mutable view over the header bytes. A layout that cannot
    /// cover the 48-byte buffer is a malformed-PDU condition, not a
    /// panic.
    pub fn hdr_view_mut<T: Bhs>(&mut self) -> Result<&mut T, Status> {
        T::mut_from_bytes(&mut self.hdr[..]).map_err(|_| Status::ProtocolError)
    }

    pub fn hdr_view<T: Bhs>(&self) -> Result<&T, Status> {
        T::ref_from_bytes(&self.hdr[..]).map_err(|_| Status::ProtocolError)
    }

    #[inline]
    fn opcode_raw(&self) -> u8 {
        self.hdr[0] & 0x3F
    }

    /// Stage the data segment, pad and digests for transmission.
    ///
    /// The data digest is computed here, before the first send, so every
    /// retransmission carries the same digest bytes. The header digest is
    /// left to the sender because ExpStatSN is stamped per transmission.
    pub fn setup_tx(&mut self, dsl: u32, data: Bytes, params: &ConnParams) {
        if dsl > 0 {
            let be = dsl.to_be_bytes();
            self.hdr[5] = be[1];
            self.hdr[6] = be[2];
            self.hdr[7] = be[3];
        }
        self.header_digest_slot = params.header_digest;
        if dsl > 0 && !data.is_empty() {
            self.pad = pad4(data.len());
            self.data_digest = params
                .data_digest
                .then(|| digest::data_digest(&data));
            self.data = data;
        } else {
            self.pad = 0;
            self.data_digest = None;
            self.data = Bytes::new();
        }
    }

    /// Stamp ExpStatSN at its per-opcode offset. Data-Out carries the
    /// field at byte 24, every other request at byte 28.
    pub fn stamp_exp_stat_sn(&mut self, sn: u32) {
        let off = if self.opcode_raw() == Opcode::ScsiDataOut as u8 {
            24
        } else {
            28
        };
        self.hdr[off..off + 4].copy_from_slice(&sn.to_be_bytes());
    }

    /// Derive the wire frame for this transmission, recomputing the
    /// header digest if the slot is present.
    pub fn frame(&self) -> WireFrame {
        WireFrame {
            hdr: self.hdr,
            header_digest: self
                .header_digest_slot
                .then(|| digest::header_digest(&self.hdr)),
            data: self.data.clone(),
            pad: self.pad,
            data_digest: self.data_digest,
        }
    }

    /// Total bytes a transmission of this PDU puts on the wire.
    pub fn wire_len(&self) -> usize {
        HEADER_LEN
            + if self.header_digest_slot { 4 } else { 0 }
            + self.data.len()
            + self.pad
            + self.data_digest.map_or(0, |_| 4)
    }
}

struct Slot {
    serial: u16,
    pdu: Option<TxPdu>,
}

/// Bounded arena of outgoing PDUs, guarded by the connection lock.
pub struct PduPool {
    slots: Vec<Slot>,
    free: Vec<u16>,
}

impl PduPool {
    pub fn new(capacity: u16) -> Self {
        let mut slots = Vec::with_capacity(capacity as usize);
        let mut free = Vec::with_capacity(capacity as usize);
        for i in 0..capacity {
            slots.push(Slot {
                serial: 0,
                pdu: None,
            });
            free.push(capacity - 1 - i);
        }
        Self { slots, free }
    }

    pub fn alloc(&mut self) -> Option<PduId> {
        let index = self.free.pop()?;
        let slot = &mut self.slots[index as usize];
        slot.serial = slot.serial.wrapping_add(1);
        slot.pdu = Some(TxPdu::default());
        Some(PduId {
            index,
            serial: slot.serial,
        })
    }

    pub fn get(&self, id: PduId) -> Option<&TxPdu> {
        let slot = self.slots.get(id.index as usize)?;
        if slot.serial != id.serial {
            return None;
        }
        slot.pdu.as_ref()
    }

    pub fn get_mut(&mut self, id: PduId) -> Option<&mut TxPdu> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.serial != id.serial {
            return None;
        }
        slot.pdu.as_mut()
    }

    /// Remove the PDU, returning it by value. The slot becomes free.
    pub fn take(&mut self, id: PduId) -> Option<TxPdu> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.serial != id.serial {
            return None;
        }
        let pdu = slot.pdu.take()?;
        self.free.push(id.index);
        Some(pdu)
    }

    pub fn free(&mut self, id: PduId) -> bool {
        self.take(id).is_some()
    }

    /// Number of live PDUs, used by tests and drain assertions.
    pub fn in_use(&self) -> usize {
        self.slots.len() - self.free.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(hd: bool, dd: bool) -> ConnParams {
        ConnParams {
            header_digest: hd,
            data_digest: dd,
            max_transfer: 8192,
            max_firstimmed: 0,
            max_firstdata: 0,
        }
    }

    #[test]
    fn frame_pads_to_word_boundary() {
        let mut pdu = TxPdu::default();
        pdu.setup_tx(5, Bytes::from_static(b"hello"), &params(false, true));
        assert_eq!(pdu.pad, 3);
        assert!(pdu.data_digest.is_some());
        // 48 header + 5 data + 3 pad + 4 digest
        assert_eq!(pdu.wire_len(), 60);
        let frame = pdu.frame();
        assert_eq!(frame.wire_len(), 60);
        assert_eq!(frame.to_bytes().len(), 60);
    }

    #[test]
    fn header_digest_recomputed_per_frame() {
        let mut pdu = TxPdu::default();
        pdu.setup_tx(0, Bytes::new(), &params(true, false));
        let first = pdu.frame();
        pdu.stamp_exp_stat_sn(7);
        let second = pdu.frame();
        assert_ne!(first.header_digest, second.header_digest);
        assert_eq!(second.header_digest, Some(digest::header_digest(&pdu.hdr)));
    }

    #[test]
    fn stale_pdu_id_does_not_resolve() {
        let mut pool = PduPool::new(2);
        let a = pool.alloc().expect("slot");
        assert!(pool.free(a));
        let b = pool.alloc().expect("slot");
        assert!(pool.get(a).is_none(), "stale id must miss");
        assert!(pool.get(b).is_some());
    }

    #[test]
    fn pool_is_bounded() {
        let mut pool = PduPool::new(2);
        let _a = pool.alloc().expect("slot");
        let _b = pool.alloc().expect("slot");
        assert!(pool.alloc().is_none());
        assert_eq!(pool.in_use(), 2);
    }
}
