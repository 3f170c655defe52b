// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Command control blocks: one per outstanding operation.
//!
//! CCBs live in a session-wide arena indexed by the low bits of the
//! initiator task tag; bits 12..24 carry a slot serial so a reused slot
//! never resolves through a stale tag, and the top byte is left to the
//! caller's tag-type encoding.

use bytes::Bytes;
use tokio::sync::oneshot;

use crate::{
    models::command::TaskAttr,
    session::{pdu::PduId, timer::Timer},
    status::Status,
};

const ITT_INDEX_BITS: u32 = 12;
const ITT_INDEX_MASK: u32 = (1 << ITT_INDEX_BITS) - 1;
const ITT_SERIAL_MASK: u32 = 0x00FF_F000;
/// Hard cap on table size so the index always fits its ITT bits.
const MAX_CCBS: u16 = 1 << ITT_INDEX_BITS;

bitflags::bitflags! {
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
    pub struct CcbFlags: u8 {
        /// Survives connection death for reassignment to a sibling.
        const REASSIGN = 0x01;
        /// Text request collecting a SendTargets answer.
        const SENDTARGET = 0x02;
        /// Logout referencing a connection other than its own.
        const OTHERCONN = 0x04;
    }
}

/// How completion is delivered. The ordering carries meaning: anything
/// at or below `Nowait` is not awaiting a wake, and a command timer that
/// finds its CCB at or below `Free` escalates instead of retrying.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum CcbDisp {
    #[default]
    Unused = 0,
    /// Wake in progress; blocks a second wake.
    Busy = 1,
    /// Fire-and-forget; the caller keeps the previous disposition.
    Nowait = 2,
    /// Free the CCB when the operation resolves.
    Free = 3,
    /// A caller is blocked on `ccb_cv` until resolution.
    Wait = 4,
    /// Complete through the upper-stack transfer channel.
    Scsi = 5,
    /// Command PDU sent, unsolicited data still being emitted.
    Defer = 6,
}

/// Completion payload for upper-stack transfers.
#[derive(Debug)]
pub struct XferResult {
    pub status: Status,
    pub residual: u32,
    pub sense: Option<Bytes>,
}

/// One SCSI transfer submitted by the upper stack.
#[derive(Debug)]
pub struct ScsiXfer {
    pub lun: u64,
    pub cdb: Vec<u8>,
    pub data_in: bool,
    pub data_len: u32,
    /// Write payload; empty for reads.
    pub data: Bytes,
    pub attr: TaskAttr,
    /// Caller-chosen tag byte, placed in ITT bits 24..32.
    pub tag_id: u8,
    /// Fail instead of sleeping when resources are tight.
    pub no_wait: bool,
    /// Target warm reset instead of a command.
    pub reset: bool,
    pub done: oneshot::Sender<XferResult>,
}

impl ScsiXfer {
    pub fn read(lun: u64, cdb: Vec<u8>, len: u32) -> (Self, oneshot::Receiver<XferResult>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                lun,
                cdb,
                data_in: true,
                data_len: len,
                data: Bytes::new(),
                attr: TaskAttr::Simple,
                tag_id: 0,
                no_wait: false,
                reset: false,
                done: tx,
            },
            rx,
        )
    }

    pub fn write(lun: u64, cdb: Vec<u8>, data: Bytes) -> (Self, oneshot::Receiver<XferResult>) {
        let len = data.len() as u32;
        let (tx, rx) = oneshot::channel();
        (
            Self {
                lun,
                cdb,
                data_in: false,
                data_len: len,
                data,
                attr: TaskAttr::Simple,
                tag_id: 0,
                no_wait: false,
                reset: false,
                done: tx,
            },
            rx,
        )
    }

    pub fn reset(lun: u64) -> (Self, oneshot::Receiver<XferResult>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                lun,
                cdb: Vec::new(),
                data_in: false,
                data_len: 0,
                data: Bytes::new(),
                attr: TaskAttr::Simple,
                tag_id: 0,
                no_wait: false,
                reset: true,
                done: tx,
            },
            rx,
        )
    }
}

/// Bookkeeping for one outstanding operation.
#[derive(Debug, Default)]
pub struct Ccb {
    pub itt: u32,
    /// Connection currently carrying this CCB; rewritten on reassignment.
    pub conn_id: u16,
    pub disp: CcbDisp,
    pub status: Status,
    pub cmd_sn: u32,
    pub lun: u64,
    pub cdb: [u8; 16],
    pub cdb_len: usize,
    pub data_in: bool,
    pub data_len: u32,
    pub data: Bytes,
    /// Bytes of Data-In seen so far, maintained by the receive path.
    pub xfer_len: u32,
    pub residual: u32,
    pub sense: Option<Bytes>,
    /// Next expected DataSN for an in-flight read.
    pub exp_data_sn: u32,
    pub flags: CcbFlags,
    pub attr: TaskAttr,
    pub num_timeouts: u32,
    pub total_tries: u32,
    /// Retransmittable PDU retained under `PduDisp::Wait`.
    pub pdu_waiting: Option<PduId>,
    pub timer: Timer,
    pub done: Option<oneshot::Sender<XferResult>>,
    /// Accumulated SendTargets key-value text.
    pub text: Option<Bytes>,
}

struct CcbSlot {
    serial: u16,
    ccb: Option<Ccb>,
}

/// Session-wide CCB arena. All access goes through the session lock.
pub struct CcbTable {
    slots: Vec<CcbSlot>,
    free: Vec<u16>,
}

impl CcbTable {
    pub fn new(capacity: u16) -> Self {
        let capacity = capacity.min(MAX_CCBS);
        let mut slots = Vec::with_capacity(capacity as usize);
        let mut free = Vec::with_capacity(capacity as usize);
        for i in 0..capacity {
            slots.push(CcbSlot {
                serial: 0,
                ccb: None,
            });
            free.push(capacity - 1 - i);
        }
        Self { slots, free }
    }

    /// Allocate a fresh CCB bound to `conn_id`; the returned ITT carries
    /// the slot index and serial, top byte zero.
    pub fn alloc(&mut self, conn_id: u16) -> Option<u32> {
        let index = self.free.pop()?;
        let slot = &mut self.slots[index as usize];
        slot.serial = slot.serial.wrapping_add(1);
        let itt = (index as u32 & ITT_INDEX_MASK)
            | (((slot.serial as u32) << ITT_INDEX_BITS) & ITT_SERIAL_MASK);
        slot.ccb = Some(Ccb {
            itt,
            conn_id,
            ..Ccb::default()
        });
        Some(itt)
    }

    fn resolve(&self, itt: u32) -> Option<usize> {
        let index = (itt & ITT_INDEX_MASK) as usize;
        let slot = self.slots.get(index)?;
        let serial = ((itt & ITT_SERIAL_MASK) >> ITT_INDEX_BITS) as u16;
        (slot.serial == serial && slot.ccb.is_some()).then_some(index)
    }

    /// Look up by ITT, ignoring the caller's tag byte.
    pub fn get(&self, itt: u32) -> Option<&Ccb> {
        let index = self.resolve(itt)?;
        self.slots[index].ccb.as_ref()
    }

    pub fn get_mut(&mut self, itt: u32) -> Option<&mut Ccb> {
        let index = self.resolve(itt)?;
        self.slots[index].ccb.as_mut()
    }

    pub fn free(&mut self, itt: u32) -> bool {
        let Some(index) = self.resolve(itt) else {
            return false;
        };
        self.slots[index].ccb = None;
        self.free.push(index as u16);
        true
    }

    pub fn in_use(&self) -> usize {
        self.slots.len() - self.free.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn itt_survives_tag_byte() {
        let mut table = CcbTable::new(8);
        let itt = table.alloc(1).expect("slot");
        let tagged = itt | 0x5A00_0000;
        assert!(table.get(tagged).is_some());
        if let Some(ccb) = table.get_mut(tagged) {
            ccb.itt = tagged;
        }
        assert!(table.free(tagged));
        assert!(table.get(tagged).is_none());
    }

    #[test]
    fn stale_itt_misses_after_reuse() {
        let mut table = CcbTable::new(1);
        let first = table.alloc(1).expect("slot");
        assert!(table.free(first));
        let second = table.alloc(1).expect("slot");
        assert_ne!(first, second, "serial must advance");
        assert!(table.get(first).is_none());
        assert!(table.get(second).is_some());
    }

    #[test]
    fn table_is_bounded() {
        let mut table = CcbTable::new(2);
        let a = table.alloc(1).expect("slot");
        let _b = table.alloc(1).expect("slot");
        assert!(table.alloc(1).is_none());
        assert!(table.free(a));
        assert!(table.alloc(1).is_some());
    }
}
