// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use core::fmt;

use zerocopy::{
    BigEndian, FromBytes, NativeEndian, Immutable, IntoBytes, KnownLayout, U32, U64,
};

use crate::models::{
    common::{BasicHeaderSegment, Bhs, dsl_get, dsl_set},
    opcode::RawBhsOpcode,
};

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CmdFlags: u8 {
        /// No unsolicited data follows this command PDU.
        const FINAL = 0x80;
        /// Data-In command.
        const READ = 0x40;
        /// Data-Out command.
        const WRITE = 0x20;
        /// Task attribute bits (SIMPLE/ORDERED/HEAD_OF_QUEUE/ACA).
        const ATTR_MASK = 0x07;
    }
}

/// SCSI task attribute carried in the low bits of the command flags byte.
#[repr(u8)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum TaskAttr {
    Untagged = 0,
    #[default]
    Simple = 1,
    Ordered = 2,
    HeadOfQueue = 3,
    Aca = 4,
}

/// Wire-safe command flags byte.
#[repr(transparent)]
#[derive(Clone, Copy, Default, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct RawCmdFlags(u8);

impl RawCmdFlags {
    #[inline]
    pub const fn raw(self) -> u8 {
        self.0
    }

    #[inline]
    pub fn set(&mut self, f: CmdFlags) {
        self.0 |= f.bits();
    }

    #[inline]
    pub fn contains(self, f: CmdFlags) -> bool {
        self.0 & f.bits() == f.bits()
    }

    #[inline]
    pub fn set_attr(&mut self, attr: TaskAttr) {
        self.0 = (self.0 & !CmdFlags::ATTR_MASK.bits()) | (attr as u8);
    }
}

impl fmt::Debug for RawCmdFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "RawCmdFlags({:?}|attr={})",
            CmdFlags::from_bits_truncate(self.0),
            self.0 & CmdFlags::ATTR_MASK.bits()
        )
    }
}

/// BHS for a SCSI Command request (opcode 0x01).
#[repr(C)]
#[derive(Debug, Default, PartialEq, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct ScsiCommandRequest {
    pub opcode: RawBhsOpcode,                          // 0
    pub flags: RawCmdFlags,                            // 1
    reserved1: [u8; 2],                                // 2..4
    pub total_ahs_length: u8,                          // 4
    pub data_segment_length: [u8; 3],                  // 5..8
    pub lun: U64<BigEndian>,                           // 8..16
    pub initiator_task_tag: U32<NativeEndian>,                       // 16..20
    pub expected_data_transfer_length: U32<BigEndian>, // 20..24
    pub cmd_sn: U32<BigEndian>,                        // 24..28
    pub exp_stat_sn: U32<BigEndian>,                   // 28..32
    pub cdb: [u8; 16],                                 // 32..48
}

impl Bhs for ScsiCommandRequest {}

impl BasicHeaderSegment for ScsiCommandRequest {
    fn opcode(&self) -> &RawBhsOpcode {
        &self.opcode
    }

    fn opcode_mut(&mut self) -> &mut RawBhsOpcode {
        &mut self.opcode
    }

    fn initiator_task_tag(&self) -> u32 {
        self.initiator_task_tag.get()
    }

    fn set_initiator_task_tag(&mut self, itt: u32) {
        self.initiator_task_tag.set(itt);
    }

    fn data_segment_length(&self) -> usize {
        dsl_get(&self.data_segment_length)
    }

    fn set_data_segment_length(&mut self, len: u32) {
        dsl_set(&mut self.data_segment_length, len);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::opcode::Opcode;

    #[test]
    fn header_accessors_roundtrip() {
        let mut hdr = ScsiCommandRequest::default();
        hdr.opcode_mut().set_opcode(Opcode::ScsiCommandReq);
        BasicHeaderSegment::set_initiator_task_tag(&mut hdr, 0x5A00_0107);
        hdr.set_data_segment_length(0x123);
        assert_eq!(hdr.opcode().opcode_known(), Some(Opcode::ScsiCommandReq));
        assert_eq!(BasicHeaderSegment::initiator_task_tag(&hdr), 0x5A00_0107);
        assert_eq!(BasicHeaderSegment::data_segment_length(&hdr), 0x123);
    }

    #[test]
    fn task_attr_lives_in_low_bits() {
        let mut flags = RawCmdFlags::default();
        flags.set(CmdFlags::FINAL | CmdFlags::WRITE);
        flags.set_attr(TaskAttr::HeadOfQueue);
        assert_eq!(flags.raw(), 0x80 | 0x20 | 0x03);
        flags.set_attr(TaskAttr::Simple);
        assert_eq!(flags.raw() & 0x07, 0x01, "attr replacement clears old bits");
        assert!(flags.contains(CmdFlags::FINAL));
    }
}
