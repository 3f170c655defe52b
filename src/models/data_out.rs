// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use zerocopy::{
    BigEndian, FromBytes, NativeEndian, Immutable, IntoBytes, KnownLayout, U32, U64,
};

use crate::models::{
    common::{BasicHeaderSegment, Bhs, dsl_get, dsl_set},
    opcode::RawBhsOpcode,
};

/// Final bit of the Data-Out flags byte; the rest is reserved.
pub const DATA_OUT_FINAL: u8 = 0x80;

/// BHS for SCSI Data-Out (opcode 0x05).
///
/// Unlike every other request this core writes, ExpStatSN sits at byte 24
/// because bytes 24..28 of the common layout are taken by the
/// TargetTransferTag/LUN arrangement of the data family.
#[repr(C)]
#[derive(Debug, Default, PartialEq, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct ScsiDataOut {
    pub opcode: RawBhsOpcode,                // 0
    pub flags: u8,                           // 1 (F, rest 0)
    reserved1: [u8; 2],                      // 2..4
    pub total_ahs_length: u8,                // 4
    pub data_segment_length: [u8; 3],        // 5..8
    pub lun: U64<BigEndian>,                 // 8..16
    pub initiator_task_tag: U32<NativeEndian>,             // 16..20
    pub target_transfer_tag: U32<BigEndian>, // 20..24
    pub exp_stat_sn: U32<BigEndian>,         // 24..28
    reserved2: [u8; 8],                      // 28..36
    pub data_sn: U32<BigEndian>,             // 36..40
    pub buffer_offset: U32<BigEndian>,       // 40..44
    reserved3: [u8; 4],                      // 44..48
}

impl ScsiDataOut {
    /// TTT for unsolicited / initial-burst Data-Out.
    pub const DEFAULT_TTT: u32 = 0xFFFF_FFFF;
}

impl Bhs for ScsiDataOut {}

impl BasicHeaderSegment for ScsiDataOut {
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
