// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use zerocopy::{
    BigEndian, FromBytes, NativeEndian, Immutable, IntoBytes, KnownLayout, U32, U64,
};

use crate::models::{
    common::{BasicHeaderSegment, Bhs, dsl_get, dsl_set},
    opcode::RawBhsOpcode,
};

/// BHS for Ready To Transfer (opcode 0x31), consumed when the target
/// solicits write data.
#[repr(C)]
#[derive(Debug, Default, PartialEq, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct ReadyToTransfer {
    pub opcode: RawBhsOpcode,                         // 0
    reserved1: [u8; 3],                               // 1..4
    pub total_ahs_length: u8,                         // 4
    pub data_segment_length: [u8; 3],                 // 5..8
    pub lun: U64<BigEndian>,                          // 8..16
    pub initiator_task_tag: U32<NativeEndian>,                      // 16..20
    pub target_transfer_tag: U32<BigEndian>,          // 20..24
    pub stat_sn: U32<BigEndian>,                      // 24..28
    pub exp_cmd_sn: U32<BigEndian>,                   // 28..32
    pub max_cmd_sn: U32<BigEndian>,                   // 32..36
    pub r2t_sn: U32<BigEndian>,                       // 36..40
    pub buffer_offset: U32<BigEndian>,                // 40..44
    pub desired_data_transfer_length: U32<BigEndian>, // 44..48
}

impl Bhs for ReadyToTransfer {}

impl BasicHeaderSegment for ReadyToTransfer {
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
