// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use zerocopy::{
    BigEndian, FromBytes, NativeEndian, Immutable, IntoBytes, KnownLayout, U32, U64,
};

use crate::models::{
    common::{BasicHeaderSegment, Bhs, dsl_get, dsl_set},
    opcode::RawBhsOpcode,
};

pub const NOP_FINAL: u8 = 0x80;

/// BHS for NOP-Out (opcode 0x00). Sent as a keepalive probe and as the
/// reply to a target-initiated NOP-In.
#[repr(C)]
#[derive(Debug, Default, PartialEq, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct NopOutRequest {
    pub opcode: RawBhsOpcode,                // 0
    pub flags: u8,                           // 1 (F)
    reserved1: [u8; 2],                      // 2..4
    pub total_ahs_length: u8,                // 4
    pub data_segment_length: [u8; 3],        // 5..8
    pub lun: U64<BigEndian>,                 // 8..16
    pub initiator_task_tag: U32<NativeEndian>,             // 16..20
    pub target_transfer_tag: U32<BigEndian>, // 20..24
    pub cmd_sn: U32<BigEndian>,              // 24..28
    pub exp_stat_sn: U32<BigEndian>,         // 28..32
    reserved2: [u8; 16],                     // 32..48
}

impl NopOutRequest {
    /// TTT for an initiator-originated ping.
    pub const DEFAULT_TTT: u32 = 0xFFFF_FFFF;
}

impl Bhs for NopOutRequest {}

impl BasicHeaderSegment for NopOutRequest {
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

/// BHS for NOP-In (opcode 0x20), consumed when replying to a target ping.
#[repr(C)]
#[derive(Debug, Default, PartialEq, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct NopInResponse {
    pub opcode: RawBhsOpcode,                // 0
    pub flags: u8,                           // 1 (F)
    reserved1: [u8; 2],                      // 2..4
    pub total_ahs_length: u8,                // 4
    pub data_segment_length: [u8; 3],        // 5..8
    pub lun: U64<BigEndian>,                 // 8..16
    pub initiator_task_tag: U32<NativeEndian>,             // 16..20
    pub target_transfer_tag: U32<BigEndian>, // 20..24
    pub stat_sn: U32<BigEndian>,             // 24..28
    pub exp_cmd_sn: U32<BigEndian>,          // 28..32
    pub max_cmd_sn: U32<BigEndian>,          // 32..36
    reserved2: [u8; 12],                     // 36..48
}

impl Bhs for NopInResponse {}

impl BasicHeaderSegment for NopInResponse {
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
