// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use zerocopy::{
    BigEndian, FromBytes, NativeEndian, Immutable, IntoBytes, KnownLayout, U32, U64,
};

use crate::models::{
    common::{BasicHeaderSegment, Bhs, dsl_get, dsl_set},
    opcode::RawBhsOpcode,
};

pub const TASK_FINAL: u8 = 0x80;

/// Task management function, low 7 bits of the flags byte.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskMgmtFunction {
    AbortTask = 1,
    AbortTaskSet = 2,
    ClearAca = 3,
    ClearTaskSet = 4,
    LunReset = 5,
    TargetWarmReset = 6,
    TargetColdReset = 7,
    /// Reassign connection allegiance of a surviving task.
    TaskReassign = 8,
}

/// BHS for a Task Management request (opcode 0x02, always immediate).
#[repr(C)]
#[derive(Debug, Default, PartialEq, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct TaskMgmtRequest {
    pub opcode: RawBhsOpcode,                // 0
    pub flags: u8,                           // 1 (F | function)
    reserved1: [u8; 2],                      // 2..4
    pub total_ahs_length: u8,                // 4
    pub data_segment_length: [u8; 3],        // 5..8
    pub lun: U64<BigEndian>,                 // 8..16
    pub initiator_task_tag: U32<NativeEndian>,             // 16..20
    pub referenced_task_tag: U32<NativeEndian>,            // 20..24
    pub cmd_sn: U32<BigEndian>,              // 24..28
    pub exp_stat_sn: U32<BigEndian>,         // 28..32
    pub ref_cmd_sn: U32<BigEndian>,          // 32..36
    pub exp_data_sn: U32<BigEndian>,         // 36..40
    reserved2: [u8; 8],                      // 40..48
}

impl TaskMgmtRequest {
    pub const DEFAULT_REF_TAG: u32 = 0xFFFF_FFFF;
}

impl Bhs for TaskMgmtRequest {}

impl BasicHeaderSegment for TaskMgmtRequest {
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

/// BHS for a Task Management response (opcode 0x22).
#[repr(C)]
#[derive(Debug, Default, PartialEq, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct TaskMgmtResponse {
    pub opcode: RawBhsOpcode,         // 0
    pub flags: u8,                    // 1
    pub response: u8,                 // 2
    reserved1: u8,                    // 3
    pub total_ahs_length: u8,         // 4
    pub data_segment_length: [u8; 3], // 5..8
    reserved2: [u8; 8],               // 8..16
    pub initiator_task_tag: U32<NativeEndian>,      // 16..20
    reserved3: [u8; 4],               // 20..24
    pub stat_sn: U32<BigEndian>,      // 24..28
    pub exp_cmd_sn: U32<BigEndian>,   // 28..32
    pub max_cmd_sn: U32<BigEndian>,   // 32..36
    reserved4: [u8; 12],              // 36..48
}

impl TaskMgmtResponse {
    /// Function complete.
    pub fn is_success(&self) -> bool {
        self.response == 0
    }
}

impl Bhs for TaskMgmtResponse {}

impl BasicHeaderSegment for TaskMgmtResponse {
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
