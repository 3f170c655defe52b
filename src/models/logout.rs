// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use zerocopy::{
    BigEndian, FromBytes, NativeEndian, Immutable, IntoBytes, KnownLayout, U16, U32,
};

use crate::models::{
    common::{BasicHeaderSegment, Bhs, dsl_get, dsl_set},
    opcode::RawBhsOpcode,
};

pub const LOGOUT_FINAL: u8 = 0x80;

/// Reason code carried in the low bits of the logout flags byte.
#[repr(u8)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum LogoutReason {
    #[default]
    CloseSession = 0,
    CloseConnection = 1,
    /// Free the connection for recovery while retaining its tasks.
    RecoverConnection = 2,
}

impl LogoutReason {
    /// A reason above CloseSession names a specific connection and needs
    /// the CID field filled in.
    pub fn references_cid(self) -> bool {
        !matches!(self, LogoutReason::CloseSession)
    }
}

/// BHS for a Logout request (opcode 0x06, always immediate).
#[repr(C)]
#[derive(Debug, Default, PartialEq, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct LogoutRequest {
    pub opcode: RawBhsOpcode,         // 0
    pub flags: u8,                    // 1 (F | reason)
    reserved1: [u8; 2],               // 2..4
    pub total_ahs_length: u8,         // 4
    pub data_segment_length: [u8; 3], // 5..8
    reserved2: [u8; 8],               // 8..16
    pub initiator_task_tag: U32<NativeEndian>,      // 16..20
    pub cid: U16<BigEndian>,          // 20..22
    reserved3: [u8; 2],               // 22..24
    pub cmd_sn: U32<BigEndian>,       // 24..28
    pub exp_stat_sn: U32<BigEndian>,  // 28..32
    reserved4: [u8; 16],              // 32..48
}

impl Bhs for LogoutRequest {}

impl BasicHeaderSegment for LogoutRequest {
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

/// BHS for a Logout response (opcode 0x26).
#[repr(C)]
#[derive(Debug, Default, PartialEq, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct LogoutResponse {
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
    reserved4: [u8; 4],               // 36..40
    pub time2wait: U16<BigEndian>,    // 40..42
    pub time2retain: U16<BigEndian>,  // 42..44
    reserved5: [u8; 4],               // 44..48
}

impl Bhs for LogoutResponse {}

impl BasicHeaderSegment for LogoutResponse {
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
