// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Hand-off container for PDUs arriving from the external receive path.
//!
//! The receive loop owns parsing, digest verification and framing; the
//! core only needs the 48 header bytes and the (already verified) data
//! segment to drive negotiation, R2T-solicited data and ping replies.

use bytes::Bytes;
use zerocopy::FromBytes;

use crate::models::{
    common::{Bhs, HEADER_LEN},
    opcode::{Opcode, RawBhsOpcode},
};

#[derive(Debug, Clone)]
pub struct RxPdu {
    pub hdr: [u8; HEADER_LEN],
    pub data: Bytes,
}

impl RxPdu {
    pub fn new(hdr: [u8; HEADER_LEN], data: Bytes) -> Self {
        Self { hdr, data }
    }

    #[inline]
    pub fn opcode(&self) -> Option<Opcode> {
        RawBhsOpcode::from_raw(self.hdr[0]).opcode_known()
    }

    /// Final bit, bit 7 of the flags byte for every PDU family the core
    /// consumes.
    #[inline]
    pub fn final_bit(&self) -> bool {
        (self.hdr[1] & 0x80) != 0
    }

    #[inline]
    pub fn initiator_task_tag(&self) -> u32 {
        u32::from_ne_bytes([self.hdr[16], self.hdr[17], self.hdr[18], self.hdr[19]])
    }

    /// Typed view over the header bytes. The caller picks the layout
    /// matching the opcode; a mismatched pick still yields a view with
    /// garbage fields, so check `opcode()` first.
    pub fn view<T: Bhs>(&self) -> Option<&T> {
        T::ref_from_bytes(&self.hdr[..]).ok()
    }
}

#[cfg(test)]
mod tests {
    use hex_literal::hex;

    use super::*;
    use crate::models::{login::LoginResponse, opcode::Opcode};

    #[test]
    fn typed_view_reads_header_fields() {
        // login response, TRANSIT | CSG=operational NSG=full-feature,
        // TSIH 0x002A, StatSN 7, ExpCmdSN 2, MaxCmdSN 34
        let hdr: [u8; HEADER_LEN] = hex!(
            "23 87 00 00 00 00 00 00"
            "00 00 00 00 00 00 00 2A"
            "00 00 00 00 00 00 00 00"
            "00 00 00 07 00 00 00 02"
            "00 00 00 22 00 00 00 00"
            "00 00 00 00 00 00 00 00"
        );
        let rx = RxPdu::new(hdr, Bytes::new());
        assert_eq!(rx.opcode(), Some(Opcode::LoginResp));
        assert!(rx.final_bit());
        let view: &LoginResponse = rx.view().expect("48-byte view");
        assert_eq!(view.tsih.get(), 42);
        assert!(view.flags.transit());
        assert_eq!(view.stat_sn.get(), 7);
        assert_eq!(view.exp_cmd_sn.get(), 2);
        assert_eq!(view.max_cmd_sn.get(), 34);
        assert!(view.is_success());
    }
}
