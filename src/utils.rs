// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use rand::RngExt;

/// Generates a random 6-byte ISID in OUI format (two top bits of the
/// first byte cleared, per RFC 7143 §10.12.5).
///
/// The ISID is fixed at session creation and repeated in every login
/// request of the session, including recovery logins.
pub fn generate_isid() -> [u8; 6] {
    let mut isid = [0u8; 6];
    rand::rng().fill(&mut isid);
    isid[0] &= 0x3F;
    isid
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn isid_is_oui_format() {
        for _ in 0..32 {
            let isid = generate_isid();
            assert_eq!(isid[0] & 0xC0, 0, "top bits must be clear");
            let hex = hex::encode(isid);
            assert_eq!(hex.len(), 12);
            assert_eq!(hex::decode(&hex).expect("round-trip"), isid);
        }
    }
}
