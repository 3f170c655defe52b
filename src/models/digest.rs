// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! CRC32C digests over header and data segments (RFC 7143 §13.1).
//!
//! Digest computation is deterministic; the data digest covers the data
//! segment plus its 0–3 pad bytes, the header digest covers the 48-byte
//! BHS alone (this core sends no AHS).

use crc32c::crc32c_append;

use crate::models::common::{HEADER_LEN, pad4};

#[inline]
fn crc32c_with_padding(parts: &[&[u8]], pad: usize) -> u32 {
    let mut acc = 0u32;
    for p in parts {
        if !p.is_empty() {
            acc = crc32c_append(acc, p);
        }
    }
    if pad != 0 {
        let zeros = [0u8; 3];
        acc = crc32c_append(acc, &zeros[..pad]);
    }
    acc
}

/// Digest trailing the BHS when HeaderDigest=CRC32C is in effect.
#[inline]
pub fn header_digest(bhs: &[u8; HEADER_LEN]) -> u32 {
    crc32c_with_padding(&[bhs], 0)
}

/// Digest trailing data+pad when DataDigest=CRC32C is in effect.
#[inline]
pub fn data_digest(data: &[u8]) -> u32 {
    crc32c_with_padding(&[data], pad4(data.len()))
}

/// Digest over two adjacent regions, used when the data segment is
/// assembled from separate parts.
#[inline]
pub fn data_digest_2(a: &[u8], b: &[u8]) -> u32 {
    crc32c_with_padding(&[a, b], pad4(a.len() + b.len()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_is_deterministic() {
        let data = b"some data segment";
        assert_eq!(data_digest(data), data_digest(data));
    }

    #[test]
    fn pad_participates_in_data_digest() {
        // 4-aligned payload digests identically with or without explicit pad.
        let aligned = [0xAAu8; 8];
        assert_eq!(data_digest(&aligned), data_digest_2(&aligned[..4], &aligned[4..]));

        // Unaligned payload digest must equal digest of payload + zeros.
        let unaligned = [0x55u8; 5];
        let mut padded = unaligned.to_vec();
        padded.extend_from_slice(&[0, 0, 0]);
        assert_eq!(data_digest(&unaligned), crc32c::crc32c(&padded));
    }
}
