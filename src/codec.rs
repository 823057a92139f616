/*
 * Copyright (c) 2025 sh0rch <sh0rch@iwl.dev>
 *
 * This file is part of udp_wgobfs.
 *
 * Licensed under the MIT License. See LICENSE file in the project root for full license information.
 */

/*!
 * # Packet codec for the obfuscated WireGuard framing
 *
 * This module provides the pure, I/O-free transforms between plaintext
 * WireGuard datagrams and their obfuscated wire form: a length-keyed XOR
 * scramble, a randomised type byte and variable dummy padding.
 *
 * ## Main Functions
 * - [`encode`]: Obfuscates a WireGuard datagram in-place, randomising the
 *   type word and appending dummy padding before the scramble.
 * - [`decode`]: Reverses the obfuscation, detecting version-0 peers that
 *   use the bare scramble without randomisation.
 *
 * All transforms operate in place on a caller-owned buffer; the caller
 * passes and receives explicit lengths.
 */

use rand::Rng;

/// Current obfuscation version.
pub const OBFUSCATION_VERSION: u8 = 1;

/// Hard cap on the total datagram length after dummy padding.
pub const MAX_DUMMY_TOTAL: usize = 1024;

/// Exclusive upper bound on dummy padding for handshake-class packets.
pub const MAX_DUMMY_HANDSHAKE: usize = 512;

/// WireGuard packet types, i.e. the first 32-bit little-endian word of a
/// plaintext datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WgType {
    Handshake,
    HandshakeResp,
    Cookie,
    Data,
}

/// Result of a successful [`decode`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decoded {
    /// Length of the restored plaintext datagram.
    pub length: usize,
    /// Obfuscation version the sender used.
    pub version: u8,
}

/// Reads the WireGuard packet type from the first four bytes of `data`.
///
/// Returns `None` when the buffer is shorter than four bytes or the type
/// word is outside `1..=4`.
#[inline]
pub fn wg_packet_type(data: &[u8]) -> Option<WgType> {
    if data.len() < 4 {
        return None;
    }
    match u32::from_le_bytes([data[0], data[1], data[2], data[3]]) {
        1 => Some(WgType::Handshake),
        2 => Some(WgType::HandshakeResp),
        3 => Some(WgType::Cookie),
        4 => Some(WgType::Data),
        _ => None,
    }
}

/// Checks whether `data` looks obfuscated.
///
/// A datagram whose first 32-bit little-endian word is a valid WireGuard
/// type is deemed plaintext; everything else is deemed obfuscated. This
/// heuristic is the only classifier on the wire.
#[inline]
pub fn is_obfuscated(data: &[u8]) -> bool {
    wg_packet_type(data).is_none()
}

/// XORs `buffer` with a keystream derived from the key and the total length.
///
/// For each index a one-byte seed `key[i % key_len] + len + key_len`
/// (wrapping) is folded through eight rounds of the reflected CRC-8
/// polynomial `0x8C`; the CRC state persists across indices and each
/// resulting state byte is XORed into the data. The keystream depends only
/// on the key and the buffer length, so the transform is its own inverse
/// at a fixed length.
pub fn xor_scramble(buffer: &mut [u8], key: &[u8]) {
    let length = buffer.len() as u8;
    let key_length = key.len() as u8;
    let mut crc: u8 = 0;
    for (i, byte) in buffer.iter_mut().enumerate() {
        let mut inbyte = key[i % key.len()].wrapping_add(length).wrapping_add(key_length);
        for _ in 0..8 {
            let mix = (crc ^ inbyte) & 0x01;
            crc >>= 1;
            if mix != 0 {
                crc ^= 0x8C;
            }
            inbyte >>= 1;
        }
        *byte ^= crc;
    }
}

/// Obfuscates a WireGuard datagram in-place.
///
/// For version 1 the first byte is XORed with a random byte `r ∈ [1,255]`
/// which is stored in the second byte, destroying the constant type word,
/// and dummy padding is appended: up to [`MAX_DUMMY_HANDSHAKE`] bytes for
/// handshake-class packets, up to `max_dummy_data` for cookie and data
/// packets, clamped so the padded length never exceeds [`MAX_DUMMY_TOTAL`].
/// The padding length is recorded little-endian in bytes 2–3 (always zero
/// in plaintext WireGuard). Finally the whole datagram is scrambled at its
/// padded length. Version 0 applies the bare scramble only.
///
/// # Arguments
/// * `buffer` - Datagram buffer, at least `length + MAX_DUMMY_TOTAL` bytes
///   of capacity for packets shorter than [`MAX_DUMMY_TOTAL`].
/// * `length` - Length of the plaintext datagram (≥ 4).
/// * `key` - XOR key, 1..=255 bytes.
/// * `version` - Obfuscation version negotiated for this peer.
/// * `max_dummy_data` - Configured padding cap for data packets; 0 disables.
/// * `rng` - Random source for the type byte and padding lengths.
///
/// # Returns
/// The new (padded) datagram length.
pub fn encode(
    buffer: &mut [u8],
    length: usize,
    key: &[u8],
    version: u8,
    max_dummy_data: usize,
    rng: &mut impl Rng,
) -> usize {
    let mut length = length;
    if version >= 1 {
        let packet_type = wg_packet_type(&buffer[..length]);
        let rnd: u8 = rng.random_range(1..=255);
        buffer[0] ^= rnd;
        buffer[1] = rnd;
        if length < MAX_DUMMY_TOTAL {
            let mut dummy_length = match packet_type {
                Some(WgType::Handshake) | Some(WgType::HandshakeResp) => {
                    rng.random_range(0..MAX_DUMMY_HANDSHAKE)
                }
                Some(WgType::Cookie) | Some(WgType::Data) if max_dummy_data > 0 => {
                    rng.random_range(0..max_dummy_data)
                }
                _ => 0,
            };
            if length + dummy_length > MAX_DUMMY_TOTAL {
                dummy_length = MAX_DUMMY_TOTAL - length;
            }
            buffer[2..4].copy_from_slice(&(dummy_length as u16).to_le_bytes());
            if dummy_length > 0 {
                buffer[length..length + dummy_length].fill(0xFF);
                length += dummy_length;
            }
        }
    }

    xor_scramble(&mut buffer[..length], key);
    length
}

/// Restores an obfuscated datagram in-place.
///
/// The scramble is undone at the received length first. If the result
/// already carries a valid WireGuard type word the sender used version 0
/// and the datagram is returned unchanged. Otherwise the randomised type
/// byte is restored from byte 1 and the dummy padding recorded in bytes
/// 2–3 is stripped; bytes 1–3 are zeroed back to their plaintext form.
///
/// # Returns
/// * `Some(Decoded)` - The restored length and the sender's version.
/// * `None` - The recorded padding does not fit the received length
///   (decoded length outside `[4, length]`); the buffer contents are
///   unspecified and the packet must be dropped.
pub fn decode(buffer: &mut [u8], length: usize, key: &[u8]) -> Option<Decoded> {
    xor_scramble(&mut buffer[..length], key);

    if !is_obfuscated(&buffer[..length]) {
        // Bare scramble without the randomisation byte: an old peer.
        return Some(Decoded { length, version: 0 });
    }

    buffer[0] ^= buffer[1];
    buffer[1] = 0;
    let dummy_length = u16::from_le_bytes([buffer[2], buffer[3]]) as usize;
    buffer[2] = 0;
    buffer[3] = 0;
    if dummy_length > length || length - dummy_length < 4 {
        return None;
    }
    Some(Decoded { length: length - dummy_length, version: OBFUSCATION_VERSION })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::SmallRng;
    use rand::SeedableRng;

    fn payload(wg_type: u8, extra: usize) -> Vec<u8> {
        let mut p = vec![wg_type, 0, 0, 0];
        p.extend((0..extra).map(|i| (i * 7) as u8));
        p
    }

    /// The scramble keystream depends only on key and length, so applying
    /// it twice at the same length must restore the input.
    #[test]
    fn test_scramble_is_involution() {
        let key = b"secretkey";
        let orig = payload(4, 60);
        let mut buf = orig.clone();
        xor_scramble(&mut buf, key);
        assert_ne!(buf, orig);
        xor_scramble(&mut buf, key);
        assert_eq!(buf, orig);
    }

    #[test]
    fn test_obfuscation_marker() {
        assert!(!is_obfuscated(&[0x01, 0x00, 0x00, 0x00]));
        assert!(!is_obfuscated(&[0x02, 0x00, 0x00, 0x00]));
        assert!(!is_obfuscated(&[0x03, 0x00, 0x00, 0x00]));
        assert!(!is_obfuscated(&[0x04, 0x00, 0x00, 0x00]));
        assert!(is_obfuscated(&[0x00, 0x00, 0x00, 0x00]));
        assert!(is_obfuscated(&[0x05, 0x00, 0x00, 0x00]));
        assert!(is_obfuscated(&[0x01, 0x01, 0x00, 0x00]));
        assert!(is_obfuscated(&[0x01, 0x00, 0x00, 0x80]));
    }

    #[test]
    fn test_wg_packet_type() {
        assert_eq!(wg_packet_type(&[0x01, 0, 0, 0]), Some(WgType::Handshake));
        assert_eq!(wg_packet_type(&[0x02, 0, 0, 0]), Some(WgType::HandshakeResp));
        assert_eq!(wg_packet_type(&[0x03, 0, 0, 0]), Some(WgType::Cookie));
        assert_eq!(wg_packet_type(&[0x04, 0, 0, 0]), Some(WgType::Data));
        assert_eq!(wg_packet_type(&[0x05, 0, 0, 0]), None);
        assert_eq!(wg_packet_type(&[0x01, 0, 0]), None);
    }

    /// Round-trips every packet type through encode/decode with a seeded
    /// generator and checks that the plaintext is restored exactly.
    #[test]
    fn test_encode_decode_round_trip() {
        let key = b"abc";
        let mut rng = SmallRng::seed_from_u64(42);
        for wg_type in 1..=4u8 {
            for extra in [0usize, 1, 28, 60, 144] {
                let orig = payload(wg_type, extra);
                let mut buf = vec![0u8; 2048];
                buf[..orig.len()].copy_from_slice(&orig);

                let enc_len =
                    encode(&mut buf, orig.len(), key, OBFUSCATION_VERSION, 4, &mut rng);
                assert!(enc_len >= orig.len());
                assert!(is_obfuscated(&buf[..enc_len]), "encoded packet must not look like WireGuard");

                let decoded = decode(&mut buf, enc_len, key).expect("decode failed");
                assert_eq!(decoded.version, OBFUSCATION_VERSION);
                assert_eq!(decoded.length, orig.len());
                assert_eq!(&buf[..decoded.length], &orig[..]);
            }
        }
    }

    /// A version-0 peer applies the bare scramble; the receiver must
    /// classify it as version 0 and return the datagram verbatim.
    #[test]
    fn test_decode_version0() {
        let key = b"abc";
        let orig = payload(1, 12);
        let mut buf = orig.clone();
        xor_scramble(&mut buf, key);
        assert!(is_obfuscated(&buf));

        let decoded = decode(&mut buf, orig.len(), key).expect("decode failed");
        assert_eq!(decoded.version, 0);
        assert_eq!(decoded.length, orig.len());
        assert_eq!(buf, orig);
    }

    /// Handshake packets take up to MAX_DUMMY_HANDSHAKE padding, data
    /// packets are bounded by the configured cap.
    #[test]
    fn test_dummy_length_bounds() {
        let key = b"k";
        let mut rng = SmallRng::seed_from_u64(7);
        for _ in 0..50 {
            let orig = payload(1, 100);
            let mut buf = vec![0u8; 2048];
            buf[..orig.len()].copy_from_slice(&orig);
            let enc_len = encode(&mut buf, orig.len(), key, 1, 4, &mut rng);
            assert!(enc_len - orig.len() < MAX_DUMMY_HANDSHAKE);
        }
        for _ in 0..50 {
            let orig = payload(4, 60);
            let mut buf = vec![0u8; 2048];
            buf[..orig.len()].copy_from_slice(&orig);
            let enc_len = encode(&mut buf, orig.len(), key, 1, 4, &mut rng);
            assert!(enc_len - orig.len() < 4);
        }
        // max-dummy = 0 disables data-packet padding entirely
        let orig = payload(4, 60);
        let mut buf = vec![0u8; 2048];
        buf[..orig.len()].copy_from_slice(&orig);
        let enc_len = encode(&mut buf, orig.len(), key, 1, 0, &mut rng);
        assert_eq!(enc_len, orig.len());
    }

    /// Padding is clamped so the padded datagram never exceeds
    /// MAX_DUMMY_TOTAL, and packets already at or past the cap are only
    /// scrambled and randomised, never padded.
    #[test]
    fn test_dummy_clamp_and_oversize() {
        let key = b"clamp";
        let mut rng = SmallRng::seed_from_u64(9);
        for _ in 0..50 {
            let orig = payload(1, 1016); // 1020 bytes, 4 below the cap
            let mut buf = vec![0u8; 4096];
            buf[..orig.len()].copy_from_slice(&orig);
            let enc_len = encode(&mut buf, orig.len(), key, 1, 4, &mut rng);
            assert!(enc_len <= MAX_DUMMY_TOTAL);
            let decoded = decode(&mut buf, enc_len, key).expect("decode failed");
            assert_eq!(decoded.length, orig.len());
            assert_eq!(&buf[..decoded.length], &orig[..]);
        }

        let orig = payload(4, 1496); // 1500 bytes, past the cap
        let mut buf = vec![0u8; 4096];
        buf[..orig.len()].copy_from_slice(&orig);
        let enc_len = encode(&mut buf, orig.len(), key, 1, 4, &mut rng);
        assert_eq!(enc_len, orig.len());
        let decoded = decode(&mut buf, enc_len, key).expect("decode failed");
        assert_eq!(decoded.length, orig.len());
        assert_eq!(&buf[..decoded.length], &orig[..]);
    }

    /// A recorded dummy length that does not fit the received datagram is
    /// a decode failure, not a short packet.
    #[test]
    fn test_decode_rejects_bad_dummy_length() {
        let key = b"abc";
        // Craft the post-scramble image by hand: randomised type byte and
        // an impossible dummy length, then scramble once so decode's own
        // scramble pass restores it.
        let mut buf = vec![0u8; 16];
        buf[0] = 0x01 ^ 0x55;
        buf[1] = 0x55;
        buf[2..4].copy_from_slice(&u16::to_le_bytes(0xFFFF));
        xor_scramble(&mut buf, key);
        assert!(decode(&mut buf, 16, key).is_none());

        // Dummy length that would leave fewer than 4 bytes.
        let mut buf = vec![0u8; 16];
        buf[0] = 0x01 ^ 0x55;
        buf[1] = 0x55;
        buf[2..4].copy_from_slice(&u16::to_le_bytes(13));
        xor_scramble(&mut buf, key);
        assert!(decode(&mut buf, 16, key).is_none());
    }

    /// Reference vector: key "abc", payload `01 00 00 00 DE AD BE EF`,
    /// randomisation byte 0x7F, no padding.
    #[test]
    fn test_reference_vector_handshake() {
        let key = b"abc";
        let orig = [0x01u8, 0x00, 0x00, 0x00, 0xDE, 0xAD, 0xBE, 0xEF];
        // Encoded image for r = 0x7F, dummy_length = 0.
        let mut buf = [0x01 ^ 0x7F, 0x7F, 0x00, 0x00, 0xDE, 0xAD, 0xBE, 0xEF];
        xor_scramble(&mut buf, key);
        assert!(is_obfuscated(&buf));

        let decoded = decode(&mut buf, 8, key).expect("decode failed");
        assert_eq!(decoded.version, 1);
        assert_eq!(decoded.length, 8);
        assert_eq!(buf, orig);
    }

    /// Reference vector: 64-byte data packet with max-dummy = 4 encodes to
    /// at most 67 bytes and restores exactly.
    #[test]
    fn test_reference_vector_data() {
        let key = b"abc";
        let mut rng = SmallRng::seed_from_u64(3);
        let mut orig = vec![0x04u8, 0x00, 0x00, 0x00];
        orig.extend(std::iter::repeat(0x00).take(60));
        for _ in 0..20 {
            let mut buf = vec![0u8; 256];
            buf[..64].copy_from_slice(&orig);
            let enc_len = encode(&mut buf, 64, key, 1, 4, &mut rng);
            assert!((64..68).contains(&enc_len));
            let decoded = decode(&mut buf, enc_len, key).expect("decode failed");
            assert_eq!(decoded.length, 64);
            assert_eq!(&buf[..4], &[0x04, 0x00, 0x00, 0x00]);
            assert_eq!(&buf[..64], &orig[..]);
        }
    }

    /// Version must never upgrade: decode reports what the peer sent and
    /// the caller keeps the minimum.
    #[test]
    fn test_version_reporting() {
        let key = b"xyz";
        let mut rng = SmallRng::seed_from_u64(1);

        let mut buf = vec![0u8; 2048];
        let orig = payload(4, 20);
        buf[..orig.len()].copy_from_slice(&orig);
        let enc_len = encode(&mut buf, orig.len(), key, 1, 4, &mut rng);
        assert_eq!(decode(&mut buf, enc_len, key).unwrap().version, 1);

        let mut buf = orig.clone();
        let enc_len = encode(&mut buf, orig.len(), key, 0, 4, &mut rng);
        assert_eq!(enc_len, orig.len());
        assert_eq!(decode(&mut buf, enc_len, key).unwrap().version, 0);
    }
}
