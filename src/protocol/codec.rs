//! SSGSCP datagram packing, parsing and authentication.
//!
//! Wire layout (all multi-byte integers big-endian):
//! ```text
//! Offset  Size  Field
//!  0      6     Magic "SSGSCP"
//!  6      8     IV (random; extended to 16 bytes with zeros for AES-CTR)
//! 14      4     Gateway UID                      -- unencrypted header ends
//! 18      N     Encrypted portion (AES-256-CTR), N >= 8, N % 4 == 0
//! ```
//!
//! Encrypted portion plaintext, zero-padded to a multiple of 4:
//! ```text
//!  0   1  packet type
//!  1   4  auth tag literal {0x00, 0x01, 0x02, 0x03}
//!  5   2  packet ID
//!  7   1  payload length L
//!  8   L  payload
//! ```
//!
//! The fixed known-plaintext auth tag under CTR provides integrity against
//! random corruption only, not against an adversary holding the key. It is
//! the on-wire authentication primitive of deployed gateway firmware and
//! must not be swapped for an AEAD without a protocol revision.

use aes::cipher::{KeyIvInit, StreamCipher};
use thiserror::Error;

use super::{GatewayUid, Key, PacketType, PAYLOAD_MAX_LEN};

type Aes256Ctr = ctr::Ctr128BE<aes::Aes256>;

/// Protocol magic prefixing every datagram.
pub const MAGIC: &[u8; 6] = b"SSGSCP";

/// IV bytes carried on the wire.
const WIRE_IV_LEN: usize = 8;

/// Length of the unencrypted header (magic + IV + UID).
pub const HEADER_LEN: usize = 18;

/// Fixed plaintext literal verified after decryption.
const AUTH_TAG: [u8; 4] = [0x00, 0x01, 0x02, 0x03];

/// Smallest valid datagram: header plus an empty padded body.
pub const MIN_DATAGRAM_LEN: usize = HEADER_LEN + 8;

/// Largest valid datagram: header plus a padded 255-byte payload.
pub const MAX_DATAGRAM_LEN: usize = HEADER_LEN + 264;

/// A logical SSGSCP packet.
///
/// `packet_type` is kept as the raw wire byte so that dispatch can report
/// protocol violations instead of losing them at the parse boundary; use
/// [`PacketType::from_wire`] to classify it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub packet_type: u8,
    pub uid: GatewayUid,
    pub packet_id: u16,
    pub payload: Vec<u8>,
}

impl Packet {
    pub fn new(kind: PacketType, uid: GatewayUid, packet_id: u16, payload: Vec<u8>) -> Self {
        Packet {
            packet_type: kind as u8,
            uid,
            packet_id,
            payload,
        }
    }
}

/// Result of parsing an inbound datagram.
#[derive(Debug)]
pub enum ParseOutcome {
    /// Too short or bad magic. Not addressable, dropped silently.
    Malformed,
    /// Decrypted but the auth tag did not match. The claimed UID is
    /// reported so the server can address a CONNFAIL.
    AuthFailed { uid: GatewayUid },
    /// Authenticated packet.
    Ok(Packet),
}

/// Errors packing an outbound packet.
#[derive(Debug, Error)]
pub enum PackError {
    #[error("payload too long: {0} bytes (max {})", PAYLOAD_MAX_LEN)]
    PayloadTooLong(usize),
    #[error("system randomness unavailable: {0}")]
    Rng(getrandom::Error),
}

/// Extend the 8 wire IV bytes to a full AES block by right-padding zeros.
fn full_iv(wire_iv: &[u8]) -> [u8; 16] {
    let mut iv = [0u8; 16];
    iv[..WIRE_IV_LEN].copy_from_slice(wire_iv);
    iv
}

/// Pack a packet into a wire datagram under `key`.
///
/// A fresh random IV is drawn per call. Output length is
/// `18 + ceil((8 + L) / 4) * 4` for a payload of L bytes.
pub fn pack(packet: &Packet, key: &Key) -> Result<Vec<u8>, PackError> {
    if packet.payload.len() > PAYLOAD_MAX_LEN {
        return Err(PackError::PayloadTooLong(packet.payload.len()));
    }

    let mut wire_iv = [0u8; WIRE_IV_LEN];
    getrandom::getrandom(&mut wire_iv).map_err(PackError::Rng)?;

    // Plaintext body, zero-padded to the next multiple of 4.
    let body_len = 8 + packet.payload.len();
    let padded_len = (body_len + 3) & !3;
    let mut body = Vec::with_capacity(padded_len);
    body.push(packet.packet_type);
    body.extend_from_slice(&AUTH_TAG);
    body.extend_from_slice(&packet.packet_id.to_be_bytes());
    body.push(packet.payload.len() as u8);
    body.extend_from_slice(&packet.payload);
    body.resize(padded_len, 0);

    let iv = full_iv(&wire_iv);
    let mut cipher = Aes256Ctr::new(key.into(), &iv.into());
    cipher.apply_keystream(&mut body);

    let mut datagram = Vec::with_capacity(HEADER_LEN + padded_len);
    datagram.extend_from_slice(MAGIC);
    datagram.extend_from_slice(&wire_iv);
    datagram.extend_from_slice(packet.uid.as_bytes());
    datagram.extend_from_slice(&body);
    Ok(datagram)
}

/// Parse and authenticate a wire datagram under `key`.
///
/// The payload is truncated to the declared length regardless of any
/// remaining padding bytes (and clamped to what the datagram carries).
pub fn parse(datagram: &[u8], key: &Key) -> ParseOutcome {
    if datagram.len() < MIN_DATAGRAM_LEN || &datagram[..MAGIC.len()] != MAGIC {
        return ParseOutcome::Malformed;
    }

    let uid = GatewayUid([datagram[14], datagram[15], datagram[16], datagram[17]]);

    let iv = full_iv(&datagram[6..14]);
    let mut body = datagram[HEADER_LEN..].to_vec();
    let mut cipher = Aes256Ctr::new(key.into(), &iv.into());
    cipher.apply_keystream(&mut body);

    if body[1..5] != AUTH_TAG {
        return ParseOutcome::AuthFailed { uid };
    }

    let packet_type = body[0];
    let packet_id = u16::from_be_bytes([body[5], body[6]]);
    let declared_len = body[7] as usize;
    let payload_end = (8 + declared_len).min(body.len());
    let payload = body[8..payload_end].to_vec();

    ParseOutcome::Ok(Packet {
        packet_type,
        uid,
        packet_id,
        payload,
    })
}

/// Extract the gateway UID from the unencrypted header.
///
/// Checks magic and length only; no decryption is performed.
pub fn parse_uid(datagram: &[u8]) -> Option<GatewayUid> {
    if datagram.len() < HEADER_LEN || &datagram[..MAGIC.len()] != MAGIC {
        return None;
    }
    GatewayUid::from_bytes(&datagram[14..HEADER_LEN])
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_UID: GatewayUid = GatewayUid([0xAA, 0xBB, 0xCC, 0xDD]);

    fn test_key() -> Key {
        [0x11; 32]
    }

    fn must_parse(datagram: &[u8], key: &Key) -> Packet {
        match parse(datagram, key) {
            ParseOutcome::Ok(packet) => packet,
            other => panic!("expected Ok, got {:?}", other),
        }
    }

    #[test]
    fn test_pack_parse_roundtrip() {
        let key = test_key();
        let packet = Packet::new(PacketType::MsgStatus, TEST_UID, 0x1234, vec![9, 8, 7]);
        let datagram = pack(&packet, &key).unwrap();

        let parsed = must_parse(&datagram, &key);
        assert_eq!(parsed.packet_type, PacketType::MsgStatus as u8);
        assert_eq!(parsed.uid, TEST_UID);
        assert_eq!(parsed.packet_id, 0x1234);
        assert_eq!(parsed.payload, vec![9, 8, 7]);
    }

    #[test]
    fn test_roundtrip_empty_payload() {
        let key = test_key();
        let packet = Packet::new(PacketType::Conn, TEST_UID, 0, Vec::new());
        let datagram = pack(&packet, &key).unwrap();
        assert_eq!(datagram.len(), MIN_DATAGRAM_LEN);

        let parsed = must_parse(&datagram, &key);
        assert!(parsed.payload.is_empty());
        assert_eq!(parsed.packet_id, 0);
    }

    #[test]
    fn test_roundtrip_max_payload() {
        let key = test_key();
        let payload: Vec<u8> = (0..255u8).collect();
        let packet = Packet::new(PacketType::MsgConf, TEST_UID, 65535, payload.clone());
        let datagram = pack(&packet, &key).unwrap();
        assert_eq!(datagram.len(), MAX_DATAGRAM_LEN);

        let parsed = must_parse(&datagram, &key);
        assert_eq!(parsed.payload, payload);
        assert_eq!(parsed.packet_id, 65535);
    }

    #[test]
    fn test_padding_invariant() {
        let key = test_key();
        for len in [0usize, 1, 3, 4, 5, 8, 100, 255] {
            let packet = Packet::new(PacketType::MsgStatus, TEST_UID, 7, vec![0xAB; len]);
            let datagram = pack(&packet, &key).unwrap();
            assert_eq!(datagram.len(), HEADER_LEN + (8 + len + 3) / 4 * 4, "len {}", len);
        }
    }

    #[test]
    fn test_payload_too_long() {
        let packet = Packet::new(PacketType::MsgConf, TEST_UID, 0, vec![0; 256]);
        assert!(matches!(
            pack(&packet, &test_key()),
            Err(PackError::PayloadTooLong(256))
        ));
    }

    #[test]
    fn test_parse_too_short() {
        let key = test_key();
        assert!(matches!(parse(b"SSGSCP", &key), ParseOutcome::Malformed));
        // Valid magic, header present, but body shorter than the minimum.
        let mut datagram = Vec::from(*MAGIC);
        datagram.extend_from_slice(&[0; 12 + 4]);
        assert!(matches!(parse(&datagram, &key), ParseOutcome::Malformed));
    }

    #[test]
    fn test_parse_bad_magic() {
        let key = test_key();
        let packet = Packet::new(PacketType::Conn, TEST_UID, 0, Vec::new());
        let mut datagram = pack(&packet, &key).unwrap();
        datagram[0] ^= 0xFF;
        assert!(matches!(parse(&datagram, &key), ParseOutcome::Malformed));
        assert_eq!(parse_uid(&datagram), None);
    }

    #[test]
    fn test_parse_uid_without_key() {
        let packet = Packet::new(PacketType::Conn, TEST_UID, 0, Vec::new());
        let datagram = pack(&packet, &test_key()).unwrap();
        assert_eq!(parse_uid(&datagram), Some(TEST_UID));
    }

    #[test]
    fn test_auth_tag_corruption() {
        let key = test_key();
        let packet = Packet::new(PacketType::MsgStatus, TEST_UID, 3, vec![1, 2, 3, 4]);
        let datagram = pack(&packet, &key).unwrap();

        // Flipping any of the four tag bytes in the ciphertext flips the
        // same plaintext bit under CTR, so the check fails with certainty.
        for offset in HEADER_LEN + 1..HEADER_LEN + 5 {
            let mut corrupted = datagram.clone();
            corrupted[offset] ^= 0x01;
            match parse(&corrupted, &key) {
                ParseOutcome::AuthFailed { uid } => assert_eq!(uid, TEST_UID),
                other => panic!("expected AuthFailed at offset {}, got {:?}", offset, other),
            }
        }
    }

    #[test]
    fn test_wrong_key_fails_auth() {
        let packet = Packet::new(PacketType::MsgStatus, TEST_UID, 3, vec![1, 2, 3]);
        let datagram = pack(&packet, &test_key()).unwrap();
        let wrong_key: Key = [0x22; 32];
        assert!(matches!(
            parse(&datagram, &wrong_key),
            ParseOutcome::AuthFailed { .. }
        ));
    }

    #[test]
    fn test_payload_truncated_to_declared_length() {
        let key = test_key();
        // A 1-byte payload pads the body to 12 bytes; the 3 padding bytes
        // must not leak into the parsed payload.
        let packet = Packet::new(PacketType::MsgStatus, TEST_UID, 9, vec![0x5A]);
        let datagram = pack(&packet, &key).unwrap();
        assert_eq!(datagram.len(), HEADER_LEN + 12);
        assert_eq!(must_parse(&datagram, &key).payload, vec![0x5A]);
    }

    #[test]
    fn test_declared_length_clamped_to_datagram() {
        let key = test_key();
        // Hand-build a body claiming 200 payload bytes while carrying 4.
        let mut body = vec![PacketType::MsgStatus as u8];
        body.extend_from_slice(&AUTH_TAG);
        body.extend_from_slice(&42u16.to_be_bytes());
        body.push(200);
        body.extend_from_slice(&[1, 2, 3, 4]);

        let wire_iv = [7u8; WIRE_IV_LEN];
        let iv = full_iv(&wire_iv);
        let mut cipher = Aes256Ctr::new((&key).into(), &iv.into());
        cipher.apply_keystream(&mut body);

        let mut datagram = Vec::from(*MAGIC);
        datagram.extend_from_slice(&wire_iv);
        datagram.extend_from_slice(TEST_UID.as_bytes());
        datagram.extend_from_slice(&body);

        let parsed = must_parse(&datagram, &key);
        assert_eq!(parsed.packet_id, 42);
        assert_eq!(parsed.payload, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_fresh_iv_per_pack() {
        let key = test_key();
        let packet = Packet::new(PacketType::Conn, TEST_UID, 0, Vec::new());
        let a = pack(&packet, &key).unwrap();
        let b = pack(&packet, &key).unwrap();
        assert_ne!(a[6..14], b[6..14], "IV must be fresh per pack");
    }
}
