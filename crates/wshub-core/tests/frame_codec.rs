//! Integration tests for the wshub-core frame codec and handshake.
//!
//! These tests exercise the public API the same way the server does: encode
//! server frames, decode (masked) client frames, and derive the accept key.

use wshub_core::protocol::frame::{apply_mask, Frame, FrameError};
use wshub_core::protocol::handshake::compute_accept_key;
use wshub_core::{decode_frame, encode_frame, peek_header, Opcode};

/// Deterministic, non-repeating payload so an off-by-one shows up as a diff.
fn payload_of(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

#[test]
fn test_round_trip_covers_all_length_tiers() {
    // 0/10/125 inline, 126 16-bit, 65536/70000 64-bit
    for len in [0usize, 10, 125, 126, 65_536, 70_000] {
        let payload = payload_of(len);

        let bytes = encode_frame(&payload, Opcode::Text);
        let (frame, consumed) = decode_frame(&bytes).expect("decode must succeed");

        assert_eq!(consumed, bytes.len(), "len {len}: all bytes consumed");
        assert_eq!(frame.opcode, Opcode::Text);
        assert!(frame.fin);
        assert_eq!(frame.payload, payload, "len {len}: payload must survive");
    }
}

#[test]
fn test_masked_frame_decodes_to_xor_of_key() {
    let key = [0x12, 0x34, 0x56, 0x78];
    let plain = payload_of(37);

    // Build the wire bytes by hand: header, key, then P[i] ^ K[i % 4].
    let mut wire = vec![0x81, 0x80 | plain.len() as u8];
    wire.extend_from_slice(&key);
    wire.extend(plain.iter().enumerate().map(|(i, b)| b ^ key[i % 4]));

    let (frame, _) = decode_frame(&wire).unwrap();

    assert_eq!(frame.mask_key, Some(key));
    for (i, byte) in frame.payload.iter().enumerate() {
        assert_eq!(*byte, wire[6 + i] ^ key[i % 4], "byte {i}");
    }
    assert_eq!(frame.payload, plain);
}

#[test]
fn test_masked_large_frame_uses_extended_length_and_mask() {
    let payload = payload_of(70_000);
    let frame = Frame::new(Opcode::Binary, payload.clone()).masked([1, 2, 3, 4]);

    let bytes = frame.to_bytes();
    let header = peek_header(&bytes).unwrap().expect("complete header");

    // 2 + 8 (64-bit length) + 4 (mask)
    assert_eq!(header.header_len, 14);
    assert_eq!(header.frame_len(), Some(bytes.len()));

    let (decoded, _) = decode_frame(&bytes).unwrap();
    assert_eq!(decoded.payload, payload);
}

#[test]
fn test_incremental_header_discovery() {
    let bytes = Frame::new(Opcode::Text, payload_of(500))
        .masked([5, 6, 7, 8])
        .to_bytes();

    // Feed the bytes one at a time; the size is known exactly once the
    // header (2 + 2 + 4 bytes) is complete.
    for end in 0..8 {
        assert_eq!(peek_header(&bytes[..end]).unwrap(), None, "prefix {end}");
    }
    let header = peek_header(&bytes[..8]).unwrap().unwrap();
    assert_eq!(header.frame_len(), Some(bytes.len()));

    // Anything short of the full frame is a length mismatch for decode.
    assert!(matches!(
        decode_frame(&bytes[..bytes.len() - 1]),
        Err(FrameError::PayloadLengthMismatch { declared: 500, .. })
    ));
}

#[test]
fn test_apply_mask_matches_manual_xor() {
    let key = [0xAA, 0x55, 0x0F, 0xF0];
    let mut data = payload_of(9);
    let expected: Vec<u8> = data.iter().enumerate().map(|(i, b)| b ^ key[i % 4]).collect();
    apply_mask(&mut data, key);
    assert_eq!(data, expected);
}

#[test]
fn test_handshake_reference_vector() {
    assert_eq!(
        compute_accept_key("dGhlIHNhbXBsZSBub25jZQ=="),
        "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
    );
}
