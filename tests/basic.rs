use wsgate::error::{CloseCode, ProtocolError};
use wsgate::frame::{self, CloseFrame, Decoded, Frame};
use wsgate::handshake;
use wsgate::opcode::Opcode;
use wsgate::security::token_fingerprint;

#[test]
fn frame_encode_decode_roundtrip() {
    let frame = Frame::binary(vec![7u8; 300]);

    let encoded = frame::encode(&frame, true);
    assert!(encoded.is_ok());

    let encoded = encoded.unwrap();
    assert_eq!(encoded[1] & 0x7f, 126);

    let decoded = frame::decode(&encoded);
    assert!(decoded.is_ok());

    match decoded.unwrap() {
        Decoded::Complete { frame: decoded, consumed } => {
            assert_eq!(consumed, encoded.len());
            assert!(decoded.fin);
            assert_eq!(decoded.opcode, Opcode::Binary);
            assert_eq!(decoded.payload, frame.payload);
        }
        Decoded::Incomplete => panic!("expected a complete frame"),
    }
}

#[test]
fn rfc_single_frame_unmasked_text() {
    let encoded = frame::encode(&Frame::text("Hello"), false).unwrap();
    assert_eq!(encoded, [0x81, 0x05, 0x48, 0x65, 0x6c, 0x6c, 0x6f]);
}

#[test]
fn rfc_single_frame_masked_text() {
    let bytes = [0x81, 0x85, 0x37, 0xfa, 0x21, 0x3d, 0x7f, 0x9f, 0x4d, 0x51, 0x58];

    match frame::decode(&bytes).unwrap() {
        Decoded::Complete { frame, .. } => {
            assert_eq!(frame.mask, Some([0x37, 0xfa, 0x21, 0x3d]));
            assert_eq!(frame.as_text().unwrap(), "Hello");
        }
        Decoded::Incomplete => panic!("expected a complete frame"),
    }
}

#[test]
fn truncated_frame_is_incomplete() {
    let encoded = frame::encode(&Frame::text("Hello"), true).unwrap();

    for len in 0..encoded.len() {
        let decoded = frame::decode(&encoded[..len]);
        assert_eq!(decoded, Ok(Decoded::Incomplete));
    }
}

#[test]
fn unknown_opcode_is_rejected() {
    let result = frame::decode(&[0x83, 0x00]);
    assert_eq!(result, Err(ProtocolError::InvalidOpcode(0x3)));
}

#[test]
fn oversized_64_bit_length_is_rejected() {
    let mut bytes = vec![0x82, 0x7f];
    bytes.extend_from_slice(&(1u64 << 32).to_be_bytes());

    let result = frame::decode(&bytes);
    assert!(result.is_err());
}

#[test]
fn close_frame_carries_code_and_reason() {
    let frame = Frame::close(CloseCode::GoingAway, "restart");
    assert_eq!(&frame.payload[..2], &1001u16.to_be_bytes());

    let close = CloseFrame::parse(&frame.payload).unwrap();
    assert_eq!(close.code, CloseCode::GoingAway);
    assert_eq!(close.reason, "restart");
}

#[test]
fn accept_key_matches_reference() {
    let accept = handshake::accept_key("dGhlIHNhbXBsZSBub25jZQ==");
    assert_eq!(accept, "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
}

#[test]
fn request_missing_key_is_rejected() {
    let request = b"GET /chat HTTP/1.1\r\n\
        Host: server.example.com\r\n\
        Upgrade: websocket\r\n\
        Connection: Upgrade\r\n\
        Sec-WebSocket-Version: 13\r\n\r\n";

    let result = handshake::parse_request(request);
    assert_eq!(result, Err(ProtocolError::MissingHeader("Sec-WebSocket-Key")));
}

#[test]
fn request_header_names_are_case_insensitive() {
    let request = b"GET /chat HTTP/1.1\r\n\
        host: server.example.com\r\n\
        upgrade: WebSocket\r\n\
        connection: keep-alive, upgrade\r\n\
        sec-websocket-key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
        sec-websocket-version: 13\r\n\r\n";

    let head = handshake::parse_request(request);
    assert!(head.is_ok());
    assert_eq!(head.unwrap().key, "dGhlIHNhbXBsZSBub25jZQ==");
}

#[test]
fn token_fingerprint_is_deterministic() {
    let fp1 = token_fingerprint("bearer-abc");
    let fp2 = token_fingerprint("bearer-abc");

    assert_eq!(fp1, fp2);
    assert_ne!(fp1, token_fingerprint("bearer-abd"));
}

#[test]
fn fragmented_control_frame_is_invalid() {
    let frame = Frame::ping(Vec::new()).with_fin(false);
    let result = frame.validate_control();
    assert!(result.is_err());
}
