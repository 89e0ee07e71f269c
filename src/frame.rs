//! Frame format and serialization.
//!
//! Pure functions over byte buffers; nothing here touches a socket.

use crate::error::{CloseCode, ProtocolError};
use crate::opcode::Opcode;

/// Largest possible header: 2 base bytes, 8 length bytes, 4 mask bytes.
pub const MAX_HEADER_LEN: usize = 14;
/// Control frames carry at most this many payload bytes.
pub const MAX_CONTROL_PAYLOAD: usize = 125;
/// Payloads are capped below 2^32 so the top four bytes of a 64-bit length are zero.
pub const MAX_PAYLOAD_LEN: u64 = u32::MAX as u64;

const FIN_BIT: u8 = 0x80;
const RSV_BITS: u8 = 0x70;
const OPCODE_BITS: u8 = 0x0F;
const MASK_BIT: u8 = 0x80;
const LEN_BITS: u8 = 0x7F;
const LEN_16: u8 = 126;
const LEN_64: u8 = 127;

/// One discrete protocol frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Final fragment of a message
    pub fin: bool,
    /// Reserved bits RSV1..RSV3 in the low three bits
    pub rsv: u8,
    /// Frame purpose
    pub opcode: Opcode,
    /// Masking key, present iff the frame was masked on the wire
    pub mask: Option<[u8; 4]>,
    /// Unmasked payload bytes
    pub payload: Vec<u8>,
}

impl Frame {
    /// A final, unmasked frame with no reserved bits.
    pub fn new(opcode: Opcode, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            fin: true,
            rsv: 0,
            opcode,
            mask: None,
            payload: payload.into(),
        }
    }

    /// Text data frame.
    pub fn text(text: impl Into<String>) -> Self {
        Self::new(Opcode::Text, text.into().into_bytes())
    }

    /// Binary data frame.
    pub fn binary(data: impl Into<Vec<u8>>) -> Self {
        Self::new(Opcode::Binary, data)
    }

    /// Continuation fragment.
    pub fn continuation(data: impl Into<Vec<u8>>, fin: bool) -> Self {
        Self::new(Opcode::Continuation, data).with_fin(fin)
    }

    /// Ping carrying `data` (at most 125 bytes to be valid).
    pub fn ping(data: impl Into<Vec<u8>>) -> Self {
        Self::new(Opcode::Ping, data)
    }

    /// Pong echoing `data`.
    pub fn pong(data: impl Into<Vec<u8>>) -> Self {
        Self::new(Opcode::Pong, data)
    }

    /// Close frame: `[code_hi, code_lo, ...reason]`.
    ///
    /// Codes that must not appear on the wire produce an empty payload. The
    /// reason is truncated on a character boundary to fit a control frame.
    pub fn close(code: CloseCode, reason: &str) -> Self {
        if code.is_reserved() {
            return Self::new(Opcode::Close, Vec::new());
        }

        let mut end = reason.len().min(MAX_CONTROL_PAYLOAD - 2);
        while !reason.is_char_boundary(end) {
            end -= 1;
        }

        let mut payload = Vec::with_capacity(2 + end);
        payload.extend_from_slice(&code.as_u16().to_be_bytes());
        payload.extend_from_slice(&reason.as_bytes()[..end]);
        Self::new(Opcode::Close, payload)
    }

    /// Set the FIN flag.
    pub fn with_fin(mut self, fin: bool) -> Self {
        self.fin = fin;
        self
    }

    /// Whether a masking key is attached.
    pub fn masked(&self) -> bool {
        self.mask.is_some()
    }

    /// Payload length as carried in the header.
    pub fn payload_len(&self) -> u64 {
        self.payload.len() as u64
    }

    /// Drop the masking key, keeping the (already unmasked) payload.
    pub fn strip_mask(mut self) -> Self {
        self.mask = None;
        self
    }

    /// Control frames must be final and short.
    pub fn validate_control(&self) -> Result<(), ProtocolError> {
        if !self.opcode.is_control() {
            return Ok(());
        }
        if !self.fin {
            return Err(ProtocolError::FragmentedControl(self.opcode));
        }
        if self.payload.len() > MAX_CONTROL_PAYLOAD {
            return Err(ProtocolError::ControlTooLong(self.payload.len()));
        }
        Ok(())
    }

    /// Payload as UTF-8.
    pub fn as_text(&self) -> Result<&str, ProtocolError> {
        std::str::from_utf8(&self.payload).map_err(|_| ProtocolError::InvalidUtf8)
    }
}

/// Parsed frame header, available before the payload has arrived.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// FIN flag
    pub fin: bool,
    /// Reserved bits
    pub rsv: u8,
    /// Opcode
    pub opcode: Opcode,
    /// Masking key if present
    pub mask: Option<[u8; 4]>,
    /// Declared payload length
    pub payload_len: u64,
    /// Header bytes including extended length and mask key
    pub header_len: usize,
}

impl FrameHeader {
    /// Total bytes occupied on the wire.
    pub fn frame_len(&self) -> u64 {
        self.header_len as u64 + self.payload_len
    }
}

/// Result of a decode attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    /// A whole frame was present
    Complete {
        /// The decoded frame, payload unmasked
        frame: Frame,
        /// Bytes to drop from the front of the buffer
        consumed: usize,
    },
    /// More bytes are needed; buffer and retry
    Incomplete,
}

/// XOR `payload` with `key[i % 4]`. Applying it twice restores the input.
pub fn apply_mask(payload: &mut [u8], key: [u8; 4]) {
    for (i, byte) in payload.iter_mut().enumerate() {
        *byte ^= key[i % 4];
    }
}

/// Encode a frame, generating a random masking key when `mask` is set.
///
/// The frame's own `mask` field is ignored.
pub fn encode(frame: &Frame, mask: bool) -> Result<Vec<u8>, ProtocolError> {
    let key = mask.then(rand::random::<[u8; 4]>);
    encode_with_key(frame, key)
}

/// Encode a frame with an explicit masking key (`None` for unmasked).
pub fn encode_with_key(frame: &Frame, key: Option<[u8; 4]>) -> Result<Vec<u8>, ProtocolError> {
    let len = frame.payload_len();
    if len > MAX_PAYLOAD_LEN {
        return Err(ProtocolError::LengthOverflow(len));
    }

    let mut out = Vec::with_capacity(MAX_HEADER_LEN + frame.payload.len());

    let mut b0 = frame.opcode as u8 | ((frame.rsv & 0x07) << 4);
    if frame.fin {
        b0 |= FIN_BIT;
    }
    out.push(b0);

    let mask_bit = if key.is_some() { MASK_BIT } else { 0 };
    if len <= 125 {
        out.push(mask_bit | len as u8);
    } else if len <= u64::from(u16::MAX) {
        out.push(mask_bit | LEN_16);
        out.extend_from_slice(&(len as u16).to_be_bytes());
    } else {
        out.push(mask_bit | LEN_64);
        out.extend_from_slice(&len.to_be_bytes());
    }

    match key {
        Some(key) => {
            out.extend_from_slice(&key);
            let start = out.len();
            out.extend_from_slice(&frame.payload);
            apply_mask(&mut out[start..], key);
        }
        None => out.extend_from_slice(&frame.payload),
    }

    Ok(out)
}

/// Decode the header at the front of `buf`.
///
/// `Ok(None)` means the header itself is not complete yet.
pub fn decode_header(buf: &[u8]) -> Result<Option<FrameHeader>, ProtocolError> {
    if buf.len() < 2 {
        return Ok(None);
    }

    let opcode_bits = buf[0] & OPCODE_BITS;
    let opcode = Opcode::from_bits(opcode_bits).ok_or(ProtocolError::InvalidOpcode(opcode_bits))?;
    let fin = buf[0] & FIN_BIT != 0;
    let rsv = (buf[0] & RSV_BITS) >> 4;
    let masked = buf[1] & MASK_BIT != 0;

    let (payload_len, mut header_len) = match buf[1] & LEN_BITS {
        LEN_16 => {
            if buf.len() < 4 {
                return Ok(None);
            }
            (u64::from(u16::from_be_bytes([buf[2], buf[3]])), 4)
        }
        LEN_64 => {
            if buf.len() < 10 {
                return Ok(None);
            }
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&buf[2..10]);
            let len = u64::from_be_bytes(raw);
            if len > MAX_PAYLOAD_LEN {
                return Err(ProtocolError::LengthOverflow(len));
            }
            (len, 10)
        }
        inline => (u64::from(inline), 2),
    };

    let mask = if masked {
        if buf.len() < header_len + 4 {
            return Ok(None);
        }
        let mut key = [0u8; 4];
        key.copy_from_slice(&buf[header_len..header_len + 4]);
        header_len += 4;
        Some(key)
    } else {
        None
    };

    Ok(Some(FrameHeader {
        fin,
        rsv,
        opcode,
        mask,
        payload_len,
        header_len,
    }))
}

/// Decode one frame from the front of `buf`.
///
/// A truncated frame is `Incomplete`, never an error and never a partial frame.
pub fn decode(buf: &[u8]) -> Result<Decoded, ProtocolError> {
    let Some(header) = decode_header(buf)? else {
        return Ok(Decoded::Incomplete);
    };

    let total = header.frame_len();
    if (buf.len() as u64) < total {
        return Ok(Decoded::Incomplete);
    }
    let total = total as usize;

    let mut payload = buf[header.header_len..total].to_vec();
    if let Some(key) = header.mask {
        apply_mask(&mut payload, key);
    }

    Ok(Decoded::Complete {
        frame: Frame {
            fin: header.fin,
            rsv: header.rsv,
            opcode: header.opcode,
            mask: header.mask,
            payload,
        },
        consumed: total,
    })
}

/// Parsed close frame payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseFrame {
    /// Status code; `NoStatus` when the payload was empty
    pub code: CloseCode,
    /// Optional UTF-8 reason
    pub reason: String,
}

impl CloseFrame {
    /// Parse a close payload.
    ///
    /// An empty payload is accepted and reported as `NoStatus`. A single
    /// byte cannot hold a status code and is rejected, as is a code peers
    /// may not send (see [`CloseCode::is_valid_on_wire`]).
    pub fn parse(payload: &[u8]) -> Result<Self, ProtocolError> {
        match payload.len() {
            0 => Ok(Self {
                code: CloseCode::NoStatus,
                reason: String::new(),
            }),
            1 => Err(ProtocolError::InvalidClosePayload(1)),
            _ => {
                let raw = u16::from_be_bytes([payload[0], payload[1]]);
                let code = CloseCode::from(raw);
                if !code.is_valid_on_wire() {
                    return Err(ProtocolError::InvalidCloseCode(raw));
                }
                let reason = std::str::from_utf8(&payload[2..])
                    .map_err(|_| ProtocolError::InvalidUtf8)?
                    .to_string();
                Ok(Self { code, reason })
            }
        }
    }
}
