//! Opcode field identifying the purpose of a frame.

/// Frame opcode (low nibble of the first header byte).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Opcode {
    /// Continues a fragmented text or binary message
    Continuation = 0x0,
    /// UTF-8 text data
    Text = 0x1,
    /// Opaque binary data
    Binary = 0x2,
    /// Connection close
    Close = 0x8,
    /// Liveness probe
    Ping = 0x9,
    /// Reply to a ping
    Pong = 0xA,
}

impl Opcode {
    /// Create an opcode from its numeric nibble.
    pub fn from_bits(b: u8) -> Option<Self> {
        match b {
            0x0 => Some(Self::Continuation),
            0x1 => Some(Self::Text),
            0x2 => Some(Self::Binary),
            0x8 => Some(Self::Close),
            0x9 => Some(Self::Ping),
            0xA => Some(Self::Pong),
            _ => None,
        }
    }

    /// Control opcodes have the high bit of the nibble set.
    pub fn is_control(self) -> bool {
        (self as u8) & 0x8 != 0
    }

    /// Text, binary or continuation.
    pub fn is_data(self) -> bool {
        !self.is_control()
    }
}
