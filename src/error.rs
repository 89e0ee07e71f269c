//! Error types for the wsgate protocol.

use std::io;
use std::net::SocketAddr;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::session::SessionState;

/// Convenience alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Coarse classification of every error the gateway can produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Socket read/write/accept failure, scoped to one connection
    Transport,
    /// Malformed handshake or frame
    Protocol,
    /// Connection registry full
    Capacity,
    /// Operation requested outside its legal session state
    StateViolation,
    /// Invalid, expired or unverifiable token
    Auth,
    /// Invalid configuration
    Config,
    /// Listener setup failure
    Fatal,
}

/// Socket-level failures. Non-fatal to the process.
#[derive(Error, Debug)]
pub enum TransportError {
    /// An I/O operation failed
    #[error("{op} failed: {source}")]
    Io {
        /// The operation that failed (read, write, accept, ...)
        op: &'static str,
        /// Underlying error
        #[source]
        source: io::Error,
    },
    /// Peer closed the stream before the exchange finished
    #[error("connection closed by peer")]
    Closed,
    /// The connection is no longer registered
    #[error("unknown connection")]
    UnknownConnection,
}

impl TransportError {
    /// Wrap an I/O error with the name of the failing operation.
    pub fn io(op: &'static str, source: io::Error) -> Self {
        Self::Io { op, source }
    }
}

/// Protocol-level errors raised by the handshake negotiator and frame codec.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Request or status line could not be parsed
    #[error("malformed handshake: {0}")]
    MalformedHandshake(&'static str),
    /// A required handshake header is absent
    #[error("missing handshake header `{0}`")]
    MissingHeader(&'static str),
    /// A required handshake header has the wrong value
    #[error("handshake header `{header}` has unexpected value `{value}`")]
    InvalidHeader {
        /// Header name
        header: &'static str,
        /// Offending value
        value: String,
    },
    /// Handshake head exceeded the size limit
    #[error("handshake exceeds {limit} bytes")]
    HandshakeTooLarge {
        /// Maximum accepted head size
        limit: usize,
    },
    /// Server accept token does not match the key we sent
    #[error("server accept key mismatch")]
    AcceptMismatch,
    /// Opcode nibble is not a defined opcode
    #[error("invalid opcode {0:#x}")]
    InvalidOpcode(u8),
    /// High 32 bits of a 64-bit payload length are set
    #[error("payload length {0} exceeds the 32-bit cap")]
    LengthOverflow(u64),
    /// Reserved bits set without a negotiated extension
    #[error("reserved bits {0:#05b} set")]
    ReservedBits(u8),
    /// Client-to-server frame without a mask
    #[error("client frame is not masked")]
    UnmaskedFrame,
    /// Control frame with FIN cleared
    #[error("fragmented control frame ({0:?})")]
    FragmentedControl(crate::opcode::Opcode),
    /// Control frame payload above 125 bytes
    #[error("control frame payload of {0} bytes exceeds 125")]
    ControlTooLong(usize),
    /// Continuation frame with no message in progress
    #[error("continuation frame without a started message")]
    UnexpectedContinuation,
    /// New data frame while a fragmented message is still open
    #[error("{0:?} frame received while a fragmented message is in progress")]
    ExpectedContinuation(crate::opcode::Opcode),
    /// Message larger than the configured limit
    #[error("message of {size} bytes exceeds limit of {limit}")]
    MessageTooLarge {
        /// Declared or accumulated size
        size: u64,
        /// Configured maximum
        limit: usize,
    },
    /// Close frame payload of a single byte
    #[error("close payload of {0} byte(s) is not a valid status")]
    InvalidClosePayload(usize),
    /// Close frame carrying a status code peers may not send
    #[error("close status {0} is not allowed on the wire")]
    InvalidCloseCode(u16),
    /// Text payload or close reason is not UTF-8
    #[error("payload is not valid UTF-8")]
    InvalidUtf8,
}

impl ProtocolError {
    /// Close code sent to the peer when this error ends a connection.
    pub fn close_code(&self) -> CloseCode {
        match self {
            Self::MessageTooLarge { .. } => CloseCode::MessageTooLarge,
            Self::InvalidUtf8 => CloseCode::InvalidPayload,
            _ => CloseCode::ProtocolError,
        }
    }
}

/// The connection registry has no free slot.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("connection registry full ({capacity} slots)")]
pub struct CapacityError {
    /// Registry capacity
    pub capacity: usize,
}

/// A session transition or operation outside its legal state.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("illegal session transition {from:?} -> {to:?}")]
pub struct StateViolation {
    /// State the session was in
    pub from: SessionState,
    /// State that was requested
    pub to: SessionState,
}

/// Token validation and authorization failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// The validator rejected the token
    #[error("invalid token: {0}")]
    InvalidToken(String),
    /// The token expiry has passed
    #[error("token expired at {0}")]
    Expired(DateTime<Utc>),
    /// The validator could not be reached; treated as a denial
    #[error("token authority unreachable: {0}")]
    Unreachable(String),
    /// Authenticated, but the required scope is not granted
    #[error("scope `{0}` not granted")]
    InsufficientScope(String),
    /// The session exhausted its allowed authentication attempts
    #[error("{0} failed authentication attempts")]
    TooManyFailures(u32),
}

/// Configuration loading and validation failures.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file could not be read
    #[error("failed to read config: {0}")]
    Io(#[from] io::Error),
    /// Config file is not valid JSON for the schema
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    /// A value is out of range
    #[error("invalid config value for `{field}`: {reason}")]
    Invalid {
        /// Field name
        field: &'static str,
        /// Why it was rejected
        reason: &'static str,
    },
    /// The endpoint transport cannot be served
    #[error("transport {0:?} is not supported by the reactor")]
    UnsupportedTransport(crate::connection::Transport),
}

/// Top-level error type.
#[derive(Error, Debug)]
pub enum Error {
    /// Connection-scoped transport failure
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// Malformed handshake or frame
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    /// Registry full
    #[error(transparent)]
    Capacity(#[from] CapacityError),
    /// Illegal state for the requested operation
    #[error(transparent)]
    State(#[from] StateViolation),
    /// Authorization failure
    #[error(transparent)]
    Auth(#[from] AuthError),
    /// Invalid configuration
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// Listener could not be set up; the only process-fatal error
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// Address that was requested
        addr: SocketAddr,
        /// Underlying error
        #[source]
        source: io::Error,
    },
}

impl Error {
    /// Classify the error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Transport(_) => ErrorKind::Transport,
            Self::Protocol(_) => ErrorKind::Protocol,
            Self::Capacity(_) => ErrorKind::Capacity,
            Self::State(_) => ErrorKind::StateViolation,
            Self::Auth(_) => ErrorKind::Auth,
            Self::Config(_) => ErrorKind::Config,
            Self::Bind { .. } => ErrorKind::Fatal,
        }
    }

    /// What happens to the connection that produced this error.
    ///
    /// `Some(code)` closes it with `code`; `None` rejects only the single
    /// request and leaves the connection open.
    pub fn close_code(&self) -> Option<CloseCode> {
        match self {
            Self::Transport(_) => Some(CloseCode::Abnormal),
            Self::Protocol(e) => Some(e.close_code()),
            Self::Auth(AuthError::TooManyFailures(_) | AuthError::Expired(_)) => {
                Some(CloseCode::PolicyViolation)
            }
            Self::Auth(_) | Self::State(_) | Self::Capacity(_) => None,
            Self::Config(_) | Self::Bind { .. } => Some(CloseCode::InternalError),
        }
    }
}

/// Close status codes carried in close frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CloseCode {
    /// 1000
    Normal,
    /// 1001
    GoingAway,
    /// 1002
    ProtocolError,
    /// 1003
    Unsupported,
    /// 1005, never sent on the wire
    NoStatus,
    /// 1006, never sent on the wire
    Abnormal,
    /// 1007
    InvalidPayload,
    /// 1008
    PolicyViolation,
    /// 1009
    MessageTooLarge,
    /// 1010
    ExtensionRequired,
    /// 1011
    InternalError,
    /// Any other code (application-defined ranges included)
    Other(u16),
}

impl CloseCode {
    /// Numeric wire value.
    pub fn as_u16(self) -> u16 {
        match self {
            Self::Normal => 1000,
            Self::GoingAway => 1001,
            Self::ProtocolError => 1002,
            Self::Unsupported => 1003,
            Self::NoStatus => 1005,
            Self::Abnormal => 1006,
            Self::InvalidPayload => 1007,
            Self::PolicyViolation => 1008,
            Self::MessageTooLarge => 1009,
            Self::ExtensionRequired => 1010,
            Self::InternalError => 1011,
            Self::Other(code) => code,
        }
    }

    /// True for codes that only describe a local condition and must not be
    /// written into a close frame.
    pub fn is_reserved(self) -> bool {
        matches!(self, Self::NoStatus | Self::Abnormal)
    }

    /// Whether a peer may put this code in a close frame: the registered
    /// 1000-1003 and 1007-1014, or the 3000-4999 library and private ranges.
    pub fn is_valid_on_wire(self) -> bool {
        matches!(self.as_u16(), 1000..=1003 | 1007..=1014 | 3000..=4999)
    }
}

impl From<u16> for CloseCode {
    fn from(code: u16) -> Self {
        match code {
            1000 => Self::Normal,
            1001 => Self::GoingAway,
            1002 => Self::ProtocolError,
            1003 => Self::Unsupported,
            1005 => Self::NoStatus,
            1006 => Self::Abnormal,
            1007 => Self::InvalidPayload,
            1008 => Self::PolicyViolation,
            1009 => Self::MessageTooLarge,
            1010 => Self::ExtensionRequired,
            1011 => Self::InternalError,
            other => Self::Other(other),
        }
    }
}
