//! Blocking client endpoint.
//!
//! Used by the integration tests and the demo, and usable on its own. Every
//! outgoing frame is masked; server pings are answered transparently.

use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::thread;
use std::time::Duration;

use tracing::{debug, warn};

use crate::assembler::Assembler;
use crate::config::ReconnectConfig;
use crate::error::{CloseCode, ErrorKind, ProtocolError, Result, TransportError};
use crate::frame::{self, CloseFrame, Decoded, Frame};
use crate::handshake::{self, MAX_HEAD_LEN};
use crate::opcode::Opcode;

/// Connection parameters.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Request target
    pub path: String,
    /// `Host` header; defaults to the peer address
    pub host: Option<String>,
    /// Subprotocols to offer, in preference order
    pub protocols: Vec<String>,
    /// Largest accepted message
    pub max_message_size: usize,
    /// TCP connect timeout
    pub connect_timeout: Option<Duration>,
    /// Read timeout applied to the socket
    pub read_timeout: Option<Duration>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            path: "/".into(),
            host: None,
            protocols: Vec::new(),
            max_message_size: 65_536,
            connect_timeout: Some(Duration::from_secs(10)),
            read_timeout: None,
        }
    }
}

/// Exponential backoff between connect attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Retry at all
    pub enabled: bool,
    /// Attempts including the first
    pub max_attempts: u32,
    /// Delay before the first retry
    pub base_delay: Duration,
    /// Cap on any single delay
    pub max_delay: Duration,
}

impl From<&ReconnectConfig> for ReconnectPolicy {
    fn from(config: &ReconnectConfig) -> Self {
        Self {
            enabled: config.enabled,
            max_attempts: config.max_attempts,
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
        }
    }
}

impl ReconnectPolicy {
    /// Total attempts allowed; one when reconnecting is disabled.
    pub fn attempts(&self) -> u32 {
        if self.enabled {
            self.max_attempts.max(1)
        } else {
            1
        }
    }

    /// Delay after failed attempt number `attempt` (1-based): doubles each
    /// time, starting at `base_delay`, capped at `max_delay`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// A message received from the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Complete text message
    Text(String),
    /// Complete binary message
    Binary(Vec<u8>),
    /// The server closed the connection
    Close(CloseFrame),
}

/// Client side of one WebSocket connection.
pub struct Client {
    stream: TcpStream,
    peer: SocketAddr,
    inbound: Vec<u8>,
    assembler: Assembler,
    protocol: Option<String>,
    closed: bool,
}

impl Client {
    /// Connect and complete the upgrade.
    pub fn connect(addr: SocketAddr, options: &ClientOptions) -> Result<Self> {
        let stream = match options.connect_timeout {
            Some(timeout) => TcpStream::connect_timeout(&addr, timeout),
            None => TcpStream::connect(addr),
        }
        .map_err(|e| TransportError::io("connect", e))?;
        stream
            .set_read_timeout(options.read_timeout)
            .map_err(|e| TransportError::io("configure", e))?;
        stream.set_nodelay(true).map_err(|e| TransportError::io("configure", e))?;

        let mut client = Self {
            stream,
            peer: addr,
            inbound: Vec::new(),
            assembler: Assembler::new(options.max_message_size),
            protocol: None,
            closed: false,
        };
        client.upgrade(options)?;
        debug!(peer = %addr, protocol = ?client.protocol, "client connected");
        Ok(client)
    }

    /// [`Client::connect`], retrying transport failures per `policy`.
    pub fn connect_with_retry(addr: SocketAddr, options: &ClientOptions, policy: &ReconnectPolicy) -> Result<Self> {
        let attempts = policy.attempts();
        let mut attempt = 0;
        loop {
            attempt += 1;
            match Self::connect(addr, options) {
                Ok(client) => return Ok(client),
                Err(e) if attempt < attempts && e.kind() == ErrorKind::Transport => {
                    let delay = policy.delay_for(attempt);
                    warn!(peer = %addr, attempt, ?delay, error = %e, "connect failed, retrying");
                    thread::sleep(delay);
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn upgrade(&mut self, options: &ClientOptions) -> Result<()> {
        let host = options.host.clone().unwrap_or_else(|| self.peer.to_string());
        let offered = (!options.protocols.is_empty()).then(|| options.protocols.join(", "));
        let request = handshake::build_request(&host, &options.path, offered.as_deref());
        self.write_all(&request.bytes)?;

        let end = loop {
            if let Some(end) = handshake::find_head_end(&self.inbound) {
                break end;
            }
            if self.inbound.len() > MAX_HEAD_LEN {
                return Err(ProtocolError::HandshakeTooLarge { limit: MAX_HEAD_LEN }.into());
            }
            self.fill()?;
        };

        let response = handshake::parse_response(&self.inbound[..end])?;
        self.inbound.drain(..end);
        if !response.accepted {
            return Err(ProtocolError::MalformedHandshake("server refused the upgrade").into());
        }
        if response.accept.as_deref() != Some(request.expected_accept().as_str()) {
            return Err(ProtocolError::AcceptMismatch.into());
        }
        self.protocol = response.protocol;
        Ok(())
    }

    /// Subprotocol selected by the server.
    pub fn protocol(&self) -> Option<&str> {
        self.protocol.as_deref()
    }

    /// Server address.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Change the socket read timeout.
    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        self.stream
            .set_read_timeout(timeout)
            .map_err(|e| TransportError::io("configure", e).into())
    }

    /// Send one frame, masked with a fresh key.
    pub fn send(&mut self, frame: &Frame) -> Result<()> {
        if self.closed {
            return Err(TransportError::Closed.into());
        }
        let bytes = frame::encode(frame, true)?;
        self.write_all(&bytes)
    }

    /// Send a text message.
    pub fn send_text(&mut self, text: impl Into<String>) -> Result<()> {
        self.send(&Frame::text(text))
    }

    /// Send a binary message.
    pub fn send_binary(&mut self, data: impl Into<Vec<u8>>) -> Result<()> {
        self.send(&Frame::binary(data))
    }

    /// Send a ping.
    pub fn ping(&mut self, data: impl Into<Vec<u8>>) -> Result<()> {
        self.send(&Frame::ping(data))
    }

    /// Start the closing handshake. Call [`Client::recv`] to collect the
    /// server's close frame.
    pub fn close(&mut self, code: CloseCode, reason: &str) -> Result<()> {
        self.send(&Frame::close(code, reason))?;
        self.closed = true;
        Ok(())
    }

    /// Next data message or the server's close frame.
    pub fn recv(&mut self) -> Result<Message> {
        loop {
            match frame::decode(&self.inbound)? {
                Decoded::Complete { frame, consumed } => {
                    self.inbound.drain(..consumed);
                    if let Some(message) = self.on_frame(frame)? {
                        return Ok(message);
                    }
                }
                Decoded::Incomplete => self.fill()?,
            }
        }
    }

    fn on_frame(&mut self, frame: Frame) -> Result<Option<Message>> {
        if frame.rsv != 0 {
            return Err(ProtocolError::ReservedBits(frame.rsv).into());
        }
        frame.validate_control()?;

        match frame.opcode {
            Opcode::Ping => {
                if !self.closed {
                    self.send(&Frame::pong(frame.payload))?;
                }
                Ok(None)
            }
            Opcode::Pong => Ok(None),
            Opcode::Close => {
                let close = CloseFrame::parse(&frame.payload)?;
                if !self.closed {
                    // The server may already have dropped the socket.
                    if let Err(e) = self.send(&Frame::close(close.code, "")) {
                        debug!(peer = %self.peer, error = %e, "close echo not delivered");
                    }
                    self.closed = true;
                }
                Ok(Some(Message::Close(close)))
            }
            Opcode::Text | Opcode::Binary | Opcode::Continuation => {
                let Some(message) = self.assembler.push(frame.strip_mask())? else {
                    return Ok(None);
                };
                match message.opcode {
                    Opcode::Text => String::from_utf8(message.payload)
                        .map(|text| Some(Message::Text(text)))
                        .map_err(|_| ProtocolError::InvalidUtf8.into()),
                    _ => Ok(Some(Message::Binary(message.payload))),
                }
            }
        }
    }

    fn fill(&mut self) -> Result<()> {
        let mut chunk = [0u8; 4096];
        loop {
            match self.stream.read(&mut chunk) {
                Ok(0) => return Err(TransportError::Closed.into()),
                Ok(n) => {
                    self.inbound.extend_from_slice(&chunk[..n]);
                    return Ok(());
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(TransportError::io("read", e).into()),
            }
        }
    }

    fn write_all(&mut self, bytes: &[u8]) -> Result<()> {
        self.stream
            .write_all(bytes)
            .and_then(|()| self.stream.flush())
            .map_err(|e| TransportError::io("write", e).into())
    }
}
