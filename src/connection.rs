//! Endpoints and per-peer connection records.

use std::fmt;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr};
use std::time::{Duration, Instant};

use mio::net::TcpStream;
use mio::{Interest, Registry as PollRegistry, Token};
use serde::{Deserialize, Serialize};

/// Role an endpoint plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Accepts connections
    Listener,
    /// Initiates a connection
    Peer,
}

/// Underlying transport of an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    /// Reliable byte stream (TCP)
    #[default]
    Stream,
    /// Datagrams (UDP); not served by the reactor
    Datagram,
}

/// A local or remote address the gateway binds to or dials.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Endpoint {
    /// Socket address
    pub address: SocketAddr,
    /// Listener or peer
    pub role: Role,
    /// Stream or datagram
    pub transport: Transport,
}

impl Endpoint {
    /// A TCP listening endpoint.
    pub fn listener(address: SocketAddr) -> Self {
        Self {
            address,
            role: Role::Listener,
            transport: Transport::Stream,
        }
    }

    /// A TCP peer endpoint.
    pub fn peer(address: SocketAddr) -> Self {
        Self {
            address,
            role: Role::Peer,
            transport: Transport::Stream,
        }
    }

    /// Port component of the address.
    pub fn port(&self) -> u16 {
        self.address.port()
    }
}

/// Stable, generation-counted identifier of a registry slot.
///
/// A slot reused by a later connection carries a higher generation, so a
/// stale id never resolves to the newcomer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId {
    index: u32,
    generation: u32,
}

impl ConnectionId {
    /// Build an id from its parts.
    pub fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    /// Slot index.
    pub fn index(self) -> u32 {
        self.index
    }

    /// Slot generation.
    pub fn generation(self) -> u32 {
        self.generation
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}v{}", self.index, self.generation)
    }
}

/// Result of one [`Connection::read_available`] call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReadOutcome {
    /// Bytes appended
    pub read: usize,
    /// The peer closed its side
    pub eof: bool,
    /// Stopped at the limit; more data may be waiting
    pub more: bool,
}

/// One accepted client connection.
///
/// Invariant: the socket is present iff `is_open()`.
pub struct Connection {
    /// Identifier assigned by the registry
    pub id: ConnectionId,
    /// Endpoint the connection was accepted on
    pub endpoint: Endpoint,
    /// Remote address
    pub peer_addr: SocketAddr,
    /// Last time bytes arrived from the peer
    pub last_activity: Instant,
    /// Reactor shard that owns the socket
    pub shard: usize,
    stream: Option<TcpStream>,
}

impl Connection {
    /// Wrap an accepted stream. The id is assigned on registry insertion.
    pub fn new(stream: TcpStream, peer_addr: SocketAddr, endpoint: Endpoint, shard: usize) -> Self {
        Self {
            id: ConnectionId::new(0, 0),
            endpoint,
            peer_addr,
            last_activity: Instant::now(),
            shard,
            stream: Some(stream),
        }
    }

    /// Whether the socket is still held.
    pub fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    /// Time since the peer last sent anything.
    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_activity)
    }

    /// Register the socket with a poll registry.
    pub fn register(&mut self, poll: &PollRegistry, token: Token, interest: Interest) -> io::Result<()> {
        match self.stream.as_mut() {
            Some(stream) => poll.register(stream, token, interest),
            None => Err(not_open()),
        }
    }

    /// Change the interest set of an already registered socket.
    pub fn reregister(&mut self, poll: &PollRegistry, token: Token, interest: Interest) -> io::Result<()> {
        match self.stream.as_mut() {
            Some(stream) => poll.reregister(stream, token, interest),
            None => Err(not_open()),
        }
    }

    /// Read what is available into `buf`, appending at most `limit` bytes.
    ///
    /// Stops at `WouldBlock`, end of stream or the limit. When the limit is
    /// hit the socket may still hold data and `more` is set; readiness will
    /// not be signalled again for it.
    pub fn read_available(&mut self, buf: &mut Vec<u8>, limit: usize) -> io::Result<ReadOutcome> {
        let stream = self.stream.as_mut().ok_or_else(not_open)?;
        let mut chunk = [0u8; 4096];
        let mut outcome = ReadOutcome::default();

        while outcome.read < limit {
            let want = chunk.len().min(limit - outcome.read);
            match stream.read(&mut chunk[..want]) {
                Ok(0) => {
                    outcome.eof = true;
                    break;
                }
                Ok(n) => {
                    buf.extend_from_slice(&chunk[..n]);
                    outcome.read += n;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        outcome.more = !outcome.eof && outcome.read >= limit;

        if outcome.read > 0 {
            self.last_activity = Instant::now();
        }
        Ok(outcome)
    }

    /// Write as much of `buf` as the socket accepts and drain what was sent.
    ///
    /// Returns the number of bytes written; a partial write leaves the rest
    /// in `buf`.
    pub fn write_pending(&mut self, buf: &mut Vec<u8>) -> io::Result<usize> {
        let stream = self.stream.as_mut().ok_or_else(not_open)?;
        let mut written = 0;

        while written < buf.len() {
            match stream.write(&buf[written..]) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => written += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }

        buf.drain(..written);
        Ok(written)
    }

    /// Release the socket. Safe to call more than once.
    pub fn close(&mut self, poll: Option<&PollRegistry>) {
        if let Some(mut stream) = self.stream.take() {
            if let Some(poll) = poll {
                let _ = poll.deregister(&mut stream);
            }
            let _ = stream.shutdown(Shutdown::Both);
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer_addr", &self.peer_addr)
            .field("shard", &self.shard)
            .field("is_open", &self.is_open())
            .finish()
    }
}

fn not_open() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "connection is closed")
}
