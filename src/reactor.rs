//! Readiness-based event loop serving WebSocket connections.
//!
//! One [`Reactor`] owns a `mio::Poll`, a listener and every connection it
//! accepted. Sockets live in the shared [`Registry`]; per-connection codec
//! state (buffers, fragment assembly, handshake progress) stays local to the
//! reactor thread and is never shared.
//!
//! The loop is driven by [`Reactor::run_once`]:
//! - accept everything pending, refusing connections beyond capacity
//! - read readable sockets and drive the handshake or the frame codec
//! - hand complete messages to the [`Handler`]
//! - flush queued output, waiting for writability when the socket is full
//! - close idle connections and ping live ones

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Token, Waker};
use parking_lot::Mutex;
use tracing::{debug, info, trace, warn};

use crate::assembler::Assembler;
use crate::config::GatewayConfig;
use crate::connection::{Connection, ConnectionId, Endpoint};
use crate::error::{CloseCode, Error, ProtocolError, Result, TransportError};
use crate::fault::{Fault, FaultReporter, TracingFaultReporter};
use crate::frame::{self, CloseFrame, Decoded, Frame, MAX_CONTROL_PAYLOAD, MAX_HEADER_LEN};
use crate::handshake::{self, MAX_HEAD_LEN};
use crate::opcode::Opcode;
use crate::registry::Registry;

const LISTENER: Token = Token(0);
const WAKER: Token = Token(1);
const FIRST_CONNECTION: usize = 2;

const EVENT_CAPACITY: usize = 1024;
const HOUSEKEEPING_INTERVAL: Duration = Duration::from_millis(100);

/// Counters describing reactor activity.
///
/// Cloning shares the counters, so one instance can aggregate every reactor
/// of a server.
#[derive(Clone, Debug)]
pub struct ReactorMetrics {
    /// Connections accepted and registered
    pub connections_accepted_total: Arc<Mutex<u64>>,
    /// Connections refused because the registry was full
    pub connections_rejected_capacity: Arc<Mutex<u64>>,
    /// Upgrade requests that were malformed or too large
    pub handshake_failures_total: Arc<Mutex<u64>>,
    /// Frames decoded from peers
    pub frames_received_total: Arc<Mutex<u64>>,
    /// Frames queued for peers
    pub frames_sent_total: Arc<Mutex<u64>>,
    /// Frames rejected by the codec
    pub protocol_errors_total: Arc<Mutex<u64>>,
    /// Connections torn down for any reason
    pub connection_closes_total: Arc<Mutex<u64>>,
    /// Connections currently registered
    pub connections_active: Arc<Mutex<usize>>,
}

impl Default for ReactorMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl ReactorMetrics {
    /// All counters at zero.
    pub fn new() -> Self {
        Self {
            connections_accepted_total: Arc::new(Mutex::new(0)),
            connections_rejected_capacity: Arc::new(Mutex::new(0)),
            handshake_failures_total: Arc::new(Mutex::new(0)),
            frames_received_total: Arc::new(Mutex::new(0)),
            frames_sent_total: Arc::new(Mutex::new(0)),
            protocol_errors_total: Arc::new(Mutex::new(0)),
            connection_closes_total: Arc::new(Mutex::new(0)),
            connections_active: Arc::new(Mutex::new(0)),
        }
    }

    /// Export in text exposition format, one `name {} value` per line.
    pub fn export_metrics(&self) -> String {
        format!(
            "wsgate_connections_accepted_total {{}} {}\n\
             wsgate_connections_rejected_capacity {{}} {}\n\
             wsgate_handshake_failures_total {{}} {}\n\
             wsgate_frames_received_total {{}} {}\n\
             wsgate_frames_sent_total {{}} {}\n\
             wsgate_protocol_errors_total {{}} {}\n\
             wsgate_connection_closes_total {{}} {}\n\
             wsgate_connections_active {{}} {}\n",
            self.connections_accepted_total.lock(),
            self.connections_rejected_capacity.lock(),
            self.handshake_failures_total.lock(),
            self.frames_received_total.lock(),
            self.frames_sent_total.lock(),
            self.protocol_errors_total.lock(),
            self.connection_closes_total.lock(),
            self.connections_active.lock(),
        )
    }
}

/// Facts about a freshly upgraded connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    /// Registry id
    pub id: ConnectionId,
    /// Remote address
    pub addr: SocketAddr,
    /// Request target of the upgrade
    pub path: String,
    /// Negotiated subprotocol
    pub protocol: Option<String>,
}

/// Frames and an optional close request produced by a [`Handler`] callback.
#[derive(Debug, Default)]
pub struct Outbox {
    frames: Vec<Frame>,
    close: Option<(CloseCode, String)>,
}

impl Outbox {
    /// Empty outbox.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a frame for the peer.
    pub fn send(&mut self, frame: Frame) {
        self.frames.push(frame);
    }

    /// Queue a text message.
    pub fn text(&mut self, text: impl Into<String>) {
        self.send(Frame::text(text));
    }

    /// Queue a binary message.
    pub fn binary(&mut self, data: impl Into<Vec<u8>>) {
        self.send(Frame::binary(data));
    }

    /// Close the connection once queued frames are written.
    pub fn close(&mut self, code: CloseCode, reason: impl Into<String>) {
        self.close = Some((code, reason.into()));
    }

    /// Queued frames.
    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    /// Requested close, if any.
    pub fn close_request(&self) -> Option<(CloseCode, &str)> {
        self.close.as_ref().map(|(code, reason)| (*code, reason.as_str()))
    }

    /// No frames and no close request.
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty() && self.close.is_none()
    }
}

/// Connection events delivered by a reactor.
///
/// An error returned from a callback is dispatched by
/// [`Error::close_code`]: `Some(code)` closes the connection with that code,
/// `None` drops only the offending request.
pub trait Handler {
    /// The upgrade completed.
    fn on_connect(&mut self, peer: &PeerInfo, out: &mut Outbox) -> Result<()>;

    /// A complete data message arrived.
    fn on_frame(&mut self, id: ConnectionId, message: Frame, out: &mut Outbox) -> Result<()>;

    /// The connection is gone. Called once, and only after `on_connect`.
    fn on_disconnect(&mut self, id: ConnectionId, code: CloseCode);
}

/// Resources shared by the reactors of one server.
#[derive(Clone)]
pub struct ReactorContext {
    /// Connection table
    pub registry: Arc<Registry>,
    /// Shared counters
    pub metrics: ReactorMetrics,
    /// Sink for recovered failures
    pub faults: Arc<dyn FaultReporter>,
}

impl ReactorContext {
    /// Fresh registry of `capacity` slots, zeroed metrics and a tracing
    /// fault reporter.
    pub fn new(capacity: usize) -> Self {
        Self {
            registry: Arc::new(Registry::new(capacity)),
            metrics: ReactorMetrics::new(),
            faults: Arc::new(TracingFaultReporter),
        }
    }

    /// Replace the fault reporter.
    pub fn with_fault_reporter(mut self, faults: Arc<dyn FaultReporter>) -> Self {
        self.faults = faults;
        self
    }
}

/// Cross-thread stop switch for a running reactor.
#[derive(Clone)]
pub struct ReactorHandle {
    stop: Arc<AtomicBool>,
    waker: Arc<Waker>,
}

impl ReactorHandle {
    /// Ask the reactor to close every connection and return from `run`.
    pub fn shutdown(&self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Err(e) = self.waker.wake() {
            warn!(error = %e, "failed to wake reactor");
        }
    }

    /// Whether shutdown has been requested.
    pub fn is_shutdown(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    Handshaking,
    Open,
}

/// Reactor-local state of one connection.
struct Link {
    id: ConnectionId,
    peer: SocketAddr,
    phase: Phase,
    inbound: Vec<u8>,
    outbound: Vec<u8>,
    assembler: Assembler,
    last_ping: Instant,
    write_interest: bool,
    read_more: bool,
    closing: bool,
    close_code: CloseCode,
}

impl Link {
    fn new(id: ConnectionId, peer: SocketAddr, max_message_size: usize) -> Self {
        Self {
            id,
            peer,
            phase: Phase::Handshaking,
            inbound: Vec::new(),
            outbound: Vec::new(),
            assembler: Assembler::new(max_message_size),
            last_ping: Instant::now(),
            write_interest: false,
            read_more: false,
            closing: false,
            close_code: CloseCode::Abnormal,
        }
    }
}

fn token_for(id: ConnectionId) -> Token {
    Token(id.index() as usize + FIRST_CONNECTION)
}

/// Single-threaded WebSocket event loop.
pub struct Reactor<H: Handler> {
    poll: Poll,
    events: Events,
    listener: TcpListener,
    endpoint: Endpoint,
    shard: usize,
    config: GatewayConfig,
    handler: H,
    context: ReactorContext,
    links: HashMap<u32, Link>,
    /// Links that stopped reading at their per-pass limit
    backlog: Vec<u32>,
    stop: Arc<AtomicBool>,
    waker: Arc<Waker>,
    last_housekeeping: Instant,
}

impl<H: Handler> Reactor<H> {
    /// Bind `config.bind_address` and build a standalone reactor.
    ///
    /// Failing to bind is the one fatal error.
    pub fn bind(config: GatewayConfig, handler: H) -> Result<Self> {
        config.validate()?;
        let listener = bind_listener(config.bind_address)?;
        let context = ReactorContext::new(config.max_connections);
        Self::with_listener(listener, 0, config, handler, context)
    }

    /// Build a reactor over an already bound, non-blocking listener.
    ///
    /// `shard` tags the connections this reactor accepts in the shared
    /// registry.
    pub fn with_listener(
        listener: std::net::TcpListener,
        shard: usize,
        config: GatewayConfig,
        handler: H,
        context: ReactorContext,
    ) -> Result<Self> {
        let addr = listener
            .local_addr()
            .map_err(|source| Error::Bind { addr: config.bind_address, source })?;
        let mut listener = TcpListener::from_std(listener);

        let poll = Poll::new().map_err(|e| TransportError::io("poll", e))?;
        poll.registry()
            .register(&mut listener, LISTENER, Interest::READABLE)
            .map_err(|source| Error::Bind { addr, source })?;
        let waker = Waker::new(poll.registry(), WAKER).map_err(|e| TransportError::io("waker", e))?;

        Ok(Self {
            poll,
            events: Events::with_capacity(EVENT_CAPACITY),
            listener,
            endpoint: Endpoint::listener(addr),
            shard,
            config,
            handler,
            context,
            links: HashMap::new(),
            backlog: Vec::new(),
            stop: Arc::new(AtomicBool::new(false)),
            waker: Arc::new(waker),
            last_housekeeping: Instant::now(),
        })
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.endpoint.address
    }

    /// Stop switch usable from other threads.
    pub fn handle(&self) -> ReactorHandle {
        ReactorHandle {
            stop: self.stop.clone(),
            waker: self.waker.clone(),
        }
    }

    /// Shared counters.
    pub fn metrics(&self) -> &ReactorMetrics {
        &self.context.metrics
    }

    /// The connection handler.
    pub fn handler(&self) -> &H {
        &self.handler
    }

    /// Connections owned by this reactor.
    pub fn connection_count(&self) -> usize {
        self.links.len()
    }

    /// Run until [`ReactorHandle::shutdown`], then close every connection
    /// with `GoingAway`.
    pub fn run(&mut self) -> Result<()> {
        info!(addr = %self.local_addr(), shard = self.shard, "reactor running");
        let timeout = self.config.poll_timeout();
        while !self.stop.load(Ordering::SeqCst) {
            self.run_once(Some(timeout))?;
        }
        self.close_all(CloseCode::GoingAway);
        info!(addr = %self.local_addr(), shard = self.shard, "reactor stopped");
        Ok(())
    }

    /// One readiness wait of at most `timeout`, then everything it made
    /// runnable. Only a poll failure is returned as an error.
    pub fn run_once(&mut self, timeout: Option<Duration>) -> Result<()> {
        // Backlogged sockets get no new readiness event, so do not sleep.
        let timeout = if self.backlog.is_empty() { timeout } else { Some(Duration::ZERO) };
        if let Err(e) = self.poll.poll(&mut self.events, timeout) {
            if e.kind() == io::ErrorKind::Interrupted {
                return Ok(());
            }
            return Err(TransportError::io("poll", e).into());
        }

        let mut accept = false;
        let mut ready: Vec<(u32, bool, bool)> = std::mem::take(&mut self.backlog)
            .into_iter()
            .map(|index| (index, true, false))
            .collect();
        for event in self.events.iter() {
            match event.token() {
                LISTENER => accept = true,
                WAKER => {}
                Token(t) => {
                    let index = (t - FIRST_CONNECTION) as u32;
                    let readable = event.is_readable() || event.is_read_closed() || event.is_error();
                    match ready.iter_mut().find(|(i, _, _)| *i == index) {
                        Some(entry) => entry.2 |= event.is_writable(),
                        None => ready.push((index, readable, event.is_writable())),
                    }
                }
            }
        }

        if accept {
            self.accept_pending();
        }

        for (index, readable, writable) in ready {
            let Some(mut link) = self.links.remove(&index) else {
                continue;
            };
            let keep = if readable {
                self.service(&mut link)
            } else if writable {
                self.flush(&mut link)
            } else {
                true
            };
            if keep {
                if link.read_more {
                    self.backlog.push(index);
                }
                self.links.insert(index, link);
            }
        }

        self.housekeeping(Instant::now());
        Ok(())
    }

    fn accept_pending(&mut self) {
        loop {
            let (stream, peer) = match self.listener.accept() {
                Ok(accepted) => accepted,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    let err = Error::from(TransportError::io("accept", e));
                    self.context.faults.report(&Fault::new("accept", None, None, &err));
                    return;
                }
            };

            let connection = Connection::new(stream, peer, self.endpoint, self.shard);
            let id = match self.context.registry.insert(connection) {
                Ok(id) => id,
                Err(e) => {
                    *self.context.metrics.connections_rejected_capacity.lock() += 1;
                    warn!(peer = %peer, error = %e, "refusing connection");
                    continue;
                }
            };

            let poll = self.poll.registry();
            let registered = self
                .context
                .registry
                .with(id, |c| c.register(poll, token_for(id), Interest::READABLE));
            if let Some(Err(e)) = registered {
                let err = Error::from(TransportError::io("register", e));
                self.context.faults.report(&Fault::new("register", Some(id), Some(peer), &err));
                if let Some(mut conn) = self.context.registry.remove(id) {
                    conn.close(None);
                }
                continue;
            }

            *self.context.metrics.connections_accepted_total.lock() += 1;
            *self.context.metrics.connections_active.lock() += 1;
            debug!(conn = %id, peer = %peer, "accepted");
            self.links
                .insert(id.index(), Link::new(id, peer, self.config.max_message_size));
        }
    }

    /// Bytes one pass may read: enough to reject an oversized handshake head
    /// or to complete one maximal frame.
    fn read_budget(&self, link: &Link) -> usize {
        match link.phase {
            Phase::Handshaking => (MAX_HEAD_LEN + 1).saturating_sub(link.inbound.len()).max(1),
            Phase::Open => self.config.max_message_size.saturating_add(MAX_HEADER_LEN),
        }
    }

    /// Read and process; false once the connection is gone.
    fn service(&mut self, link: &mut Link) -> bool {
        let limit = self.read_budget(link);
        let inbound = &mut link.inbound;
        let peer_closed = match self.context.registry.with(link.id, |c| c.read_available(inbound, limit)) {
            Some(Ok(outcome)) => {
                link.read_more = outcome.more;
                outcome.eof
            }
            Some(Err(e)) => {
                let err = Error::from(TransportError::io("read", e));
                self.context
                    .faults
                    .report(&Fault::new("read", Some(link.id), Some(link.peer), &err));
                self.teardown(link, CloseCode::Abnormal);
                return false;
            }
            None => {
                self.teardown(link, CloseCode::Abnormal);
                return false;
            }
        };

        if link.closing {
            link.inbound.clear();
        } else {
            if link.phase == Phase::Handshaking && !self.upgrade(link) {
                *self.context.metrics.handshake_failures_total.lock() += 1;
                self.teardown(link, CloseCode::Abnormal);
                return false;
            }
            if link.phase == Phase::Open {
                self.process_frames(link);
            }
        }

        if !self.flush(link) {
            return false;
        }
        if peer_closed {
            let code = if link.closing { link.close_code } else { CloseCode::Abnormal };
            self.teardown(link, code);
            return false;
        }
        true
    }

    /// Complete the upgrade if the request head has arrived.
    ///
    /// False means the request was rejected; nothing has been written.
    fn upgrade(&mut self, link: &mut Link) -> bool {
        let end = match handshake::find_head_end(&link.inbound) {
            Some(end) if end <= MAX_HEAD_LEN => end,
            None if link.inbound.len() <= MAX_HEAD_LEN => return true,
            _ => {
                debug!(conn = %link.id, peer = %link.peer, limit = MAX_HEAD_LEN, "handshake too large");
                return false;
            }
        };

        let request = match handshake::parse_request(&link.inbound[..end]) {
            Ok(request) => request,
            Err(e) => {
                debug!(conn = %link.id, peer = %link.peer, error = %e, "rejecting upgrade");
                return false;
            }
        };
        link.inbound.drain(..end);

        let protocol = handshake::negotiate_protocol(&request, &self.config.subprotocols);
        link.outbound
            .extend_from_slice(&handshake::build_response(&request.key, protocol.as_deref()));
        link.phase = Phase::Open;
        link.last_ping = Instant::now();

        let peer = PeerInfo {
            id: link.id,
            addr: link.peer,
            path: request.path,
            protocol,
        };
        info!(conn = %link.id, peer = %link.peer, path = %peer.path, protocol = ?peer.protocol, "upgraded");

        let mut out = Outbox::new();
        let result = self.handler.on_connect(&peer, &mut out);
        self.dispatch(link, result, out);
        true
    }

    fn process_frames(&mut self, link: &mut Link) {
        loop {
            if link.closing {
                link.inbound.clear();
                return;
            }
            match self.next_frame(link) {
                Ok(Some(frame)) => self.on_wire_frame(link, frame),
                Ok(None) => return,
                Err(e) => self.protocol_error(link, e),
            }
        }
    }

    /// Validate the next header before buffering its payload, then decode.
    fn next_frame(&self, link: &mut Link) -> std::result::Result<Option<Frame>, ProtocolError> {
        let Some(header) = frame::decode_header(&link.inbound)? else {
            return Ok(None);
        };

        if header.rsv != 0 {
            return Err(ProtocolError::ReservedBits(header.rsv));
        }
        if header.mask.is_none() {
            return Err(ProtocolError::UnmaskedFrame);
        }
        if header.opcode.is_control() {
            if !header.fin {
                return Err(ProtocolError::FragmentedControl(header.opcode));
            }
            if header.payload_len > MAX_CONTROL_PAYLOAD as u64 {
                return Err(ProtocolError::ControlTooLong(header.payload_len as usize));
            }
        } else {
            let size = header.payload_len + link.assembler.buffered() as u64;
            if size > self.config.max_message_size as u64 {
                return Err(ProtocolError::MessageTooLarge {
                    size,
                    limit: self.config.max_message_size,
                });
            }
        }

        match frame::decode(&link.inbound)? {
            Decoded::Complete { frame, consumed } => {
                link.inbound.drain(..consumed);
                Ok(Some(frame.strip_mask()))
            }
            Decoded::Incomplete => Ok(None),
        }
    }

    fn on_wire_frame(&mut self, link: &mut Link, frame: Frame) {
        *self.context.metrics.frames_received_total.lock() += 1;
        trace!(conn = %link.id, opcode = ?frame.opcode, len = frame.payload.len(), "frame");

        match frame.opcode {
            Opcode::Ping => self.queue(link, &Frame::pong(frame.payload)),
            Opcode::Pong => {}
            Opcode::Close => match CloseFrame::parse(&frame.payload) {
                Ok(close) => {
                    debug!(conn = %link.id, code = close.code.as_u16(), reason = %close.reason, "peer closed");
                    self.begin_close(link, close.code, "");
                }
                Err(e) => self.protocol_error(link, e),
            },
            Opcode::Text | Opcode::Binary | Opcode::Continuation => match link.assembler.push(frame) {
                Ok(Some(message)) => self.deliver(link, message),
                Ok(None) => {}
                Err(e) => self.protocol_error(link, e),
            },
        }
    }

    fn deliver(&mut self, link: &mut Link, message: Frame) {
        if message.opcode == Opcode::Text {
            if let Err(e) = message.as_text() {
                self.protocol_error(link, e);
                return;
            }
        }
        let mut out = Outbox::new();
        let result = self.handler.on_frame(link.id, message, &mut out);
        self.dispatch(link, result, out);
    }

    fn dispatch(&mut self, link: &mut Link, result: Result<()>, out: Outbox) {
        for frame in &out.frames {
            self.queue(link, frame);
        }
        if let Some((code, reason)) = &out.close {
            self.begin_close(link, *code, reason);
        }

        if let Err(e) = result {
            match e.close_code() {
                Some(code) => {
                    debug!(conn = %link.id, error = %e, code = code.as_u16(), "closing after handler error");
                    self.begin_close(link, code, &e.to_string());
                }
                None => debug!(conn = %link.id, error = %e, "request rejected"),
            }
        }
    }

    fn protocol_error(&mut self, link: &mut Link, e: ProtocolError) {
        *self.context.metrics.protocol_errors_total.lock() += 1;
        debug!(conn = %link.id, peer = %link.peer, error = %e, "protocol error");
        self.begin_close(link, e.close_code(), &e.to_string());
    }

    fn queue(&self, link: &mut Link, frame: &Frame) {
        if link.closing {
            return;
        }
        match frame::encode(frame, false) {
            Ok(bytes) => {
                link.outbound.extend_from_slice(&bytes);
                *self.context.metrics.frames_sent_total.lock() += 1;
            }
            Err(e) => warn!(conn = %link.id, error = %e, "dropping unencodable frame"),
        }
    }

    /// Queue a close frame; the socket closes once output drains.
    fn begin_close(&self, link: &mut Link, code: CloseCode, reason: &str) {
        if link.closing {
            return;
        }
        if link.phase == Phase::Open {
            self.queue(link, &Frame::close(code, reason));
        }
        link.closing = true;
        link.close_code = code;
    }

    /// Write queued output; false once the connection is gone.
    fn flush(&mut self, link: &mut Link) -> bool {
        if !link.outbound.is_empty() {
            let outbound = &mut link.outbound;
            match self.context.registry.with(link.id, |c| c.write_pending(outbound)) {
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    let err = Error::from(TransportError::io("write", e));
                    self.context
                        .faults
                        .report(&Fault::new("write", Some(link.id), Some(link.peer), &err));
                    self.teardown(link, CloseCode::Abnormal);
                    return false;
                }
                None => {
                    self.teardown(link, CloseCode::Abnormal);
                    return false;
                }
            }
        }

        let want_write = !link.outbound.is_empty();
        if want_write != link.write_interest {
            let interest = if want_write {
                Interest::READABLE | Interest::WRITABLE
            } else {
                Interest::READABLE
            };
            let poll = self.poll.registry();
            let id = link.id;
            if let Some(Err(e)) = self.context.registry.with(id, |c| c.reregister(poll, token_for(id), interest)) {
                let err = Error::from(TransportError::io("reregister", e));
                self.context.faults.report(&Fault::new("reregister", Some(id), Some(link.peer), &err));
                self.teardown(link, CloseCode::Abnormal);
                return false;
            }
            link.write_interest = want_write;
        }

        if link.closing && !want_write {
            self.teardown(link, link.close_code);
            return false;
        }
        true
    }

    fn teardown(&mut self, link: &Link, code: CloseCode) {
        if let Some(mut conn) = self.context.registry.remove(link.id) {
            conn.close(Some(self.poll.registry()));
            *self.context.metrics.connection_closes_total.lock() += 1;
            let mut active = self.context.metrics.connections_active.lock();
            *active = active.saturating_sub(1);
        }
        if link.phase == Phase::Open {
            self.handler.on_disconnect(link.id, code);
        }
        debug!(conn = %link.id, peer = %link.peer, code = code.as_u16(), "connection closed");
    }

    fn housekeeping(&mut self, now: Instant) {
        if now.duration_since(self.last_housekeeping) < HOUSEKEEPING_INTERVAL {
            return;
        }
        self.last_housekeeping = now;

        if let Some(timeout) = self.config.connection_timeout() {
            for id in self.context.registry.idle(self.shard, now, timeout) {
                let Some(mut link) = self.links.remove(&id.index()) else {
                    continue;
                };
                if link.id != id {
                    self.links.insert(id.index(), link);
                    continue;
                }
                debug!(conn = %id, peer = %link.peer, "idle timeout");
                if link.phase == Phase::Handshaking || link.closing {
                    self.teardown(&link, CloseCode::Abnormal);
                    continue;
                }
                self.begin_close(&mut link, CloseCode::GoingAway, "idle timeout");
                if self.flush(&mut link) {
                    self.links.insert(id.index(), link);
                }
            }
        }

        if let Some(interval) = self.config.ping_interval() {
            let due: Vec<u32> = self
                .links
                .iter()
                .filter(|(_, l)| {
                    l.phase == Phase::Open && !l.closing && now.duration_since(l.last_ping) >= interval
                })
                .map(|(index, _)| *index)
                .collect();
            for index in due {
                let Some(mut link) = self.links.remove(&index) else {
                    continue;
                };
                link.last_ping = now;
                self.queue(&mut link, &Frame::ping(Vec::new()));
                if self.flush(&mut link) {
                    self.links.insert(index, link);
                }
            }
        }
    }

    /// Best-effort close of every connection.
    fn close_all(&mut self, code: CloseCode) {
        let links: Vec<Link> = self.links.drain().map(|(_, link)| link).collect();
        for mut link in links {
            self.begin_close(&mut link, code, "server shutting down");
            if self.flush(&mut link) {
                self.teardown(&link, code);
            }
        }
    }
}

/// Bind a non-blocking listener, mapping failure to the fatal error.
pub fn bind_listener(addr: SocketAddr) -> Result<std::net::TcpListener> {
    let listener = std::net::TcpListener::bind(addr).map_err(|source| Error::Bind { addr, source })?;
    listener
        .set_nonblocking(true)
        .map_err(|source| Error::Bind { addr, source })?;
    Ok(listener)
}
