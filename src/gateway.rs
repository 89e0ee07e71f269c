//! Session-driving [`Handler`]: authentication, authorization and dispatch
//! of application requests.
//!
//! After the upgrade a session sits in `Auth` and its first data message is
//! taken as the bearer token. Once authorized, every data message runs
//! through `Ready -> Executing -> Ready`; only one request executes at a time.

use std::collections::HashMap;

use chrono::Utc;
use tracing::{debug, info};

use crate::connection::ConnectionId;
use crate::error::{AuthError, CloseCode, Error, Result, StateViolation, TransportError};
use crate::frame::Frame;
use crate::reactor::{Handler, Outbox, PeerInfo};
use crate::security::{check_expiry, AuthorizationResult, SecurityGate};
use crate::session::{Session, SessionState};

/// Context of one application request.
#[derive(Debug, Clone, Copy)]
pub struct Request<'a> {
    /// Connection the request arrived on
    pub connection: ConnectionId,
    /// Authorization of the session
    pub authorization: &'a AuthorizationResult,
}

/// Application logic served by a [`Gateway`]. Payloads are opaque here.
pub trait Application {
    /// Scope a message requires, if any.
    fn required_scope(&self, _message: &Frame) -> Option<String> {
        None
    }

    /// Run one request. Runs while the session is `Executing`.
    fn execute(&mut self, request: Request<'_>, message: Frame, out: &mut Outbox) -> Result<()>;

    /// A session finished authenticating.
    fn on_authenticated(&mut self, _connection: ConnectionId, _auth: &AuthorizationResult, _out: &mut Outbox) {}

    /// A token or request was refused.
    fn on_rejected(&mut self, _connection: ConnectionId, _error: &Error, _out: &mut Outbox) {}

    /// A session ended.
    fn on_closed(&mut self, _connection: ConnectionId) {}
}

/// Drives one [`Session`] per connection of a reactor.
pub struct Gateway<A: Application> {
    gate: SecurityGate,
    app: A,
    sessions: HashMap<ConnectionId, Session>,
    history_capacity: usize,
}

impl<A: Application> Gateway<A> {
    /// Gateway authorizing through `gate` and serving `app`.
    pub fn new(gate: SecurityGate, app: A, history_capacity: usize) -> Self {
        Self {
            gate,
            app,
            sessions: HashMap::new(),
            history_capacity,
        }
    }

    /// Session of `id`, if the connection is live.
    pub fn session(&self, id: ConnectionId) -> Option<&Session> {
        self.sessions.get(&id)
    }

    /// Live sessions.
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// The application.
    pub fn app(&self) -> &A {
        &self.app
    }

    /// The application, mutably.
    pub fn app_mut(&mut self) -> &mut A {
        &mut self.app
    }

    fn authenticate(&mut self, id: ConnectionId, message: Frame, out: &mut Outbox) -> Result<()> {
        let Self { gate, app, sessions, .. } = self;
        let session = sessions.get_mut(&id).ok_or(TransportError::UnknownConnection)?;

        let verdict = match std::str::from_utf8(&message.payload) {
            Ok(token) => gate.authorize(token),
            Err(_) => Err(AuthError::InvalidToken("token is not UTF-8".into())),
        };

        match verdict {
            Ok(auth) => {
                session.transition(SessionState::Ready)?;
                info!(conn = %id, identity = ?auth.identity, "session authenticated");
                app.on_authenticated(id, &auth, out);
                session.authorize(auth);
                Ok(())
            }
            Err(e) => {
                let failures = session.record_auth_failure();
                let err = if failures >= gate.config().max_auth_failures {
                    session.fail();
                    AuthError::TooManyFailures(failures)
                } else {
                    match e {
                        // Only an expiry during an established session closes it.
                        AuthError::Expired(at) => AuthError::InvalidToken(format!("token expired at {at}")),
                        other => other,
                    }
                };
                debug!(conn = %id, failures, error = %err, "authentication failed");
                let err = Error::Auth(err);
                app.on_rejected(id, &err, out);
                Err(err)
            }
        }
    }

    fn execute(&mut self, id: ConnectionId, message: Frame, out: &mut Outbox) -> Result<()> {
        let Self { gate, app, sessions, .. } = self;
        let session = sessions.get_mut(&id).ok_or(TransportError::UnknownConnection)?;

        let Some(auth) = session.authorization().cloned() else {
            let err = Error::Auth(AuthError::InvalidToken("session has no authorization".into()));
            app.on_rejected(id, &err, out);
            return Err(err);
        };

        let now = Utc::now();
        if let Err(e) = check_expiry(&auth, now) {
            session.fail();
            let err = Error::Auth(e);
            app.on_rejected(id, &err, out);
            return Err(err);
        }
        if gate.needs_refresh(&auth, now) {
            debug!(conn = %id, expiry = ?auth.token_expiry, "token inside refresh window");
        }

        if let Some(scope) = app.required_scope(&message) {
            if !gate.is_authorized(&auth, &scope) {
                let err = Error::Auth(AuthError::InsufficientScope(scope));
                app.on_rejected(id, &err, out);
                return Err(err);
            }
        }

        session.transition(SessionState::Executing)?;
        let request = Request {
            connection: id,
            authorization: &auth,
        };
        let result = app.execute(request, message, out);

        match &result {
            Err(e) if e.close_code().is_some() => session.fail(),
            _ => session.transition(SessionState::Ready)?,
        }
        result
    }
}

impl<A: Application> Handler for Gateway<A> {
    fn on_connect(&mut self, peer: &PeerInfo, out: &mut Outbox) -> Result<()> {
        let mut session = Session::new(peer.id, self.history_capacity);
        session.transition(SessionState::Handshake)?;
        session.transition(SessionState::Auth)?;

        if !self.gate.requires_token() {
            let auth = AuthorizationResult::anonymous();
            session.transition(SessionState::Ready)?;
            self.app.on_authenticated(peer.id, &auth, out);
            session.authorize(auth);
        }

        self.sessions.insert(peer.id, session);
        Ok(())
    }

    fn on_frame(&mut self, id: ConnectionId, message: Frame, out: &mut Outbox) -> Result<()> {
        let session = self.sessions.get_mut(&id).ok_or(TransportError::UnknownConnection)?;
        session.touch();

        match session.state() {
            SessionState::Auth => self.authenticate(id, message, out),
            SessionState::Ready => self.execute(id, message, out),
            state => Err(StateViolation {
                from: state,
                to: SessionState::Executing,
            }
            .into()),
        }
    }

    fn on_disconnect(&mut self, id: ConnectionId, code: CloseCode) {
        if let Some(mut session) = self.sessions.remove(&id) {
            session.shutdown();
            debug!(conn = %id, code = code.as_u16(), "session shut down");
            self.app.on_closed(id);
        }
    }
}
