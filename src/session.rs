//! Per-connection session lifecycle.
//!
//! ```text
//! Init -> Handshake -> Auth -> Ready <-> Executing
//!   any non-terminal state -> Error
//!   Error -> Init | Shutdown,  Ready -> Shutdown
//! ```

use std::collections::VecDeque;
use std::time::Instant;

use chrono::{DateTime, Utc};

use crate::connection::ConnectionId;
use crate::error::StateViolation;
use crate::security::AuthorizationResult;

/// Default number of transition records kept per session.
pub const DEFAULT_HISTORY_CAPACITY: usize = 32;

/// Session lifecycle states.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// Created, nothing negotiated
    Init,
    /// Upgrade negotiation
    Handshake,
    /// Waiting for a bearer token
    Auth,
    /// Authorized and idle
    Ready,
    /// Running one application request
    Executing,
    /// Failed; may recover to `Init` or shut down
    Error,
    /// Terminal
    Shutdown,
}

impl SessionState {
    /// States reachable from `self` in one step.
    pub fn allowed_targets(self) -> &'static [SessionState] {
        use SessionState::*;
        match self {
            Init => &[Handshake, Error],
            Handshake => &[Auth, Error],
            Auth => &[Ready, Error],
            Ready => &[Executing, Shutdown, Error],
            Executing => &[Ready, Error],
            Error => &[Init, Shutdown],
            Shutdown => &[],
        }
    }

    /// Whether `target` is a legal next state.
    pub fn can_transition(self, target: SessionState) -> bool {
        self.allowed_targets().contains(&target)
    }

    /// `Shutdown` only.
    pub fn is_terminal(self) -> bool {
        self == SessionState::Shutdown
    }
}

/// One accepted transition.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TransitionRecord {
    /// Previous state
    pub from: SessionState,
    /// New state
    pub to: SessionState,
    /// When the transition happened
    pub at: DateTime<Utc>,
}

/// Authenticated, stateful view of one connection.
#[derive(Debug)]
pub struct Session {
    connection: ConnectionId,
    state: SessionState,
    authorization: Option<AuthorizationResult>,
    last_activity: Instant,
    history: VecDeque<TransitionRecord>,
    history_capacity: usize,
    auth_failures: u32,
}

impl Session {
    /// New session in `Init` for `connection`.
    pub fn new(connection: ConnectionId, history_capacity: usize) -> Self {
        Self {
            connection,
            state: SessionState::Init,
            authorization: None,
            last_activity: Instant::now(),
            history: VecDeque::with_capacity(history_capacity.min(DEFAULT_HISTORY_CAPACITY)),
            history_capacity,
            auth_failures: 0,
        }
    }

    /// Move to `target` if the current state allows it.
    ///
    /// A rejected transition leaves the session untouched.
    pub fn transition(&mut self, target: SessionState) -> Result<(), StateViolation> {
        let from = self.state;
        if !from.can_transition(target) {
            return Err(StateViolation { from, to: target });
        }

        self.state = target;
        self.last_activity = Instant::now();

        if self.history_capacity > 0 {
            if self.history.len() == self.history_capacity {
                self.history.pop_front();
            }
            self.history.push_back(TransitionRecord {
                from,
                to: target,
                at: Utc::now(),
            });
        }

        tracing::trace!(conn = %self.connection, ?from, to = ?target, "session transition");
        Ok(())
    }

    /// Move to `Error` unless already there or shut down.
    pub fn fail(&mut self) {
        if self.state.can_transition(SessionState::Error) {
            let _ = self.transition(SessionState::Error);
        }
    }

    /// Drive the session to `Shutdown`, through `Error` when `Ready` is not
    /// the current state. No-op once terminal.
    pub fn shutdown(&mut self) {
        if self.state.is_terminal() {
            return;
        }
        if !self.state.can_transition(SessionState::Shutdown) {
            self.fail();
        }
        let _ = self.transition(SessionState::Shutdown);
    }

    /// Current state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Owning connection.
    pub fn connection(&self) -> ConnectionId {
        self.connection
    }

    /// Application payloads may only be delivered in `Ready` or `Executing`.
    pub fn accepts_payload(&self) -> bool {
        matches!(self.state, SessionState::Ready | SessionState::Executing)
    }

    /// Attach the result of a successful token validation.
    pub fn authorize(&mut self, result: AuthorizationResult) {
        self.authorization = Some(result);
        self.auth_failures = 0;
    }

    /// Authorization attached to this session, if any.
    pub fn authorization(&self) -> Option<&AuthorizationResult> {
        self.authorization.as_ref()
    }

    /// Count a failed authentication attempt and return the new total.
    pub fn record_auth_failure(&mut self) -> u32 {
        self.auth_failures = self.auth_failures.saturating_add(1);
        self.auth_failures
    }

    /// Failed authentication attempts since the last success.
    pub fn auth_failures(&self) -> u32 {
        self.auth_failures
    }

    /// Refresh the activity timestamp.
    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    /// Last transition or `touch`.
    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }

    /// Retained transitions, oldest first.
    pub fn history(&self) -> impl Iterator<Item = &TransitionRecord> {
        self.history.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn session() -> Session {
        Session::new(ConnectionId::new(0, 0), DEFAULT_HISTORY_CAPACITY)
    }

    fn ready() -> Session {
        let mut s = session();
        s.transition(SessionState::Handshake).unwrap();
        s.transition(SessionState::Auth).unwrap();
        s.transition(SessionState::Ready).unwrap();
        s
    }

    #[test]
    fn init_cannot_jump_to_ready() {
        let mut s = session();
        assert_matches!(
            s.transition(SessionState::Ready),
            Err(StateViolation { from: SessionState::Init, to: SessionState::Ready })
        );
        assert_eq!(s.state(), SessionState::Init);
        assert_eq!(s.history().count(), 0);
    }

    #[test]
    fn happy_path_reaches_ready() {
        let s = ready();
        assert_eq!(s.state(), SessionState::Ready);
        let steps: Vec<_> = s.history().map(|r| (r.from, r.to)).collect();
        assert_eq!(
            steps,
            [
                (SessionState::Init, SessionState::Handshake),
                (SessionState::Handshake, SessionState::Auth),
                (SessionState::Auth, SessionState::Ready),
            ]
        );
    }

    #[test]
    fn second_execute_is_rejected() {
        let mut s = ready();
        s.transition(SessionState::Executing).unwrap();
        assert_matches!(
            s.transition(SessionState::Executing),
            Err(StateViolation { from: SessionState::Executing, .. })
        );
        s.transition(SessionState::Ready).unwrap();
        s.transition(SessionState::Executing).unwrap();
    }

    #[test]
    fn error_recovers_or_shuts_down() {
        let mut s = session();
        s.transition(SessionState::Handshake).unwrap();
        s.fail();
        assert_eq!(s.state(), SessionState::Error);
        s.transition(SessionState::Init).unwrap();
        s.fail();
        s.transition(SessionState::Shutdown).unwrap();
        assert!(s.state().is_terminal());
        assert!(s.state().allowed_targets().is_empty());
    }

    #[test]
    fn shutdown_routes_through_error_when_needed() {
        let mut s = session();
        s.transition(SessionState::Handshake).unwrap();
        s.transition(SessionState::Auth).unwrap();
        s.shutdown();
        assert_eq!(s.state(), SessionState::Shutdown);
        let last_two: Vec<_> = s.history().skip(2).map(|r| r.to).collect();
        assert_eq!(last_two, [SessionState::Error, SessionState::Shutdown]);

        let mut r = ready();
        r.shutdown();
        assert_eq!(r.history().last().map(|t| t.from), Some(SessionState::Ready));
    }

    #[test]
    fn payload_gate_follows_state() {
        let mut s = session();
        assert!(!s.accepts_payload());
        s.transition(SessionState::Handshake).unwrap();
        s.transition(SessionState::Auth).unwrap();
        assert!(!s.accepts_payload());
        s.transition(SessionState::Ready).unwrap();
        assert!(s.accepts_payload());
        s.transition(SessionState::Executing).unwrap();
        assert!(s.accepts_payload());
    }

    #[test]
    fn history_is_bounded() {
        let mut s = Session::new(ConnectionId::new(0, 0), 3);
        s.transition(SessionState::Handshake).unwrap();
        s.transition(SessionState::Auth).unwrap();
        s.transition(SessionState::Ready).unwrap();
        for _ in 0..5 {
            s.transition(SessionState::Executing).unwrap();
            s.transition(SessionState::Ready).unwrap();
        }
        assert_eq!(s.history().count(), 3);
        assert_eq!(s.history().last().map(|r| r.to), Some(SessionState::Ready));
        assert!(s.history().all(|r| r.from != SessionState::Init));
    }
}
