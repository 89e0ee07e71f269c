//! Fault reporting hook for connection-scoped failures.

use std::fmt;
use std::net::SocketAddr;

use crate::connection::ConnectionId;
use crate::error::Error;

/// A failure the reactor recovered from by dropping one connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fault {
    /// Connection the fault belongs to, if it had been registered
    pub connection: Option<ConnectionId>,
    /// Remote address, if known
    pub peer: Option<SocketAddr>,
    /// Where in the reactor the fault surfaced (accept, read, write, ...)
    pub context: &'static str,
    /// Rendered error
    pub message: String,
}

impl Fault {
    /// Fault raised while serving `connection`.
    pub fn new(context: &'static str, connection: Option<ConnectionId>, peer: Option<SocketAddr>, error: &Error) -> Self {
        Self {
            connection,
            peer,
            context,
            message: error.to_string(),
        }
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.context, self.message)?;
        if let Some(id) = self.connection {
            write!(f, " (conn {id})")?;
        }
        Ok(())
    }
}

/// Receives every fault the reactor recovers from.
pub trait FaultReporter: Send + Sync {
    /// Record one fault. Must not block.
    fn report(&self, fault: &Fault);
}

/// Emits faults as `tracing` warnings.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingFaultReporter;

impl FaultReporter for TracingFaultReporter {
    fn report(&self, fault: &Fault) {
        tracing::warn!(
            context = fault.context,
            conn = ?fault.connection,
            peer = ?fault.peer,
            error = %fault.message,
            "connection fault"
        );
    }
}
