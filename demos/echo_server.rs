//! Echo gateway.
//!
//! Authenticate with the token `demo` (or set `WSGATE_TOKEN_AUTH=false`),
//! then every message is sent back unchanged.

use std::sync::Arc;

use tracing::info;
use wsgate::config::load_config;
use wsgate::frame::Frame;
use wsgate::logging::init_subscriber;
use wsgate::security::{StaticTokenValidator, TokenClaims};
use wsgate::{Application, ConnectionId, Gateway, Outbox, Request, Result, SecurityGate, Server};

struct Echo;

impl Application for Echo {
    fn execute(&mut self, request: Request<'_>, message: Frame, out: &mut Outbox) -> Result<()> {
        info!(conn = %request.connection, len = message.payload.len(), "echo");
        out.send(Frame::new(message.opcode, message.payload));
        Ok(())
    }

    fn on_authenticated(&mut self, _connection: ConnectionId, _auth: &wsgate::AuthorizationResult, out: &mut Outbox) {
        out.text("welcome");
    }
}

fn main() -> Result<()> {
    init_subscriber("info");
    let config = load_config()?;

    let claims = TokenClaims {
        subject: "demo".into(),
        scopes: ["echo".to_string()].into_iter().collect(),
        ..TokenClaims::default()
    };
    let gate = SecurityGate::new(
        Arc::new(StaticTokenValidator::new().with_token("demo", claims)),
        config.security.clone(),
    );

    let history = config.history_capacity;
    let server = Server::start(config, move |_shard| Gateway::new(gate.clone(), Echo, history))?;
    info!(addr = %server.local_addr(), "echo gateway listening");
    server.join()
}
