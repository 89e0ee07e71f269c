#![doc = include_str!("../README.md")]
#![deny(unsafe_code, missing_docs)]

pub mod assembler;
pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod fault;
pub mod frame;
pub mod gateway;
pub mod handshake;
pub mod logging;
pub mod opcode;
pub mod reactor;
pub mod registry;
pub mod security;
pub mod server;
pub mod session;

pub use client::{Client, ClientOptions, Message, ReconnectPolicy};
pub use config::GatewayConfig;
pub use connection::ConnectionId;
pub use error::{CloseCode, Error, ErrorKind, Result};
pub use frame::Frame;
pub use gateway::{Application, Gateway, Request};
pub use opcode::Opcode;
pub use reactor::{Handler, Outbox, PeerInfo, Reactor, ReactorHandle};
pub use security::{AuthorizationResult, SecurityGate, TokenValidator};
pub use server::Server;
pub use session::{Session, SessionState};

#[cfg(test)]
mod tests {
    use crate::assembler::Assembler;
    use crate::frame::{self, Decoded, Frame};
    use crate::handshake;
    use crate::opcode::Opcode;
    use crate::session::{Session, SessionState};
    use crate::ConnectionId;

    #[test]
    fn test_handshake_roundtrip() {
        let request = handshake::build_request("localhost:8080", "/ws", Some("chat"));
        let head = handshake::parse_request(&request.bytes).expect("failed to parse request");
        assert_eq!(head.path, "/ws");

        let response = handshake::build_response(&head.key, Some("chat"));
        let parsed = handshake::parse_response(&response).expect("failed to parse response");
        assert!(parsed.accepted);
        assert_eq!(parsed.accept, Some(request.expected_accept()));
    }

    #[test]
    fn test_masked_frame_decode() {
        let bytes = frame::encode(&Frame::text("ping me"), true).expect("failed to encode frame");
        match frame::decode(&bytes).expect("failed to decode frame") {
            Decoded::Complete { frame, consumed } => {
                assert_eq!(consumed, bytes.len());
                assert!(frame.masked());
                assert_eq!(frame.as_text().unwrap(), "ping me");
            }
            Decoded::Incomplete => panic!("frame should be complete"),
        }
    }

    #[test]
    fn test_session_lifecycle() {
        let mut session = Session::new(ConnectionId::new(1, 0), 8);
        session.transition(SessionState::Handshake).unwrap();
        session.transition(SessionState::Auth).unwrap();
        session.transition(SessionState::Ready).unwrap();
        assert!(session.transition(SessionState::Auth).is_err()); // illegal
        session.shutdown();
        assert!(session.state().is_terminal());
    }

    #[test]
    fn test_assembler_buffering() {
        let mut assembler = Assembler::new(64);

        // First fragment only opens the message
        assert!(assembler.push(Frame::binary(vec![1]).with_fin(false)).unwrap().is_none());
        let message = assembler.push(Frame::continuation(vec![2], true)).unwrap().unwrap();
        assert_eq!(message.opcode, Opcode::Binary);
        assert_eq!(message.payload, [1, 2]);
    }
}
