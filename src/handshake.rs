//! Upgrade handshake negotiation.
//!
//! Builds and parses the HTTP/1.1 upgrade request and the `101` response that
//! switch a plain TCP stream into framed mode.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use sha1::{Digest, Sha1};

use crate::error::ProtocolError;

/// Maximum size of a request or response head, terminator included.
pub const MAX_HEAD_LEN: usize = 8 * 1024;
/// Value of the `Upgrade` header.
pub const PROTOCOL_NAME: &str = "websocket";
/// Value of the `Sec-WebSocket-Version` header.
pub const PROTOCOL_VERSION: &str = "13";

const ACCEPT_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";
const HEAD_TERMINATOR: &[u8] = b"\r\n\r\n";

const H_HOST: &str = "Host";
const H_UPGRADE: &str = "Upgrade";
const H_CONNECTION: &str = "Connection";
const H_KEY: &str = "Sec-WebSocket-Key";
const H_VERSION: &str = "Sec-WebSocket-Version";
const H_PROTOCOL: &str = "Sec-WebSocket-Protocol";
const H_ACCEPT: &str = "Sec-WebSocket-Accept";

/// Client side of the negotiation: the request bytes and the key they carry.
#[derive(Debug, Clone)]
pub struct ClientHandshake {
    /// Base64 of 16 random bytes
    pub key: String,
    /// Serialized request head
    pub bytes: Vec<u8>,
}

impl ClientHandshake {
    /// The accept token a conforming server must answer with.
    pub fn expected_accept(&self) -> String {
        accept_key(&self.key)
    }
}

/// Fields extracted from a valid upgrade request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    /// Request target
    pub path: String,
    /// `Host` header, if sent
    pub host: Option<String>,
    /// Client key
    pub key: String,
    /// Comma-separated subprotocols offered by the client
    pub protocols: Option<String>,
}

impl RequestHead {
    /// Offered subprotocols, in client preference order.
    pub fn offered_protocols(&self) -> impl Iterator<Item = &str> {
        self.protocols
            .as_deref()
            .unwrap_or("")
            .split(',')
            .map(str::trim)
            .filter(|p| !p.is_empty())
    }
}

/// Outcome of parsing a server response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHead {
    /// Status 101 with all required headers
    pub accepted: bool,
    /// Subprotocol selected by the server
    pub protocol: Option<String>,
    /// `Sec-WebSocket-Accept` value
    pub accept: Option<String>,
}

/// Derive the accept token: base64(SHA-1(key || GUID)).
pub fn accept_key(client_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(client_key.as_bytes());
    hasher.update(ACCEPT_GUID.as_bytes());
    BASE64.encode(hasher.finalize())
}

/// Offset just past the blank line ending a head, if it has arrived.
pub fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(HEAD_TERMINATOR.len())
        .position(|w| w == HEAD_TERMINATOR)
        .map(|pos| pos + HEAD_TERMINATOR.len())
}

/// First client-offered protocol that the server supports.
pub fn negotiate_protocol(request: &RequestHead, supported: &[String]) -> Option<String> {
    request
        .offered_protocols()
        .find(|offered| supported.iter().any(|s| s == offered))
        .map(str::to_string)
}

/// Build an upgrade request with a fresh random key.
pub fn build_request(host: &str, path: &str, protocols: Option<&str>) -> ClientHandshake {
    let key = BASE64.encode(rand::random::<[u8; 16]>());

    let mut head = format!(
        "GET {path} HTTP/1.1\r\n\
         {H_HOST}: {host}\r\n\
         {H_UPGRADE}: {PROTOCOL_NAME}\r\n\
         {H_CONNECTION}: Upgrade\r\n\
         {H_KEY}: {key}\r\n\
         {H_VERSION}: {PROTOCOL_VERSION}\r\n"
    );
    if let Some(protocols) = protocols.filter(|p| !p.is_empty()) {
        head.push_str(&format!("{H_PROTOCOL}: {protocols}\r\n"));
    }
    head.push_str("\r\n");

    ClientHandshake {
        key,
        bytes: head.into_bytes(),
    }
}

/// Validate an upgrade request.
///
/// Any missing or mismatched required header is an error; the caller closes
/// the connection without writing a response.
pub fn parse_request(bytes: &[u8]) -> Result<RequestHead, ProtocolError> {
    let head = Head::parse(bytes)?;

    let mut parts = head.start_line.split_whitespace();
    let (Some(method), Some(path), Some(version), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(ProtocolError::MalformedHandshake("bad request line"));
    };
    if method != "GET" {
        return Err(ProtocolError::MalformedHandshake("method must be GET"));
    }
    if version != "HTTP/1.1" {
        return Err(ProtocolError::MalformedHandshake("unsupported HTTP version"));
    }

    head.expect_upgrade()?;

    let version = head.require(H_VERSION)?;
    if version != PROTOCOL_VERSION {
        return Err(ProtocolError::InvalidHeader {
            header: H_VERSION,
            value: version.to_string(),
        });
    }

    let key = head.require(H_KEY)?;
    if !matches!(BASE64.decode(key), Ok(raw) if raw.len() == 16) {
        return Err(ProtocolError::InvalidHeader {
            header: H_KEY,
            value: key.to_string(),
        });
    }

    Ok(RequestHead {
        path: path.to_string(),
        host: head.get(H_HOST).map(str::to_string),
        key: key.to_string(),
        protocols: head.get(H_PROTOCOL).map(str::to_string),
    })
}

/// Build the `101 Switching Protocols` response for `client_key`.
pub fn build_response(client_key: &str, protocol: Option<&str>) -> Vec<u8> {
    let accept = accept_key(client_key);

    let mut head = format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         {H_UPGRADE}: {PROTOCOL_NAME}\r\n\
         {H_CONNECTION}: Upgrade\r\n\
         {H_ACCEPT}: {accept}\r\n"
    );
    if let Some(protocol) = protocol.filter(|p| !p.is_empty()) {
        head.push_str(&format!("{H_PROTOCOL}: {protocol}\r\n"));
    }
    head.push_str("\r\n");
    head.into_bytes()
}

/// Parse a server response.
///
/// A well-formed response that is not an accepted upgrade yields
/// `accepted == false` rather than an error.
pub fn parse_response(bytes: &[u8]) -> Result<ResponseHead, ProtocolError> {
    let head = Head::parse(bytes)?;

    let mut parts = head.start_line.split_whitespace();
    let (Some(version), Some(status)) = (parts.next(), parts.next()) else {
        return Err(ProtocolError::MalformedHandshake("bad status line"));
    };
    if !version.starts_with("HTTP/") {
        return Err(ProtocolError::MalformedHandshake("bad status line"));
    }

    let accept = head.get(H_ACCEPT).map(str::to_string);
    let accepted = status == "101" && head.expect_upgrade().is_ok() && accept.is_some();

    Ok(ResponseHead {
        accepted,
        protocol: head.get(H_PROTOCOL).map(str::to_string),
        accept,
    })
}

struct Head<'a> {
    start_line: &'a str,
    headers: Vec<(&'a str, &'a str)>,
}

impl<'a> Head<'a> {
    fn parse(bytes: &'a [u8]) -> Result<Self, ProtocolError> {
        if bytes.len() > MAX_HEAD_LEN {
            return Err(ProtocolError::HandshakeTooLarge {
                limit: MAX_HEAD_LEN,
            });
        }
        let text = std::str::from_utf8(bytes)
            .map_err(|_| ProtocolError::MalformedHandshake("head is not UTF-8"))?;

        let mut lines = text.split("\r\n");
        let start_line = lines
            .next()
            .filter(|l| !l.is_empty())
            .ok_or(ProtocolError::MalformedHandshake("empty head"))?;

        let mut headers = Vec::new();
        for line in lines.take_while(|l| !l.is_empty()) {
            let (name, value) = line
                .split_once(':')
                .ok_or(ProtocolError::MalformedHandshake("header line without colon"))?;
            headers.push((name.trim(), value.trim()));
        }

        Ok(Self {
            start_line,
            headers,
        })
    }

    fn get(&self, name: &str) -> Option<&'a str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| *v)
    }

    fn require(&self, name: &'static str) -> Result<&'a str, ProtocolError> {
        self.get(name).ok_or(ProtocolError::MissingHeader(name))
    }

    fn expect_upgrade(&self) -> Result<(), ProtocolError> {
        let upgrade = self.require(H_UPGRADE)?;
        if !upgrade.eq_ignore_ascii_case(PROTOCOL_NAME) {
            return Err(ProtocolError::InvalidHeader {
                header: H_UPGRADE,
                value: upgrade.to_string(),
            });
        }

        let connection = self.require(H_CONNECTION)?;
        if !connection
            .split(',')
            .any(|token| token.trim().eq_ignore_ascii_case("upgrade"))
        {
            return Err(ProtocolError::InvalidHeader {
                header: H_CONNECTION,
                value: connection.to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    const SAMPLE_KEY: &str = "dGhlIHNhbXBsZSBub25jZQ==";

    fn request_without(skip: &str) -> Vec<u8> {
        let lines = [
            "GET /chat HTTP/1.1",
            "Host: server.example.com",
            "Upgrade: websocket",
            "Connection: Upgrade",
            "Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==",
            "Sec-WebSocket-Version: 13",
        ];
        let mut out = String::new();
        for line in lines.iter().filter(|l| !l.starts_with(skip)) {
            out.push_str(line);
            out.push_str("\r\n");
        }
        out.push_str("\r\n");
        out.into_bytes()
    }

    #[test]
    fn accept_key_matches_reference_vector() {
        assert_eq!(accept_key(SAMPLE_KEY), "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
    }

    #[test]
    fn built_request_parses_back() {
        let hs = build_request("example.com:80", "/rpc", Some("polycall.v1, chat"));
        let head = parse_request(&hs.bytes).unwrap();
        assert_eq!(head.key, hs.key);
        assert_eq!(head.path, "/rpc");
        assert_eq!(head.host.as_deref(), Some("example.com:80"));
        assert_eq!(
            head.offered_protocols().collect::<Vec<_>>(),
            ["polycall.v1", "chat"]
        );
    }

    #[test]
    fn request_keys_are_fresh() {
        let a = build_request("h", "/", None);
        let b = build_request("h", "/", None);
        assert_ne!(a.key, b.key);
        assert!(!String::from_utf8(a.bytes).unwrap().contains(H_PROTOCOL));
    }

    #[test]
    fn each_required_header_is_enforced() {
        assert!(parse_request(&request_without("X-None")).is_ok());
        assert_matches!(
            parse_request(&request_without("Connection")),
            Err(ProtocolError::MissingHeader("Connection"))
        );
        assert_matches!(
            parse_request(&request_without("Upgrade")),
            Err(ProtocolError::MissingHeader("Upgrade"))
        );
        assert_matches!(
            parse_request(&request_without("Sec-WebSocket-Version")),
            Err(ProtocolError::MissingHeader("Sec-WebSocket-Version"))
        );
        assert_matches!(
            parse_request(&request_without("Sec-WebSocket-Key")),
            Err(ProtocolError::MissingHeader("Sec-WebSocket-Key"))
        );
    }

    #[test]
    fn mismatched_values_are_rejected() {
        let req = String::from_utf8(request_without("X-None")).unwrap();

        let post = req.replacen("GET", "POST", 1);
        assert_matches!(
            parse_request(post.as_bytes()),
            Err(ProtocolError::MalformedHandshake(_))
        );

        let old = req.replace("Version: 13", "Version: 8");
        assert_matches!(
            parse_request(old.as_bytes()),
            Err(ProtocolError::InvalidHeader { header: "Sec-WebSocket-Version", .. })
        );

        let keep_alive = req.replace("Connection: Upgrade", "Connection: keep-alive");
        assert_matches!(
            parse_request(keep_alive.as_bytes()),
            Err(ProtocolError::InvalidHeader { header: "Connection", .. })
        );

        let short_key = req.replace(SAMPLE_KEY, "c2hvcnQ=");
        assert_matches!(
            parse_request(short_key.as_bytes()),
            Err(ProtocolError::InvalidHeader { header: "Sec-WebSocket-Key", .. })
        );
    }

    #[test]
    fn header_names_are_case_insensitive() {
        let req = String::from_utf8(request_without("X-None"))
            .unwrap()
            .replace("Connection: Upgrade", "connection: keep-alive, upgrade")
            .replace("Upgrade: websocket", "upgrade: WebSocket");
        assert!(parse_request(req.as_bytes()).is_ok());
    }

    #[test]
    fn response_roundtrip() {
        let bytes = build_response(SAMPLE_KEY, Some("chat"));
        let head = parse_response(&bytes).unwrap();
        assert!(head.accepted);
        assert_eq!(head.protocol.as_deref(), Some("chat"));
        assert_eq!(head.accept.as_deref(), Some("s3pPLMBiTxaQ9kYGzzhZRbK+xOo="));
    }

    #[test]
    fn non_upgrade_response_is_not_accepted() {
        let bytes = b"HTTP/1.1 400 Bad Request\r\nContent-Length: 0\r\n\r\n";
        assert!(!parse_response(bytes).unwrap().accepted);

        let missing_accept = b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\r\n";
        assert!(!parse_response(missing_accept).unwrap().accepted);
    }

    #[test]
    fn head_end_detection() {
        assert_eq!(find_head_end(b"GET / HTTP/1.1\r\n"), None);
        let bytes = b"GET / HTTP/1.1\r\n\r\n\x81\x00";
        assert_eq!(find_head_end(bytes), Some(bytes.len() - 2));
    }

    #[test]
    fn protocol_negotiation_prefers_client_order() {
        let head = RequestHead {
            path: "/".into(),
            host: None,
            key: SAMPLE_KEY.into(),
            protocols: Some("b, a".into()),
        };
        let supported = vec!["a".to_string(), "b".to_string()];
        assert_eq!(negotiate_protocol(&head, &supported).as_deref(), Some("b"));
        assert_eq!(negotiate_protocol(&head, &[]), None);
    }

    #[test]
    fn oversized_head_is_rejected() {
        let big = vec![b'a'; MAX_HEAD_LEN + 1];
        assert_matches!(
            parse_request(&big),
            Err(ProtocolError::HandshakeTooLarge { .. })
        );
    }
}
