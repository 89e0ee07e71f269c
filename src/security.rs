//! Bearer-token authorization.
//!
//! Token validation is delegated to a [`TokenValidator`]; the gate turns its
//! verdict into an [`AuthorizationResult`] and answers scope and role queries.
//! Every failure path denies.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::SecurityConfig;
use crate::error::AuthError;

/// Scope that grants every other scope.
pub const WILDCARD_SCOPE: &str = "*";

/// Claims extracted from a valid token.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TokenClaims {
    /// Token subject
    pub subject: String,
    /// Granted scopes
    pub scopes: BTreeSet<String>,
    /// Granted roles
    pub roles: BTreeSet<String>,
    /// Expiry, if the token has one
    pub expires_at: Option<DateTime<Utc>>,
}

/// Verdict of a [`TokenValidator`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Validation {
    /// Token accepted
    Valid(TokenClaims),
    /// Token rejected, with the validator's reason
    Invalid(String),
}

/// The validator could not reach its token authority.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct Unreachable(pub String);

/// External token verification.
pub trait TokenValidator: Send + Sync {
    /// Check `token` and return its claims.
    fn validate(&self, token: &str) -> Result<Validation, Unreachable>;
}

/// Outcome of a successful authorization. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizationResult {
    /// Whether the holder is authenticated
    pub authenticated: bool,
    /// Token subject, if any
    pub identity: Option<String>,
    /// Granted scopes
    pub scopes: BTreeSet<String>,
    /// Granted roles
    pub roles: BTreeSet<String>,
    /// Token expiry, if the token has one
    pub token_expiry: Option<DateTime<Utc>>,
}

impl AuthorizationResult {
    /// Authenticated with no identity, scopes or roles. Used when token
    /// authentication is disabled.
    pub fn anonymous() -> Self {
        Self {
            authenticated: true,
            identity: None,
            scopes: BTreeSet::new(),
            roles: BTreeSet::new(),
            token_expiry: None,
        }
    }

    fn from_claims(claims: TokenClaims) -> Self {
        Self {
            authenticated: true,
            identity: Some(claims.subject),
            scopes: claims.scopes,
            roles: claims.roles,
            token_expiry: claims.expires_at,
        }
    }
}

/// Authorization front door shared by every session of a server.
#[derive(Clone)]
pub struct SecurityGate {
    validator: Arc<dyn TokenValidator>,
    config: SecurityConfig,
}

impl SecurityGate {
    /// Gate backed by `validator`.
    pub fn new(validator: Arc<dyn TokenValidator>, config: SecurityConfig) -> Self {
        Self { validator, config }
    }

    /// Gate settings.
    pub fn config(&self) -> &SecurityConfig {
        &self.config
    }

    /// Whether sessions must present a token.
    pub fn requires_token(&self) -> bool {
        self.config.enable_token_auth
    }

    /// Validate `token` against the current time.
    pub fn authorize(&self, token: &str) -> Result<AuthorizationResult, AuthError> {
        self.authorize_at(token, Utc::now())
    }

    /// Validate `token` as of `now`.
    ///
    /// An unreachable validator denies. An expiry at or before `now` is
    /// rejected even when the validator accepted the token.
    pub fn authorize_at(&self, token: &str, now: DateTime<Utc>) -> Result<AuthorizationResult, AuthError> {
        if !self.config.enable_token_auth {
            return Ok(AuthorizationResult::anonymous());
        }

        let token = token.trim();
        if token.is_empty() {
            return Err(AuthError::InvalidToken("empty token".into()));
        }
        let fingerprint = token_fingerprint(token);

        let claims = match self.validator.validate(token) {
            Ok(Validation::Valid(claims)) => claims,
            Ok(Validation::Invalid(reason)) => {
                debug!(token = %fingerprint, %reason, "token rejected");
                return Err(AuthError::InvalidToken(reason));
            }
            Err(Unreachable(reason)) => {
                warn!(token = %fingerprint, %reason, "token authority unreachable, denying");
                return Err(AuthError::Unreachable(reason));
            }
        };

        let result = AuthorizationResult::from_claims(claims);
        check_expiry(&result, now)?;
        debug!(token = %fingerprint, identity = ?result.identity, "token accepted");
        Ok(result)
    }

    /// Whether `result` grants `scope`.
    ///
    /// An empty scope is always granted to authenticated holders; otherwise
    /// the scope must be listed or the wildcard granted.
    pub fn is_authorized(&self, result: &AuthorizationResult, scope: &str) -> bool {
        if !result.authenticated {
            return false;
        }
        scope.is_empty() || result.scopes.contains(scope) || result.scopes.contains(WILDCARD_SCOPE)
    }

    /// Whether `result` carries `role`.
    pub fn has_role(&self, result: &AuthorizationResult, role: &str) -> bool {
        result.authenticated && result.roles.contains(role)
    }

    /// Whether the token behind `result` is inside its refresh window.
    pub fn needs_refresh(&self, result: &AuthorizationResult, now: DateTime<Utc>) -> bool {
        match result.token_expiry {
            Some(expiry) => now >= expiry - self.config.refresh_window(),
            None => false,
        }
    }
}

/// Reject results whose token expired at or before `now`.
pub fn check_expiry(result: &AuthorizationResult, now: DateTime<Utc>) -> Result<(), AuthError> {
    match result.token_expiry {
        Some(expiry) if expiry <= now => Err(AuthError::Expired(expiry)),
        _ => Ok(()),
    }
}

/// Short, non-reversible token identifier for logs.
pub fn token_fingerprint(token: &str) -> String {
    let digest = Sha256::digest(token.as_bytes());
    digest[..6].iter().map(|b| format!("{b:02x}")).collect()
}

/// Fixed token table.
#[derive(Debug, Default)]
pub struct StaticTokenValidator {
    tokens: HashMap<String, TokenClaims>,
}

impl StaticTokenValidator {
    /// Empty table; every token is invalid.
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept `token` with `claims`.
    pub fn with_token(mut self, token: impl Into<String>, claims: TokenClaims) -> Self {
        self.tokens.insert(token.into(), claims);
        self
    }
}

impl TokenValidator for StaticTokenValidator {
    fn validate(&self, token: &str) -> Result<Validation, Unreachable> {
        Ok(match self.tokens.get(token) {
            Some(claims) => Validation::Valid(claims.clone()),
            None => Validation::Invalid("unknown token".into()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use chrono::Duration;

    struct Offline;

    impl TokenValidator for Offline {
        fn validate(&self, _token: &str) -> Result<Validation, Unreachable> {
            Err(Unreachable("connection refused".into()))
        }
    }

    fn claims(scopes: &[&str], expires_at: Option<DateTime<Utc>>) -> TokenClaims {
        TokenClaims {
            subject: "alice".into(),
            scopes: scopes.iter().map(|s| s.to_string()).collect(),
            roles: ["admin".to_string()].into_iter().collect(),
            expires_at,
        }
    }

    fn gate(validator: impl TokenValidator + 'static) -> SecurityGate {
        SecurityGate::new(Arc::new(validator), SecurityConfig::default())
    }

    #[test]
    fn valid_token_yields_claims() {
        let g = gate(StaticTokenValidator::new().with_token("t1", claims(&["read"], None)));
        let r = g.authorize("t1").unwrap();
        assert!(r.authenticated);
        assert_eq!(r.identity.as_deref(), Some("alice"));
        assert!(g.is_authorized(&r, "read"));
        assert!(!g.is_authorized(&r, "write"));
        assert!(g.is_authorized(&r, ""));
        assert!(g.has_role(&r, "admin"));
        assert!(!g.has_role(&r, "ops"));
    }

    #[test]
    fn unknown_and_empty_tokens_are_invalid() {
        let g = gate(StaticTokenValidator::new());
        assert_matches!(g.authorize("nope"), Err(AuthError::InvalidToken(_)));
        assert_matches!(g.authorize("  "), Err(AuthError::InvalidToken(_)));
    }

    #[test]
    fn unreachable_validator_denies() {
        let g = gate(Offline);
        assert_matches!(g.authorize("anything"), Err(AuthError::Unreachable(_)));
    }

    #[test]
    fn expired_token_is_rejected() {
        let now = Utc::now();
        let expiry = now - Duration::seconds(1);
        let g = gate(StaticTokenValidator::new().with_token("old", claims(&[], Some(expiry))));
        assert_matches!(g.authorize_at("old", now), Err(AuthError::Expired(at)) if at == expiry);
    }

    #[test]
    fn wildcard_scope_grants_everything() {
        let g = gate(StaticTokenValidator::new().with_token("root", claims(&["*"], None)));
        let r = g.authorize("root").unwrap();
        assert!(g.is_authorized(&r, "anything"));
    }

    #[test]
    fn unauthenticated_result_grants_nothing() {
        let g = gate(StaticTokenValidator::new());
        let mut r = AuthorizationResult::anonymous();
        r.authenticated = false;
        r.scopes.insert("*".into());
        r.roles.insert("admin".into());
        assert!(!g.is_authorized(&r, ""));
        assert!(!g.has_role(&r, "admin"));
    }

    #[test]
    fn disabled_auth_is_anonymous() {
        let g = SecurityGate::new(
            Arc::new(Offline),
            SecurityConfig {
                enable_token_auth: false,
                ..SecurityConfig::default()
            },
        );
        let r = g.authorize("").unwrap();
        assert_eq!(r, AuthorizationResult::anonymous());
        assert!(g.is_authorized(&r, ""));
        assert!(!g.is_authorized(&r, "read"));
    }

    #[test]
    fn refresh_window_boundaries() {
        let g = gate(StaticTokenValidator::new());
        let now = Utc::now();
        let mut r = AuthorizationResult::anonymous();

        r.token_expiry = Some(now + Duration::seconds(3_600));
        assert!(g.needs_refresh(&r, now));

        r.token_expiry = Some(now + Duration::seconds(3_601));
        assert!(!g.needs_refresh(&r, now));

        r.token_expiry = None;
        assert!(!g.needs_refresh(&r, now));
    }

    #[test]
    fn fingerprint_is_stable_and_short() {
        let a = token_fingerprint("secret");
        assert_eq!(a.len(), 12);
        assert_eq!(a, token_fingerprint("secret"));
        assert_ne!(a, token_fingerprint("secret2"));
        assert!(!a.contains("secret"));
    }
}
