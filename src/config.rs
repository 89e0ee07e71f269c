//! Gateway configuration with deep merge and environment overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`GatewayConfig::default()`]
//! 2. If a JSON config file exists, deep-merge its values over the defaults
//! 3. Apply `WSGATE_*` environment overrides (highest priority)
//! 4. [`GatewayConfig::validate`]
//!
//! Configuration is read once at startup and passed by reference afterwards.

use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::connection::Transport;
use crate::error::ConfigError;

/// Environment variable naming an alternative config file.
pub const CONFIG_PATH_ENV: &str = "WSGATE_CONFIG";

/// Top-level gateway configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Listening address
    pub bind_address: SocketAddr,
    /// Listener transport; only `stream` is served
    pub transport: Transport,
    /// Registry capacity
    pub max_connections: usize,
    /// Idle time before a connection is closed, in milliseconds (0 disables)
    pub connection_timeout_ms: u64,
    /// Keep-alive ping period, in milliseconds (0 disables)
    pub ping_interval_ms: u64,
    /// Largest accepted message, in bytes
    pub max_message_size: usize,
    /// Number of reactor threads run by the server
    pub worker_threads: usize,
    /// Upper bound on one readiness wait, in milliseconds
    pub poll_timeout_ms: u64,
    /// Transitions retained per session
    pub history_capacity: usize,
    /// Subprotocols the server accepts, in preference order
    pub subprotocols: Vec<String>,
    /// Token authentication
    pub security: SecurityConfig,
    /// Client reconnect behaviour
    pub reconnect: ReconnectConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind_address: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 8080)),
            transport: Transport::Stream,
            max_connections: 1024,
            connection_timeout_ms: 30_000,
            ping_interval_ms: 30_000,
            max_message_size: 65_536,
            worker_threads: 4,
            poll_timeout_ms: 1_000,
            history_capacity: 32,
            subprotocols: Vec::new(),
            security: SecurityConfig::default(),
            reconnect: ReconnectConfig::default(),
        }
    }
}

impl GatewayConfig {
    /// Idle timeout, `None` when disabled.
    pub fn connection_timeout(&self) -> Option<Duration> {
        (self.connection_timeout_ms > 0).then(|| Duration::from_millis(self.connection_timeout_ms))
    }

    /// Ping period, `None` when disabled.
    pub fn ping_interval(&self) -> Option<Duration> {
        (self.ping_interval_ms > 0).then(|| Duration::from_millis(self.ping_interval_ms))
    }

    /// Readiness wait bound.
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    /// Reject values the gateway cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.transport != Transport::Stream {
            return Err(ConfigError::UnsupportedTransport(self.transport));
        }
        if self.max_connections == 0 {
            return Err(invalid("max_connections", "must be at least 1"));
        }
        if self.worker_threads == 0 {
            return Err(invalid("worker_threads", "must be at least 1"));
        }
        if self.max_message_size == 0 {
            return Err(invalid("max_message_size", "must be at least 1"));
        }
        if self.max_message_size as u64 > u64::from(u32::MAX) {
            return Err(invalid("max_message_size", "must fit in 32 bits"));
        }
        if self.poll_timeout_ms == 0 {
            return Err(invalid("poll_timeout_ms", "must be at least 1"));
        }
        if self.security.enable_token_auth && self.security.max_auth_failures == 0 {
            return Err(invalid("security.max_auth_failures", "must be at least 1"));
        }
        if self.reconnect.max_delay_ms < self.reconnect.base_delay_ms {
            return Err(invalid("reconnect.max_delay_ms", "must not be below base_delay_ms"));
        }
        Ok(())
    }
}

/// Token authentication settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// Require a bearer token before any application message
    pub enable_token_auth: bool,
    /// Failed attempts tolerated before the connection is closed
    pub max_auth_failures: u32,
    /// Window before expiry in which a token should be refreshed, in seconds
    pub token_refresh_interval_secs: u64,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            enable_token_auth: true,
            max_auth_failures: 5,
            token_refresh_interval_secs: 3_600,
        }
    }
}

impl SecurityConfig {
    /// Refresh window as a chrono duration, capped at ten years.
    pub fn refresh_window(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.token_refresh_interval_secs.min(315_360_000) as i64)
    }
}

/// Client reconnect settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// Retry failed connects at all
    pub enabled: bool,
    /// Connect attempts including the first
    pub max_attempts: u32,
    /// Delay before the first retry, in milliseconds
    pub base_delay_ms: u64,
    /// Cap on the exponential backoff, in milliseconds
    pub max_delay_ms: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_attempts: 5,
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
        }
    }
}

fn invalid(field: &'static str, reason: &'static str) -> ConfigError {
    ConfigError::Invalid { field, reason }
}

/// Load the config named by `WSGATE_CONFIG`, or defaults plus environment.
pub fn load_config() -> Result<GatewayConfig, ConfigError> {
    match read_env_string(CONFIG_PATH_ENV) {
        Some(path) => load_config_from_path(&PathBuf::from(path)),
        None => {
            let mut config = GatewayConfig::default();
            apply_env_overrides(&mut config);
            config.validate()?;
            Ok(config)
        }
    }
}

/// Load a config file with environment overrides.
///
/// A missing file yields defaults; a malformed one is an error.
pub fn load_config_from_path(path: &Path) -> Result<GatewayConfig, ConfigError> {
    let defaults = serde_json::to_value(GatewayConfig::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading config from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "config file not found, using defaults");
        defaults
    };

    let mut config: GatewayConfig = serde_json::from_value(merged)?;
    apply_env_overrides(&mut config);
    config.validate()?;
    Ok(config)
}

/// Recursive merge: objects merge per key, everything else is replaced, and
/// nulls in `source` are skipped.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = match target_map.remove(&key) {
                    Some(target_val) => deep_merge(target_val, source_val),
                    None => source_val,
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply `WSGATE_*` overrides from the process environment.
///
/// Out-of-range or unparsable values are ignored with a warning.
pub fn apply_env_overrides(config: &mut GatewayConfig) {
    apply_overrides(config, |name| std::env::var(name).ok());
}

/// Apply overrides from an arbitrary variable source.
pub fn apply_overrides(config: &mut GatewayConfig, lookup: impl Fn(&str) -> Option<String>) {
    let env = Env(lookup);

    if let Some(v) = env.parsed("WSGATE_BIND", |s| s.parse::<SocketAddr>().ok()) {
        config.bind_address = v;
    }
    if let Some(v) = env.parsed("WSGATE_MAX_CONNECTIONS", |s| parse_usize_range(s, 1, 1_000_000)) {
        config.max_connections = v;
    }
    if let Some(v) = env.parsed("WSGATE_CONNECTION_TIMEOUT_MS", |s| parse_u64_range(s, 0, 86_400_000)) {
        config.connection_timeout_ms = v;
    }
    if let Some(v) = env.parsed("WSGATE_PING_INTERVAL_MS", |s| parse_u64_range(s, 0, 86_400_000)) {
        config.ping_interval_ms = v;
    }
    if let Some(v) = env.parsed("WSGATE_MAX_MESSAGE_SIZE", |s| parse_usize_range(s, 1, u32::MAX as usize)) {
        config.max_message_size = v;
    }
    if let Some(v) = env.parsed("WSGATE_WORKER_THREADS", |s| parse_usize_range(s, 1, 1_024)) {
        config.worker_threads = v;
    }
    if let Some(v) = env.parsed("WSGATE_POLL_TIMEOUT_MS", |s| parse_u64_range(s, 1, 60_000)) {
        config.poll_timeout_ms = v;
    }
    if let Some(v) = env.string("WSGATE_SUBPROTOCOLS") {
        config.subprotocols = v
            .split(',')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(str::to_owned)
            .collect();
    }

    if let Some(v) = env.parsed("WSGATE_TOKEN_AUTH", parse_bool) {
        config.security.enable_token_auth = v;
    }
    if let Some(v) = env.parsed("WSGATE_MAX_AUTH_FAILURES", |s| parse_u64_range(s, 1, 1_000)) {
        config.security.max_auth_failures = v as u32;
    }
    if let Some(v) = env.parsed("WSGATE_TOKEN_REFRESH_SECS", |s| parse_u64_range(s, 0, 31_536_000)) {
        config.security.token_refresh_interval_secs = v;
    }

    if let Some(v) = env.parsed("WSGATE_AUTO_RECONNECT", parse_bool) {
        config.reconnect.enabled = v;
    }
    if let Some(v) = env.parsed("WSGATE_RECONNECT_ATTEMPTS", |s| parse_u64_range(s, 1, 1_000)) {
        config.reconnect.max_attempts = v as u32;
    }
    if let Some(v) = env.parsed("WSGATE_RECONNECT_MAX_DELAY_MS", |s| parse_u64_range(s, 1, 3_600_000)) {
        config.reconnect.max_delay_ms = v;
    }
    let max_delay = config.reconnect.max_delay_ms;
    if let Some(v) = env.parsed("WSGATE_RECONNECT_DELAY_MS", |s| parse_u64_range(s, 1, max_delay)) {
        config.reconnect.base_delay_ms = v;
    }
}

struct Env<F>(F);

impl<F: Fn(&str) -> Option<String>> Env<F> {
    fn string(&self, name: &str) -> Option<String> {
        (self.0)(name).filter(|v| !v.is_empty())
    }

    fn parsed<T>(&self, name: &str, parse: impl Fn(&str) -> Option<T>) -> Option<T> {
        let val = self.string(name)?;
        let result = parse(&val);
        if result.is_none() {
            tracing::warn!(key = name, value = %val, "invalid env var, ignoring");
        }
        result
    }
}

fn read_env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

/// Parse `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`, case-insensitively.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Parse a `u64` within `min..=max`.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.trim().parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a `usize` within `min..=max`.
pub fn parse_usize_range(val: &str, min: usize, max: usize) -> Option<usize> {
    let n: usize = val.trim().parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::collections::HashMap;
    use std::io::Write;

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn defaults_match_documented_values() {
        let c = GatewayConfig::default();
        assert_eq!(c.max_connections, 1024);
        assert_eq!(c.connection_timeout(), Some(Duration::from_secs(30)));
        assert_eq!(c.ping_interval(), Some(Duration::from_secs(30)));
        assert_eq!(c.max_message_size, 65_536);
        assert_eq!(c.worker_threads, 4);
        assert!(!c.reconnect.enabled);
        assert_eq!(c.reconnect.max_attempts, 5);
        assert_eq!(c.reconnect.base_delay_ms, 1_000);
        assert!(c.security.enable_token_auth);
        assert_eq!(c.security.max_auth_failures, 5);
        assert_eq!(c.security.token_refresh_interval_secs, 3_600);
        c.validate().unwrap();
    }

    #[test]
    fn file_values_merge_over_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"max_connections": 8, "security": {{"max_auth_failures": 2}}, "ping_interval_ms": null}}"#
        )
        .unwrap();

        let c = load_config_from_path(file.path()).unwrap();
        assert_eq!(c.max_connections, 8);
        assert_eq!(c.security.max_auth_failures, 2);
        assert!(c.security.enable_token_auth);
        assert_eq!(c.ping_interval_ms, 30_000);
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let c = load_config_from_path(&dir.path().join("absent.json")).unwrap();
        assert_eq!(c.max_connections, GatewayConfig::default().max_connections);
    }

    #[test]
    fn malformed_file_is_an_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{{ not json").unwrap();
        assert_matches!(load_config_from_path(file.path()), Err(ConfigError::Parse(_)));
    }

    #[test]
    fn overrides_apply_and_bad_values_are_ignored() {
        let mut c = GatewayConfig::default();
        apply_overrides(
            &mut c,
            vars(&[
                ("WSGATE_BIND", "127.0.0.1:9001"),
                ("WSGATE_MAX_CONNECTIONS", "0"),
                ("WSGATE_WORKER_THREADS", "2"),
                ("WSGATE_TOKEN_AUTH", "off"),
                ("WSGATE_AUTO_RECONNECT", "maybe"),
                ("WSGATE_SUBPROTOCOLS", "chat, , v2.chat"),
            ]),
        );
        assert_eq!(c.bind_address, "127.0.0.1:9001".parse().unwrap());
        assert_eq!(c.max_connections, 1024);
        assert_eq!(c.worker_threads, 2);
        assert!(!c.security.enable_token_auth);
        assert!(!c.reconnect.enabled);
        assert_eq!(c.subprotocols, ["chat", "v2.chat"]);
    }

    #[test]
    fn reconnect_delay_overrides_stay_valid() {
        let mut c = GatewayConfig::default();
        apply_overrides(&mut c, vars(&[("WSGATE_RECONNECT_DELAY_MS", "60000")]));
        assert_eq!(c.reconnect.base_delay_ms, 1_000);
        c.validate().unwrap();

        apply_overrides(
            &mut c,
            vars(&[
                ("WSGATE_RECONNECT_DELAY_MS", "60000"),
                ("WSGATE_RECONNECT_MAX_DELAY_MS", "120000"),
            ]),
        );
        assert_eq!(c.reconnect.base_delay_ms, 60_000);
        assert_eq!(c.reconnect.max_delay_ms, 120_000);
        c.validate().unwrap();
    }

    #[test]
    fn validate_rejects_unusable_values() {
        let mut c = GatewayConfig {
            worker_threads: 0,
            ..GatewayConfig::default()
        };
        assert_matches!(c.validate(), Err(ConfigError::Invalid { field: "worker_threads", .. }));

        c.worker_threads = 1;
        c.transport = Transport::Datagram;
        assert_matches!(
            c.validate(),
            Err(ConfigError::UnsupportedTransport(Transport::Datagram))
        );
    }

    #[test]
    fn deep_merge_replaces_arrays() {
        let a = serde_json::json!({"subprotocols": ["a"], "security": {"x": 1, "y": 2}});
        let b = serde_json::json!({"subprotocols": ["b"], "security": {"y": 3}});
        let merged = deep_merge(a, b);
        assert_eq!(
            merged,
            serde_json::json!({"subprotocols": ["b"], "security": {"x": 1, "y": 3}})
        );
    }

    #[test]
    fn parse_helpers() {
        assert_eq!(parse_bool("YES"), Some(true));
        assert_eq!(parse_bool("0"), Some(false));
        assert_eq!(parse_bool("2"), None);
        assert_eq!(parse_u64_range("10", 1, 10), Some(10));
        assert_eq!(parse_u64_range("11", 1, 10), None);
        assert_eq!(parse_usize_range("x", 1, 10), None);
    }
}
