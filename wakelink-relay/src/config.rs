//! Configuration loading for wakelink-relay.
//!
//! Configuration is loaded from a TOML file (default: `relay.toml`).
//! Every section and field is optional and falls back to the defaults below.

use crate::queue::OverflowPolicy;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use wakelink_types::Role;

/// Root configuration for wakelink-relay.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Server configuration.
    pub server: ServerConfig,
    /// Relay core configuration.
    pub relay: RelayConfig,
    /// Rate limiting configuration.
    pub limits: LimitsConfig,
    /// HTTP endpoints configuration.
    pub http: HttpConfig,
    /// Cleanup task configuration.
    pub cleanup: CleanupConfig,
    /// Static token table for the authentication collaborator.
    pub auth: AuthConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Bind address for HTTP and WebSocket endpoints (default: 0.0.0.0:9009).
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
}

/// Relay core configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct RelayConfig {
    /// Maximum queued packets per peer (default: 256).
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// What to do when a peer's queue is full (default: drop_oldest).
    #[serde(default)]
    pub overflow_policy: OverflowPolicy,
    /// Bound on a single push into a connection's writer, in milliseconds (default: 2000).
    #[serde(default = "default_push_timeout_ms")]
    pub push_timeout_ms: u64,
    /// Per-connection outbound channel capacity (default: 64).
    #[serde(default = "default_outbound_buffer")]
    pub outbound_buffer: usize,
    /// Upper bound on a long-poll wait, in seconds (default: 30).
    #[serde(default = "default_max_poll_wait_secs")]
    pub max_poll_wait_secs: u64,
    /// How long a client request waits for its response, in seconds (default: 30).
    #[serde(default = "default_response_timeout_secs")]
    pub response_timeout_secs: u64,
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LimitsConfig {
    /// Maximum connection attempts per peer per minute (default: 30).
    #[serde(default = "default_connections_per_minute")]
    pub connections_per_minute: u32,
    /// Maximum packets per peer per minute (default: 120).
    #[serde(default = "default_messages_per_minute")]
    pub messages_per_minute: u32,
    /// Maximum requests per second across all peers (default: 1000).
    #[serde(default = "default_global_requests_per_second")]
    pub global_requests_per_second: u32,
    /// Timeout in seconds for receiving the auth frame after upgrade (default: 10).
    /// Connections that don't authenticate within this time are dropped.
    #[serde(default = "default_auth_timeout_secs")]
    pub auth_timeout_secs: u64,
    /// Maximum WebSocket frame size in bytes (default: 64KB).
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,
    /// Maximum simultaneously registered connections (default: 10000).
    #[serde(default = "default_max_concurrent_connections")]
    pub max_concurrent_connections: usize,
}

/// HTTP endpoints configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    /// Enable metrics endpoint (default: true).
    #[serde(default = "default_metrics_enabled")]
    pub metrics_enabled: bool,
}

/// Cleanup task configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct CleanupConfig {
    /// Cleanup interval in seconds (default: 60).
    #[serde(default = "default_cleanup_interval")]
    pub interval_secs: u64,
    /// Queued packets older than this many seconds are purged (default: 300).
    #[serde(default = "default_retention_secs")]
    pub retention_secs: u64,
    /// Enable cleanup task (default: true).
    #[serde(default = "default_cleanup_enabled")]
    pub enabled: bool,
}

/// Static token table.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuthConfig {
    /// Accepted tokens and the peer each one authenticates as.
    #[serde(default)]
    pub tokens: Vec<TokenEntry>,
}

/// One accepted API token.
#[derive(Clone, Deserialize)]
pub struct TokenEntry {
    /// The token value.
    pub token: String,
    /// Peer id the token authenticates as.
    pub peer: String,
    /// Namespace of that peer.
    #[serde(default)]
    pub role: Role,
}

impl std::fmt::Debug for TokenEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenEntry")
            .field("token", &"[REDACTED]")
            .field("peer", &self.peer)
            .field("role", &self.role)
            .finish()
    }
}

// Default value functions
fn default_bind_address() -> String {
    "0.0.0.0:9009".to_string()
}

fn default_queue_capacity() -> usize {
    256
}

fn default_push_timeout_ms() -> u64 {
    2000
}

fn default_outbound_buffer() -> usize {
    64
}

fn default_max_poll_wait_secs() -> u64 {
    30
}

fn default_response_timeout_secs() -> u64 {
    30
}

fn default_connections_per_minute() -> u32 {
    30
}

fn default_messages_per_minute() -> u32 {
    120
}

fn default_global_requests_per_second() -> u32 {
    1000
}

fn default_auth_timeout_secs() -> u64 {
    10
}

fn default_max_frame_size() -> usize {
    64 * 1024
}

fn default_max_concurrent_connections() -> usize {
    10_000
}

fn default_metrics_enabled() -> bool {
    true
}

fn default_cleanup_interval() -> u64 {
    60
}

fn default_retention_secs() -> u64 {
    5 * 60 // 5 minutes
}

fn default_cleanup_enabled() -> bool {
    true
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            overflow_policy: OverflowPolicy::default(),
            push_timeout_ms: default_push_timeout_ms(),
            outbound_buffer: default_outbound_buffer(),
            max_poll_wait_secs: default_max_poll_wait_secs(),
            response_timeout_secs: default_response_timeout_secs(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            connections_per_minute: default_connections_per_minute(),
            messages_per_minute: default_messages_per_minute(),
            global_requests_per_second: default_global_requests_per_second(),
            auth_timeout_secs: default_auth_timeout_secs(),
            max_frame_size: default_max_frame_size(),
            max_concurrent_connections: default_max_concurrent_connections(),
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            metrics_enabled: default_metrics_enabled(),
        }
    }
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_cleanup_interval(),
            retention_secs: default_retention_secs(),
            enabled: default_cleanup_enabled(),
        }
    }
}

impl RelayConfig {
    /// Push timeout as a [`Duration`].
    pub fn push_timeout(&self) -> Duration {
        Duration::from_millis(self.push_timeout_ms)
    }

    /// Maximum long-poll wait as a [`Duration`].
    pub fn max_poll_wait(&self) -> Duration {
        Duration::from_secs(self.max_poll_wait_secs)
    }

    /// Response timeout as a [`Duration`].
    pub fn response_timeout(&self) -> Duration {
        Duration::from_secs(self.response_timeout_secs)
    }
}

impl Config {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed, or fails validation.
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            source: e,
        })?;

        let config: Config = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            source: e,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would make the relay unusable.
    ///
    /// Rate limit quotas must be non-zero for governor, and a zero-capacity
    /// queue or channel could never deliver anything.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let checks: [(&'static str, bool); 7] = [
            ("relay.queue_capacity", self.relay.queue_capacity == 0),
            ("relay.outbound_buffer", self.relay.outbound_buffer == 0),
            ("limits.connections_per_minute", self.limits.connections_per_minute == 0),
            ("limits.messages_per_minute", self.limits.messages_per_minute == 0),
            (
                "limits.global_requests_per_second",
                self.limits.global_requests_per_second == 0,
            ),
            ("limits.max_frame_size", self.limits.max_frame_size == 0),
            ("cleanup.interval_secs", self.cleanup.enabled && self.cleanup.interval_secs == 0),
        ];

        match checks.iter().find(|(_, bad)| *bad) {
            Some((field, _)) => Err(ConfigError::Invalid {
                field: *field,
                reason: "must be greater than zero".to_string(),
            }),
            None => Ok(()),
        }
    }
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// Failed to parse configuration file.
    #[error("failed to parse config file {path}: {source}")]
    ParseError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying TOML parse error.
        source: toml::de::Error,
    },
    /// A value is out of range.
    #[error("invalid value for {field}: {reason}")]
    Invalid {
        /// Dotted path of the offending field.
        field: &'static str,
        /// Why it was rejected.
        reason: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn default_config_is_valid() {
        let config = Config::default();
        assert_eq!(config.server.bind_address, "0.0.0.0:9009");
        assert_eq!(config.relay.queue_capacity, 256);
        assert_eq!(config.relay.overflow_policy, OverflowPolicy::DropOldest);
        assert_eq!(config.cleanup.retention_secs, 300);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn config_from_toml_string() {
        let toml = r#"
[server]
bind_address = "127.0.0.1:5000"

[relay]
queue_capacity = 8
overflow_policy = "reject"
max_poll_wait_secs = 10

[limits]
messages_per_minute = 5

[cleanup]
interval_secs = 30

[[auth.tokens]]
token = "dev-token"
peer = "D1"
role = "device"

[[auth.tokens]]
token = "cli-token"
peer = "ops"
role = "client"
"#;

        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.server.bind_address, "127.0.0.1:5000");
        assert_eq!(config.relay.queue_capacity, 8);
        assert_eq!(config.relay.overflow_policy, OverflowPolicy::Reject);
        assert_eq!(config.relay.max_poll_wait(), Duration::from_secs(10));
        assert_eq!(config.limits.messages_per_minute, 5);
        assert_eq!(config.cleanup.interval_secs, 30);
        assert_eq!(config.auth.tokens.len(), 2);
        assert_eq!(config.auth.tokens[1].role, Role::Client);
    }

    #[test]
    fn missing_sections_use_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.relay.push_timeout(), Duration::from_millis(2000));
        assert_eq!(config.limits.auth_timeout_secs, 10);
        assert!(config.http.metrics_enabled);
        assert!(config.auth.tokens.is_empty());
    }

    #[test]
    fn zero_capacity_is_rejected() {
        let mut config = Config::default();
        config.relay.queue_capacity = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("relay.queue_capacity"));
    }

    #[test]
    fn token_debug_is_redacted() {
        let entry = TokenEntry {
            token: "hunter2".to_string(),
            peer: "D1".to_string(),
            role: Role::Device,
        };
        let debug = format!("{entry:?}");
        assert!(!debug.contains("hunter2"));
    }

    #[test]
    fn from_file_reads_and_validates() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[relay]\nqueue_capacity = 0").unwrap();

        let err = Config::from_file(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
    }

    #[test]
    fn from_file_missing_is_read_error() {
        let err = Config::from_file(std::path::Path::new("/nonexistent/relay.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::ReadError { .. }));
    }
}
