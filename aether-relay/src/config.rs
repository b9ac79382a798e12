//! Relay configuration.
//!
//! Loaded from a TOML file (default: `relay.toml`), every field
//! defaultable, with `AETHER_*` environment variables overriding the bind
//! addresses, storage backend, and gateway toggles.

use serde::Deserialize;
use std::path::PathBuf;

/// Root configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Bind addresses and session timeouts.
    #[serde(default)]
    pub server: ServerConfig,
    /// Gateway enablement.
    #[serde(default)]
    pub gateways: GatewayConfig,
    /// Storage backend selection.
    #[serde(default)]
    pub storage: StorageConfig,
    /// Validation policy knobs.
    #[serde(default)]
    pub validation: ValidationConfig,
    /// Fan-out tuning.
    #[serde(default)]
    pub dispatch: DispatchConfig,
    /// Immutable-event garbage collection.
    #[serde(default)]
    pub cleanup: CleanupConfig,
}

/// Bind addresses and session timeouts.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Native WebSocket bind address.
    #[serde(default = "default_native_bind")]
    pub native_bind: String,
    /// NIP-01 WebSocket bind address.
    #[serde(default = "default_nostr_bind")]
    pub nostr_bind: String,
    /// HTTP gateway bind address.
    #[serde(default = "default_http_bind")]
    pub http_bind: String,
    /// Seconds a new connection may wait before sending HELLO.
    #[serde(default = "default_hello_timeout")]
    pub hello_timeout_secs: u64,
    /// Seconds of inactivity before an ACTIVE session is pinged.
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
}

/// Which surfaces to serve.
#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    /// Serve the native protocol.
    #[serde(default = "default_true")]
    pub native: bool,
    /// Serve the NIP-01 text protocol.
    #[serde(default)]
    pub nostr: bool,
    /// Serve the HTTP REST/SSE/JSON-WebSocket surface.
    #[serde(default)]
    pub http: bool,
}

/// Storage backend selection.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// `"memory"` or `"sqlite"`.
    #[serde(default = "default_backend")]
    pub backend: String,
    /// SQLite database path (ignored by the memory backend).
    #[serde(default = "default_database")]
    pub database: PathBuf,
}

/// Validation policy knobs.
#[derive(Debug, Clone, Deserialize)]
pub struct ValidationConfig {
    /// Allowed future skew on `created_at`, seconds.
    #[serde(default = "default_max_future_skew")]
    pub max_future_skew_secs: u64,
    /// Maximum total event size in bytes (canonical serialization plus
    /// id and signature). Absent means no limit.
    #[serde(default)]
    pub max_event_size_bytes: Option<usize>,
    /// Required leading zero bits on `event_id`; 0 disables the check.
    /// Applies to every accepted event.
    #[serde(default)]
    pub pow_difficulty: u32,
    /// Publishes allowed per pubkey per minute; 0 disables the limiter.
    #[serde(default)]
    pub publishes_per_minute: u32,
}

/// Fan-out tuning.
#[derive(Debug, Clone, Deserialize)]
pub struct DispatchConfig {
    /// Bounded outbox capacity per subscription (drop-oldest beyond this).
    #[serde(default = "default_outbox_capacity")]
    pub outbox_capacity: usize,
}

/// Immutable-event garbage collection.
#[derive(Debug, Clone, Deserialize)]
pub struct CleanupConfig {
    /// Whether the background GC task runs.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// GC cadence, seconds.
    #[serde(default = "default_cleanup_interval")]
    pub interval_secs: u64,
    /// TTL for immutable events, seconds. Absent means keep forever.
    #[serde(default)]
    pub immutable_ttl_secs: Option<u64>,
}

fn default_native_bind() -> String {
    "0.0.0.0:9700".to_string()
}

fn default_nostr_bind() -> String {
    "0.0.0.0:7447".to_string()
}

fn default_http_bind() -> String {
    "0.0.0.0:8081".to_string()
}

fn default_hello_timeout() -> u64 {
    10
}

fn default_idle_timeout() -> u64 {
    300
}

fn default_true() -> bool {
    true
}

fn default_backend() -> String {
    "memory".to_string()
}

fn default_database() -> PathBuf {
    PathBuf::from("relay.db")
}

fn default_max_future_skew() -> u64 {
    60
}

fn default_outbox_capacity() -> usize {
    1024
}

fn default_cleanup_interval() -> u64 {
    3600
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            native_bind: default_native_bind(),
            nostr_bind: default_nostr_bind(),
            http_bind: default_http_bind(),
            hello_timeout_secs: default_hello_timeout(),
            idle_timeout_secs: default_idle_timeout(),
        }
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            native: true,
            nostr: false,
            http: false,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            database: default_database(),
        }
    }
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            max_future_skew_secs: default_max_future_skew(),
            max_event_size_bytes: None,
            pow_difficulty: 0,
            publishes_per_minute: 0,
        }
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            outbox_capacity: default_outbox_capacity(),
        }
    }
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_cleanup_interval(),
            immutable_ttl_secs: None,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            gateways: GatewayConfig::default(),
            storage: StorageConfig::default(),
            validation: ValidationConfig::default(),
            dispatch: DispatchConfig::default(),
            cleanup: CleanupConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            source: e,
        })?;
        let mut config: Config = toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            source: e,
        })?;
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Defaults plus environment overrides, for running without a file.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Config::default();
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Apply `AETHER_*` environment overrides.
    pub fn apply_env(&mut self) {
        if let Ok(bind) = std::env::var("AETHER_NATIVE_BIND") {
            self.server.native_bind = bind;
        }
        if let Ok(bind) = std::env::var("AETHER_NOSTR_BIND") {
            self.server.nostr_bind = bind;
        }
        if let Ok(bind) = std::env::var("AETHER_HTTP_BIND") {
            self.server.http_bind = bind;
        }
        if let Ok(backend) = std::env::var("AETHER_STORAGE") {
            self.storage.backend = backend;
        }
        if let Ok(path) = std::env::var("AETHER_STORAGE_PATH") {
            self.storage.database = PathBuf::from(path);
        }
        if let Ok(flags) = std::env::var("AETHER_GATEWAYS") {
            self.gateways.native = false;
            self.gateways.nostr = false;
            self.gateways.http = false;
            for name in flags.split(',').map(str::trim) {
                match name {
                    "native" => self.gateways.native = true,
                    "nostr" => self.gateways.nostr = true,
                    "http" => self.gateways.http = true,
                    "" => {}
                    other => tracing::warn!("unknown gateway {other:?} in AETHER_GATEWAYS"),
                }
            }
        }
    }

    /// Reject configurations the relay cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.storage.backend.as_str() {
            "memory" | "sqlite" => {}
            other => {
                return Err(ConfigError::UnknownBackend {
                    backend: other.to_string(),
                })
            }
        }
        if self.dispatch.outbox_capacity == 0 {
            return Err(ConfigError::Invalid {
                reason: "dispatch.outbox_capacity must be at least 1".into(),
            });
        }
        Ok(())
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Could not read the file.
    #[error("failed to read config file {path}: {source}")]
    Read {
        /// Path to the file.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// Could not parse the file.
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        /// Path to the file.
        path: PathBuf,
        /// Underlying parse error.
        source: toml::de::Error,
    },
    /// Storage backend selector is not supported.
    #[error("unknown storage backend {backend:?} (expected \"memory\" or \"sqlite\")")]
    UnknownBackend {
        /// The rejected selector.
        backend: String,
    },
    /// Some other field combination is unusable.
    #[error("invalid configuration: {reason}")]
    Invalid {
        /// What was wrong.
        reason: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.validation.max_future_skew_secs, 60);
        assert_eq!(config.validation.max_event_size_bytes, None);
        assert_eq!(config.dispatch.outbox_capacity, 1024);
        assert!(config.gateways.native);
        assert!(!config.gateways.nostr);
    }

    #[test]
    fn config_from_toml_string() {
        let toml = r#"
[server]
native_bind = "127.0.0.1:9000"
hello_timeout_secs = 3

[gateways]
nostr = true
http = true

[storage]
backend = "sqlite"
database = "/data/aether.db"

[validation]
max_event_size_bytes = 65536
pow_difficulty = 8
publishes_per_minute = 120

[cleanup]
immutable_ttl_secs = 86400
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.server.native_bind, "127.0.0.1:9000");
        assert_eq!(config.server.hello_timeout_secs, 3);
        assert!(config.gateways.nostr);
        assert_eq!(config.storage.backend, "sqlite");
        assert_eq!(config.storage.database, PathBuf::from("/data/aether.db"));
        assert_eq!(config.validation.max_event_size_bytes, Some(65536));
        assert_eq!(config.validation.pow_difficulty, 8);
        assert_eq!(config.cleanup.immutable_ttl_secs, Some(86400));
    }

    #[test]
    fn empty_toml_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.storage.backend, "memory");
        assert_eq!(config.server.hello_timeout_secs, 10);
    }

    #[test]
    fn unknown_backend_is_rejected() {
        let mut config = Config::default();
        config.storage.backend = "rocksdb".into();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::UnknownBackend { .. })
        ));
    }

    #[test]
    fn zero_outbox_capacity_is_rejected() {
        let mut config = Config::default();
        config.dispatch.outbox_capacity = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid { .. })));
    }
}
