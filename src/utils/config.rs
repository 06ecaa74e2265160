//! Configuration management for peerlink.
//!
//! Configuration is TOML-based and assembled from three sources in order:
//! built-in defaults, an optional file, then `PEERLINK_*` environment
//! variables. The result is validated before use.

use crate::utils::{ConfigError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default configuration file name
pub const DEFAULT_CONFIG_FILE: &str = "peerlink.toml";

/// Environment variable prefix for configuration
pub const ENV_PREFIX: &str = "PEERLINK";

/// Complete configuration for a peerlink node
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PeerLinkConfig {
    /// Per-session state machine tuning
    pub session: SessionConfig,
    /// Secure channel parameters
    pub crypto: CryptoConfig,
    /// Signaling codec limits
    pub signaling: SignalingConfig,
    /// Session registry tuning
    pub registry: RegistryConfig,
    /// Discovery and node identity
    pub discovery: DiscoveryConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Peer session state machine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Window for the counterpart descriptor to arrive, in milliseconds
    pub negotiation_timeout_ms: u64,
    /// Consecutive authentication failures tolerated before the session fails
    pub auth_failure_threshold: u32,
    /// Upper bound on flushing queued frames during close, in milliseconds
    pub flush_timeout_ms: u64,
    /// Capacity of each session's event broadcast buffer
    pub event_buffer: usize,
}

/// Secure channel configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CryptoConfig {
    /// Minimum accepted shared secret length in bytes
    pub min_shared_secret_len: usize,
    /// Messages sealed under one key before the session is torn down.
    /// Unset means the full 64-bit counter space.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_messages_per_key: Option<u64>,
}

/// Signaling codec configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalingConfig {
    /// Largest accepted signaling frame in bytes
    pub max_message_size: usize,
    /// How far a descriptor sequence may run ahead of the local clock, in milliseconds
    pub max_clock_skew_ms: u64,
}

/// Session registry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// How long terminal sessions stay visible before reaping, in milliseconds
    pub reap_grace_period_ms: u64,
    /// Reaper sweep interval in milliseconds
    pub reap_interval_ms: u64,
    /// Capacity of the merged event broadcast buffer
    pub event_buffer: usize,
    /// Peers without a session whose candidates may be held at once
    pub max_early_peers: usize,
    /// Candidates held per such peer
    pub max_early_candidates: usize,
}

/// Discovery and identity configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// Identifier this node announces; generated when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_peer_id: Option<String>,
    /// Offer a session to every discovered peer that sorts after us
    pub auto_connect: bool,
    /// Peers to seed the static discovery source with
    pub static_peers: Vec<String>,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (error, warn, info, debug, trace)
    pub level: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            negotiation_timeout_ms: crate::defaults::DEFAULT_NEGOTIATION_TIMEOUT_MS,
            auth_failure_threshold: crate::defaults::DEFAULT_AUTH_FAILURE_THRESHOLD,
            flush_timeout_ms: 2_000,
            event_buffer: 256,
        }
    }
}

impl Default for CryptoConfig {
    fn default() -> Self {
        Self {
            min_shared_secret_len: crate::crypto::MIN_SHARED_SECRET_LEN,
            max_messages_per_key: None,
        }
    }
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            max_message_size: crate::signaling::MAX_SIGNAL_SIZE,
            max_clock_skew_ms: 5 * 60 * 1000,
        }
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            reap_grace_period_ms: crate::defaults::DEFAULT_REAP_GRACE_MS,
            reap_interval_ms: 1_000,
            event_buffer: 1024,
            max_early_peers: 64,
            max_early_candidates: 16,
        }
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            local_peer_id: None,
            auto_connect: true,
            static_peers: Vec::new(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl SessionConfig {
    /// Negotiation window as a [`Duration`]
    pub fn negotiation_window(&self) -> Duration {
        Duration::from_millis(self.negotiation_timeout_ms)
    }

    /// Flush bound as a [`Duration`]
    pub fn flush_timeout(&self) -> Duration {
        Duration::from_millis(self.flush_timeout_ms)
    }
}

impl CryptoConfig {
    /// Effective per-key message limit
    pub fn message_limit(&self) -> u64 {
        self.max_messages_per_key.unwrap_or(u64::MAX)
    }
}

impl RegistryConfig {
    /// Grace period as a [`Duration`]
    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.reap_grace_period_ms)
    }

    /// Reaper interval as a [`Duration`]
    pub fn reap_interval(&self) -> Duration {
        Duration::from_millis(self.reap_interval_ms)
    }
}

impl PeerLinkConfig {
    /// Load configuration from a TOML file
    ///
    /// # Errors
    ///
    /// Returns error if file cannot be read, parsed or validated
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|_| ConfigError::FileNotFound {
            path: path.display().to_string(),
        })?;

        let config: Self = toml::from_str(&content).map_err(ConfigError::from)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration with multiple sources (default, file, environment)
    ///
    /// When no path is given, `./peerlink.toml` and then the platform config
    /// directory are tried.
    pub fn load(config_file: Option<&Path>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(path) = config_file {
            if path.exists() {
                config = config.merge(Self::from_file(path)?);
            } else {
                return Err(ConfigError::FileNotFound {
                    path: path.display().to_string(),
                }
                .into());
            }
        } else {
            let default_locations = [
                PathBuf::from(DEFAULT_CONFIG_FILE),
                dirs::config_dir()
                    .unwrap_or_else(|| PathBuf::from("."))
                    .join("peerlink")
                    .join(DEFAULT_CONFIG_FILE),
            ];

            for location in &default_locations {
                if location.exists() {
                    config = config.merge(Self::from_file(location)?);
                    break;
                }
            }
        }

        config = config.merge_from_env()?;
        config.validate()?;

        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        std::fs::write(path, self.to_toml_string()?)?;
        Ok(())
    }

    /// Merge this configuration with another, preferring values from other
    pub fn merge(mut self, other: Self) -> Self {
        self.session = other.session;
        self.crypto = other.crypto;
        self.signaling = other.signaling;
        self.registry = other.registry;
        self.discovery = other.discovery;
        self.logging = other.logging;
        self
    }

    /// Apply `PEERLINK_*` environment overrides
    fn merge_from_env(mut self) -> Result<Self> {
        if let Ok(value) = std::env::var(format!("{ENV_PREFIX}_SESSION_NEGOTIATION_TIMEOUT_MS")) {
            self.session.negotiation_timeout_ms =
                parse_env("session.negotiation_timeout_ms", &value)?;
        }

        if let Ok(value) = std::env::var(format!("{ENV_PREFIX}_REGISTRY_REAP_GRACE_PERIOD_MS")) {
            self.registry.reap_grace_period_ms =
                parse_env("registry.reap_grace_period_ms", &value)?;
        }

        if let Ok(peer_id) = std::env::var(format!("{ENV_PREFIX}_DISCOVERY_LOCAL_PEER_ID")) {
            self.discovery.local_peer_id = Some(peer_id);
        }

        if let Ok(level) = std::env::var(format!("{ENV_PREFIX}_LOGGING_LEVEL")) {
            self.logging.level = level;
        }

        Ok(self)
    }

    /// Validate the configuration for consistency and correctness
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("session.negotiation_timeout_ms", self.session.negotiation_timeout_ms),
            ("session.flush_timeout_ms", self.session.flush_timeout_ms),
            ("registry.reap_interval_ms", self.registry.reap_interval_ms),
            ("signaling.max_clock_skew_ms", self.signaling.max_clock_skew_ms),
        ];
        for (field, value) in positive {
            if value == 0 {
                return Err(invalid(field, "0"));
            }
        }

        if self.session.auth_failure_threshold == 0 {
            return Err(invalid("session.auth_failure_threshold", "0"));
        }

        if self.session.event_buffer == 0 || self.registry.event_buffer == 0 {
            return Err(invalid("event_buffer", "0"));
        }

        if self.registry.max_early_candidates == 0 {
            return Err(invalid("registry.max_early_candidates", "0"));
        }

        if self.crypto.min_shared_secret_len == 0 {
            return Err(invalid("crypto.min_shared_secret_len", "0"));
        }

        if self.crypto.max_messages_per_key == Some(0) {
            return Err(invalid("crypto.max_messages_per_key", "0"));
        }

        if self.signaling.max_message_size < 64 {
            return Err(invalid(
                "signaling.max_message_size",
                &self.signaling.max_message_size.to_string(),
            ));
        }

        if let Some(peer_id) = &self.discovery.local_peer_id {
            crate::network::PeerId::parse(peer_id.as_str())
                .map_err(|_| invalid("discovery.local_peer_id", peer_id))?;
        }

        match self.logging.level.as_str() {
            "error" | "warn" | "info" | "debug" | "trace" => {}
            _ => return Err(invalid("logging.level", &self.logging.level)),
        }

        Ok(())
    }

    /// Get the configuration as a pretty-printed TOML string
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| {
            ConfigError::ParseError {
                reason: e.to_string(),
            }
            .into()
        })
    }
}

fn parse_env<T: std::str::FromStr>(field: &str, value: &str) -> Result<T> {
    value.parse().map_err(|_| invalid(field, value))
}

fn invalid(field: &str, value: &str) -> crate::utils::PeerLinkError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        value: value.to_string(),
    }
    .into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = PeerLinkConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(
            config.session.negotiation_timeout_ms,
            crate::defaults::DEFAULT_NEGOTIATION_TIMEOUT_MS
        );
        assert_eq!(config.crypto.message_limit(), u64::MAX);
        assert!(config.discovery.auto_connect);
    }

    #[test]
    fn test_config_serialization() {
        let config = PeerLinkConfig::default();
        let toml_str = config.to_toml_string().unwrap();
        assert!(toml_str.contains("negotiation_timeout_ms"));
        assert!(toml_str.contains("reap_grace_period_ms"));
        assert!(!toml_str.contains("max_messages_per_key"));
    }

    #[test]
    fn test_config_file_operations() {
        let mut config = PeerLinkConfig::default();
        config.crypto.max_messages_per_key = Some(1_000);
        config.discovery.local_peer_id = Some("alice".to_string());
        let temp_file = NamedTempFile::new().unwrap();

        config.save(temp_file.path()).unwrap();
        let loaded = PeerLinkConfig::from_file(temp_file.path()).unwrap();

        assert_eq!(loaded.crypto.max_messages_per_key, Some(1_000));
        assert_eq!(loaded.discovery.local_peer_id.as_deref(), Some("alice"));
        assert_eq!(
            config.registry.reap_grace_period_ms,
            loaded.registry.reap_grace_period_ms
        );
    }

    #[test]
    fn test_config_validation() {
        let mut config = PeerLinkConfig::default();
        config.session.negotiation_timeout_ms = 0;
        assert!(config.validate().is_err());

        config = PeerLinkConfig::default();
        config.session.auth_failure_threshold = 0;
        assert!(config.validate().is_err());

        config = PeerLinkConfig::default();
        config.crypto.max_messages_per_key = Some(0);
        assert!(config.validate().is_err());

        config = PeerLinkConfig::default();
        config.discovery.local_peer_id = Some(String::new());
        assert!(config.validate().is_err());

        config = PeerLinkConfig::default();
        config.registry.max_early_candidates = 0;
        assert!(config.validate().is_err());

        config = PeerLinkConfig::default();
        config.logging.level = "loud".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_explicit_file_is_an_error() {
        let result = PeerLinkConfig::load(Some(Path::new("/nonexistent/peerlink.toml")));
        assert!(result.is_err());
    }

    #[test]
    fn test_config_merge() {
        let config1 = PeerLinkConfig::default();
        let mut config2 = PeerLinkConfig::default();
        config2.session.negotiation_timeout_ms = 1_234;

        let merged = config1.merge(config2);
        assert_eq!(merged.session.negotiation_timeout_ms, 1_234);
    }

    #[test]
    fn test_env_override() {
        std::env::set_var("PEERLINK_REGISTRY_REAP_GRACE_PERIOD_MS", "42");

        let config = PeerLinkConfig::default().merge_from_env().unwrap();
        assert_eq!(config.registry.reap_grace_period_ms, 42);

        std::env::set_var("PEERLINK_REGISTRY_REAP_GRACE_PERIOD_MS", "soon");
        assert!(PeerLinkConfig::default().merge_from_env().is_err());

        std::env::remove_var("PEERLINK_REGISTRY_REAP_GRACE_PERIOD_MS");
    }
}
