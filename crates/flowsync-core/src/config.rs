//! Session configuration
//!
//! [`SyncConfig`] is plain serde data with defaults for every field. Files are
//! TOML; `${VAR}` references are expanded from the environment before
//! parsing, and `FLOWSYNC_ENABLED` / `FLOWSYNC_RELAY_ADDR` override the
//! corresponding fields last.

use flowsync_model::ReplicaId;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Default relay address
pub const DEFAULT_RELAY_ADDR: &str = "127.0.0.1:1881";

/// Environment variable overriding [`SyncConfig::enabled`]
pub const ENV_ENABLED: &str = "FLOWSYNC_ENABLED";

/// Environment variable overriding [`SyncConfig::relay_addr`]
pub const ENV_RELAY_ADDR: &str = "FLOWSYNC_RELAY_ADDR";

/// Collaborative session configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Whether collaborative editing is enabled
    pub enabled: bool,
    /// Relay address (`host:port`)
    pub relay_addr: String,
    /// Fixed replica id; a fresh one is generated when absent
    pub replica_id: Option<ReplicaId>,
    /// Reconnect backoff
    pub reconnect: ReconnectPolicy,
    /// Interval between resync handshakes, in milliseconds
    pub heartbeat_interval_ms: u64,
    /// How long to wait for the relay's `Welcome`, in milliseconds
    pub handshake_timeout_ms: u64,
    /// Capacity of the document event channel
    pub event_capacity: usize,
}

impl SyncConfig {
    /// Default configuration
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Switch collaborative editing on or off
    #[inline]
    #[must_use]
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Relay to connect to, as `host:port`
    #[inline]
    #[must_use]
    pub fn with_relay_addr(mut self, addr: impl Into<String>) -> Self {
        self.relay_addr = addr.into();
        self
    }

    /// Fix the replica id instead of generating one
    #[inline]
    #[must_use]
    pub fn with_replica_id(mut self, id: ReplicaId) -> Self {
        self.replica_id = Some(id);
        self
    }

    /// Set the reconnect policy
    #[inline]
    #[must_use]
    pub fn with_reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    /// Set how often a connected session re-sends its state vector
    #[inline]
    #[must_use]
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Set how long to wait for the relay's reply to `Hello`
    #[inline]
    #[must_use]
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Handshake timeout as a `Duration`
    #[must_use]
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    /// Interval between resync handshakes
    #[must_use]
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// Check value ranges
    ///
    /// # Errors
    /// Returns `InvalidValue` naming the first offending field
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |field: &str, reason: &str| ConfigError::InvalidValue {
            field: field.to_string(),
            reason: reason.to_string(),
        };

        if self.relay_addr.trim().is_empty() {
            return Err(invalid("relay_addr", "must not be empty"));
        }
        if self.event_capacity == 0 {
            return Err(invalid("event_capacity", "must be at least 1"));
        }
        if self.heartbeat_interval_ms == 0 {
            return Err(invalid("heartbeat_interval_ms", "must be at least 1"));
        }
        if self.handshake_timeout_ms == 0 {
            return Err(invalid("handshake_timeout_ms", "must be at least 1"));
        }
        self.reconnect.validate()
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            relay_addr: DEFAULT_RELAY_ADDR.to_string(),
            replica_id: None,
            reconnect: ReconnectPolicy::default(),
            heartbeat_interval_ms: 5_000,
            handshake_timeout_ms: 5_000,
            event_capacity: 256,
        }
    }
}

/// Exponential reconnect backoff
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    /// Delay before the first retry, in milliseconds
    pub initial_delay_ms: u64,
    /// Upper bound for any delay, in milliseconds
    pub max_delay_ms: u64,
    /// Growth factor per attempt
    pub multiplier: f64,
    /// Give up after this many consecutive failures; retry forever if unset
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay_ms: 100,
            max_delay_ms: 5_000,
            multiplier: 2.0,
            max_attempts: None,
        }
    }
}

impl ReconnectPolicy {
    /// Fast retries, for tests
    #[must_use]
    pub fn immediate() -> Self {
        Self {
            initial_delay_ms: 5,
            max_delay_ms: 50,
            multiplier: 2.0,
            max_attempts: None,
        }
    }

    /// Give up after `attempts` consecutive failures
    #[inline]
    #[must_use]
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    /// Delay before retry number `attempt` (1-based)
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        #[allow(clippy::cast_precision_loss)]
        let scaled = self.initial_delay_ms as f64 * self.multiplier.powi(exponent);
        #[allow(clippy::cast_precision_loss)]
        let capped = scaled.min(self.max_delay_ms as f64);
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        Duration::from_millis(capped as u64)
    }

    /// Whether another attempt is allowed after `attempt` failures
    #[must_use]
    pub fn allows(&self, attempt: u32) -> bool {
        self.max_attempts.map_or(true, |max| attempt < max)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.multiplier < 1.0 {
            return Err(ConfigError::InvalidValue {
                field: "reconnect.multiplier".to_string(),
                reason: "must be at least 1.0".to_string(),
            });
        }
        if self.initial_delay_ms > self.max_delay_ms {
            return Err(ConfigError::InvalidValue {
                field: "reconnect.initial_delay_ms".to_string(),
                reason: "must not exceed max_delay_ms".to_string(),
            });
        }
        Ok(())
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Config file could not be read
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Config file is not valid TOML
    #[error("toml parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    /// `${VAR}` names an unset variable
    #[error("environment variable not set: {0}")]
    EnvVarNotSet(String),

    /// A setting is out of range
    #[error("invalid value for {field}: {reason}")]
    InvalidValue {
        /// Setting name
        field: String,
        /// Why it was rejected
        reason: String,
    },

    /// Substitution pattern failed to compile
    #[error("invalid pattern: {0}")]
    Pattern(#[from] regex::Error),
}

/// Configuration loader with environment variable substitution
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration from a TOML file
    ///
    /// # Errors
    /// Returns error if the file cannot be read, a referenced variable is
    /// unset, the TOML is invalid or a value is out of range
    pub fn load(path: &Path) -> Result<SyncConfig, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::load_str(&content)
    }

    /// Load configuration from a string
    ///
    /// # Errors
    /// Same as [`ConfigLoader::load`], minus file access
    pub fn load_str(content: &str) -> Result<SyncConfig, ConfigError> {
        let expanded = Self::expand_env_vars(content)?;
        let mut config: SyncConfig = toml::from_str(&expanded)?;
        Self::apply_env_overrides(&mut config)?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults plus environment overrides
    ///
    /// # Errors
    /// Returns error if an override has an invalid value
    pub fn from_env() -> Result<SyncConfig, ConfigError> {
        let mut config = SyncConfig::default();
        Self::apply_env_overrides(&mut config)?;
        config.validate()?;
        Ok(config)
    }

    /// Expand `${VAR}` references
    fn expand_env_vars(content: &str) -> Result<String, ConfigError> {
        let mut result = content.to_string();
        let re = regex::Regex::new(r"\$\{([^}]+)\}")?;

        for cap in re.captures_iter(content) {
            let var_name = &cap[1];
            let var_value = std::env::var(var_name)
                .map_err(|_| ConfigError::EnvVarNotSet(var_name.to_string()))?;
            result = result.replace(&cap[0], &var_value);
        }

        Ok(result)
    }

    fn apply_env_overrides(config: &mut SyncConfig) -> Result<(), ConfigError> {
        if let Ok(value) = std::env::var(ENV_ENABLED) {
            config.enabled = parse_flag(&value).ok_or_else(|| ConfigError::InvalidValue {
                field: ENV_ENABLED.to_string(),
                reason: format!("expected a boolean, got '{value}'"),
            })?;
        }
        if let Ok(addr) = std::env::var(ENV_RELAY_ADDR) {
            config.relay_addr = addr;
        }
        Ok(())
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
