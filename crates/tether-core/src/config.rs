//! Centralized configuration for the Tether transport.
//!
//! Fixed protocol limits live in [`ProtocolConfig`]. Tunable settings live in
//! [`ClientConfig`], [`ServerConfig`] and [`AutosaveConfig`], which deserialize
//! from JSON with every field optional.

use crate::client::backoff::BackoffConfig;
use crate::error::{Result, TetherError};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Protocol-level limits shared by client and server.
pub struct ProtocolConfig;

impl ProtocolConfig {
    /// Largest frame either side will read (16 MiB).
    pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;
    pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
    pub const DEFAULT_DISPATCH_DEADLINE: Duration = Duration::from_secs(30);
    pub const DEFAULT_STREAM_CHUNK_SIZE: usize = 500;
    pub const MAX_CONNECTIONS: usize = 64;
    pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
    /// Tag field that marks a parameter as a predicate payload.
    pub const CALLABLE_MARKER: &'static str = "__fn";
    pub const MAX_PREDICATE_SOURCE_LEN: usize = 4096;
    pub const MAX_PREDICATE_DEPTH: usize = 64;
}

/// Serialize a `Duration` as integer milliseconds.
pub(crate) mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

/// Which trigger the autosave scheduler uses when the inactivity deadline passes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AutosaveMode {
    /// Flush if any mutation happened since the last flush.
    Inactivity,
    /// Flush only if enough mutations fell inside the burst window.
    #[default]
    Burst,
}

impl AutosaveMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AutosaveMode::Inactivity => "inactivity",
            AutosaveMode::Burst => "burst",
        }
    }
}

impl std::str::FromStr for AutosaveMode {
    type Err = TetherError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "inactivity" => Ok(AutosaveMode::Inactivity),
            "burst" => Ok(AutosaveMode::Burst),
            other => Err(config_error(
                "autosave.mode",
                &format!("unknown mode '{}', expected 'burst' or 'inactivity'", other),
            )),
        }
    }
}

impl std::fmt::Display for AutosaveMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Mutation-burst autosave settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AutosaveConfig {
    pub enabled: bool,
    pub mode: AutosaveMode,
    #[serde(with = "duration_ms", rename = "mutationInactivityMs")]
    pub mutation_inactivity: Duration,
    #[serde(with = "duration_ms", rename = "mutationBurstWindowMs")]
    pub mutation_burst_window: Duration,
    pub mutation_burst_threshold: usize,
    #[serde(with = "duration_ms", rename = "minSaveIntervalMs")]
    pub min_save_interval: Duration,
}

impl Default for AutosaveConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            mode: AutosaveMode::Burst,
            mutation_inactivity: Duration::from_secs(10),
            mutation_burst_window: Duration::from_secs(120),
            mutation_burst_threshold: 5,
            min_save_interval: Duration::from_secs(5),
        }
    }
}

impl AutosaveConfig {
    pub fn with_mode(mut self, mode: AutosaveMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_inactivity(mut self, inactivity: Duration) -> Self {
        self.mutation_inactivity = inactivity;
        self
    }

    pub fn with_burst(mut self, window: Duration, threshold: usize) -> Self {
        self.mutation_burst_window = window;
        self.mutation_burst_threshold = threshold;
        self
    }

    pub fn with_min_save_interval(mut self, interval: Duration) -> Self {
        self.min_save_interval = interval;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.mutation_inactivity.is_zero() {
            return Err(config_error("mutationInactivityMs", "must be greater than zero"));
        }
        if self.mode == AutosaveMode::Burst {
            if self.mutation_burst_threshold == 0 {
                return Err(config_error("mutationBurstThreshold", "must be at least 1"));
            }
            if self.mutation_burst_window.is_zero() {
                return Err(config_error("mutationBurstWindowMs", "must be greater than zero"));
            }
        }
        Ok(())
    }
}

/// Server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Shared key required in the connection handshake. `None` disables auth.
    pub auth_key: Option<String>,
    pub stream_chunk_size: usize,
    #[serde(with = "duration_ms", rename = "dispatchDeadlineMs")]
    pub dispatch_deadline: Duration,
    pub max_connections: usize,
    pub autosave: AutosaveConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 0,
            auth_key: None,
            stream_chunk_size: ProtocolConfig::DEFAULT_STREAM_CHUNK_SIZE,
            dispatch_deadline: ProtocolConfig::DEFAULT_DISPATCH_DEADLINE,
            max_connections: ProtocolConfig::MAX_CONNECTIONS,
            autosave: AutosaveConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Load from a JSON document. Missing fields take their defaults.
    pub fn from_json(text: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_auth_key(mut self, key: impl Into<String>) -> Self {
        self.auth_key = Some(key.into());
        self
    }

    pub fn with_stream_chunk_size(mut self, size: usize) -> Self {
        self.stream_chunk_size = size;
        self
    }

    pub fn with_dispatch_deadline(mut self, deadline: Duration) -> Self {
        self.dispatch_deadline = deadline;
        self
    }

    pub fn with_autosave(mut self, autosave: AutosaveConfig) -> Self {
        self.autosave = autosave;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.stream_chunk_size == 0 {
            return Err(config_error("streamChunkSize", "must be at least 1"));
        }
        if self.dispatch_deadline.is_zero() {
            return Err(config_error("dispatchDeadlineMs", "must be greater than zero"));
        }
        if self.max_connections == 0 {
            return Err(config_error("maxConnections", "must be at least 1"));
        }
        if self.autosave.enabled {
            self.autosave.validate()?;
        }
        Ok(())
    }
}

/// Client settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ClientConfig {
    /// `host:port` of the server.
    pub addr: String,
    pub auth_key: Option<String>,
    /// Name reported in the handshake, for server logs.
    pub client_name: Option<String>,
    #[serde(with = "duration_ms", rename = "defaultTimeoutMs")]
    pub default_timeout: Duration,
    #[serde(skip)]
    pub backoff: BackoffConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:0".to_string(),
            auth_key: None,
            client_name: None,
            default_timeout: ProtocolConfig::DEFAULT_REQUEST_TIMEOUT,
            backoff: BackoffConfig::default(),
        }
    }
}

impl ClientConfig {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            ..Self::default()
        }
    }

    pub fn with_auth_key(mut self, key: impl Into<String>) -> Self {
        self.auth_key = Some(key.into());
        self
    }

    pub fn with_client_name(mut self, name: impl Into<String>) -> Self {
        self.client_name = Some(name.into());
        self
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.addr.is_empty() {
            return Err(config_error("addr", "must not be empty"));
        }
        if self.default_timeout.is_zero() {
            return Err(config_error("defaultTimeoutMs", "must be greater than zero"));
        }
        Ok(())
    }
}

fn config_error(field: &str, message: &str) -> TetherError {
    TetherError::Config {
        field: field.to_string(),
        message: message.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_autosave_mode_roundtrip() {
        for mode in [AutosaveMode::Inactivity, AutosaveMode::Burst] {
            assert_eq!(mode.as_str().parse::<AutosaveMode>().unwrap(), mode);
        }
        assert_eq!("BURST".parse::<AutosaveMode>().unwrap(), AutosaveMode::Burst);

        let err = "sometimes".parse::<AutosaveMode>().unwrap_err();
        assert!(matches!(err, TetherError::Config { ref field, .. } if field == "autosave.mode"));
    }

    #[test]
    fn test_server_config_from_partial_json() {
        let config = ServerConfig::from_json(
            r#"{"port": 7700, "streamChunkSize": 100,
                "autosave": {"mode": "inactivity", "mutationInactivityMs": 250}}"#,
        )
        .unwrap();

        assert_eq!(config.port, 7700);
        assert_eq!(config.stream_chunk_size, 100);
        assert_eq!(config.dispatch_deadline, ProtocolConfig::DEFAULT_DISPATCH_DEADLINE);
        assert_eq!(config.autosave.mode, AutosaveMode::Inactivity);
        assert_eq!(config.autosave.mutation_inactivity, Duration::from_millis(250));
        assert_eq!(config.autosave.mutation_burst_threshold, 5);
    }

    #[test]
    fn test_zero_chunk_size_rejected() {
        let result = ServerConfig::from_json(r#"{"streamChunkSize": 0}"#);
        match result {
            Err(TetherError::Config { field, .. }) => assert_eq!(field, "streamChunkSize"),
            other => panic!("Expected Config error, got: {:?}", other),
        }
    }

    #[test]
    fn test_burst_threshold_ignored_when_autosave_disabled() {
        let mut config = ServerConfig::default();
        config.autosave.enabled = false;
        config.autosave.mutation_burst_threshold = 0;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_defaults_are_reasonable() {
        assert!(ProtocolConfig::DEFAULT_REQUEST_TIMEOUT > Duration::ZERO);
        assert!(ServerConfig::default().validate().is_ok());
        assert!(ClientConfig::new("127.0.0.1:7700").validate().is_ok());
    }
}
