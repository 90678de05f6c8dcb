//! TOML Configuration File Support
//!
//! Centralized configuration loading for the client, from a TOML file at
//! `~/.config/taskroom/client.toml`.
//!
//! # Configuration Priority
//!
//! Configuration values are loaded with the following priority (highest first):
//! 1. CLI arguments ([`ConfigOverrides`])
//! 2. Environment variables
//! 3. TOML configuration file
//! 4. Default values
//!
//! # Example Configuration
//!
//! ```toml
//! [connection]
//! mode = "production"
//! origin = "https://tasks.example.com"
//! connect_timeout_ms = 10000
//! reconnect_attempts = 5
//! teardown_grace_ms = 5000
//!
//! [rooms]
//! join_ack_timeout_ms = 2000
//! confirm_ack_timeout_ms = 1000
//! ack_tolerant = true
//!
//! [instructions]
//! timeout_ms = 30000
//!
//! [supervisor]
//! enabled = true
//! max_attempts = 5
//! delay_ms = 2000
//! ```

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::instructions::DEFAULT_INSTRUCTION_TIMEOUT;
use crate::reconnect::SupervisorConfig;
use crate::rooms::RoomConfig;
use crate::transport::config::env_parse;
use crate::transport::{EnvironmentMode, TransportConfig};

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur when loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file
    #[error("Failed to read config file at {path}: {source}")]
    ReadError {
        /// The path that was attempted
        path: PathBuf,
        /// The underlying IO error
        source: std::io::Error,
    },

    /// Failed to parse TOML
    #[error("Failed to parse TOML config: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Tracks where the configuration came from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigSource {
    /// Command-line argument
    Cli,
    /// Environment variable
    Env,
    /// TOML configuration file
    File,
    /// Default value
    Default,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cli => write!(f, "CLI"),
            Self::Env => write!(f, "environment"),
            Self::File => write!(f, "config file"),
            Self::Default => write!(f, "default"),
        }
    }
}

// =============================================================================
// TOML Configuration Structures
// =============================================================================

/// `[connection]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionToml {
    /// "development" or "production"
    pub mode: Option<String>,
    /// Development server address
    pub dev_url: Option<String>,
    /// Production origin
    pub origin: Option<String>,
    /// Explicit server address
    pub url: Option<String>,
    /// Connection timeout in milliseconds
    pub connect_timeout_ms: Option<u64>,
    /// Transport-level reconnection attempts
    pub reconnect_attempts: Option<u32>,
    /// Delay between reconnection attempts in milliseconds
    pub reconnect_delay_ms: Option<u64>,
    /// Idle teardown grace in milliseconds
    pub teardown_grace_ms: Option<u64>,
}

/// `[rooms]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RoomsToml {
    /// Wait for `joined` in milliseconds
    pub join_ack_timeout_ms: Option<u64>,
    /// Wait for `room_confirmed` in milliseconds
    pub confirm_ack_timeout_ms: Option<u64>,
    /// Treat a missing ack as success
    pub ack_tolerant: Option<bool>,
}

/// `[instructions]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct InstructionsToml {
    /// Ack timeout in milliseconds
    pub timeout_ms: Option<u64>,
}

/// `[supervisor]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorToml {
    /// Run the reconnect supervisor
    pub enabled: Option<bool>,
    /// Attempts before giving up
    pub max_attempts: Option<u32>,
    /// Delay before each attempt in milliseconds
    pub delay_ms: Option<u64>,
}

/// Top-level TOML configuration structure
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientToml {
    /// `[connection]`
    pub connection: ConnectionToml,
    /// `[rooms]`
    pub rooms: RoomsToml,
    /// `[instructions]`
    pub instructions: InstructionsToml,
    /// `[supervisor]`
    pub supervisor: SupervisorToml,
}

// =============================================================================
// Main Configuration Struct
// =============================================================================

/// Everything the client needs, merged from all sources
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// Connection target and retry policy
    pub transport: TransportConfig,
    /// Room ack policy
    pub rooms: RoomConfig,
    /// Instruction ack timeout
    pub instruction_timeout: Duration,
    /// Reconnect supervisor policy
    pub supervisor: SupervisorConfig,
    /// Path to the config file that was loaded (if any)
    pub config_file_path: Option<PathBuf>,
    source: ConfigSource,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            transport: TransportConfig::default(),
            rooms: RoomConfig::default(),
            instruction_timeout: DEFAULT_INSTRUCTION_TIMEOUT,
            supervisor: SupervisorConfig::default(),
            config_file_path: None,
            source: ConfigSource::Default,
        }
    }
}

impl ClientConfig {
    /// Defaults pointed at `url`
    #[must_use]
    pub fn with_url(url: impl Into<String>) -> Self {
        Self {
            transport: TransportConfig::with_url(url),
            ..Default::default()
        }
    }

    /// Highest-priority source that contributed
    #[must_use]
    pub fn source(&self) -> ConfigSource {
        self.source
    }
}

// =============================================================================
// Configuration Loading
// =============================================================================

/// Default configuration file path
///
/// `$XDG_CONFIG_HOME/taskroom/client.toml`, typically
/// `~/.config/taskroom/client.toml`.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("taskroom").join("client.toml"))
}

/// Load configuration from the default file and the environment
///
/// # Errors
///
/// Returns an error if the config file exists but cannot be read or parsed.
/// A missing config file is not an error.
pub fn load_config() -> Result<ClientConfig, ConfigError> {
    load_config_from_path(default_config_path())
}

/// Load configuration from a specific path, then the environment
///
/// # Errors
///
/// Returns an error if the file cannot be read or parsed, or holds an
/// invalid value.
pub fn load_config_from_path(path: Option<PathBuf>) -> Result<ClientConfig, ConfigError> {
    let mut config = ClientConfig::default();

    if let Some(ref config_path) = path {
        if config_path.exists() {
            let toml_content =
                std::fs::read_to_string(config_path).map_err(|e| ConfigError::ReadError {
                    path: config_path.clone(),
                    source: e,
                })?;

            let toml_config: ClientToml = toml::from_str(&toml_content)?;
            apply_toml_config(&mut config, &toml_config)?;
            config.config_file_path = Some(config_path.clone());
            config.source = ConfigSource::File;

            tracing::info!(path = %config_path.display(), "Loaded configuration from file");
        } else {
            tracing::debug!(
                path = %config_path.display(),
                "Config file not found, using defaults"
            );
        }
    }

    apply_env_config(&mut config);
    Ok(config)
}

/// Apply TOML values over the current configuration
fn apply_toml_config(config: &mut ClientConfig, toml: &ClientToml) -> Result<(), ConfigError> {
    let conn = &toml.connection;
    if let Some(mode) = &conn.mode {
        config.transport.mode = mode
            .parse::<EnvironmentMode>()
            .map_err(ConfigError::ValidationError)?;
    }
    if let Some(url) = &conn.dev_url {
        config.transport.dev_url = url.clone();
    }
    if conn.origin.is_some() {
        config.transport.origin = conn.origin.clone();
    }
    if conn.url.is_some() {
        config.transport.url = conn.url.clone();
    }
    if let Some(ms) = conn.connect_timeout_ms {
        if ms == 0 {
            return Err(ConfigError::ValidationError(
                "connection.connect_timeout_ms must be greater than zero".to_string(),
            ));
        }
        config.transport.connect_timeout_ms = ms;
    }
    if let Some(attempts) = conn.reconnect_attempts {
        config.transport.reconnect_attempts = attempts;
    }
    if let Some(ms) = conn.reconnect_delay_ms {
        config.transport.reconnect_delay_ms = ms;
    }
    if let Some(ms) = conn.teardown_grace_ms {
        config.transport.teardown_grace_ms = ms;
    }

    if let Some(ms) = toml.rooms.join_ack_timeout_ms {
        config.rooms.join_ack_timeout = Duration::from_millis(ms);
    }
    if let Some(ms) = toml.rooms.confirm_ack_timeout_ms {
        config.rooms.confirm_ack_timeout = Duration::from_millis(ms);
    }
    if let Some(tolerant) = toml.rooms.ack_tolerant {
        config.rooms.ack_tolerant = tolerant;
    }

    if let Some(ms) = toml.instructions.timeout_ms {
        if ms == 0 {
            return Err(ConfigError::ValidationError(
                "instructions.timeout_ms must be greater than zero".to_string(),
            ));
        }
        config.instruction_timeout = Duration::from_millis(ms);
    }

    if let Some(enabled) = toml.supervisor.enabled {
        config.supervisor.enabled = enabled;
    }
    if let Some(attempts) = toml.supervisor.max_attempts {
        config.supervisor.max_attempts = attempts;
    }
    if let Some(ms) = toml.supervisor.delay_ms {
        config.supervisor.delay = Duration::from_millis(ms);
    }
    Ok(())
}

/// Apply environment variable overrides
fn apply_env_config(config: &mut ClientConfig) {
    let before = config.transport.clone();
    config.transport.apply_env();
    if config.transport != before {
        config.source = ConfigSource::Env;
    }

    if let Ok(value) = std::env::var("TASKROOM_ACK_TOLERANT") {
        config.rooms.ack_tolerant = value != "0" && value.to_lowercase() != "false";
        config.source = ConfigSource::Env;
    }
    if let Some(ms) = env_parse::<u64>("TASKROOM_INSTRUCTION_TIMEOUT").filter(|ms| *ms > 0) {
        config.instruction_timeout = Duration::from_millis(ms);
        config.source = ConfigSource::Env;
    }
}

// =============================================================================
// CLI Override Support
// =============================================================================

/// Builder for applying CLI overrides to configuration
///
/// Use this after [`load_config`].
#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    /// Server address override
    pub url: Option<String>,
    /// Environment mode override
    pub mode: Option<EnvironmentMode>,
    /// Connect timeout override (milliseconds)
    pub connect_timeout_ms: Option<u64>,
    /// Strict room acks override
    pub ack_tolerant: Option<bool>,
}

impl ConfigOverrides {
    /// Create a new empty set of overrides
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set server address override
    #[must_use]
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    /// Set environment mode override
    #[must_use]
    pub fn with_mode(mut self, mode: EnvironmentMode) -> Self {
        self.mode = Some(mode);
        self
    }

    /// Set connect timeout override
    #[must_use]
    pub fn with_connect_timeout_ms(mut self, ms: u64) -> Self {
        self.connect_timeout_ms = Some(ms);
        self
    }

    /// Set room ack policy override
    #[must_use]
    pub fn with_ack_tolerant(mut self, tolerant: bool) -> Self {
        self.ack_tolerant = Some(tolerant);
        self
    }

    /// Apply overrides to a configuration
    pub fn apply(&self, config: &mut ClientConfig) {
        if self.url.is_some()
            || self.mode.is_some()
            || self.connect_timeout_ms.is_some()
            || self.ack_tolerant.is_some()
        {
            config.source = ConfigSource::Cli;
        }

        if let Some(url) = &self.url {
            config.transport.url = Some(url.clone());
        }
        if let Some(mode) = self.mode {
            config.transport.mode = mode;
        }
        if let Some(ms) = self.connect_timeout_ms.filter(|ms| *ms > 0) {
            config.transport.connect_timeout_ms = ms;
        }
        if let Some(tolerant) = self.ack_tolerant {
            config.rooms.ack_tolerant = tolerant;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::io::Write;
    use tempfile::NamedTempFile;

    /// Serializes tests that read or write process environment
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    const ENV_VARS: [&str; 8] = [
        "TASKROOM_MODE",
        "TASKROOM_URL",
        "TASKROOM_ORIGIN",
        "TASKROOM_CONNECT_TIMEOUT",
        "TASKROOM_RECONNECT_ATTEMPTS",
        "TASKROOM_RECONNECT_DELAY",
        "TASKROOM_ACK_TOLERANT",
        "TASKROOM_INSTRUCTION_TIMEOUT",
    ];

    fn clear_config_env_vars() {
        for var in ENV_VARS {
            std::env::remove_var(var);
        }
    }

    fn write_toml(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_default_config() {
        let config = ClientConfig::default();
        assert_eq!(config.transport.mode, EnvironmentMode::Development);
        assert_eq!(config.rooms.join_ack_timeout, Duration::from_secs(2));
        assert_eq!(config.rooms.confirm_ack_timeout, Duration::from_secs(1));
        assert!(config.rooms.ack_tolerant);
        assert_eq!(config.instruction_timeout, Duration::from_secs(30));
        assert_eq!(config.supervisor.max_attempts, 5);
        assert_eq!(config.source(), ConfigSource::Default);
    }

    #[test]
    fn test_default_config_path() {
        if let Some(p) = default_config_path() {
            assert!(p.ends_with("taskroom/client.toml"));
        }
    }

    #[test]
    fn test_parse_valid_toml() {
        let _env = ENV_LOCK.lock();
        clear_config_env_vars();
        let file = write_toml(
            r#"
[connection]
mode = "production"
origin = "https://tasks.example.com"
connect_timeout_ms = 3000
teardown_grace_ms = 8000

[rooms]
join_ack_timeout_ms = 500
ack_tolerant = false

[instructions]
timeout_ms = 10000

[supervisor]
enabled = false
max_attempts = 2
delay_ms = 250
"#,
        );

        let config = load_config_from_path(Some(file.path().to_path_buf())).unwrap();
        assert_eq!(config.transport.mode, EnvironmentMode::Production);
        assert_eq!(
            config.transport.resolve_url().as_deref(),
            Some("https://tasks.example.com")
        );
        assert_eq!(config.transport.connect_timeout_ms, 3000);
        assert_eq!(config.transport.teardown_grace_ms, 8000);
        assert_eq!(config.rooms.join_ack_timeout, Duration::from_millis(500));
        assert_eq!(config.rooms.confirm_ack_timeout, Duration::from_secs(1));
        assert!(!config.rooms.ack_tolerant);
        assert_eq!(config.instruction_timeout, Duration::from_secs(10));
        assert!(!config.supervisor.enabled);
        assert_eq!(config.supervisor.max_attempts, 2);
        assert_eq!(config.supervisor.delay, Duration::from_millis(250));
        assert_eq!(config.source(), ConfigSource::File);
        assert_eq!(config.config_file_path.as_deref(), Some(file.path()));
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let _env = ENV_LOCK.lock();
        clear_config_env_vars();
        let config =
            load_config_from_path(Some(PathBuf::from("/nonexistent/taskroom/client.toml")))
                .unwrap();
        assert_eq!(config.source(), ConfigSource::Default);
        assert!(config.config_file_path.is_none());
    }

    #[test]
    fn test_malformed_toml_is_parse_error() {
        let _env = ENV_LOCK.lock();
        let file = write_toml("[connection\nmode = ");
        let err = load_config_from_path(Some(file.path().to_path_buf())).unwrap_err();
        assert!(matches!(err, ConfigError::ParseError(_)));
    }

    #[test]
    fn test_invalid_mode_is_validation_error() {
        let _env = ENV_LOCK.lock();
        let file = write_toml("[connection]\nmode = \"staging\"\n");
        let err = load_config_from_path(Some(file.path().to_path_buf())).unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError(_)));
    }

    #[test]
    fn test_zero_connect_timeout_is_validation_error() {
        let _env = ENV_LOCK.lock();
        clear_config_env_vars();
        let file = write_toml("[connection]\nconnect_timeout_ms = 0\n");
        let err = load_config_from_path(Some(file.path().to_path_buf())).unwrap_err();
        assert!(
            matches!(&err, ConfigError::ValidationError(msg) if msg.contains("connect_timeout_ms")),
            "{err:?}"
        );
    }

    #[test]
    fn test_zero_connect_timeout_from_env_is_ignored() {
        let _env = ENV_LOCK.lock();
        clear_config_env_vars();
        let file = write_toml("[connection]\nconnect_timeout_ms = 3000\n");

        std::env::set_var("TASKROOM_CONNECT_TIMEOUT", "0");
        let config = load_config_from_path(Some(file.path().to_path_buf()));
        clear_config_env_vars();

        assert_eq!(config.unwrap().transport.connect_timeout_ms, 3000);
    }

    #[test]
    fn test_env_overrides_file() {
        let _env = ENV_LOCK.lock();
        clear_config_env_vars();
        let file = write_toml(
            "[connection]\nconnect_timeout_ms = 3000\n[rooms]\nack_tolerant = true\n",
        );

        std::env::set_var("TASKROOM_CONNECT_TIMEOUT", "7000");
        std::env::set_var("TASKROOM_ACK_TOLERANT", "false");
        std::env::set_var("TASKROOM_INSTRUCTION_TIMEOUT", "1500");
        let config = load_config_from_path(Some(file.path().to_path_buf()));
        clear_config_env_vars();

        let config = config.unwrap();
        assert_eq!(config.transport.connect_timeout_ms, 7000);
        assert!(!config.rooms.ack_tolerant);
        assert_eq!(config.instruction_timeout, Duration::from_millis(1500));
        assert_eq!(config.source(), ConfigSource::Env);
    }

    #[test]
    fn test_overrides_win() {
        let _env = ENV_LOCK.lock();
        clear_config_env_vars();
        std::env::set_var("TASKROOM_URL", "http://from-env:1");
        let mut config = load_config_from_path(None).unwrap();
        clear_config_env_vars();
        assert_eq!(config.transport.url.as_deref(), Some("http://from-env:1"));

        ConfigOverrides::new()
            .with_url("http://from-cli:2")
            .with_mode(EnvironmentMode::Production)
            .with_ack_tolerant(false)
            .apply(&mut config);
        assert_eq!(
            config.transport.resolve_url().as_deref(),
            Some("http://from-cli:2")
        );
        assert!(!config.rooms.ack_tolerant);
        assert_eq!(config.source(), ConfigSource::Cli);
    }

    #[test]
    fn test_empty_overrides_keep_source() {
        let mut config = ClientConfig::default();
        ConfigOverrides::new().apply(&mut config);
        assert_eq!(config.source(), ConfigSource::Default);
    }
}
