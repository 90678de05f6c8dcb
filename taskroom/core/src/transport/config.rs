//! Transport Configuration
//!
//! Where to connect and how hard to try.

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Local server address used in development mode
pub const DEV_URL: &str = "http://localhost:12398";

/// Which deployment the client runs in
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvironmentMode {
    /// Talk to the fixed local development server
    #[default]
    Development,
    /// Talk to the origin the application is served from
    Production,
}

impl FromStr for EnvironmentMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "development" | "dev" => Ok(Self::Development),
            "production" | "prod" => Ok(Self::Production),
            other => Err(format!("unknown environment mode '{other}'")),
        }
    }
}

/// Connection target and retry policy
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Deployment mode used to pick the target
    pub mode: EnvironmentMode,

    /// Server address in development mode
    pub dev_url: String,

    /// Same-origin address in production mode
    pub origin: Option<String>,

    /// Explicit target; wins over the mode-derived one
    pub url: Option<String>,

    /// How long a single connection attempt may take
    pub connect_timeout_ms: u64,

    /// Automatic reconnection attempts after a transport loss (0 = none)
    pub reconnect_attempts: u32,

    /// Delay between reconnection attempts in milliseconds
    pub reconnect_delay_ms: u64,

    /// Grace window before an unreferenced connection is torn down
    pub teardown_grace_ms: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            mode: EnvironmentMode::default(),
            dev_url: DEV_URL.to_string(),
            origin: None,
            url: None,
            connect_timeout_ms: 10_000,
            reconnect_attempts: 5,
            reconnect_delay_ms: 1000,
            teardown_grace_ms: 5000,
        }
    }
}

impl TransportConfig {
    /// Configuration pinned to a specific server
    pub fn with_url(url: impl Into<String>) -> Self {
        Self {
            url: Some(url.into()),
            ..Default::default()
        }
    }

    /// Load configuration from environment variables
    ///
    /// Environment variables:
    /// - `TASKROOM_MODE`: "development"/"dev" or "production"/"prod"
    /// - `TASKROOM_URL`: Explicit server address
    /// - `TASKROOM_ORIGIN`: Production origin
    /// - `TASKROOM_CONNECT_TIMEOUT`: Connection timeout in ms
    /// - `TASKROOM_RECONNECT_ATTEMPTS`: Number of reconnection attempts
    /// - `TASKROOM_RECONNECT_DELAY`: Delay between attempts in ms
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env();
        config
    }

    /// Overlay whatever transport settings the environment provides
    pub fn apply_env(&mut self) {
        if let Some(mode) = std::env::var("TASKROOM_MODE")
            .ok()
            .and_then(|v| v.parse().ok())
        {
            self.mode = mode;
        }
        if let Ok(url) = std::env::var("TASKROOM_URL") {
            self.url = Some(url);
        }
        if let Ok(origin) = std::env::var("TASKROOM_ORIGIN") {
            self.origin = Some(origin);
        }
        if let Some(ms) = env_parse::<u64>("TASKROOM_CONNECT_TIMEOUT").filter(|ms| *ms > 0) {
            self.connect_timeout_ms = ms;
        }
        if let Some(attempts) = env_parse("TASKROOM_RECONNECT_ATTEMPTS") {
            self.reconnect_attempts = attempts;
        }
        if let Some(ms) = env_parse("TASKROOM_RECONNECT_DELAY") {
            self.reconnect_delay_ms = ms;
        }
    }

    /// The address to connect to
    ///
    /// An explicit `url` wins; otherwise development mode uses `dev_url` and
    /// production uses the configured origin. `None` when production mode
    /// has no origin.
    #[must_use]
    pub fn resolve_url(&self) -> Option<String> {
        if let Some(url) = &self.url {
            return Some(url.clone());
        }
        match self.mode {
            EnvironmentMode::Development => Some(self.dev_url.clone()),
            EnvironmentMode::Production => self.origin.clone(),
        }
    }

    /// Connection attempt timeout
    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Delay between reconnection attempts
    #[must_use]
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    /// Teardown grace window
    #[must_use]
    pub fn teardown_grace(&self) -> Duration {
        Duration::from_millis(self.teardown_grace_ms)
    }
}

pub(crate) fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}
