#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Runtime configuration for the GreenSentinel client stack.
//!
//! Configuration is layered, later source wins: built-in defaults, an
//! optional TOML override file (the desktop/PWA counterpart kept these in
//! persisted local settings), then `GREEN_SENTINEL_*` environment
//! variables. The sync store and REST client consume the resolved
//! [`ClientConfig`]; URL construction lives here so connection logic never
//! re-derives protocol or host.

use std::path::Path;
use std::time::Duration;

use green_sentinel_incident_models::IncidentState;
use serde::Deserialize;

/// Default API host when nothing is configured.
pub const DEFAULT_API_HOST: &str = "localhost:8000";

/// Default WebSocket path for the live incident stream.
pub const DEFAULT_WS_PATH: &str = "/ws/incidents";

/// Default bound on the number of incidents retained client-side.
pub const DEFAULT_MAX_INCIDENTS: usize = 100;

/// Errors raised while loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The override file could not be read.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The override file is not valid TOML or has the wrong shape.
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Reconnect policy for the live connection: exponential backoff with a
/// cap, giving up after a fixed number of attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Delay before the first reconnect attempt.
    pub base_delay: Duration,
    /// Ceiling applied to the exponential delay.
    pub max_delay: Duration,
    /// Number of attempts before the store gives up and stays
    /// disconnected.
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_attempts: 10,
        }
    }
}

impl ReconnectPolicy {
    /// Returns the backoff delay for the given zero-based attempt:
    /// `min(base_delay * 2^attempt, max_delay)`.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Resolved client configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    /// API host, `host[:port]` with no scheme.
    pub api_host: String,
    /// Whether to use TLS transports (`https`/`wss`).
    pub secure: bool,
    /// Path of the live incident stream endpoint.
    pub ws_path: String,
    /// Server-side state filter applied to the bootstrap fetch.
    pub state_filter: Option<IncidentState>,
    /// Bound on the number of incidents retained client-side.
    pub max_incidents: usize,
    /// Reconnect policy for the live connection.
    pub reconnect: ReconnectPolicy,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_host: DEFAULT_API_HOST.to_owned(),
            secure: false,
            ws_path: DEFAULT_WS_PATH.to_owned(),
            state_filter: Some(IncidentState::ValidatedFire),
            max_incidents: DEFAULT_MAX_INCIDENTS,
            reconnect: ReconnectPolicy::default(),
        }
    }
}

/// Partial configuration as parsed from the TOML override file. Every
/// field is optional; absent fields keep the previous layer's value.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileConfig {
    api_host: Option<String>,
    secure: Option<bool>,
    ws_path: Option<String>,
    state_filter: Option<IncidentState>,
    max_incidents: Option<usize>,
    reconnect: Option<FileReconnect>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileReconnect {
    base_delay_ms: Option<u64>,
    max_delay_ms: Option<u64>,
    max_attempts: Option<u32>,
}

impl ClientConfig {
    /// Loads configuration from defaults, the optional override file, and
    /// the environment, in that order.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the override file exists but cannot be
    /// read or parsed. Malformed environment values are logged and
    /// skipped, matching how the rest of the toolchain treats env input.
    pub fn load(override_file: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(path) = override_file {
            let raw = std::fs::read_to_string(path)?;
            config.apply_file(&toml::from_str(&raw)?);
        }
        config.apply_env();
        Ok(config)
    }

    /// Loads configuration from defaults and the environment only.
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env();
        config
    }

    fn apply_file(&mut self, file: &FileConfig) {
        if let Some(host) = &file.api_host {
            self.api_host = clean_host(host);
        }
        if let Some(secure) = file.secure {
            self.secure = secure;
        }
        if let Some(path) = &file.ws_path {
            self.ws_path.clone_from(path);
        }
        if let Some(state) = file.state_filter {
            self.state_filter = Some(state);
        }
        if let Some(max) = file.max_incidents {
            self.max_incidents = max;
        }
        if let Some(reconnect) = &file.reconnect {
            if let Some(ms) = reconnect.base_delay_ms {
                self.reconnect.base_delay = Duration::from_millis(ms);
            }
            if let Some(ms) = reconnect.max_delay_ms {
                self.reconnect.max_delay = Duration::from_millis(ms);
            }
            if let Some(attempts) = reconnect.max_attempts {
                self.reconnect.max_attempts = attempts;
            }
        }
    }

    fn apply_env(&mut self) {
        if let Ok(host) = std::env::var("GREEN_SENTINEL_API_HOST") {
            self.api_host = clean_host(&host);
        }
        if let Ok(secure) = std::env::var("GREEN_SENTINEL_SECURE") {
            self.secure = matches!(secure.as_str(), "1" | "true" | "yes");
        }
        if let Ok(path) = std::env::var("GREEN_SENTINEL_WS_PATH") {
            self.ws_path = path;
        }
        if let Ok(state) = std::env::var("GREEN_SENTINEL_STATE_FILTER") {
            match state.parse::<IncidentState>() {
                Ok(parsed) => self.state_filter = Some(parsed),
                Err(_) => log::warn!("Ignoring invalid GREEN_SENTINEL_STATE_FILTER: {state}"),
            }
        }
        if let Ok(max) = std::env::var("GREEN_SENTINEL_MAX_INCIDENTS") {
            match max.parse::<usize>() {
                Ok(parsed) => self.max_incidents = parsed,
                Err(_) => log::warn!("Ignoring invalid GREEN_SENTINEL_MAX_INCIDENTS: {max}"),
            }
        }
    }

    /// Base URL for REST requests, e.g. `http://localhost:8000`.
    #[must_use]
    pub fn http_base(&self) -> String {
        let scheme = if self.secure { "https" } else { "http" };
        format!("{scheme}://{}", self.api_host)
    }

    /// Full URL of the live incident stream, protocol matched to the
    /// transport security of the REST base.
    #[must_use]
    pub fn ws_url(&self) -> String {
        let scheme = if self.secure { "wss" } else { "ws" };
        format!("{scheme}://{}{}", self.api_host, self.ws_path)
    }
}

/// Strips scheme prefixes and trailing slashes from a configured host.
/// Persisted overrides from the original apps sometimes carried a full
/// URL (`http://host:port/`) where only `host:port` belongs.
#[must_use]
pub fn clean_host(raw: &str) -> String {
    let trimmed = raw.trim();
    let without_scheme = ["https://", "http://", "wss://", "ws://"]
        .iter()
        .find_map(|prefix| trimmed.strip_prefix(prefix))
        .unwrap_or(trimmed);
    without_scheme.trim_end_matches('/').to_owned()
}
