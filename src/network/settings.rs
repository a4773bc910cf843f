//! Connection Settings
//!
//! Endpoint, credentials and timing knobs. Loaded from `MATCHLINK_*`
//! environment variables or a TOML file; blank values fall back to the
//! documented defaults.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Server key used when none is configured.
pub const DEFAULT_SERVER_KEY: &str = "defaultkey";
/// Port used for plain `http` when none is configured.
pub const DEFAULT_HTTP_PORT: u16 = 7350;
/// Port used for `https` when none is configured.
pub const DEFAULT_HTTPS_PORT: u16 = 443;
/// Default HTTP request timeout.
pub const DEFAULT_TIMEOUT_SECS: u64 = 15;
/// Default socket connect timeout.
pub const DEFAULT_SOCKET_TIMEOUT_SECS: u64 = 30;
/// Default heartbeat interval.
pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 500;

/// Which backend the connector builds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// HTTP + WebSocket realtime server.
    #[default]
    Remote,
    /// In-process stand-in that never touches the network.
    Offline,
}

/// Settings errors.
#[derive(Debug, Error)]
pub enum SettingsError {
    /// Scheme other than `http` / `https`.
    #[error("unsupported scheme: {0}")]
    InvalidScheme(String),
    /// Host left empty.
    #[error("host is required")]
    MissingHost,
    /// Host contains a scheme, path or whitespace.
    #[error("invalid host: {0}")]
    InvalidHost(String),
    /// An environment variable did not parse.
    #[error("invalid value for {var}: {value:?}")]
    InvalidEnv {
        /// Variable name.
        var: String,
        /// Raw value.
        value: String,
    },
    /// Reading the settings file failed.
    #[error("failed to read settings: {0}")]
    Io(#[from] std::io::Error),
    /// The settings file is not valid TOML.
    #[error("failed to parse settings: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Client connection settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Backend selection.
    pub backend: BackendKind,
    /// `http` or `https`. Blank means `http`.
    pub scheme: String,
    /// Server host name.
    pub host: String,
    /// Server port. Zero picks the scheme's default.
    pub port: u16,
    /// Server key for device authentication. Blank means `defaultkey`.
    pub server_key: String,
    /// HTTP request timeout in seconds. Zero means the default.
    pub timeout_secs: u64,
    /// Socket connect timeout in seconds. Zero means the default.
    pub socket_timeout_secs: u64,
    /// Run the demo binary on a single-threaded runtime.
    pub use_main_thread_dispatch: bool,
    /// Heartbeat interval in milliseconds.
    pub heartbeat_interval_ms: u64,
    /// Start the reconnect supervisor when the connection drops.
    pub auto_reconnect: bool,
    /// Reconnect backoff delays in milliseconds. Empty means the built-in list.
    pub reconnect_delays_ms: Vec<u64>,
    /// Stop reconnecting after the last delay instead of repeating it.
    pub reconnect_give_up: bool,
    /// Fixed device id. Takes precedence over the persisted one.
    pub device_id: Option<String>,
    /// File holding the persisted device id.
    pub device_id_path: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            backend: BackendKind::Remote,
            scheme: "http".into(),
            host: "127.0.0.1".into(),
            port: DEFAULT_HTTP_PORT,
            server_key: DEFAULT_SERVER_KEY.into(),
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            socket_timeout_secs: DEFAULT_SOCKET_TIMEOUT_SECS,
            use_main_thread_dispatch: false,
            heartbeat_interval_ms: DEFAULT_HEARTBEAT_INTERVAL_MS,
            auto_reconnect: true,
            reconnect_delays_ms: Vec::new(),
            reconnect_give_up: false,
            device_id: None,
            device_id_path: None,
        }
    }
}

impl Settings {
    /// Offline settings, mostly for demos and tests.
    pub fn offline() -> Self {
        Self {
            backend: BackendKind::Offline,
            ..Default::default()
        }
    }

    /// Load settings from `MATCHLINK_*` environment variables.
    pub fn from_env() -> Result<Self, SettingsError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Load settings through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, SettingsError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut settings = Self::default();

        if let Some(value) = lookup("MATCHLINK_BACKEND") {
            settings.backend = match value.trim().to_ascii_lowercase().as_str() {
                "remote" | "" => BackendKind::Remote,
                "offline" => BackendKind::Offline,
                _ => return Err(invalid("MATCHLINK_BACKEND", &value)),
            };
        }
        if let Some(value) = lookup("MATCHLINK_SCHEME") {
            settings.scheme = value;
        }
        if let Some(value) = lookup("MATCHLINK_HOST") {
            settings.host = value;
        }
        if let Some(value) = lookup("MATCHLINK_PORT") {
            settings.port = parse_var("MATCHLINK_PORT", &value)?;
        }
        if let Some(value) = lookup("MATCHLINK_SERVER_KEY") {
            settings.server_key = value;
        }
        if let Some(value) = lookup("MATCHLINK_TIMEOUT_SECS") {
            settings.timeout_secs = parse_var("MATCHLINK_TIMEOUT_SECS", &value)?;
        }
        if let Some(value) = lookup("MATCHLINK_SOCKET_TIMEOUT_SECS") {
            settings.socket_timeout_secs = parse_var("MATCHLINK_SOCKET_TIMEOUT_SECS", &value)?;
        }
        if let Some(value) = lookup("MATCHLINK_MAIN_THREAD") {
            settings.use_main_thread_dispatch = parse_flag(&value);
        }
        if let Some(value) = lookup("MATCHLINK_HEARTBEAT_MS") {
            settings.heartbeat_interval_ms = parse_var("MATCHLINK_HEARTBEAT_MS", &value)?;
        }
        if let Some(value) = lookup("MATCHLINK_AUTO_RECONNECT") {
            settings.auto_reconnect = parse_flag(&value);
        }
        if let Some(value) = lookup("MATCHLINK_RECONNECT_DELAYS_MS") {
            settings.reconnect_delays_ms = value
                .split(',')
                .map(str::trim)
                .filter(|part| !part.is_empty())
                .map(|part| parse_var("MATCHLINK_RECONNECT_DELAYS_MS", part))
                .collect::<Result<_, _>>()?;
        }
        if let Some(value) = lookup("MATCHLINK_RECONNECT_GIVE_UP") {
            settings.reconnect_give_up = parse_flag(&value);
        }
        settings.device_id = lookup("MATCHLINK_DEVICE_ID").filter(|v| !v.trim().is_empty());
        settings.device_id_path = lookup("MATCHLINK_DEVICE_ID_PATH")
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from);

        Ok(settings)
    }

    /// Parse settings from TOML text. Missing keys take their defaults.
    pub fn from_toml_str(text: &str) -> Result<Self, SettingsError> {
        Ok(toml::from_str(text)?)
    }

    /// Read and parse a TOML settings file.
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self, SettingsError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Check the endpoint. Offline settings are always valid.
    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.backend == BackendKind::Offline {
            return Ok(());
        }

        let scheme = self.effective_scheme();
        if scheme != "http" && scheme != "https" {
            return Err(SettingsError::InvalidScheme(scheme));
        }

        let host = self.host.trim();
        if host.is_empty() {
            return Err(SettingsError::MissingHost);
        }
        if host.contains("://") || host.contains('/') || host.chars().any(char::is_whitespace) {
            return Err(SettingsError::InvalidHost(host.to_string()));
        }

        Ok(())
    }

    /// Lowercased scheme, `http` when blank.
    pub fn effective_scheme(&self) -> String {
        let scheme = self.scheme.trim();
        if scheme.is_empty() {
            "http".into()
        } else {
            scheme.to_ascii_lowercase()
        }
    }

    /// Configured port, or 443 for `https` and 7350 otherwise.
    pub fn effective_port(&self) -> u16 {
        if self.port != 0 {
            self.port
        } else if self.effective_scheme() == "https" {
            DEFAULT_HTTPS_PORT
        } else {
            DEFAULT_HTTP_PORT
        }
    }

    /// Trimmed server key, `defaultkey` when blank.
    pub fn effective_server_key(&self) -> String {
        let key = self.server_key.trim();
        if key.is_empty() {
            DEFAULT_SERVER_KEY.into()
        } else {
            key.into()
        }
    }

    /// Base URL for HTTP calls, e.g. `http://127.0.0.1:7350`.
    pub fn http_base_url(&self) -> String {
        format!("{}://{}:{}", self.effective_scheme(), self.host.trim(), self.effective_port())
    }

    /// Realtime socket URL without query parameters.
    pub fn socket_url(&self) -> String {
        let scheme = if self.effective_scheme() == "https" { "wss" } else { "ws" };
        format!("{}://{}:{}/ws", scheme, self.host.trim(), self.effective_port())
    }

    /// HTTP request timeout.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(non_zero(self.timeout_secs, DEFAULT_TIMEOUT_SECS))
    }

    /// Socket connect timeout.
    pub fn socket_timeout(&self) -> Duration {
        Duration::from_secs(non_zero(self.socket_timeout_secs, DEFAULT_SOCKET_TIMEOUT_SECS))
    }

    /// Heartbeat interval.
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(non_zero(self.heartbeat_interval_ms, DEFAULT_HEARTBEAT_INTERVAL_MS))
    }
}

fn non_zero(value: u64, fallback: u64) -> u64 {
    if value == 0 {
        fallback
    } else {
        value
    }
}

fn parse_flag(value: &str) -> bool {
    matches!(value.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

fn parse_var<T: std::str::FromStr>(var: &str, value: &str) -> Result<T, SettingsError> {
    value.trim().parse().map_err(|_| invalid(var, value))
}

fn invalid(var: &str, value: &str) -> SettingsError {
    SettingsError::InvalidEnv {
        var: var.into(),
        value: value.into(),
    }
}

// =============================================================================
// TESTS
// =============================================================================
