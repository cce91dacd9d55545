//! # Dev Session Configuration
//!
//! Configuration management for the sync engine.
//!
//! ## Configuration Sources
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Configuration Priority                               │
//! │                                                                         │
//! │  1. Environment Variables (highest priority)                           │
//! │     DRIFTLINE_API_URL=https://api.example.com                          │
//! │     DRIFTLINE_LOCAL_PORT=1492                                          │
//! │                                                                         │
//! │  2. TOML Config File                                                   │
//! │     ~/.config/driftline/driftline.toml (Linux)                         │
//! │     ~/Library/Application Support/dev.driftline.driftline/... (macOS)  │
//! │                                                                         │
//! │  3. Default Values (lowest priority)                                   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Configuration File Format
//! ```toml
//! [remote]
//! api_url = "https://api.driftline.dev"
//!
//! [session]
//! connect_timeout_secs = 10
//! max_retries = 0          # 0 = retry forever
//! ping_interval_secs = 25
//!
//! [preview]
//! local_port = 1492
//! flush_path = "/flush"
//!
//! [dependencies]
//! install_commands = [["npm", "install"]]
//! ```

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

use crate::error::{io_err, SyncError, SyncResult};

// =============================================================================
// Remote Settings
// =============================================================================

/// Where the remote service lives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteSettings {
    /// Base URL of the HTTP API. The socket URL is derived from it.
    #[serde(default = "default_api_url")]
    pub api_url: String,

    /// Path of the WebSocket endpoint on the API host.
    #[serde(default = "default_socket_path")]
    pub socket_path: String,
}

fn default_api_url() -> String {
    "https://api.driftline.dev".to_string()
}

fn default_socket_path() -> String {
    "/socket".to_string()
}

impl Default for RemoteSettings {
    fn default() -> Self {
        RemoteSettings {
            api_url: default_api_url(),
            socket_path: default_socket_path(),
        }
    }
}

// =============================================================================
// Session Settings
// =============================================================================

/// Connection and reconnection behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSettings {
    /// Connection timeout (seconds), applied to every handshake.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Maximum consecutive reconnection attempts.
    /// Set to 0 for infinite retries.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Initial backoff duration (milliseconds) for reconnection.
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,

    /// Maximum backoff duration (seconds) for reconnection.
    #[serde(default = "default_max_backoff")]
    pub max_backoff_secs: u64,

    /// Interval between keepalive pings (seconds).
    #[serde(default = "default_ping_interval")]
    pub ping_interval_secs: u64,
}

fn default_connect_timeout() -> u64 {
    10
}
fn default_max_retries() -> u32 {
    0 // Infinite
}
fn default_initial_backoff() -> u64 {
    500
}
fn default_max_backoff() -> u64 {
    30
}
fn default_ping_interval() -> u64 {
    25
}

impl Default for SessionSettings {
    fn default() -> Self {
        SessionSettings {
            connect_timeout_secs: default_connect_timeout(),
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_secs: default_max_backoff(),
            ping_interval_secs: default_ping_interval(),
        }
    }
}

// =============================================================================
// Preview Settings
// =============================================================================

/// The local development server that gets flushed after every apply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreviewSettings {
    /// Whether to flush at all. Disable when no dev server is running.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Port the local dev server listens on.
    #[serde(default = "default_local_port")]
    pub local_port: u16,

    /// Path that triggers a reload.
    #[serde(default = "default_flush_path")]
    pub flush_path: String,
}

fn default_true() -> bool {
    true
}

fn default_local_port() -> u16 {
    1492
}

fn default_flush_path() -> String {
    "/flush".to_string()
}

impl Default for PreviewSettings {
    fn default() -> Self {
        PreviewSettings {
            enabled: true,
            local_port: default_local_port(),
            flush_path: default_flush_path(),
        }
    }
}

impl PreviewSettings {
    /// Full URL of the flush endpoint.
    pub fn flush_url(&self) -> String {
        format!("http://localhost:{}{}", self.local_port, self.flush_path)
    }
}

// =============================================================================
// Dependency Settings
// =============================================================================

/// How local dependencies get installed every session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DependencySettings {
    /// Commands run in the project root, in order. Each is argv form.
    #[serde(default = "default_install_commands")]
    pub install_commands: Vec<Vec<String>>,

    /// Script registered as `scripts.postinstall` in the project manifest
    /// when none is present.
    #[serde(default = "default_postinstall")]
    pub postinstall_script: String,
}

fn default_install_commands() -> Vec<Vec<String>> {
    vec![vec!["npm".to_string(), "install".to_string()]]
}

fn default_postinstall() -> String {
    "node ./node_modules/.bin/driftline-bootstrap".to_string()
}

impl Default for DependencySettings {
    fn default() -> Self {
        DependencySettings {
            install_commands: default_install_commands(),
            postinstall_script: default_postinstall(),
        }
    }
}

// =============================================================================
// Update Settings
// =============================================================================

/// Checking for a newer published client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Registry endpoint answering with `{"crate": {"max_version": ".."}}`.
    #[serde(default = "default_registry_url")]
    pub registry_url: String,
}

fn default_registry_url() -> String {
    "https://crates.io/api/v1/crates/driftline".to_string()
}

impl Default for UpdateSettings {
    fn default() -> Self {
        UpdateSettings {
            enabled: true,
            registry_url: default_registry_url(),
        }
    }
}

// =============================================================================
// Keychain Settings
// =============================================================================

/// Location of the credential store.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KeychainSettings {
    /// Explicit keychain path. Defaults to `keychain.json` in the data dir.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

// =============================================================================
// Main Configuration
// =============================================================================

/// Complete dev session configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DevConfig {
    #[serde(default)]
    pub remote: RemoteSettings,

    #[serde(default)]
    pub session: SessionSettings,

    #[serde(default)]
    pub preview: PreviewSettings,

    #[serde(default)]
    pub dependencies: DependencySettings,

    #[serde(default)]
    pub updates: UpdateSettings,

    #[serde(default)]
    pub keychain: KeychainSettings,
}

impl DevConfig {
    /// Loads configuration from file, environment, and defaults.
    ///
    /// ## Load Order (later overrides earlier)
    /// 1. Default values
    /// 2. Config file (driftline.toml)
    /// 3. Environment variables
    pub fn load(config_path: Option<PathBuf>) -> SyncResult<Self> {
        let mut config = Self::default();

        if let Some(path) = config_path.or_else(Self::default_config_path) {
            if path.exists() {
                info!(?path, "Loading config from file");
                let contents = std::fs::read_to_string(&path).map_err(|e| io_err(&path, e))?;
                config = toml::from_str(&contents)?;
            } else {
                debug!(?path, "Config file not found, using defaults");
            }
        }

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Validates the configuration.
    pub fn validate(&self) -> SyncResult<()> {
        let api = Url::parse(&self.remote.api_url)?;
        if !matches!(api.scheme(), "http" | "https") {
            return Err(SyncError::InvalidUrl(format!(
                "API URL must start with http:// or https://, got: {}",
                self.remote.api_url
            )));
        }

        if !self.remote.socket_path.starts_with('/') {
            return Err(SyncError::InvalidConfig(
                "socket_path must start with '/'".into(),
            ));
        }

        if !self.preview.flush_path.starts_with('/') {
            return Err(SyncError::InvalidConfig(
                "flush_path must start with '/'".into(),
            ));
        }

        if self.session.connect_timeout_secs == 0 {
            return Err(SyncError::InvalidConfig(
                "connect_timeout_secs must be greater than 0".into(),
            ));
        }

        if self.session.ping_interval_secs == 0 {
            return Err(SyncError::InvalidConfig(
                "ping_interval_secs must be greater than 0".into(),
            ));
        }

        if self
            .dependencies
            .install_commands
            .iter()
            .any(|argv| argv.is_empty())
        {
            return Err(SyncError::InvalidConfig(
                "install_commands may not contain an empty command".into(),
            ));
        }

        Ok(())
    }

    /// Applies environment variable overrides.
    fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    fn apply_overrides_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup("DRIFTLINE_API_URL") {
            debug!(url = %url, "Overriding API URL from environment");
            self.remote.api_url = url;
        }

        if let Some(path) = lookup("DRIFTLINE_KEYCHAIN") {
            self.keychain.path = Some(PathBuf::from(path));
        }

        if let Some(port) = lookup("DRIFTLINE_LOCAL_PORT") {
            match port.parse::<u16>() {
                Ok(p) => {
                    debug!(port = p, "Overriding local port from environment");
                    self.preview.local_port = p;
                }
                Err(_) => warn!(port = %port, "Ignoring invalid DRIFTLINE_LOCAL_PORT"),
            }
        }

        if let Some(retries) = lookup("DRIFTLINE_MAX_RETRIES") {
            if let Ok(r) = retries.parse::<u32>() {
                self.session.max_retries = r;
            }
        }

        if let Some(skip) = lookup("DRIFTLINE_SKIP_UPDATE_CHECK") {
            if matches!(skip.to_lowercase().as_str(), "1" | "true" | "yes") {
                self.updates.enabled = false;
            }
        }
    }

    /// Returns the default config file path.
    fn default_config_path() -> Option<PathBuf> {
        Self::project_dirs().map(|dirs| dirs.config_dir().join("driftline.toml"))
    }

    fn project_dirs() -> Option<directories::ProjectDirs> {
        directories::ProjectDirs::from("dev", "driftline", "driftline")
    }

    // =========================================================================
    // Convenience Methods
    // =========================================================================

    /// Returns the WebSocket URL derived from the API URL.
    ///
    /// `http` becomes `ws`, `https` becomes `wss`, and the path is replaced
    /// by the socket path.
    pub fn socket_url(&self) -> SyncResult<Url> {
        let mut url = Url::parse(&self.remote.api_url)?;
        let scheme = match url.scheme() {
            "http" => "ws",
            "https" => "wss",
            other => {
                return Err(SyncError::InvalidUrl(format!(
                    "Cannot derive a socket URL from scheme '{other}'"
                )))
            }
        };
        url.set_scheme(scheme)
            .map_err(|_| SyncError::InvalidUrl(self.remote.api_url.clone()))?;
        url.set_path(&self.remote.socket_path);
        url.set_query(None);
        Ok(url)
    }

    /// Returns the API base URL without a trailing slash.
    pub fn api_base(&self) -> &str {
        self.remote.api_url.trim_end_matches('/')
    }

    /// Returns the keychain path, falling back to the platform data dir.
    pub fn keychain_path(&self) -> Option<PathBuf> {
        self.keychain.path.clone().or_else(|| {
            Self::project_dirs().map(|dirs| dirs.data_dir().join("keychain.json"))
        })
    }

    /// Connect timeout as a duration.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.session.connect_timeout_secs)
    }
}
