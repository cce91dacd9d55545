//! # Sync Error Types
//!
//! Error types for sync operations.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Sync Error Categories                             │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │  Configuration  │  │   Transport     │  │     Protocol            │ │
//! │  │                 │  │                 │  │                         │ │
//! │  │  InvalidConfig  │  │  RequestFailed  │  │  Protocol (CoreError)   │ │
//! │  │  InvalidUrl     │  │  Forbidden      │  │  InvalidMessage         │ │
//! │  │  ConfigLoad...  │  │  Disconnected   │  │  DeserializationFailed  │ │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────┘ │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │     Remote      │  │   Filesystem    │  │   Apply / Flush         │ │
//! │  │                 │  │                 │  │                         │ │
//! │  │  NotFound       │  │  Io { path }    │  │  ApplyError             │ │
//! │  │  RemoteStatus   │  │  CommandFailed  │  │  FlushError             │ │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Only transport drops are recovered internally (reconnect + resubscribe).
//! Everything else propagates to the caller as a distinct variant.

use std::path::PathBuf;

use driftline_core::CoreError;
use thiserror::Error;

/// Result type alias for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Sync error type covering all possible sync failures.
#[derive(Debug, Error)]
pub enum SyncError {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Invalid configuration.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Invalid remote URL.
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// Failed to load config file.
    #[error("Failed to load config: {0}")]
    ConfigLoadFailed(String),

    // =========================================================================
    // Transport Errors
    // =========================================================================
    /// The remote service could not be reached.
    #[error("Could not communicate with {url}: {reason}")]
    RequestFailed { url: String, reason: String },

    /// The remote rejected our credentials.
    #[error("Credentials were rejected by the remote service")]
    Forbidden,

    /// The transport dropped.
    #[error("Disconnected from remote service")]
    Disconnected,

    /// Connection timeout.
    #[error("Connection timeout after {0} seconds")]
    Timeout(u64),

    /// TLS/SSL error.
    #[error("TLS error: {0}")]
    TlsError(String),

    /// WebSocket protocol error.
    #[error("WebSocket error: {0}")]
    WebSocketError(String),

    // =========================================================================
    // Remote Response Errors
    // =========================================================================
    /// The requested project does not exist remotely.
    #[error("Project not found: {0}")]
    NotFound(String),

    /// The remote answered with an unexpected status.
    #[error("Remote answered {path} with status {status}")]
    RemoteStatus { status: u16, path: String },

    // =========================================================================
    // Protocol Errors
    // =========================================================================
    /// Malformed data from the remote.
    #[error("Protocol error: {0}")]
    Protocol(#[from] CoreError),

    /// Message we could not interpret.
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    /// Failed to serialize.
    #[error("Serialization failed: {0}")]
    SerializationFailed(String),

    /// Failed to deserialize.
    #[error("Deserialization failed: {0}")]
    DeserializationFailed(String),

    // =========================================================================
    // Filesystem / Process Errors
    // =========================================================================
    /// An I/O error, with annotated path for context.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// An external command exited unsuccessfully.
    #[error("Command `{command}` failed: {reason}")]
    CommandFailed { command: String, reason: String },

    // =========================================================================
    // Internal Errors
    // =========================================================================
    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),

    /// The session is shutting down.
    #[error("Session is shutting down")]
    ShuttingDown,
}

/// Convenience constructor for [`SyncError::Io`].
pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> SyncError {
    SyncError::Io {
        path: path.into(),
        source,
    }
}

// =============================================================================
// Apply / Flush Errors
// =============================================================================

/// The local dev server did not pick up applied changes.
#[derive(Debug, Clone, Error)]
#[error("Flush request to {target} failed: {reason}")]
pub struct FlushError {
    pub target: String,
    pub reason: String,
}

/// Failure outcomes of applying a changelog.
#[derive(Debug, Error)]
pub enum ApplyError {
    /// An entry could not be written; entries before it stay applied.
    #[error("Failed to apply changelog entry {index} ({id}): {source}")]
    Entry {
        index: usize,
        id: String,
        #[source]
        source: SyncError,
    },

    /// Every entry was applied but the flush failed.
    #[error("Changelog applied but the dev server could not be flushed: {0}")]
    CouldNotFlush(#[from] FlushError),
}

// =============================================================================
// Credential Errors
// =============================================================================

/// Failures reading from the credential store.
#[derive(Debug, Error)]
pub enum CredentialError {
    /// No keychain exists yet.
    #[error("No keychain found at {0}")]
    Missing(PathBuf),

    /// The keychain exists but holds nothing usable.
    #[error("Unrecognized credentials: {0}")]
    Unrecognized(String),

    /// The keychain could not be read.
    #[error(transparent)]
    Sync(#[from] SyncError),
}

// =============================================================================
// Error Conversions
// =============================================================================

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::SerializationFailed(err.to_string())
    }
}

impl From<url::ParseError> for SyncError {
    fn from(err: url::ParseError) -> Self {
        SyncError::InvalidUrl(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for SyncError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as WsError;
        match err {
            WsError::ConnectionClosed => SyncError::Disconnected,
            WsError::AlreadyClosed => SyncError::Disconnected,
            WsError::Protocol(p) => SyncError::WebSocketError(p.to_string()),
            WsError::Io(io) => SyncError::WebSocketError(io.to_string()),
            WsError::Tls(tls) => SyncError::TlsError(tls.to_string()),
            other => SyncError::WebSocketError(other.to_string()),
        }
    }
}

impl From<toml::de::Error> for SyncError {
    fn from(err: toml::de::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

// =============================================================================
// Error Categorization
// =============================================================================

impl SyncError {
    /// Returns true if this error is a transport drop the connector recovers
    /// from on its own.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::RequestFailed { .. }
                | SyncError::Disconnected
                | SyncError::Timeout(_)
                | SyncError::WebSocketError(_)
        )
    }

    /// Returns true if no amount of retrying will help.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SyncError::Forbidden | SyncError::NotFound(_))
    }

    /// Returns true if this error indicates a configuration problem.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            SyncError::InvalidConfig(_)
                | SyncError::InvalidUrl(_)
                | SyncError::ConfigLoadFailed(_)
        )
    }

    /// Returns true if the remote sent something malformed.
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            SyncError::Protocol(_)
                | SyncError::InvalidMessage(_)
                | SyncError::SerializationFailed(_)
                | SyncError::DeserializationFailed(_)
        )
    }
}
