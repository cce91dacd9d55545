//! # Session Events
//!
//! The ordered, structured record of what a session did. Business logic
//! emits these; the presentation layer decides how (and whether) to show
//! them.
//!
//! ```text
//!   orchestrator ─┐
//!   connector    ─┼──► SessionEvent { timestamp, kind, detail } ──► CLI / tests
//!   listener     ─┘
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// What happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EventKind {
    /// A newer client version is published.
    UpdateAvailable,
    /// Credentials were read from the keychain.
    CredentialResolved,
    /// The project link was read.
    LinkResolved,
    /// App scaffold files are missing (warning only).
    MissingScaffold,
    /// Dependency installation finished.
    DependenciesInstalled,
    /// Opening the connection to the remote service.
    Connecting,
    /// Connected and authenticated.
    Connected,
    /// Initial sync request sent.
    Syncing,
    /// Initial changelog applied; now listening for pushes.
    InitialSyncSucceeded,
    /// A changelog was applied and flushed.
    SyncSucceeded,
    /// A changelog could not be applied (or parsed).
    SyncFailed,
    /// A changelog was applied but the dev server did not reload.
    FlushFailed,
    /// The transport dropped; reconnecting.
    Disconnected,
    /// The transport came back and subscriptions were restored.
    Reconnected,
    /// A reconnection attempt failed.
    ReconnectFailed,
    /// The session ended.
    SessionClosed,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EventKind::UpdateAvailable => "update-available",
            EventKind::CredentialResolved => "credential-resolved",
            EventKind::LinkResolved => "link-resolved",
            EventKind::MissingScaffold => "missing-scaffold",
            EventKind::DependenciesInstalled => "dependencies-installed",
            EventKind::Connecting => "connecting",
            EventKind::Connected => "connected",
            EventKind::Syncing => "syncing",
            EventKind::InitialSyncSucceeded => "initial-sync-succeeded",
            EventKind::SyncSucceeded => "sync-succeeded",
            EventKind::SyncFailed => "sync-failed",
            EventKind::FlushFailed => "flush-failed",
            EventKind::Disconnected => "disconnected",
            EventKind::Reconnected => "reconnected",
            EventKind::ReconnectFailed => "reconnect-failed",
            EventKind::SessionClosed => "session-closed",
        };
        f.write_str(name)
    }
}

/// One entry in the session event stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionEvent {
    pub timestamp: DateTime<Utc>,
    pub kind: EventKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl SessionEvent {
    /// Creates an event stamped with the current time.
    pub fn now(kind: EventKind, detail: Option<String>) -> Self {
        SessionEvent {
            timestamp: Utc::now(),
            kind,
            detail,
        }
    }

    /// True for kinds a user should notice (failures and warnings).
    pub fn is_problem(&self) -> bool {
        matches!(
            self.kind,
            EventKind::SyncFailed
                | EventKind::FlushFailed
                | EventKind::Disconnected
                | EventKind::ReconnectFailed
                | EventKind::MissingScaffold
        )
    }
}
