//! # driftline-sync: Live Sync Engine for Driftline
//!
//! Keeps a local project directory in lockstep with its remote counterpart
//! for the length of a dev session.
//!
//! ## Architecture Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Dev Session Architecture                         │
//! │                                                                         │
//! │  ┌──────────────────────────────────────────────────────────────────┐  │
//! │  │               SessionOrchestrator (task graph)                   │  │
//! │  │                                                                  │  │
//! │  │  credential ─► link ─► manifest ─► postinstall ─► dependencies   │  │
//! │  │  ping, update check ──────────────────────────────► start        │  │
//! │  └────────────────────────────┬─────────────────────────────────────┘  │
//! │                               │                                         │
//! │         ┌─────────────────────┼─────────────────────┐                  │
//! │         ▼                     ▼                     ▼                   │
//! │  ┌────────────────┐  ┌────────────────┐  ┌────────────────────────┐    │
//! │  │   Connector    │  │    Fetcher     │  │    ChangeListener      │    │
//! │  │                │  │                │  │                        │    │
//! │  │ Authenticated  │  │ Sends local    │  │ Applies initial, then  │    │
//! │  │ WebSocket with │  │ signature, gets│  │ pushed changelogs in   │    │
//! │  │ backoff and    │  │ changelog,     │  │ order, one at a time   │    │
//! │  │ resubscribe    │  │ subscribes     │  │                        │    │
//! │  └────────────────┘  └────────────────┘  └───────────┬────────────┘    │
//! │                                                      ▼                  │
//! │                                          ┌────────────────────────┐    │
//! │                                          │    ChangeApplier       │    │
//! │                                          │ write/remove files,    │    │
//! │                                          │ then flush dev server  │    │
//! │                                          └────────────────────────┘    │
//! │                                                                         │
//! │  SESSION EVENTS (to the caller via EventSink):                         │
//! │  • connecting / connected / disconnected / reconnected                 │
//! │  • syncing / initial-sync-succeeded / sync-succeeded / sync-failed     │
//! │  • flush-failed / update-available / missing-scaffold                  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//!
//! ### Session
//! - [`orchestrator`] - Step graph and named session outcomes
//! - [`graph`] - Dependency-ordered concurrent step runner
//! - [`bootstrap`] - Manifest, postinstall hook, dependency install
//! - [`stores`] - Keychain and link file
//! - [`remote`] - Plain HTTP calls (ping, listing, update check)
//!
//! ### Sync
//! - [`connector`] - Authenticated socket with reconnection
//! - [`protocol`] - Socket wire frames
//! - [`fetcher`] - Initial changelog request and subscription
//! - [`signature`] - Local project layout and content hashes
//! - [`applier`] - Applies a changelog to disk
//! - [`flush`] - Dev server reload
//! - [`listener`] - Serial application of pushed changelogs
//!
//! ### Shared
//! - [`config`] - Layered configuration
//! - [`events`] - Session event sink
//! - [`error`] - Sync error types
//!
//! ## Usage
//!
//! ```rust,ignore
//! use driftline_sync::{DevConfig, EventSink, SessionOrchestrator};
//! use driftline_core::ProjectType;
//!
//! let config = DevConfig::load(None)?;
//! let (events, mut rx) = EventSink::channel();
//!
//! let session = SessionOrchestrator::new(config, ".", ProjectType::Pack)?
//!     .with_events(events)
//!     .run()
//!     .await?;
//!
//! session.wait().await;
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod applier;
pub mod bootstrap;
pub mod config;
pub mod connector;
pub mod error;
pub mod events;
pub mod fetcher;
pub mod flush;
pub mod graph;
pub mod listener;
pub mod orchestrator;
pub mod protocol;
pub mod remote;
pub mod signature;
pub mod stores;

#[cfg(test)]
pub(crate) mod testkit;

// =============================================================================
// Re-exports
// =============================================================================

pub use applier::{ApplyReport, ChangeApplier};
pub use config::DevConfig;
pub use connector::{establish, ConnectionHandle, ConnectionState, ConnectorConfig};
pub use error::{ApplyError, CredentialError, FlushError, SyncError, SyncResult};
pub use events::EventSink;
pub use fetcher::{subscribe_project, ProjectSubscription};
pub use flush::{Flusher, HttpFlusher, NoFlush};
pub use listener::{ChangeListener, ListenerHandle, SyncProgress};
pub use orchestrator::{DevSession, SessionFailure, SessionOrchestrator};
pub use remote::{RemoteApi, RemoteProject};
pub use signature::{compute_signature, ProjectLayout};
pub use stores::{CredentialStore, KeychainFile, LinkFile, StaticCredential};
