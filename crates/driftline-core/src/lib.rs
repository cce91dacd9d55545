//! # driftline-core: Pure Domain Model for Driftline
//!
//! Everything the sync engine needs to reason about, with zero I/O.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Driftline Architecture                           │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                    apps/cli (driftline)                         │   │
//! │  │    tracing setup ──► orchestrator ──► event stream printer      │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │                    driftline-sync                               │   │
//! │  │    connector, fetcher, applier, listener, task graph            │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │               ★ driftline-core (THIS CRATE) ★                   │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────┐  ┌───────────┐  ┌───────────┐  ┌───────────┐  │   │
//! │  │   │   types   │  │ changelog │  │  hashing  │  │   event   │  │   │
//! │  │   │   Link    │  │   Entry   │  │ canonical │  │  Session  │  │   │
//! │  │   │ Credential│  │  parser   │  │   JSON    │  │   Event   │  │   │
//! │  │   └───────────┘  └───────────┘  └───────────┘  └───────────┘  │   │
//! │  │                                                                 │   │
//! │  │   NO I/O • NO NETWORK • NO FILESYSTEM • PURE FUNCTIONS          │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`types`] - Project links, credentials, signatures
//! - [`changelog`] - Tagged-union changelog entries and their wire parser
//! - [`hashing`] - Canonical JSON content hashing
//! - [`event`] - Session event stream records
//! - [`error`] - Domain error types

// =============================================================================
// Module Declarations
// =============================================================================

pub mod changelog;
pub mod error;
pub mod event;
pub mod hashing;
pub mod types;

// =============================================================================
// Re-exports for Convenience
// =============================================================================

pub use changelog::{Changelog, ChangelogEntry};
pub use error::{CoreError, CoreResult, ValidationError};
pub use event::{EventKind, SessionEvent};
pub use hashing::{canonical_json, content_hash, raw_content_hash};
pub use types::*;
