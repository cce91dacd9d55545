//! # Error Types
//!
//! Domain-specific error types for driftline-core.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Error Types                                     │
//! │                                                                         │
//! │  driftline-core errors (this file)                                     │
//! │  ├── CoreError        - Malformed remote data (protocol errors)        │
//! │  └── ValidationError  - Identity / field validation failures           │
//! │                                                                         │
//! │  driftline-sync errors (separate crate)                                │
//! │  └── SyncError        - Transport, filesystem, config failures         │
//! │                                                                         │
//! │  Flow: ValidationError → CoreError → SyncError → SessionFailure        │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use thiserror::Error;

// =============================================================================
// Core Error
// =============================================================================

/// Errors raised while interpreting data that came from the remote service.
///
/// Every variant is a protocol violation: the remote sent something the
/// client cannot act on. These are surfaced, never swallowed.
#[derive(Debug, Error)]
pub enum CoreError {
    /// The changelog body was not a JSON array.
    #[error("Unexpected response from remote: expected a changelog array, got {found}")]
    NotAChangelog { found: String },

    /// A changelog entry carried no usable target identity.
    #[error("Changelog entry {index} has no target identity")]
    MissingIdentity { index: usize },

    /// A changelog entry used a verb other than `set` / `unset`.
    #[error("Changelog entry {index} ({id}) has unknown verb '{verb}'")]
    UnknownVerb {
        index: usize,
        id: String,
        verb: String,
    },

    /// A `set` entry arrived without a definition.
    #[error("Changelog entry {index} ({id}) is a set without a definition")]
    MissingDefinition { index: usize, id: String },

    /// A push event payload did not contain a changelog.
    #[error("Push event is missing its changelog")]
    MissingChangelog,

    /// Validation error (wraps ValidationError).
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),
}

// =============================================================================
// Validation Error
// =============================================================================

/// Field-level validation failures.
#[derive(Debug, Error)]
pub enum ValidationError {
    /// A required field is missing or empty.
    #[error("{field} is required")]
    Required { field: String },

    /// Invalid format (e.g., an identity that cannot be a file name).
    #[error("{field} has invalid format: {reason}")]
    InvalidFormat { field: String, reason: String },

    /// Value is not in allowed set.
    #[error("{field} must be one of: {allowed:?}")]
    NotAllowed { field: String, allowed: Vec<String> },
}

// =============================================================================
// Result Type Alias
// =============================================================================

/// Convenience type alias for Results with CoreError.
pub type CoreResult<T> = Result<T, CoreError>;
