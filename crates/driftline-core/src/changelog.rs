//! # Changelog
//!
//! Ordered entity-level upserts/deletes describing drift since the client's
//! last known state.
//!
//! ## Wire Shape vs. Domain Shape
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  WIRE (from remote)                     DOMAIN (this module)            │
//! │  ──────────────────                     ────────────────────            │
//! │  { "id": "send-email",         ──►      ChangelogEntry::Set {           │
//! │    "verb": "set",                           id: "send-email",           │
//! │    "definition": { ... } }                  definition: { ... } }       │
//! │                                                                         │
//! │  { "id": "old-machine",        ──►      ChangelogEntry::Unset {         │
//! │    "verb": "unset" }                        id: "old-machine" }         │
//! │                                                                         │
//! │  { "verb": "patch", ... }      ──►      CoreError (whole batch          │
//! │  { "verb": "set" }  (no id)             rejected, nothing applied)      │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Entries keep their received order. A later entry for the same target
//! supersedes an earlier one simply by being applied after it.

use serde::Deserialize;
use serde_json::Value;

use crate::error::{CoreError, CoreResult};

// =============================================================================
// Changelog Entry
// =============================================================================

/// One operation on one entity.
#[derive(Debug, Clone, PartialEq)]
pub enum ChangelogEntry {
    /// Create or replace the entity with `definition`.
    Set { id: String, definition: Value },

    /// Remove the entity.
    Unset { id: String },
}

impl ChangelogEntry {
    /// Target entity identity.
    pub fn id(&self) -> &str {
        match self {
            ChangelogEntry::Set { id, .. } => id,
            ChangelogEntry::Unset { id } => id,
        }
    }

    /// Wire verb, for logging.
    pub fn verb(&self) -> &'static str {
        match self {
            ChangelogEntry::Set { .. } => "set",
            ChangelogEntry::Unset { .. } => "unset",
        }
    }

    /// Serializes back to the wire shape.
    pub fn to_wire(&self) -> Value {
        match self {
            ChangelogEntry::Set { id, definition } => serde_json::json!({
                "id": id,
                "verb": "set",
                "definition": definition,
            }),
            ChangelogEntry::Unset { id } => serde_json::json!({
                "id": id,
                "verb": "unset",
            }),
        }
    }
}

/// Raw entry as received; every field optional so we can report precisely.
#[derive(Debug, Deserialize)]
struct RawEntry {
    #[serde(default)]
    id: Option<Value>,
    #[serde(default)]
    verb: Option<String>,
    #[serde(default)]
    definition: Option<Value>,
}

// =============================================================================
// Changelog
// =============================================================================

/// An ordered list of changelog entries.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Changelog {
    entries: Vec<ChangelogEntry>,
}

impl Changelog {
    /// Creates a changelog from already-typed entries.
    pub fn new(entries: Vec<ChangelogEntry>) -> Self {
        Changelog { entries }
    }

    /// Parses a changelog from a response body.
    ///
    /// The body must be a JSON array. Every entry must carry a non-empty
    /// identity and a `set`/`unset` verb; the first violation rejects the
    /// whole changelog.
    pub fn parse(body: &Value) -> CoreResult<Self> {
        let items = body.as_array().ok_or_else(|| CoreError::NotAChangelog {
            found: describe(body),
        })?;

        let mut entries = Vec::with_capacity(items.len());
        for (index, item) in items.iter().enumerate() {
            let raw: RawEntry =
                serde_json::from_value(item.clone()).map_err(|_| CoreError::NotAChangelog {
                    found: format!("entry {index}: {}", describe(item)),
                })?;

            let id = match raw.id {
                Some(Value::String(s)) if !s.trim().is_empty() => s,
                Some(Value::Number(n)) => n.to_string(),
                _ => return Err(CoreError::MissingIdentity { index }),
            };

            let entry = match raw.verb.as_deref() {
                Some("set") => match raw.definition {
                    Some(definition) if !definition.is_null() => {
                        ChangelogEntry::Set { id, definition }
                    }
                    _ => return Err(CoreError::MissingDefinition { index, id }),
                },
                Some("unset") => ChangelogEntry::Unset { id },
                other => {
                    return Err(CoreError::UnknownVerb {
                        index,
                        id,
                        verb: other.unwrap_or_default().to_string(),
                    })
                }
            };
            entries.push(entry);
        }

        Ok(Changelog { entries })
    }

    /// Parses the changelog out of a push event payload (`{changelog: [...]}`).
    pub fn from_push(payload: &Value) -> CoreResult<Self> {
        let body = payload
            .get("changelog")
            .ok_or(CoreError::MissingChangelog)?;
        Self::parse(body)
    }

    /// Serializes the whole changelog to its wire shape.
    pub fn to_wire(&self) -> Value {
        Value::Array(self.entries.iter().map(ChangelogEntry::to_wire).collect())
    }

    pub fn entries(&self) -> &[ChangelogEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, ChangelogEntry> {
        self.entries.iter()
    }
}

impl FromIterator<ChangelogEntry> for Changelog {
    fn from_iter<I: IntoIterator<Item = ChangelogEntry>>(iter: I) -> Self {
        Changelog {
            entries: iter.into_iter().collect(),
        }
    }
}

impl<'a> IntoIterator for &'a Changelog {
    type Item = &'a ChangelogEntry;
    type IntoIter = std::slice::Iter<'a, ChangelogEntry>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}

/// Short description of an unexpected JSON value for error messages.
fn describe(value: &Value) -> String {
    let text = value.to_string();
    if text.chars().count() > 120 {
        let short: String = text.chars().take(117).collect();
        format!("{short}...")
    } else {
        text
    }
}
