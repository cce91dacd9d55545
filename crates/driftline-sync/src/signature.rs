//! # Project Layout & Hash Signature
//!
//! Where each tracked entity lives on disk, and the [`PackSignature`]
//! computed from it at session start.
//!
//! ```text
//!  PACK                               APP
//!  ────                               ───
//!  <root>/pack.json    (metadata)     <root>/app.json          (metadata)
//!  <root>/machines/<id>.json          <root>/api/machines/<id>.json
//! ```
//!
//! A changelog entry whose id equals the project's remote id targets the
//! metadata file; every other id is a machine.

use std::path::{Path, PathBuf};

use driftline_core::{
    content_hash, raw_content_hash, validate_machine_identity, EntityHashes, LocalProjectLink,
    PackSignature, ProjectType,
};
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{io_err, SyncError, SyncResult};

// =============================================================================
// Project Layout
// =============================================================================

/// On-disk layout of a linked project.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectLayout {
    root: PathBuf,
    project_type: ProjectType,
    project_id: String,
}

impl ProjectLayout {
    pub fn new(root: impl Into<PathBuf>, link: &LocalProjectLink) -> Self {
        ProjectLayout {
            root: root.into(),
            project_type: link.project_type,
            project_id: link.remote_id.clone(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn project_type(&self) -> ProjectType {
        self.project_type
    }

    /// Path of the project metadata file.
    pub fn metadata_path(&self) -> PathBuf {
        match self.project_type {
            ProjectType::Pack => self.root.join("pack.json"),
            ProjectType::App => self.root.join("app.json"),
        }
    }

    /// Directory holding one file per machine.
    pub fn machines_dir(&self) -> PathBuf {
        match self.project_type {
            ProjectType::Pack => self.root.join("machines"),
            ProjectType::App => self.root.join("api").join("machines"),
        }
    }

    /// True if `id` names the project metadata rather than a machine.
    pub fn is_metadata(&self, id: &str) -> bool {
        id == self.project_id
    }

    /// Resolves an entity id to its file, rejecting unsafe identities.
    pub fn entity_path(&self, id: &str) -> SyncResult<PathBuf> {
        if self.is_metadata(id) {
            return Ok(self.metadata_path());
        }
        validate_machine_identity(id).map_err(|e| SyncError::Protocol(e.into()))?;
        Ok(self.machines_dir().join(format!("{id}.json")))
    }
}

// =============================================================================
// Signature
// =============================================================================

/// Computes the hash signature of the local tree.
///
/// Missing metadata or a missing machines directory simply contribute
/// nothing. Files that are not valid JSON are hashed raw, so the remote
/// sees them as different and sends a replacement.
pub fn compute_signature(layout: &ProjectLayout) -> SyncResult<PackSignature> {
    let pack_hash = match read_optional(&layout.metadata_path())? {
        Some(content) => Some(hash_file_content(&layout.metadata_path(), &content)),
        None => None,
    };

    let mut entity_hashes = EntityHashes::new();
    let dir = layout.machines_dir();
    let entries = match std::fs::read_dir(&dir) {
        Ok(entries) => Some(entries),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
        Err(e) => return Err(io_err(&dir, e)),
    };

    for entry in entries.into_iter().flatten() {
        let entry = entry.map_err(|e| io_err(&dir, e))?;
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") || !path.is_file() {
            continue;
        }
        let Some(id) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        if validate_machine_identity(id).is_err() {
            warn!(?path, "Skipping file with an unusable machine identity");
            continue;
        }

        let content = std::fs::read_to_string(&path).map_err(|e| io_err(&path, e))?;
        entity_hashes.insert(id.to_string(), hash_file_content(&path, &content));
    }

    debug!(
        root = ?layout.root(),
        machines = entity_hashes.len(),
        has_metadata = pack_hash.is_some(),
        "Computed local signature"
    );

    Ok(PackSignature {
        pack_hash,
        entity_hashes,
    })
}

fn read_optional(path: &Path) -> SyncResult<Option<String>> {
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(Some(content)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(io_err(path, e)),
    }
}

fn hash_file_content(path: &Path, content: &str) -> String {
    match serde_json::from_str::<Value>(content) {
        Ok(value) => content_hash(&value),
        Err(e) => {
            warn!(?path, error = %e, "Not valid JSON, hashing raw content");
            raw_content_hash(content)
        }
    }
}
