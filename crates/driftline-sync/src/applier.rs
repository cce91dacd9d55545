//! # Change Applier
//!
//! Applies an ordered changelog to the local tree, then flushes the dev
//! server.
//!
//! ```text
//!   for entry in changelog (received order):
//!       Set   { id, definition } ──► write  <entity path>  (tmp + rename)
//!       Unset { id }             ──► remove <entity path>  (absent is fine)
//!   flush ──► Ok(report) | CouldNotFlush (entries stay applied)
//! ```
//!
//! The first failing entry aborts the batch. Nothing is rolled back.
//! Applying is synchronous; callers on the runtime use `spawn_blocking`.

use std::path::Path;
use std::sync::Arc;

use driftline_core::{Changelog, ChangelogEntry};
use serde_json::Value;
use tracing::{debug, info};

use crate::error::{io_err, ApplyError, SyncResult};
use crate::flush::Flusher;
use crate::signature::ProjectLayout;

/// What an apply did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplyReport {
    pub written: usize,
    pub removed: usize,
    pub flushed: bool,
}

/// Applies changelogs to one project tree.
#[derive(Clone)]
pub struct ChangeApplier {
    layout: ProjectLayout,
    flusher: Arc<dyn Flusher>,
}

impl std::fmt::Debug for ChangeApplier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeApplier")
            .field("layout", &self.layout)
            .finish_non_exhaustive()
    }
}

impl ChangeApplier {
    pub fn new(layout: ProjectLayout, flusher: Arc<dyn Flusher>) -> Self {
        ChangeApplier { layout, flusher }
    }

    pub fn layout(&self) -> &ProjectLayout {
        &self.layout
    }

    /// Applies `changelog` in order and flushes.
    ///
    /// An empty changelog means the tree is already current: nothing is
    /// written and no flush happens.
    pub fn apply(&self, changelog: &Changelog) -> Result<ApplyReport, ApplyError> {
        let mut report = ApplyReport::default();
        if changelog.is_empty() {
            debug!("Empty changelog, tree already current");
            return Ok(report);
        }

        for (index, entry) in changelog.iter().enumerate() {
            self.apply_entry(entry, &mut report)
                .map_err(|source| ApplyError::Entry {
                    index,
                    id: entry.id().to_string(),
                    source,
                })?;
        }

        self.flusher.reload()?;
        report.flushed = true;

        info!(
            written = report.written,
            removed = report.removed,
            "Changelog applied"
        );
        Ok(report)
    }

    fn apply_entry(&self, entry: &ChangelogEntry, report: &mut ApplyReport) -> SyncResult<()> {
        let path = self.layout.entity_path(entry.id())?;
        match entry {
            ChangelogEntry::Set { id, definition } => {
                debug!(id = %id, ?path, "set");
                write_definition(&path, definition)?;
                report.written += 1;
            }
            ChangelogEntry::Unset { id } => {
                debug!(id = %id, ?path, "unset");
                match std::fs::remove_file(&path) {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(io_err(&path, e)),
                }
                report.removed += 1;
            }
        }
        Ok(())
    }
}

/// Writes pretty JSON via a `.tmp` sibling and a rename.
fn write_definition(path: &Path, definition: &Value) -> SyncResult<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
    }

    let mut text = serde_json::to_string_pretty(definition)?;
    text.push('\n');

    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, text).map_err(|e| io_err(&tmp, e))?;
    std::fs::rename(&tmp, path).map_err(|e| io_err(path, e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FlushError;
    use crate::flush::NoFlush;
    use crate::signature::compute_signature;
    use driftline_core::{content_hash, LocalProjectLink, ProjectType};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingFlusher(AtomicUsize);

    impl Flusher for CountingFlusher {
        fn reload(&self) -> Result<(), FlushError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct FailingFlusher;

    impl Flusher for FailingFlusher {
        fn reload(&self) -> Result<(), FlushError> {
            Err(FlushError {
                target: "http://localhost:1492/flush".into(),
                reason: "connection refused".into(),
            })
        }
    }

    fn layout(root: &Path) -> ProjectLayout {
        ProjectLayout::new(
            root,
            &LocalProjectLink {
                remote_id: "owner/pack".into(),
                project_type: ProjectType::Pack,
                display_name: "Pack".into(),
            },
        )
    }

    fn set(id: &str, def: Value) -> ChangelogEntry {
        ChangelogEntry::Set {
            id: id.into(),
            definition: def,
        }
    }

    fn unset(id: &str) -> ChangelogEntry {
        ChangelogEntry::Unset { id: id.into() }
    }

    #[test]
    fn test_set_then_unset_leaves_absent() {
        let dir = tempfile::tempdir().unwrap();
        let applier = ChangeApplier::new(layout(dir.path()), Arc::new(NoFlush));

        let log = Changelog::new(vec![set("m", json!({ "v": 1 })), unset("m")]);
        applier.apply(&log).unwrap();
        assert!(!applier.layout().entity_path("m").unwrap().exists());
    }

    #[test]
    fn test_unset_then_set_leaves_payload() {
        let dir = tempfile::tempdir().unwrap();
        let applier = ChangeApplier::new(layout(dir.path()), Arc::new(NoFlush));

        let log = Changelog::new(vec![unset("m"), set("m", json!({ "v": 2 }))]);
        applier.apply(&log).unwrap();

        let text = std::fs::read_to_string(applier.layout().entity_path("m").unwrap()).unwrap();
        let stored: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(stored, json!({ "v": 2 }));
    }

    #[test]
    fn test_later_entry_supersedes_earlier() {
        let dir = tempfile::tempdir().unwrap();
        let applier = ChangeApplier::new(layout(dir.path()), Arc::new(NoFlush));

        let log = Changelog::new(vec![set("m", json!({ "v": 1 })), set("m", json!({ "v": 3 }))]);
        applier.apply(&log).unwrap();

        let sig = compute_signature(applier.layout()).unwrap();
        assert_eq!(sig.entity_hashes["m"], content_hash(&json!({ "v": 3 })));
    }

    #[test]
    fn test_apply_twice_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let applier = ChangeApplier::new(layout(dir.path()), Arc::new(NoFlush));
        let log = Changelog::new(vec![
            set("a", json!({ "x": [1, 2] })),
            set("owner/pack", json!({ "name": "pack" })),
            unset("b"),
        ]);

        applier.apply(&log).unwrap();
        let first = compute_signature(applier.layout()).unwrap();
        applier.apply(&log).unwrap();
        let second = compute_signature(applier.layout()).unwrap();

        assert_eq!(first, second);
        assert!(first.pack_hash.is_some());
    }

    #[test]
    fn test_empty_changelog_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let flusher = Arc::new(CountingFlusher(AtomicUsize::new(0)));
        let applier = ChangeApplier::new(layout(dir.path()), flusher.clone());

        let report = applier.apply(&Changelog::default()).unwrap();
        assert_eq!(report, ApplyReport::default());
        assert_eq!(flusher.0.load(Ordering::SeqCst), 0);
        assert!(std::fs::read_dir(dir.path()).unwrap().next().is_none());
    }

    #[test]
    fn test_flush_failure_keeps_changes() {
        let dir = tempfile::tempdir().unwrap();
        let applier = ChangeApplier::new(layout(dir.path()), Arc::new(FailingFlusher));

        let err = applier
            .apply(&Changelog::new(vec![set("m", json!({}))]))
            .unwrap_err();
        assert!(matches!(err, ApplyError::CouldNotFlush(_)));
        assert!(applier.layout().entity_path("m").unwrap().exists());
    }

    #[test]
    fn test_unsafe_entry_aborts_batch_after_earlier_entries() {
        let dir = tempfile::tempdir().unwrap();
        let flusher = Arc::new(CountingFlusher(AtomicUsize::new(0)));
        let applier = ChangeApplier::new(layout(dir.path()), flusher.clone());

        let log = Changelog::new(vec![
            set("first", json!({})),
            set("../escape", json!({})),
            set("third", json!({})),
        ]);
        let err = applier.apply(&log).unwrap_err();
        assert!(matches!(err, ApplyError::Entry { index: 1, .. }));
        assert!(applier.layout().entity_path("first").unwrap().exists());
        assert!(!applier.layout().entity_path("third").unwrap().exists());
        assert_eq!(flusher.0.load(Ordering::SeqCst), 0);
    }
}
