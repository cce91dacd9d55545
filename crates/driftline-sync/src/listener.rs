//! # Live Subscription Listener
//!
//! Applies the initial changelog, then every pushed changelog, one at a
//! time.
//!
//! ## Apply Queue
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  connector ──push──► [ unbounded queue ] ──► listener task ──► applier  │
//! │                        ▲                        │                       │
//! │  push arriving         │                        │ awaits each apply     │
//! │  mid-apply waits here ─┘                        │ before taking the     │
//! │  (never dropped, never concurrent)              ▼ next push             │
//! │                                          event stream:                  │
//! │                                          syncSucceeded / syncFailed /   │
//! │                                          flushFailed                    │
//! │                                                                         │
//! │  SEQUENCE CHECK:                                                       │
//! │  if push.seq <= last_applied_seq: drop (already seen)                  │
//! │  else: apply, last_applied_seq = push.seq                              │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Nothing is acknowledged to the remote. Failures only reach the local
//! event stream.

use driftline_core::{Changelog, EventKind};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info};

use crate::applier::{ApplyReport, ChangeApplier};
use crate::error::ApplyError;
use crate::events::EventSink;
use crate::protocol::PushFrame;

// =============================================================================
// Progress
// =============================================================================

/// Transient per-run listener state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncProgress {
    /// True while the listener is attached to the push stream.
    pub is_subscribed: bool,

    /// Highest push sequence number consumed so far.
    pub last_applied_seq: Option<u64>,

    /// Number of changelogs taken off the queue (initial included).
    pub changelogs_processed: u64,
}

impl SyncProgress {
    /// True if a push with `seq` was already consumed.
    fn has_seen(&self, seq: u64) -> bool {
        self.last_applied_seq.is_some_and(|last| seq <= last)
    }
}

// =============================================================================
// Listener Handle
// =============================================================================

/// Handle for observing and stopping the listener.
#[derive(Debug, Clone)]
pub struct ListenerHandle {
    shutdown_tx: mpsc::Sender<()>,
    progress: watch::Receiver<SyncProgress>,
}

impl ListenerHandle {
    /// Current progress snapshot.
    pub fn progress(&self) -> SyncProgress {
        self.progress.borrow().clone()
    }

    /// A receiver that observes every progress update.
    pub fn watch(&self) -> watch::Receiver<SyncProgress> {
        self.progress.clone()
    }

    /// Asks the listener to stop after the apply in flight, if any.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.try_send(());
    }

    /// Waits until the listener has detached.
    pub async fn stopped(&self) {
        let mut progress = self.progress.clone();
        let _ = progress.wait_for(|p| !p.is_subscribed).await;
    }
}

// =============================================================================
// Listener
// =============================================================================

/// Serializes all applies for one session.
pub struct ChangeListener {
    applier: ChangeApplier,
    events: EventSink,
    pushes: mpsc::UnboundedReceiver<PushFrame>,
    shutdown_rx: mpsc::Receiver<()>,
    progress: watch::Sender<SyncProgress>,
}

impl ChangeListener {
    /// Spawns the listener task. `initial` is applied before any push.
    pub fn spawn(
        applier: ChangeApplier,
        initial: Changelog,
        pushes: mpsc::UnboundedReceiver<PushFrame>,
        events: EventSink,
    ) -> ListenerHandle {
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let (progress_tx, progress_rx) = watch::channel(SyncProgress {
            is_subscribed: true,
            ..Default::default()
        });

        let listener = ChangeListener {
            applier,
            events,
            pushes,
            shutdown_rx,
            progress: progress_tx,
        };
        tokio::spawn(listener.run(initial));

        ListenerHandle {
            shutdown_tx,
            progress: progress_rx,
        }
    }

    /// Runs the listener loop.
    async fn run(mut self, initial: Changelog) {
        info!(entries = initial.len(), "Applying initial changelog");
        match self.apply(initial).await {
            Ok(report) => self.events.emit_with(
                EventKind::InitialSyncSucceeded,
                describe(&report),
            ),
            Err(e) => self.report_failure(e),
        }
        self.progress.send_modify(|p| p.changelogs_processed += 1);

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown_rx.recv() => {
                    info!("Listener received shutdown signal");
                    break;
                }

                push = self.pushes.recv() => match push {
                    Some(push) => self.process_push(push).await,
                    None => {
                        debug!("Push stream closed");
                        break;
                    }
                },
            }
        }

        self.progress.send_modify(|p| p.is_subscribed = false);
        info!("Listener stopped");
    }

    async fn process_push(&mut self, push: PushFrame) {
        if let Some(seq) = push.seq {
            if self.progress.borrow().has_seen(seq) {
                debug!(seq, "Dropping already-applied push");
                return;
            }
        }

        match Changelog::from_push(&push.data) {
            Ok(changelog) => {
                debug!(seq = ?push.seq, entries = changelog.len(), "Applying pushed changelog");
                match self.apply(changelog).await {
                    Ok(report) => self.events.emit_with(EventKind::SyncSucceeded, describe(&report)),
                    Err(e) => self.report_failure(e),
                }
            }
            Err(e) => {
                error!(seq = ?push.seq, error = %e, "Malformed push");
                self.events
                    .emit_with(EventKind::SyncFailed, format!("malformed push: {e}"));
            }
        }

        self.progress.send_modify(|p| {
            p.changelogs_processed += 1;
            if let Some(seq) = push.seq {
                p.last_applied_seq = Some(p.last_applied_seq.map_or(seq, |last| last.max(seq)));
            }
        });
    }

    /// Runs one apply on the blocking pool and waits for it.
    async fn apply(&self, changelog: Changelog) -> Result<ApplyReport, ListenerFailure> {
        let applier = self.applier.clone();
        tokio::task::spawn_blocking(move || applier.apply(&changelog))
            .await
            .map_err(|e| ListenerFailure::Panicked(e.to_string()))?
            .map_err(ListenerFailure::Apply)
    }

    fn report_failure(&self, failure: ListenerFailure) {
        match failure {
            ListenerFailure::Apply(ApplyError::CouldNotFlush(e)) => {
                self.events.emit_with(EventKind::FlushFailed, e.to_string())
            }
            ListenerFailure::Apply(e) => self.events.emit_with(EventKind::SyncFailed, e.to_string()),
            ListenerFailure::Panicked(reason) => self
                .events
                .emit_with(EventKind::SyncFailed, format!("apply task failed: {reason}")),
        }
    }
}

enum ListenerFailure {
    Apply(ApplyError),
    Panicked(String),
}

fn describe(report: &ApplyReport) -> String {
    if report.written + report.removed == 0 {
        "already up to date".to_string()
    } else {
        format!("{} written, {} removed", report.written, report.removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FlushError;
    use crate::flush::{Flusher, NoFlush};
    use crate::signature::ProjectLayout;
    use driftline_core::{LocalProjectLink, ProjectType, SessionEvent};
    use serde_json::{json, Value};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    fn applier(root: &std::path::Path, flusher: Arc<dyn Flusher>) -> ChangeApplier {
        let layout = ProjectLayout::new(
            root,
            &LocalProjectLink {
                remote_id: "p".into(),
                project_type: ProjectType::Pack,
                display_name: "P".into(),
            },
        );
        ChangeApplier::new(layout, flusher)
    }

    fn push(seq: Option<u64>, changelog: Value) -> PushFrame {
        PushFrame {
            event: "pack:changed".into(),
            room: "p".into(),
            seq,
            data: json!({ "changelog": changelog }),
        }
    }

    async fn wait_processed(handle: &ListenerHandle, n: u64) {
        let mut rx = handle.watch();
        tokio::time::timeout(
            Duration::from_secs(5),
            rx.wait_for(|p| p.changelogs_processed >= n),
        )
        .await
        .expect("listener did not process in time")
        .unwrap();
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<SessionEvent>) -> Vec<EventKind> {
        let mut kinds = Vec::new();
        while let Ok(e) = rx.try_recv() {
            kinds.push(e.kind);
        }
        kinds
    }

    /// Records the order in which files were observed at flush time and
    /// sleeps to widen any interleaving window.
    struct SlowRecordingFlusher {
        root: std::path::PathBuf,
        seen: Mutex<Vec<Vec<String>>>,
    }

    impl Flusher for SlowRecordingFlusher {
        fn reload(&self) -> Result<(), FlushError> {
            std::thread::sleep(Duration::from_millis(100));
            let mut names: Vec<String> = std::fs::read_dir(self.root.join("machines"))
                .map(|rd| {
                    rd.filter_map(|e| e.ok())
                        .map(|e| e.file_name().to_string_lossy().into_owned())
                        .collect()
                })
                .unwrap_or_default();
            names.sort();
            self.seen.lock().unwrap().push(names);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_initial_then_pushes() {
        let dir = tempfile::tempdir().unwrap();
        let (events, mut rx) = EventSink::channel();
        let (tx, pushes) = mpsc::unbounded_channel();

        let initial = Changelog::parse(&json!([{ "id": "a", "verb": "set", "definition": {} }])).unwrap();
        let handle = ChangeListener::spawn(applier(dir.path(), Arc::new(NoFlush)), initial, pushes, events);

        tx.send(push(Some(1), json!([{ "id": "b", "verb": "set", "definition": {} }]))).unwrap();
        wait_processed(&handle, 2).await;

        assert!(dir.path().join("machines/a.json").exists());
        assert!(dir.path().join("machines/b.json").exists());
        assert_eq!(handle.progress().last_applied_seq, Some(1));
        assert_eq!(
            drain(&mut rx),
            vec![EventKind::InitialSyncSucceeded, EventKind::SyncSucceeded]
        );
    }

    #[tokio::test]
    async fn test_back_to_back_pushes_apply_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let flusher = Arc::new(SlowRecordingFlusher {
            root: dir.path().to_path_buf(),
            seen: Mutex::new(Vec::new()),
        });
        let (tx, pushes) = mpsc::unbounded_channel();
        let handle = ChangeListener::spawn(
            applier(dir.path(), flusher.clone()),
            Changelog::default(),
            pushes,
            EventSink::detached(),
        );

        tx.send(push(Some(1), json!([{ "id": "one", "verb": "set", "definition": {} }]))).unwrap();
        tx.send(push(Some(2), json!([
            { "id": "one", "verb": "unset" },
            { "id": "two", "verb": "set", "definition": {} }
        ]))).unwrap();
        wait_processed(&handle, 3).await;

        let seen = flusher.seen.lock().unwrap().clone();
        assert_eq!(
            seen,
            vec![vec!["one.json".to_string()], vec!["two.json".to_string()]]
        );
    }

    #[tokio::test]
    async fn test_already_seen_seq_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let (events, mut rx) = EventSink::channel();
        let (tx, pushes) = mpsc::unbounded_channel();
        let handle = ChangeListener::spawn(
            applier(dir.path(), Arc::new(NoFlush)),
            Changelog::default(),
            pushes,
            events,
        );

        tx.send(push(Some(5), json!([{ "id": "x", "verb": "set", "definition": { "v": 1 } }]))).unwrap();
        tx.send(push(Some(5), json!([{ "id": "x", "verb": "unset" }]))).unwrap();
        tx.send(push(Some(4), json!([{ "id": "x", "verb": "unset" }]))).unwrap();
        tx.send(push(None, json!([{ "id": "y", "verb": "set", "definition": {} }]))).unwrap();
        wait_processed(&handle, 3).await;

        assert!(dir.path().join("machines/x.json").exists());
        assert!(dir.path().join("machines/y.json").exists());
        assert_eq!(handle.progress().last_applied_seq, Some(5));
        let kinds = drain(&mut rx);
        assert_eq!(kinds.iter().filter(|k| **k == EventKind::SyncSucceeded).count(), 2);
    }

    #[tokio::test]
    async fn test_failures_are_reported_not_fatal() {
        struct Refuse;
        impl Flusher for Refuse {
            fn reload(&self) -> Result<(), FlushError> {
                Err(FlushError {
                    target: "dev server".into(),
                    reason: "refused".into(),
                })
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let (events, mut rx) = EventSink::channel();
        let (tx, pushes) = mpsc::unbounded_channel();
        let handle = ChangeListener::spawn(
            applier(dir.path(), Arc::new(Refuse)),
            Changelog::default(),
            pushes,
            events,
        );

        tx.send(push(Some(1), json!([{ "verb": "set" }]))).unwrap();
        tx.send(push(Some(2), json!([{ "id": "a", "verb": "set", "definition": {} }]))).unwrap();
        wait_processed(&handle, 3).await;

        assert_eq!(
            drain(&mut rx),
            vec![
                EventKind::InitialSyncSucceeded,
                EventKind::SyncFailed,
                EventKind::FlushFailed
            ]
        );
        assert!(handle.progress().is_subscribed);
    }

    #[tokio::test]
    async fn test_shutdown_detaches() {
        let dir = tempfile::tempdir().unwrap();
        let (_tx, pushes) = mpsc::unbounded_channel();
        let handle = ChangeListener::spawn(
            applier(dir.path(), Arc::new(NoFlush)),
            Changelog::default(),
            pushes,
            EventSink::detached(),
        );

        handle.shutdown();
        tokio::time::timeout(Duration::from_secs(5), handle.stopped())
            .await
            .unwrap();
        assert!(!handle.progress().is_subscribed);
    }

    async fn wait_applied(handle: &ListenerHandle, seq: u64) {
        let mut rx = handle.watch();
        tokio::time::timeout(
            Duration::from_secs(5),
            rx.wait_for(|p| p.last_applied_seq == Some(seq)),
        )
        .await
        .expect("listener did not reach seq in time")
        .unwrap();
    }

    #[tokio::test]
    async fn test_redelivered_push_after_reconnect_is_not_reapplied() {
        use crate::connector::establish;
        use crate::testkit::MockRemote;
        use driftline_core::Credential;

        let remote = MockRemote::start("s").await;
        let credential = Credential {
            secret: "s".into(),
            identity_label: "tester".into(),
        };
        let conn = establish(&credential, remote.connector_config(), EventSink::detached())
            .await
            .unwrap();
        let pushes = conn.subscribe("pack:changed", "p").await.unwrap();
        remote.wait_for_subscriptions(1).await;

        let dir = tempfile::tempdir().unwrap();
        let (events, mut rx) = EventSink::channel();
        let handle = ChangeListener::spawn(
            applier(dir.path(), Arc::new(NoFlush)),
            Changelog::default(),
            pushes,
            events,
        );

        remote.push(push(Some(1), json!([{ "id": "a", "verb": "set", "definition": {} }])));
        wait_applied(&handle, 1).await;

        remote.drop_connections();
        remote.wait_for_subscriptions(2).await;

        // The remote replays its last push to the new connection.
        remote.push(push(Some(1), json!([{ "id": "a", "verb": "unset" }])));
        remote.push(push(Some(2), json!([{ "id": "b", "verb": "set", "definition": {} }])));
        wait_applied(&handle, 2).await;

        assert!(dir.path().join("machines/a.json").exists());
        assert!(dir.path().join("machines/b.json").exists());
        let kinds = drain(&mut rx);
        assert_eq!(kinds.iter().filter(|k| **k == EventKind::SyncSucceeded).count(), 2);
    }
}
