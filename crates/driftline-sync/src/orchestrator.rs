//! # Session Orchestrator
//!
//! Sequences everything needed before a dev session is live, as a task
//! graph, and routes each failure to a named outcome.
//!
//! ## Step Graph
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  check-for-updates ─────────────────────────────────────┐ (never fails) │
//! │                                                         │               │
//! │  ping-remote ───────────────────────────────────────────┼──────┐        │
//! │                                                         │      │        │
//! │  resolve-credential ──► resolve-link ──┬─► check-scaffold      │        │
//! │          │                             │                       │        │
//! │          │                             └─► ensure-manifest     │        │
//! │          │                                       │             │        │
//! │          │                             ensure-bootstrap-script │        │
//! │          │                                       │             │        │
//! │          │                             ensure-dependencies     │        │
//! │          │                                       │             ▼        │
//! │          └───────────────────────────────────► start-session ◄─┘        │
//! │                                                                         │
//! │  OUTCOMES                                                              │
//! │  ────────                                                              │
//! │  Ok(DevSession)        listening for pushes                            │
//! │  NotLinked             no link file; candidates listed for linking     │
//! │  NoApps/NoMachinepacks no link file and nothing to link to             │
//! │  Forbidden             secret rejected                                 │
//! │  RequestFailed         remote unreachable                              │
//! │  UnrecognizedCredentials  keychain missing or unusable                 │
//! │  WrongProjectType      link points at the other kind of project        │
//! │  NotFound / Protocol / Error                                           │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use driftline_core::{Credential, EventKind, LocalProjectLink, ProjectType};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::applier::ChangeApplier;
use crate::bootstrap;
use crate::config::DevConfig;
use crate::connector::{establish, ConnectionHandle, ConnectionState, ConnectorConfig};
use crate::error::{CredentialError, SyncError};
use crate::events::EventSink;
use crate::fetcher::subscribe_project;
use crate::flush::{Flusher, HttpFlusher, NoFlush};
use crate::graph::{GraphFailure, StepInputs, TaskGraph};
use crate::listener::{ChangeListener, ListenerHandle, SyncProgress};
use crate::remote::{is_newer, latest_version, RemoteApi, RemoteProject};
use crate::signature::{compute_signature, ProjectLayout};
use crate::stores::{CredentialStore, KeychainFile, LinkFile};

/// Timeout for plain HTTP side calls (ping, listing, update check).
const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

// =============================================================================
// Named Outcomes
// =============================================================================

/// Every way starting a session can fail.
#[derive(Debug, Error)]
pub enum SessionFailure {
    #[error("This directory is not linked to a remote {project_type} ({} available)", candidates.len())]
    NotLinked {
        project_type: ProjectType,
        candidates: Vec<RemoteProject>,
    },

    #[error("{username} has no apps yet")]
    NoApps { username: String },

    #[error("{username} has no machinepacks yet")]
    NoMachinepacks { username: String },

    #[error("The remote service rejected the credentials; log in again")]
    Forbidden,

    #[error("Could not communicate with {url}: {reason}")]
    RequestFailed { url: String, reason: String },

    #[error("Keychain credentials are missing or unrecognized: {0}")]
    UnrecognizedCredentials(String),

    #[error("This directory is linked to a {found}, not a {expected}")]
    WrongProjectType {
        expected: ProjectType,
        found: ProjectType,
    },

    #[error("Project {0} was not found on the remote service")]
    NotFound(String),

    #[error("Unexpected response from the remote service: {0}")]
    Protocol(String),

    #[error(transparent)]
    Error(SyncError),
}

impl From<SyncError> for SessionFailure {
    fn from(err: SyncError) -> Self {
        match err {
            SyncError::Forbidden => SessionFailure::Forbidden,
            SyncError::RequestFailed { url, reason } => SessionFailure::RequestFailed { url, reason },
            SyncError::NotFound(id) => SessionFailure::NotFound(id),
            other if other.is_protocol_error() => SessionFailure::Protocol(other.to_string()),
            other => SessionFailure::Error(other),
        }
    }
}

impl From<CredentialError> for SessionFailure {
    fn from(err: CredentialError) -> Self {
        match err {
            CredentialError::Sync(e) => SessionFailure::Error(e),
            other => SessionFailure::UnrecognizedCredentials(other.to_string()),
        }
    }
}

// =============================================================================
// Dev Session
// =============================================================================

/// A live, listening dev session.
#[derive(Debug, Clone)]
pub struct DevSession {
    id: Uuid,
    link: LocalProjectLink,
    connection: ConnectionHandle,
    listener: ListenerHandle,
    events: EventSink,
}

impl DevSession {
    /// Identifier used to correlate this session's log lines.
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn link(&self) -> &LocalProjectLink {
        &self.link
    }

    /// Listener progress (subscription flag, last applied sequence).
    pub fn progress(&self) -> SyncProgress {
        self.listener.progress()
    }

    pub fn listener(&self) -> &ListenerHandle {
        &self.listener
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    /// Waits until the session ends on its own (connection closed for good).
    pub async fn wait(&self) {
        tokio::select! {
            _ = self.connection.closed() => {}
            _ = self.listener.stopped() => {}
        }
    }

    /// Stops listening and closes the connection. An apply in flight
    /// finishes first.
    pub async fn shutdown(&self) {
        info!(session_id = %self.id, "Shutting down dev session");
        self.listener.shutdown();
        self.listener.stopped().await;
        self.connection.shutdown();
        self.connection.closed().await;
        self.events.emit(EventKind::SessionClosed);
    }
}

// =============================================================================
// Orchestrator
// =============================================================================

#[derive(Clone)]
enum StepOutput {
    Unit,
    Credential(Credential),
    Link(LocalProjectLink),
    Session(DevSession),
}

struct StepContext {
    session_id: Uuid,
    config: DevConfig,
    root: PathBuf,
    project_type: ProjectType,
    credentials: Arc<dyn CredentialStore>,
    flusher: Arc<dyn Flusher>,
    events: EventSink,
    current_version: String,
}

/// Builds and runs the session step graph.
pub struct SessionOrchestrator {
    ctx: StepContext,
}

impl SessionOrchestrator {
    /// Creates an orchestrator for the project at `project_root`.
    ///
    /// Credentials come from the configured keychain; the flusher targets the
    /// configured dev server (or does nothing when preview is disabled).
    pub fn new(
        config: DevConfig,
        project_root: impl Into<PathBuf>,
        project_type: ProjectType,
    ) -> Result<Self, SyncError> {
        let keychain = config.keychain_path().ok_or_else(|| {
            SyncError::InvalidConfig("no keychain path could be determined".into())
        })?;
        let flusher: Arc<dyn Flusher> = if config.preview.enabled {
            Arc::new(HttpFlusher::from_settings(&config.preview))
        } else {
            Arc::new(NoFlush)
        };

        Ok(SessionOrchestrator {
            ctx: StepContext {
                session_id: Uuid::new_v4(),
                config,
                root: project_root.into(),
                project_type,
                credentials: Arc::new(KeychainFile::new(keychain)),
                flusher,
                events: EventSink::detached(),
                current_version: env!("CARGO_PKG_VERSION").to_string(),
            },
        })
    }

    pub fn with_credentials(mut self, store: Arc<dyn CredentialStore>) -> Self {
        self.ctx.credentials = store;
        self
    }

    pub fn with_flusher(mut self, flusher: Arc<dyn Flusher>) -> Self {
        self.ctx.flusher = flusher;
        self
    }

    pub fn with_events(mut self, events: EventSink) -> Self {
        self.ctx.events = events;
        self
    }

    /// Runs every step. Returns the live session or the first failure.
    pub async fn run(self) -> Result<DevSession, SessionFailure> {
        let ctx = Arc::new(self.ctx);
        info!(
            session_id = %ctx.session_id,
            root = ?ctx.root,
            project_type = %ctx.project_type,
            "Starting dev session"
        );

        let graph = build_graph(ctx);
        let mut outputs = match graph.run().await {
            Ok(outputs) => outputs,
            Err(GraphFailure::Step { name, error }) => {
                warn!(step = name, error = %error, "Dev session could not start");
                return Err(error);
            }
            Err(GraphFailure::Invalid(e)) => {
                return Err(SessionFailure::Error(SyncError::Internal(e.to_string())))
            }
            Err(GraphFailure::Panicked(reason)) => {
                return Err(SessionFailure::Error(SyncError::Internal(reason)))
            }
        };

        match outputs.remove("start-session") {
            Some(StepOutput::Session(session)) => Ok(session),
            _ => Err(SessionFailure::Error(SyncError::Internal(
                "start-session produced no session".into(),
            ))),
        }
    }
}

fn build_graph(ctx: Arc<StepContext>) -> TaskGraph<StepOutput, SessionFailure> {
    let (c1, c2, c3, c4) = (ctx.clone(), ctx.clone(), ctx.clone(), ctx.clone());
    let (c5, c6, c7, c8) = (ctx.clone(), ctx.clone(), ctx.clone(), ctx.clone());

    TaskGraph::new()
        .step("check-for-updates", &[], move |_| check_for_updates(c1))
        .step("ping-remote", &[], move |_| ping_remote(c2))
        .step("resolve-credential", &[], move |_| resolve_credential(c3))
        .step("resolve-link", &["resolve-credential"], move |inputs| {
            resolve_link(c4, inputs)
        })
        .step("check-scaffold", &["resolve-link"], move |_| check_scaffold(c5))
        .step("ensure-manifest", &["resolve-link"], move |inputs| {
            ensure_manifest(c6, inputs)
        })
        .step("ensure-bootstrap-script", &["ensure-manifest"], move |_| {
            ensure_bootstrap_script(c7)
        })
        .step("ensure-dependencies", &["ensure-bootstrap-script"], move |_| {
            ensure_dependencies(c8)
        })
        .step(
            "start-session",
            &[
                "resolve-credential",
                "resolve-link",
                "ensure-dependencies",
                "ping-remote",
            ],
            move |inputs| start_session(ctx, inputs),
        )
}

// =============================================================================
// Steps
// =============================================================================

type StepResult = Result<StepOutput, SessionFailure>;

async fn blocking<T, F>(f: F) -> Result<T, SessionFailure>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| SessionFailure::Error(SyncError::Internal(e.to_string())))
}

fn credential_input(inputs: &StepInputs<StepOutput>) -> Result<Credential, SessionFailure> {
    match inputs.get("resolve-credential") {
        Some(StepOutput::Credential(c)) => Ok(c.clone()),
        _ => Err(SessionFailure::Error(SyncError::Internal(
            "missing credential input".into(),
        ))),
    }
}

fn link_input(inputs: &StepInputs<StepOutput>) -> Result<LocalProjectLink, SessionFailure> {
    match inputs.get("resolve-link") {
        Some(StepOutput::Link(l)) => Ok(l.clone()),
        _ => Err(SessionFailure::Error(SyncError::Internal(
            "missing link input".into(),
        ))),
    }
}

/// Never fails: any problem just means no notice.
async fn check_for_updates(ctx: Arc<StepContext>) -> StepResult {
    if !ctx.config.updates.enabled {
        return Ok(StepOutput::Unit);
    }

    let url = ctx.config.updates.registry_url.clone();
    match blocking(move || latest_version(&url, Duration::from_secs(3))).await {
        Ok(Ok(latest)) if is_newer(&latest, &ctx.current_version) => {
            ctx.events.emit_with(
                EventKind::UpdateAvailable,
                format!("driftline {latest} is available (running {})", ctx.current_version),
            );
        }
        Ok(Ok(_)) => debug!("Client is up to date"),
        Ok(Err(e)) => debug!(error = %e, "Update check failed"),
        Err(e) => debug!(error = %e, "Update check failed"),
    }
    Ok(StepOutput::Unit)
}

async fn ping_remote(ctx: Arc<StepContext>) -> StepResult {
    let api = RemoteApi::new(ctx.config.api_base(), HTTP_TIMEOUT);
    blocking(move || api.ping()).await??;
    Ok(StepOutput::Unit)
}

async fn resolve_credential(ctx: Arc<StepContext>) -> StepResult {
    let store = ctx.credentials.clone();
    let credential = blocking(move || store.read()).await??;
    ctx.events
        .emit_with(EventKind::CredentialResolved, credential.identity_label.clone());
    Ok(StepOutput::Credential(credential))
}

async fn resolve_link(ctx: Arc<StepContext>, inputs: StepInputs<StepOutput>) -> StepResult {
    let credential = credential_input(&inputs)?;
    let file = LinkFile::in_root(&ctx.root);

    let link = match blocking(move || file.read()).await?? {
        Some(link) => link,
        None => return Err(not_linked(&ctx, credential).await),
    };

    if link.project_type != ctx.project_type {
        return Err(SessionFailure::WrongProjectType {
            expected: ctx.project_type,
            found: link.project_type,
        });
    }

    ctx.events
        .emit_with(EventKind::LinkResolved, format!("{} ({})", link.display_name, link.remote_id));
    Ok(StepOutput::Link(link))
}

/// Decides which "not linked" outcome applies by listing remote projects.
async fn not_linked(ctx: &StepContext, credential: Credential) -> SessionFailure {
    let api = RemoteApi::new(ctx.config.api_base(), HTTP_TIMEOUT);
    let project_type = ctx.project_type;
    let username = credential.identity_label.clone();

    let listed = match blocking(move || api.list_projects(project_type, &credential)).await {
        Ok(listed) => listed,
        Err(failure) => return failure,
    };

    match listed {
        Err(e) => e.into(),
        Ok(candidates) if candidates.is_empty() => match project_type {
            ProjectType::App => SessionFailure::NoApps { username },
            ProjectType::Pack => SessionFailure::NoMachinepacks { username },
        },
        Ok(candidates) => SessionFailure::NotLinked {
            project_type,
            candidates,
        },
    }
}

async fn check_scaffold(ctx: Arc<StepContext>) -> StepResult {
    if ctx.project_type == ProjectType::App && !bootstrap::has_app_scaffold(&ctx.root) {
        ctx.events.emit_with(
            EventKind::MissingScaffold,
            format!("{} is missing", bootstrap::APP_SCAFFOLD_FILE),
        );
    }
    Ok(StepOutput::Unit)
}

async fn ensure_manifest(ctx: Arc<StepContext>, inputs: StepInputs<StepOutput>) -> StepResult {
    let link = link_input(&inputs)?;
    let root = ctx.root.clone();
    blocking(move || bootstrap::ensure_manifest(&root, &link)).await??;
    Ok(StepOutput::Unit)
}

async fn ensure_bootstrap_script(ctx: Arc<StepContext>) -> StepResult {
    let root = ctx.root.clone();
    let script = ctx.config.dependencies.postinstall_script.clone();
    blocking(move || bootstrap::ensure_postinstall(&root, &script)).await??;
    Ok(StepOutput::Unit)
}

async fn ensure_dependencies(ctx: Arc<StepContext>) -> StepResult {
    bootstrap::install_dependencies(&ctx.root, &ctx.config.dependencies.install_commands).await?;
    ctx.events.emit(EventKind::DependenciesInstalled);
    Ok(StepOutput::Unit)
}

async fn start_session(ctx: Arc<StepContext>, inputs: StepInputs<StepOutput>) -> StepResult {
    let credential = credential_input(&inputs)?;
    let link = link_input(&inputs)?;

    let layout = ProjectLayout::new(&ctx.root, &link);
    let signature = {
        let layout = layout.clone();
        blocking(move || compute_signature(&layout)).await??
    };

    let connector_config = ConnectorConfig::from_config(&ctx.config)?;
    let connection = establish(&credential, connector_config, ctx.events.clone()).await?;

    ctx.events.emit_with(
        EventKind::Syncing,
        link.project_type.sync_path(&link.remote_id),
    );
    let subscription = match subscribe_project(
        &connection,
        &link.remote_id,
        link.project_type,
        &signature,
        &credential,
    )
    .await
    {
        Ok(subscription) => subscription,
        Err(e) => {
            connection.shutdown();
            return Err(e.into());
        }
    };

    let applier = ChangeApplier::new(layout, ctx.flusher.clone());
    let listener = ChangeListener::spawn(
        applier,
        subscription.initial,
        subscription.pushes,
        ctx.events.clone(),
    );

    info!(session_id = %ctx.session_id, project = %link.remote_id, "Dev session is live");
    Ok(StepOutput::Session(DevSession {
        id: ctx.session_id,
        link,
        connection,
        listener,
        events: ctx.events.clone(),
    }))
}
