//! # Changelog Fetcher
//!
//! Subscription to the project's change event followed by a one-shot
//! initial sync.
//!
//! ```text
//!  client                                         remote
//!    │ Subscribe { pack:changed | app:changed, id } │
//!    │ ───────────────────────────────────────────► │
//!    │ GET /api/v1/{machinepacks|apps}/{id}/sync    │
//!    │   x-auth: <secret>                           │
//!    │   { packHash, machineHashes: [...] }         │
//!    │ ───────────────────────────────────────────► │
//!    │ ◄─────────────────────────────────────────── │
//!    │   200 [ {id, verb, definition}, ... ]        │  only differing entries
//!    │   401 → Forbidden   404 → NotFound           │
//! ```
//!
//! The subscription goes out before the sync request, so a change committed
//! between the remote answering and the client subscribing still arrives.
//! On failure the receiver is dropped and no push is delivered locally.

use std::collections::BTreeMap;

use driftline_core::{Changelog, Credential, PackSignature, ProjectType};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::connector::ConnectionHandle;
use crate::error::{SyncError, SyncResult};
use crate::protocol::{PushFrame, FORBIDDEN_CODE};

/// Header carrying the secret on every remote request.
pub const AUTH_HEADER: &str = "x-auth";

/// Result of a successful initial subscribe.
#[derive(Debug)]
pub struct ProjectSubscription {
    /// Entries that differ from the local signature. Empty means current.
    pub initial: Changelog,

    /// Future pushes for this project.
    pub pushes: mpsc::UnboundedReceiver<PushFrame>,
}

/// Subscribes to a project's change event, then fetches its initial
/// changelog.
pub async fn subscribe_project(
    connection: &ConnectionHandle,
    project_id: &str,
    project_type: ProjectType,
    signature: &PackSignature,
    credential: &Credential,
) -> SyncResult<ProjectSubscription> {
    let path = project_type.sync_path(project_id);
    let mut headers = BTreeMap::new();
    headers.insert(AUTH_HEADER.to_string(), credential.secret.clone());

    let pushes = connection
        .subscribe(project_type.change_event(), project_id)
        .await?;

    debug!(
        path = %path,
        machines = signature.entity_hashes.len(),
        "Requesting initial sync"
    );
    let response = connection
        .request("GET", &path, headers, signature.to_params())
        .await?;

    if !response.is_success() {
        return Err(match response.status {
            FORBIDDEN_CODE => SyncError::Forbidden,
            404 => SyncError::NotFound(project_id.to_string()),
            status => SyncError::RemoteStatus { status, path },
        });
    }

    let initial = Changelog::parse(&response.body)?;
    info!(
        project_id = %project_id,
        entries = initial.len(),
        "Initial changelog received"
    );

    Ok(ProjectSubscription { initial, pushes })
}
