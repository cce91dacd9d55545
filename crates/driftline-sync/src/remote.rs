//! Plain HTTP calls to the remote service and the package registry.
//!
//! These are blocking (`ureq`); async callers wrap them in `spawn_blocking`.

use std::io::Read;
use std::time::Duration;

use driftline_core::{Credential, ProjectType};
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::error::{SyncError, SyncResult};
use crate::fetcher::AUTH_HEADER;

/// A project the credential can access, as offered for linking.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteProject {
    pub id: String,
    pub identity: String,
    pub display_name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListedProject {
    id: Value,
    #[serde(default)]
    full_name: String,
    #[serde(default)]
    name: String,
}

/// Blocking client for the remote HTTP API.
#[derive(Debug, Clone)]
pub struct RemoteApi {
    base: String,
    agent: ureq::Agent,
}

impl RemoteApi {
    pub fn new(base: impl Into<String>, timeout: Duration) -> Self {
        RemoteApi {
            base: base.into().trim_end_matches('/').to_string(),
            agent: ureq::AgentBuilder::new().timeout(timeout).build(),
        }
    }

    /// Checks that the API host answers at all. Any HTTP status counts.
    pub fn ping(&self) -> SyncResult<()> {
        match self.agent.get(&self.base).set("User-Agent", "driftline").call() {
            Ok(_) | Err(ureq::Error::Status(_, _)) => Ok(()),
            Err(e) => Err(SyncError::RequestFailed {
                url: self.base.clone(),
                reason: e.to_string(),
            }),
        }
    }

    /// Lists the projects of `project_type` the credential can access.
    pub fn list_projects(
        &self,
        project_type: ProjectType,
        credential: &Credential,
    ) -> SyncResult<Vec<RemoteProject>> {
        let url = format!("{}{}", self.base, project_type.listing_path());
        debug!(url = %url, "Listing remote projects");

        let response = match self
            .agent
            .get(&url)
            .set(AUTH_HEADER, &credential.secret)
            .set("User-Agent", "driftline")
            .call()
        {
            Ok(response) => response,
            Err(ureq::Error::Status(401 | 403, _)) => return Err(SyncError::Forbidden),
            Err(ureq::Error::Status(status, _)) => {
                return Err(SyncError::RemoteStatus {
                    status,
                    path: project_type.listing_path().to_string(),
                })
            }
            Err(e) => {
                return Err(SyncError::RequestFailed {
                    url,
                    reason: e.to_string(),
                })
            }
        };

        let listed: Vec<ListedProject> = response
            .into_json()
            .map_err(|e| SyncError::DeserializationFailed(format!("project listing: {e}")))?;

        Ok(listed
            .into_iter()
            .map(|p| RemoteProject {
                id: match p.id {
                    Value::String(s) => s,
                    other => other.to_string(),
                },
                identity: p.full_name,
                display_name: p.name,
            })
            .collect())
    }
}

// =============================================================================
// Update Check
// =============================================================================

#[derive(Debug, Deserialize)]
struct RegistryCrate {
    #[serde(rename = "crate")]
    krate: RegistryVersion,
}

#[derive(Debug, Deserialize)]
struct RegistryVersion {
    max_version: String,
}

/// Fetches the latest published version from the registry.
pub fn latest_version(registry_url: &str, timeout: Duration) -> SyncResult<String> {
    let agent = ureq::AgentBuilder::new().timeout(timeout).build();
    let response = agent
        .get(registry_url)
        .set("User-Agent", "driftline-update-check")
        .call()
        .map_err(|e| SyncError::RequestFailed {
            url: registry_url.to_string(),
            reason: e.to_string(),
        })?;

    let mut body = String::new();
    response
        .into_reader()
        .read_to_string(&mut body)
        .map_err(|e| SyncError::DeserializationFailed(e.to_string()))?;
    let parsed: RegistryCrate = serde_json::from_str(&body)
        .map_err(|e| SyncError::DeserializationFailed(format!("registry response: {e}")))?;
    Ok(parsed.krate.max_version)
}

/// True if `latest` is a strictly higher `major.minor.patch` than `current`.
/// Pre-release suffixes are ignored.
pub fn is_newer(latest: &str, current: &str) -> bool {
    fn parts(v: &str) -> Vec<u64> {
        v.trim_start_matches('v')
            .split(['-', '+'])
            .next()
            .unwrap_or_default()
            .split('.')
            .map(|p| p.parse().unwrap_or(0))
            .collect()
    }
    parts(latest) > parts(current)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::MockRemote;

    fn credential(secret: &str) -> Credential {
        Credential {
            secret: secret.into(),
            identity_label: "tester".into(),
        }
    }

    #[test]
    fn test_version_comparison() {
        assert!(is_newer("0.2.0", "0.1.9"));
        assert!(is_newer("1.0.0", "0.9.9"));
        assert!(is_newer("v0.1.10", "0.1.9"));
        assert!(!is_newer("0.1.0", "0.1.0"));
        assert!(!is_newer("0.1.0-beta", "0.1.0"));
    }

    #[test]
    fn test_ping_unreachable() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let api = RemoteApi::new(format!("http://{addr}"), Duration::from_secs(2));
        assert!(matches!(api.ping(), Err(SyncError::RequestFailed { .. })));
    }

    #[tokio::test]
    async fn test_list_projects() {
        let remote = MockRemote::start("s").await;
        remote.set_listing(serde_json::json!([
            { "id": 432, "fullName": "my-cool-app", "name": "My Cool App" }
        ]));
        let api = RemoteApi::new(remote.api_url(), Duration::from_secs(5));

        let (ok, denied, pinged) = tokio::task::spawn_blocking(move || {
            (
                api.list_projects(ProjectType::App, &credential("s")),
                api.list_projects(ProjectType::App, &credential("wrong")),
                api.ping(),
            )
        })
        .await
        .unwrap();

        let projects = ok.unwrap();
        assert_eq!(projects.len(), 1);
        assert_eq!(projects[0].id, "432");
        assert_eq!(projects[0].identity, "my-cool-app");
        assert!(matches!(denied, Err(SyncError::Forbidden)));
        assert!(pinged.is_ok());
    }
}
