//! # Domain Types
//!
//! Records read before a session starts, and the signature sent once per
//! session at subscribe time.
//!
//! ## Type Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Domain Types                                    │
//! │                                                                         │
//! │  ┌──────────────────┐   ┌─────────────────┐   ┌──────────────────────┐ │
//! │  │ LocalProjectLink │   │   Credential    │   │    PackSignature     │ │
//! │  │  ──────────────  │   │  ─────────────  │   │  ──────────────────  │ │
//! │  │  id (remote)     │   │  secret         │   │  pack_hash           │ │
//! │  │  type app|pack   │   │  identity_label │   │  machine_hashes[]    │ │
//! │  │  display_name    │   │  (read-only)    │   │  (ephemeral)         │ │
//! │  └──────────────────┘   └─────────────────┘   └──────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

// =============================================================================
// Project Type
// =============================================================================

/// The kind of remote project a directory is linked to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProjectType {
    /// A full application.
    App,

    /// A machinepack: a reusable collection of machines.
    #[serde(alias = "machinepack")]
    Pack,
}

impl ProjectType {
    /// Name of the push event the remote emits for this kind of project.
    pub fn change_event(&self) -> &'static str {
        match self {
            ProjectType::App => "app:changed",
            ProjectType::Pack => "pack:changed",
        }
    }

    /// Path of the initial-sync endpoint for a project of this kind.
    pub fn sync_path(&self, project_id: &str) -> String {
        match self {
            ProjectType::App => format!("/api/v1/apps/{project_id}/sync"),
            ProjectType::Pack => format!("/api/v1/machinepacks/{project_id}/sync"),
        }
    }

    /// Path of the listing endpoint for projects of this kind.
    pub fn listing_path(&self) -> &'static str {
        match self {
            ProjectType::App => "/cli/apps",
            ProjectType::Pack => "/cli/machinepacks",
        }
    }
}

impl fmt::Display for ProjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProjectType::App => write!(f, "app"),
            ProjectType::Pack => write!(f, "pack"),
        }
    }
}

impl FromStr for ProjectType {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "app" => Ok(ProjectType::App),
            "pack" | "machinepack" => Ok(ProjectType::Pack),
            _ => Err(ValidationError::NotAllowed {
                field: "project type".to_string(),
                allowed: vec!["app".to_string(), "pack".to_string()],
            }),
        }
    }
}

// =============================================================================
// Local Project Link
// =============================================================================

/// Association between a local directory and a remote project.
///
/// Created on first successful link, read on every session start. Only
/// re-linking mutates it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalProjectLink {
    /// Identity of the project on the remote service.
    #[serde(rename = "id")]
    pub remote_id: String,

    /// Whether the linked project is an app or a pack.
    #[serde(rename = "type")]
    pub project_type: ProjectType,

    /// Human-readable project name.
    pub display_name: String,
}

impl LocalProjectLink {
    /// Package name derived from the display name (lowercase, dash separated).
    pub fn package_name(&self) -> String {
        let slug: String = self
            .display_name
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_lowercase()
                } else {
                    '-'
                }
            })
            .collect();

        let parts: Vec<&str> = slug.split('-').filter(|p| !p.is_empty()).collect();
        if parts.is_empty() {
            "driftline-project".to_string()
        } else {
            parts.join("-")
        }
    }
}

// =============================================================================
// Credential
// =============================================================================

/// Secret used to authenticate against the remote service.
///
/// Owned by an external credential store; never written here.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    /// Opaque secret key.
    pub secret: String,

    /// Who this credential identifies as (username).
    pub identity_label: String,
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("secret", &"<redacted>")
            .field("identity_label", &self.identity_label)
            .finish()
    }
}

// =============================================================================
// Hashes & Signature
// =============================================================================

/// Entity identity → content hash, recomputed every session.
pub type EntityHashes = BTreeMap<String, String>;

/// A single machine hash as it appears on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineHash {
    /// Machine identity.
    pub machine: String,

    /// Hash of the machine definition.
    pub hash: String,
}

/// Everything the client knows about its local state, in one value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PackSignature {
    /// Hash of the pack-level metadata (absent if no metadata exists yet).
    pub pack_hash: Option<String>,

    /// Hash per tracked entity.
    pub entity_hashes: EntityHashes,
}

impl PackSignature {
    /// Machine hashes in wire shape, ordered by identity.
    pub fn machine_hashes(&self) -> Vec<MachineHash> {
        self.entity_hashes
            .iter()
            .map(|(machine, hash)| MachineHash {
                machine: machine.clone(),
                hash: hash.clone(),
            })
            .collect()
    }

    /// Request parameters for the initial-sync call.
    pub fn to_params(&self) -> serde_json::Value {
        serde_json::json!({
            "packHash": self.pack_hash,
            "machineHashes": self.machine_hashes(),
        })
    }

    /// True when nothing is tracked locally (first link).
    pub fn is_empty(&self) -> bool {
        self.pack_hash.is_none() && self.entity_hashes.is_empty()
    }
}

// =============================================================================
// Identity Validation
// =============================================================================

/// Checks that a machine identity can safely become a file name.
///
/// Identities come from the remote; they must not escape the project tree.
pub fn validate_machine_identity(identity: &str) -> Result<(), ValidationError> {
    if identity.trim().is_empty() {
        return Err(ValidationError::Required {
            field: "machine identity".to_string(),
        });
    }

    if identity.starts_with('.') {
        return Err(ValidationError::InvalidFormat {
            field: "machine identity".to_string(),
            reason: format!("'{identity}' may not start with '.'"),
        });
    }

    if let Some(bad) = identity
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')))
    {
        return Err(ValidationError::InvalidFormat {
            field: "machine identity".to_string(),
            reason: format!("'{identity}' contains '{bad}'"),
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_project_type_parsing() {
        assert_eq!("app".parse::<ProjectType>().unwrap(), ProjectType::App);
        assert_eq!("pack".parse::<ProjectType>().unwrap(), ProjectType::Pack);
        assert_eq!(
            "machinepack".parse::<ProjectType>().unwrap(),
            ProjectType::Pack
        );
        assert!("library".parse::<ProjectType>().is_err());
    }

    #[test]
    fn test_link_file_shape() {
        let json = r#"{"id":"mikermcneil/export-test","type":"machinepack","displayName":"Export Test"}"#;
        let link: LocalProjectLink = serde_json::from_str(json).unwrap();
        assert_eq!(link.remote_id, "mikermcneil/export-test");
        assert_eq!(link.project_type, ProjectType::Pack);

        let out = serde_json::to_value(&link).unwrap();
        assert_eq!(out["type"], "pack");
        assert_eq!(out["displayName"], "Export Test");
    }

    #[test]
    fn test_package_name() {
        let link = LocalProjectLink {
            remote_id: "432".to_string(),
            project_type: ProjectType::App,
            display_name: "My Cool  App!".to_string(),
        };
        assert_eq!(link.package_name(), "my-cool-app");
    }

    #[test]
    fn test_credential_debug_redacts_secret() {
        let cred = Credential {
            secret: "29f559ae-3bec".to_string(),
            identity_label: "rachaelshaw".to_string(),
        };
        let debug = format!("{cred:?}");
        assert!(!debug.contains("29f559ae"));
        assert!(debug.contains("rachaelshaw"));
    }

    #[test]
    fn test_signature_params() {
        let mut sig = PackSignature::default();
        assert!(sig.is_empty());
        sig.pack_hash = Some("abc".to_string());
        sig.entity_hashes.insert("b-machine".into(), "2".into());
        sig.entity_hashes.insert("a-machine".into(), "1".into());

        let params = sig.to_params();
        assert_eq!(params["packHash"], "abc");
        assert_eq!(params["machineHashes"][0]["machine"], "a-machine");
        assert_eq!(params["machineHashes"][1]["hash"], "2");
    }

    #[test]
    fn test_machine_identity_validation() {
        assert!(validate_machine_identity("send-email").is_ok());
        assert!(validate_machine_identity("v2.parse_json").is_ok());
        assert!(validate_machine_identity("").is_err());
        assert!(validate_machine_identity("../etc/passwd").is_err());
        assert!(validate_machine_identity("a/b").is_err());
        assert!(validate_machine_identity(".hidden").is_err());
    }
}
