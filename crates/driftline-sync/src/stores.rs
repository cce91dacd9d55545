//! Persisted state read before a session starts: the keychain and the
//! project link file.

use std::path::{Path, PathBuf};

use driftline_core::{Credential, LocalProjectLink};
use serde::Deserialize;
use tracing::debug;

use crate::error::{io_err, CredentialError, SyncError, SyncResult};

// =============================================================================
// Credential Store
// =============================================================================

/// Opaque source of the session credential.
pub trait CredentialStore: Send + Sync {
    fn read(&self) -> Result<Credential, CredentialError>;
}

/// Keychain stored as a JSON file `{ "secret": "...", "username": "..." }`.
#[derive(Debug, Clone)]
pub struct KeychainFile {
    path: PathBuf,
}

#[derive(Debug, Deserialize)]
struct KeychainRecord {
    #[serde(default)]
    secret: Option<String>,
    #[serde(default)]
    username: Option<String>,
}

impl KeychainFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        KeychainFile { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl CredentialStore for KeychainFile {
    fn read(&self) -> Result<Credential, CredentialError> {
        let text = match std::fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(CredentialError::Missing(self.path.clone()))
            }
            Err(e) => return Err(io_err(&self.path, e).into()),
        };

        let record: KeychainRecord = serde_json::from_str(&text)
            .map_err(|e| CredentialError::Unrecognized(format!("keychain is not valid JSON: {e}")))?;

        match (record.secret, record.username) {
            (Some(secret), Some(username))
                if !secret.trim().is_empty() && !username.trim().is_empty() =>
            {
                debug!(username = %username, "Keychain read");
                Ok(Credential {
                    secret,
                    identity_label: username,
                })
            }
            _ => Err(CredentialError::Unrecognized(
                "keychain is missing a secret or username".into(),
            )),
        }
    }
}

/// A credential supplied directly.
#[derive(Debug, Clone)]
pub struct StaticCredential(pub Credential);

impl CredentialStore for StaticCredential {
    fn read(&self) -> Result<Credential, CredentialError> {
        Ok(self.0.clone())
    }
}

// =============================================================================
// Link File
// =============================================================================

/// The `driftline.json` link file in a project root.
#[derive(Debug, Clone)]
pub struct LinkFile {
    path: PathBuf,
}

impl LinkFile {
    pub const FILE_NAME: &'static str = "driftline.json";

    pub fn in_root(root: &Path) -> Self {
        LinkFile {
            path: root.join(Self::FILE_NAME),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the link. `None` means the directory is not linked yet.
    pub fn read(&self) -> SyncResult<Option<LocalProjectLink>> {
        let text = match std::fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(io_err(&self.path, e)),
        };

        let link = serde_json::from_str(&text).map_err(|e| {
            SyncError::InvalidConfig(format!(
                "{} is not a valid link file: {e}",
                self.path.display()
            ))
        })?;
        Ok(Some(link))
    }

    /// Writes the link file.
    pub fn write(&self, link: &LocalProjectLink) -> SyncResult<()> {
        let mut text = serde_json::to_string_pretty(link)?;
        text.push('\n');
        std::fs::write(&self.path, text).map_err(|e| io_err(&self.path, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use driftline_core::ProjectType;

    #[test]
    fn test_keychain_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keychain.json");
        std::fs::write(&path, r#"{"secret":"29f559ae","username":"rachaelshaw"}"#).unwrap();

        let cred = KeychainFile::new(&path).read().unwrap();
        assert_eq!(cred.secret, "29f559ae");
        assert_eq!(cred.identity_label, "rachaelshaw");
    }

    #[test]
    fn test_keychain_failures() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keychain.json");

        assert!(matches!(
            KeychainFile::new(&path).read().unwrap_err(),
            CredentialError::Missing(_)
        ));

        std::fs::write(&path, "garbage").unwrap();
        assert!(matches!(
            KeychainFile::new(&path).read().unwrap_err(),
            CredentialError::Unrecognized(_)
        ));

        std::fs::write(&path, r#"{"secret":"","username":"x"}"#).unwrap();
        assert!(matches!(
            KeychainFile::new(&path).read().unwrap_err(),
            CredentialError::Unrecognized(_)
        ));
    }

    #[test]
    fn test_link_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let file = LinkFile::in_root(dir.path());
        assert!(file.read().unwrap().is_none());

        let link = LocalProjectLink {
            remote_id: "owner/pack".into(),
            project_type: ProjectType::Pack,
            display_name: "Pack".into(),
        };
        file.write(&link).unwrap();
        assert_eq!(file.read().unwrap(), Some(link));

        std::fs::write(file.path(), "{").unwrap();
        assert!(file.read().unwrap_err().is_config_error());
    }
}
