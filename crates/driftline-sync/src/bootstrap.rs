//! Project preparation run before every session: package manifest,
//! postinstall hook, dependency install, and the app scaffold check.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use driftline_core::LocalProjectLink;
use serde_json::{json, Map, Value};
use tracing::{debug, info};

use crate::error::{io_err, SyncError, SyncResult};

/// Name of the package manifest in the project root.
pub const MANIFEST_FILE: &str = "package.json";

/// File every app needs to serve responses locally.
pub const APP_SCAFFOLD_FILE: &str = "api/responses/response.js";

fn manifest_path(root: &Path) -> PathBuf {
    root.join(MANIFEST_FILE)
}

fn read_manifest(path: &Path) -> SyncResult<Map<String, Value>> {
    let text = std::fs::read_to_string(path).map_err(|e| io_err(path, e))?;
    match serde_json::from_str(&text) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) | Err(_) => Err(SyncError::InvalidConfig(format!(
            "{} is not a JSON object",
            path.display()
        ))),
    }
}

fn write_manifest(path: &Path, manifest: &Map<String, Value>) -> SyncResult<()> {
    let mut text = serde_json::to_string_pretty(manifest)?;
    text.push('\n');
    std::fs::write(path, text).map_err(|e| io_err(path, e))
}

/// Creates a minimal manifest if the project has none. Returns true if one
/// was written.
pub fn ensure_manifest(root: &Path, link: &LocalProjectLink) -> SyncResult<bool> {
    let path = manifest_path(root);
    if path.exists() {
        return Ok(false);
    }

    let manifest = json!({
        "name": link.package_name(),
        "version": "0.0.0",
        "private": true,
        "description": link.display_name,
    });
    if let Value::Object(map) = manifest {
        write_manifest(&path, &map)?;
    }
    info!(?path, "Created package manifest");
    Ok(true)
}

/// Registers `script` as `scripts.postinstall` unless one is already set.
/// Returns true if the manifest changed.
pub fn ensure_postinstall(root: &Path, script: &str) -> SyncResult<bool> {
    let path = manifest_path(root);
    let mut manifest = read_manifest(&path)?;

    let scripts = manifest
        .entry("scripts")
        .or_insert_with(|| Value::Object(Map::new()));
    let Value::Object(scripts) = scripts else {
        return Err(SyncError::InvalidConfig(format!(
            "\"scripts\" in {} is not an object",
            path.display()
        )));
    };
    if scripts.contains_key("postinstall") {
        return Ok(false);
    }

    scripts.insert("postinstall".to_string(), Value::String(script.to_string()));
    write_manifest(&path, &manifest)?;
    debug!(?path, "Added postinstall script");
    Ok(true)
}

/// Runs each install command in the project root, in order.
pub async fn install_dependencies(root: &Path, commands: &[Vec<String>]) -> SyncResult<()> {
    for argv in commands {
        let Some((program, args)) = argv.split_first() else {
            continue;
        };
        let command_line = argv.join(" ");
        info!(command = %command_line, "Installing dependencies");

        let output = tokio::process::Command::new(program)
            .args(args)
            .current_dir(root)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| SyncError::CommandFailed {
                command: command_line.clone(),
                reason: e.to_string(),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let tail: Vec<&str> = stderr.lines().rev().take(5).collect();
            return Err(SyncError::CommandFailed {
                command: command_line,
                reason: format!(
                    "{}: {}",
                    output.status,
                    tail.into_iter().rev().collect::<Vec<_>>().join(" | ")
                ),
            });
        }
    }
    Ok(())
}

/// True if the app scaffold is in place.
pub fn has_app_scaffold(root: &Path) -> bool {
    root.join(APP_SCAFFOLD_FILE).is_file()
}

#[cfg(test)]
mod tests {
    use super::*;
    use driftline_core::ProjectType;

    fn link() -> LocalProjectLink {
        LocalProjectLink {
            remote_id: "432".into(),
            project_type: ProjectType::App,
            display_name: "My Cool App".into(),
        }
    }

    #[test]
    fn test_manifest_created_once() {
        let dir = tempfile::tempdir().unwrap();
        assert!(ensure_manifest(dir.path(), &link()).unwrap());
        assert!(!ensure_manifest(dir.path(), &link()).unwrap());

        let manifest = read_manifest(&manifest_path(dir.path())).unwrap();
        assert_eq!(manifest["name"], "my-cool-app");
    }

    #[test]
    fn test_postinstall_added_only_when_missing() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            manifest_path(dir.path()),
            r#"{"name":"x","scripts":{"test":"echo"}}"#,
        )
        .unwrap();

        assert!(ensure_postinstall(dir.path(), "node boot.js").unwrap());
        assert!(!ensure_postinstall(dir.path(), "something else").unwrap());

        let manifest = read_manifest(&manifest_path(dir.path())).unwrap();
        assert_eq!(manifest["scripts"]["postinstall"], "node boot.js");
        assert_eq!(manifest["scripts"]["test"], "echo");
    }

    #[test]
    fn test_invalid_manifest_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(manifest_path(dir.path()), "[]").unwrap();
        assert!(ensure_postinstall(dir.path(), "x").unwrap_err().is_config_error());
    }

    #[test]
    fn test_scaffold_check() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!has_app_scaffold(dir.path()));
        std::fs::create_dir_all(dir.path().join("api/responses")).unwrap();
        std::fs::write(dir.path().join(APP_SCAFFOLD_FILE), "").unwrap();
        assert!(has_app_scaffold(dir.path()));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_install_commands() {
        let dir = tempfile::tempdir().unwrap();
        install_dependencies(dir.path(), &[vec!["true".to_string()]])
            .await
            .unwrap();

        let err = install_dependencies(dir.path(), &[vec!["false".to_string()]])
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::CommandFailed { .. }));

        let missing = install_dependencies(
            dir.path(),
            &[vec!["driftline-no-such-program".to_string()]],
        )
        .await
        .unwrap_err();
        assert!(matches!(missing, SyncError::CommandFailed { .. }));
    }
}
