//! Workspace preparation and container naming.
//!
//! Each run gets a host directory `<root>/<sanitized_repo>/<pipeline_id>`,
//! bind-mounted into every command container as `/workspace`. Names derived
//! from user input (repo names, step names) are sanitized into the
//! `[a-z0-9._-]` alphabet.

use std::path::{Path, PathBuf};

use tracing::debug;

/// Mount point of the workspace inside containers.
pub const CONTAINER_WORKSPACE: &str = "/workspace";

/// Lowercases and collapses every run of characters outside `[a-z0-9._-]`
/// into a single `-`, trimming `-` from the edges.
pub fn sanitize_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut last_dash = false;

    for c in name.to_lowercase().chars() {
        if c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-' {
            out.push(c);
            last_dash = false;
        } else if !last_dash {
            out.push('-');
            last_dash = true;
        }
    }

    out.trim_matches('-').to_string()
}

/// Builds the unique container name
/// `<sanitized_step>-<pipeline_id>-<pid>[-c<index>]`.
pub fn container_name(step_name: &str, pipeline_id: i64, pid: i64, index: Option<usize>) -> String {
    let base = sanitize_name(step_name);
    match index {
        Some(index) => format!("{base}-{pipeline_id}-{pid}-c{index}"),
        None => format!("{base}-{pipeline_id}-{pid}"),
    }
}

/// Returns the per-run workspace path under a root.
pub fn workspace_path(root: &Path, repo_name: &str, pipeline_id: i64) -> PathBuf {
    root.join(sanitize_name(repo_name)).join(pipeline_id.to_string())
}

/// Creates a fresh workspace directory, removing any pre-existing content.
pub fn prepare_workspace(
    root: &Path,
    repo_name: &str,
    pipeline_id: i64,
) -> std::io::Result<PathBuf> {
    let path = workspace_path(root, repo_name, pipeline_id);
    if path.exists() {
        std::fs::remove_dir_all(&path)?;
    }
    std::fs::create_dir_all(&path)?;
    debug!(path = %path.display(), "prepared workspace");
    Ok(path)
}

/// Writes the fallback Dockerfile into the workspace when none exists.
/// Returns whether a file was written.
pub fn ensure_dockerfile(workspace: &Path, fallback: &str) -> std::io::Result<bool> {
    let dockerfile = workspace.join("Dockerfile");
    if dockerfile.exists() || fallback.trim().is_empty() {
        return Ok(false);
    }
    std::fs::write(&dockerfile, fallback)?;
    debug!(path = %dockerfile.display(), "materialized fallback Dockerfile");
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_name() {
        assert_eq!(sanitize_name("Build & Test"), "build-test");
        assert_eq!(sanitize_name("My App"), "my-app");
        assert_eq!(sanitize_name("ok_name.v2"), "ok_name.v2");
        assert_eq!(sanitize_name("--edges--"), "edges");
        assert_eq!(sanitize_name("a///b"), "a-b");
    }

    #[test]
    fn test_container_name() {
        assert_eq!(container_name("Build App", 42, 3, Some(0)), "build-app-42-3-c0");
        assert_eq!(container_name("notify", 42, 5, None), "notify-42-5");
    }

    #[test]
    fn test_prepare_workspace_is_fresh() {
        let root = tempfile::tempdir().unwrap();
        let path = prepare_workspace(root.path(), "acme/app", 7).unwrap();
        std::fs::write(path.join("stale.txt"), "old").unwrap();

        let again = prepare_workspace(root.path(), "acme/app", 7).unwrap();
        assert_eq!(path, again);
        assert!(!again.join("stale.txt").exists());
        assert!(again.ends_with("acme-app/7"));
    }

    #[test]
    fn test_ensure_dockerfile_injects_once() {
        let root = tempfile::tempdir().unwrap();

        assert!(ensure_dockerfile(root.path(), "FROM busybox\n").unwrap());
        std::fs::write(root.path().join("Dockerfile"), "FROM custom\n").unwrap();
        // Existing files are never overwritten.
        assert!(!ensure_dockerfile(root.path(), "FROM busybox\n").unwrap());
        assert_eq!(
            std::fs::read_to_string(root.path().join("Dockerfile")).unwrap(),
            "FROM custom\n"
        );
    }

    #[test]
    fn test_ensure_dockerfile_requires_fallback() {
        let root = tempfile::tempdir().unwrap();
        assert!(!ensure_dockerfile(root.path(), "   ").unwrap());
        assert!(!root.path().join("Dockerfile").exists());
    }
}
