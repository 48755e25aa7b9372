//! Retention and workspace garbage collection.
//!
//! After each successful trigger (and opportunistically when settings
//! change) the engine prunes pipeline rows beyond `max_records` with all
//! their children, removes the pruned runs' workspace directories, and
//! sweeps workspace directories past `retention_days`. Nothing in here ever
//! fails the caller: every error is logged at warn level.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tracing::{debug, warn};

use crate::model::{RepoPipelineConfig, Repository};
use crate::runner::{sanitize_name, workspace_path};
use crate::store::StateStore;

/// Upper bound on rows pruned per pass.
pub const RETENTION_SELECT_CAP: i64 = 10_000;

/// Enforces row retention and workspace GC for one repository.
///
/// `spec_workspace_root` is the workspace root declared by the current spec
/// (if any); pruning considers it alongside the default root.
pub async fn enforce(
    store: &StateStore,
    repo: &Repository,
    settings: &RepoPipelineConfig,
    spec_workspace_root: Option<&str>,
    default_root: &Path,
) {
    let roots = candidate_roots(default_root, spec_workspace_root);

    if settings.max_records > 0 {
        let stale = match store
            .stale_pipeline_ids(repo.id, settings.max_records, RETENTION_SELECT_CAP)
            .await
        {
            Ok(ids) => ids,
            Err(e) => {
                warn!(repo = %repo.full_name, error = %e, "retention: selecting stale pipelines failed");
                Vec::new()
            }
        };

        if !stale.is_empty() {
            debug!(repo = %repo.full_name, pruned = stale.len(), "retention: pruning pipelines");
            if let Err(e) = store.delete_pipelines(&stale).await {
                warn!(repo = %repo.full_name, error = %e, "retention: deleting pipelines failed");
            } else {
                for id in &stale {
                    for root in &roots {
                        remove_dir(&workspace_path(root, &repo.name, *id));
                    }
                }
            }
        }
    }

    if settings.retention_days > 0 {
        sweep_aged(store, repo, settings.retention_days, &roots).await;
    }
}

/// Removes workspace directories older than the retention window whose name
/// is not the id of a still-present pipeline.
async fn sweep_aged(store: &StateStore, repo: &Repository, retention_days: i64, roots: &[PathBuf]) {
    let live_ids = match store.list_pipeline_ids(repo.id).await {
        Ok(ids) => ids,
        Err(e) => {
            warn!(repo = %repo.full_name, error = %e, "retention: listing live pipelines failed");
            return;
        }
    };

    let cutoff = SystemTime::now() - Duration::from_secs(retention_days as u64 * 24 * 3600);

    for root in roots {
        let repo_dir = root.join(sanitize_name(&repo.name));
        let entries = match std::fs::read_dir(&repo_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => {
                warn!(dir = %repo_dir.display(), error = %e, "retention: reading workspace dir failed");
                continue;
            }
        };

        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }

            let name = entry.file_name();
            let is_live = name
                .to_str()
                .and_then(|n| n.parse::<i64>().ok())
                .map(|id| live_ids.contains(&id))
                .unwrap_or(false);
            if is_live {
                continue;
            }

            let old_enough = entry
                .metadata()
                .and_then(|m| m.modified())
                .map(|mtime| mtime < cutoff)
                .unwrap_or(false);
            if old_enough {
                debug!(path = %path.display(), "retention: sweeping aged workspace");
                remove_dir(&path);
            }
        }
    }
}

fn candidate_roots(default_root: &Path, spec_root: Option<&str>) -> Vec<PathBuf> {
    let mut roots = vec![default_root.to_path_buf()];
    if let Some(spec_root) = spec_root {
        let spec_root = spec_root.trim();
        if !spec_root.is_empty() {
            let spec_root = PathBuf::from(spec_root);
            if !roots.contains(&spec_root) {
                roots.push(spec_root);
            }
        }
    }
    roots
}

fn remove_dir(path: &Path) {
    match std::fs::remove_dir_all(path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "retention: removing directory failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Event;
    use crate::store::{NewPipeline, NewStep};
    use std::collections::HashMap;

    fn repo() -> Repository {
        Repository {
            id: 1,
            owner: "acme".to_string(),
            name: "app".to_string(),
            full_name: "acme/app".to_string(),
            url: String::new(),
            clone_url: String::new(),
            branch: "main".to_string(),
            active: true,
        }
    }

    async fn seeded_store(runs: usize) -> (StateStore, Vec<i64>) {
        let store = StateStore::in_memory().await.unwrap();
        store.upsert_repository(&repo()).await.unwrap();

        let mut ids = Vec::new();
        for _ in 0..runs {
            let (pipeline, _) = store
                .create_pipeline(
                    NewPipeline {
                        repo_id: 1,
                        author: "tester".to_string(),
                        event: Event::Manual,
                        branch: "main".to_string(),
                        r#ref: String::new(),
                        commit: String::new(),
                        message: String::new(),
                        title: String::new(),
                        additional_variables: HashMap::new(),
                    },
                    "build",
                    &[NewStep {
                        name: "noop".to_string(),
                        kind: crate::model::StepKind::Commands,
                        approval: None,
                    }],
                    HashMap::new(),
                )
                .await
                .unwrap();
            ids.push(pipeline.id);
        }
        (store, ids)
    }

    #[tokio::test]
    async fn test_enforce_prunes_beyond_max_records() {
        let (store, ids) = seeded_store(5).await;
        let root = tempfile::tempdir().unwrap();

        // Workspaces for the two oldest runs exist on disk.
        for id in &ids[..2] {
            std::fs::create_dir_all(workspace_path(root.path(), "app", *id)).unwrap();
        }

        let mut settings = RepoPipelineConfig::new(1);
        settings.max_records = 3;

        enforce(&store, &repo(), &settings, None, root.path()).await;

        assert_eq!(store.count_pipelines(1).await.unwrap(), 3);
        let remaining = store.list_pipeline_ids(1).await.unwrap();
        assert!(remaining.contains(&ids[2]));
        assert!(remaining.contains(&ids[3]));
        assert!(remaining.contains(&ids[4]));

        for id in &ids[..2] {
            assert!(!workspace_path(root.path(), "app", *id).exists());
        }
    }

    #[tokio::test]
    async fn test_enforce_without_limits_is_noop() {
        let (store, _) = seeded_store(4).await;
        let root = tempfile::tempdir().unwrap();

        let settings = RepoPipelineConfig::new(1);
        enforce(&store, &repo(), &settings, None, root.path()).await;

        assert_eq!(store.count_pipelines(1).await.unwrap(), 4);
    }

    #[tokio::test]
    async fn test_age_sweep_keeps_live_workspaces() {
        let (store, ids) = seeded_store(1).await;
        let root = tempfile::tempdir().unwrap();
        let repo_dir = root.path().join("app");

        // One live workspace, one orphan; both have current mtimes, so the
        // orphan survives too (it is not old enough yet).
        std::fs::create_dir_all(repo_dir.join(ids[0].to_string())).unwrap();
        std::fs::create_dir_all(repo_dir.join("99999")).unwrap();

        let mut settings = RepoPipelineConfig::new(1);
        settings.retention_days = 7;

        enforce(&store, &repo(), &settings, None, root.path()).await;

        assert!(repo_dir.join(ids[0].to_string()).exists());
        assert!(repo_dir.join("99999").exists());
    }

    #[test]
    fn test_candidate_roots_dedupe() {
        let default = PathBuf::from("/srv/ws");
        let roots = candidate_roots(&default, Some("/srv/ws"));
        assert_eq!(roots.len(), 1);

        let roots = candidate_roots(&default, Some("/custom"));
        assert_eq!(roots.len(), 2);

        let roots = candidate_roots(&default, Some("  "));
        assert_eq!(roots.len(), 1);
    }
}
