//! Per-task pipeline execution.
//!
//! The runner is the queue's handler: it deserializes the frozen task
//! payload, drives the run's steps sequentially through the container
//! runtime, persists every state transition and log line, and finalizes the
//! pipeline. A run suspends (releasing its worker) only at an approval step
//! and is canceled through its registered cancellation handle.

mod env;
mod mask;
mod workspace;

pub use env::{
    pipeline_overlay, plugin_overlay, repo_overlay, split_step_env, substitute,
    substitute_secrets, RunEnv, SplitEnv,
};
pub use mask::SecretMasker;
pub use workspace::{
    container_name, ensure_dockerfile, prepare_workspace, sanitize_name, workspace_path,
    CONTAINER_WORKSPACE,
};

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::approval::{ApprovalController, ApprovalError, Gate, EXPIRED_MESSAGE};
use crate::config::EngineConfig;
use crate::model::{LogKind, Status, StepKind, StepPayload, Task, TaskPayload};
use crate::queue::TaskHandler;
use crate::runtime::{ContainerRuntime, ContainerSpec, OutputLine, RuntimeError};
use crate::secrets::{resolve, CredentialError, CredentialStore, ResolvedCredentials};
use crate::store::{StateStore, StoreError};

/// Errors that can occur while executing a task.
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Credential(#[from] CredentialError),

    #[error(transparent)]
    Approval(#[from] ApprovalError),

    #[error("task payload is corrupt: {0}")]
    Payload(String),

    #[error("missing row: {0}")]
    MissingRow(String),
}

/// Executes one task per invocation; shared by all queue workers.
pub struct Runner {
    store: Arc<StateStore>,
    runtime: Arc<dyn ContainerRuntime>,
    credentials: Arc<dyn CredentialStore>,
    approvals: ApprovalController,
    config: EngineConfig,
    /// Per-run cancellation handles, keyed by pipeline id.
    cancels: Arc<DashMap<i64, CancellationToken>>,
}

#[async_trait]
impl TaskHandler for Runner {
    async fn handle(&self, task: Task) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        self.run_task(task).await.map_err(Into::into)
    }
}

impl Runner {
    pub fn new(
        store: Arc<StateStore>,
        runtime: Arc<dyn ContainerRuntime>,
        credentials: Arc<dyn CredentialStore>,
        config: EngineConfig,
        cancels: Arc<DashMap<i64, CancellationToken>>,
    ) -> Self {
        Self {
            approvals: ApprovalController::new(Arc::clone(&store)),
            store,
            runtime,
            credentials,
            config,
            cancels,
        }
    }

    /// Runs one task to completion (or suspension at an approval step).
    pub async fn run_task(&self, task: Task) -> Result<(), RunnerError> {
        let payload = match task.payload() {
            Ok(payload) => payload,
            Err(e) => {
                warn!(task = %task.id, pipeline_id = task.pipeline_id, error = %e, "dropping task with corrupt payload");
                self.store
                    .finalize_run(task.pipeline_id, Status::Error, Some("task payload is corrupt"))
                    .await?;
                return Err(RunnerError::Payload(e.to_string()));
            }
        };

        // Admission: a pipeline that reached a terminal state while queued
        // (e.g. canceled) is not re-run.
        match self.store.get_pipeline_status(payload.pipeline_id).await? {
            None => {
                self.store.delete_task(&task.id).await?;
                return Ok(());
            }
            Some(status) if status.is_terminal() => {
                self.store.delete_task(&task.id).await?;
                return Ok(());
            }
            Some(_) => {}
        }

        let cancel = CancellationToken::new();
        self.cancels.insert(payload.pipeline_id, cancel.clone());
        let result = self.execute(&task, &payload, cancel).await;
        self.cancels.remove(&payload.pipeline_id);
        result
    }

    async fn execute(
        &self,
        task: &Task,
        payload: &TaskPayload,
        cancel: CancellationToken,
    ) -> Result<(), RunnerError> {
        let pipeline_id = payload.pipeline_id;
        self.store.mark_pipeline_running(pipeline_id).await?;

        let steps = self.store.list_steps(pipeline_id).await?;
        let repo = self
            .store
            .get_repository(payload.repo_id)
            .await?
            .ok_or_else(|| RunnerError::MissingRow(format!("repository {}", payload.repo_id)))?;
        let mut pipeline = self
            .store
            .get_pipeline(pipeline_id)
            .await?
            .ok_or_else(|| RunnerError::MissingRow(format!("pipeline {pipeline_id}")))?;
        let settings = self.store.get_or_init_pipeline_config(repo.id).await?;

        info!(
            pipeline_id,
            number = pipeline.number,
            repo = %repo.full_name,
            task = %task.id,
            "run started"
        );

        // Environment assembly; the overlay order is load-bearing.
        let mut run_env = RunEnv::from_process();
        run_env.extend(pipeline_overlay(&pipeline, &payload.run_name));
        run_env.extend(repo_overlay(&repo, payload));
        run_env.extend(pipeline.additional_variables.clone());

        let aliases: Vec<String> = payload
            .steps
            .iter()
            .flat_map(|s| s.secrets.iter().cloned())
            .collect();
        let resolved = resolve(
            self.credentials.as_ref(),
            &settings,
            &aliases,
            &payload.repo_clone,
        )
        .await?;
        run_env.extend(resolved.env.iter().cloned());
        if let Some(url) = &resolved.clone_url_override {
            run_env.set("REPO_CLONE_URL_AUTH", url.clone());
        }

        let masker = SecretMasker::new(resolved.secret_values());

        let (workspace_root, pinned_root) = if payload.workspace_root.is_empty() {
            (self.config.workspace_root.clone(), false)
        } else {
            (PathBuf::from(&payload.workspace_root), true)
        };
        let mut workspace: Option<PathBuf> = None;

        let mut final_status = Status::Success;
        let mut failure_message: Option<String> = None;

        'steps: for spec_step in &payload.steps {
            let Some(row) = steps.iter().find(|s| s.pid == spec_step.pid) else {
                continue;
            };

            if cancel.is_cancelled() {
                final_status = Status::Killed;
                break;
            }

            if matches!(row.state, Status::Success | Status::Skipped) {
                continue;
            }

            // Branch conditioning.
            if let Some(conditions) = &spec_step.conditions {
                if !conditions.matches_branch(&pipeline.branch) {
                    let mut line = self.store.max_log_line(row.id).await? + 1;
                    self.log_line(
                        row.id,
                        &mut line,
                        &masker,
                        LogKind::Meta,
                        &format!(
                            "step skipped: branch '{}' does not match {:?}",
                            pipeline.branch.trim(),
                            conditions.branches
                        ),
                    )
                    .await;
                    self.store
                        .finish_step(row.id, Status::Skipped, 0, "", "")
                        .await?;
                    continue;
                }
            }

            self.store.mark_step_running(row.id).await?;
            let mut line = self.store.max_log_line(row.id).await? + 1;

            if !spec_step.image.is_empty() {
                self.log_line(
                    row.id,
                    &mut line,
                    &masker,
                    LogKind::Meta,
                    &format!("using image {}", spec_step.image),
                )
                .await;
            }

            // Approval gate.
            if spec_step.kind == StepKind::Approval {
                let fresh = self
                    .store
                    .get_step(row.id)
                    .await?
                    .ok_or_else(|| RunnerError::MissingRow(format!("step {}", row.id)))?;

                match self.approvals.gate(&pipeline, &fresh).await? {
                    Gate::Proceed => {
                        if fresh.state != Status::Success {
                            self.store
                                .finish_step(row.id, Status::Success, 0, "", "")
                                .await?;
                        }
                        continue;
                    }
                    Gate::Suspend => {
                        info!(pipeline_id, step = %spec_step.name, "run suspended awaiting approval");
                        return Ok(());
                    }
                    Gate::Rejected(message) => {
                        final_status = Status::Failure;
                        failure_message = Some(message);
                        break;
                    }
                    Gate::Expired => {
                        self.store
                            .finish_step(row.id, Status::Failure, 0, "fail", EXPIRED_MESSAGE)
                            .await?;
                        final_status = Status::Failure;
                        failure_message = Some(EXPIRED_MESSAGE.to_string());
                        break;
                    }
                }
            }

            // Workspace preparation, lazily, on the first executing step.
            let ws = if let Some(path) = &workspace {
                path.clone()
            } else {
                match prepare_workspace(&workspace_root, &repo.name, pipeline.id) {
                    Ok(path) => {
                        run_env.set("WORKSPACE", CONTAINER_WORKSPACE);
                        run_env.set("CI_WORKSPACE", CONTAINER_WORKSPACE);
                        run_env.set("WORKSPACE_ROOT", workspace_root.display().to_string());
                        run_env.set("CI_WORKSPACE_ROOT", workspace_root.display().to_string());
                        run_env.set("APP_NAME", repo.name.clone());
                        run_env.set("APP_OWNER", repo.owner.clone());
                        run_env.set("REPO_CLONE_PATH", path.display().to_string());
                        workspace = Some(path.clone());
                        path
                    }
                    Err(e) => {
                        let message = format!("workspace preparation failed: {e}");
                        self.log_line(row.id, &mut line, &masker, LogKind::Meta, &message)
                            .await;
                        self.store
                            .finish_step(row.id, Status::Failure, 1, "fail", &message)
                            .await?;
                        final_status = Status::Failure;
                        failure_message = Some(message);
                        break;
                    }
                }
            };

            // Every referenced alias must have resolved to a binding.
            if let Some(alias) = spec_step
                .secrets
                .iter()
                .find(|alias| resolved.binding(alias).is_none())
            {
                let message = format!("referenced credential {alias} not bound");
                self.log_line(row.id, &mut line, &masker, LogKind::Meta, &message)
                    .await;
                self.store
                    .finish_step(row.id, Status::Failure, 1, "fail", &message)
                    .await?;
                final_status = Status::Failure;
                failure_message = Some(message);
                break;
            }

            run_env.set("CI_STEP_NAME", spec_step.name.clone());
            run_env.set("CI_STEP_IMAGE", spec_step.image.clone());

            let split = split_step_env(&spec_step.env, &resolved, &run_env);
            let mut container_env = run_env.clone();
            container_env.extend(split.pre.iter().cloned());
            if let Some(plugin) = &spec_step.plugin {
                container_env.extend(plugin_overlay(&plugin.settings, &resolved, &run_env));
            }

            let mut binds = vec![format!("{}:{}", ws.display(), CONTAINER_WORKSPACE)];
            binds.extend(spec_step.volumes.iter().cloned());
            let mut privileged = spec_step.privileged;
            if let Some(plugin) = &spec_step.plugin {
                binds.extend(plugin.volumes.iter().cloned());
                privileged = privileged || plugin.privileged;
            }

            let outcome = self
                .run_step_containers(StepRun {
                    cancel: &cancel,
                    spec_step,
                    step_id: row.id,
                    line: &mut line,
                    masker: &masker,
                    resolved: &resolved,
                    container_env: &container_env,
                    binds: &binds,
                    privileged,
                    ws: &ws,
                    dockerfile_fallback: &settings.dockerfile,
                    pipeline_id,
                })
                .await;

            match outcome {
                StepOutcome::Completed => {}
                StepOutcome::Canceled => {
                    // The cancel path stamps pipeline, workflow, and steps
                    // as killed in its own transaction; writing a terminal
                    // state here would race it.
                    final_status = Status::Killed;
                    break 'steps;
                }
                StepOutcome::Failed { exit_code, message } => {
                    self.log_line(row.id, &mut line, &masker, LogKind::Meta, &message)
                        .await;
                    self.store
                        .finish_step(row.id, Status::Failure, exit_code, "fail", &message)
                        .await?;
                    final_status = Status::Failure;
                    failure_message = Some(message);
                    break 'steps;
                }
            }

            // Deferred env captures run on the host, inside the workspace.
            for (key, expr) in &split.post {
                match capture_shell(&ws, expr).await {
                    Some(value) => run_env.set(key.clone(), value),
                    None => warn!(pipeline_id, %key, "post-step env capture failed"),
                }
            }

            // Commit back-fill once a clone exists in the workspace.
            if pipeline.commit.is_empty() && ws.join(".git").exists() {
                if let Some(sha) = git_head(&ws).await {
                    self.store.set_pipeline_commit(pipeline_id, &sha).await?;
                    run_env.set("CI_COMMIT_SHA", sha.clone());
                    run_env.set("COMMIT_ID", sha.clone());
                    run_env.set("COMMIT_ID_SHA", sha.clone());
                    pipeline.commit = sha;
                }
            }

            self.store
                .finish_step(row.id, Status::Success, 0, "", "")
                .await?;
        }

        // Finalization. A canceled run is finalized by the cancel
        // transaction (pipeline, workflow, and steps stamped killed, task
        // removed); this side only observes.
        if cancel.is_cancelled() {
            debug!(pipeline_id, "run interrupted; cancellation owns the final record");
        } else {
            match self.store.get_pipeline_status(pipeline_id).await? {
                Some(status) if status.is_terminal() => {
                    debug!(pipeline_id, %status, "pipeline already finalized");
                }
                _ => {
                    self.store
                        .finalize_run(pipeline_id, final_status, failure_message.as_deref())
                        .await?;
                }
            }
        }

        info!(pipeline_id, status = %final_status, "run finished");

        if let Some(ws) = workspace {
            // A spec-pinned workspace root opts the user into persistence.
            if settings.cleanup_enabled && !pinned_root {
                if let Err(e) = std::fs::remove_dir_all(&ws) {
                    warn!(pipeline_id, path = %ws.display(), error = %e, "workspace cleanup failed");
                }
            }
        }

        Ok(())
    }

    /// Runs the step's container invocations: one per non-empty command, or
    /// a single default-entrypoint invocation for plugin-only steps.
    async fn run_step_containers(&self, run: StepRun<'_>) -> StepOutcome {
        let StepRun {
            cancel,
            spec_step,
            step_id,
            line,
            masker,
            resolved,
            container_env,
            binds,
            privileged,
            ws,
            dockerfile_fallback,
            pipeline_id,
        } = run;

        if spec_step.plugin.is_some() && spec_step.commands.is_empty() {
            let name = container_name(&spec_step.name, pipeline_id, spec_step.pid, None);
            let spec = ContainerSpec::new(name, spec_step.image.clone())
                .with_env(container_env.to_container_lines())
                .with_working_dir(CONTAINER_WORKSPACE)
                .with_binds(binds.to_vec())
                .privileged(privileged);

            return match self.run_container(cancel, spec, step_id, line, masker).await {
                Ok(0) => StepOutcome::Completed,
                Ok(code) => StepOutcome::Failed {
                    exit_code: code,
                    message: format!("plugin exited with code {code}"),
                },
                Err(RuntimeError::Canceled) => StepOutcome::Canceled,
                Err(e) => StepOutcome::Failed {
                    exit_code: 1,
                    message: e.to_string(),
                },
            };
        }

        for (index, command) in spec_step.commands.iter().enumerate() {
            if command.trim().is_empty() {
                continue;
            }
            let command = substitute_secrets(command, resolved);

            // Materialize a Dockerfile ahead of docker build invocations.
            if command.to_lowercase().contains("docker build") {
                if let Err(e) = ensure_dockerfile(ws, dockerfile_fallback) {
                    warn!(pipeline_id, error = %e, "dockerfile injection failed");
                }
            }

            self.log_line(step_id, line, masker, LogKind::Output, &format!("$ {command}"))
                .await;

            let name = container_name(&spec_step.name, pipeline_id, spec_step.pid, Some(index));
            let spec = ContainerSpec::new(name, spec_step.image.clone())
                .with_shell_command(command.clone())
                .with_env(container_env.to_container_lines())
                .with_working_dir(CONTAINER_WORKSPACE)
                .with_binds(binds.to_vec())
                .privileged(privileged);

            match self.run_container(cancel, spec, step_id, line, masker).await {
                Ok(0) => {
                    // Later commands and steps may still expect the fallback
                    // Dockerfile; injection stays non-forced.
                    if let Err(e) = ensure_dockerfile(ws, dockerfile_fallback) {
                        warn!(pipeline_id, error = %e, "dockerfile injection failed");
                    }
                }
                Ok(code) => {
                    return StepOutcome::Failed {
                        exit_code: code,
                        message: format!("command exited with code {code}"),
                    }
                }
                Err(RuntimeError::Canceled) => return StepOutcome::Canceled,
                Err(e) => {
                    return StepOutcome::Failed {
                        exit_code: 1,
                        message: e.to_string(),
                    }
                }
            }
        }

        StepOutcome::Completed
    }

    /// Runs one container, streaming masked output lines into the log.
    async fn run_container(
        &self,
        cancel: &CancellationToken,
        spec: ContainerSpec,
        step_id: i64,
        line: &mut i64,
        masker: &SecretMasker,
    ) -> Result<i64, RuntimeError> {
        let (tx, rx) = mpsc::channel(256);
        let sink = tokio::spawn(persist_lines(
            Arc::clone(&self.store),
            masker.clone(),
            step_id,
            *line,
            rx,
        ));

        let result = self.runtime.run(cancel.clone(), spec, tx).await;

        if let Ok(next) = sink.await {
            *line = next;
        }
        result
    }

    /// Appends one engine-generated log line; failures are logged and
    /// swallowed, never failing the run.
    async fn log_line(
        &self,
        step_id: i64,
        line: &mut i64,
        masker: &SecretMasker,
        kind: LogKind,
        text: &str,
    ) {
        let data = format!("{}\n", masker.mask(text));
        if let Err(e) = self
            .store
            .append_log_line(step_id, *line, kind, data.as_bytes())
            .await
        {
            warn!(step_id, error = %e, "failed to append log line");
        }
        *line += 1;
    }
}

/// Borrowed inputs for one step's container invocations.
struct StepRun<'a> {
    cancel: &'a CancellationToken,
    spec_step: &'a StepPayload,
    step_id: i64,
    line: &'a mut i64,
    masker: &'a SecretMasker,
    resolved: &'a ResolvedCredentials,
    container_env: &'a RunEnv,
    binds: &'a [String],
    privileged: bool,
    ws: &'a Path,
    dockerfile_fallback: &'a str,
    pipeline_id: i64,
}

/// Result of a step's container invocations.
enum StepOutcome {
    Completed,
    Canceled,
    Failed { exit_code: i64, message: String },
}

/// Persists streamed container output; returns the next free line number.
async fn persist_lines(
    store: Arc<StateStore>,
    masker: SecretMasker,
    step_id: i64,
    mut next: i64,
    mut rx: mpsc::Receiver<OutputLine>,
) -> i64 {
    while let Some(output) = rx.recv().await {
        let data = format!("{}\n", masker.mask(&output.text));
        if let Err(e) = store
            .append_log_line(step_id, next, LogKind::Output, data.as_bytes())
            .await
        {
            warn!(step_id, error = %e, "failed to persist log line");
        }
        next += 1;
    }
    next
}

/// Runs a `$(...)` capture on the host inside `dir`, `bash -lc` first with a
/// `sh -lc` fallback. Returns trimmed stdout.
async fn capture_shell(dir: &Path, expr: &str) -> Option<String> {
    for shell in ["bash", "sh"] {
        match tokio::process::Command::new(shell)
            .arg("-lc")
            .arg(expr)
            .current_dir(dir)
            .output()
            .await
        {
            Ok(output) => {
                if !output.status.success() {
                    warn!(expr, status = ?output.status.code(), "post-step capture exited non-zero");
                }
                return Some(String::from_utf8_lossy(&output.stdout).trim().to_string());
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => {
                warn!(expr, error = %e, "post-step capture failed to spawn");
                return None;
            }
        }
    }
    None
}

/// Resolves the workspace clone's HEAD commit, if any.
async fn git_head(ws: &Path) -> Option<String> {
    let output = tokio::process::Command::new("git")
        .arg("-C")
        .arg(ws)
        .args(["rev-parse", "HEAD"])
        .output()
        .await
        .ok()?;

    if !output.status.success() {
        return None;
    }
    let sha = String::from_utf8_lossy(&output.stdout).trim().to_string();
    (!sha.is_empty()).then_some(sha)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_capture_shell_trims_output() {
        let dir = tempfile::tempdir().unwrap();
        let value = capture_shell(dir.path(), "echo '  spaced  '").await.unwrap();
        assert_eq!(value, "spaced");
    }

    #[tokio::test]
    async fn test_capture_shell_runs_in_workspace() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("marker.txt"), "here").unwrap();

        let value = capture_shell(dir.path(), "cat marker.txt").await.unwrap();
        assert_eq!(value, "here");
    }

    #[tokio::test]
    async fn test_git_head_without_repo() {
        let dir = tempfile::tempdir().unwrap();
        assert!(git_head(dir.path()).await.is_none());
    }
}
