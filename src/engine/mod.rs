//! The pipeline engine: composition root and public triggering surface.
//!
//! `Engine` wires the state store, the bounded task queue, the container
//! runtime, the credential store, the cron scheduler, and retention into the
//! operations the surrounding system calls: trigger a pipeline, cancel a
//! run, submit an approval verdict, update per-repo settings.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::SecondsFormat;
use dashmap::DashMap;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::approval::{ApprovalController, ApprovalError};
use crate::config::EngineConfig;
use crate::cron::{CronFiring, CronScheduler, CronTrigger};
use crate::model::{
    ApprovalAction, ApprovalState, Event, Pipeline, PluginPayload, RepoPipelineConfig,
    StepApproval, StepPayload, TaskPayload,
};
use crate::queue::{QueueError, QueueStats, TaskQueue};
use crate::runner::Runner;
use crate::runtime::ContainerRuntime;
use crate::secrets::CredentialStore;
use crate::spec::{parse_pipeline, PipelineSpec, SpecError, StepSpec};
use crate::store::{CancelOutcome, NewPipeline, NewStep, StateStore, StoreError};

/// Default cancellation message when the caller supplies no reason.
pub const DEFAULT_CANCEL_MESSAGE: &str = "Pipeline cancelled by user";

/// Workflow name used when the spec declares none.
const DEFAULT_WORKFLOW_NAME: &str = "default";

/// Errors surfaced by the engine's public operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The repository has no pipeline configuration content.
    #[error("pipeline configuration is empty")]
    MissingSpec,

    /// The pipeline YAML failed to parse or validate.
    #[error(transparent)]
    Validation(#[from] SpecError),

    /// The queue is at capacity; the pipeline row was marked failed.
    #[error("pipeline queue is full")]
    QueueFull,

    /// `disallow_parallel` is set and a non-terminal pipeline exists.
    #[error("a non-terminal pipeline already exists for this repository")]
    ParallelDisallowed,

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Approval(#[from] ApprovalError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error("not found: {0}")]
    NotFound(String),

    /// The pipeline is already in a terminal state.
    #[error("pipeline already finished")]
    AlreadyFinished,
}

/// Inputs for one trigger invocation.
#[derive(Debug, Clone)]
pub struct TriggerOptions {
    pub event: Event,
    pub author: String,
    /// Branch override; empty falls back to the repo's default branch, then
    /// `main`.
    pub branch: String,
    pub r#ref: String,
    pub commit: String,
    pub message: String,
    pub title: String,
    pub variables: HashMap<String, String>,
}

impl Default for TriggerOptions {
    fn default() -> Self {
        Self {
            event: Event::Manual,
            author: String::new(),
            branch: String::new(),
            r#ref: String::new(),
            commit: String::new(),
            message: String::new(),
            title: String::new(),
            variables: HashMap::new(),
        }
    }
}

impl TriggerOptions {
    pub fn manual(author: impl Into<String>) -> Self {
        Self {
            author: author.into(),
            ..Default::default()
        }
    }

    pub fn with_branch(mut self, branch: impl Into<String>) -> Self {
        self.branch = branch.into();
        self
    }

    pub fn with_variables(mut self, variables: HashMap<String, String>) -> Self {
        self.variables = variables;
        self
    }
}

/// The pipeline execution engine.
pub struct Engine {
    config: EngineConfig,
    store: Arc<StateStore>,
    queue: Arc<TaskQueue>,
    runtime: Arc<dyn ContainerRuntime>,
    credentials: Arc<dyn CredentialStore>,
    approvals: ApprovalController,
    cron: Arc<CronScheduler>,
    /// Per-run cancellation handles, keyed by pipeline id.
    cancels: Arc<DashMap<i64, CancellationToken>>,
}

impl Engine {
    pub fn new(
        config: EngineConfig,
        store: Arc<StateStore>,
        runtime: Arc<dyn ContainerRuntime>,
        credentials: Arc<dyn CredentialStore>,
    ) -> Arc<Self> {
        let queue = Arc::new(TaskQueue::new(config.queue_capacity));
        let cron = Arc::new(CronScheduler::new(Arc::clone(&store)));

        Arc::new(Self {
            approvals: ApprovalController::new(Arc::clone(&store)),
            cancels: Arc::new(DashMap::new()),
            queue,
            cron,
            runtime,
            credentials,
            store,
            config,
        })
    }

    pub fn store(&self) -> &Arc<StateStore> {
        &self.store
    }

    pub fn queue_stats(&self) -> QueueStats {
        self.queue.stats()
    }

    /// Starts the worker pool and the cron scheduler, then re-enqueues
    /// tasks that survived a restart.
    pub async fn start(self: &Arc<Self>) -> Result<(), EngineError> {
        let runner = Arc::new(Runner::new(
            Arc::clone(&self.store),
            Arc::clone(&self.runtime),
            Arc::clone(&self.credentials),
            self.config.clone(),
            Arc::clone(&self.cancels),
        ));
        self.queue.start(self.config.workers, runner).await?;

        self.recover_tasks().await?;

        self.cron.reconcile().await?;
        let cron = Arc::clone(&self.cron);
        let trigger: Arc<dyn CronTrigger> = Arc::clone(self) as Arc<dyn CronTrigger>;
        let config = self.config.clone();
        tokio::spawn(async move {
            cron.run(&config, trigger).await;
        });

        info!(workers = self.config.workers, "engine started");
        Ok(())
    }

    /// Stops the cron scheduler and drains the worker pool.
    pub async fn shutdown(&self) {
        self.cron.shutdown();
        self.queue.shutdown().await;
        info!("engine stopped");
    }

    /// Re-enqueues persisted tasks of pending/running pipelines.
    async fn recover_tasks(&self) -> Result<(), EngineError> {
        let tasks = self.store.list_resumable_tasks().await?;
        let recovered = tasks.len();

        for task in tasks {
            if let Err(e) = self.queue.enqueue(task) {
                warn!(error = %e, "failed to re-enqueue recovered task");
            }
        }

        if recovered > 0 {
            info!(recovered, "recovered persisted tasks");
        }
        Ok(())
    }

    /// Creates, persists, and enqueues one pipeline run for a repository.
    ///
    /// Safe to call concurrently; pipeline numbers are allocated under the
    /// repository row lock.
    pub async fn trigger_pipeline(
        &self,
        repo_id: i64,
        opts: TriggerOptions,
    ) -> Result<Pipeline, EngineError> {
        let repo = self
            .store
            .get_repository(repo_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("repository {repo_id}")))?;

        let settings = self.store.get_or_init_pipeline_config(repo_id).await?;
        if settings.content.trim().is_empty() {
            return Err(EngineError::MissingSpec);
        }

        let spec = parse_pipeline(&settings.content)?;

        if settings.disallow_parallel && self.store.has_active_pipeline(repo_id).await? {
            return Err(EngineError::ParallelDisallowed);
        }

        let branch = first_non_empty(&[opts.branch.as_str(), repo.branch.as_str(), "main"]);
        let workflow_name = if spec.name.is_empty() {
            DEFAULT_WORKFLOW_NAME.to_string()
        } else {
            spec.name.clone()
        };

        let new_steps: Vec<NewStep> = spec.steps.iter().map(new_step).collect();
        let labels = HashMap::from([("repo".to_string(), repo.full_name.clone())]);

        let (pipeline, mut task) = self
            .store
            .create_pipeline(
                NewPipeline {
                    repo_id,
                    author: opts.author.clone(),
                    event: opts.event,
                    branch: branch.clone(),
                    r#ref: opts.r#ref.clone(),
                    commit: opts.commit.clone(),
                    message: opts.message.clone(),
                    title: opts.title.clone(),
                    additional_variables: opts.variables.clone(),
                },
                &workflow_name,
                &new_steps,
                labels,
            )
            .await?;

        let payload = build_payload(&pipeline, &repo, &spec, &branch);
        let data = payload.to_bytes().map_err(StoreError::Serialization)?;
        self.store.set_task_data(&task.id, &data).await?;
        task.data = data;

        if let Err(e) = self.queue.enqueue(task) {
            let message = e.to_string();
            warn!(pipeline_id = pipeline.id, error = %message, "enqueue failed, marking pipeline failed");
            self.store
                .finalize_run(pipeline.id, crate::model::Status::Failure, Some(message.as_str()))
                .await?;
            return Err(EngineError::QueueFull);
        }

        info!(
            pipeline_id = pipeline.id,
            number = pipeline.number,
            repo = %repo.full_name,
            event = %pipeline.event,
            "pipeline triggered"
        );

        crate::retention::enforce(
            &self.store,
            &repo,
            &settings,
            Some(spec.workspace.as_str()),
            &self.config.workspace_root,
        )
        .await;

        Ok(pipeline)
    }

    /// Cancels a non-terminal run: interrupts the current container through
    /// the run's cancellation handle and transactionally stamps pipeline,
    /// workflow, and steps as killed.
    pub async fn cancel_pipeline_run(
        &self,
        pipeline_id: i64,
        reason: Option<&str>,
    ) -> Result<(), EngineError> {
        if let Some(handle) = self.cancels.get(&pipeline_id) {
            handle.cancel();
        }

        let reason = reason
            .filter(|r| !r.trim().is_empty())
            .unwrap_or(DEFAULT_CANCEL_MESSAGE);

        match self.store.cancel_pipeline(pipeline_id, reason).await? {
            CancelOutcome::Canceled => {
                info!(pipeline_id, "pipeline canceled");
                Ok(())
            }
            CancelOutcome::AlreadyFinished => Err(EngineError::AlreadyFinished),
        }
    }

    /// Records an approval verdict; an accepted approval re-enqueues the
    /// original task so the run resumes on the worker pool.
    pub async fn submit_step_approval(
        &self,
        repo_id: i64,
        pipeline_id: i64,
        step_pid: i64,
        actor: &str,
        action: ApprovalAction,
        comment: &str,
    ) -> Result<ApprovalState, EngineError> {
        let (state, task) = self
            .approvals
            .submit(repo_id, pipeline_id, step_pid, actor, action, comment)
            .await?;

        if let Some(task) = task {
            self.queue.enqueue(task)?;
        }

        Ok(state)
    }

    /// Persists pipeline settings for a repository, then reconciles cron
    /// entries and opportunistically enforces retention.
    pub async fn upsert_pipeline_settings(
        &self,
        settings: &RepoPipelineConfig,
    ) -> Result<(), EngineError> {
        self.store.upsert_pipeline_config(settings).await?;
        self.cron.reconcile().await?;

        if let Some(repo) = self.store.get_repository(settings.repo_id).await? {
            // A declared workspace root joins the GC candidate roots; a
            // config whose YAML does not parse simply contributes none.
            let spec_root = parse_pipeline(&settings.content)
                .ok()
                .map(|spec| spec.workspace);
            crate::retention::enforce(
                &self.store,
                &repo,
                settings,
                spec_root.as_deref(),
                &self.config.workspace_root,
            )
            .await;
        }

        Ok(())
    }
}

#[async_trait]
impl CronTrigger for Engine {
    async fn fire(&self, firing: CronFiring) {
        let repo = match self.store.get_repository(firing.repo_id).await {
            Ok(Some(repo)) => repo,
            Ok(None) => {
                warn!(repo_id = firing.repo_id, "cron firing for unknown repository");
                return;
            }
            Err(e) => {
                warn!(repo_id = firing.repo_id, error = %e, "cron firing failed to load repository");
                return;
            }
        };

        let author = if repo.owner.is_empty() {
            "cron".to_string()
        } else {
            repo.owner.clone()
        };

        let mut variables = HashMap::from([
            ("CRON_EXPRESSION".to_string(), firing.expression.clone()),
            (
                "CRON_TRIGGERED_AT".to_string(),
                firing.at.to_rfc3339_opts(SecondsFormat::Secs, true),
            ),
            ("CRON_TRIGGERED_BY".to_string(), author.clone()),
        ]);
        if !repo.branch.is_empty() {
            variables.insert("CRON_DEFAULT_BRANCH".to_string(), repo.branch.clone());
        }

        let opts = TriggerOptions {
            event: Event::Cron,
            author,
            branch: repo.branch.clone(),
            variables,
            ..Default::default()
        };

        // Background trigger: errors are logged, never propagated.
        if let Err(e) = self.trigger_pipeline(firing.repo_id, opts).await {
            warn!(repo_id = firing.repo_id, expression = %firing.expression, error = %e, "cron trigger failed");
        }
    }
}

fn first_non_empty(candidates: &[&str]) -> String {
    candidates
        .iter()
        .map(|c| c.trim())
        .find(|c| !c.is_empty())
        .unwrap_or("main")
        .to_string()
}

fn new_step(step: &StepSpec) -> NewStep {
    NewStep {
        name: step.name.clone(),
        kind: step.kind,
        approval: step.approval.as_ref().map(|a| StepApproval {
            message: a.message.clone(),
            approvers: a.approvers.clone(),
            strategy: a.strategy,
            timeout: a.timeout,
            ..Default::default()
        }),
    }
}

/// Freezes the immutable task payload from spec, repo, and pipeline.
fn build_payload(
    pipeline: &Pipeline,
    repo: &crate::model::Repository,
    spec: &PipelineSpec,
    branch: &str,
) -> TaskPayload {
    let steps = spec
        .steps
        .iter()
        .enumerate()
        .map(|(index, step)| {
            let plugin = (!step.settings.is_empty()).then(|| PluginPayload {
                settings: step.settings.clone(),
                volumes: step.volumes.clone(),
                privileged: step.privileged,
            });

            StepPayload {
                pid: index as i64 + 1,
                name: step.name.clone(),
                image: step.image.clone(),
                commands: step.commands.clone(),
                secrets: step.secrets.clone(),
                env: step.env.clone(),
                volumes: step.volumes.clone(),
                privileged: step.privileged,
                kind: step.kind,
                approval: step.approval.as_ref().map(|a| StepApproval {
                    message: a.message.clone(),
                    approvers: a.approvers.clone(),
                    strategy: a.strategy,
                    timeout: a.timeout,
                    ..Default::default()
                }),
                plugin,
                conditions: step.conditions.clone(),
            }
        })
        .collect();

    TaskPayload {
        pipeline_id: pipeline.id,
        repo_id: repo.id,
        branch: branch.to_string(),
        commit: pipeline.commit.clone(),
        repo_url: repo.url.clone(),
        repo_clone: repo.clone_url.clone(),
        repo_branch: repo.branch.clone(),
        workspace_root: spec.workspace.clone(),
        run_name: spec.name.clone(),
        steps,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Repository, Status};
    use crate::runtime::{ContainerSpec, OutputLine, RuntimeError};
    use crate::secrets::MemoryCredentialStore;
    use tokio::sync::mpsc;

    struct NoopRuntime;

    #[async_trait]
    impl ContainerRuntime for NoopRuntime {
        async fn run(
            &self,
            _cancel: CancellationToken,
            _spec: ContainerSpec,
            _lines: mpsc::Sender<OutputLine>,
        ) -> Result<i64, RuntimeError> {
            Ok(0)
        }
    }

    async fn engine_with_repo(content: &str, capacity: usize) -> Arc<Engine> {
        let store = Arc::new(StateStore::in_memory().await.unwrap());
        store
            .upsert_repository(&Repository {
                id: 1,
                owner: "acme".to_string(),
                name: "app".to_string(),
                full_name: "acme/app".to_string(),
                url: "https://git.example.com/acme/app".to_string(),
                clone_url: "https://git.example.com/acme/app.git".to_string(),
                branch: "main".to_string(),
                active: true,
            })
            .await
            .unwrap();

        let mut settings = RepoPipelineConfig::new(1);
        settings.content = content.to_string();
        store.upsert_pipeline_config(&settings).await.unwrap();

        let config = EngineConfig::new()
            .with_queue_capacity(capacity)
            .with_workspace_root(std::env::temp_dir().join("pipeforge-engine-tests"));
        Engine::new(
            config,
            store,
            Arc::new(NoopRuntime),
            Arc::new(MemoryCredentialStore::new()),
        )
    }

    const SIMPLE_SPEC: &str = "
name: build
steps:
  - name: hello
    image: busybox
    commands: [ \"echo hi\" ]
";

    #[tokio::test]
    async fn test_trigger_creates_rows_and_payload() {
        let engine = engine_with_repo(SIMPLE_SPEC, 8).await;

        let pipeline = engine
            .trigger_pipeline(1, TriggerOptions::manual("alice"))
            .await
            .unwrap();

        assert_eq!(pipeline.number, 1);
        assert_eq!(pipeline.status, Status::Pending);
        assert_eq!(pipeline.branch, "main");

        let task = engine
            .store()
            .get_task_by_pipeline(pipeline.id)
            .await
            .unwrap()
            .unwrap();
        let payload = task.payload().unwrap();
        assert_eq!(payload.pipeline_id, pipeline.id);
        assert_eq!(payload.run_name, "build");
        assert_eq!(payload.steps.len(), 1);
        assert_eq!(payload.steps[0].commands, vec!["echo hi"]);

        let workflow = engine
            .store()
            .get_workflow(pipeline.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(workflow.name, "build");
        assert_eq!(workflow.pid, 1);
    }

    #[tokio::test]
    async fn test_trigger_requires_spec_content() {
        let engine = engine_with_repo("", 8).await;
        let err = engine
            .trigger_pipeline(1, TriggerOptions::manual("alice"))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::MissingSpec));
    }

    #[tokio::test]
    async fn test_trigger_surfaces_parse_errors_without_rows() {
        let engine = engine_with_repo("steps: [ { commands: [x] } ]", 8).await;
        let err = engine
            .trigger_pipeline(1, TriggerOptions::manual("alice"))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
        assert_eq!(engine.store().count_pipelines(1).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_disallow_parallel_conflicts() {
        let engine = engine_with_repo(SIMPLE_SPEC, 8).await;

        let mut settings = engine
            .store()
            .get_or_init_pipeline_config(1)
            .await
            .unwrap();
        settings.disallow_parallel = true;
        engine.store().upsert_pipeline_config(&settings).await.unwrap();

        engine
            .trigger_pipeline(1, TriggerOptions::manual("alice"))
            .await
            .unwrap();

        let err = engine
            .trigger_pipeline(1, TriggerOptions::manual("alice"))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::ParallelDisallowed));
    }

    #[tokio::test]
    async fn test_queue_full_marks_pipeline_failed() {
        let engine = engine_with_repo(SIMPLE_SPEC, 1).await;

        // Workers are not started, so the first task occupies the queue.
        engine
            .trigger_pipeline(1, TriggerOptions::manual("alice"))
            .await
            .unwrap();

        let err = engine
            .trigger_pipeline(1, TriggerOptions::manual("alice"))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::QueueFull));

        let failed = engine.store().get_pipeline(2).await.unwrap().unwrap();
        assert_eq!(failed.status, Status::Failure);
        assert!(failed.message.contains("full"));
        assert!(engine
            .store()
            .get_task_by_pipeline(failed.id)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_cancel_unknown_pipeline_is_not_found() {
        let engine = engine_with_repo(SIMPLE_SPEC, 8).await;
        let err = engine.cancel_pipeline_run(99, None).await.unwrap_err();
        assert!(matches!(err, EngineError::Store(StoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_cancel_pending_pipeline_and_idempotence() {
        let engine = engine_with_repo(SIMPLE_SPEC, 8).await;
        let pipeline = engine
            .trigger_pipeline(1, TriggerOptions::manual("alice"))
            .await
            .unwrap();

        engine.cancel_pipeline_run(pipeline.id, None).await.unwrap();
        let killed = engine.store().get_pipeline(pipeline.id).await.unwrap().unwrap();
        assert_eq!(killed.status, Status::Killed);
        assert_eq!(killed.message, DEFAULT_CANCEL_MESSAGE);

        let err = engine
            .cancel_pipeline_run(pipeline.id, None)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::AlreadyFinished));
    }

    #[tokio::test]
    async fn test_retention_trims_after_trigger() {
        let engine = engine_with_repo(SIMPLE_SPEC, 16).await;

        let mut settings = engine
            .store()
            .get_or_init_pipeline_config(1)
            .await
            .unwrap();
        settings.max_records = 3;
        engine.store().upsert_pipeline_config(&settings).await.unwrap();

        for _ in 0..4 {
            engine
                .trigger_pipeline(1, TriggerOptions::manual("alice"))
                .await
                .unwrap();
        }

        assert_eq!(engine.store().count_pipelines(1).await.unwrap(), 3);
    }
}
