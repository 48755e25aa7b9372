//! SQLite-backed state store.
//!
//! All persistent mutations of the engine go through this client. Writes
//! that must be observed together (pipeline creation, cancellation, approval
//! verdicts, retention deletes) are wrapped in transactions; reads are plain
//! pool queries, with hot pipeline rows served from a TTL cache.

use std::collections::HashMap;
use std::str::FromStr;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use thiserror::Error;
use uuid::Uuid;

use crate::model::{
    now_ts, CertificateBinding, Event, LogEntry, LogKind, Pipeline, RepoPipelineConfig,
    Repository, Status, Step, StepApproval, StepKind, Task, Workflow,
};

use super::cache::PipelineCache;
use super::migrations::{MigrationError, MigrationRunner};

/// Errors that can occur during store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Opening the database failed.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// Query execution failed.
    #[error("query failed: {0}")]
    QueryFailed(#[from] sqlx::Error),

    /// A JSON column could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Migration error.
    #[error("migration error: {0}")]
    Migration(#[from] MigrationError),

    /// Referenced row does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// A persisted value failed to decode into its domain type.
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

/// Inputs for one step row at pipeline creation.
#[derive(Debug, Clone)]
pub struct NewStep {
    pub name: String,
    pub kind: StepKind,
    pub approval: Option<StepApproval>,
}

/// Inputs for the pipeline row at creation.
#[derive(Debug, Clone)]
pub struct NewPipeline {
    pub repo_id: i64,
    pub author: String,
    pub event: Event,
    pub branch: String,
    pub r#ref: String,
    pub commit: String,
    pub message: String,
    pub title: String,
    pub additional_variables: HashMap<String, String>,
}

/// Result of a cancellation attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The pipeline and its children were transitioned to killed.
    Canceled,
    /// The pipeline was already terminal; nothing changed.
    AlreadyFinished,
}

/// Persistence shape of a terminal or resuming approval verdict.
#[derive(Debug, Clone)]
pub struct ApprovalOutcome {
    pub pipeline_id: i64,
    pub step_id: i64,
    pub approval: StepApproval,
    pub step_state: Status,
    pub step_error: String,
    pub pipeline_status: Status,
    pub pipeline_message: Option<String>,
    /// When true the pipeline is finalized: workflow stamped, remaining
    /// non-terminal steps failed, and the task row deleted.
    pub finalize: bool,
    pub ts: i64,
}

/// SQLite state store.
pub struct StateStore {
    pool: SqlitePool,
    cache: PipelineCache,
}

impl StateStore {
    /// Opens (creating if missing) the database at `url` and runs
    /// migrations.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(|e| StoreError::ConnectionFailed(e.to_string()))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(std::time::Duration::from_secs(30));

        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await
            .map_err(|e| StoreError::ConnectionFailed(e.to_string()))?;

        let store = Self {
            pool,
            cache: PipelineCache::default(),
        };
        store.migrate().await?;
        Ok(store)
    }

    /// Opens an in-memory database. A single connection keeps every query
    /// on the same memory instance.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| StoreError::ConnectionFailed(e.to_string()))?;

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(|e| StoreError::ConnectionFailed(e.to_string()))?;

        let store = Self {
            pool,
            cache: PipelineCache::default(),
        };
        store.migrate().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Runs schema migrations.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        MigrationRunner::new(self.pool.clone()).run_migrations().await?;
        Ok(())
    }

    // =========================================================================
    // Repositories
    // =========================================================================

    pub async fn upsert_repository(&self, repo: &Repository) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO repositories (id, owner, name, full_name, url, clone_url, branch, active)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (id) DO UPDATE SET
                owner = excluded.owner,
                name = excluded.name,
                full_name = excluded.full_name,
                url = excluded.url,
                clone_url = excluded.clone_url,
                branch = excluded.branch,
                active = excluded.active
            "#,
        )
        .bind(repo.id)
        .bind(&repo.owner)
        .bind(&repo.name)
        .bind(&repo.full_name)
        .bind(&repo.url)
        .bind(&repo.clone_url)
        .bind(&repo.branch)
        .bind(repo.active as i64)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn get_repository(&self, id: i64) -> Result<Option<Repository>, StoreError> {
        let row = sqlx::query(
            "SELECT id, owner, name, full_name, url, clone_url, branch, active
             FROM repositories WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(decode_repository).transpose()
    }

    // =========================================================================
    // Repo pipeline configs
    // =========================================================================

    pub async fn get_pipeline_config(
        &self,
        repo_id: i64,
    ) -> Result<Option<RepoPipelineConfig>, StoreError> {
        let row = sqlx::query(
            "SELECT repo_id, content, dockerfile, cleanup_enabled, retention_days, max_records,
                    disallow_parallel, cron_schedules, cron_enabled, cron_spec,
                    legacy_certificates, created, updated
             FROM repo_pipeline_configs WHERE repo_id = ?",
        )
        .bind(repo_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(decode_config).transpose()
    }

    /// Returns the repo's pipeline configuration, creating the default row
    /// on first access.
    pub async fn get_or_init_pipeline_config(
        &self,
        repo_id: i64,
    ) -> Result<RepoPipelineConfig, StoreError> {
        if let Some(config) = self.get_pipeline_config(repo_id).await? {
            return Ok(config);
        }

        let config = RepoPipelineConfig::new(repo_id);
        sqlx::query(
            "INSERT OR IGNORE INTO repo_pipeline_configs (repo_id, created, updated)
             VALUES (?, ?, ?)",
        )
        .bind(repo_id)
        .bind(config.created)
        .bind(config.updated)
        .execute(&self.pool)
        .await?;

        // Another writer may have raced the insert; re-read the row.
        self.get_pipeline_config(repo_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("pipeline config for repo {repo_id}")))
    }

    /// Persists a pipeline configuration and flips the repository active.
    pub async fn upsert_pipeline_config(
        &self,
        config: &RepoPipelineConfig,
    ) -> Result<(), StoreError> {
        let cron_schedules = serde_json::to_string(&config.cron_schedules)?;
        let certificates = serde_json::to_string(&config.legacy_certificates)?;
        let now = now_ts();

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO repo_pipeline_configs (
                repo_id, content, dockerfile, cleanup_enabled, retention_days, max_records,
                disallow_parallel, cron_schedules, cron_enabled, cron_spec,
                legacy_certificates, created, updated
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (repo_id) DO UPDATE SET
                content = excluded.content,
                dockerfile = excluded.dockerfile,
                cleanup_enabled = excluded.cleanup_enabled,
                retention_days = excluded.retention_days,
                max_records = excluded.max_records,
                disallow_parallel = excluded.disallow_parallel,
                cron_schedules = excluded.cron_schedules,
                cron_enabled = excluded.cron_enabled,
                cron_spec = excluded.cron_spec,
                legacy_certificates = excluded.legacy_certificates,
                updated = excluded.updated
            "#,
        )
        .bind(config.repo_id)
        .bind(&config.content)
        .bind(&config.dockerfile)
        .bind(config.cleanup_enabled as i64)
        .bind(config.retention_days)
        .bind(config.max_records)
        .bind(config.disallow_parallel as i64)
        .bind(&cron_schedules)
        .bind(config.cron_enabled as i64)
        .bind(&config.cron_spec)
        .bind(&certificates)
        .bind(config.created)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        sqlx::query("UPDATE repositories SET active = 1 WHERE id = ?")
            .bind(config.repo_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    pub async fn list_pipeline_configs(&self) -> Result<Vec<RepoPipelineConfig>, StoreError> {
        let rows = sqlx::query(
            "SELECT repo_id, content, dockerfile, cleanup_enabled, retention_days, max_records,
                    disallow_parallel, cron_schedules, cron_enabled, cron_spec,
                    legacy_certificates, created, updated
             FROM repo_pipeline_configs ORDER BY repo_id",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(decode_config).collect()
    }

    // =========================================================================
    // Pipeline creation
    // =========================================================================

    /// Creates a pipeline with its workflow, steps, and task row in one
    /// transaction. The transaction opens with a write against the
    /// repository row, which serializes `number` allocation for the repo
    /// under SQLite's single-writer rule.
    pub async fn create_pipeline(
        &self,
        new: NewPipeline,
        workflow_name: &str,
        steps: &[NewStep],
        labels: HashMap<String, String>,
    ) -> Result<(Pipeline, Task), StoreError> {
        let now = now_ts();
        let variables_json = serde_json::to_string(&new.additional_variables)?;
        let labels_json = serde_json::to_string(&labels)?;

        let mut tx = self.pool.begin().await?;

        let locked = sqlx::query("UPDATE repositories SET active = active WHERE id = ?")
            .bind(new.repo_id)
            .execute(&mut *tx)
            .await?;
        if locked.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("repository {}", new.repo_id)));
        }

        let (number,): (i64,) =
            sqlx::query_as("SELECT COALESCE(MAX(number), 0) + 1 FROM pipelines WHERE repo_id = ?")
                .bind(new.repo_id)
                .fetch_one(&mut *tx)
                .await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO pipelines (
                repo_id, number, author, event, status, branch, "ref", "commit",
                message, title, created, started, finished, updated, additional_variables
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0, 0, ?, ?)
            "#,
        )
        .bind(new.repo_id)
        .bind(number)
        .bind(&new.author)
        .bind(new.event.as_str())
        .bind(Status::Pending.as_str())
        .bind(&new.branch)
        .bind(&new.r#ref)
        .bind(&new.commit)
        .bind(&new.message)
        .bind(&new.title)
        .bind(now)
        .bind(now)
        .bind(&variables_json)
        .execute(&mut *tx)
        .await?;
        let pipeline_id = inserted.last_insert_rowid();

        sqlx::query(
            "INSERT INTO workflows (pipeline_id, pid, name, state, started, finished)
             VALUES (?, 1, ?, ?, 0, 0)",
        )
        .bind(pipeline_id)
        .bind(workflow_name)
        .bind(Status::Pending.as_str())
        .execute(&mut *tx)
        .await?;

        for (index, step) in steps.iter().enumerate() {
            let approval_json = step
                .approval
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?;

            sqlx::query(
                "INSERT INTO steps (pipeline_id, pid, ppid, uuid, name, type, state, approval)
                 VALUES (?, ?, 1, ?, ?, ?, ?, ?)",
            )
            .bind(pipeline_id)
            .bind(index as i64 + 1)
            .bind(Uuid::new_v4().to_string())
            .bind(&step.name)
            .bind(step.kind.as_str())
            .bind(Status::Pending.as_str())
            .bind(approval_json)
            .execute(&mut *tx)
            .await?;
        }

        let task_id = Task::generate_id();
        sqlx::query(
            "INSERT INTO tasks (id, pipeline_id, repo_id, name, data, labels)
             VALUES (?, ?, ?, ?, x'', ?)",
        )
        .bind(&task_id)
        .bind(pipeline_id)
        .bind(new.repo_id)
        .bind(workflow_name)
        .bind(&labels_json)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        let pipeline = Pipeline {
            id: pipeline_id,
            repo_id: new.repo_id,
            number,
            author: new.author,
            event: new.event,
            status: Status::Pending,
            branch: new.branch,
            r#ref: new.r#ref,
            commit: new.commit,
            message: new.message,
            title: new.title,
            created: now,
            started: 0,
            finished: 0,
            updated: now,
            additional_variables: new.additional_variables,
        };
        let task = Task {
            id: task_id,
            pipeline_id,
            repo_id: pipeline.repo_id,
            name: workflow_name.to_string(),
            data: Vec::new(),
            labels,
            run_on: Vec::new(),
            dependencies: Vec::new(),
            dep_status: HashMap::new(),
        };

        Ok((pipeline, task))
    }

    // =========================================================================
    // Pipeline reads & transitions
    // =========================================================================

    pub async fn get_pipeline(&self, id: i64) -> Result<Option<Pipeline>, StoreError> {
        if let Some(pipeline) = self.cache.get(id) {
            return Ok(Some(pipeline));
        }

        let row = sqlx::query(
            r#"SELECT id, repo_id, number, author, event, status, branch, "ref", "commit",
                      message, title, created, started, finished, updated, additional_variables
               FROM pipelines WHERE id = ?"#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        let pipeline = row.map(decode_pipeline).transpose()?;
        if let Some(ref p) = pipeline {
            self.cache.put(p.clone());
        }
        Ok(pipeline)
    }

    pub async fn get_pipeline_status(&self, id: i64) -> Result<Option<Status>, StoreError> {
        let row = sqlx::query("SELECT status FROM pipelines WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|r| {
            let status: String = r.get("status");
            Status::parse(&status)
                .ok_or_else(|| StoreError::Corrupt(format!("pipeline status '{status}'")))
        })
        .transpose()
    }

    /// Transitions pipeline and workflow to running with `started` stamped.
    pub async fn mark_pipeline_running(&self, id: i64) -> Result<(), StoreError> {
        let now = now_ts();
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "UPDATE pipelines SET status = ?, started = CASE WHEN started = 0 THEN ? ELSE started END,
                    updated = ? WHERE id = ?",
        )
        .bind(Status::Running.as_str())
        .bind(now)
        .bind(now)
        .bind(id)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "UPDATE workflows SET state = ?, started = CASE WHEN started = 0 THEN ? ELSE started END
             WHERE pipeline_id = ?",
        )
        .bind(Status::Running.as_str())
        .bind(now)
        .bind(id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        self.cache.invalidate(id);
        Ok(())
    }

    /// Finalizes a run: stamps any still-pending steps with the terminal
    /// status, marks pipeline and workflow finished, and removes the task
    /// row, all in one transaction.
    pub async fn finalize_run(
        &self,
        id: i64,
        status: Status,
        message: Option<&str>,
    ) -> Result<(), StoreError> {
        let now = now_ts();
        let mut tx = self.pool.begin().await?;

        sqlx::query("UPDATE steps SET state = ?, finished = ? WHERE pipeline_id = ? AND state = ?")
            .bind(status.as_str())
            .bind(now)
            .bind(id)
            .bind(Status::Pending.as_str())
            .execute(&mut *tx)
            .await?;

        match message {
            Some(message) => {
                sqlx::query(
                    "UPDATE pipelines SET status = ?, message = ?, finished = ?, updated = ? WHERE id = ?",
                )
                .bind(status.as_str())
                .bind(message)
                .bind(now)
                .bind(now)
                .bind(id)
                .execute(&mut *tx)
                .await?;
            }
            None => {
                sqlx::query(
                    "UPDATE pipelines SET status = ?, finished = ?, updated = ? WHERE id = ?",
                )
                .bind(status.as_str())
                .bind(now)
                .bind(now)
                .bind(id)
                .execute(&mut *tx)
                .await?;
            }
        }

        sqlx::query("UPDATE workflows SET state = ?, finished = ? WHERE pipeline_id = ?")
            .bind(status.as_str())
            .bind(now)
            .bind(id)
            .execute(&mut *tx)
            .await?;

        sqlx::query("DELETE FROM tasks WHERE pipeline_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        self.cache.invalidate(id);
        Ok(())
    }

    /// Cancels a run: pipeline, workflow, and every non-terminal step go to
    /// killed and the task row is removed, atomically. Terminal pipelines
    /// are left untouched.
    pub async fn cancel_pipeline(
        &self,
        id: i64,
        reason: &str,
    ) -> Result<CancelOutcome, StoreError> {
        let now = now_ts();
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query("SELECT status FROM pipelines WHERE id = ?")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("pipeline {id}")))?;
        let status: String = row.get("status");
        let status = Status::parse(&status)
            .ok_or_else(|| StoreError::Corrupt(format!("pipeline status '{status}'")))?;
        if status.is_terminal() {
            return Ok(CancelOutcome::AlreadyFinished);
        }

        sqlx::query(
            "UPDATE pipelines SET status = ?, message = ?, finished = ?, updated = ? WHERE id = ?",
        )
        .bind(Status::Killed.as_str())
        .bind(reason)
        .bind(now)
        .bind(now)
        .bind(id)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "UPDATE workflows SET state = ?, finished = ? WHERE pipeline_id = ?
             AND state IN ('pending', 'running', 'blocked')",
        )
        .bind(Status::Killed.as_str())
        .bind(now)
        .bind(id)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "UPDATE steps SET state = ?, finished = ? WHERE pipeline_id = ?
             AND state IN ('pending', 'running', 'blocked')",
        )
        .bind(Status::Killed.as_str())
        .bind(now)
        .bind(id)
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM tasks WHERE pipeline_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        self.cache.invalidate(id);
        Ok(CancelOutcome::Canceled)
    }

    pub async fn set_pipeline_commit(&self, id: i64, commit: &str) -> Result<(), StoreError> {
        sqlx::query(r#"UPDATE pipelines SET "commit" = ?, updated = ? WHERE id = ?"#)
            .bind(commit)
            .bind(now_ts())
            .bind(id)
            .execute(&self.pool)
            .await?;

        self.cache.invalidate(id);
        Ok(())
    }

    /// Whether any non-terminal pipeline exists for the repository.
    pub async fn has_active_pipeline(&self, repo_id: i64) -> Result<bool, StoreError> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM pipelines
             WHERE repo_id = ? AND status IN ('pending', 'running', 'blocked')",
        )
        .bind(repo_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(count > 0)
    }

    pub async fn count_pipelines(&self, repo_id: i64) -> Result<i64, StoreError> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM pipelines WHERE repo_id = ?")
            .bind(repo_id)
            .fetch_one(&self.pool)
            .await?;

        Ok(count)
    }

    pub async fn list_pipeline_ids(&self, repo_id: i64) -> Result<Vec<i64>, StoreError> {
        let rows: Vec<(i64,)> = sqlx::query_as("SELECT id FROM pipelines WHERE repo_id = ?")
            .bind(repo_id)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    /// Pipeline ids beyond the newest `keep`, ordered newest first, capped
    /// at `cap` rows.
    pub async fn stale_pipeline_ids(
        &self,
        repo_id: i64,
        keep: i64,
        cap: i64,
    ) -> Result<Vec<i64>, StoreError> {
        let rows: Vec<(i64,)> = sqlx::query_as(
            "SELECT id FROM pipelines WHERE repo_id = ?
             ORDER BY created DESC, id DESC LIMIT ? OFFSET ?",
        )
        .bind(repo_id)
        .bind(cap)
        .bind(keep)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    /// Deletes pipelines with all their children (logs, steps, workflows,
    /// tasks) in one transaction.
    pub async fn delete_pipelines(&self, ids: &[i64]) -> Result<(), StoreError> {
        if ids.is_empty() {
            return Ok(());
        }

        let placeholders = vec!["?"; ids.len()].join(", ");
        let mut tx = self.pool.begin().await?;

        let logs_sql = format!(
            "DELETE FROM log_entries WHERE step_id IN
             (SELECT id FROM steps WHERE pipeline_id IN ({placeholders}))"
        );
        let mut query = sqlx::query(&logs_sql);
        for id in ids {
            query = query.bind(id);
        }
        query.execute(&mut *tx).await?;

        for table in ["steps", "workflows", "tasks"] {
            let sql = format!("DELETE FROM {table} WHERE pipeline_id IN ({placeholders})");
            let mut query = sqlx::query(&sql);
            for id in ids {
                query = query.bind(id);
            }
            query.execute(&mut *tx).await?;
        }

        let pipelines_sql = format!("DELETE FROM pipelines WHERE id IN ({placeholders})");
        let mut query = sqlx::query(&pipelines_sql);
        for id in ids {
            query = query.bind(id);
        }
        query.execute(&mut *tx).await?;

        tx.commit().await?;
        for id in ids {
            self.cache.invalidate(*id);
        }
        Ok(())
    }

    // =========================================================================
    // Workflows
    // =========================================================================

    pub async fn get_workflow(&self, pipeline_id: i64) -> Result<Option<Workflow>, StoreError> {
        let row = sqlx::query(
            "SELECT id, pipeline_id, pid, name, state, started, finished
             FROM workflows WHERE pipeline_id = ? ORDER BY pid LIMIT 1",
        )
        .bind(pipeline_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(decode_workflow).transpose()
    }

    // =========================================================================
    // Steps
    // =========================================================================

    pub async fn list_steps(&self, pipeline_id: i64) -> Result<Vec<Step>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, pipeline_id, pid, ppid, uuid, name, type, state, started, finished,
                    exit_code, failure, error, approval
             FROM steps WHERE pipeline_id = ? ORDER BY pid",
        )
        .bind(pipeline_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(decode_step).collect()
    }

    pub async fn get_step(&self, step_id: i64) -> Result<Option<Step>, StoreError> {
        let row = sqlx::query(
            "SELECT id, pipeline_id, pid, ppid, uuid, name, type, state, started, finished,
                    exit_code, failure, error, approval
             FROM steps WHERE id = ?",
        )
        .bind(step_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(decode_step).transpose()
    }

    pub async fn get_step_by_pid(
        &self,
        pipeline_id: i64,
        pid: i64,
    ) -> Result<Option<Step>, StoreError> {
        let row = sqlx::query(
            "SELECT id, pipeline_id, pid, ppid, uuid, name, type, state, started, finished,
                    exit_code, failure, error, approval
             FROM steps WHERE pipeline_id = ? AND pid = ?",
        )
        .bind(pipeline_id)
        .bind(pid)
        .fetch_optional(&self.pool)
        .await?;

        row.map(decode_step).transpose()
    }

    pub async fn mark_step_running(&self, step_id: i64) -> Result<(), StoreError> {
        let now = now_ts();
        sqlx::query(
            "UPDATE steps SET state = ?, started = CASE WHEN started = 0 THEN ? ELSE started END
             WHERE id = ?",
        )
        .bind(Status::Running.as_str())
        .bind(now)
        .bind(step_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn finish_step(
        &self,
        step_id: i64,
        state: Status,
        exit_code: i64,
        failure: &str,
        error: &str,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE steps SET state = ?, finished = ?, exit_code = ?, failure = ?, error = ?
             WHERE id = ?",
        )
        .bind(state.as_str())
        .bind(now_ts())
        .bind(exit_code)
        .bind(failure)
        .bind(error)
        .bind(step_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn update_step_approval(
        &self,
        step_id: i64,
        approval: &StepApproval,
    ) -> Result<(), StoreError> {
        let json = serde_json::to_string(approval)?;
        sqlx::query("UPDATE steps SET approval = ? WHERE id = ?")
            .bind(&json)
            .bind(step_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    // =========================================================================
    // Approvals
    // =========================================================================

    /// Persists a newly-requested approval: step blocked with the request
    /// metadata, pipeline blocked with the approval message.
    pub async fn apply_approval_request(
        &self,
        pipeline_id: i64,
        step_id: i64,
        approval: &StepApproval,
        message: &str,
    ) -> Result<(), StoreError> {
        let json = serde_json::to_string(approval)?;
        let now = now_ts();
        let mut tx = self.pool.begin().await?;

        sqlx::query("UPDATE steps SET state = ?, approval = ? WHERE id = ?")
            .bind(Status::Blocked.as_str())
            .bind(&json)
            .bind(step_id)
            .execute(&mut *tx)
            .await?;

        sqlx::query("UPDATE pipelines SET status = ?, message = ?, updated = ? WHERE id = ?")
            .bind(Status::Blocked.as_str())
            .bind(message)
            .bind(now)
            .bind(pipeline_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        self.cache.invalidate(pipeline_id);
        Ok(())
    }

    /// Persists an approval verdict. When `finalize` is set the pipeline is
    /// closed out (workflow stamped, remaining steps failed, task removed);
    /// otherwise the pipeline returns to running for resumption.
    pub async fn apply_approval_outcome(
        &self,
        outcome: &ApprovalOutcome,
    ) -> Result<(), StoreError> {
        let json = serde_json::to_string(&outcome.approval)?;
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "UPDATE steps SET state = ?, finished = ?, error = ?, approval = ? WHERE id = ?",
        )
        .bind(outcome.step_state.as_str())
        .bind(outcome.ts)
        .bind(&outcome.step_error)
        .bind(&json)
        .bind(outcome.step_id)
        .execute(&mut *tx)
        .await?;

        match &outcome.pipeline_message {
            Some(message) => {
                sqlx::query("UPDATE pipelines SET status = ?, message = ?, updated = ? WHERE id = ?")
                    .bind(outcome.pipeline_status.as_str())
                    .bind(message)
                    .bind(outcome.ts)
                    .bind(outcome.pipeline_id)
                    .execute(&mut *tx)
                    .await?;
            }
            None => {
                sqlx::query("UPDATE pipelines SET status = ?, updated = ? WHERE id = ?")
                    .bind(outcome.pipeline_status.as_str())
                    .bind(outcome.ts)
                    .bind(outcome.pipeline_id)
                    .execute(&mut *tx)
                    .await?;
            }
        }

        if outcome.finalize {
            sqlx::query("UPDATE pipelines SET finished = ? WHERE id = ?")
                .bind(outcome.ts)
                .bind(outcome.pipeline_id)
                .execute(&mut *tx)
                .await?;

            sqlx::query("UPDATE workflows SET state = ?, finished = ? WHERE pipeline_id = ?")
                .bind(outcome.pipeline_status.as_str())
                .bind(outcome.ts)
                .bind(outcome.pipeline_id)
                .execute(&mut *tx)
                .await?;

            sqlx::query(
                "UPDATE steps SET state = ?, finished = ? WHERE pipeline_id = ?
                 AND state IN ('pending', 'running', 'blocked')",
            )
            .bind(Status::Failure.as_str())
            .bind(outcome.ts)
            .bind(outcome.pipeline_id)
            .execute(&mut *tx)
            .await?;

            sqlx::query("DELETE FROM tasks WHERE pipeline_id = ?")
                .bind(outcome.pipeline_id)
                .execute(&mut *tx)
                .await?;
        } else {
            sqlx::query("UPDATE workflows SET state = ? WHERE pipeline_id = ?")
                .bind(outcome.pipeline_status.as_str())
                .bind(outcome.pipeline_id)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        self.cache.invalidate(outcome.pipeline_id);
        Ok(())
    }

    // =========================================================================
    // Tasks
    // =========================================================================

    pub async fn get_task(&self, id: &str) -> Result<Option<Task>, StoreError> {
        let row = sqlx::query(
            "SELECT id, pipeline_id, repo_id, name, data, labels, run_on, dependencies, dep_status
             FROM tasks WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(decode_task).transpose()
    }

    pub async fn get_task_by_pipeline(&self, pipeline_id: i64) -> Result<Option<Task>, StoreError> {
        let row = sqlx::query(
            "SELECT id, pipeline_id, repo_id, name, data, labels, run_on, dependencies, dep_status
             FROM tasks WHERE pipeline_id = ?",
        )
        .bind(pipeline_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(decode_task).transpose()
    }

    pub async fn set_task_data(&self, id: &str, data: &[u8]) -> Result<(), StoreError> {
        sqlx::query("UPDATE tasks SET data = ? WHERE id = ?")
            .bind(data)
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    pub async fn delete_task(&self, id: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM tasks WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Tasks whose pipeline is pending or running; candidates for
    /// re-enqueueing after a restart. Blocked pipelines keep their task row
    /// but wait for their approval verdict.
    pub async fn list_resumable_tasks(&self) -> Result<Vec<Task>, StoreError> {
        let rows = sqlx::query(
            "SELECT t.id, t.pipeline_id, t.repo_id, t.name, t.data, t.labels, t.run_on,
                    t.dependencies, t.dep_status
             FROM tasks t JOIN pipelines p ON p.id = t.pipeline_id
             WHERE p.status IN ('pending', 'running')
             ORDER BY p.created",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(decode_task).collect()
    }

    // =========================================================================
    // Logs
    // =========================================================================

    pub async fn append_log_line(
        &self,
        step_id: i64,
        line: i64,
        kind: LogKind,
        data: &[u8],
    ) -> Result<(), StoreError> {
        let now = now_ts();
        sqlx::query(
            "INSERT INTO log_entries (step_id, time, line, type, data, created)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(step_id)
        .bind(now)
        .bind(line)
        .bind(kind.as_str())
        .bind(data)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn max_log_line(&self, step_id: i64) -> Result<i64, StoreError> {
        let (max,): (i64,) =
            sqlx::query_as("SELECT COALESCE(MAX(line), 0) FROM log_entries WHERE step_id = ?")
                .bind(step_id)
                .fetch_one(&self.pool)
                .await?;

        Ok(max)
    }

    pub async fn list_step_logs(&self, step_id: i64) -> Result<Vec<LogEntry>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, step_id, time, line, type, data, created
             FROM log_entries WHERE step_id = ? ORDER BY line",
        )
        .bind(step_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(decode_log_entry).collect()
    }
}

// =============================================================================
// Row decoding
// =============================================================================

fn decode_repository(row: sqlx::sqlite::SqliteRow) -> Result<Repository, StoreError> {
    let active: i64 = row.get("active");
    Ok(Repository {
        id: row.get("id"),
        owner: row.get("owner"),
        name: row.get("name"),
        full_name: row.get("full_name"),
        url: row.get("url"),
        clone_url: row.get("clone_url"),
        branch: row.get("branch"),
        active: active != 0,
    })
}

fn decode_config(row: sqlx::sqlite::SqliteRow) -> Result<RepoPipelineConfig, StoreError> {
    let cron_schedules: String = row.get("cron_schedules");
    let cron_schedules: Vec<String> = serde_json::from_str(&cron_schedules)?;
    let certificates: String = row.get("legacy_certificates");
    let legacy_certificates: Vec<CertificateBinding> = serde_json::from_str(&certificates)?;
    let cleanup_enabled: i64 = row.get("cleanup_enabled");
    let disallow_parallel: i64 = row.get("disallow_parallel");
    let cron_enabled: i64 = row.get("cron_enabled");

    Ok(RepoPipelineConfig {
        repo_id: row.get("repo_id"),
        content: row.get("content"),
        dockerfile: row.get("dockerfile"),
        cleanup_enabled: cleanup_enabled != 0,
        retention_days: row.get("retention_days"),
        max_records: row.get("max_records"),
        disallow_parallel: disallow_parallel != 0,
        cron_schedules,
        cron_enabled: cron_enabled != 0,
        cron_spec: row.get("cron_spec"),
        legacy_certificates,
        created: row.get("created"),
        updated: row.get("updated"),
    })
}

fn decode_pipeline(row: sqlx::sqlite::SqliteRow) -> Result<Pipeline, StoreError> {
    let event: String = row.get("event");
    let status: String = row.get("status");
    let variables: String = row.get("additional_variables");

    Ok(Pipeline {
        id: row.get("id"),
        repo_id: row.get("repo_id"),
        number: row.get("number"),
        author: row.get("author"),
        event: Event::parse(&event)
            .ok_or_else(|| StoreError::Corrupt(format!("pipeline event '{event}'")))?,
        status: Status::parse(&status)
            .ok_or_else(|| StoreError::Corrupt(format!("pipeline status '{status}'")))?,
        branch: row.get("branch"),
        r#ref: row.get("ref"),
        commit: row.get("commit"),
        message: row.get("message"),
        title: row.get("title"),
        created: row.get("created"),
        started: row.get("started"),
        finished: row.get("finished"),
        updated: row.get("updated"),
        additional_variables: serde_json::from_str(&variables)?,
    })
}

fn decode_workflow(row: sqlx::sqlite::SqliteRow) -> Result<Workflow, StoreError> {
    let state: String = row.get("state");
    Ok(Workflow {
        id: row.get("id"),
        pipeline_id: row.get("pipeline_id"),
        pid: row.get("pid"),
        name: row.get("name"),
        state: Status::parse(&state)
            .ok_or_else(|| StoreError::Corrupt(format!("workflow state '{state}'")))?,
        started: row.get("started"),
        finished: row.get("finished"),
    })
}

fn decode_step(row: sqlx::sqlite::SqliteRow) -> Result<Step, StoreError> {
    let kind: String = row.get("type");
    let state: String = row.get("state");
    let approval: Option<String> = row.get("approval");
    let approval = approval
        .filter(|a| !a.is_empty())
        .map(|a| serde_json::from_str::<StepApproval>(&a))
        .transpose()?;

    Ok(Step {
        id: row.get("id"),
        pipeline_id: row.get("pipeline_id"),
        pid: row.get("pid"),
        ppid: row.get("ppid"),
        uuid: row.get("uuid"),
        name: row.get("name"),
        kind: StepKind::parse(&kind)
            .ok_or_else(|| StoreError::Corrupt(format!("step type '{kind}'")))?,
        state: Status::parse(&state)
            .ok_or_else(|| StoreError::Corrupt(format!("step state '{state}'")))?,
        started: row.get("started"),
        finished: row.get("finished"),
        exit_code: row.get("exit_code"),
        failure: row.get("failure"),
        error: row.get("error"),
        approval,
    })
}

fn decode_task(row: sqlx::sqlite::SqliteRow) -> Result<Task, StoreError> {
    let labels: String = row.get("labels");
    let run_on: String = row.get("run_on");
    let dependencies: String = row.get("dependencies");
    let dep_status: String = row.get("dep_status");

    Ok(Task {
        id: row.get("id"),
        pipeline_id: row.get("pipeline_id"),
        repo_id: row.get("repo_id"),
        name: row.get("name"),
        data: row.get("data"),
        labels: serde_json::from_str(&labels)?,
        run_on: serde_json::from_str(&run_on)?,
        dependencies: serde_json::from_str(&dependencies)?,
        dep_status: serde_json::from_str(&dep_status)?,
    })
}

fn decode_log_entry(row: sqlx::sqlite::SqliteRow) -> Result<LogEntry, StoreError> {
    let kind: String = row.get("type");
    Ok(LogEntry {
        id: row.get("id"),
        step_id: row.get("step_id"),
        time: row.get("time"),
        line: row.get("line"),
        kind: LogKind::parse(&kind)
            .ok_or_else(|| StoreError::Corrupt(format!("log type '{kind}'")))?,
        data: row.get("data"),
        created: row.get("created"),
    })
}
