//! Core data model for the pipeline engine.
//!
//! This module defines the persisted row types and their state machines:
//!
//! - `Repository`: the source repository a pipeline runs for (read-only here)
//! - `RepoPipelineConfig`: per-repository pipeline YAML and retention settings
//! - `Pipeline`: one run, identified by `(repo_id, number)`
//! - `Workflow`: the single grouping node inside a pipeline
//! - `Step`: sequential unit of work (commands or approval)
//! - `Task`: the schedulable unit carried by the queue
//! - `LogEntry`: one persisted output line of a step
//!
//! Timestamps are seconds since the Unix epoch throughout.

mod payload;

pub use payload::{PluginPayload, StepConditions, StepPayload, TaskPayload};

use std::collections::HashMap;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use rand::RngCore;
use serde::{Deserialize, Serialize};

/// Returns the current time as seconds since the Unix epoch.
pub fn now_ts() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Lifecycle status shared by pipelines, workflows, and steps.
///
/// A pipeline starts `pending`, becomes `running` when a worker picks up its
/// task, may oscillate through `blocked` while awaiting an approval verdict,
/// and ends in one of the terminal states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Pending,
    Running,
    Blocked,
    Success,
    Failure,
    Killed,
    Error,
    Skipped,
}

impl Status {
    /// Returns the canonical lowercase name used in persistence.
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Pending => "pending",
            Status::Running => "running",
            Status::Blocked => "blocked",
            Status::Success => "success",
            Status::Failure => "failure",
            Status::Killed => "killed",
            Status::Error => "error",
            Status::Skipped => "skipped",
        }
    }

    /// Parses a persisted status string.
    pub fn parse(s: &str) -> Option<Status> {
        match s {
            "pending" => Some(Status::Pending),
            "running" => Some(Status::Running),
            "blocked" => Some(Status::Blocked),
            "success" => Some(Status::Success),
            "failure" => Some(Status::Failure),
            "killed" => Some(Status::Killed),
            "error" => Some(Status::Error),
            "skipped" => Some(Status::Skipped),
            _ => None,
        }
    }

    /// Whether no further transitions are possible from this status.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Status::Success | Status::Failure | Status::Killed | Status::Error | Status::Skipped
        )
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What caused a pipeline to be created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Event {
    Manual,
    Cron,
    Push,
    Tag,
    Release,
    Deploy,
    Pull,
    PullMetadata,
    PullClosed,
}

impl Event {
    pub fn as_str(&self) -> &'static str {
        match self {
            Event::Manual => "manual",
            Event::Cron => "cron",
            Event::Push => "push",
            Event::Tag => "tag",
            Event::Release => "release",
            Event::Deploy => "deploy",
            Event::Pull => "pull",
            Event::PullMetadata => "pull_metadata",
            Event::PullClosed => "pull_closed",
        }
    }

    pub fn parse(s: &str) -> Option<Event> {
        match s {
            "manual" => Some(Event::Manual),
            "cron" => Some(Event::Cron),
            "push" => Some(Event::Push),
            "tag" => Some(Event::Tag),
            "release" => Some(Event::Release),
            "deploy" => Some(Event::Deploy),
            "pull" => Some(Event::Pull),
            "pull_metadata" => Some(Event::PullMetadata),
            "pull_closed" => Some(Event::PullClosed),
            _ => None,
        }
    }
}

impl std::fmt::Display for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of a pipeline step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepKind {
    #[default]
    Commands,
    Approval,
}

impl StepKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepKind::Commands => "commands",
            StepKind::Approval => "approval",
        }
    }

    pub fn parse(s: &str) -> Option<StepKind> {
        match s {
            "commands" => Some(StepKind::Commands),
            "approval" => Some(StepKind::Approval),
            _ => None,
        }
    }
}

/// A source repository, owned by the surrounding system; the engine only
/// reads it and flips `active` when a pipeline configuration is persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Repository {
    pub id: i64,
    pub owner: String,
    pub name: String,
    pub full_name: String,
    /// Web URL of the repository.
    pub url: String,
    /// URL used for cloning (http(s) or ssh).
    pub clone_url: String,
    /// Default branch.
    pub branch: String,
    pub active: bool,
}

/// A repo-scoped credential binding: an alias usable in pipeline steps,
/// resolved against the system credential store by id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateBinding {
    pub alias: String,
    pub credential_id: i64,
}

/// Per-repository pipeline configuration, created on first access.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepoPipelineConfig {
    pub repo_id: i64,
    /// YAML source of the pipeline.
    pub content: String,
    /// Fallback Dockerfile text injected into workspaces at build time.
    pub dockerfile: String,
    pub cleanup_enabled: bool,
    pub retention_days: i64,
    pub max_records: i64,
    pub disallow_parallel: bool,
    /// Ordered set of cron expressions (deduplicated, trimmed).
    pub cron_schedules: Vec<String>,
    /// Legacy single-schedule flag, kept only as a migration input.
    pub cron_enabled: bool,
    /// Legacy single cron expression, kept only as a migration input.
    pub cron_spec: String,
    /// Repo-scoped credential bindings.
    pub legacy_certificates: Vec<CertificateBinding>,
    pub created: i64,
    pub updated: i64,
}

impl RepoPipelineConfig {
    /// Creates the default configuration for a repository.
    pub fn new(repo_id: i64) -> Self {
        let now = now_ts();
        Self {
            repo_id,
            content: String::new(),
            dockerfile: String::new(),
            cleanup_enabled: true,
            retention_days: 0,
            max_records: 0,
            disallow_parallel: false,
            cron_schedules: Vec::new(),
            cron_enabled: false,
            cron_spec: String::new(),
            legacy_certificates: Vec::new(),
            created: now,
            updated: now,
        }
    }

    /// Effective cron schedules after the legacy upgrade: when the array is
    /// empty and the legacy flag is set, the single legacy spec applies.
    pub fn effective_cron_schedules(&self) -> Vec<String> {
        if !self.cron_schedules.is_empty() {
            return self.cron_schedules.clone();
        }
        if self.cron_enabled && !self.cron_spec.trim().is_empty() {
            return vec![self.cron_spec.clone()];
        }
        Vec::new()
    }
}

/// One execution of a pipeline for a repository.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pipeline {
    pub id: i64,
    pub repo_id: i64,
    /// Monotonically increasing per repository, starting at 1.
    pub number: i64,
    pub author: String,
    pub event: Event,
    pub status: Status,
    pub branch: String,
    pub r#ref: String,
    pub commit: String,
    pub message: String,
    pub title: String,
    pub created: i64,
    pub started: i64,
    pub finished: i64,
    pub updated: i64,
    /// Extra key→value pairs merged into the per-run environment.
    pub additional_variables: HashMap<String, String>,
}

/// The single grouping node inside a pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub id: i64,
    pub pipeline_id: i64,
    /// 1-based ordinal inside the pipeline.
    pub pid: i64,
    pub name: String,
    pub state: Status,
    pub started: i64,
    pub finished: i64,
}

/// How an approval is finalized when multiple approvers are configured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalStrategy {
    /// A single approve decision finalizes the approval.
    #[default]
    Any,
    /// Every configured approver must approve.
    All,
}

impl ApprovalStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApprovalStrategy::Any => "any",
            ApprovalStrategy::All => "all",
        }
    }
}

/// State of an approval gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalState {
    #[default]
    Pending,
    Approved,
    Rejected,
    Expired,
}

impl ApprovalState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ApprovalState::Pending)
    }
}

/// The action an approver took.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalAction {
    Approve,
    Reject,
}

/// One recorded approver verdict.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalDecision {
    pub user: String,
    pub action: ApprovalAction,
    #[serde(default)]
    pub comment: String,
    pub timestamp: i64,
}

/// Approval metadata attached to approval-type steps.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StepApproval {
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub approvers: Vec<String>,
    #[serde(default)]
    pub strategy: ApprovalStrategy,
    /// Seconds until the pending approval expires; 0 disables expiry.
    #[serde(default)]
    pub timeout: i64,
    #[serde(default)]
    pub state: ApprovalState,
    #[serde(default)]
    pub requested_at: i64,
    #[serde(default)]
    pub requested_by: String,
    #[serde(default)]
    pub expires_at: i64,
    #[serde(default)]
    pub finalized_at: i64,
    #[serde(default)]
    pub finalized_by: String,
    #[serde(default)]
    pub decisions: Vec<ApprovalDecision>,
}

impl StepApproval {
    /// Whether `user` is allowed to decide. An empty approver list means
    /// anyone may decide.
    pub fn allows(&self, user: &str) -> bool {
        self.approvers.is_empty()
            || self
                .approvers
                .iter()
                .any(|a| a.eq_ignore_ascii_case(user))
    }

    /// Records a decision, replacing any earlier decision by the same user
    /// (case-insensitive).
    pub fn record_decision(&mut self, decision: ApprovalDecision) {
        self.decisions
            .retain(|d| !d.user.eq_ignore_ascii_case(&decision.user));
        self.decisions.push(decision);
    }

    /// Whether every configured approver has at least one approve decision.
    pub fn all_approved(&self) -> bool {
        self.approvers.iter().all(|approver| {
            self.decisions.iter().any(|d| {
                d.user.eq_ignore_ascii_case(approver) && d.action == ApprovalAction::Approve
            })
        })
    }
}

/// A sequential child of the pipeline's workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub id: i64,
    pub pipeline_id: i64,
    /// 1-based ordinal inside the workflow.
    pub pid: i64,
    /// Parent workflow pid.
    pub ppid: i64,
    pub uuid: String,
    pub name: String,
    pub kind: StepKind,
    pub state: Status,
    pub started: i64,
    pub finished: i64,
    pub exit_code: i64,
    pub failure: String,
    pub error: String,
    pub approval: Option<StepApproval>,
}

/// The schedulable unit: exactly one per non-terminal pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Random base64-url token; stable across approval resumptions.
    pub id: String,
    pub pipeline_id: i64,
    pub repo_id: i64,
    pub name: String,
    /// Frozen `TaskPayload` JSON.
    #[serde(default)]
    pub data: Vec<u8>,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(default)]
    pub run_on: Vec<String>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub dep_status: HashMap<String, String>,
}

impl Task {
    /// Generates a random url-safe task id.
    pub fn generate_id() -> String {
        let mut bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut bytes);
        URL_SAFE_NO_PAD.encode(bytes)
    }

    /// Deserializes the frozen payload.
    pub fn payload(&self) -> Result<TaskPayload, serde_json::Error> {
        serde_json::from_slice(&self.data)
    }
}

/// Kind of a persisted log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogKind {
    #[default]
    Output,
    Meta,
}

impl LogKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogKind::Output => "output",
            LogKind::Meta => "meta",
        }
    }

    pub fn parse(s: &str) -> Option<LogKind> {
        match s {
            "output" => Some(LogKind::Output),
            "meta" => Some(LogKind::Meta),
            _ => None,
        }
    }
}

/// One persisted output line; `(step_id, line)` is unique and `line` is
/// strictly increasing per step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub id: i64,
    pub step_id: i64,
    pub time: i64,
    pub line: i64,
    pub kind: LogKind,
    /// Line bytes, newline included.
    pub data: Vec<u8>,
    pub created: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_roundtrip() {
        for status in [
            Status::Pending,
            Status::Running,
            Status::Blocked,
            Status::Success,
            Status::Failure,
            Status::Killed,
            Status::Error,
            Status::Skipped,
        ] {
            assert_eq!(Status::parse(status.as_str()), Some(status));
        }
        assert_eq!(Status::parse("bogus"), None);
    }

    #[test]
    fn test_status_terminality() {
        assert!(!Status::Pending.is_terminal());
        assert!(!Status::Running.is_terminal());
        assert!(!Status::Blocked.is_terminal());
        assert!(Status::Success.is_terminal());
        assert!(Status::Killed.is_terminal());
        assert!(Status::Skipped.is_terminal());
    }

    #[test]
    fn test_event_roundtrip() {
        assert_eq!(Event::parse("pull_metadata"), Some(Event::PullMetadata));
        assert_eq!(Event::Cron.as_str(), "cron");
        assert_eq!(Event::parse("unknown"), None);
    }

    #[test]
    fn test_task_id_is_url_safe() {
        let id = Task::generate_id();
        assert!(!id.is_empty());
        assert!(id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));

        let other = Task::generate_id();
        assert_ne!(id, other);
    }

    #[test]
    fn test_approval_allows_case_insensitive() {
        let approval = StepApproval {
            approvers: vec!["Alice".to_string(), "bob".to_string()],
            ..Default::default()
        };

        assert!(approval.allows("alice"));
        assert!(approval.allows("BOB"));
        assert!(!approval.allows("mallory"));

        let open = StepApproval::default();
        assert!(open.allows("anyone"));
    }

    #[test]
    fn test_approval_decision_replacement() {
        let mut approval = StepApproval::default();
        approval.record_decision(ApprovalDecision {
            user: "Alice".to_string(),
            action: ApprovalAction::Reject,
            comment: "not yet".to_string(),
            timestamp: 1,
        });
        approval.record_decision(ApprovalDecision {
            user: "alice".to_string(),
            action: ApprovalAction::Approve,
            comment: "ok now".to_string(),
            timestamp: 2,
        });

        assert_eq!(approval.decisions.len(), 1);
        assert_eq!(approval.decisions[0].action, ApprovalAction::Approve);
    }

    #[test]
    fn test_approval_all_strategy() {
        let mut approval = StepApproval {
            approvers: vec!["alice".to_string(), "bob".to_string()],
            strategy: ApprovalStrategy::All,
            ..Default::default()
        };

        approval.record_decision(ApprovalDecision {
            user: "alice".to_string(),
            action: ApprovalAction::Approve,
            comment: String::new(),
            timestamp: 1,
        });
        assert!(!approval.all_approved());

        approval.record_decision(ApprovalDecision {
            user: "BOB".to_string(),
            action: ApprovalAction::Approve,
            comment: String::new(),
            timestamp: 2,
        });
        assert!(approval.all_approved());
    }

    #[test]
    fn test_legacy_cron_upgrade() {
        let mut config = RepoPipelineConfig::new(1);
        assert!(config.effective_cron_schedules().is_empty());

        config.cron_enabled = true;
        config.cron_spec = "0 3 * * *".to_string();
        assert_eq!(config.effective_cron_schedules(), vec!["0 3 * * *"]);

        config.cron_schedules = vec!["*/5 * * * *".to_string()];
        assert_eq!(config.effective_cron_schedules(), vec!["*/5 * * * *"]);
    }
}
