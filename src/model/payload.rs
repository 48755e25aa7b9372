//! The frozen task payload.
//!
//! At enqueue time the trigger path serializes everything a worker needs into
//! `Task.data`. The payload never changes for the life of the task, so a run
//! resumed after an approval (or after a process restart) sees exactly the
//! inputs it was created with.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::{StepApproval, StepKind};

/// Immutable execution payload serialized into `Task.data`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskPayload {
    pub pipeline_id: i64,
    pub repo_id: i64,
    pub branch: String,
    #[serde(default)]
    pub commit: String,
    /// Web URL of the repository.
    pub repo_url: String,
    /// Clone URL of the repository.
    pub repo_clone: String,
    /// Default branch of the repository.
    pub repo_branch: String,
    /// Workspace root declared by the spec; empty means the system default.
    #[serde(default)]
    pub workspace_root: String,
    /// Display name of the run (the spec's `name`).
    #[serde(default)]
    pub run_name: String,
    pub steps: Vec<StepPayload>,
}

/// Branch conditions attached to a step.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepConditions {
    #[serde(default)]
    pub branches: Vec<String>,
}

impl StepConditions {
    /// Whether the step should run for the given branch. Both sides are
    /// trimmed; an empty branch list matches everything.
    pub fn matches_branch(&self, branch: &str) -> bool {
        if self.branches.is_empty() {
            return true;
        }
        let branch = branch.trim();
        self.branches.iter().any(|b| b.trim() == branch)
    }
}

/// Plugin configuration surfaced as `PLUGIN_*` environment variables.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PluginPayload {
    /// Normalized settings: every value is a list of strings, joined with
    /// newlines when exported.
    #[serde(default)]
    pub settings: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub volumes: Vec<String>,
    #[serde(default)]
    pub privileged: bool,
}

/// One step inside the frozen payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepPayload {
    /// 1-based ordinal; matches the persisted step row.
    pub pid: i64,
    pub name: String,
    #[serde(default)]
    pub image: String,
    #[serde(default)]
    pub commands: Vec<String>,
    /// Alias references to credentials; matched case-insensitively.
    #[serde(default)]
    pub secrets: Vec<String>,
    /// Textual env definitions; values wrapped in `$(...)` are evaluated
    /// after the step's commands, inside the workspace.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Bind-mount specs, `host:container[:mode]`.
    #[serde(default)]
    pub volumes: Vec<String>,
    #[serde(default)]
    pub privileged: bool,
    #[serde(rename = "type", default)]
    pub kind: StepKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval: Option<StepApproval>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plugin: Option<PluginPayload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conditions: Option<StepConditions>,
}

impl TaskPayload {
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_payload() -> TaskPayload {
        let mut env = BTreeMap::new();
        env.insert("KEY".to_string(), "value".to_string());
        env.insert("BUILT".to_string(), "$(date +%s)".to_string());

        TaskPayload {
            pipeline_id: 7,
            repo_id: 3,
            branch: "main".to_string(),
            commit: "abc123".to_string(),
            repo_url: "https://git.example.com/acme/app".to_string(),
            repo_clone: "https://git.example.com/acme/app.git".to_string(),
            repo_branch: "main".to_string(),
            workspace_root: String::new(),
            run_name: "build".to_string(),
            steps: vec![StepPayload {
                pid: 1,
                name: "compile".to_string(),
                image: "rust:1.80".to_string(),
                commands: vec!["cargo build".to_string(), "cargo test".to_string()],
                secrets: vec!["registry".to_string()],
                env,
                volumes: vec!["/cache:/cache".to_string()],
                privileged: false,
                kind: StepKind::Commands,
                approval: None,
                plugin: None,
                conditions: Some(StepConditions {
                    branches: vec!["main".to_string()],
                }),
            }],
        }
    }

    #[test]
    fn test_payload_roundtrip_preserves_order() {
        let payload = sample_payload();
        let bytes = payload.to_bytes().unwrap();
        let restored = TaskPayload::from_bytes(&bytes).unwrap();

        assert_eq!(restored.pipeline_id, payload.pipeline_id);
        assert_eq!(restored.steps.len(), payload.steps.len());
        assert_eq!(restored.steps[0].commands, payload.steps[0].commands);
        assert_eq!(restored.steps[0].env, payload.steps[0].env);
        assert_eq!(restored.steps[0].secrets, payload.steps[0].secrets);

        // Serializing again yields identical bytes: env maps are ordered.
        let again = restored.to_bytes().unwrap();
        assert_eq!(bytes, again);
    }

    #[test]
    fn test_branch_conditions() {
        let cond = StepConditions {
            branches: vec!["release".to_string(), " main ".to_string()],
        };
        assert!(cond.matches_branch("main"));
        assert!(cond.matches_branch("release"));
        assert!(!cond.matches_branch("develop"));

        assert!(StepConditions::default().matches_branch("anything"));
    }
}
