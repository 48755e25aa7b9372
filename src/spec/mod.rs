//! Pipeline specification types and YAML parsing.
//!
//! A pipeline spec is one or more `---`-separated YAML documents whose steps
//! are concatenated into a single ordered list. Parsing normalizes every
//! step into one of two kinds (commands or approval), flattens plugin
//! `settings` into string lists, and extracts approval metadata and branch
//! conditions.

mod parser;

pub use parser::{parse_pipeline, SpecError};

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::model::{ApprovalStrategy, StepConditions, StepKind};

/// A parsed, normalized pipeline specification.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineSpec {
    /// Workspace root override; empty means the system default root.
    pub workspace: String,
    /// Display name of the run; also the default workflow name.
    pub name: String,
    pub steps: Vec<StepSpec>,
}

/// Approval metadata declared on an approval-type step.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApprovalSpec {
    pub message: String,
    pub approvers: Vec<String>,
    /// Seconds until a pending approval expires; 0 disables expiry.
    pub timeout: i64,
    pub strategy: ApprovalStrategy,
}

/// A normalized pipeline step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepSpec {
    pub kind: StepKind,
    pub name: String,
    pub image: String,
    pub commands: Vec<String>,
    /// Textual env definitions; `$(...)` values are deferred to post-step
    /// evaluation inside the workspace.
    pub env: BTreeMap<String, String>,
    /// Credential alias references (case-insensitive at resolution time).
    pub secrets: Vec<String>,
    /// Bind-mount specs, `host:container[:mode]`.
    pub volumes: Vec<String>,
    pub privileged: bool,
    /// Plugin settings normalized to string lists; non-empty only for
    /// plugin-style steps.
    pub settings: BTreeMap<String, Vec<String>>,
    pub approval: Option<ApprovalSpec>,
    pub conditions: Option<StepConditions>,
}

impl StepSpec {
    /// Whether this step is driven by plugin settings rather than commands.
    pub fn is_plugin(&self) -> bool {
        !self.settings.is_empty() && self.commands.is_empty()
    }
}
