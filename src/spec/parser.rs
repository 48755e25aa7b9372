//! Multi-document YAML parsing for pipeline specifications.

use std::collections::BTreeMap;

use serde::Deserialize;
use thiserror::Error;

use crate::model::{ApprovalStrategy, StepConditions, StepKind};

use super::{ApprovalSpec, PipelineSpec, StepSpec};

/// Errors produced while parsing a pipeline specification.
#[derive(Debug, Error)]
pub enum SpecError {
    /// The YAML source is empty or contains no steps.
    #[error("pipeline spec contains no steps")]
    NoSteps,

    /// YAML syntax or shape error.
    #[error("invalid pipeline YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// A document declared a kind other than `pipeline`.
    #[error("unsupported document kind '{0}'")]
    UnsupportedKind(String),

    /// A step is missing its required name.
    #[error("step {0} is missing a name")]
    MissingStepName(usize),

    /// A commands-type step has no image to run in.
    #[error("step '{0}' has no image")]
    MissingImage(String),

    /// A plugin setting value could not be normalized to strings.
    #[error("unsupported value type for plugin setting '{0}'")]
    UnknownPluginValue(String),

    /// An unknown approval strategy was supplied.
    #[error("unknown approval strategy '{0}' (expected 'any' or 'all')")]
    UnknownStrategy(String),
}

/// Raw document shape, prior to normalization.
#[derive(Debug, Deserialize)]
struct RawDocument {
    #[serde(default)]
    kind: Option<String>,
    #[serde(default)]
    workspace: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    steps: Vec<RawStep>,
}

#[derive(Debug, Deserialize)]
struct RawStep {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    image: Option<String>,
    #[serde(default)]
    commands: Vec<String>,
    #[serde(default)]
    env: BTreeMap<String, String>,
    #[serde(default)]
    volumes: Vec<String>,
    #[serde(default)]
    privileged: bool,
    #[serde(default)]
    settings: BTreeMap<String, serde_yaml::Value>,
    /// Credential alias references; the historical key is `certificate`.
    #[serde(default, alias = "secrets")]
    certificate: Vec<String>,
    #[serde(rename = "type", default)]
    step_type: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    approvers: Vec<String>,
    #[serde(default)]
    approval_timeout: Option<i64>,
    #[serde(default)]
    approval_strategy: Option<String>,
    #[serde(default)]
    when: Option<RawWhen>,
}

#[derive(Debug, Deserialize)]
struct RawWhen {
    #[serde(default)]
    branches: Vec<String>,
}

/// Parses a pipeline YAML source (one or more `---`-separated documents)
/// into a normalized spec. Steps from all documents are concatenated in
/// order; the first non-empty `workspace` and `name` win.
pub fn parse_pipeline(content: &str) -> Result<PipelineSpec, SpecError> {
    let mut spec = PipelineSpec::default();
    let mut index = 0usize;

    for document in serde_yaml::Deserializer::from_str(content) {
        let value = serde_yaml::Value::deserialize(document)?;
        // Blank documents between separators are tolerated.
        if value.is_null() {
            continue;
        }
        let raw: RawDocument = serde_yaml::from_value(value)?;

        if let Some(kind) = raw.kind.as_deref() {
            if !kind.is_empty() && kind != "pipeline" {
                return Err(SpecError::UnsupportedKind(kind.to_string()));
            }
        }

        if spec.workspace.is_empty() {
            if let Some(workspace) = raw.workspace {
                spec.workspace = workspace.trim().to_string();
            }
        }
        if spec.name.is_empty() {
            if let Some(name) = raw.name {
                spec.name = name.trim().to_string();
            }
        }

        for raw_step in raw.steps {
            index += 1;
            spec.steps.push(normalize_step(raw_step, index)?);
        }
    }

    if spec.steps.is_empty() {
        return Err(SpecError::NoSteps);
    }

    Ok(spec)
}

fn normalize_step(raw: RawStep, index: usize) -> Result<StepSpec, SpecError> {
    let name = raw
        .name
        .map(|n| n.trim().to_string())
        .filter(|n| !n.is_empty())
        .ok_or(SpecError::MissingStepName(index))?;

    let kind = match raw.step_type.as_deref() {
        Some("approval") => StepKind::Approval,
        _ => StepKind::Commands,
    };

    let image = raw.image.unwrap_or_default().trim().to_string();
    if kind == StepKind::Commands && image.is_empty() {
        return Err(SpecError::MissingImage(name));
    }

    let approval = if kind == StepKind::Approval {
        let strategy = match raw.approval_strategy.as_deref() {
            None | Some("") | Some("any") => ApprovalStrategy::Any,
            Some("all") => ApprovalStrategy::All,
            Some(other) => return Err(SpecError::UnknownStrategy(other.to_string())),
        };
        Some(ApprovalSpec {
            message: raw.message.unwrap_or_default(),
            approvers: raw.approvers,
            timeout: raw.approval_timeout.unwrap_or(0).max(0),
            strategy,
        })
    } else {
        None
    };

    let mut settings = BTreeMap::new();
    for (key, value) in raw.settings {
        settings.insert(key.clone(), normalize_setting(&key, value)?);
    }

    let conditions = raw.when.and_then(|w| {
        let branches: Vec<String> = w
            .branches
            .into_iter()
            .map(|b| b.trim().to_string())
            .filter(|b| !b.is_empty())
            .collect();
        if branches.is_empty() {
            None
        } else {
            Some(StepConditions { branches })
        }
    });

    Ok(StepSpec {
        kind,
        name,
        image,
        commands: raw.commands,
        env: raw.env,
        secrets: raw.certificate,
        volumes: raw.volumes,
        privileged: raw.privileged,
        settings,
        approval,
        conditions,
    })
}

/// Normalizes one plugin setting value to a list of strings. Scalars map to
/// a single-element list; sequences map element-wise; anything else is
/// rejected.
fn normalize_setting(key: &str, value: serde_yaml::Value) -> Result<Vec<String>, SpecError> {
    match value {
        serde_yaml::Value::Null => Ok(Vec::new()),
        serde_yaml::Value::Sequence(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(scalar_to_string(key, item)?);
            }
            Ok(out)
        }
        scalar => Ok(vec![scalar_to_string(key, scalar)?]),
    }
}

fn scalar_to_string(key: &str, value: serde_yaml::Value) -> Result<String, SpecError> {
    match value {
        serde_yaml::Value::String(s) => Ok(s),
        serde_yaml::Value::Bool(b) => Ok(b.to_string()),
        serde_yaml::Value::Number(n) => Ok(n.to_string()),
        _ => Err(SpecError::UnknownPluginValue(key.to_string())),
    }
}
