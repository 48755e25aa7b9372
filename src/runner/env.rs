//! Per-run environment assembly.
//!
//! The run environment is built in a fixed overlay order: process env,
//! pipeline fields, repository fields, additional variables, credential env.
//! Step env definitions are split into immediate (`pre`) values with
//! placeholder expansion and deferred `$(...)` captures evaluated after the
//! step's commands, on the host, inside the workspace.

use std::collections::BTreeMap;

use regex::Regex;

use crate::model::{Pipeline, Repository, TaskPayload};
use crate::secrets::{sanitize_prefix, ResolvedCredentials};

/// Ordered run environment. Keys are unique; later overlays win.
#[derive(Debug, Clone, Default)]
pub struct RunEnv {
    vars: BTreeMap<String, String>,
}

impl RunEnv {
    /// Starts from the host process environment.
    pub fn from_process() -> Self {
        Self {
            vars: std::env::vars().collect(),
        }
    }

    /// Starts empty; used by tests and embedders that isolate the host env.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.vars.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    pub fn extend<I, K, V>(&mut self, entries: I)
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        for (key, value) in entries {
            self.set(key, value);
        }
    }

    /// Renders the environment as sorted `K=V` lines for the container.
    pub fn to_container_lines(&self) -> Vec<String> {
        self.vars
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect()
    }
}

/// Pipeline-derived variables (`CI_*` plus the commit aliases).
pub fn pipeline_overlay(pipeline: &Pipeline, run_name: &str) -> Vec<(String, String)> {
    vec![
        ("CI".to_string(), "true".to_string()),
        ("CI_PIPELINE_ID".to_string(), pipeline.id.to_string()),
        (
            "CI_PIPELINE_NUMBER".to_string(),
            pipeline.number.to_string(),
        ),
        ("CI_PIPELINE_NAME".to_string(), run_name.to_string()),
        ("CI_PIPELINE_AUTHOR".to_string(), pipeline.author.clone()),
        ("CI_PIPELINE_BRANCH".to_string(), pipeline.branch.clone()),
        ("CI_COMMIT_SHA".to_string(), pipeline.commit.clone()),
        ("CI_COMMIT_BRANCH".to_string(), pipeline.branch.clone()),
        ("COMMIT_ID".to_string(), pipeline.commit.clone()),
        ("COMMIT_ID_SHA".to_string(), pipeline.commit.clone()),
    ]
}

/// Repository-derived variables.
pub fn repo_overlay(repo: &Repository, payload: &TaskPayload) -> Vec<(String, String)> {
    vec![
        ("CI_REPO_ID".to_string(), repo.id.to_string()),
        ("CI_REPO_NAME".to_string(), repo.name.clone()),
        ("CI_REPO_OWNER".to_string(), repo.owner.clone()),
        ("CI_REPO_FULL_NAME".to_string(), repo.full_name.clone()),
        ("CI_DEFAULT_BRANCH".to_string(), payload.repo_branch.clone()),
        ("REPO_URL".to_string(), payload.repo_url.clone()),
        ("REPO_CLONE_URL".to_string(), payload.repo_clone.clone()),
        ("REPO_CLONE_URL_AUTH".to_string(), payload.repo_clone.clone()),
        ("REPO_WEB_URL".to_string(), payload.repo_url.clone()),
        ("REPO_OWNER".to_string(), repo.owner.clone()),
    ]
}

/// Step env split into immediate values and deferred shell captures.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct SplitEnv {
    /// Literal values, placeholder-expanded, applied before the commands.
    pub pre: Vec<(String, String)>,
    /// `$(...)` expressions evaluated after the commands, in-workspace.
    pub post: Vec<(String, String)>,
}

/// Splits a step env map. A value syntactically matching `$(...)` is a
/// post-step capture; anything else is substituted immediately.
pub fn split_step_env(
    env: &BTreeMap<String, String>,
    credentials: &ResolvedCredentials,
    run_env: &RunEnv,
) -> SplitEnv {
    let mut split = SplitEnv::default();

    for (key, value) in env {
        let trimmed = value.trim();
        if trimmed.starts_with("$(") && trimmed.ends_with(')') {
            let expr = trimmed[2..trimmed.len() - 1].to_string();
            split.post.push((key.clone(), expr));
        } else {
            split
                .pre
                .push((key.clone(), substitute(value, credentials, run_env)));
        }
    }

    split
}

/// Replaces `${alias.field}` placeholders from resolved credentials and
/// `${NAME}` placeholders from the run environment. Unknown placeholders are
/// left untouched.
pub fn substitute(text: &str, credentials: &ResolvedCredentials, run_env: &RunEnv) -> String {
    // One pattern covers both forms; a dot picks the credential namespace.
    let pattern = placeholder_regex();

    pattern
        .replace_all(text, |caps: &regex::Captures<'_>| {
            let name = &caps[1];
            if let Some((alias, field)) = name.split_once('.') {
                if let Some(value) = credentials.placeholder(alias, field) {
                    return value.to_string();
                }
            } else if let Some(value) = run_env.get(name) {
                return value.to_string();
            }
            caps[0].to_string()
        })
        .into_owned()
}

fn placeholder_regex() -> Regex {
    Regex::new(r"\$\{([A-Za-z0-9_][A-Za-z0-9_\-.]*)\}").expect("placeholder regex")
}

/// Replaces only `${alias.field}` credential placeholders, leaving plain
/// `${NAME}` references for the shell inside the container.
pub fn substitute_secrets(text: &str, credentials: &ResolvedCredentials) -> String {
    placeholder_regex()
        .replace_all(text, |caps: &regex::Captures<'_>| {
            let name = &caps[1];
            if let Some((alias, field)) = name.split_once('.') {
                if let Some(value) = credentials.placeholder(alias, field) {
                    return value.to_string();
                }
            }
            caps[0].to_string()
        })
        .into_owned()
}

/// Computes `PLUGIN_*` variables from normalized plugin settings. Values are
/// substituted and joined with newlines; keys share the credential-prefix
/// sanitizer so the exported names are deterministic.
pub fn plugin_overlay(
    settings: &BTreeMap<String, Vec<String>>,
    credentials: &ResolvedCredentials,
    run_env: &RunEnv,
) -> Vec<(String, String)> {
    settings
        .iter()
        .map(|(key, values)| {
            let name = format!("PLUGIN_{}", sanitize_prefix(key));
            let value = values
                .iter()
                .map(|v| substitute(v, credentials, run_env))
                .collect::<Vec<_>>()
                .join("\n");
            (name, value)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{CertificateBinding, RepoPipelineConfig};
    use crate::secrets::{resolve, Credential, CredentialKind, MemoryCredentialStore};
    use std::collections::HashMap;

    async fn credentials_with_git() -> ResolvedCredentials {
        let store = MemoryCredentialStore::new();
        let mut values = HashMap::new();
        values.insert("username".to_string(), "bot".to_string());
        values.insert("password".to_string(), "hunter2".to_string());
        store.insert(Credential {
            id: 1,
            name: "deploy".to_string(),
            kind: CredentialKind::Git,
            values,
        });

        let mut config = RepoPipelineConfig::new(1);
        config.legacy_certificates = vec![CertificateBinding {
            alias: "deploy".to_string(),
            credential_id: 1,
        }];

        resolve(&store, &config, &["deploy".to_string()], "")
            .await
            .unwrap()
    }

    #[test]
    fn test_container_lines_are_sorted() {
        let mut env = RunEnv::empty();
        env.set("ZEBRA", "1");
        env.set("ALPHA", "2");
        env.set("MIDDLE", "3");

        assert_eq!(
            env.to_container_lines(),
            vec!["ALPHA=2", "MIDDLE=3", "ZEBRA=1"]
        );
    }

    #[tokio::test]
    async fn test_substitute_env_and_credential_placeholders() {
        let credentials = credentials_with_git().await;
        let mut env = RunEnv::empty();
        env.set("TARGET", "production");

        let out = substitute(
            "deploy to ${TARGET} as ${deploy.username} with ${deploy.password}",
            &credentials,
            &env,
        );
        assert_eq!(out, "deploy to production as bot with hunter2");

        // Unknown placeholders survive untouched.
        let out = substitute("${NOPE} ${ghost.field}", &credentials, &env);
        assert_eq!(out, "${NOPE} ${ghost.field}");
    }

    #[tokio::test]
    async fn test_substitute_secrets_leaves_env_references() {
        let credentials = credentials_with_git().await;

        let out = substitute_secrets("curl -u ${deploy.username} ${TARGET}", &credentials);
        assert_eq!(out, "curl -u bot ${TARGET}");
    }

    #[tokio::test]
    async fn test_split_step_env() {
        let credentials = credentials_with_git().await;
        let mut run_env = RunEnv::empty();
        run_env.set("REGION", "eu");

        let mut env = BTreeMap::new();
        env.insert("LITERAL".to_string(), "plain".to_string());
        env.insert("EXPANDED".to_string(), "${REGION}-1".to_string());
        env.insert("CAPTURED".to_string(), "$(git rev-parse HEAD)".to_string());

        let split = split_step_env(&env, &credentials, &run_env);

        assert_eq!(
            split.post,
            vec![("CAPTURED".to_string(), "git rev-parse HEAD".to_string())]
        );
        assert!(split
            .pre
            .contains(&("LITERAL".to_string(), "plain".to_string())));
        assert!(split
            .pre
            .contains(&("EXPANDED".to_string(), "eu-1".to_string())));
    }

    #[tokio::test]
    async fn test_plugin_overlay() {
        let credentials = credentials_with_git().await;
        let run_env = RunEnv::empty();

        let mut settings = BTreeMap::new();
        settings.insert(
            "webhook-urls".to_string(),
            vec!["https://a".to_string(), "https://b".to_string()],
        );
        settings.insert("user".to_string(), vec!["${deploy.username}".to_string()]);

        let overlay = plugin_overlay(&settings, &credentials, &run_env);
        let map: BTreeMap<_, _> = overlay.into_iter().collect();

        assert_eq!(map["PLUGIN_WEBHOOK_URLS"], "https://a\nhttps://b");
        assert_eq!(map["PLUGIN_USER"], "bot");
    }

    #[test]
    fn test_pipeline_overlay_commit_aliases() {
        let pipeline = Pipeline {
            id: 12,
            repo_id: 1,
            number: 4,
            author: "alice".to_string(),
            event: crate::model::Event::Manual,
            status: crate::model::Status::Running,
            branch: "main".to_string(),
            r#ref: String::new(),
            commit: "deadbeef".to_string(),
            message: String::new(),
            title: String::new(),
            created: 0,
            started: 0,
            finished: 0,
            updated: 0,
            additional_variables: HashMap::new(),
        };

        let overlay: BTreeMap<_, _> = pipeline_overlay(&pipeline, "build").into_iter().collect();
        assert_eq!(overlay["CI"], "true");
        assert_eq!(overlay["CI_PIPELINE_ID"], "12");
        assert_eq!(overlay["CI_PIPELINE_NAME"], "build");
        assert_eq!(overlay["CI_COMMIT_SHA"], "deadbeef");
        assert_eq!(overlay["COMMIT_ID"], "deadbeef");
        assert_eq!(overlay["COMMIT_ID_SHA"], "deadbeef");
    }
}
