//! Credential types and the store interface.
//!
//! The system credential store is external; the engine consumes it as a
//! black box that returns typed secrets by id or name. `MemoryCredentialStore`
//! is the in-process implementation used by embedders and tests.

mod resolver;

pub use resolver::{
    embed_credentials, resolve, sanitize_prefix, ResolvedBinding, ResolvedCredentials,
};

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors from the credential store.
#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("credential store error: {0}")]
    Backend(String),
}

/// The type of a credential, which determines the env vars it materializes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CredentialKind {
    Git,
    Docker,
    #[serde(untagged)]
    Other(String),
}

impl CredentialKind {
    pub fn as_str(&self) -> &str {
        match self {
            CredentialKind::Git => "git",
            CredentialKind::Docker => "docker",
            CredentialKind::Other(s) => s,
        }
    }
}

/// A typed secret with free-form values (`username`, `password`, `token`,
/// `repo`, `registry`, …).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credential {
    pub id: i64,
    pub name: String,
    pub kind: CredentialKind,
    pub values: HashMap<String, String>,
}

impl Credential {
    pub fn value(&self, key: &str) -> &str {
        self.values.get(key).map(String::as_str).unwrap_or("")
    }
}

/// Black-box credential lookup, by id (repo-scoped bindings) or by name
/// (global fallback, case-insensitive).
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn find_by_id(&self, id: i64) -> Result<Option<Credential>, CredentialError>;
    async fn find_by_name(&self, name: &str) -> Result<Option<Credential>, CredentialError>;
}

/// In-process credential store.
#[derive(Default)]
pub struct MemoryCredentialStore {
    credentials: Mutex<Vec<Credential>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, credential: Credential) {
        let mut credentials = self.credentials.lock().expect("credential store poisoned");
        credentials.retain(|c| c.id != credential.id);
        credentials.push(credential);
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn find_by_id(&self, id: i64) -> Result<Option<Credential>, CredentialError> {
        let credentials = self.credentials.lock().expect("credential store poisoned");
        Ok(credentials.iter().find(|c| c.id == id).cloned())
    }

    async fn find_by_name(&self, name: &str) -> Result<Option<Credential>, CredentialError> {
        let credentials = self.credentials.lock().expect("credential store poisoned");
        Ok(credentials
            .iter()
            .find(|c| c.name.eq_ignore_ascii_case(name))
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn git_credential(id: i64, name: &str) -> Credential {
        let mut values = HashMap::new();
        values.insert("username".to_string(), "bot".to_string());
        values.insert("password".to_string(), "hunter2".to_string());
        Credential {
            id,
            name: name.to_string(),
            kind: CredentialKind::Git,
            values,
        }
    }

    #[tokio::test]
    async fn test_memory_store_lookup_is_case_insensitive() {
        let store = MemoryCredentialStore::new();
        store.insert(git_credential(1, "Deploy-Key"));

        assert!(store.find_by_name("deploy-key").await.unwrap().is_some());
        assert!(store.find_by_name("DEPLOY-KEY").await.unwrap().is_some());
        assert!(store.find_by_name("missing").await.unwrap().is_none());
        assert_eq!(store.find_by_id(1).await.unwrap().unwrap().name, "Deploy-Key");
    }

    #[test]
    fn test_kind_serialization() {
        let git: CredentialKind = serde_json::from_str(r#""git""#).unwrap();
        assert_eq!(git, CredentialKind::Git);

        let other: CredentialKind = serde_json::from_str(r#""ssh""#).unwrap();
        assert_eq!(other, CredentialKind::Other("ssh".to_string()));
    }
}
