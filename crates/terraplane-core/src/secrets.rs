//! Secret vault contract.
//!
//! Secrets are sealed under an owner scope (a deployment or a provider) and
//! handed out only to requesters the owner trusts: itself, a descendant
//! deployment, or anything in the same project.

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type VaultResult<T> = Result<T, VaultError>;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "snake_case")]
pub enum SecretScope {
    Deployment(String),
    Provider(String),
}

impl SecretScope {
    pub fn id(&self) -> &str {
        match self {
            SecretScope::Deployment(id) | SecretScope::Provider(id) => id,
        }
    }
}

#[derive(Debug, Error)]
pub enum VaultError {
    #[error("secret not found: {0}")]
    NotFound(String),

    #[error("access to secret {secret_id} denied for {requester:?}")]
    Forbidden {
        secret_id: String,
        requester: SecretScope,
    },

    #[error("vault backend error: {0}")]
    Backend(String),
}

pub trait SecretVault: Send + Sync {
    /// Seal `plaintext` under `owner` and return the secret identifier.
    fn encrypt(&self, owner: &SecretScope, project_id: &str, plaintext: &str) -> VaultResult<String>;

    /// Unseal a secret on behalf of `requester`.
    fn decrypt(&self, secret_id: &str, requester: &SecretScope) -> VaultResult<String>;

    /// Remove a secret. Returns false if it did not exist.
    fn revoke(&self, secret_id: &str) -> VaultResult<bool>;
}
