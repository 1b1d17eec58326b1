//! Store-backed secret vault.

use terraplane_core::{SecretScope, SecretVault, VaultError, VaultResult};
use tracing::{debug, warn};

use crate::error::StateError;
use crate::store::StateStore;
use crate::types::*;

impl From<StateError> for VaultError {
    fn from(err: StateError) -> Self {
        VaultError::Backend(err.to_string())
    }
}

/// Keeps sealed values in the `secrets` table. Access follows the owner
/// scope: the owner itself, descendant deployments (destroy twins walk
/// their parent chain) and anything in the owner's project.
#[derive(Clone)]
pub struct StoreVault {
    store: StateStore,
}

impl StoreVault {
    pub fn new(store: StateStore) -> Self {
        Self { store }
    }

    fn project_of(&self, scope: &SecretScope) -> VaultResult<Option<String>> {
        Ok(match scope {
            SecretScope::Deployment(id) => self.store.get_deployment(id)?.map(|d| d.project_id),
            SecretScope::Provider(id) => self
                .store
                .get::<ProviderConfig>(id)?
                .map(|p| p.project_id),
        })
    }

    fn is_descendant(&self, requester: &str, owner: &str) -> VaultResult<bool> {
        let mut current = self.store.get_deployment(requester)?;
        // Bounded walk; parent chains are one or two links deep.
        for _ in 0..16 {
            let Some(deployment) = current else {
                return Ok(false);
            };
            match deployment.parent_deployment_id {
                Some(parent) if parent == owner => return Ok(true),
                Some(parent) => current = self.store.get_deployment(&parent)?,
                None => return Ok(false),
            }
        }
        Ok(false)
    }

    fn may_read(&self, record: &SecretRecord, requester: &SecretScope) -> VaultResult<bool> {
        if &record.owner == requester {
            return Ok(true);
        }
        if let (SecretScope::Deployment(owner), SecretScope::Deployment(req)) =
            (&record.owner, requester)
        {
            if self.is_descendant(req, owner)? {
                return Ok(true);
            }
        }
        Ok(self.project_of(requester)?.as_deref() == Some(record.project_id.as_str()))
    }
}

impl SecretVault for StoreVault {
    fn encrypt(&self, owner: &SecretScope, project_id: &str, plaintext: &str) -> VaultResult<String> {
        let record = SecretRecord {
            id: uuid::Uuid::new_v4().to_string(),
            owner: owner.clone(),
            project_id: project_id.to_string(),
            value: plaintext.to_string(),
            created_at: epoch_secs(),
        };
        self.store.put(&record)?;
        debug!(secret_id = %record.id, owner = owner.id(), "secret sealed");
        Ok(record.id)
    }

    fn decrypt(&self, secret_id: &str, requester: &SecretScope) -> VaultResult<String> {
        let record = self
            .store
            .get::<SecretRecord>(secret_id)?
            .ok_or_else(|| VaultError::NotFound(secret_id.to_string()))?;
        if !self.may_read(&record, requester)? {
            warn!(%secret_id, requester = requester.id(), "secret access denied");
            return Err(VaultError::Forbidden {
                secret_id: secret_id.to_string(),
                requester: requester.clone(),
            });
        }
        Ok(record.value)
    }

    fn revoke(&self, secret_id: &str) -> VaultResult<bool> {
        Ok(self.store.delete::<SecretRecord>(secret_id)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::tests::test_deployment;

    fn setup() -> (StateStore, StoreVault) {
        let store = StateStore::open_in_memory().unwrap();
        store
            .put(&test_deployment("d1", "p1", DeploymentStatus::Completed))
            .unwrap();
        let mut twin = test_deployment("d1-destroy", "p1", DeploymentStatus::Waiting);
        twin.destroy = true;
        twin.parent_deployment_id = Some("d1".to_string());
        store.put(&twin).unwrap();
        store
            .put(&test_deployment("d2", "p1", DeploymentStatus::Waiting))
            .unwrap();
        store
            .put(&test_deployment("x1", "p2", DeploymentStatus::Waiting))
            .unwrap();
        let vault = StoreVault::new(store.clone());
        (store, vault)
    }

    fn dep(id: &str) -> SecretScope {
        SecretScope::Deployment(id.to_string())
    }

    #[test]
    fn owner_descendant_and_project_may_read() {
        let (_store, vault) = setup();
        let id = vault.encrypt(&dep("d1"), "p1", "hunter2").unwrap();

        assert_eq!(vault.decrypt(&id, &dep("d1")).unwrap(), "hunter2");
        assert_eq!(vault.decrypt(&id, &dep("d1-destroy")).unwrap(), "hunter2");
        assert_eq!(vault.decrypt(&id, &dep("d2")).unwrap(), "hunter2");
    }

    #[test]
    fn other_project_is_forbidden() {
        let (_store, vault) = setup();
        let id = vault.encrypt(&dep("d1"), "p1", "hunter2").unwrap();
        assert!(matches!(
            vault.decrypt(&id, &dep("x1")),
            Err(VaultError::Forbidden { .. })
        ));
        assert!(matches!(
            vault.decrypt(&id, &SecretScope::Provider("unknown".to_string())),
            Err(VaultError::Forbidden { .. })
        ));
    }

    #[test]
    fn revoked_secret_is_gone() {
        let (_store, vault) = setup();
        let id = vault.encrypt(&dep("d1"), "p1", "hunter2").unwrap();
        assert!(vault.revoke(&id).unwrap());
        assert!(matches!(
            vault.decrypt(&id, &dep("d1")),
            Err(VaultError::NotFound(_))
        ));
    }
}
