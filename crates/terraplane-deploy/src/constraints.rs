//! Unique constraints: resolution from a template invocation and the
//! all-or-nothing claim of the resulting rows.

use terraplane_core::template::ConstraintScope;
use terraplane_core::{ConfigMap, ConfigValue, Template};
use terraplane_state::{Deployment, StateTxn, UniqueConstraint, epoch_secs};
use tracing::debug;

use crate::error::{DeployError, DeployResult};

fn scalar(value: &ConfigValue) -> Option<String> {
    match value {
        ConfigValue::String(s) => Some(s.clone()),
        ConfigValue::Number(n) => Some(n.to_string()),
        ConfigValue::Boolean(b) => Some(b.to_string()),
        _ => None,
    }
}

/// The constraint rows a deployment would own. Any constraint whose source
/// cannot be resolved fails the whole batch.
pub fn resolve_constraints(
    template: &Template,
    config: &ConfigMap,
    project_id: &str,
    deployment_id: &str,
) -> DeployResult<Vec<UniqueConstraint>> {
    let mut rows = Vec::with_capacity(template.constraints.len());
    for spec in &template.constraints {
        let value = config
            .get(&spec.input)
            .or_else(|| template.input(&spec.input).and_then(|i| i.default.as_ref()))
            .and_then(scalar)
            .ok_or_else(|| {
                DeployError::BadRequest(format!(
                    "constraint {}: input {} has no scalar value",
                    spec.key, spec.input
                ))
            })?;
        let scope_id = match spec.scope {
            ConstraintScope::Global => None,
            ConstraintScope::Project => Some(project_id.to_string()),
            ConstraintScope::Resource => {
                let input = spec.resource_input.as_deref().ok_or_else(|| {
                    DeployError::BadRequest(format!(
                        "constraint {}: resource scope needs a resource input",
                        spec.key
                    ))
                })?;
                match config.get(input) {
                    Some(ConfigValue::ResourceRef(id)) => Some(id.clone()),
                    _ => {
                        return Err(DeployError::BadRequest(format!(
                            "constraint {}: input {input} is not a resource reference",
                            spec.key
                        )));
                    }
                }
            }
        };
        rows.push(UniqueConstraint {
            key: spec.key.clone(),
            value,
            scope: spec.scope,
            scope_id,
            project_id: project_id.to_string(),
            deployment_id: deployment_id.to_string(),
            created_at: epoch_secs(),
        });
    }
    Ok(rows)
}

/// Claim every row for its deployment. A row owned by another deployment
/// is a conflict; the enclosing transaction is then discarded.
pub fn insert_constraints_in(txn: &StateTxn<'_>, rows: &[UniqueConstraint]) -> DeployResult<Vec<String>> {
    let mut keys = Vec::with_capacity(rows.len());
    for row in rows {
        let key = UniqueConstraint::row_key(row.scope, row.scope_id.as_deref(), &row.key, &row.value);
        if let Some(existing) = txn.get::<UniqueConstraint>(&key)? {
            if existing.deployment_id != row.deployment_id {
                return Err(DeployError::Conflict(format!(
                    "{} {:?} is already taken",
                    row.key, row.value
                )));
            }
        }
        txn.put(row)?;
        keys.push(key);
    }
    Ok(keys)
}

/// Drop the rows still owned by `deployment`.
pub fn release_constraints_in(txn: &StateTxn<'_>, deployment: &Deployment) -> DeployResult<usize> {
    let mut released = 0;
    for key in &deployment.constraint_keys {
        let owned = txn
            .get::<UniqueConstraint>(key)?
            .is_some_and(|row| row.deployment_id == deployment.id);
        if owned {
            txn.delete::<UniqueConstraint>(key)?;
            released += 1;
        }
    }
    if released > 0 {
        debug!(deployment_id = %deployment.id, released, "unique constraints released");
    }
    Ok(released)
}
