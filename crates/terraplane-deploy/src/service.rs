//! DeploymentService — the deployment lifecycle.
//!
//! Deployments move `Waiting → Queued → (Planning → Pending → Queued →)
//! Running → Completed`, or to `Failed` from any in-flight status. Every
//! status change is a conditional update against the status the caller
//! observed, so a concurrent change surfaces as a conflict instead of being
//! overwritten. Validation runs before any write; multi-record changes
//! commit in one store transaction.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use terraplane_core::{
    ConfigMap, ConfigValue, InputKind, SecretScope, SecretVault, Template, is_identifier,
};
use terraplane_graph::DependencyGraph;
use terraplane_state::{
    Deployment, DeploymentStatus, JobKind, LogLine, ProjectResourceQuota, ProviderConfig,
    QueueMessage, Resource, StateStore, StateTxn, epoch_secs, refresh_scope, unit_name,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::constraints::{insert_constraints_in, release_constraints_in, resolve_constraints};
use crate::error::{DeployError, DeployResult};
use crate::notify::QueueNotifier;
use crate::quota::QuotaAccountant;
use crate::validate::{
    check_project_id, check_provider_type, resource_usage, validate_config, validate_template,
};

/// Request to create a deployment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewDeployment {
    pub template_id: String,
    pub name: String,
    #[serde(default)]
    pub config: ConfigMap,
    /// Run a plan before the apply.
    #[serde(default)]
    pub plan: bool,
    #[serde(default)]
    pub provider_id: Option<String>,
    pub user_id: String,
}

/// Request to register a provider configuration.
#[derive(Clone, Serialize, Deserialize)]
pub struct NewProvider {
    pub name: String,
    pub provider_type: String,
    #[serde(default)]
    pub config: ConfigMap,
    /// Values sealed in the vault under the provider's scope.
    #[serde(default)]
    pub secrets: BTreeMap<String, String>,
}

impl std::fmt::Debug for NewProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NewProvider")
            .field("name", &self.name)
            .field("provider_type", &self.provider_type)
            .field("config", &self.config)
            .field("secrets", &self.secrets.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// A resource that still depends on the deployment being deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DependentResource {
    pub resource_id: String,
    pub name: String,
    pub resource_type: String,
    pub deployment_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DependencyReport {
    pub deployment_id: String,
    /// Most dependent first.
    pub dependents: Vec<DependentResource>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "detail", rename_all = "snake_case")]
pub enum DeleteOutcome {
    /// Never applied; removed outright.
    Deleted,
    /// A destroy twin was created and queued.
    DestroyQueued(Deployment),
    /// Destroy twins started for every dependent and the deployment itself,
    /// in start order.
    Cascaded(Vec<Deployment>),
    /// Dependents exist and the delete was not forced. Nothing changed.
    DependencyConflict(DependencyReport),
}

#[derive(Debug, Clone, PartialEq)]
pub struct FailOutcome {
    pub deployment: Deployment,
    /// The failed run may have created infrastructure that a teardown apply
    /// of the partition should remove.
    pub teardown: bool,
}

fn start_allowed(deployment: &Deployment) -> bool {
    use DeploymentStatus::*;
    match deployment.status {
        Pending | Failed => deployment.active,
        Waiting => true,
        Queued | Planning | Running | Completed => false,
    }
}

fn conflict(id: &str, what: &str) -> DeployError {
    DeployError::Conflict(format!("deployment {id} {what}"))
}

#[derive(Clone)]
pub struct DeploymentService {
    store: StateStore,
    graph: DependencyGraph,
    quotas: QuotaAccountant,
    vault: Arc<dyn SecretVault>,
    notifier: Arc<dyn QueueNotifier>,
}

impl DeploymentService {
    pub fn new(
        store: StateStore,
        vault: Arc<dyn SecretVault>,
        notifier: Arc<dyn QueueNotifier>,
    ) -> Self {
        Self {
            graph: DependencyGraph::new(store.clone()),
            quotas: QuotaAccountant::new(store.clone()),
            store,
            vault,
            notifier,
        }
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn quotas(&self) -> &QuotaAccountant {
        &self.quotas
    }

    pub fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    // ── Lookups ────────────────────────────────────────────────────

    pub fn get_deployment(&self, id: &str) -> DeployResult<Deployment> {
        self.store
            .get_deployment(id)?
            .ok_or_else(|| DeployError::NotFound(format!("deployment {id}")))
    }

    pub fn list_deployments(&self, project_id: &str) -> DeployResult<Vec<Deployment>> {
        check_project_id(project_id)?;
        let mut deployments = self.store.list_deployments(project_id)?;
        deployments.sort_by_key(|d| d.created_at);
        Ok(deployments)
    }

    pub fn template(&self, id: &str) -> DeployResult<Template> {
        self.store
            .get(id)?
            .ok_or_else(|| DeployError::NotFound(format!("template {id}")))
    }

    /// Executor output accumulated for a deployment.
    pub fn deployment_logs(&self, id: &str) -> DeployResult<Vec<LogLine>> {
        self.get_deployment(id)?;
        Ok(self.store.list_logs(id)?)
    }

    pub fn refresh_logs(&self, project_id: &str) -> DeployResult<Vec<LogLine>> {
        check_project_id(project_id)?;
        Ok(self.store.list_logs(&refresh_scope(project_id))?)
    }

    // ── Administration ─────────────────────────────────────────────

    pub fn register_template(&self, template: Template) -> DeployResult<Template> {
        validate_template(&template)?;
        self.store.put(&template)?;
        info!(template_id = %template.id, "template registered");
        Ok(template)
    }

    pub fn register_provider(&self, project_id: &str, request: NewProvider) -> DeployResult<ProviderConfig> {
        check_project_id(project_id)?;
        check_provider_type(&request.provider_type)?;
        // Keys become attribute names of the rendered provider block.
        for key in request.config.keys().chain(request.secrets.keys()) {
            if !is_identifier(key) {
                return Err(DeployError::BadRequest(format!(
                    "provider setting {key:?} is not an identifier"
                )));
            }
        }
        for (key, value) in &request.config {
            if !value.is_plain() {
                return Err(DeployError::BadRequest(format!("{key} must be a plain value")));
            }
            if request.secrets.contains_key(key) {
                return Err(DeployError::BadRequest(format!("{key} is given twice")));
            }
        }

        let id = Uuid::new_v4().to_string();
        let owner = SecretScope::Provider(id.clone());
        let mut config = request.config;
        let mut sealed = Vec::new();
        for (key, plaintext) in &request.secrets {
            match self.vault.encrypt(&owner, project_id, plaintext) {
                Ok(secret_id) => {
                    sealed.push(secret_id.clone());
                    config.insert(key.clone(), ConfigValue::SecretRef(secret_id));
                }
                Err(e) => {
                    self.revoke_all(&sealed);
                    return Err(e.into());
                }
            }
        }

        let provider = ProviderConfig {
            id,
            project_id: project_id.to_string(),
            name: request.name,
            provider_type: request.provider_type,
            config,
            resource_id: None,
            created_at: epoch_secs(),
        };
        if let Err(e) = self.store.put(&provider) {
            self.revoke_all(&sealed);
            return Err(e.into());
        }
        info!(provider_id = %provider.id, %project_id, "provider registered");
        Ok(provider)
    }

    pub fn get_quota(&self, project_id: &str) -> DeployResult<ProjectResourceQuota> {
        check_project_id(project_id)?;
        self.quotas.get_quota(project_id)
    }

    pub fn set_quota(
        &self,
        project_id: &str,
        quotas: BTreeMap<String, u64>,
    ) -> DeployResult<ProjectResourceQuota> {
        check_project_id(project_id)?;
        let quota = self.quotas.set_quota(project_id, quotas)?;
        info!(%project_id, quotas = ?quota.quotas, "quota limits set");
        Ok(quota)
    }

    // ── Validation ─────────────────────────────────────────────────

    /// Check a configuration against its template without writing anything.
    /// Quota is skipped for destroy runs.
    pub fn validate_deployment(
        &self,
        project_id: &str,
        template: &Template,
        config: &ConfigMap,
        provider_id: Option<&str>,
        destroy: bool,
        exclude: Option<&str>,
    ) -> DeployResult<BTreeMap<String, u64>> {
        check_project_id(project_id)?;
        let validated = validate_config(&self.store, template, project_id, config, provider_id)?;
        if !destroy {
            self.quotas
                .validate(project_id, &validated.requested_usage, exclude)?;
        }
        Ok(validated.requested_usage)
    }

    // ── Lifecycle ──────────────────────────────────────────────────

    /// Validate, seal secrets, claim unique constraints and persist the
    /// deployment as `Waiting`, then start it.
    pub fn create_deployment(&self, project_id: &str, request: NewDeployment) -> DeployResult<Deployment> {
        let template = self.template(&request.template_id)?;
        let requested = self.validate_deployment(
            project_id,
            &template,
            &request.config,
            request.provider_id.as_deref(),
            false,
            None,
        )?;

        let id = Uuid::new_v4().to_string();
        let constraints = resolve_constraints(&template, &request.config, project_id, &id)?;
        let (config, sealed) = self.seal_secrets(&template, project_id, &id, request.config)?;

        let now = epoch_secs();
        let mut deployment = Deployment {
            id,
            project_id: project_id.to_string(),
            template_id: template.id.clone(),
            name: request.name,
            deployment_type: template.deployment_type,
            status: DeploymentStatus::Waiting,
            config,
            active: false,
            destroy: false,
            plan: request.plan,
            parent_deployment_id: None,
            provider_id: request.provider_id,
            constraint_keys: Vec::new(),
            requested_usage: requested,
            user_id: request.user_id,
            plan_output: None,
            error: None,
            applied_at: None,
            created_at: now,
            updated_at: now,
        };

        let stored = self.store.write(|txn| -> DeployResult<()> {
            QuotaAccountant::validate_in(txn, project_id, &deployment.requested_usage, None)?;
            deployment.constraint_keys = insert_constraints_in(txn, &constraints)?;
            txn.put(&deployment)?;
            Ok(())
        });
        if let Err(e) = stored {
            self.revoke_all(&sealed);
            return Err(e);
        }
        info!(
            deployment_id = %deployment.id,
            %project_id,
            template_id = %deployment.template_id,
            "deployment created"
        );
        self.start_deployment(&deployment.id)
    }

    /// Re-validate and queue a Plan or Apply job. Legal from `Pending`,
    /// `Waiting` or `Failed` on an active deployment, and from `Waiting` on
    /// a fresh one.
    pub fn start_deployment(&self, id: &str) -> DeployResult<Deployment> {
        let deployment = self.get_deployment(id)?;
        if !start_allowed(&deployment) {
            return Err(DeployError::BadRequest(format!(
                "deployment {id} cannot be started from {} (active: {})",
                deployment.status, deployment.active
            )));
        }
        let template = self.template(&deployment.template_id)?;
        let validated = validate_config(
            &self.store,
            &template,
            &deployment.project_id,
            &deployment.config,
            deployment.provider_id.as_deref(),
        )?;

        let job = if deployment.plan
            && !deployment.destroy
            && deployment.status != DeploymentStatus::Pending
        {
            JobKind::Plan
        } else {
            JobKind::Apply
        };

        let observed = deployment.status;
        let started = self.store.write(|txn| -> DeployResult<Deployment> {
            if !deployment.destroy {
                QuotaAccountant::validate_in(
                    txn,
                    &deployment.project_id,
                    &validated.requested_usage,
                    Some(id),
                )?;
            }
            let updated = txn
                .transition_deployment(id, &[observed], |d| {
                    d.status = DeploymentStatus::Queued;
                    d.active = true;
                    d.error = None;
                    d.requested_usage = validated.requested_usage.clone();
                })?
                .ok_or_else(|| conflict(id, "changed status concurrently"))?;
            txn.enqueue(job, &updated.project_id, Some(id))?;
            Ok(updated)
        })?;

        info!(deployment_id = %id, job = ?job, from = %observed, "deployment queued");
        self.notifier.notify(&started.project_id);
        Ok(started)
    }

    /// Claim a queued deployment for execution: `Queued → Planning` for a
    /// plan, `Queued → Running` otherwise. `None` if it is no longer queued.
    pub fn begin_execution(&self, id: &str, job: JobKind) -> DeployResult<Option<Deployment>> {
        let next = match job {
            JobKind::Plan => DeploymentStatus::Planning,
            JobKind::Apply => DeploymentStatus::Running,
            JobKind::Refresh => {
                return Err(DeployError::BadRequest(
                    "refresh jobs are not bound to a deployment".to_string(),
                ));
            }
        };
        let claimed = self
            .store
            .transition_deployment(id, &[DeploymentStatus::Queued], |d| d.status = next)?;
        if claimed.is_some() {
            info!(deployment_id = %id, status = %next, "deployment executing");
        }
        Ok(claimed)
    }

    /// Delete a root deployment. Never-applied deployments are removed;
    /// applied ones get a destroy twin, or with `force` a cascade through
    /// their dependents.
    pub fn delete_deployment(&self, id: &str, user_id: &str, force: bool) -> DeployResult<DeleteOutcome> {
        let deployment = self.get_deployment(id)?;
        if !deployment.active {
            return Err(DeployError::BadRequest(format!("deployment {id} is not active")));
        }
        if !deployment.is_root() {
            return Err(DeployError::BadRequest(format!(
                "deployment {id} is a destroy run and cannot be deleted"
            )));
        }
        if deployment.status.is_in_flight() {
            return Err(DeployError::BadRequest(format!(
                "deployment {id} is {}",
                deployment.status
            )));
        }

        if deployment.status != DeploymentStatus::Completed {
            self.hard_delete(&deployment)?;
            return Ok(DeleteOutcome::Deleted);
        }

        let dependents = self.dependents(&deployment)?;
        if !dependents.is_empty() {
            if !force {
                let report = self.dependency_report(&deployment, &dependents)?;
                info!(
                    deployment_id = %id,
                    dependents = report.dependents.len(),
                    "delete refused, deployment has dependents"
                );
                return Ok(DeleteOutcome::DependencyConflict(report));
            }
            return self
                .cascade_destroy_deployment(id, user_id)
                .map(DeleteOutcome::Cascaded);
        }

        let twin = self.create_destroy_twin(&deployment, user_id)?;
        let started = self.start_deployment(&twin.id)?;
        Ok(DeleteOutcome::DestroyQueued(started))
    }

    /// Destroy `id` and everything that depends on it, most dependent
    /// deployment type first. Returns the destroy runs started, in order.
    pub fn cascade_destroy_deployment(&self, id: &str, user_id: &str) -> DeployResult<Vec<Deployment>> {
        let root = self.get_deployment(id)?;
        let mut order = Vec::new();
        let mut seen = HashSet::from([root.id.clone()]);
        for resource_id in self.dependents(&root)? {
            let Some(resource) = self.store.get::<Resource>(&resource_id)? else {
                continue;
            };
            if seen.insert(resource.deployment_id.clone()) {
                if let Some(owner) = self.store.get_deployment(&resource.deployment_id)? {
                    order.push(owner);
                }
            }
        }
        order.push(root);
        order.sort_by_key(|d| d.deployment_type.destroy_priority());

        let mut started = Vec::new();
        for deployment in order {
            if deployment.destroy {
                continue;
            }
            if deployment.active && deployment.status == DeploymentStatus::Completed {
                let twin = self.create_destroy_twin(&deployment, user_id)?;
                started.push(self.start_deployment(&twin.id)?);
                continue;
            }
            if deployment.active {
                warn!(
                    deployment_id = %deployment.id,
                    status = %deployment.status,
                    "dependent is not applied, skipped in cascade"
                );
                continue;
            }
            match self.destroy_twin_of(&deployment.id)? {
                Some(twin)
                    if matches!(
                        twin.status,
                        DeploymentStatus::Waiting | DeploymentStatus::Pending | DeploymentStatus::Failed
                    ) =>
                {
                    debug!(deployment_id = %deployment.id, twin_id = %twin.id, "resuming destroy run");
                    started.push(self.start_deployment(&twin.id)?);
                }
                Some(twin) => {
                    debug!(
                        deployment_id = %deployment.id,
                        twin_id = %twin.id,
                        status = %twin.status,
                        "destroy run already in progress"
                    );
                }
                None => {
                    debug!(deployment_id = %deployment.id, "inactive dependent has no destroy run");
                }
            }
        }
        info!(deployment_id = %id, started = started.len(), "cascade destroy queued");
        Ok(started)
    }

    /// Plan rendered: `Planning → Pending`.
    pub fn complete_plan(&self, id: &str, plan: Value) -> DeployResult<Deployment> {
        let updated = self
            .store
            .transition_deployment(id, &[DeploymentStatus::Planning], |d| {
                d.status = DeploymentStatus::Pending;
                d.plan_output = Some(plan);
            })?
            .ok_or_else(|| conflict(id, "is not planning"))?;
        info!(deployment_id = %id, "plan ready");
        Ok(updated)
    }

    /// Apply succeeded. Creates the deployment's resource, or for a destroy
    /// run removes what the original created.
    pub fn complete_apply(&self, id: &str, outputs: &BTreeMap<String, Value>) -> DeployResult<Deployment> {
        let deployment = self.get_deployment(id)?;
        if deployment.status != DeploymentStatus::Running {
            return Err(conflict(id, "is not running"));
        }
        if deployment.destroy {
            return self.finish_destroy(&deployment);
        }
        let template = self.template(&deployment.template_id)?;

        let (completed, resource) = self.store.write(|txn| -> DeployResult<_> {
            let resource = Self::create_resource_in(txn, &deployment, &template, outputs)?;
            let completed = txn
                .transition_deployment(id, &[DeploymentStatus::Running], |d| {
                    d.status = DeploymentStatus::Completed;
                    d.applied_at = Some(epoch_secs());
                    d.error = None;
                })?
                .ok_or_else(|| conflict(id, "is not running"))?;
            Ok((completed, resource))
        })?;
        info!(
            deployment_id = %id,
            resource_id = resource.as_ref().map(|r| r.id.as_str()),
            "deployment completed"
        );
        Ok(completed)
    }

    /// Materialize the resource a deployment's template declares, with its
    /// dependency edges, derived provider and quota usage. Idempotent per
    /// deployment. Fails on a self reference or a cycle.
    pub fn create_resource_in(
        txn: &StateTxn<'_>,
        deployment: &Deployment,
        template: &Template,
        outputs: &BTreeMap<String, Value>,
    ) -> DeployResult<Option<Resource>> {
        let Some(schema) = &template.resource else {
            return Ok(None);
        };
        let existing = txn
            .list::<Resource>()?
            .into_iter()
            .find(|r| r.deployment_id == deployment.id);
        if existing.is_some() {
            return Ok(existing);
        }

        let now = epoch_secs();
        let name = schema
            .name_input
            .as_deref()
            .and_then(|input| deployment.config.get(input))
            .and_then(ConfigValue::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| deployment.name.clone());
        let resource = Resource {
            id: Uuid::new_v4().to_string(),
            project_id: deployment.project_id.clone(),
            deployment_id: deployment.id.clone(),
            name,
            resource_type: schema.resource_type.clone(),
            details: unit_outputs(&deployment.unit_name(), outputs),
            usage: resource_usage(schema, &deployment.config),
            created_at: now,
            updated_at: now,
        };
        txn.put(&resource)?;

        let mut dependencies = Vec::new();
        if let Some(provider_id) = &deployment.provider_id {
            dependencies.extend(provider_resource(txn, provider_id)?);
        }
        for input in &template.inputs {
            match (&input.kind, deployment.config.get(&input.name)) {
                (InputKind::Resource { .. }, Some(ConfigValue::ResourceRef(id))) => {
                    dependencies.push(id.clone());
                }
                (InputKind::Provider { .. }, Some(ConfigValue::ProviderRef(id))) => {
                    dependencies.extend(provider_resource(txn, id)?);
                }
                _ => {}
            }
        }
        for dependency in &dependencies {
            DependencyGraph::add_edge_in(txn, &resource.id, dependency)?;
        }

        if let Some(derived) = &schema.provider {
            let config: ConfigMap = derived
                .outputs
                .iter()
                .filter_map(|name| {
                    resource
                        .details
                        .get(name)
                        .map(|v| (name.clone(), ConfigValue::from_json(v)))
                })
                .collect();
            let provider = ProviderConfig {
                id: Uuid::new_v4().to_string(),
                project_id: deployment.project_id.clone(),
                name: resource.name.clone(),
                provider_type: derived.provider_type.clone(),
                config,
                resource_id: Some(resource.id.clone()),
                created_at: now,
            };
            txn.put(&provider)?;
            debug!(provider_id = %provider.id, resource_id = %resource.id, "derived provider created");
        }

        let delta: BTreeMap<String, i64> = resource
            .usage
            .iter()
            .map(|(metric, amount)| (metric.clone(), i64::try_from(*amount).unwrap_or(i64::MAX)))
            .collect();
        QuotaAccountant::increment_usage_in(txn, &deployment.project_id, &delta)?;
        debug!(
            resource_id = %resource.id,
            deployment_id = %deployment.id,
            dependencies = dependencies.len(),
            "resource created"
        );
        Ok(Some(resource))
    }

    /// Record a failed run. Partially created resources are removed and
    /// usage recomputed before the deployment is marked `Failed`. Returns
    /// `None` when the deployment is gone or no longer in flight, so a
    /// redelivered message never compensates twice.
    pub fn fail_deployment(&self, id: &str, message: &str) -> DeployResult<Option<FailOutcome>> {
        let Some(deployment) = self.store.get_deployment(id)? else {
            warn!(deployment_id = %id, "failed deployment no longer exists");
            return Ok(None);
        };
        if !deployment.status.is_in_flight() {
            warn!(
                deployment_id = %id,
                status = %deployment.status,
                "deployment already settled, failure ignored"
            );
            return Ok(None);
        }
        let prior = deployment.status;

        let failed = self.store.write(|txn| -> DeployResult<_> {
            if !deployment.destroy {
                for resource in txn.list::<Resource>()? {
                    if resource.deployment_id == deployment.id {
                        delete_resource_in(txn, &resource)?;
                    }
                }
            }
            QuotaAccountant::recompute_usage_in(txn, &deployment.project_id)?;
            Ok(txn.transition_deployment(id, &[prior], |d| {
                d.status = DeploymentStatus::Failed;
                d.error = Some(message.to_string());
            })?)
        })?;
        let Some(failed) = failed else {
            return Ok(None);
        };
        info!(deployment_id = %id, from = %prior, "deployment failed");
        Ok(Some(FailOutcome {
            teardown: prior == DeploymentStatus::Running && !failed.destroy,
            deployment: failed,
        }))
    }

    /// Overwrite resource details with fresh executor outputs. Returns the
    /// number of resources whose details changed.
    pub fn refresh_resource_details(
        &self,
        project_id: &str,
        outputs: &BTreeMap<String, Value>,
    ) -> DeployResult<usize> {
        let updated = self.store.write(|txn| -> DeployResult<usize> {
            let mut updated = 0;
            for mut resource in txn.list::<Resource>()? {
                if resource.project_id != project_id {
                    continue;
                }
                let details = unit_outputs(&unit_name(&resource.deployment_id), outputs);
                if details.is_empty() || details == resource.details {
                    continue;
                }
                resource.details = details;
                resource.updated_at = epoch_secs();
                txn.put(&resource)?;
                updated += 1;
            }
            Ok(updated)
        })?;
        debug!(%project_id, updated, "resource details refreshed");
        Ok(updated)
    }

    /// Queue a project-wide refresh.
    pub fn enqueue_refresh(&self, project_id: &str) -> DeployResult<QueueMessage> {
        check_project_id(project_id)?;
        let message = self.store.enqueue(JobKind::Refresh, project_id, None)?;
        self.notifier.notify(project_id);
        Ok(message)
    }

    // ── Internals ──────────────────────────────────────────────────

    fn seal_secrets(
        &self,
        template: &Template,
        project_id: &str,
        deployment_id: &str,
        mut config: ConfigMap,
    ) -> DeployResult<(ConfigMap, Vec<String>)> {
        let owner = SecretScope::Deployment(deployment_id.to_string());
        let mut sealed = Vec::new();
        for input in &template.inputs {
            if input.kind != InputKind::Secret {
                continue;
            }
            let Some(ConfigValue::String(plaintext)) = config.get(&input.name) else {
                continue;
            };
            match self.vault.encrypt(&owner, project_id, plaintext) {
                Ok(secret_id) => {
                    sealed.push(secret_id.clone());
                    config.insert(input.name.clone(), ConfigValue::SecretRef(secret_id));
                }
                Err(e) => {
                    self.revoke_all(&sealed);
                    return Err(e.into());
                }
            }
        }
        Ok((config, sealed))
    }

    fn revoke_all(&self, secret_ids: &[String]) {
        for secret_id in secret_ids {
            if let Err(e) = self.vault.revoke(secret_id) {
                warn!(%secret_id, error = %e, "secret revoke failed");
            }
        }
    }

    /// Revoke the secrets a deployment sealed for itself.
    fn revoke_owned(&self, deployment: &Deployment) {
        let owned: Vec<String> = deployment
            .config
            .values()
            .filter_map(|value| match value {
                ConfigValue::SecretRef(id) => Some(id.clone()),
                _ => None,
            })
            .collect();
        self.revoke_all(&owned);
    }

    /// Resources depending on any of the deployment's resources, most
    /// dependent first.
    fn dependents(&self, deployment: &Deployment) -> DeployResult<Vec<String>> {
        let roots: Vec<String> = self
            .store
            .resources_for_deployment(&deployment.id)?
            .into_iter()
            .map(|r| r.id)
            .collect();
        if roots.is_empty() {
            return Ok(Vec::new());
        }
        Ok(self.graph.dependents_of_all(&roots)?)
    }

    fn dependency_report(
        &self,
        deployment: &Deployment,
        dependents: &[String],
    ) -> DeployResult<DependencyReport> {
        let mut report = DependencyReport {
            deployment_id: deployment.id.clone(),
            dependents: Vec::with_capacity(dependents.len()),
        };
        for resource_id in dependents {
            if let Some(resource) = self.store.get::<Resource>(resource_id)? {
                report.dependents.push(DependentResource {
                    resource_id: resource.id,
                    name: resource.name,
                    resource_type: resource.resource_type,
                    deployment_id: resource.deployment_id,
                });
            }
        }
        Ok(report)
    }

    fn destroy_twin_of(&self, id: &str) -> DeployResult<Option<Deployment>> {
        let project = self.get_deployment(id)?.project_id;
        Ok(self
            .store
            .list_deployments(&project)?
            .into_iter()
            .find(|d| d.active && d.destroy && d.parent_deployment_id.as_deref() == Some(id)))
    }

    /// Retire `original` and insert its destroy twin, atomically.
    fn create_destroy_twin(&self, original: &Deployment, user_id: &str) -> DeployResult<Deployment> {
        let now = epoch_secs();
        let twin = Deployment {
            id: Uuid::new_v4().to_string(),
            project_id: original.project_id.clone(),
            template_id: original.template_id.clone(),
            name: format!("{}-destroy", original.name),
            deployment_type: original.deployment_type,
            status: DeploymentStatus::Waiting,
            config: original.config.clone(),
            active: true,
            destroy: true,
            plan: false,
            parent_deployment_id: Some(original.id.clone()),
            provider_id: original.provider_id.clone(),
            constraint_keys: Vec::new(),
            requested_usage: BTreeMap::new(),
            user_id: user_id.to_string(),
            plan_output: None,
            error: None,
            applied_at: None,
            created_at: now,
            updated_at: now,
        };
        self.store.write(|txn| -> DeployResult<()> {
            let current = txn
                .get::<Deployment>(&original.id)?
                .ok_or_else(|| DeployError::NotFound(format!("deployment {}", original.id)))?;
            if !current.active {
                return Err(conflict(&original.id, "is already being destroyed"));
            }
            txn.transition_deployment(&original.id, &[DeploymentStatus::Completed], |d| {
                d.active = false;
            })?
            .ok_or_else(|| conflict(&original.id, "is no longer completed"))?;
            txn.put(&twin)?;
            Ok(())
        })?;
        info!(deployment_id = %original.id, twin_id = %twin.id, "destroy run created");
        Ok(twin)
    }

    /// Remove a never-applied deployment with its constraints. Inactive
    /// children are reactivated and detached.
    fn hard_delete(&self, deployment: &Deployment) -> DeployResult<()> {
        let reactivated = self.store.write(|txn| -> DeployResult<usize> {
            txn.delete::<Deployment>(&deployment.id)?;
            release_constraints_in(txn, deployment)?;
            let mut reactivated = 0;
            for mut child in txn.list::<Deployment>()? {
                if child.parent_deployment_id.as_deref() != Some(deployment.id.as_str()) || child.active {
                    continue;
                }
                child.active = true;
                child.parent_deployment_id = None;
                child.updated_at = epoch_secs();
                txn.put(&child)?;
                reactivated += 1;
            }
            Ok(reactivated)
        })?;
        self.revoke_owned(deployment);
        info!(deployment_id = %deployment.id, reactivated, "deployment deleted");
        Ok(())
    }

    /// Destroy run applied: drop the original's resources, derived
    /// providers, edges and constraints, recompute usage, and retire both.
    fn finish_destroy(&self, twin: &Deployment) -> DeployResult<Deployment> {
        let original_id = twin
            .parent_deployment_id
            .clone()
            .ok_or_else(|| DeployError::Internal(format!("destroy run {} has no parent", twin.id)))?;

        let (done, original, removed) = self.store.write(|txn| -> DeployResult<_> {
            let mut removed = 0;
            for resource in txn.list::<Resource>()? {
                if resource.deployment_id == original_id {
                    delete_resource_in(txn, &resource)?;
                    removed += 1;
                }
            }
            let original = txn.get::<Deployment>(&original_id)?;
            if let Some(original) = &original {
                release_constraints_in(txn, original)?;
                let mut retired = original.clone();
                retired.active = false;
                retired.updated_at = epoch_secs();
                txn.put(&retired)?;
            }
            QuotaAccountant::recompute_usage_in(txn, &twin.project_id)?;
            let done = txn
                .transition_deployment(&twin.id, &[DeploymentStatus::Running], |d| {
                    d.status = DeploymentStatus::Completed;
                    d.active = false;
                    d.applied_at = Some(epoch_secs());
                    d.error = None;
                })?
                .ok_or_else(|| conflict(&twin.id, "is not running"))?;
            Ok((done, original, removed))
        })?;
        if let Some(original) = &original {
            self.revoke_owned(original);
        }
        info!(deployment_id = %original_id, twin_id = %twin.id, removed, "deployment destroyed");
        Ok(done)
    }
}

/// Outputs of one unit with the `<unit>__` prefix stripped.
fn unit_outputs(unit: &str, outputs: &BTreeMap<String, Value>) -> BTreeMap<String, Value> {
    let prefix = format!("{unit}__");
    outputs
        .iter()
        .filter_map(|(name, value)| {
            name.strip_prefix(&prefix)
                .map(|short| (short.to_string(), value.clone()))
        })
        .collect()
}

fn provider_resource(txn: &StateTxn<'_>, provider_id: &str) -> DeployResult<Option<String>> {
    Ok(txn
        .get::<ProviderConfig>(provider_id)?
        .and_then(|p| p.resource_id))
}

/// Remove a resource with its edges and the providers derived from it.
fn delete_resource_in(txn: &StateTxn<'_>, resource: &Resource) -> DeployResult<()> {
    DependencyGraph::remove_resource_edges_in(txn, &resource.id)?;
    for provider in txn.list::<ProviderConfig>()? {
        if provider.resource_id.as_deref() == Some(resource.id.as_str()) {
            txn.delete::<ProviderConfig>(&provider.id)?;
        }
    }
    txn.delete::<Resource>(&resource.id)?;
    debug!(resource_id = %resource.id, "resource removed");
    Ok(())
}
