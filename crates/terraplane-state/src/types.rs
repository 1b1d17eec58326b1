//! Domain types for the Terraplane state store.
//!
//! These types are the persisted rows of the control plane: deployments and
//! the resources they materialize, dependency edges, unique constraints,
//! quotas, provider configurations, queue messages, executor log lines and
//! sealed secrets. All of them are JSON-serialized into redb tables.

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use terraplane_core::template::ConstraintScope;
use terraplane_core::{ConfigMap, DeploymentType, SecretScope};

/// Unique identifier for a deployment (UUID v4).
pub type DeploymentId = String;

/// Unique identifier for a resource (UUID v4).
pub type ResourceId = String;

/// Unique identifier for a project (tenant).
pub type ProjectId = String;

/// Current Unix time in seconds.
pub fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Unit (module block) name for a deployment id.
pub fn unit_name(deployment_id: &str) -> String {
    format!("d_{}", deployment_id.replace('-', "_"))
}

// ── Deployment ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    Waiting,
    Queued,
    Planning,
    Pending,
    Running,
    Completed,
    Failed,
}

impl DeploymentStatus {
    pub const ALL: [DeploymentStatus; 7] = [
        DeploymentStatus::Waiting,
        DeploymentStatus::Queued,
        DeploymentStatus::Planning,
        DeploymentStatus::Pending,
        DeploymentStatus::Running,
        DeploymentStatus::Completed,
        DeploymentStatus::Failed,
    ];

    pub fn is_terminal(&self) -> bool {
        matches!(self, DeploymentStatus::Completed | DeploymentStatus::Failed)
    }

    /// Owned by a worker (queued or executing).
    pub fn is_in_flight(&self) -> bool {
        matches!(
            self,
            DeploymentStatus::Queued | DeploymentStatus::Planning | DeploymentStatus::Running
        )
    }
}

impl std::fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DeploymentStatus::Waiting => "waiting",
            DeploymentStatus::Queued => "queued",
            DeploymentStatus::Planning => "planning",
            DeploymentStatus::Pending => "pending",
            DeploymentStatus::Running => "running",
            DeploymentStatus::Completed => "completed",
            DeploymentStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// One instance of applying (or, with `destroy`, tearing down) a template
/// against a project.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Deployment {
    pub id: DeploymentId,
    pub project_id: ProjectId,
    pub template_id: String,
    pub name: String,
    pub deployment_type: DeploymentType,
    pub status: DeploymentStatus,
    /// Submitted values; secret inputs hold `SecretRef`s after creation.
    pub config: ConfigMap,
    /// `false` marks a logically removed but retained deployment.
    pub active: bool,
    /// Teardown twin of `parent_deployment_id`.
    pub destroy: bool,
    /// Run a plan before the apply.
    pub plan: bool,
    pub parent_deployment_id: Option<DeploymentId>,
    pub provider_id: Option<String>,
    /// Keys of the unique constraint rows this deployment owns.
    #[serde(default)]
    pub constraint_keys: Vec<String>,
    /// Quota usage reserved while the deployment is in flight.
    #[serde(default)]
    pub requested_usage: BTreeMap<String, u64>,
    pub user_id: String,
    /// Rendered plan from the last `Planning` run.
    #[serde(default)]
    pub plan_output: Option<serde_json::Value>,
    /// Last failure message.
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub applied_at: Option<u64>,
    pub created_at: u64,
    pub updated_at: u64,
}

impl Deployment {
    pub fn unit_name(&self) -> String {
        unit_name(&self.id)
    }

    /// A root deployment has no parent (it is not a destroy twin).
    pub fn is_root(&self) -> bool {
        self.parent_deployment_id.is_none()
    }

    /// Whether `requested_usage` still counts against the project's quota
    /// on top of committed resource usage.
    pub fn reserves_quota(&self) -> bool {
        !self.destroy
            && !self.status.is_terminal()
            && (self.active || self.status == DeploymentStatus::Waiting)
    }
}

// ── Resources & dependency edges ───────────────────────────────────

/// Materialized on a successful apply of a non-destroy deployment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    pub id: ResourceId,
    pub project_id: ProjectId,
    pub deployment_id: DeploymentId,
    pub name: String,
    pub resource_type: String,
    /// Executor outputs of the owning unit.
    #[serde(default)]
    pub details: BTreeMap<String, serde_json::Value>,
    /// Committed quota consumption per metric.
    #[serde(default)]
    pub usage: BTreeMap<String, u64>,
    pub created_at: u64,
    pub updated_at: u64,
}

/// `dependent` requires `dependency` to exist first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceDependency {
    pub dependent_id: ResourceId,
    pub dependency_id: ResourceId,
    pub created_at: u64,
}

impl ResourceDependency {
    /// Key in the reverse (`DEPENDENTS`) index.
    pub fn reverse_key(&self) -> String {
        format!("{}:{}", self.dependency_id, self.dependent_id)
    }
}

// ── Unique constraints ─────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UniqueConstraint {
    pub key: String,
    pub value: String,
    pub scope: ConstraintScope,
    /// Project id for `Project` scope, resource id for `Resource` scope.
    pub scope_id: Option<String>,
    pub project_id: ProjectId,
    pub deployment_id: DeploymentId,
    pub created_at: u64,
}

impl UniqueConstraint {
    /// Store key of a constraint row. The parts are JSON-encoded, so a `/`
    /// inside a key or value cannot make two rows collide.
    pub fn row_key(scope: ConstraintScope, scope_id: Option<&str>, key: &str, value: &str) -> String {
        let scope_id = scope_id.unwrap_or_default();
        match scope {
            ConstraintScope::Global => format!("global/{}", serde_json::Value::from(vec![key, value])),
            ConstraintScope::Project => {
                format!("project/{}", serde_json::Value::from(vec![scope_id, key, value]))
            }
            ConstraintScope::Resource => {
                format!("resource/{}", serde_json::Value::from(vec![scope_id, key, value]))
            }
        }
    }
}

// ── Quota ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ProjectResourceQuota {
    pub project_id: ProjectId,
    /// Limit per metric. Metrics without an entry are unconstrained.
    #[serde(default)]
    pub quotas: BTreeMap<String, u64>,
    /// Committed usage per metric, summed over the project's resources.
    #[serde(default)]
    pub usage: BTreeMap<String, u64>,
    pub updated_at: u64,
}

impl ProjectResourceQuota {
    pub fn zeroed(project_id: &str) -> Self {
        Self {
            project_id: project_id.to_string(),
            updated_at: epoch_secs(),
            ..Default::default()
        }
    }

    /// `quota - usage`, or `None` when the metric has no quota.
    pub fn available(&self, metric: &str) -> Option<u64> {
        let limit = self.quotas.get(metric)?;
        let used = self.usage.get(metric).copied().unwrap_or(0);
        Some(limit.saturating_sub(used))
    }
}

// ── Providers ──────────────────────────────────────────────────────

/// A configured provider instance. Derived providers reference the
/// resource whose outputs fed their configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub id: String,
    pub project_id: ProjectId,
    pub name: String,
    pub provider_type: String,
    #[serde(default)]
    pub config: ConfigMap,
    #[serde(default)]
    pub resource_id: Option<ResourceId>,
    pub created_at: u64,
}

impl ProviderConfig {
    /// Provider alias in compiled artifacts.
    pub fn alias(&self) -> String {
        format!("p_{}", self.id.replace('-', "_"))
    }
}

// ── Queue ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Plan,
    Apply,
    Refresh,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueMessage {
    pub seq: u64,
    pub job: JobKind,
    pub project_id: ProjectId,
    /// Absent for project-scoped `Refresh` jobs.
    pub deployment_id: Option<DeploymentId>,
    pub timestamp: u64,
    /// Failed deliveries so far.
    #[serde(default)]
    pub deliveries: u32,
}

impl QueueMessage {
    pub fn row_key(&self) -> String {
        format!("{}:{:020}", self.project_id, self.seq)
    }
}

// ── Logs ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogStream {
    Stdout,
    Stderr,
    /// Lines written by the control plane itself.
    System,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogLine {
    /// Deployment id, or `refresh:<project>` for refresh runs.
    pub scope: String,
    pub seq: u64,
    pub stream: LogStream,
    pub line: String,
    pub timestamp: u64,
}

impl LogLine {
    pub fn row_key(&self) -> String {
        format!("{}#{:010}", self.scope, self.seq)
    }
}

/// Log scope of a project's refresh runs.
pub fn refresh_scope(project_id: &str) -> String {
    format!("refresh:{project_id}")
}

// ── Secrets ────────────────────────────────────────────────────────

#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct SecretRecord {
    pub id: String,
    pub owner: SecretScope,
    pub project_id: ProjectId,
    pub value: String,
    pub created_at: u64,
}

impl std::fmt::Debug for SecretRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretRecord")
            .field("id", &self.id)
            .field("owner", &self.owner)
            .field("project_id", &self.project_id)
            .field("value", &"<redacted>")
            .finish()
    }
}
