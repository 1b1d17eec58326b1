//! terraplane-deploy — the deployment state machine.
//!
//! [`DeploymentService`] validates, creates, starts, deletes and cascades
//! deployments, and applies execution results (plans, applies, failures,
//! refreshes) handed back by the queue workers. It keeps quota usage,
//! the dependency graph and unique constraints consistent with the
//! deployments that own them. [`QuotaAccountant`] tracks per-project usage.

pub mod constraints;
pub mod error;
pub mod notify;
pub mod quota;
pub mod service;
pub mod validate;

pub use error::{DeployError, DeployResult};
pub use notify::{NoopNotifier, QueueNotifier};
pub use quota::QuotaAccountant;
pub use service::{
    DeleteOutcome, DependencyReport, DependentResource, DeploymentService, FailOutcome,
    NewDeployment, NewProvider,
};
