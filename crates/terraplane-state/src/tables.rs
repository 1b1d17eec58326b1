//! redb table definitions for the Terraplane state store.
//!
//! Each record table uses `&str` keys and `&[u8]` values (JSON-serialized
//! domain types). Composite keys follow `{parent}:{child}` so related rows
//! can be found with a prefix scan.

use redb::TableDefinition;

/// Deployments keyed by `{deployment_id}`.
pub const DEPLOYMENTS: TableDefinition<&str, &[u8]> = TableDefinition::new("deployments");

/// Resources keyed by `{resource_id}`.
pub const RESOURCES: TableDefinition<&str, &[u8]> = TableDefinition::new("resources");

/// Dependency edges keyed by `{dependent_id}:{dependency_id}`.
pub const DEPENDENCIES: TableDefinition<&str, &[u8]> = TableDefinition::new("dependencies");

/// Reverse index of dependency edges keyed by `{dependency_id}:{dependent_id}`.
pub const DEPENDENTS: TableDefinition<&str, &[u8]> = TableDefinition::new("dependents");

/// Unique constraints keyed by `{scope}/{scope_id}/{key}/{value}`.
pub const CONSTRAINTS: TableDefinition<&str, &[u8]> = TableDefinition::new("constraints");

/// Project quotas keyed by `{project_id}`.
pub const QUOTAS: TableDefinition<&str, &[u8]> = TableDefinition::new("quotas");

/// Provider configurations keyed by `{provider_id}`.
pub const PROVIDERS: TableDefinition<&str, &[u8]> = TableDefinition::new("providers");

/// Templates keyed by `{template_id}`.
pub const TEMPLATES: TableDefinition<&str, &[u8]> = TableDefinition::new("templates");

/// Sealed secrets keyed by `{secret_id}`.
pub const SECRETS: TableDefinition<&str, &[u8]> = TableDefinition::new("secrets");

/// Queue messages keyed by `{project_id}:{seq:020}`.
pub const QUEUE: TableDefinition<&str, &[u8]> = TableDefinition::new("queue");

/// Executor log lines keyed by `{scope}#{seq:010}`.
pub const LOGS: TableDefinition<&str, &[u8]> = TableDefinition::new("logs");

/// Monotonic counters keyed by name.
pub const META: TableDefinition<&str, u64> = TableDefinition::new("meta");
