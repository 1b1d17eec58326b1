//! terraplane-state — embedded state store for Terraplane.
//!
//! Backed by [redb](https://docs.rs/redb), provides persistent and in-memory
//! storage for deployments, resources, dependency edges, unique constraints,
//! quotas, providers, templates, secrets, the per-project job queue and
//! executor logs.
//!
//! # Architecture
//!
//! All domain types are JSON-serialized into redb's `&[u8]` value columns.
//! Composite keys (`{dependent}:{dependency}`, `{project}:{seq}`) enable
//! prefix scans for related records. Multi-record changes go through
//! [`StateStore::write`], which commits only when the closure succeeds.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

pub mod error;
pub mod lifecycle;
pub mod logs;
pub mod queue;
pub mod store;
pub mod tables;
pub mod types;
pub mod vault;

pub use error::{StateError, StateResult};
pub use lifecycle::{compilable_deployments, is_compilable_active};
pub use store::{JsonTable, Record, StateStore, StateTxn};
pub use types::*;
pub use vault::StoreVault;
