//! terraplane-core — types shared by every Terraplane crate.
//!
//! Holds the deployment-type partitioning, the typed configuration values
//! users submit, the template model that validates them, module source
//! parsing, the secret-vault contract, and the `terraplane.toml` parser.

pub mod config;
pub mod ident;
pub mod kind;
pub mod rules;
pub mod secrets;
pub mod source;
pub mod template;
pub mod value;

pub use config::ControlPlaneConfig;
pub use ident::{is_identifier, is_project_id, is_provider_type};
pub use kind::DeploymentType;
pub use rules::InputRule;
pub use secrets::{SecretScope, SecretVault, VaultError, VaultResult};
pub use source::ModuleSource;
pub use template::*;
pub use value::{ConfigMap, ConfigValue};
