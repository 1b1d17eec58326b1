//! terraplane-compiler — turns one (project, deployment type) partition into
//! the artifact set the provisioning tool runs against.
//!
//! The artifact set holds the backend and provider bindings, one unit block
//! per compilable deployment, typed variable declarations with validation
//! predicates, a plain-values variable file, per-unit outputs and the
//! remote-state reads needed for cross-partition references. Secret values
//! never land in files; they travel as `TF_VAR_*` environment entries.

pub mod artifacts;
pub mod compiler;
pub mod error;
pub mod hcl;

pub use artifacts::ArtifactSet;
pub use compiler::ConfigCompiler;
pub use error::{CompileError, CompileResult};
