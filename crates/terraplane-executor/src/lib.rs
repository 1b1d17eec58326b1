//! terraplane-executor — runs the provisioning tool for one partition.
//!
//! [`Executor`] is the command contract (init, validate, plan, apply,
//! refresh, output); [`TerraformExecutor`] implements it over a
//! subprocess. Tool output goes through a [`LogSession`], which buffers
//! lines in memory and flushes them to a [`LogSink`] on a fixed interval
//! and once more when the session finishes.

pub mod error;
pub mod executor;
pub mod logs;
pub mod terraform;

pub use error::{ExecError, ExecResult};
pub use executor::{Executor, Run};
pub use logs::{LogBuffer, LogSession, LogSink, StoreLogSink};
pub use terraform::TerraformExecutor;
