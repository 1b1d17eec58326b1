//! terraplane-queue — the queue manager.
//!
//! Jobs are durable rows in the state store's per-project queue. The
//! [`QueuePublisher`] turns each committed job into a wake-up for the
//! [`QueueManager`], which keeps exactly one worker per project. A worker
//! drains its queue in order through the [`JobRunner`]: compile the
//! partition, run the executor, hand the result to the deployment service,
//! then ack. Failures mark the deployment failed, compensate, and requeue
//! the message for one more delivery.

pub mod error;
pub mod manager;
pub mod publisher;
pub mod worker;

pub use error::{QueueError, QueueResult};
pub use manager::QueueManager;
pub use publisher::QueuePublisher;
pub use worker::{JobRunner, RunnerSettings};
