//! terraplane-graph — resource dependency graph.
//!
//! Edges say "dependent requires dependency". The graph lives in the state
//! store (forward edges plus a reverse index) and exposes two traversal
//! primitives: a DFS cycle check before insertion and a post-order walk of
//! a resource's dependents for safe destroy ordering.

pub mod error;
pub mod graph;

pub use error::{GraphError, GraphResult};
pub use graph::DependencyGraph;
