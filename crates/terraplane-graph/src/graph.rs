//! DependencyGraph — cycle-checked edge insertion and dependent walks.

use std::collections::{HashMap, HashSet};

use terraplane_state::tables::DEPENDENTS;
use terraplane_state::{ResourceDependency, StateResult, StateStore, StateTxn, epoch_secs};
use tracing::debug;

use crate::error::{GraphError, GraphResult};

/// Where adjacency is read from: committed state or an open transaction.
trait EdgeSource {
    /// Resources `resource` depends on.
    fn dependencies(&self, resource: &str) -> StateResult<Vec<String>>;

    /// Resources that depend on `resource`.
    fn dependents(&self, resource: &str) -> StateResult<Vec<String>>;
}

impl EdgeSource for StateStore {
    fn dependencies(&self, resource: &str) -> StateResult<Vec<String>> {
        let edges: Vec<ResourceDependency> = self.list_prefix(&format!("{resource}:"))?;
        Ok(edges.into_iter().map(|e| e.dependency_id).collect())
    }

    fn dependents(&self, resource: &str) -> StateResult<Vec<String>> {
        let edges: Vec<ResourceDependency> =
            self.list_prefix_in(DEPENDENTS, &format!("{resource}:"))?;
        Ok(edges.into_iter().map(|e| e.dependent_id).collect())
    }
}

impl EdgeSource for StateTxn<'_> {
    fn dependencies(&self, resource: &str) -> StateResult<Vec<String>> {
        let edges: Vec<ResourceDependency> = self.list_prefix(&format!("{resource}:"))?;
        Ok(edges.into_iter().map(|e| e.dependency_id).collect())
    }

    fn dependents(&self, resource: &str) -> StateResult<Vec<String>> {
        let edges: Vec<ResourceDependency> =
            self.list_prefix_in(DEPENDENTS, &format!("{resource}:"))?;
        Ok(edges.into_iter().map(|e| e.dependent_id).collect())
    }
}

/// Whether adding `dependent -> dependency` closes a cycle: the dependency
/// side reaching back to the dependent. Adjacency is loaded only for the
/// nodes the walk touches.
fn would_cycle(source: &impl EdgeSource, dependent: &str, dependency: &str) -> StateResult<bool> {
    if dependent == dependency {
        return Ok(true);
    }
    let mut adjacency: HashMap<String, Vec<String>> = HashMap::new();
    let mut seen: HashSet<String> = HashSet::from([dependency.to_string()]);
    let mut stack = vec![dependency.to_string()];
    while let Some(node) = stack.pop() {
        if !adjacency.contains_key(&node) {
            let next = source.dependencies(&node)?;
            adjacency.insert(node.clone(), next);
        }
        for next in adjacency.get(&node).into_iter().flatten() {
            if next == dependent {
                return Ok(true);
            }
            if seen.insert(next.clone()) {
                stack.push(next.clone());
            }
        }
    }
    Ok(false)
}

/// Post-order walk over dependents of `roots`. Every resource is listed
/// before anything it depends on; the roots themselves are excluded.
fn walk_dependents(source: &impl EdgeSource, roots: &[String]) -> StateResult<Vec<String>> {
    let excluded: HashSet<&str> = roots.iter().map(String::as_str).collect();
    let mut expanded: HashSet<String> = HashSet::new();
    let mut order = Vec::new();
    let mut stack: Vec<(String, bool)> = roots.iter().rev().map(|r| (r.clone(), false)).collect();

    while let Some((node, done)) = stack.pop() {
        if done {
            if !excluded.contains(node.as_str()) {
                order.push(node);
            }
            continue;
        }
        if !expanded.insert(node.clone()) {
            continue;
        }
        stack.push((node.clone(), true));
        let mut children = source.dependents(&node)?;
        children.sort();
        for child in children.into_iter().rev() {
            if !expanded.contains(&child) {
                stack.push((child, false));
            }
        }
    }
    Ok(order)
}

/// Resource dependency graph over the state store.
#[derive(Clone)]
pub struct DependencyGraph {
    store: StateStore,
}

impl DependencyGraph {
    pub fn new(store: StateStore) -> Self {
        Self { store }
    }

    /// Record that `dependent` requires `dependency`. Fails with a conflict
    /// on a self-edge or a cycle, leaving the graph untouched. Returns false
    /// if the edge already existed.
    pub fn add_edge(&self, dependent: &str, dependency: &str) -> GraphResult<bool> {
        self.store
            .write(|txn| Self::add_edge_in(txn, dependent, dependency))
    }

    /// Transactional form of [`Self::add_edge`]; the check sees the
    /// transaction's uncommitted edges.
    pub fn add_edge_in(txn: &StateTxn<'_>, dependent: &str, dependency: &str) -> GraphResult<bool> {
        if dependent == dependency {
            return Err(GraphError::SelfEdge(dependent.to_string()));
        }
        let edge = ResourceDependency {
            dependent_id: dependent.to_string(),
            dependency_id: dependency.to_string(),
            created_at: epoch_secs(),
        };
        if txn.get::<ResourceDependency>(&format!("{dependent}:{dependency}"))?.is_some() {
            return Ok(false);
        }
        if would_cycle(txn, dependent, dependency)? {
            return Err(GraphError::Cycle {
                dependent: dependent.to_string(),
                dependency: dependency.to_string(),
            });
        }
        txn.put(&edge)?;
        txn.put_in(DEPENDENTS, &edge.reverse_key(), &edge)?;
        debug!(%dependent, %dependency, "dependency edge added");
        Ok(true)
    }

    /// Whether adding `dependent -> dependency` would be rejected.
    pub fn has_cycle(&self, dependent: &str, dependency: &str) -> GraphResult<bool> {
        Ok(would_cycle(&self.store, dependent, dependency)?)
    }

    /// Everything that transitively depends on `resource`, most dependent
    /// first. This is the safe destroy order.
    pub fn dependents_of(&self, resource: &str) -> GraphResult<Vec<String>> {
        self.dependents_of_all(&[resource.to_string()])
    }

    /// [`Self::dependents_of`] over several roots at once.
    pub fn dependents_of_all(&self, resources: &[String]) -> GraphResult<Vec<String>> {
        Ok(walk_dependents(&self.store, resources)?)
    }

    /// Direct dependencies of `resource`.
    pub fn dependencies_of(&self, resource: &str) -> GraphResult<Vec<String>> {
        Ok(self.store.dependencies(resource)?)
    }

    pub fn is_referenced(&self, resource: &str) -> GraphResult<bool> {
        Ok(!self.store.dependents(resource)?.is_empty())
    }

    /// Transactional form of [`Self::is_referenced`].
    pub fn is_referenced_in(txn: &StateTxn<'_>, resource: &str) -> GraphResult<bool> {
        Ok(!txn.dependents(resource)?.is_empty())
    }

    /// Drop every edge touching `resource`, in both directions.
    pub fn remove_resource_edges_in(txn: &StateTxn<'_>, resource: &str) -> GraphResult<usize> {
        let mut removed = 0;
        for dependency in txn.dependencies(resource)? {
            txn.delete::<ResourceDependency>(&format!("{resource}:{dependency}"))?;
            txn.delete_in(DEPENDENTS, &format!("{dependency}:{resource}"))?;
            removed += 1;
        }
        for dependent in txn.dependents(resource)? {
            txn.delete::<ResourceDependency>(&format!("{dependent}:{resource}"))?;
            txn.delete_in(DEPENDENTS, &format!("{resource}:{dependent}"))?;
            removed += 1;
        }
        if removed > 0 {
            debug!(%resource, removed, "dependency edges removed");
        }
        Ok(removed)
    }
}
