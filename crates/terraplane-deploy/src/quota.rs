//! QuotaAccountant — per-project usage against quota limits.
//!
//! Committed usage is the sum over the project's resources. Deployments
//! that are queued or executing hold a reservation of their requested
//! usage on top of that, so concurrent creations cannot jointly exceed a
//! limit. Metrics without a configured limit are unconstrained.

use std::collections::BTreeMap;

use terraplane_state::{
    Deployment, ProjectResourceQuota, Resource, StateStore, StateTxn, epoch_secs,
};
use tracing::debug;

use crate::error::{DeployError, DeployResult};

#[derive(Clone)]
pub struct QuotaAccountant {
    store: StateStore,
}

impl QuotaAccountant {
    pub fn new(store: StateStore) -> Self {
        Self { store }
    }

    /// The project's quota record, created zeroed if absent.
    pub fn get_quota(&self, project_id: &str) -> DeployResult<ProjectResourceQuota> {
        self.store.write(|txn| Self::get_quota_in(txn, project_id))
    }

    pub fn get_quota_in(txn: &StateTxn<'_>, project_id: &str) -> DeployResult<ProjectResourceQuota> {
        if let Some(quota) = txn.get::<ProjectResourceQuota>(project_id)? {
            return Ok(quota);
        }
        let quota = ProjectResourceQuota::zeroed(project_id);
        txn.put(&quota)?;
        debug!(%project_id, "quota record created");
        Ok(quota)
    }

    /// Replace the project's limits. Usage is recomputed alongside.
    pub fn set_quota(
        &self,
        project_id: &str,
        quotas: BTreeMap<String, u64>,
    ) -> DeployResult<ProjectResourceQuota> {
        self.store.write(|txn| -> DeployResult<_> {
            let mut quota = Self::recompute_usage_in(txn, project_id)?;
            quota.quotas = quotas;
            quota.updated_at = epoch_secs();
            txn.put(&quota)?;
            Ok(quota)
        })
    }

    /// Full recompute of committed usage from resource rows.
    pub fn recompute_usage(&self, project_id: &str) -> DeployResult<ProjectResourceQuota> {
        self.store
            .write(|txn| Self::recompute_usage_in(txn, project_id))
    }

    pub fn recompute_usage_in(
        txn: &StateTxn<'_>,
        project_id: &str,
    ) -> DeployResult<ProjectResourceQuota> {
        let mut quota = Self::get_quota_in(txn, project_id)?;
        let mut usage: BTreeMap<String, u64> = BTreeMap::new();
        for resource in txn.list::<Resource>()? {
            if resource.project_id != project_id {
                continue;
            }
            for (metric, amount) in &resource.usage {
                *usage.entry(metric.clone()).or_default() += amount;
            }
        }
        if usage != quota.usage {
            debug!(%project_id, ?usage, "quota usage recomputed");
        }
        quota.usage = usage;
        quota.updated_at = epoch_secs();
        txn.put(&quota)?;
        Ok(quota)
    }

    /// Adjust committed usage by `delta` per metric (negative on removal).
    pub fn increment_usage(
        &self,
        project_id: &str,
        delta: &BTreeMap<String, i64>,
    ) -> DeployResult<ProjectResourceQuota> {
        self.store
            .write(|txn| Self::increment_usage_in(txn, project_id, delta))
    }

    pub fn increment_usage_in(
        txn: &StateTxn<'_>,
        project_id: &str,
        delta: &BTreeMap<String, i64>,
    ) -> DeployResult<ProjectResourceQuota> {
        let mut quota = Self::get_quota_in(txn, project_id)?;
        for (metric, change) in delta {
            let current = quota.usage.entry(metric.clone()).or_default();
            *current = current.saturating_add_signed(*change);
        }
        quota.updated_at = epoch_secs();
        txn.put(&quota)?;
        Ok(quota)
    }

    /// Check `requested` against what is left after committed usage and
    /// the reservations of other in-flight deployments.
    pub fn validate(
        &self,
        project_id: &str,
        requested: &BTreeMap<String, u64>,
        exclude: Option<&str>,
    ) -> DeployResult<()> {
        self.store
            .write(|txn| Self::validate_in(txn, project_id, requested, exclude))
    }

    /// Transactional form of [`Self::validate`]. Usage is recomputed first;
    /// on failure the enclosing transaction is discarded.
    pub fn validate_in(
        txn: &StateTxn<'_>,
        project_id: &str,
        requested: &BTreeMap<String, u64>,
        exclude: Option<&str>,
    ) -> DeployResult<()> {
        let quota = Self::recompute_usage_in(txn, project_id)?;
        let reserved = Self::reserved_in(txn, project_id, exclude)?;
        for (metric, &amount) in requested {
            if amount == 0 {
                continue;
            }
            let Some(available) = quota.available(metric) else {
                continue;
            };
            let available =
                available.saturating_sub(reserved.get(metric).copied().unwrap_or(0));
            if amount > available {
                return Err(DeployError::QuotaExceeded {
                    metric: metric.clone(),
                    available,
                    requested: amount,
                });
            }
        }
        Ok(())
    }

    /// Usage reserved by in-flight deployments of the project.
    fn reserved_in(
        txn: &StateTxn<'_>,
        project_id: &str,
        exclude: Option<&str>,
    ) -> DeployResult<BTreeMap<String, u64>> {
        let mut reserved: BTreeMap<String, u64> = BTreeMap::new();
        for deployment in txn.list::<Deployment>()? {
            if deployment.project_id != project_id
                || Some(deployment.id.as_str()) == exclude
                || !deployment.reserves_quota()
            {
                continue;
            }
            for (metric, amount) in &deployment.requested_usage {
                *reserved.entry(metric.clone()).or_default() += amount;
            }
        }
        Ok(reserved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resource(id: &str, project: &str, cpu: u64) -> Resource {
        Resource {
            id: id.to_string(),
            project_id: project.to_string(),
            deployment_id: format!("dep-{id}"),
            name: id.to_string(),
            resource_type: "vm".to_string(),
            details: BTreeMap::new(),
            usage: BTreeMap::from([("cpu".to_string(), cpu)]),
            created_at: 0,
            updated_at: 0,
        }
    }

    fn cpu(n: u64) -> BTreeMap<String, u64> {
        BTreeMap::from([("cpu".to_string(), n)])
    }

    #[test]
    fn get_quota_creates_zeroed_record() {
        let store = StateStore::open_in_memory().unwrap();
        let quotas = QuotaAccountant::new(store.clone());
        let quota = quotas.get_quota("p1").unwrap();
        assert!(quota.quotas.is_empty());
        assert!(quota.usage.is_empty());
        assert!(store.get::<ProjectResourceQuota>("p1").unwrap().is_some());
    }

    #[test]
    fn validate_recomputes_before_comparing() {
        let store = StateStore::open_in_memory().unwrap();
        let quotas = QuotaAccountant::new(store.clone());
        quotas.set_quota("p1", cpu(4)).unwrap();
        store.put(&resource("r1", "p1", 2)).unwrap();
        store.put(&resource("r2", "p2", 4)).unwrap();

        let err = quotas.validate("p1", &cpu(3), None).unwrap_err();
        match err {
            DeployError::QuotaExceeded {
                metric,
                available,
                requested,
            } => {
                assert_eq!(metric, "cpu");
                assert_eq!(available, 2);
                assert_eq!(requested, 3);
            }
            other => panic!("unexpected error: {other}"),
        }
        quotas.validate("p1", &cpu(2), None).unwrap();
        assert_eq!(quotas.get_quota("p1").unwrap().usage["cpu"], 2);
    }

    #[test]
    fn unconstrained_metrics_pass() {
        let store = StateStore::open_in_memory().unwrap();
        let quotas = QuotaAccountant::new(store);
        quotas.set_quota("p1", cpu(1)).unwrap();
        let requested = BTreeMap::from([("memory".to_string(), 1 << 40)]);
        quotas.validate("p1", &requested, None).unwrap();
    }

    #[test]
    fn increment_adjusts_usage() {
        let store = StateStore::open_in_memory().unwrap();
        let quotas = QuotaAccountant::new(store);
        quotas
            .increment_usage("p1", &BTreeMap::from([("cpu".to_string(), 3)]))
            .unwrap();
        let quota = quotas
            .increment_usage("p1", &BTreeMap::from([("cpu".to_string(), -5)]))
            .unwrap();
        assert_eq!(quota.usage["cpu"], 0);
    }
}
