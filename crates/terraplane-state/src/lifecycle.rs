//! Partition membership.
//!
//! Whether a deployment's unit belongs in its partition's compiled artifacts
//! is decided here and nowhere else. The compiler and the queue workers both
//! go through [`compilable_deployments`].

use std::collections::HashMap;

use terraplane_core::DeploymentType;

use crate::types::{Deployment, DeploymentStatus};

/// Whether `deployment` is compiled into its partition.
///
/// Live deployments are compiled once they are being executed or have
/// completed. An original that was retired by a destroy twin stays compiled
/// while that twin has not started executing (`Waiting`, `Queued`,
/// `Pending`) or has failed, so neighbours referencing the unit keep a valid
/// target. Once the twin runs, the unit is dropped and the apply removes it.
///
/// The window is keyed on whether the twin is executing, not on whether it
/// is terminal: a `Failed` twin (terminal) keeps the unit, because the failed
/// destroy left the infrastructure in place, while a `Planning` or `Running`
/// twin (not terminal) already drops it, because that run is the one
/// removing it.
pub fn is_compilable_active(deployment: &Deployment, destroy_twin: Option<&Deployment>) -> bool {
    if deployment.destroy {
        return false;
    }
    if deployment.active {
        return matches!(
            deployment.status,
            DeploymentStatus::Completed | DeploymentStatus::Running | DeploymentStatus::Planning
        );
    }
    deployment.status == DeploymentStatus::Completed
        && destroy_twin.is_some_and(|twin| {
            twin.active
                && twin.destroy
                && twin.parent_deployment_id.as_deref() == Some(deployment.id.as_str())
                && matches!(
                    twin.status,
                    DeploymentStatus::Waiting
                        | DeploymentStatus::Queued
                        | DeploymentStatus::Pending
                        | DeploymentStatus::Failed
                )
        })
}

/// Active destroy twins of `deployments`, keyed by the original's id.
pub fn active_destroy_twins(deployments: &[Deployment]) -> HashMap<&str, &Deployment> {
    deployments
        .iter()
        .filter(|d| d.destroy && d.active)
        .filter_map(|d| d.parent_deployment_id.as_deref().map(|parent| (parent, d)))
        .collect()
}

/// The deployments of one partition whose units are compiled.
pub fn compilable_deployments(
    deployments: &[Deployment],
    deployment_type: DeploymentType,
) -> Vec<&Deployment> {
    let twins = active_destroy_twins(deployments);
    deployments
        .iter()
        .filter(|d| d.deployment_type == deployment_type)
        .filter(|d| is_compilable_active(d, twins.get(d.id.as_str()).copied()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::tests::test_deployment;

    fn retired_with_twin(twin_status: DeploymentStatus) -> (Deployment, Deployment) {
        let mut original = test_deployment("d1", "p1", DeploymentStatus::Completed);
        original.active = false;
        let mut twin = test_deployment("d1-x", "p1", twin_status);
        twin.destroy = true;
        twin.parent_deployment_id = Some("d1".to_string());
        (original, twin)
    }

    #[test]
    fn live_statuses() {
        for status in DeploymentStatus::ALL {
            let dep = test_deployment("d1", "p1", status);
            let expected = matches!(
                status,
                DeploymentStatus::Completed | DeploymentStatus::Running | DeploymentStatus::Planning
            );
            assert_eq!(is_compilable_active(&dep, None), expected, "{status}");
        }
    }

    #[test]
    fn twins_are_never_units() {
        let (_, twin) = retired_with_twin(DeploymentStatus::Running);
        assert!(!is_compilable_active(&twin, None));
    }

    #[test]
    fn retired_original_kept_until_twin_runs() {
        // Failed is terminal yet keeps the unit; Planning and Running are not
        // terminal yet drop it.
        for status in [
            DeploymentStatus::Waiting,
            DeploymentStatus::Queued,
            DeploymentStatus::Pending,
            DeploymentStatus::Failed,
        ] {
            let (original, twin) = retired_with_twin(status);
            assert!(is_compilable_active(&original, Some(&twin)), "{status}");
        }
        for status in [
            DeploymentStatus::Planning,
            DeploymentStatus::Running,
            DeploymentStatus::Completed,
        ] {
            let (original, twin) = retired_with_twin(status);
            assert!(!is_compilable_active(&original, Some(&twin)), "{status}");
        }
    }

    #[test]
    fn retired_original_without_twin_is_dropped() {
        let (original, _) = retired_with_twin(DeploymentStatus::Waiting);
        assert!(!is_compilable_active(&original, None));
    }

    #[test]
    fn partition_filter_uses_twins() {
        let (original, twin) = retired_with_twin(DeploymentStatus::Pending);
        let mut app = test_deployment("a1", "p1", DeploymentStatus::Completed);
        app.deployment_type = DeploymentType::Application;
        let all = vec![original, twin, app];

        let infra = compilable_deployments(&all, DeploymentType::Infrastructure);
        assert_eq!(infra.iter().map(|d| d.id.as_str()).collect::<Vec<_>>(), vec!["d1"]);
        let apps = compilable_deployments(&all, DeploymentType::Application);
        assert_eq!(apps.len(), 1);
    }
}
