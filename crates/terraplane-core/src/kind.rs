//! Deployment types and the partition ordering derived from them.

use serde::{Deserialize, Serialize};

/// The four deployment kinds. Each kind is compiled and executed as its own
/// partition per project.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentType {
    Infrastructure,
    InfraConfig,
    Application,
    AppConfig,
}

impl DeploymentType {
    /// Order in which partitions are created and refreshed.
    pub const APPLY_ORDER: [DeploymentType; 4] = [
        DeploymentType::Infrastructure,
        DeploymentType::InfraConfig,
        DeploymentType::Application,
        DeploymentType::AppConfig,
    ];

    /// Order in which partitions are torn down (most dependent first).
    pub const DESTROY_ORDER: [DeploymentType; 4] = [
        DeploymentType::AppConfig,
        DeploymentType::Application,
        DeploymentType::InfraConfig,
        DeploymentType::Infrastructure,
    ];

    /// Directory / remote-state name of this partition.
    pub fn partition_name(&self) -> &'static str {
        match self {
            DeploymentType::Infrastructure => "infrastructure",
            DeploymentType::InfraConfig => "infra_config",
            DeploymentType::Application => "application",
            DeploymentType::AppConfig => "app_config",
        }
    }

    /// Position in [`Self::DESTROY_ORDER`]; lower is destroyed earlier.
    pub fn destroy_priority(&self) -> usize {
        Self::DESTROY_ORDER
            .iter()
            .position(|t| t == self)
            .unwrap_or(Self::DESTROY_ORDER.len())
    }
}
