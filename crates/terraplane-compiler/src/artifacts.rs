//! The compiled artifact set of one partition and how it lands on disk.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use terraplane_core::DeploymentType;
use tracing::debug;
use walkdir::WalkDir;

use crate::error::CompileResult;

/// Files the compiler owns inside a partition directory. Anything else
/// (provider plugins, state files, saved plans) is left alone.
const MODULES_DIR: &str = "modules";
const TFVARS: &str = "terraform.tfvars.json";

#[derive(Clone, Default)]
pub struct ArtifactSet {
    pub project_id: String,
    pub deployment_type: Option<DeploymentType>,
    /// File name to content.
    pub files: BTreeMap<String, String>,
    /// Unit name to local module directory copied into `modules/<unit>`.
    pub modules: BTreeMap<String, PathBuf>,
    /// `TF_VAR_*` entries for secret inputs; never written to disk.
    pub secret_env: BTreeMap<String, String>,
    /// Deployment ids compiled as units.
    pub units: Vec<String>,
}

impl std::fmt::Debug for ArtifactSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArtifactSet")
            .field("project_id", &self.project_id)
            .field("deployment_type", &self.deployment_type)
            .field("files", &self.files.keys().collect::<Vec<_>>())
            .field("modules", &self.modules)
            .field("secret_env", &self.secret_env.keys().collect::<Vec<_>>())
            .field("units", &self.units)
            .finish()
    }
}

impl ArtifactSet {
    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    /// Replace the compiler-owned files in `dir` with this set.
    pub fn write_to(&self, dir: &Path) -> CompileResult<()> {
        std::fs::create_dir_all(dir)?;
        remove_stale(dir)?;

        for (name, content) in &self.files {
            std::fs::write(dir.join(name), content)?;
        }
        for (unit, source) in &self.modules {
            copy_dir(source, &dir.join(MODULES_DIR).join(unit))?;
        }
        debug!(
            dir = %dir.display(),
            files = self.files.len(),
            modules = self.modules.len(),
            "artifacts written"
        );
        Ok(())
    }
}

fn remove_stale(dir: &Path) -> CompileResult<()> {
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if path.is_dir() && name == MODULES_DIR {
            std::fs::remove_dir_all(&path)?;
        } else if path.is_file() && (name.ends_with(".tf") || name == TFVARS) {
            std::fs::remove_file(&path)?;
        }
    }
    Ok(())
}

fn copy_dir(source: &Path, target: &Path) -> CompileResult<()> {
    for entry in WalkDir::new(source).follow_links(false) {
        let entry = entry.map_err(std::io::Error::other)?;
        let relative = entry
            .path()
            .strip_prefix(source)
            .map_err(std::io::Error::other)?;
        let dest = target.join(relative);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&dest)?;
        } else if entry.file_type().is_file() {
            if let Some(parent) = dest.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::copy(entry.path(), &dest)?;
        }
    }
    Ok(())
}
