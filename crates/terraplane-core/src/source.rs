//! Module source resolution.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum ModuleSource {
    /// Local directory copied into the partition: ./modules/network or file:///srv/modules/db
    Local { path: PathBuf },
    /// Git source passed through: git::https://example.com/modules.git//vpc?ref=v1
    Git { url: String },
    /// Archive over HTTP(S): https://releases.example.com/vpc.zip
    Https { url: String },
    /// Registry address: namespace/name/provider
    Registry { address: String },
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("unsupported module source: {0}")]
    UnsupportedScheme(String),
    #[error("invalid module source: {0}")]
    InvalidUri(String),
}

impl ModuleSource {
    pub fn parse(uri: &str) -> Result<Self, SourceError> {
        let uri = uri.trim();
        if uri.is_empty() {
            return Err(SourceError::InvalidUri(uri.to_string()));
        }
        if let Some(path) = uri.strip_prefix("file://") {
            Ok(ModuleSource::Local { path: PathBuf::from(path) })
        } else if uri.starts_with("git::") || uri.starts_with("git@") {
            Ok(ModuleSource::Git { url: uri.to_string() })
        } else if uri.starts_with("https://") || uri.starts_with("http://") {
            Ok(ModuleSource::Https { url: uri.to_string() })
        } else if uri.starts_with("./") || uri.starts_with("../") || uri.starts_with('/') {
            Ok(ModuleSource::Local { path: PathBuf::from(uri) })
        } else if uri.split('/').count() == 3 && !uri.contains("://") {
            Ok(ModuleSource::Registry { address: uri.to_string() })
        } else {
            Err(SourceError::UnsupportedScheme(uri.to_string()))
        }
    }

    pub fn scheme(&self) -> &'static str {
        match self {
            ModuleSource::Local { .. } => "local",
            ModuleSource::Git { .. } => "git",
            ModuleSource::Https { .. } => "https",
            ModuleSource::Registry { .. } => "registry",
        }
    }

    /// The `source` attribute for a unit block. Local modules are copied to
    /// `./modules/<unit>` so the unit refers to that copy.
    pub fn unit_source(&self, unit: &str) -> String {
        match self {
            ModuleSource::Local { .. } => format!("./modules/{unit}"),
            ModuleSource::Git { url } | ModuleSource::Https { url } => url.clone(),
            ModuleSource::Registry { address } => address.clone(),
        }
    }
}
