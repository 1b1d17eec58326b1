//! terraplane.toml configuration parser.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlPlaneConfig {
    pub server: ServerConfig,
    pub executor: ExecutorConfig,
    pub queue: QueueConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
    pub data_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Provisioning tool binary (`terraform`, `tofu`, or an absolute path).
    pub binary: String,
    /// Root of the per-project, per-partition working directories.
    pub work_root: PathBuf,
    /// Base directory for relative local module sources.
    pub module_root: PathBuf,
    /// How often buffered tool output is flushed to the log store ("2s").
    pub log_flush_interval: String,
    /// File name of the saved plan inside a partition directory.
    pub plan_file: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Deliveries per message before it is dropped (2 = one redelivery).
    pub max_deliveries: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8480,
            data_dir: PathBuf::from("/var/lib/terraplane"),
        }
    }
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            binary: "terraform".to_string(),
            work_root: PathBuf::from("/var/lib/terraplane/work"),
            module_root: PathBuf::from("/var/lib/terraplane/modules"),
            log_flush_interval: "2s".to_string(),
            plan_file: "tfplan".to_string(),
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self { max_deliveries: 2 }
    }
}

impl ControlPlaneConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: ControlPlaneConfig = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Parsed flush interval; falls back to two seconds on a malformed value.
    pub fn log_flush_interval(&self) -> Duration {
        parse_duration(&self.executor.log_flush_interval).unwrap_or(Duration::from_secs(2))
    }
}

/// Parse a duration string like "5s", "500ms", "1m".
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if let Some(ms) = s.strip_suffix("ms") {
        ms.parse::<u64>().ok().map(Duration::from_millis)
    } else if let Some(secs) = s.strip_suffix('s') {
        secs.parse::<u64>().ok().map(Duration::from_secs)
    } else if let Some(mins) = s.strip_suffix('m') {
        mins.parse::<u64>().ok().map(|m| Duration::from_secs(m * 60))
    } else {
        s.parse::<u64>().ok().map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_round_trip() {
        let config = ControlPlaneConfig::default();
        let toml_str = config.to_toml_string().unwrap();
        assert!(toml_str.contains("terraform"));
        let parsed: ControlPlaneConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.queue.max_deliveries, 2);
    }

    #[test]
    fn test_parse_partial() {
        let toml_str = r#"
[executor]
binary = "tofu"
log_flush_interval = "500ms"
"#;
        let config: ControlPlaneConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.executor.binary, "tofu");
        assert_eq!(config.executor.plan_file, "tfplan");
        assert_eq!(config.server.port, 8480);
        assert_eq!(config.log_flush_interval(), Duration::from_millis(500));
    }

    #[test]
    fn test_parse_duration_forms() {
        assert_eq!(parse_duration("5s"), Some(Duration::from_secs(5)));
        assert_eq!(parse_duration("1m"), Some(Duration::from_secs(60)));
        assert_eq!(parse_duration("250ms"), Some(Duration::from_millis(250)));
        assert_eq!(parse_duration("7"), Some(Duration::from_secs(7)));
        assert_eq!(parse_duration("soon"), None);
    }
}
