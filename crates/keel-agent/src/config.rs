//! Agent configuration.

use crate::postprocess::PostProcessorConfig;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Agent name reported to the master. Defaults to the host name.
    #[serde(default = "default_name")]
    pub name: String,
    /// Capabilities offered to stages, e.g. `linux` or `docker`.
    #[serde(default)]
    pub capabilities: BTreeSet<String>,
    /// Each recipe gets its own directory under here.
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,
    /// Remove a recipe's directory once its result has been reported.
    #[serde(default = "default_cleanup")]
    pub cleanup: bool,
    /// Run against every executed command's output, in order.
    #[serde(default)]
    pub post_processors: Vec<PostProcessorConfig>,
}

fn default_name() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "keel-agent".to_string())
}

fn default_work_dir() -> PathBuf {
    PathBuf::from("/var/keel/work")
}

fn default_cleanup() -> bool {
    true
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            capabilities: BTreeSet::new(),
            work_dir: default_work_dir(),
            cleanup: default_cleanup(),
            post_processors: vec![],
        }
    }
}

impl AgentConfig {
    /// Load configuration from a YAML file.
    pub fn from_file(path: &std::path::Path) -> Result<Self, std::io::Error> {
        let contents = std::fs::read_to_string(path)?;
        serde_yaml::from_str(&contents)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_minimal_yaml() {
        let config: AgentConfig = serde_yaml::from_str(
            "name: builder-1\ncapabilities: [linux]\npost_processors:\n  - type: artifacts\n",
        )
        .unwrap();
        assert_eq!(config.name, "builder-1");
        assert!(config.capabilities.contains("linux"));
        assert_eq!(config.work_dir, PathBuf::from("/var/keel/work"));
        assert!(config.cleanup);
        assert_eq!(config.post_processors, vec![PostProcessorConfig::Artifacts]);
    }
}
