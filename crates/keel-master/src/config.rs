//! Master configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MasterConfig {
    /// A recipe still running after this long is forced to error.
    #[serde(default = "default_recipe_timeout")]
    pub recipe_timeout_secs: u64,
    /// An agent silent for this long is marked offline.
    #[serde(default = "default_heartbeat_timeout")]
    pub heartbeat_timeout_secs: u64,
    #[serde(default = "default_ping_interval")]
    pub ping_interval_secs: u64,
    /// How often timeouts are checked.
    #[serde(default = "default_watchdog_interval")]
    pub watchdog_interval_secs: u64,
    /// Repository locations kept in the SCM cache.
    #[serde(default = "default_scm_cache_capacity")]
    pub scm_cache_capacity: usize,
    #[serde(default = "default_scm_poll_interval")]
    pub scm_poll_interval_secs: u64,
}

fn default_recipe_timeout() -> u64 {
    3600
}

fn default_heartbeat_timeout() -> u64 {
    60
}

fn default_ping_interval() -> u64 {
    10
}

fn default_watchdog_interval() -> u64 {
    5
}

fn default_scm_cache_capacity() -> usize {
    64
}

fn default_scm_poll_interval() -> u64 {
    60
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            recipe_timeout_secs: default_recipe_timeout(),
            heartbeat_timeout_secs: default_heartbeat_timeout(),
            ping_interval_secs: default_ping_interval(),
            watchdog_interval_secs: default_watchdog_interval(),
            scm_cache_capacity: default_scm_cache_capacity(),
            scm_poll_interval_secs: default_scm_poll_interval(),
        }
    }
}

impl MasterConfig {
    /// Load configuration from a YAML file.
    pub fn from_file(path: &std::path::Path) -> Result<Self, std::io::Error> {
        let contents = std::fs::read_to_string(path)?;
        serde_yaml::from_str(&contents)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    pub fn recipe_timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.recipe_timeout_secs as i64)
    }

    pub fn heartbeat_timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.heartbeat_timeout_secs as i64)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs.max(1))
    }

    pub fn watchdog_interval(&self) -> Duration {
        Duration::from_secs(self.watchdog_interval_secs.max(1))
    }

    pub fn scm_poll_interval(&self) -> Duration {
        Duration::from_secs(self.scm_poll_interval_secs.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let config: MasterConfig = serde_yaml::from_str("recipe_timeout_secs: 120\n").unwrap();
        assert_eq!(config.recipe_timeout_secs, 120);
        assert_eq!(config.heartbeat_timeout_secs, 60);
        assert_eq!(config.scm_cache_capacity, 64);
    }
}
