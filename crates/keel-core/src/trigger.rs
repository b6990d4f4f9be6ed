//! Trigger definitions as supplied by configuration.

use crate::revision::Revision;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TriggerSchedule {
    /// Quartz-style cron: seconds, minutes, hours, day of month, month, day
    /// of week and an optional year.
    Cron { expression: String },
    /// Fires when a new revision is detected for the project.
    ScmChange,
}

/// Work performed when a trigger fires.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskConfig {
    /// Request a build of the owning project. Without a fixed revision the
    /// revision carried by the firing (if any) is used, otherwise the latest.
    RequestBuild {
        #[serde(default)]
        revision: Option<Revision>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerConfig {
    pub name: String,
    #[serde(flatten)]
    pub schedule: TriggerSchedule,
    #[serde(default = "default_tasks")]
    pub tasks: Vec<TaskConfig>,
    /// Create the trigger paused.
    #[serde(default)]
    pub paused: bool,
}

fn default_tasks() -> Vec<TaskConfig> {
    vec![TaskConfig::RequestBuild { revision: None }]
}

impl TriggerConfig {
    pub fn cron(name: impl Into<String>, expression: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            schedule: TriggerSchedule::Cron {
                expression: expression.into(),
            },
            tasks: default_tasks(),
            paused: false,
        }
    }

    pub fn scm_change(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            schedule: TriggerSchedule::ScmChange,
            tasks: default_tasks(),
            paused: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trigger_defaults_to_build_request() {
        let trigger: TriggerConfig =
            serde_json::from_str(r#"{"name": "nightly", "type": "cron", "expression": "0 0 2 * * ?"}"#)
                .unwrap();
        assert_eq!(trigger.tasks, vec![TaskConfig::RequestBuild { revision: None }]);
        assert!(!trigger.paused);
        assert!(matches!(trigger.schedule, TriggerSchedule::Cron { .. }));
    }
}
