//! Agent types.

use crate::ids::{AgentId, RecipeId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// The master's view of a registered agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentInfo {
    pub id: AgentId,
    pub name: String,
    pub capabilities: BTreeSet<String>,
    pub status: AgentStatus,
    pub current_recipe: Option<RecipeId>,
    pub registered_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    /// Host metrics from the latest pong.
    #[serde(default)]
    pub metrics: Option<SystemMetrics>,
}

impl AgentInfo {
    pub fn new(id: AgentId, name: impl Into<String>, capabilities: BTreeSet<String>) -> Self {
        let now = Utc::now();
        Self {
            id,
            name: name.into(),
            capabilities,
            status: AgentStatus::Idle,
            current_recipe: None,
            registered_at: now,
            last_seen_at: now,
            metrics: None,
        }
    }

    /// True if the agent offers every capability in `required`.
    pub fn satisfies(&self, required: &[String]) -> bool {
        required.iter().all(|c| self.capabilities.contains(c))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Idle,
    Busy,
    Offline,
}

impl AgentStatus {
    pub fn is_available(&self) -> bool {
        matches!(self, AgentStatus::Idle)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemMetrics {
    pub cpu_percent: f64,
    pub memory_used_bytes: u64,
    pub memory_total_bytes: u64,
    pub load_average: [f64; 3],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisconnectReason {
    Graceful,
    Timeout,
    Error,
}
