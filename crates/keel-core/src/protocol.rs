//! Messages exchanged between the master and its agents.
//!
//! For every accepted `RecipeRequest` an agent sends zero or more
//! `RecipeProgress` messages followed by exactly one `RecipeResult`. If the
//! agent is lost no result arrives and the master times the recipe out.

use crate::agent::{AgentStatus, SystemMetrics};
use crate::ids::{BuildId, ProjectId, RecipeId};
use crate::project::{RecipeDefinition, ScmConfig};
use crate::resource::ResourceProperty;
use crate::result::{CommandResult, ResultState};
use crate::revision::Revision;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecipeRequest {
    pub recipe_id: RecipeId,
    pub build_id: BuildId,
    pub project: ProjectId,
    pub stage: String,
    pub recipe: RecipeDefinition,
    pub revision: Revision,
    /// Resolved properties in resource declaration order.
    pub resource_properties: Vec<ResourceProperty>,
    /// When present the agent checks the source out before running commands.
    pub scm: Option<ScmConfig>,
}

/// Master to agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MasterMessage {
    RecipeRequest(RecipeRequest),
    Ping { seq: u64 },
    Abort { recipe_id: RecipeId },
}

/// Agent to master.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentMessage {
    RecipeProgress {
        recipe_id: RecipeId,
        /// `None` reports the recipe as a whole (bootstrapped, post-processing).
        command_index: Option<usize>,
        status: ResultState,
    },
    RecipeResult {
        recipe_id: RecipeId,
        status: ResultState,
        commands: Vec<CommandResult>,
        error: Option<String>,
    },
    Pong {
        seq: u64,
        status: AgentStatus,
        current_recipe: Option<RecipeId>,
        metrics: Option<SystemMetrics>,
    },
}

impl AgentMessage {
    pub fn recipe_id(&self) -> Option<RecipeId> {
        match self {
            AgentMessage::RecipeProgress { recipe_id, .. }
            | AgentMessage::RecipeResult { recipe_id, .. } => Some(*recipe_id),
            AgentMessage::Pong { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_are_tagged() {
        let json = serde_json::to_value(MasterMessage::Ping { seq: 7 }).unwrap();
        assert_eq!(json["type"], "ping");
        assert_eq!(json["seq"], 7);

        let msg = AgentMessage::RecipeProgress {
            recipe_id: RecipeId::new(),
            command_index: Some(1),
            status: ResultState::InProgress,
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "recipe_progress");
        assert_eq!(json["status"], "in_progress");
    }
}
