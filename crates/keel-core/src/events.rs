//! Events published on the bus.
//!
//! Events are the only coupling between components: the scheduler, the
//! dispatcher, the aggregator and external collaborators all react to the
//! same facts without holding references to each other.

use crate::agent::DisconnectReason;
use crate::ids::{AgentId, BuildId, EventId, ProjectId, RecipeId, TriggerId};
use crate::protocol::AgentMessage;
use crate::result::{BuildResult, RecipeResult};
use crate::revision::Revision;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Something that happened, plus the failures of the listeners that handled
/// it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    /// Component that published the event.
    pub source: String,
    pub payload: EventPayload,
    pub occurred_at: DateTime<Utc>,
    /// Filled in by the bus during dispatch.
    #[serde(default)]
    exceptions: Vec<ListenerFailure>,
}

impl Event {
    pub fn new(source: impl Into<String>, payload: EventPayload) -> Self {
        Self {
            id: EventId::new(),
            source: source.into(),
            payload,
            occurred_at: Utc::now(),
            exceptions: vec![],
        }
    }

    pub fn kind(&self) -> EventKind {
        self.payload.kind()
    }

    pub fn add_exception(&mut self, failure: ListenerFailure) {
        self.exceptions.push(failure);
    }

    pub fn exceptions(&self) -> &[ListenerFailure] {
        &self.exceptions
    }

    pub fn has_exceptions(&self) -> bool {
        !self.exceptions.is_empty()
    }
}

/// A listener that failed (returned an error or panicked) while handling an
/// event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListenerFailure {
    pub listener: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    // SCM
    ScmChanged {
        project: ProjectId,
        previous: Option<Revision>,
        revision: Revision,
    },
    ScmPollFailed {
        project: ProjectId,
        error: String,
    },

    // Scheduling
    TriggerFired {
        trigger_id: TriggerId,
        trigger_name: String,
        project: ProjectId,
        task_failures: Vec<String>,
    },
    BuildRequested {
        project: ProjectId,
        revision: Option<Revision>,
        trigger: Option<TriggerId>,
        reason: String,
    },
    BuildRejected {
        project: ProjectId,
        trigger: Option<TriggerId>,
        reason: String,
    },

    // Dispatch and results
    BuildStarted {
        build: BuildResult,
    },
    RecipeDispatched {
        build_id: BuildId,
        recipe_id: RecipeId,
        agent_id: AgentId,
        project: ProjectId,
        recipe: String,
    },
    RecipeCompleted {
        build_id: BuildId,
        result: RecipeResult,
    },
    BuildCompleted {
        build: BuildResult,
    },

    // Agents
    AgentRegistered {
        agent_id: AgentId,
        name: String,
    },
    AgentMessageReceived {
        agent_id: AgentId,
        message: AgentMessage,
    },
    AgentDisconnected {
        agent_id: AgentId,
        reason: DisconnectReason,
    },

    // Configuration
    ProjectRemoved {
        project: ProjectId,
    },
}

/// Discriminant used for subscriptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    ScmChanged,
    ScmPollFailed,
    TriggerFired,
    BuildRequested,
    BuildRejected,
    BuildStarted,
    RecipeDispatched,
    RecipeCompleted,
    BuildCompleted,
    AgentRegistered,
    AgentMessageReceived,
    AgentDisconnected,
    ProjectRemoved,
}

impl EventPayload {
    pub fn kind(&self) -> EventKind {
        match self {
            EventPayload::ScmChanged { .. } => EventKind::ScmChanged,
            EventPayload::ScmPollFailed { .. } => EventKind::ScmPollFailed,
            EventPayload::TriggerFired { .. } => EventKind::TriggerFired,
            EventPayload::BuildRequested { .. } => EventKind::BuildRequested,
            EventPayload::BuildRejected { .. } => EventKind::BuildRejected,
            EventPayload::BuildStarted { .. } => EventKind::BuildStarted,
            EventPayload::RecipeDispatched { .. } => EventKind::RecipeDispatched,
            EventPayload::RecipeCompleted { .. } => EventKind::RecipeCompleted,
            EventPayload::BuildCompleted { .. } => EventKind::BuildCompleted,
            EventPayload::AgentRegistered { .. } => EventKind::AgentRegistered,
            EventPayload::AgentMessageReceived { .. } => EventKind::AgentMessageReceived,
            EventPayload::AgentDisconnected { .. } => EventKind::AgentDisconnected,
            EventPayload::ProjectRemoved { .. } => EventKind::ProjectRemoved,
        }
    }
}

impl std::fmt::Display for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}({}) from {}", self.kind(), self.id, self.source)
    }
}
