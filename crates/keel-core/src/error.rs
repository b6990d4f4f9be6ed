//! Error types for Keel CI.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    // Configuration errors
    #[error("Invalid cron expression '{expression}': {reason}")]
    InvalidCron { expression: String, reason: String },

    #[error("Property with name '{name}' already exists with value '{existing}'")]
    DuplicateProperty { name: String, existing: String },

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("A trigger named '{name}' is already scheduled for project {project}")]
    TriggerExists { project: String, name: String },

    // Lookup errors
    #[error("Project not found: {0}")]
    ProjectNotFound(String),

    #[error("Recipe not found: {0}")]
    RecipeNotFound(String),

    #[error("Resource not found: {0}")]
    ResourceNotFound(String),

    #[error("Trigger not found: {0}")]
    TriggerNotFound(String),

    #[error("Agent not found: {0}")]
    AgentNotFound(String),

    #[error("Recipe is not in flight: {0}")]
    RecipeNotInFlight(String),

    // SCM errors
    #[error(transparent)]
    Scm(#[from] ScmError),

    // Dispatch errors
    #[error("No available agent with capabilities {0:?}")]
    NoAgentAvailable(Vec<String>),

    #[error("Recipe '{recipe}' of project {project} at revision {revision} is already in flight")]
    AlreadyInFlight {
        project: String,
        recipe: String,
        revision: String,
    },

    // Execution errors
    #[error("Unresolved variable reference '${{{variable}}}' in property '{property}'")]
    UnresolvedVariable { property: String, variable: String },

    #[error("Bootstrap failed: {0}")]
    Bootstrap(String),

    #[error("Command '{command}' failed: {message}")]
    CommandFailed { command: String, message: String },

    #[error("Recipe cancelled")]
    Cancelled,

    // Infrastructure errors
    #[error("Agent disconnected: {0}")]
    AgentDisconnected(String),

    #[error("Recipe timed out after {seconds} seconds")]
    RecipeTimeout { seconds: u64 },

    #[error("Agent {agent} missed heartbeats for {seconds} seconds")]
    HeartbeatTimeout { agent: String, seconds: u64 },

    #[error("Transport error: {0}")]
    Transport(String),

    // Listener errors
    #[error("Listener error: {0}")]
    Listener(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Failures reported by source control collaborators.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ScmError {
    #[error("Repository unreachable at {location}: {reason}")]
    Unreachable { location: String, reason: String },

    #[error("Unknown revision '{revision}' in {location}")]
    UnknownRevision { location: String, revision: String },

    #[error("SCM error: {0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl Error {
    /// True for failures that stem from agents or the transport rather than
    /// from the build itself.
    pub fn is_infrastructure(&self) -> bool {
        matches!(
            self,
            Error::AgentDisconnected(_)
                | Error::RecipeTimeout { .. }
                | Error::HeartbeatTimeout { .. }
                | Error::Transport(_)
        )
    }

    /// True for dispatch rejections the caller may retry later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::NoAgentAvailable(_) | Error::Scm(ScmError::Unreachable { .. }))
    }
}
