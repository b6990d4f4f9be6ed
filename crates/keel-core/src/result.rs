//! Build, stage, recipe and command results.
//!
//! Results form a tree: a build owns stages, each stage owns one recipe, and
//! each recipe owns its ordered commands. A parent's state is the worst of
//! its children's once they are all terminal.

use crate::ids::{AgentId, BuildId, ProjectId, RecipeId, TriggerId};
use crate::revision::Revision;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultState {
    Pending,
    InProgress,
    Success,
    Failure,
    Error,
    /// The node was never executed because an earlier sibling stopped the
    /// recipe.
    NotRun,
}

impl ResultState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ResultState::Success | ResultState::Failure | ResultState::Error | ResultState::NotRun
        )
    }

    pub fn is_broken(&self) -> bool {
        matches!(self, ResultState::Failure | ResultState::Error)
    }

    fn severity(&self) -> u8 {
        match self {
            ResultState::NotRun => 0,
            ResultState::Success => 1,
            ResultState::Failure => 2,
            ResultState::Error => 3,
            ResultState::Pending | ResultState::InProgress => 0,
        }
    }

    /// Worst-case reduction over terminal states. `NotRun` children do not
    /// affect the outcome; an empty set reduces to `Success`.
    pub fn worst<I: IntoIterator<Item = ResultState>>(states: I) -> ResultState {
        states
            .into_iter()
            .filter(|s| *s != ResultState::NotRun)
            .fold(ResultState::Success, |acc, s| {
                if s.severity() > acc.severity() { s } else { acc }
            })
    }
}

impl std::fmt::Display for ResultState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ResultState::Pending => "pending",
            ResultState::InProgress => "in progress",
            ResultState::Success => "success",
            ResultState::Failure => "failure",
            ResultState::Error => "error",
            ResultState::NotRun => "not run",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandResult {
    pub index: usize,
    pub name: String,
    pub state: ResultState,
    pub exit_code: Option<i32>,
    pub message: Option<String>,
    /// Findings recorded by post-processors (e.g. matched error lines).
    #[serde(default)]
    pub features: Vec<String>,
    #[serde(default)]
    pub artifacts: Vec<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl CommandResult {
    pub fn new(index: usize, name: impl Into<String>) -> Self {
        Self {
            index,
            name: name.into(),
            state: ResultState::Pending,
            exit_code: None,
            message: None,
            features: vec![],
            artifacts: vec![],
            started_at: None,
            completed_at: None,
        }
    }

    pub fn start(&mut self) {
        self.state = ResultState::InProgress;
        self.started_at = Some(Utc::now());
    }

    pub fn complete(&mut self, state: ResultState, exit_code: Option<i32>) {
        self.state = state;
        self.exit_code = exit_code;
        self.completed_at = Some(Utc::now());
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecipeResult {
    pub id: RecipeId,
    pub project: ProjectId,
    pub recipe: String,
    pub revision: Revision,
    pub agent: Option<AgentId>,
    pub state: ResultState,
    pub commands: Vec<CommandResult>,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl RecipeResult {
    pub fn new(
        id: RecipeId,
        project: ProjectId,
        recipe: impl Into<String>,
        revision: Revision,
        command_names: &[String],
    ) -> Self {
        Self {
            id,
            project,
            recipe: recipe.into(),
            revision,
            agent: None,
            state: ResultState::Pending,
            commands: command_names
                .iter()
                .enumerate()
                .map(|(i, n)| CommandResult::new(i, n.clone()))
                .collect(),
            error: None,
            started_at: None,
            completed_at: None,
        }
    }

    pub fn start(&mut self) {
        if self.state == ResultState::Pending {
            self.state = ResultState::InProgress;
            self.started_at = Some(Utc::now());
        }
    }

    /// Reduce the command states into the recipe state. Does nothing until
    /// every command is terminal.
    pub fn complete(&mut self) -> bool {
        if !self.commands.iter().all(|c| c.state.is_terminal()) {
            return false;
        }
        let reduced = ResultState::worst(self.commands.iter().map(|c| c.state));
        self.state = if self.error.is_some() {
            ResultState::Error
        } else {
            reduced
        };
        self.completed_at = Some(Utc::now());
        true
    }

    /// Force the recipe into `Error`, e.g. when its agent is lost. Commands
    /// that were running become `Error`, those not yet started `NotRun`.
    pub fn terminate(&mut self, message: impl Into<String>) {
        for command in &mut self.commands {
            match command.state {
                ResultState::InProgress => command.complete(ResultState::Error, None),
                ResultState::Pending => command.state = ResultState::NotRun,
                _ => {}
            }
        }
        self.error = Some(message.into());
        self.state = ResultState::Error;
        self.completed_at = Some(Utc::now());
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageResult {
    pub name: String,
    pub recipe: RecipeResult,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildResult {
    pub id: BuildId,
    pub project: ProjectId,
    pub revision: Revision,
    pub trigger: Option<TriggerId>,
    pub state: ResultState,
    pub stages: Vec<StageResult>,
    pub queued_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl BuildResult {
    pub fn new(
        id: BuildId,
        project: ProjectId,
        revision: Revision,
        trigger: Option<TriggerId>,
        stages: Vec<StageResult>,
    ) -> Self {
        Self {
            id,
            project,
            revision,
            trigger,
            state: ResultState::InProgress,
            stages,
            queued_at: Utc::now(),
            completed_at: None,
        }
    }

    pub fn stage_for_recipe_mut(&mut self, recipe: RecipeId) -> Option<&mut StageResult> {
        self.stages.iter_mut().find(|s| s.recipe.id == recipe)
    }

    /// Reduce stage states into the build state once every stage is
    /// terminal. Returns true if the build reached a terminal state.
    pub fn update_state(&mut self) -> bool {
        if !self.stages.iter().all(|s| s.recipe.is_terminal()) {
            return false;
        }
        self.state = ResultState::worst(self.stages.iter().map(|s| s.recipe.state));
        self.completed_at = Some(Utc::now());
        true
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}
