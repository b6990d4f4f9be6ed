//! Runtime trigger state.

use crate::schedule::CronExpression;
use crate::task::Task;
use chrono::{DateTime, Utc};
use keel_core::ids::{ProjectId, TriggerId};
use serde::Serialize;
use std::sync::Arc;

/// `Active` and `Paused` move back and forth on operator request;
/// `Disabled` is terminal and entered when the owning project is removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerState {
    Active,
    Paused,
    Disabled,
}

#[derive(Debug, Clone)]
pub enum TriggerKind {
    Cron(CronExpression),
    ScmChange,
}

impl TriggerKind {
    fn describe(&self) -> String {
        match self {
            TriggerKind::Cron(expr) => format!("cron({})", expr),
            TriggerKind::ScmChange => "scm-change".to_string(),
        }
    }
}

pub(crate) struct Trigger {
    pub id: TriggerId,
    pub project: ProjectId,
    pub name: String,
    pub kind: TriggerKind,
    pub tasks: Vec<Arc<dyn Task>>,
    pub state: TriggerState,
    pub next_fire: Option<DateTime<Utc>>,
    /// A build requested by this trigger has not finished yet.
    pub pending: bool,
    pub fire_count: u64,
    pub last_fired: Option<DateTime<Utc>>,
}

impl Trigger {
    pub fn new(
        project: ProjectId,
        name: String,
        kind: TriggerKind,
        tasks: Vec<Arc<dyn Task>>,
        now: DateTime<Utc>,
    ) -> Self {
        let mut trigger = Self {
            id: TriggerId::new(),
            project,
            name,
            kind,
            tasks,
            state: TriggerState::Active,
            next_fire: None,
            pending: false,
            fire_count: 0,
            last_fired: None,
        };
        trigger.reschedule(now);
        trigger
    }

    /// Next fire strictly after `now`. Earlier missed fires are not kept.
    pub fn reschedule(&mut self, now: DateTime<Utc>) {
        self.next_fire = match (&self.kind, self.state) {
            (TriggerKind::Cron(expr), TriggerState::Active) => expr.next_after(now),
            _ => None,
        };
    }

    pub fn requests_build(&self) -> bool {
        self.tasks.iter().any(|t| t.requests_build())
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.state == TriggerState::Active && self.next_fire.is_some_and(|at| at <= now)
    }

    pub fn info(&self) -> TriggerInfo {
        TriggerInfo {
            id: self.id,
            project: self.project.clone(),
            name: self.name.clone(),
            kind: self.kind.describe(),
            state: self.state,
            next_fire: self.next_fire,
            pending: self.pending,
            fire_count: self.fire_count,
            last_fired: self.last_fired,
            tasks: self.tasks.iter().map(|t| t.name().to_string()).collect(),
        }
    }
}

/// Read-only view of a trigger.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TriggerInfo {
    pub id: TriggerId,
    pub project: ProjectId,
    pub name: String,
    pub kind: String,
    pub state: TriggerState,
    pub next_fire: Option<DateTime<Utc>>,
    pub pending: bool,
    pub fire_count: u64,
    pub last_fired: Option<DateTime<Utc>>,
    pub tasks: Vec<String>,
}
