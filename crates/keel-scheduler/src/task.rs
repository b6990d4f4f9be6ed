//! Work run when a trigger fires.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use keel_bus::EventBus;
use keel_core::events::EventPayload;
use keel_core::ids::{ProjectId, TriggerId};
use keel_core::revision::Revision;
use keel_core::Result;
use serde::Serialize;
use std::future::Future;
use std::pin::Pin;

/// What a task knows about the firing that started it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskExecutionContext {
    pub trigger_id: TriggerId,
    pub trigger_name: String,
    pub project: ProjectId,
    pub fired_at: DateTime<Utc>,
    /// Revision that caused the firing, for SCM triggers.
    pub revision: Option<Revision>,
}

#[async_trait]
pub trait Task: Send + Sync {
    fn name(&self) -> &str;

    /// True if the task requests a build. Triggers holding such a task stay
    /// pending until the build is over.
    fn requests_build(&self) -> bool {
        false
    }

    async fn execute(&self, context: &TaskExecutionContext) -> Result<()>;
}

/// Publishes `BuildRequested` for the trigger's project.
pub struct BuildRequestTask {
    bus: EventBus,
    /// Overrides the firing's revision.
    revision: Option<Revision>,
}

impl BuildRequestTask {
    pub fn new(bus: EventBus, revision: Option<Revision>) -> Self {
        Self { bus, revision }
    }
}

#[async_trait]
impl Task for BuildRequestTask {
    fn name(&self) -> &str {
        "request-build"
    }

    fn requests_build(&self) -> bool {
        true
    }

    async fn execute(&self, context: &TaskExecutionContext) -> Result<()> {
        let revision = self.revision.clone().or_else(|| context.revision.clone());
        self.bus.publish_payload(
            "scheduler",
            EventPayload::BuildRequested {
                project: context.project.clone(),
                revision,
                trigger: Some(context.trigger_id),
                reason: format!("trigger '{}'", context.trigger_name),
            },
        );
        Ok(())
    }
}

type TaskFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;

/// Adapts a closure returning a future into a task.
pub struct FnTask<F> {
    name: String,
    f: F,
}

impl<F> FnTask<F>
where
    F: Fn(TaskExecutionContext) -> TaskFuture + Send + Sync,
{
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self {
            name: name.into(),
            f,
        }
    }
}

#[async_trait]
impl<F> Task for FnTask<F>
where
    F: Fn(TaskExecutionContext) -> TaskFuture + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, context: &TaskExecutionContext) -> Result<()> {
        (self.f)(context.clone()).await
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskFailure {
    pub task: String,
    pub message: String,
}

/// Outcome of one firing. Task failures are collected, they never stop the
/// remaining tasks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FiringReport {
    pub context: TaskExecutionContext,
    pub tasks_run: usize,
    pub failures: Vec<TaskFailure>,
}

impl FiringReport {
    pub fn succeeded(&self) -> bool {
        self.failures.is_empty()
    }
}
