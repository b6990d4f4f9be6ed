//! Trigger lifecycle and firing.

use crate::schedule::CronExpression;
use crate::task::{BuildRequestTask, FiringReport, Task, TaskExecutionContext, TaskFailure};
use crate::trigger::{Trigger, TriggerInfo, TriggerKind, TriggerState};
use chrono::{DateTime, Utc};
use keel_bus::{EventBus, EventListener};
use keel_core::events::{Event, EventKind, EventPayload};
use keel_core::ids::{ListenerId, ProjectId, TriggerId};
use keel_core::ports::TriggerStore;
use keel_core::revision::Revision;
use keel_core::trigger::{TaskConfig, TriggerConfig, TriggerSchedule};
use keel_core::{Error, Result};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::interval;
use tracing::{debug, info, warn};

const SOURCE: &str = "scheduler";
const TICK: Duration = Duration::from_secs(1);

/// A firing that has been claimed under the lock and still has to run.
struct Firing {
    context: TaskExecutionContext,
    tasks: Vec<Arc<dyn Task>>,
}

/// Owns every trigger and fires them.
///
/// Cloning is cheap; clones share state.
#[derive(Clone)]
pub struct Scheduler {
    triggers: Arc<Mutex<BTreeMap<TriggerId, Trigger>>>,
    bus: EventBus,
    store: Option<Arc<dyn TriggerStore>>,
}

impl Scheduler {
    pub fn new(bus: EventBus) -> Self {
        Self {
            triggers: Arc::new(Mutex::new(BTreeMap::new())),
            bus,
            store: None,
        }
    }

    pub fn with_store(mut self, store: Arc<dyn TriggerStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Register on the bus for SCM changes, build outcomes and project
    /// removal.
    pub fn subscribe(&self) -> ListenerId {
        self.bus.subscribe(
            &[
                EventKind::ScmChanged,
                EventKind::BuildCompleted,
                EventKind::BuildRejected,
                EventKind::ProjectRemoved,
            ],
            Arc::new(self.clone()),
        )
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<TriggerId, Trigger>> {
        self.triggers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create a trigger from configuration. Malformed cron expressions are
    /// rejected here and never scheduled.
    pub fn schedule(&self, project: ProjectId, config: &TriggerConfig) -> Result<TriggerId> {
        let kind = match &config.schedule {
            TriggerSchedule::Cron { expression } => {
                TriggerKind::Cron(CronExpression::parse(expression)?)
            }
            TriggerSchedule::ScmChange => TriggerKind::ScmChange,
        };
        let tasks = config
            .tasks
            .iter()
            .map(|task| match task {
                TaskConfig::RequestBuild { revision } => {
                    Arc::new(BuildRequestTask::new(self.bus.clone(), revision.clone()))
                        as Arc<dyn Task>
                }
            })
            .collect();

        let id = self.schedule_tasks(project, &config.name, kind, tasks)?;
        if config.paused {
            self.pause(id)?;
        }
        Ok(id)
    }

    /// Create a trigger running arbitrary tasks. Names are unique per
    /// project among triggers that are not disabled.
    pub fn schedule_tasks(
        &self,
        project: ProjectId,
        name: &str,
        kind: TriggerKind,
        tasks: Vec<Arc<dyn Task>>,
    ) -> Result<TriggerId> {
        let mut triggers = self.lock();
        if triggers
            .values()
            .any(|t| t.project == project && t.name == name && t.state != TriggerState::Disabled)
        {
            return Err(Error::TriggerExists {
                project: project.to_string(),
                name: name.to_string(),
            });
        }

        let trigger = Trigger::new(project, name.to_string(), kind, tasks, Utc::now());
        let id = trigger.id;
        info!(
            trigger_id = %id,
            project = %trigger.project,
            name = %trigger.name,
            next_fire = ?trigger.next_fire,
            "Scheduled trigger"
        );
        triggers.insert(id, trigger);
        Ok(id)
    }

    /// Load and schedule a project's stored triggers. Every definition is
    /// validated before any of them is scheduled.
    pub async fn load_project(&self, project: &ProjectId) -> Result<Vec<TriggerId>> {
        let Some(store) = &self.store else {
            return Ok(vec![]);
        };
        let configs = store.load_triggers(project).await?;
        for config in &configs {
            if let TriggerSchedule::Cron { expression } = &config.schedule {
                CronExpression::parse(expression)?;
            }
        }
        configs
            .iter()
            .map(|config| self.schedule(project.clone(), config))
            .collect()
    }

    pub fn unschedule(&self, id: TriggerId) -> Result<TriggerInfo> {
        let trigger = self
            .lock()
            .remove(&id)
            .ok_or_else(|| Error::TriggerNotFound(id.to_string()))?;
        info!(trigger_id = %id, "Unscheduled trigger");
        Ok(trigger.info())
    }

    pub fn pause(&self, id: TriggerId) -> Result<()> {
        self.transition(id, TriggerState::Paused)
    }

    pub fn resume(&self, id: TriggerId) -> Result<()> {
        self.transition(id, TriggerState::Active)
    }

    fn transition(&self, id: TriggerId, to: TriggerState) -> Result<()> {
        let mut triggers = self.lock();
        let trigger = triggers
            .get_mut(&id)
            .ok_or_else(|| Error::TriggerNotFound(id.to_string()))?;

        if trigger.state == TriggerState::Disabled {
            return Err(Error::InvalidConfiguration(format!(
                "trigger '{}' is disabled",
                trigger.name
            )));
        }
        if trigger.state != to {
            trigger.state = to;
            trigger.reschedule(Utc::now());
            info!(trigger_id = %id, state = ?to, "Trigger state changed");
        }
        Ok(())
    }

    /// Disable every trigger of `project`. Disabled triggers never fire
    /// again. Returns how many were disabled.
    pub fn disable_project(&self, project: &ProjectId) -> usize {
        let mut count = 0;
        for trigger in self.lock().values_mut() {
            if &trigger.project == project && trigger.state != TriggerState::Disabled {
                trigger.state = TriggerState::Disabled;
                trigger.next_fire = None;
                trigger.pending = false;
                count += 1;
            }
        }
        if count > 0 {
            info!(project = %project, count, "Disabled triggers");
        }
        count
    }

    pub fn trigger(&self, id: TriggerId) -> Option<TriggerInfo> {
        self.lock().get(&id).map(Trigger::info)
    }

    pub fn triggers_for(&self, project: &ProjectId) -> Vec<TriggerInfo> {
        self.lock()
            .values()
            .filter(|t| &t.project == project)
            .map(Trigger::info)
            .collect()
    }

    /// Claim a firing. Returns `None` if the trigger is not active or a build
    /// it requested is still pending.
    fn begin_firing(
        trigger: &mut Trigger,
        now: DateTime<Utc>,
        revision: Option<Revision>,
    ) -> Option<Firing> {
        if trigger.state != TriggerState::Active {
            return None;
        }
        if trigger.pending {
            debug!(trigger_id = %trigger.id, "Build still pending, not firing");
            return None;
        }
        if trigger.requests_build() {
            trigger.pending = true;
        }
        trigger.fire_count += 1;
        trigger.last_fired = Some(now);

        Some(Firing {
            context: TaskExecutionContext {
                trigger_id: trigger.id,
                trigger_name: trigger.name.clone(),
                project: trigger.project.clone(),
                fired_at: now,
                revision,
            },
            tasks: trigger.tasks.clone(),
        })
    }

    /// Fire every cron trigger due at `now`. Each due trigger fires at most
    /// once however many fire times were missed, and its next fire time is
    /// computed from `now`.
    pub async fn fire_due(&self, now: DateTime<Utc>) -> Vec<FiringReport> {
        let firings: Vec<Firing> = {
            let mut triggers = self.lock();
            triggers
                .values_mut()
                .filter(|t| t.is_due(now))
                .filter_map(|t| {
                    t.reschedule(now);
                    Self::begin_firing(t, now, None)
                })
                .collect()
        };

        let mut reports = Vec::with_capacity(firings.len());
        for firing in firings {
            reports.push(self.execute(firing).await);
        }
        reports
    }

    /// Fire a trigger on demand. Returns `None` if it is not active or has a
    /// build pending.
    pub async fn fire(&self, id: TriggerId, revision: Option<Revision>) -> Result<Option<FiringReport>> {
        let firing = {
            let mut triggers = self.lock();
            let trigger = triggers
                .get_mut(&id)
                .ok_or_else(|| Error::TriggerNotFound(id.to_string()))?;
            Self::begin_firing(trigger, Utc::now(), revision)
        };

        match firing {
            Some(firing) => Ok(Some(self.execute(firing).await)),
            None => Ok(None),
        }
    }

    async fn execute(&self, firing: Firing) -> FiringReport {
        let Firing { context, tasks } = firing;
        info!(
            trigger_id = %context.trigger_id,
            project = %context.project,
            revision = ?context.revision,
            "Trigger fired"
        );

        let mut failures = Vec::new();
        let mut build_requested = false;
        for task in &tasks {
            match task.execute(&context).await {
                Ok(()) => build_requested |= task.requests_build(),
                Err(err) => {
                    warn!(
                        trigger_id = %context.trigger_id,
                        task = task.name(),
                        error = %err,
                        "Trigger task failed"
                    );
                    failures.push(TaskFailure {
                        task: task.name().to_string(),
                        message: err.to_string(),
                    });
                }
            }
        }

        if !build_requested {
            self.clear_pending(context.trigger_id);
        }

        self.bus.publish_payload(
            SOURCE,
            EventPayload::TriggerFired {
                trigger_id: context.trigger_id,
                trigger_name: context.trigger_name.clone(),
                project: context.project.clone(),
                task_failures: failures
                    .iter()
                    .map(|f| format!("{}: {}", f.task, f.message))
                    .collect(),
            },
        );

        FiringReport {
            context,
            tasks_run: tasks.len(),
            failures,
        }
    }

    fn clear_pending(&self, id: TriggerId) {
        if let Some(trigger) = self.lock().get_mut(&id) {
            if trigger.pending {
                debug!(trigger_id = %id, "Pending build finished");
            }
            trigger.pending = false;
        }
    }

    /// Fire SCM triggers of `project` for `revision`. Firings run on the
    /// current tokio runtime.
    fn on_scm_change(&self, project: &ProjectId, revision: &Revision) -> Result<()> {
        let firings: Vec<Firing> = {
            let mut triggers = self.lock();
            let now = Utc::now();
            triggers
                .values_mut()
                .filter(|t| &t.project == project && matches!(t.kind, TriggerKind::ScmChange))
                .filter_map(|t| Self::begin_firing(t, now, Some(revision.clone())))
                .collect()
        };
        if firings.is_empty() {
            return Ok(());
        }

        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(err) => {
                for firing in &firings {
                    self.clear_pending(firing.context.trigger_id);
                }
                return Err(Error::Internal(format!("no runtime to fire triggers: {}", err)));
            }
        };
        for firing in firings {
            let scheduler = self.clone();
            handle.spawn(async move {
                scheduler.execute(firing).await;
            });
        }
        Ok(())
    }

    /// Fire due cron triggers every second until shutdown.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(TICK);
        info!("Starting trigger scheduler");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.fire_due(Utc::now()).await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Trigger scheduler shutting down");
                        break;
                    }
                }
            }
        }
    }
}

impl EventListener for Scheduler {
    fn handle_event(&self, event: &Event) -> Result<()> {
        match &event.payload {
            EventPayload::ScmChanged {
                project, revision, ..
            } => self.on_scm_change(project, revision)?,
            EventPayload::BuildCompleted { build } => {
                if let Some(id) = build.trigger {
                    self.clear_pending(id);
                }
            }
            EventPayload::BuildRejected {
                trigger: Some(id), ..
            } => self.clear_pending(*id),
            EventPayload::ProjectRemoved { project } => {
                self.disable_project(project);
            }
            _ => {}
        }
        Ok(())
    }

    fn name(&self) -> String {
        SOURCE.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::FnTask;
    use chrono::Duration as ChronoDuration;
    use keel_bus::FnListener;
    use keel_core::ids::BuildId;
    use keel_core::result::BuildResult;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn requests(bus: &EventBus) -> Arc<Mutex<Vec<(Option<Revision>, Option<TriggerId>)>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        bus.subscribe(
            &[EventKind::BuildRequested],
            Arc::new(FnListener::new("requests", move |e: &Event| {
                if let EventPayload::BuildRequested {
                    revision, trigger, ..
                } = &e.payload
                {
                    sink.lock().unwrap().push((revision.clone(), *trigger));
                }
                Ok(())
            })),
        );
        seen
    }

    fn completed(trigger: TriggerId) -> Event {
        let mut build = BuildResult::new(
            BuildId::new(),
            ProjectId::new("demo"),
            Revision::new("r1"),
            Some(trigger),
            vec![],
        );
        build.update_state();
        Event::new("test", EventPayload::BuildCompleted { build })
    }

    #[test]
    fn test_invalid_cron_never_scheduled() {
        let scheduler = Scheduler::new(EventBus::new());
        let err = scheduler
            .schedule(ProjectId::new("demo"), &TriggerConfig::cron("bad", "* * * *"))
            .unwrap_err();

        assert!(matches!(err, Error::InvalidCron { .. }));
        assert!(scheduler.triggers_for(&ProjectId::new("demo")).is_empty());
    }

    #[test]
    fn test_duplicate_trigger_name_rejected() {
        let scheduler = Scheduler::new(EventBus::new());
        let project = ProjectId::new("demo");
        scheduler
            .schedule(project.clone(), &TriggerConfig::scm_change("on-commit"))
            .unwrap();

        let err = scheduler
            .schedule(project, &TriggerConfig::scm_change("on-commit"))
            .unwrap_err();
        assert!(matches!(err, Error::TriggerExists { .. }));
    }

    #[tokio::test]
    async fn test_missed_fires_are_not_backfilled() {
        let bus = EventBus::new();
        let seen = requests(&bus);
        let scheduler = Scheduler::new(bus);
        let id = scheduler
            .schedule(ProjectId::new("demo"), &TriggerConfig::cron("minutely", "0 * * * * *"))
            .unwrap();

        let later = Utc::now() + ChronoDuration::hours(3);
        let reports = scheduler.fire_due(later).await;

        assert_eq!(reports.len(), 1);
        assert_eq!(seen.lock().unwrap().len(), 1);
        let info = scheduler.trigger(id).unwrap();
        assert!(info.next_fire.unwrap() > later);
        assert_eq!(info.fire_count, 1);
    }

    #[tokio::test]
    async fn test_pending_build_blocks_next_fire() {
        let bus = EventBus::new();
        let seen = requests(&bus);
        let scheduler = Scheduler::new(bus.clone());
        scheduler.subscribe();
        let id = scheduler
            .schedule(ProjectId::new("demo"), &TriggerConfig::cron("minutely", "0 * * * * *"))
            .unwrap();

        let now = Utc::now();
        scheduler.fire_due(now + ChronoDuration::minutes(2)).await;
        assert!(scheduler.trigger(id).unwrap().pending);

        let skipped = scheduler.fire_due(now + ChronoDuration::minutes(4)).await;
        assert!(skipped.is_empty());
        assert_eq!(seen.lock().unwrap().len(), 1);

        bus.publish(completed(id));
        assert!(!scheduler.trigger(id).unwrap().pending);

        scheduler.fire_due(now + ChronoDuration::minutes(6)).await;
        assert_eq!(seen.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_scm_change_fires_once_while_pending() {
        let bus = EventBus::new();
        let seen = requests(&bus);
        let scheduler = Scheduler::new(bus.clone());
        scheduler.subscribe();
        let id = scheduler
            .schedule(ProjectId::new("demo"), &TriggerConfig::scm_change("on-commit"))
            .unwrap();

        for revision in ["r2", "r3"] {
            let event = bus.publish_payload(
                "test",
                EventPayload::ScmChanged {
                    project: ProjectId::new("demo"),
                    previous: None,
                    revision: Revision::new(revision),
                },
            );
            assert!(!event.has_exceptions());
        }
        assert!(scheduler.trigger(id).unwrap().pending);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(
            *seen.lock().unwrap(),
            vec![(Some(Revision::new("r2")), Some(id))]
        );
    }

    #[tokio::test]
    async fn test_task_failure_does_not_stop_siblings() {
        let scheduler = Scheduler::new(EventBus::new());
        let ran = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ran);
        let tasks: Vec<Arc<dyn Task>> = vec![
            Arc::new(FnTask::new("broken", |_ctx| {
                Box::pin(async { Err::<(), _>(Error::Internal("boom".to_string())) })
            })),
            Arc::new(FnTask::new("counter", move |_ctx| {
                let counter = Arc::clone(&counter);
                Box::pin(async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok::<(), Error>(())
                })
            })),
        ];
        let id = scheduler
            .schedule_tasks(ProjectId::new("demo"), "manual", TriggerKind::ScmChange, tasks)
            .unwrap();

        let report = scheduler.fire(id, None).await.unwrap().unwrap();

        assert_eq!(report.tasks_run, 2);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].task, "broken");
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert!(!scheduler.trigger(id).unwrap().pending);
    }

    #[tokio::test]
    async fn test_pause_resume_and_disable() {
        let bus = EventBus::new();
        let scheduler = Scheduler::new(bus.clone());
        scheduler.subscribe();
        let project = ProjectId::new("demo");
        let id = scheduler
            .schedule(project.clone(), &TriggerConfig::cron("nightly", "0 0 2 * * *"))
            .unwrap();

        scheduler.pause(id).unwrap();
        let info = scheduler.trigger(id).unwrap();
        assert_eq!(info.state, TriggerState::Paused);
        assert!(info.next_fire.is_none());
        assert!(scheduler.fire(id, None).await.unwrap().is_none());

        scheduler.resume(id).unwrap();
        assert!(scheduler.trigger(id).unwrap().next_fire.is_some());

        bus.publish_payload("test", EventPayload::ProjectRemoved { project });
        assert_eq!(scheduler.trigger(id).unwrap().state, TriggerState::Disabled);
        assert!(scheduler.resume(id).is_err());
    }
}
