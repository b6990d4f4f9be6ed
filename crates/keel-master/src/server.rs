//! Master process wiring.

use crate::aggregator::ResultAggregator;
use crate::config::MasterConfig;
use crate::dispatcher::RecipeDispatcher;
use crate::link::{AgentEndpoint, AgentLink};
use crate::store::InMemoryStore;
use crate::watchdog::Watchdog;
use keel_bus::EventBus;
use keel_core::events::EventPayload;
use keel_core::ids::{BuildId, ProjectId, TriggerId};
use keel_core::ports::ScmClient;
use keel_core::project::ProjectConfig;
use keel_core::revision::Revision;
use keel_core::trigger::TriggerConfig;
use keel_core::{Error, Result};
use keel_scheduler::Scheduler;
use keel_scm::{ScmMonitor, ScmRevisionCache};
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

/// Owns the bus and every master-side component subscribed to it.
pub struct MasterServer {
    config: MasterConfig,
    bus: EventBus,
    store: Arc<InMemoryStore>,
    cache: Arc<ScmRevisionCache>,
    dispatcher: RecipeDispatcher,
    aggregator: ResultAggregator,
    scheduler: Scheduler,
    monitor: ScmMonitor,
}

impl MasterServer {
    pub fn new(config: MasterConfig, scm: Arc<dyn ScmClient>, store: Arc<InMemoryStore>) -> Self {
        let bus = EventBus::new();
        let cache = Arc::new(ScmRevisionCache::new(config.scm_cache_capacity));

        let dispatcher = RecipeDispatcher::new(
            bus.clone(),
            store.clone(),
            store.clone(),
            Arc::clone(&scm),
            Arc::clone(&cache),
            config.clone(),
        );
        let aggregator = ResultAggregator::new(bus.clone(), store.clone());
        let scheduler = Scheduler::new(bus.clone()).with_store(store.clone());
        let monitor = ScmMonitor::new(scm, Arc::clone(&cache), bus.clone());

        // The aggregator must see BuildStarted before any recipe outcome,
        // and RecipeCompleted before the scheduler sees BuildCompleted.
        aggregator.subscribe();
        dispatcher.subscribe();
        scheduler.subscribe();
        bus.subscribe(
            &[keel_core::events::EventKind::ProjectRemoved],
            Arc::new(monitor.clone()),
        );

        Self {
            config,
            bus,
            store,
            cache,
            dispatcher,
            aggregator,
            scheduler,
            monitor,
        }
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn store(&self) -> &Arc<InMemoryStore> {
        &self.store
    }

    pub fn cache(&self) -> &Arc<ScmRevisionCache> {
        &self.cache
    }

    pub fn dispatcher(&self) -> &RecipeDispatcher {
        &self.dispatcher
    }

    pub fn aggregator(&self) -> &ResultAggregator {
        &self.aggregator
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn monitor(&self) -> &ScmMonitor {
        &self.monitor
    }

    /// Register a project with its triggers and start watching its
    /// repository.
    pub async fn add_project(
        &self,
        project: ProjectConfig,
        triggers: Vec<TriggerConfig>,
    ) -> Result<Vec<TriggerId>> {
        project.validate()?;
        let id = project.id.clone();
        if self.scheduler.triggers_for(&id).iter().any(|t| {
            t.state != keel_scheduler::TriggerState::Disabled
        }) {
            return Err(Error::InvalidConfiguration(format!(
                "project {} is already registered",
                id
            )));
        }

        let scm = project.scm.clone();
        self.store.add_project(project).await;
        self.store.set_triggers(&id, triggers).await;
        let scheduled = self.scheduler.load_project(&id).await?;
        self.monitor.watch(id.clone(), scm);
        info!(project = %id, triggers = scheduled.len(), "Project added");
        Ok(scheduled)
    }

    /// Remove a project. Its triggers are disabled and its repository is no
    /// longer watched; builds already in flight run to completion.
    pub async fn remove_project(&self, id: &ProjectId) -> Result<()> {
        self.store
            .remove_project(id)
            .await
            .ok_or_else(|| Error::ProjectNotFound(id.to_string()))?;
        self.bus.publish_payload(
            "master",
            EventPayload::ProjectRemoved {
                project: id.clone(),
            },
        );
        info!(project = %id, "Project removed");
        Ok(())
    }

    pub fn connect_agent(&self, name: &str, capabilities: BTreeSet<String>) -> AgentEndpoint {
        AgentLink::connect(&self.dispatcher, &self.bus, name, capabilities)
    }

    /// Request a build directly, bypassing triggers.
    pub async fn request_build(
        &self,
        project: &ProjectId,
        revision: Option<Revision>,
    ) -> Result<BuildId> {
        self.dispatcher.request_build(project, revision, None).await
    }

    /// Run the scheduler, SCM monitor and watchdog until shutdown.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) {
        let watchdog = Watchdog::new(self.dispatcher.clone(), self.config.clone());
        info!("Master running");
        tokio::join!(
            self.scheduler.run(shutdown.clone()),
            self.monitor
                .run(self.config.scm_poll_interval(), shutdown.clone()),
            watchdog.run(shutdown),
        );
        info!("Master stopped");
    }
}
