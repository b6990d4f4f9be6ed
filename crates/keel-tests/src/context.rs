//! Test context that manages a master and its local agents.

use crate::fixtures::agent_config;
use crate::helpers::{EventRecorder, WAIT, wait_for};
use keel_agent::{AgentService, RecipeExecutor};
use keel_core::ids::{AgentId, BuildId, ProjectId, TriggerId};
use keel_core::project::ProjectConfig;
use keel_core::resource::Resource;
use keel_core::result::BuildResult;
use keel_core::trigger::TriggerConfig;
use keel_master::{AgentEndpoint, InMemoryStore, MasterConfig, MasterServer};
use keel_scm::LocalScm;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use tempfile::TempDir;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

/// File every test repository starts with.
pub const REPO_FILE: &str = "Makefile";

/// A master over a temporary directory repository, with agents running
/// in-process.
pub struct TestContext {
    pub server: Arc<MasterServer>,
    pub events: Arc<EventRecorder>,
    scm: Arc<LocalScm>,
    repo: TempDir,
    work: TempDir,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl TestContext {
    pub async fn new() -> anyhow::Result<Self> {
        Self::with_config(MasterConfig::default()).await
    }

    pub async fn with_config(config: MasterConfig) -> anyhow::Result<Self> {
        crate::init_test_logging();

        let repo = TempDir::new()?;
        tokio::fs::write(repo.path().join(REPO_FILE), "all:\n\ttrue\n").await?;
        let work = TempDir::new()?;

        let scm = Arc::new(LocalScm::new());
        let store = Arc::new(InMemoryStore::new());
        let server = Arc::new(MasterServer::new(config, scm.clone(), store));
        let events = EventRecorder::attach(server.bus());
        let (shutdown, _) = watch::channel(false);

        Ok(Self {
            server,
            events,
            scm,
            repo,
            work,
            shutdown,
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn repo(&self) -> &Path {
        self.repo.path()
    }

    /// Change the repository so its revision moves on.
    pub async fn commit(&self, contents: &str) -> anyhow::Result<()> {
        tokio::fs::write(self.repo.path().join(REPO_FILE), contents).await?;
        Ok(())
    }

    pub fn store(&self) -> &Arc<InMemoryStore> {
        self.server.store()
    }

    pub async fn add_project(
        &self,
        project: ProjectConfig,
        triggers: Vec<TriggerConfig>,
    ) -> anyhow::Result<Vec<TriggerId>> {
        Ok(self.server.add_project(project, triggers).await?)
    }

    pub async fn add_resource(&self, resource: Resource) {
        self.store().add_resource(resource).await;
    }

    fn spawn(&self, task: JoinHandle<()>) {
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(task);
    }

    /// Attach an agent running recipes under this context's work directory.
    pub fn start_agent(&self, capabilities: &[&str]) -> anyhow::Result<AgentId> {
        let index = self.server.dispatcher().agents().len();
        let name = format!("agent-{}", index);
        let work_dir: PathBuf = self.work.path().join(&name);
        let config = agent_config(&name, capabilities, &work_dir);

        let executor = RecipeExecutor::new(&config)?.with_scm(self.scm.clone());
        let endpoint = self
            .server
            .connect_agent(&name, config.capabilities.clone());
        let id = endpoint.id;
        let service = AgentService::new(executor);
        self.spawn(tokio::spawn(service.run(
            endpoint.inbound,
            endpoint.outbound,
            self.shutdown.subscribe(),
        )));
        debug!(agent_id = %id, name, "Test agent started");
        Ok(id)
    }

    /// Attach an agent whose channels the test drives by hand.
    pub fn connect_raw_agent(&self, capabilities: &[&str]) -> AgentEndpoint {
        self.server.connect_agent(
            "raw",
            capabilities.iter().map(|c| c.to_string()).collect(),
        )
    }

    /// Run the scheduler, monitor and watchdog until the context shuts down.
    pub fn start_master(&self) {
        let server = Arc::clone(&self.server);
        let shutdown = self.shutdown.subscribe();
        self.spawn(tokio::spawn(async move { server.run(shutdown).await }));
    }

    /// Poll the project's repository once.
    pub async fn poll(&self, project: &ProjectId) -> anyhow::Result<()> {
        self.server.monitor().poll(project).await?;
        Ok(())
    }

    pub async fn wait_for_build(&self, id: BuildId) -> anyhow::Result<BuildResult> {
        wait_for(WAIT, || self.events.completed_build(id)).await
    }

    /// Wait for the first build of `project` to complete.
    pub async fn wait_for_any_build(&self, project: &ProjectId) -> anyhow::Result<BuildResult> {
        wait_for(WAIT, || {
            self.events
                .completed_builds()
                .into_iter()
                .find(|b| &b.project == project)
        })
        .await
    }

    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner));
        for task in tasks {
            let _ = task.await;
        }
    }
}
