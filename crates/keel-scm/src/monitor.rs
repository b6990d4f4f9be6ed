//! Polls project repositories and announces new revisions.

use crate::cache::ScmRevisionCache;
use crate::populator::ScmPopulator;
use futures::future::join_all;
use keel_bus::{EventBus, EventListener};
use keel_core::events::{Event, EventPayload};
use keel_core::ids::ProjectId;
use keel_core::ports::ScmClient;
use keel_core::project::ScmConfig;
use keel_core::revision::Revision;
use keel_core::{Error, Result};
use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::interval;
use tracing::{debug, info, warn};

const SOURCE: &str = "scm-monitor";

struct Watched {
    config: ScmConfig,
    /// Last revision seen. `None` until the first successful poll, which
    /// only records a baseline.
    last: Option<Revision>,
}

/// Publishes `ScmChanged` when a watched project's latest revision moves and
/// `ScmPollFailed` when the repository cannot be queried.
#[derive(Clone)]
pub struct ScmMonitor {
    client: Arc<dyn ScmClient>,
    cache: Arc<ScmRevisionCache>,
    bus: EventBus,
    projects: Arc<RwLock<BTreeMap<ProjectId, Watched>>>,
}

impl ScmMonitor {
    pub fn new(client: Arc<dyn ScmClient>, cache: Arc<ScmRevisionCache>, bus: EventBus) -> Self {
        Self {
            client,
            cache,
            bus,
            projects: Arc::new(RwLock::new(BTreeMap::new())),
        }
    }

    pub fn watch(&self, project: ProjectId, config: ScmConfig) {
        info!(project = %project, location = %config.unique_location(), "Watching repository");
        self.projects
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(project, Watched { config, last: None });
    }

    /// Stop watching `project`. Its cache entry is dropped unless another
    /// watched project shares the location.
    pub fn unwatch(&self, project: &ProjectId) -> bool {
        let mut projects = self.projects.write().unwrap_or_else(PoisonError::into_inner);
        let Some(removed) = projects.remove(project) else {
            return false;
        };
        let location = removed.config.unique_location();
        if !projects
            .values()
            .any(|w| w.config.unique_location() == location)
        {
            self.cache.invalidate(&location);
        }
        true
    }

    pub fn watched(&self) -> Vec<ProjectId> {
        self.projects
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    /// Poll one project. Returns the new revision if a change was published.
    pub async fn poll(&self, project: &ProjectId) -> Result<Option<Revision>> {
        let config = self
            .projects
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(project)
            .map(|w| w.config.clone())
            .ok_or_else(|| Error::ProjectNotFound(project.to_string()))?;

        let latest = match self.latest(&config).await {
            Ok(revision) => revision,
            Err(err) => {
                warn!(project = %project, error = %err, "SCM poll failed");
                self.bus.publish_payload(
                    SOURCE,
                    EventPayload::ScmPollFailed {
                        project: project.clone(),
                        error: err.to_string(),
                    },
                );
                return Err(err);
            }
        };

        let previous = {
            let mut projects = self.projects.write().unwrap_or_else(PoisonError::into_inner);
            match projects.get_mut(project) {
                Some(watched) => watched.last.replace(latest.clone()),
                // Unwatched while polling.
                None => return Ok(None),
            }
        };

        match previous {
            None => {
                debug!(project = %project, revision = %latest, "Recorded baseline revision");
                Ok(None)
            }
            Some(previous) if previous == latest => Ok(None),
            Some(previous) => {
                info!(project = %project, %previous, revision = %latest, "New revision detected");
                self.bus.publish_payload(
                    SOURCE,
                    EventPayload::ScmChanged {
                        project: project.clone(),
                        previous: Some(previous),
                        revision: latest.clone(),
                    },
                );
                Ok(Some(latest))
            }
        }
    }

    /// Resolve the latest revision and make sure the cache holds it.
    async fn latest(&self, config: &ScmConfig) -> Result<Revision> {
        let revision = self.client.latest_revision(config).await?;
        let populator = ScmPopulator::new(Arc::clone(&self.client), config.clone());
        self.cache.get(&populator, &revision).await?;
        Ok(revision)
    }

    /// Poll every watched project once, concurrently. Failures are reported
    /// through the bus and do not stop the sweep.
    pub async fn poll_all(&self) -> Vec<(ProjectId, Revision)> {
        let polls = self.watched().into_iter().map(|project| async move {
            match self.poll(&project).await {
                Ok(Some(revision)) => Some((project, revision)),
                _ => None,
            }
        });
        join_all(polls).await.into_iter().flatten().collect()
    }

    /// Poll on a fixed interval until shutdown.
    pub async fn run(&self, poll_interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(poll_interval);
        info!(interval_secs = poll_interval.as_secs(), "Starting SCM monitor");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.poll_all().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("SCM monitor shutting down");
                        break;
                    }
                }
            }
        }
    }
}

impl EventListener for ScmMonitor {
    fn handle_event(&self, event: &Event) -> Result<()> {
        if let EventPayload::ProjectRemoved { project } = &event.payload {
            self.unwatch(project);
        }
        Ok(())
    }

    fn name(&self) -> String {
        SOURCE.to_string()
    }
}
