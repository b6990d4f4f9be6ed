//! In-memory implementations of the persistence ports.

use async_trait::async_trait;
use keel_core::Result;
use keel_core::ids::{BuildId, ProjectId};
use keel_core::ports::{BuildResultStore, ProjectRegistry, ResourceRepository, TriggerStore};
use keel_core::project::ProjectConfig;
use keel_core::resource::Resource;
use keel_core::result::BuildResult;
use keel_core::trigger::TriggerConfig;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;
use tracing::debug;

/// Projects, resources, triggers and build history held in memory.
///
/// Serves every storage port the master needs, which is enough for a
/// single-process deployment and for tests.
#[derive(Default)]
pub struct InMemoryStore {
    projects: RwLock<BTreeMap<ProjectId, ProjectConfig>>,
    resources: RwLock<BTreeMap<String, Resource>>,
    triggers: RwLock<HashMap<ProjectId, Vec<TriggerConfig>>>,
    builds: RwLock<Vec<BuildResult>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_project(&self, project: ProjectConfig) {
        debug!(project = %project.id, "Project stored");
        self.projects
            .write()
            .await
            .insert(project.id.clone(), project);
    }

    pub async fn remove_project(&self, id: &ProjectId) -> Option<ProjectConfig> {
        self.triggers.write().await.remove(id);
        self.projects.write().await.remove(id)
    }

    pub async fn add_resource(&self, resource: Resource) {
        self.resources
            .write()
            .await
            .insert(resource.name.clone(), resource);
    }

    pub async fn set_triggers(&self, project: &ProjectId, triggers: Vec<TriggerConfig>) {
        self.triggers.write().await.insert(project.clone(), triggers);
    }
}

#[async_trait]
impl ProjectRegistry for InMemoryStore {
    async fn project(&self, id: &ProjectId) -> Result<Option<ProjectConfig>> {
        Ok(self.projects.read().await.get(id).cloned())
    }

    async fn projects(&self) -> Result<Vec<ProjectConfig>> {
        Ok(self.projects.read().await.values().cloned().collect())
    }
}

#[async_trait]
impl ResourceRepository for InMemoryStore {
    async fn load_resources(&self) -> Result<Vec<Resource>> {
        Ok(self.resources.read().await.values().cloned().collect())
    }

    async fn resource(&self, name: &str) -> Result<Option<Resource>> {
        Ok(self.resources.read().await.get(name).cloned())
    }
}

#[async_trait]
impl TriggerStore for InMemoryStore {
    async fn load_triggers(&self, project: &ProjectId) -> Result<Vec<TriggerConfig>> {
        Ok(self
            .triggers
            .read()
            .await
            .get(project)
            .cloned()
            .unwrap_or_default())
    }
}

#[async_trait]
impl BuildResultStore for InMemoryStore {
    async fn save_build_result(&self, build: &BuildResult) -> Result<()> {
        let mut builds = self.builds.write().await;
        match builds.iter_mut().find(|b| b.id == build.id) {
            Some(existing) => *existing = build.clone(),
            None => builds.push(build.clone()),
        }
        Ok(())
    }

    async fn build_result(&self, id: BuildId) -> Result<Option<BuildResult>> {
        Ok(self
            .builds
            .read()
            .await
            .iter()
            .find(|b| b.id == id)
            .cloned())
    }

    /// Most recent first.
    async fn builds_for_project(
        &self,
        project: &ProjectId,
        limit: usize,
    ) -> Result<Vec<BuildResult>> {
        Ok(self
            .builds
            .read()
            .await
            .iter()
            .rev()
            .filter(|b| &b.project == project)
            .take(limit)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::revision::Revision;

    fn build(project: &str) -> BuildResult {
        BuildResult::new(
            BuildId::new(),
            ProjectId::new(project),
            Revision::new("r1"),
            None,
            vec![],
        )
    }

    #[tokio::test]
    async fn test_builds_for_project_newest_first() {
        let store = InMemoryStore::new();
        let first = build("demo");
        let other = build("other");
        let second = build("demo");
        for b in [&first, &other, &second] {
            store.save_build_result(b).await.unwrap();
        }

        let history = store
            .builds_for_project(&ProjectId::new("demo"), 10)
            .await
            .unwrap();
        let ids: Vec<_> = history.iter().map(|b| b.id).collect();
        assert_eq!(ids, vec![second.id, first.id]);

        let limited = store
            .builds_for_project(&ProjectId::new("demo"), 1)
            .await
            .unwrap();
        assert_eq!(limited.len(), 1);
    }

    #[tokio::test]
    async fn test_remove_project_drops_triggers() {
        let store = InMemoryStore::new();
        let id = ProjectId::new("demo");
        store
            .set_triggers(&id, vec![TriggerConfig::scm_change("on-commit")])
            .await;
        store.remove_project(&id).await;
        assert!(store.load_triggers(&id).await.unwrap().is_empty());
    }
}
