//! Folds recipe outcomes into build results.

use keel_bus::{EventBus, EventListener};
use keel_core::events::{Event, EventKind, EventPayload};
use keel_core::ids::{BuildId, ListenerId};
use keel_core::ports::BuildResultStore;
use keel_core::result::{BuildResult, RecipeResult};
use keel_core::Result;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, error, info, warn};

/// Tracks builds between `BuildStarted` and `BuildCompleted`.
///
/// A build completes once every stage's recipe is terminal; its state is the
/// worst of the stage states. Completed builds are handed to the result
/// store in the background.
///
/// A recipe can finish before its `BuildStarted` event has been published;
/// such outcomes are held until the build starts.
#[derive(Clone)]
pub struct ResultAggregator {
    tracked: Arc<Mutex<Tracked>>,
    store: Arc<dyn BuildResultStore>,
    bus: EventBus,
}

#[derive(Default)]
struct Tracked {
    builds: HashMap<BuildId, BuildResult>,
    early: HashMap<BuildId, Vec<RecipeResult>>,
}

impl Tracked {
    /// Fold `result` into its build, returning the build once it completed.
    fn apply(&mut self, build_id: BuildId, result: RecipeResult) -> Option<BuildResult> {
        let Some(build) = self.builds.get_mut(&build_id) else {
            debug!(build_id = %build_id, recipe_id = %result.id, "Holding result for build not yet started");
            self.early.entry(build_id).or_default().push(result);
            return None;
        };
        match build.stage_for_recipe_mut(result.id) {
            Some(stage) => stage.recipe = result,
            None => {
                warn!(build_id = %build_id, recipe_id = %result.id, "Recipe is not part of build");
                return None;
            }
        }
        if build.update_state() {
            self.builds.remove(&build_id)
        } else {
            None
        }
    }
}

impl ResultAggregator {
    pub fn new(bus: EventBus, store: Arc<dyn BuildResultStore>) -> Self {
        Self {
            tracked: Arc::new(Mutex::new(Tracked::default())),
            store,
            bus,
        }
    }

    pub fn subscribe(&self) -> ListenerId {
        self.bus.subscribe(
            &[EventKind::BuildStarted, EventKind::RecipeCompleted],
            Arc::new(self.clone()),
        )
    }

    /// Snapshot of a running build.
    pub fn build(&self, id: BuildId) -> Option<BuildResult> {
        self.tracked
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .builds
            .get(&id)
            .cloned()
    }

    pub fn pending_builds(&self) -> usize {
        self.tracked
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .builds
            .len()
    }

    fn on_build_started(&self, build: &BuildResult) {
        debug!(build_id = %build.id, stages = build.stages.len(), "Tracking build");
        let completed = {
            let mut tracked = self.tracked.lock().unwrap_or_else(PoisonError::into_inner);
            tracked.builds.insert(build.id, build.clone());
            let early = tracked.early.remove(&build.id).unwrap_or_default();
            early
                .into_iter()
                .fold(None, |done, result| done.or(tracked.apply(build.id, result)))
        };
        if let Some(build) = completed {
            self.complete(build);
        }
    }

    fn on_recipe_completed(&self, build_id: BuildId, result: &RecipeResult) {
        let completed = self
            .tracked
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .apply(build_id, result.clone());
        if let Some(build) = completed {
            self.complete(build);
        }
    }

    fn complete(&self, build: BuildResult) {
        info!(
            build_id = %build.id,
            project = %build.project,
            state = %build.state,
            "Build completed"
        );
        self.persist(build.clone());
        self.bus
            .publish_payload("aggregator", EventPayload::BuildCompleted { build });
    }

    fn persist(&self, build: BuildResult) {
        let store = Arc::clone(&self.store);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = store.save_build_result(&build).await {
                        error!(build_id = %build.id, error = %e, "Failed to save build result");
                    }
                });
            }
            Err(_) => warn!(build_id = %build.id, "No runtime, build result not saved"),
        }
    }
}

impl EventListener for ResultAggregator {
    fn handle_event(&self, event: &Event) -> Result<()> {
        match &event.payload {
            EventPayload::BuildStarted { build } => self.on_build_started(build),
            EventPayload::RecipeCompleted { build_id, result } => {
                self.on_recipe_completed(*build_id, result)
            }
            _ => {}
        }
        Ok(())
    }

    fn name(&self) -> String {
        "aggregator".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;
    use keel_bus::FnListener;
    use keel_core::ids::{ProjectId, RecipeId};
    use keel_core::result::{RecipeResult, ResultState, StageResult};
    use keel_core::revision::Revision;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    fn recipe(name: &str) -> RecipeResult {
        RecipeResult::new(
            RecipeId::new(),
            ProjectId::new("demo"),
            name,
            Revision::new("r1"),
            &["compile".to_string()],
        )
    }

    fn finished(mut recipe: RecipeResult, state: ResultState) -> RecipeResult {
        recipe.commands[0].complete(state, Some(0));
        recipe.complete();
        recipe
    }

    fn build(recipes: &[RecipeResult]) -> BuildResult {
        BuildResult::new(
            BuildId::new(),
            ProjectId::new("demo"),
            Revision::new("r1"),
            None,
            recipes
                .iter()
                .map(|r| StageResult {
                    name: r.recipe.clone(),
                    recipe: r.clone(),
                })
                .collect(),
        )
    }

    #[tokio::test]
    async fn test_build_completes_with_worst_stage_state() {
        let bus = EventBus::new();
        let store = Arc::new(InMemoryStore::new());
        let aggregator = ResultAggregator::new(bus.clone(), store.clone());
        aggregator.subscribe();

        let completed = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&completed);
        bus.subscribe(
            &[EventKind::BuildCompleted],
            Arc::new(FnListener::new("sink", move |e: &Event| {
                if let EventPayload::BuildCompleted { build } = &e.payload {
                    sink.lock().unwrap().push(build.clone());
                }
                Ok(())
            })),
        );

        let linux = recipe("linux");
        let windows = recipe("windows");
        let started = build(&[linux.clone(), windows.clone()]);
        let id = started.id;
        bus.publish_payload("test", EventPayload::BuildStarted { build: started });
        assert_eq!(aggregator.pending_builds(), 1);

        bus.publish_payload(
            "test",
            EventPayload::RecipeCompleted {
                build_id: id,
                result: finished(linux, ResultState::Success),
            },
        );
        assert!(completed.lock().unwrap().is_empty());
        assert_eq!(
            aggregator.build(id).unwrap().stages[0].recipe.state,
            ResultState::Success
        );

        bus.publish_payload(
            "test",
            EventPayload::RecipeCompleted {
                build_id: id,
                result: finished(windows, ResultState::Failure),
            },
        );

        let done = completed.lock().unwrap().clone();
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].state, ResultState::Failure);
        assert!(done[0].completed_at.is_some());
        assert_eq!(aggregator.pending_builds(), 0);

        // Persistence runs in the background.
        let mut saved = None;
        for _ in 0..50 {
            saved = store.build_result(id).await.unwrap();
            if saved.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(saved.unwrap().state, ResultState::Failure);
    }

    #[tokio::test]
    async fn test_recipe_completed_before_build_started() {
        let bus = EventBus::new();
        let aggregator = ResultAggregator::new(bus.clone(), Arc::new(InMemoryStore::new()));
        aggregator.subscribe();

        let linux = recipe("linux");
        let started = build(&[linux.clone()]);
        let id = started.id;

        let event = bus.publish_payload(
            "test",
            EventPayload::RecipeCompleted {
                build_id: id,
                result: finished(linux, ResultState::Success),
            },
        );
        assert!(!event.has_exceptions());
        assert_eq!(aggregator.pending_builds(), 0);

        let completed = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&completed);
        bus.subscribe(
            &[EventKind::BuildCompleted],
            Arc::new(FnListener::new("sink", move |e: &Event| {
                if let EventPayload::BuildCompleted { build } = &e.payload {
                    sink.lock().unwrap().push(build.clone());
                }
                Ok(())
            })),
        );

        bus.publish_payload("test", EventPayload::BuildStarted { build: started });

        let done = completed.lock().unwrap().clone();
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].id, id);
        assert_eq!(done[0].state, ResultState::Success);
        assert_eq!(aggregator.pending_builds(), 0);
    }
}
