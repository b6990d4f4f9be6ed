//! Test helper functions and utilities.

use keel_bus::{EventBus, EventListener};
use keel_core::Result;
use keel_core::events::{Event, EventKind, EventPayload};
use keel_core::ids::BuildId;
use keel_core::result::{BuildResult, RecipeResult};
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// Default time to wait for something asynchronous to happen.
pub const WAIT: Duration = Duration::from_secs(20);

/// Records every event published on a bus.
#[derive(Default)]
pub struct EventRecorder {
    events: Mutex<Vec<Event>>,
}

impl EventRecorder {
    pub fn attach(bus: &EventBus) -> Arc<Self> {
        let recorder = Arc::new(Self::default());
        bus.subscribe_all(recorder.clone());
        recorder
    }

    pub fn events(&self) -> Vec<Event> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn kinds(&self) -> Vec<EventKind> {
        self.events().iter().map(Event::kind).collect()
    }

    pub fn count(&self, kind: EventKind) -> usize {
        self.events().iter().filter(|e| e.kind() == kind).count()
    }

    pub fn completed_builds(&self) -> Vec<BuildResult> {
        self.events()
            .into_iter()
            .filter_map(|e| match e.payload {
                EventPayload::BuildCompleted { build } => Some(build),
                _ => None,
            })
            .collect()
    }

    pub fn completed_build(&self, id: BuildId) -> Option<BuildResult> {
        self.completed_builds().into_iter().find(|b| b.id == id)
    }

    pub fn completed_recipes(&self) -> Vec<RecipeResult> {
        self.events()
            .into_iter()
            .filter_map(|e| match e.payload {
                EventPayload::RecipeCompleted { result, .. } => Some(result),
                _ => None,
            })
            .collect()
    }

    pub fn rejections(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e.payload {
                EventPayload::BuildRejected { reason, .. } => Some(reason),
                _ => None,
            })
            .collect()
    }
}

impl EventListener for EventRecorder {
    fn handle_event(&self, event: &Event) -> Result<()> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event.clone());
        Ok(())
    }

    fn name(&self) -> String {
        "recorder".to_string()
    }
}

/// Poll `check` until it yields a value or `timeout` passes.
pub async fn wait_for<T, F>(timeout: Duration, mut check: F) -> anyhow::Result<T>
where
    F: FnMut() -> Option<T>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Some(value) = check() {
            return Ok(value);
        }
        if tokio::time::Instant::now() >= deadline {
            anyhow::bail!("condition not met within {:?}", timeout);
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Like [`wait_for`] with an async check.
pub async fn wait_for_async<T, F, Fut>(timeout: Duration, mut check: F) -> anyhow::Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Some(value) = check().await {
            return Ok(value);
        }
        if tokio::time::Instant::now() >= deadline {
            anyhow::bail!("condition not met within {:?}", timeout);
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
