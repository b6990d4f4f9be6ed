//! Agent main loop.

use crate::executor::RecipeExecutor;
use crate::metrics::MetricsSampler;
use keel_core::RecipeId;
use keel_core::agent::AgentStatus;
use keel_core::protocol::{AgentMessage, MasterMessage, RecipeRequest};
use keel_core::result::ResultState;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

struct Running {
    recipe_id: RecipeId,
    cancel: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Serves master messages: runs one recipe at a time, answers pings and
/// forwards aborts to the running recipe.
pub struct AgentService {
    executor: Arc<RecipeExecutor>,
    sampler: MetricsSampler,
    running: Option<Running>,
}

impl AgentService {
    pub fn new(executor: RecipeExecutor) -> Self {
        Self {
            executor: Arc::new(executor),
            sampler: MetricsSampler::new(),
            running: None,
        }
    }

    /// Run until the master closes the link or shutdown is signalled. A
    /// recipe still running at shutdown is cancelled and allowed to report.
    pub async fn run(
        mut self,
        mut inbound: mpsc::UnboundedReceiver<MasterMessage>,
        outbound: mpsc::Sender<AgentMessage>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let (done_tx, mut done_rx) = mpsc::unbounded_channel::<RecipeId>();
        info!("Agent service started");

        loop {
            tokio::select! {
                message = inbound.recv() => match message {
                    Some(message) => self.handle(message, &outbound, &done_tx).await,
                    None => {
                        info!("Master link closed");
                        break;
                    }
                },
                Some(recipe_id) = done_rx.recv() => {
                    if self.running.as_ref().is_some_and(|r| r.recipe_id == recipe_id) {
                        self.running = None;
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Agent service shutting down");
                        break;
                    }
                }
            }
        }

        if let Some(running) = self.running.take() {
            let _ = running.cancel.send(true);
            if let Err(e) = running.handle.await {
                warn!(error = %e, "Recipe task failed");
            }
        }
    }

    fn status(&self) -> AgentStatus {
        if self.running.is_some() {
            AgentStatus::Busy
        } else {
            AgentStatus::Idle
        }
    }

    async fn handle(
        &mut self,
        message: MasterMessage,
        outbound: &mpsc::Sender<AgentMessage>,
        done: &mpsc::UnboundedSender<RecipeId>,
    ) {
        match message {
            MasterMessage::RecipeRequest(request) => self.start(request, outbound, done).await,
            MasterMessage::Ping { seq } => {
                let pong = AgentMessage::Pong {
                    seq,
                    status: self.status(),
                    current_recipe: self.running.as_ref().map(|r| r.recipe_id),
                    metrics: Some(self.sampler.sample()),
                };
                if outbound.send(pong).await.is_err() {
                    debug!(seq, "Pong not delivered");
                }
            }
            MasterMessage::Abort { recipe_id } => match &self.running {
                Some(running) if running.recipe_id == recipe_id => {
                    info!(recipe_id = %recipe_id, "Aborting recipe");
                    let _ = running.cancel.send(true);
                }
                _ => debug!(recipe_id = %recipe_id, "Abort for recipe not running here"),
            },
        }
    }

    async fn start(
        &mut self,
        request: RecipeRequest,
        outbound: &mpsc::Sender<AgentMessage>,
        done: &mpsc::UnboundedSender<RecipeId>,
    ) {
        let recipe_id = request.recipe_id;
        // The master frees an agent as soon as it aborts its recipe, so a
        // cancelled recipe only has to finish winding down.
        if self.running.as_ref().is_some_and(|r| *r.cancel.borrow())
            && let Some(running) = self.running.take()
        {
            debug!(recipe_id = %recipe_id, cancelled = %running.recipe_id, "Waiting for cancelled recipe");
            if let Err(e) = running.handle.await {
                warn!(error = %e, "Recipe task failed");
            }
        }
        if let Some(running) = &self.running {
            warn!(recipe_id = %recipe_id, running = %running.recipe_id, "Rejecting recipe, agent busy");
            let busy = AgentMessage::RecipeResult {
                recipe_id,
                status: ResultState::Error,
                commands: vec![],
                error: Some("agent busy".to_string()),
            };
            let _ = outbound.send(busy).await;
            return;
        }

        let (cancel, cancel_rx) = watch::channel(false);
        let executor = Arc::clone(&self.executor);
        let outbound = outbound.clone();
        let done = done.clone();
        let handle = tokio::spawn(async move {
            executor.execute(request, &outbound, cancel_rx).await;
            let _ = done.send(recipe_id);
        });
        self.running = Some(Running {
            recipe_id,
            cancel,
            handle,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AgentConfig;
    use keel_core::ids::{BuildId, ProjectId};
    use keel_core::project::{CommandDefinition, RecipeDefinition};
    use keel_core::revision::Revision;
    use std::time::Duration;

    fn request(script: &str) -> RecipeRequest {
        RecipeRequest {
            recipe_id: RecipeId::new(),
            build_id: BuildId::new(),
            project: ProjectId::new("demo"),
            stage: "default".to_string(),
            recipe: RecipeDefinition {
                name: "build".to_string(),
                commands: vec![CommandDefinition::shell("run", script)],
                continue_on_error: false,
            },
            revision: Revision::new("r1"),
            resource_properties: vec![],
            scm: None,
        }
    }

    async fn next_result(rx: &mut mpsc::Receiver<AgentMessage>) -> AgentMessage {
        loop {
            let message = tokio::time::timeout(Duration::from_secs(10), rx.recv())
                .await
                .unwrap()
                .unwrap();
            if matches!(message, AgentMessage::RecipeResult { .. }) {
                return message;
            }
        }
    }

    #[tokio::test]
    async fn test_busy_agent_rejects_second_recipe_and_aborts_first() {
        let dir = tempfile::tempdir().unwrap();
        let config = AgentConfig {
            work_dir: dir.path().to_path_buf(),
            ..AgentConfig::default()
        };
        let service = AgentService::new(RecipeExecutor::new(&config).unwrap());
        let (to_agent, inbound) = mpsc::unbounded_channel();
        let (outbound, mut from_agent) = mpsc::channel(64);
        let (_shutdown_tx, shutdown) = watch::channel(false);
        let task = tokio::spawn(service.run(inbound, outbound, shutdown));

        let slow = request("sleep 30");
        let slow_id = slow.recipe_id;
        to_agent.send(MasterMessage::RecipeRequest(slow)).unwrap();
        let second = request("true");
        let second_id = second.recipe_id;
        to_agent.send(MasterMessage::RecipeRequest(second)).unwrap();

        match next_result(&mut from_agent).await {
            AgentMessage::RecipeResult { recipe_id, status, error, .. } => {
                assert_eq!(recipe_id, second_id);
                assert_eq!(status, ResultState::Error);
                assert_eq!(error.as_deref(), Some("agent busy"));
            }
            other => panic!("unexpected {:?}", other),
        }

        to_agent.send(MasterMessage::Ping { seq: 7 }).unwrap();
        to_agent.send(MasterMessage::Abort { recipe_id: slow_id }).unwrap();

        let mut saw_busy_pong = false;
        loop {
            let message = tokio::time::timeout(Duration::from_secs(10), from_agent.recv())
                .await
                .unwrap()
                .unwrap();
            match message {
                AgentMessage::Pong { seq: 7, status, current_recipe, .. } => {
                    assert_eq!(status, AgentStatus::Busy);
                    assert_eq!(current_recipe, Some(slow_id));
                    saw_busy_pong = true;
                }
                AgentMessage::RecipeResult { recipe_id, status, .. } => {
                    assert_eq!(recipe_id, slow_id);
                    assert_eq!(status, ResultState::Error);
                    break;
                }
                _ => {}
            }
        }
        assert!(saw_busy_pong);

        drop(to_agent);
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_request_after_abort_waits_for_cancelled_recipe() {
        let dir = tempfile::tempdir().unwrap();
        let config = AgentConfig {
            work_dir: dir.path().to_path_buf(),
            ..AgentConfig::default()
        };
        let service = AgentService::new(RecipeExecutor::new(&config).unwrap());
        let (to_agent, inbound) = mpsc::unbounded_channel();
        let (outbound, mut from_agent) = mpsc::channel(64);
        let (_shutdown_tx, shutdown) = watch::channel(false);
        let task = tokio::spawn(service.run(inbound, outbound, shutdown));

        let slow = request("sleep 30");
        let slow_id = slow.recipe_id;
        to_agent.send(MasterMessage::RecipeRequest(slow)).unwrap();
        // Abort and the next request arrive back to back, as the master
        // sends them once it has freed the agent.
        to_agent.send(MasterMessage::Abort { recipe_id: slow_id }).unwrap();
        let next = request("true");
        let next_id = next.recipe_id;
        to_agent.send(MasterMessage::RecipeRequest(next)).unwrap();

        match next_result(&mut from_agent).await {
            AgentMessage::RecipeResult { recipe_id, status, .. } => {
                assert_eq!(recipe_id, slow_id);
                assert_eq!(status, ResultState::Error);
            }
            other => panic!("unexpected {:?}", other),
        }
        match next_result(&mut from_agent).await {
            AgentMessage::RecipeResult { recipe_id, status, error, .. } => {
                assert_eq!(recipe_id, next_id);
                assert_eq!(status, ResultState::Success, "{:?}", error);
            }
            other => panic!("unexpected {:?}", other),
        }

        drop(to_agent);
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
    }
}
