//! Recipe dispatch.
//!
//! One lock guards the agent pool and the in-flight tables. A build is
//! reserved atomically under it (every stage gets a free key and an idle
//! agent, or nothing changes); requests are sent and events published only
//! after it is released.

use crate::config::MasterConfig;
use crate::pool::AgentPool;
use chrono::{DateTime, Utc};
use keel_bus::{EventBus, EventListener};
use keel_core::agent::{AgentInfo, DisconnectReason};
use keel_core::events::{Event, EventKind, EventPayload};
use keel_core::ids::{AgentId, BuildId, ListenerId, ProjectId, RecipeId, TriggerId};
use keel_core::ports::{ProjectRegistry, ResourceRepository, ScmClient};
use keel_core::project::{ProjectConfig, StageConfig};
use keel_core::protocol::{AgentMessage, MasterMessage, RecipeRequest};
use keel_core::resource::ResourceProperty;
use keel_core::result::{BuildResult, RecipeResult, ResultState, StageResult};
use keel_core::revision::Revision;
use keel_core::{Error, Result};
use keel_scm::{ScmPopulator, ScmRevisionCache};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, warn};

const SOURCE: &str = "dispatcher";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct RecipeKey {
    project: ProjectId,
    recipe: String,
    revision: Revision,
}

struct InFlight {
    key: RecipeKey,
    build_id: BuildId,
    agent: AgentId,
    result: RecipeResult,
    dispatched_at: DateTime<Utc>,
}

#[derive(Default)]
struct State {
    pool: AgentPool,
    keys: HashMap<RecipeKey, RecipeId>,
    recipes: HashMap<RecipeId, InFlight>,
}

impl State {
    /// Remove a recipe from flight and free its agent.
    fn finish(&mut self, recipe_id: RecipeId) -> Option<InFlight> {
        let flight = self.recipes.remove(&recipe_id)?;
        self.keys.remove(&flight.key);
        self.pool.release(flight.agent);
        Some(flight)
    }

    /// Force a recipe to error and take it out of flight.
    fn terminate(&mut self, recipe_id: RecipeId, message: String) -> Option<(BuildId, RecipeResult)> {
        let mut flight = self.finish(recipe_id)?;
        flight.result.terminate(message);
        Some((flight.build_id, flight.result))
    }

    fn recipe_on(&self, agent: AgentId) -> Option<RecipeId> {
        self.recipes
            .iter()
            .find(|(_, flight)| flight.agent == agent)
            .map(|(id, _)| *id)
    }
}

/// A stage ready to be reserved.
struct PlannedStage {
    stage: StageConfig,
    request: RecipeRequest,
}

/// A reserved stage whose request still has to be sent.
struct Reserved {
    recipe_id: RecipeId,
    agent: AgentId,
    stage: String,
    recipe: String,
    link: UnboundedSender<MasterMessage>,
    request: RecipeRequest,
}

/// Master-side recipe dispatcher.
///
/// Cloning is cheap; clones share state.
#[derive(Clone)]
pub struct RecipeDispatcher {
    state: Arc<Mutex<State>>,
    bus: EventBus,
    projects: Arc<dyn ProjectRegistry>,
    resources: Arc<dyn ResourceRepository>,
    scm: Arc<dyn ScmClient>,
    cache: Arc<ScmRevisionCache>,
    config: MasterConfig,
}

impl RecipeDispatcher {
    pub fn new(
        bus: EventBus,
        projects: Arc<dyn ProjectRegistry>,
        resources: Arc<dyn ResourceRepository>,
        scm: Arc<dyn ScmClient>,
        cache: Arc<ScmRevisionCache>,
        config: MasterConfig,
    ) -> Self {
        Self {
            state: Arc::new(Mutex::new(State::default())),
            bus,
            projects,
            resources,
            scm,
            cache,
            config,
        }
    }

    /// Register on the bus for build requests and agent traffic.
    pub fn subscribe(&self) -> ListenerId {
        self.bus.subscribe(
            &[
                EventKind::BuildRequested,
                EventKind::AgentMessageReceived,
                EventKind::AgentDisconnected,
            ],
            Arc::new(self.clone()),
        )
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn register_agent(
        &self,
        name: &str,
        capabilities: BTreeSet<String>,
        link: UnboundedSender<MasterMessage>,
    ) -> AgentId {
        let id = self.lock().pool.register(name, capabilities, link);
        info!(agent_id = %id, name, "Agent registered");
        self.bus.publish_payload(
            SOURCE,
            EventPayload::AgentRegistered {
                agent_id: id,
                name: name.to_string(),
            },
        );
        id
    }

    pub fn agents(&self) -> Vec<AgentInfo> {
        self.lock().pool.infos()
    }

    pub fn agent(&self, id: AgentId) -> Option<AgentInfo> {
        self.lock().pool.get(id).cloned()
    }

    pub fn in_flight_count(&self) -> usize {
        self.lock().recipes.len()
    }

    /// Current view of an in-flight recipe.
    pub fn recipe(&self, id: RecipeId) -> Option<RecipeResult> {
        self.lock().recipes.get(&id).map(|f| f.result.clone())
    }

    /// Dispatch every stage of `project` at `revision` (the latest if
    /// `None`).
    ///
    /// Fails without side effects if a stage's recipe is already in flight
    /// for the revision or no idle agent can take a stage. Neither condition
    /// blocks; the caller may retry.
    pub async fn request_build(
        &self,
        project: &ProjectId,
        revision: Option<Revision>,
        trigger: Option<TriggerId>,
    ) -> Result<BuildId> {
        let config = self
            .projects
            .project(project)
            .await?
            .ok_or_else(|| Error::ProjectNotFound(project.to_string()))?;
        config.validate()?;

        let revision = self.resolve_revision(&config, revision).await?;
        let build_id = BuildId::new();
        let mut planned = Vec::with_capacity(config.stages.len());
        for stage in &config.stages {
            planned.push(PlannedStage {
                stage: stage.clone(),
                request: RecipeRequest {
                    recipe_id: RecipeId::new(),
                    build_id,
                    project: project.clone(),
                    stage: stage.name.clone(),
                    recipe: config.recipe(&stage.recipe)?.clone(),
                    revision: revision.clone(),
                    resource_properties: self.resolve_properties(stage).await?,
                    scm: Some(config.scm.clone()),
                },
            });
        }

        let (reserved, build) = self.reserve(build_id, project, &revision, trigger, planned)?;
        info!(
            build_id = %build_id,
            project = %project,
            revision = %revision,
            stages = reserved.len(),
            "Build started"
        );
        self.bus
            .publish_payload(SOURCE, EventPayload::BuildStarted { build });

        for stage in reserved {
            self.send_request(build_id, project, stage);
        }
        Ok(build_id)
    }

    async fn resolve_revision(
        &self,
        config: &ProjectConfig,
        revision: Option<Revision>,
    ) -> Result<Revision> {
        let revision = match revision {
            Some(revision) => revision,
            None => self.scm.latest_revision(&config.scm).await?,
        };
        let location = config.scm.unique_location();
        if self.cache.requires_refresh(&location, &revision) {
            let populator = ScmPopulator::new(Arc::clone(&self.scm), config.scm.clone());
            self.cache.get(&populator, &revision).await?;
        }
        Ok(revision)
    }

    /// Properties of every required resource, in requirement order.
    async fn resolve_properties(&self, stage: &StageConfig) -> Result<Vec<ResourceProperty>> {
        let mut properties = Vec::new();
        for requirement in &stage.requirements {
            let resource = self
                .resources
                .resource(&requirement.resource)
                .await?
                .ok_or_else(|| Error::ResourceNotFound(requirement.resource.clone()))?;
            properties.extend(resource.resolve(requirement.version.as_deref())?);
        }
        Ok(properties)
    }

    fn reserve(
        &self,
        build_id: BuildId,
        project: &ProjectId,
        revision: &Revision,
        trigger: Option<TriggerId>,
        planned: Vec<PlannedStage>,
    ) -> Result<(Vec<Reserved>, BuildResult)> {
        let mut state = self.lock();

        let mut chosen = HashSet::new();
        let mut agents = Vec::with_capacity(planned.len());
        for plan in &planned {
            let key = RecipeKey {
                project: project.clone(),
                recipe: plan.stage.recipe.clone(),
                revision: revision.clone(),
            };
            if state.keys.contains_key(&key) {
                return Err(Error::AlreadyInFlight {
                    project: project.to_string(),
                    recipe: key.recipe,
                    revision: revision.to_string(),
                });
            }
            let agent = state
                .pool
                .select(&plan.stage.capabilities, &chosen)
                .ok_or_else(|| Error::NoAgentAvailable(plan.stage.capabilities.clone()))?;
            chosen.insert(agent);
            agents.push((key, agent));
        }

        let now = Utc::now();
        let mut reserved = Vec::with_capacity(planned.len());
        let mut stages = Vec::with_capacity(planned.len());
        for (plan, (key, agent)) in planned.into_iter().zip(agents) {
            let recipe_id = plan.request.recipe_id;
            let mut result = RecipeResult::new(
                recipe_id,
                project.clone(),
                &plan.stage.recipe,
                revision.clone(),
                &plan.request.recipe.command_names(),
            );
            result.agent = Some(agent);

            state.pool.mark_busy(agent, recipe_id);
            state.keys.insert(key.clone(), recipe_id);
            state.recipes.insert(
                recipe_id,
                InFlight {
                    key,
                    build_id: plan.request.build_id,
                    agent,
                    result: result.clone(),
                    dispatched_at: now,
                },
            );
            stages.push(StageResult {
                name: plan.stage.name.clone(),
                recipe: result,
            });
            reserved.push(Reserved {
                recipe_id,
                agent,
                stage: plan.stage.name,
                recipe: plan.stage.recipe,
                link: state.pool.link(agent)?,
                request: plan.request,
            });
        }

        let build = BuildResult::new(build_id, project.clone(), revision.clone(), trigger, stages);
        Ok((reserved, build))
    }

    fn send_request(&self, build_id: BuildId, project: &ProjectId, stage: Reserved) {
        let Reserved {
            recipe_id,
            agent,
            stage: stage_name,
            recipe,
            link,
            request,
        } = stage;

        if link.send(MasterMessage::RecipeRequest(request)).is_err() {
            warn!(recipe_id = %recipe_id, agent_id = %agent, "Agent link closed before dispatch");
            let failed = {
                let mut state = self.lock();
                state.pool.mark_offline(agent);
                state.terminate(recipe_id, Error::AgentDisconnected(agent.to_string()).to_string())
            };
            if let Some((build_id, result)) = failed {
                self.publish_completed(build_id, result);
            }
            return;
        }

        debug!(recipe_id = %recipe_id, agent_id = %agent, stage = %stage_name, "Recipe dispatched");
        self.bus.publish_payload(
            SOURCE,
            EventPayload::RecipeDispatched {
                build_id,
                recipe_id,
                agent_id: agent,
                project: project.clone(),
                recipe,
            },
        );
    }

    fn publish_completed(&self, build_id: BuildId, result: RecipeResult) {
        info!(
            build_id = %build_id,
            recipe_id = %result.id,
            state = %result.state,
            "Recipe completed"
        );
        self.bus
            .publish_payload(SOURCE, EventPayload::RecipeCompleted { build_id, result });
    }

    /// Apply a message from an agent to the in-flight result tree.
    /// Messages for recipes no longer in flight are ignored.
    pub fn on_agent_event(&self, agent: AgentId, message: &AgentMessage) -> Result<()> {
        let now = Utc::now();
        let completed = {
            let mut state = self.lock();
            if state.pool.get(agent).is_none() {
                return Err(Error::AgentNotFound(agent.to_string()));
            }

            match message {
                AgentMessage::Pong { metrics, .. } => {
                    state.pool.touch(agent, now, metrics.clone());
                    None
                }
                AgentMessage::RecipeProgress {
                    recipe_id,
                    command_index,
                    status,
                } => {
                    state.pool.touch(agent, now, None);
                    match state.recipes.get_mut(recipe_id) {
                        Some(flight) if flight.agent == agent => {
                            apply_progress(&mut flight.result, *command_index, *status);
                        }
                        _ => debug!(recipe_id = %recipe_id, "Ignoring progress for recipe not in flight"),
                    }
                    None
                }
                AgentMessage::RecipeResult {
                    recipe_id,
                    status,
                    commands,
                    error,
                } => {
                    state.pool.touch(agent, now, None);
                    let owned = state
                        .recipes
                        .get(recipe_id)
                        .is_some_and(|flight| flight.agent == agent);
                    if owned {
                        state.finish(*recipe_id).map(|mut flight| {
                            apply_result(&mut flight.result, *status, commands, error.clone());
                            (flight.build_id, flight.result)
                        })
                    } else {
                        debug!(recipe_id = %recipe_id, "Ignoring result for recipe not in flight");
                        None
                    }
                }
            }
        };

        if let Some((build_id, result)) = completed {
            self.publish_completed(build_id, result);
        }
        Ok(())
    }

    /// Abort an in-flight recipe: the agent is told to stop and the recipe
    /// ends in error.
    pub fn abort(&self, recipe_id: RecipeId) -> Result<()> {
        let (link, completed) = {
            let mut state = self.lock();
            let agent = state
                .recipes
                .get(&recipe_id)
                .map(|flight| flight.agent)
                .ok_or_else(|| Error::RecipeNotInFlight(recipe_id.to_string()))?;
            let link = state.pool.link(agent).ok();
            (link, state.terminate(recipe_id, "aborted".to_string()))
        };

        if let Some(link) = link {
            // A closed link means the agent is gone and has nothing to abort.
            let _ = link.send(MasterMessage::Abort { recipe_id });
        }
        if let Some((build_id, result)) = completed {
            self.publish_completed(build_id, result);
        }
        Ok(())
    }

    /// Remove a lost agent; its recipe, if any, ends in error.
    pub fn on_agent_disconnected(&self, agent: AgentId, reason: DisconnectReason) {
        let completed = {
            let mut state = self.lock();
            let recipe = state.recipe_on(agent);
            let completed = recipe.and_then(|id| {
                state.terminate(id, Error::AgentDisconnected(agent.to_string()).to_string())
            });
            state.pool.remove(agent);
            completed
        };

        match &completed {
            Some((_, result)) => warn!(
                agent_id = %agent,
                ?reason,
                recipe_id = %result.id,
                "Agent lost with recipe in flight"
            ),
            None => info!(agent_id = %agent, ?reason, "Agent disconnected"),
        }
        if let Some((build_id, result)) = completed {
            self.publish_completed(build_id, result);
        }
    }

    /// Enforce the recipe and heartbeat timeouts. Returns the recipes
    /// forced to error.
    pub fn check_timeouts(&self, now: DateTime<Utc>) -> Vec<RecipeId> {
        let mut aborts = Vec::new();
        let completed = {
            let mut state = self.lock();
            let mut completed = Vec::new();

            let recipe_deadline = now - self.config.recipe_timeout();
            let expired: Vec<RecipeId> = state
                .recipes
                .iter()
                .filter(|(_, flight)| flight.dispatched_at <= recipe_deadline)
                .map(|(id, _)| *id)
                .collect();
            for recipe_id in expired {
                let agent = state.recipes.get(&recipe_id).map(|f| f.agent);
                let message = Error::RecipeTimeout {
                    seconds: self.config.recipe_timeout_secs,
                }
                .to_string();
                if let Some(done) = state.terminate(recipe_id, message) {
                    warn!(recipe_id = %recipe_id, "Recipe timed out");
                    if let Some(link) = agent.and_then(|a| state.pool.link(a).ok()) {
                        aborts.push((link, recipe_id));
                    }
                    completed.push(done);
                }
            }

            let heartbeat_deadline = now - self.config.heartbeat_timeout();
            for agent in state.pool.silent_since(heartbeat_deadline) {
                warn!(agent_id = %agent, "Agent missed heartbeats, marking offline");
                let recipe = state.recipe_on(agent);
                let message = Error::HeartbeatTimeout {
                    agent: agent.to_string(),
                    seconds: self.config.heartbeat_timeout_secs,
                }
                .to_string();
                if let Some(recipe_id) = recipe
                    && let Some(done) = state.terminate(recipe_id, message)
                {
                    // The agent may only be slow; stop the recipe it still runs.
                    if let Ok(link) = state.pool.link(agent) {
                        aborts.push((link, recipe_id));
                    }
                    completed.push(done);
                }
                state.pool.mark_offline(agent);
            }
            completed
        };

        for (link, recipe_id) in aborts {
            let _ = link.send(MasterMessage::Abort { recipe_id });
        }
        let ids = completed.iter().map(|(_, r)| r.id).collect();
        for (build_id, result) in completed {
            self.publish_completed(build_id, result);
        }
        ids
    }

    /// Ping every agent. Returns how many pings were sent.
    pub fn ping_all(&self, seq: u64) -> usize {
        let links = self.lock().pool.links();
        links
            .into_iter()
            .filter(|(agent, link)| {
                let sent = link.send(MasterMessage::Ping { seq }).is_ok();
                if !sent {
                    debug!(agent_id = %agent, "Ping not delivered");
                }
                sent
            })
            .count()
    }

    /// Dispatch a requested build in the background. Rejections are
    /// published as `BuildRejected`.
    fn spawn_build(
        &self,
        project: ProjectId,
        revision: Option<Revision>,
        trigger: Option<TriggerId>,
    ) -> Result<()> {
        let handle = tokio::runtime::Handle::try_current()
            .map_err(|e| Error::Internal(format!("no runtime to dispatch build: {}", e)))?;
        let dispatcher = self.clone();
        handle.spawn(async move {
            if let Err(err) = dispatcher
                .request_build(&project, revision, trigger)
                .await
            {
                warn!(project = %project, error = %err, "Build request rejected");
                dispatcher.bus.publish_payload(
                    SOURCE,
                    EventPayload::BuildRejected {
                        project,
                        trigger,
                        reason: err.to_string(),
                    },
                );
            }
        });
        Ok(())
    }
}

fn apply_progress(result: &mut RecipeResult, command: Option<usize>, status: ResultState) {
    result.start();
    let Some(index) = command else {
        return;
    };
    let Some(command) = result.commands.get_mut(index) else {
        return;
    };
    match status {
        ResultState::InProgress => command.start(),
        s if s.is_terminal() => command.complete(s, command.exit_code),
        _ => {}
    }
}

fn apply_result(
    result: &mut RecipeResult,
    status: ResultState,
    commands: &[keel_core::result::CommandResult],
    error: Option<String>,
) {
    if !commands.is_empty() {
        result.commands = commands.to_vec();
    }
    result.error = error;
    if status.is_terminal() {
        result.state = status;
        result.completed_at = Some(Utc::now());
    } else {
        result.terminate(format!("agent reported non-terminal result '{}'", status));
    }
}

impl EventListener for RecipeDispatcher {
    fn handle_event(&self, event: &Event) -> Result<()> {
        match &event.payload {
            EventPayload::BuildRequested {
                project,
                revision,
                trigger,
                ..
            } => self.spawn_build(project.clone(), revision.clone(), *trigger),
            EventPayload::AgentMessageReceived { agent_id, message } => {
                self.on_agent_event(*agent_id, message)
            }
            EventPayload::AgentDisconnected { agent_id, reason } => {
                self.on_agent_disconnected(*agent_id, *reason);
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn name(&self) -> String {
        SOURCE.to_string()
    }
}
