//! Registered agents and their availability.

use chrono::{DateTime, Utc};
use keel_core::agent::{AgentInfo, AgentStatus, SystemMetrics};
use keel_core::ids::{AgentId, RecipeId};
use keel_core::protocol::MasterMessage;
use keel_core::{Error, Result};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use tokio::sync::mpsc::UnboundedSender;

struct AgentSlot {
    info: AgentInfo,
    link: UnboundedSender<MasterMessage>,
}

/// Agents known to the master, ordered by id.
///
/// The pool has no locking of its own; the dispatcher keeps it behind the
/// same lock as its in-flight table so selection and bookkeeping are
/// observed together.
#[derive(Default)]
pub struct AgentPool {
    agents: BTreeMap<AgentId, AgentSlot>,
}

impl AgentPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        name: impl Into<String>,
        capabilities: BTreeSet<String>,
        link: UnboundedSender<MasterMessage>,
    ) -> AgentId {
        let id = AgentId::new();
        self.agents.insert(
            id,
            AgentSlot {
                info: AgentInfo::new(id, name, capabilities),
                link,
            },
        );
        id
    }

    pub fn remove(&mut self, id: AgentId) -> Option<AgentInfo> {
        self.agents.remove(&id).map(|slot| slot.info)
    }

    pub fn get(&self, id: AgentId) -> Option<&AgentInfo> {
        self.agents.get(&id).map(|slot| &slot.info)
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    pub fn infos(&self) -> Vec<AgentInfo> {
        self.agents.values().map(|slot| slot.info.clone()).collect()
    }

    /// The idle agent with the lowest id offering every capability in
    /// `required`, skipping `exclude`.
    pub fn select(&self, required: &[String], exclude: &HashSet<AgentId>) -> Option<AgentId> {
        self.agents
            .values()
            .map(|slot| &slot.info)
            .find(|info| {
                info.status.is_available() && !exclude.contains(&info.id) && info.satisfies(required)
            })
            .map(|info| info.id)
    }

    pub fn mark_busy(&mut self, id: AgentId, recipe: RecipeId) {
        if let Some(slot) = self.agents.get_mut(&id) {
            slot.info.status = AgentStatus::Busy;
            slot.info.current_recipe = Some(recipe);
        }
    }

    /// Return the agent to the idle pool unless it is offline.
    pub fn release(&mut self, id: AgentId) {
        if let Some(slot) = self.agents.get_mut(&id) {
            slot.info.current_recipe = None;
            if slot.info.status == AgentStatus::Busy {
                slot.info.status = AgentStatus::Idle;
            }
        }
    }

    pub fn mark_offline(&mut self, id: AgentId) {
        if let Some(slot) = self.agents.get_mut(&id) {
            slot.info.status = AgentStatus::Offline;
            slot.info.current_recipe = None;
        }
    }

    /// Record a sign of life. An offline agent comes back idle.
    pub fn touch(&mut self, id: AgentId, now: DateTime<Utc>, metrics: Option<SystemMetrics>) {
        if let Some(slot) = self.agents.get_mut(&id) {
            slot.info.last_seen_at = now;
            if metrics.is_some() {
                slot.info.metrics = metrics;
            }
            if slot.info.status == AgentStatus::Offline {
                slot.info.status = AgentStatus::Idle;
            }
        }
    }

    /// Agents not heard from since `deadline` that are not already offline.
    pub fn silent_since(&self, deadline: DateTime<Utc>) -> Vec<AgentId> {
        self.agents
            .values()
            .filter(|slot| {
                slot.info.status != AgentStatus::Offline && slot.info.last_seen_at < deadline
            })
            .map(|slot| slot.info.id)
            .collect()
    }

    /// Sender for the agent's link, for use outside the dispatcher lock.
    pub fn link(&self, id: AgentId) -> Result<UnboundedSender<MasterMessage>> {
        self.agents
            .get(&id)
            .map(|slot| slot.link.clone())
            .ok_or_else(|| Error::AgentNotFound(id.to_string()))
    }

    pub fn links(&self) -> Vec<(AgentId, UnboundedSender<MasterMessage>)> {
        self.agents
            .iter()
            .map(|(id, slot)| (*id, slot.link.clone()))
            .collect()
    }
}
