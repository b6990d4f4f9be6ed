//! In-process transport between the master and its agents.
//!
//! Each agent gets a pair of channels. Master-to-agent traffic goes straight
//! into the agent's inbound queue; agent-to-master traffic is pumped onto
//! the event bus as `AgentMessageReceived`, so the dispatcher sees agent
//! messages in the same serialized stream as every other event.

use crate::dispatcher::RecipeDispatcher;
use keel_bus::EventBus;
use keel_core::agent::DisconnectReason;
use keel_core::events::EventPayload;
use keel_core::ids::AgentId;
use keel_core::protocol::{AgentMessage, MasterMessage};
use std::collections::BTreeSet;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Capacity of the agent-to-master queue.
const OUTBOUND_CAPACITY: usize = 256;

/// The agent's half of a link.
pub struct AgentEndpoint {
    pub id: AgentId,
    /// Messages from the master.
    pub inbound: mpsc::UnboundedReceiver<MasterMessage>,
    /// Messages to the master. Dropping every sender disconnects the agent.
    pub outbound: mpsc::Sender<AgentMessage>,
}

pub struct AgentLink;

impl AgentLink {
    /// Register an agent with `dispatcher` and start pumping its messages
    /// onto `bus`. Must be called inside a tokio runtime.
    pub fn connect(
        dispatcher: &RecipeDispatcher,
        bus: &EventBus,
        name: &str,
        capabilities: BTreeSet<String>,
    ) -> AgentEndpoint {
        let (to_agent, inbound) = mpsc::unbounded_channel();
        let (outbound, mut from_agent) = mpsc::channel::<AgentMessage>(OUTBOUND_CAPACITY);
        let id = dispatcher.register_agent(name, capabilities, to_agent);

        let bus = bus.clone();
        tokio::spawn(async move {
            while let Some(message) = from_agent.recv().await {
                debug!(agent_id = %id, recipe_id = ?message.recipe_id(), "Agent message");
                bus.publish_payload(
                    "agent-link",
                    EventPayload::AgentMessageReceived {
                        agent_id: id,
                        message,
                    },
                );
            }
            info!(agent_id = %id, "Agent link closed");
            bus.publish_payload(
                "agent-link",
                EventPayload::AgentDisconnected {
                    agent_id: id,
                    reason: DisconnectReason::Graceful,
                },
            );
        });

        AgentEndpoint {
            id,
            inbound,
            outbound,
        }
    }
}
