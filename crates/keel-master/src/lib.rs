//! Master side of Keel CI.
//!
//! The [`RecipeDispatcher`] turns build requests into recipe requests sent
//! to idle agents and tracks them until a terminal result; the
//! [`ResultAggregator`] folds recipe results into build results;
//! [`MasterServer`] wires both to the scheduler and SCM monitor.

pub mod config;
mod dispatcher;
mod aggregator;
mod link;
mod pool;
mod server;
pub mod store;
mod watchdog;

pub use aggregator::ResultAggregator;
pub use config::MasterConfig;
pub use dispatcher::RecipeDispatcher;
pub use link::{AgentEndpoint, AgentLink};
pub use pool::AgentPool;
pub use server::MasterServer;
pub use store::InMemoryStore;
pub use watchdog::Watchdog;
