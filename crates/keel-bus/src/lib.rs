//! In-process event bus for Keel CI.
//!
//! Delivery is synchronous: `publish` runs every matching listener on the
//! calling thread, in registration order, before returning.

mod bus;
mod listener;
pub mod metrics;

pub use bus::EventBus;
pub use listener::{EventListener, FnListener};
pub use metrics::{BusMetrics, MetricsSnapshot};
