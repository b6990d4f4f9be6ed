//! Periodic agent pings and timeout enforcement.

use crate::config::MasterConfig;
use crate::dispatcher::RecipeDispatcher;
use chrono::Utc;
use tokio::sync::watch;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, info, warn};

pub struct Watchdog {
    dispatcher: RecipeDispatcher,
    config: MasterConfig,
}

impl Watchdog {
    pub fn new(dispatcher: RecipeDispatcher, config: MasterConfig) -> Self {
        Self { dispatcher, config }
    }

    /// Ping agents and check timeouts until shutdown.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ping = interval(self.config.ping_interval());
        let mut check = interval(self.config.watchdog_interval());
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
        check.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut seq = 0u64;

        info!(
            ping_interval_secs = self.config.ping_interval_secs,
            recipe_timeout_secs = self.config.recipe_timeout_secs,
            heartbeat_timeout_secs = self.config.heartbeat_timeout_secs,
            "Starting watchdog"
        );

        loop {
            tokio::select! {
                _ = ping.tick() => {
                    seq += 1;
                    let sent = self.dispatcher.ping_all(seq);
                    debug!(seq, sent, "Pinged agents");
                }
                _ = check.tick() => {
                    let expired = self.dispatcher.check_timeouts(Utc::now());
                    if !expired.is_empty() {
                        warn!(count = expired.len(), "Recipes forced to error by timeout");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Watchdog shutting down");
                        break;
                    }
                }
            }
        }
    }
}
