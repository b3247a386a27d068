//! Watchdog for in-flight commands the resource never answers

use std::sync::Arc;

use devseq_shared::{StateModel, Target};
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{info, warn};

use super::sequencer::Sequencer;

/// Fails an in-flight command once it outlives the dispatch timeout
pub struct DispatchWatchdog<T: Target, S: StateModel> {
    sequencer: Arc<Sequencer<T, S>>,
    max_age: Duration,
    check_interval: Duration,
}

impl<T: Target, S: StateModel> DispatchWatchdog<T, S> {
    /// Create a watchdog from the sequencer's config; None when disabled
    pub fn from_config(sequencer: Arc<Sequencer<T, S>>) -> Option<Self> {
        let max_age = sequencer.config().dispatch_timeout?;
        let check_interval = sequencer.config().watchdog_interval;

        Some(Self {
            sequencer,
            max_age,
            check_interval,
        })
    }

    /// Start the watchdog loop
    pub async fn run(&self) {
        let mut ticker = interval(self.check_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;

            if let Some(id) = self.sequencer.expire_overdue(self.max_age).await {
                warn!(
                    "[{}] Watchdog failed command {} after {}ms",
                    self.sequencer.name(),
                    id,
                    self.max_age.as_millis()
                );
            }
        }
    }

    /// Run the watchdog on its own task
    pub fn spawn(self) -> JoinHandle<()> {
        info!(
            "[{}] Dispatch watchdog armed ({}ms)",
            self.sequencer.name(),
            self.max_age.as_millis()
        );
        tokio::spawn(async move { self.run().await })
    }
}
