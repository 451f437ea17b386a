//! Cancellable periodic background task

use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::debug;

use crate::types::{OfflineError, Result};

/// Runs `tick` every `period` until cancelled or dropped.
///
/// The first run happens one full period after spawning. A zero period is
/// rejected.
pub struct PeriodicTask {
    name: &'static str,
    handle: JoinHandle<()>,
}

impl PeriodicTask {
    pub fn spawn<F, Fut>(name: &'static str, period: Duration, mut tick: F) -> Result<Self>
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if period.is_zero() {
            return Err(OfflineError::Config(format!(
                "Period of task {} must be greater than zero",
                name
            )));
        }
        let handle = tokio::spawn(async move {
            let mut interval = interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                debug!(task = name, "Periodic tick");
                tick().await;
            }
        });
        debug!(task = name, period_ms = period.as_millis() as u64, "Periodic task started");
        Ok(Self { name, handle })
    }

    pub fn cancel(&self) {
        if !self.handle.is_finished() {
            debug!(task = self.name, "Periodic task cancelled");
        }
        self.handle.abort();
    }
}

impl Drop for PeriodicTask {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
