//! Dead man's switch driver.
//!
//! While a session runs, a single background task sends a keepalive to the
//! engine every `period` (half the engine's own timeout). A missed beat is
//! logged and nothing more: the engine's timeout is the authoritative
//! backstop. At most one timer exists; [`Keepalive::arm`] always replaces it.

use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::client::EngineClient;

/// Owner of the keepalive timer task.
pub struct Keepalive {
    client: EngineClient,
    period: Duration,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl Keepalive {
    pub fn new(client: EngineClient, period: Duration) -> Self {
        Self {
            client,
            period,
            timer: Mutex::new(None),
        }
    }

    /// Start beating, replacing any timer already armed.
    pub fn arm(&self) {
        let mut slot = self.slot();
        if let Some(previous) = slot.take() {
            previous.abort();
            debug!("replaced existing keepalive timer");
        }

        let client = self.client.clone();
        let period = self.period;
        *slot = Some(tokio::spawn(beat_loop(client, period)));
        info!(period_ms = period.as_millis() as u64, "keepalive armed");
    }

    /// Stop beating. Returns whether a timer was armed.
    pub fn disarm(&self) -> bool {
        match self.slot().take() {
            Some(handle) => {
                handle.abort();
                info!("keepalive disarmed");
                true
            }
            None => false,
        }
    }

    pub fn is_armed(&self) -> bool {
        self.slot().as_ref().is_some_and(|h| !h.is_finished())
    }

    fn slot(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        // The slot holds no invariant a panicking holder could break.
        self.timer.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for Keepalive {
    fn drop(&mut self) {
        if let Some(handle) = self.slot().take() {
            handle.abort();
        }
    }
}

async fn beat_loop(client: EngineClient, period: Duration) {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut missed: u32 = 0;

    loop {
        ticker.tick().await;
        // Bounded by the period so a hung call cannot stall the cadence.
        let delivered = tokio::time::timeout(period, client.keepalive())
            .await
            .unwrap_or(false);

        if delivered {
            if missed > 0 {
                info!(missed, "keepalive recovered");
            }
            missed = 0;
        } else {
            missed += 1;
            warn!(missed, "missed keepalive beat");
        }
    }
}
