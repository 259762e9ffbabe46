//! Polling drivers.
//!
//! No push channel exists, so schedule-boundary crossings are detected by
//! re-running the controller's reconcile on a short period. A separate,
//! coarser tick recomputes countdown displays from stored timestamps and
//! performs no I/O.

use chrono::{DateTime, Local, Utc};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::{debug, error, info};

use crate::cache::Snapshot;
use crate::error::Result;
use crate::session::LockController;

/// Poll interval source with optional jitter to spread load on the store.
pub struct PollingScheduler {
    base_interval: Duration,
    jitter_range: Duration,
}

impl PollingScheduler {
    pub fn new(interval_secs: u64, jitter_secs: u64) -> Self {
        Self {
            base_interval: Duration::from_secs(interval_secs),
            jitter_range: Duration::from_secs(jitter_secs),
        }
    }

    pub async fn sleep_until_next_poll(&self) {
        sleep(self.next_interval()).await;
    }

    fn next_interval(&self) -> Duration {
        let jitter_secs = self.jitter_range.as_secs();
        if jitter_secs == 0 {
            return self.base_interval;
        }
        let jitter = rand::thread_rng().gen_range(0..=jitter_secs);
        self.base_interval + Duration::from_secs(jitter)
    }
}

/// Drives `Unlocked <-> LockedScheduled` transitions by periodic
/// reconciliation. Startable and stoppable; the period comes from config
/// rather than being tied to any screen lifecycle.
pub struct SchedulePoller {
    controller: Arc<LockController>,
    scheduler: PollingScheduler,
    running: Arc<Mutex<bool>>,
}

impl SchedulePoller {
    pub fn new(controller: Arc<LockController>, period_secs: u64, jitter_secs: u64) -> Self {
        Self {
            controller,
            scheduler: PollingScheduler::new(period_secs, jitter_secs),
            running: Arc::new(Mutex::new(false)),
        }
    }

    /// Run the poll loop until [`stop`](Self::stop) is called. One failed
    /// cycle is logged and the loop continues.
    pub async fn run(&self) -> Result<()> {
        {
            let mut running = self.running.lock().await;
            *running = true;
        }
        info!(account = %self.controller.account(), "schedule poller started");

        loop {
            if !*self.running.lock().await {
                info!("schedule poller stopped");
                return Ok(());
            }

            match self.controller.reconcile(&Local::now()).await {
                Ok(snapshot) => {
                    debug!(lock = ?snapshot.lock, stale = snapshot.stale, "poll cycle complete");
                }
                Err(e) => {
                    error!(error = %e, "poll cycle failed");
                }
            }

            self.scheduler.sleep_until_next_poll().await;
        }
    }

    pub async fn stop(&self) {
        let mut running = self.running.lock().await;
        *running = false;
    }

    pub async fn is_running(&self) -> bool {
        *self.running.lock().await
    }
}

/// Human-readable countdown summary for the display tick. Pure
/// recomputation from stored timestamps.
pub fn countdown_summary(snapshot: &Snapshot, now: DateTime<Utc>) -> String {
    let mut parts = vec![format!("tapouts: {}", snapshot.quota.remaining())];

    if let Some(eta) = snapshot.quota.refill_eta(now) {
        parts.push(format!("next refill in {}", humanize(eta)));
    }
    if let Some(left) = snapshot.membership.trial_remaining(now) {
        parts.push(format!("trial ends in {}", humanize(left)));
    }
    if snapshot.stale {
        parts.push("(offline, showing cached data)".to_string());
    }

    parts.join(", ")
}

fn humanize(d: chrono::Duration) -> String {
    let days = d.num_days();
    let hours = d.num_hours() % 24;
    let minutes = d.num_minutes() % 60;
    if days > 0 {
        format!("{days}d {hours}h")
    } else if hours > 0 {
        format!("{hours}h {minutes}m")
    } else {
        format!("{minutes}m")
    }
}
