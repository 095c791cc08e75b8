/// Background scheduler that runs sync passes on a fixed interval
use std::time::Duration;

use tokio::sync::watch;
use tokio::time;
use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::persistence::LocalStore;
use crate::session::{SyncReport, SyncSession};
use crate::transport::Transport;

/// Configuration for the sync scheduler
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// How often to run a pass (in seconds)
    pub interval_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval_secs: 60, // Once a minute
        }
    }
}

impl From<&SyncConfig> for SchedulerConfig {
    fn from(config: &SyncConfig) -> Self {
        Self {
            interval_secs: config.interval_secs,
        }
    }
}

/// Background sync scheduler
pub struct SyncScheduler<S, T> {
    session: SyncSession<S, T>,
    config: SchedulerConfig,
    shutdown: watch::Receiver<bool>,
}

impl<S, T> SyncScheduler<S, T>
where
    S: LocalStore + 'static,
    T: Transport + 'static,
{
    pub fn new(
        session: SyncSession<S, T>,
        config: SchedulerConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            session,
            config,
            shutdown,
        }
    }

    /// Run passes until the shutdown signal flips to `true`.
    pub async fn start(mut self) {
        info!(
            "Starting sync scheduler with interval {} seconds",
            self.config.interval_secs
        );

        let mut interval = time::interval(Duration::from_secs(self.config.interval_secs.max(1)));
        interval.set_missed_tick_behavior(time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if self.run_cycle().await {
                        break;
                    }
                }
                changed = self.shutdown.changed() => {
                    if stop_requested(&self.shutdown, changed) {
                        break;
                    }
                }
            }
        }

        info!("Sync scheduler stopped");
    }

    /// Run a single pass. Failures are already reported by the session.
    /// A shutdown signal arriving mid-pass cancels the pass; returns `true`
    /// in that case.
    async fn run_cycle(&mut self) -> bool {
        debug!("Starting scheduled sync");
        let session = self.session.clone();
        let pass = session.sync();
        tokio::pin!(pass);

        loop {
            tokio::select! {
                result = &mut pass => {
                    log_outcome(result);
                    return false;
                }
                changed = self.shutdown.changed() => {
                    if stop_requested(&self.shutdown, changed) {
                        info!("Shutting down sync scheduler, cancelling pass in flight");
                        session.cancel();
                        log_outcome((&mut pass).await);
                        return true;
                    }
                }
            }
        }
    }
}

fn stop_requested(
    shutdown: &watch::Receiver<bool>,
    changed: Result<(), watch::error::RecvError>,
) -> bool {
    changed.is_err() || *shutdown.borrow()
}

fn log_outcome(result: crate::error::Result<SyncReport>) {
    match result {
        Ok(report) => debug!(sent = report.sent, received = report.received, "Scheduled sync done"),
        Err(SyncError::Busy) => debug!("Previous sync still in flight, skipping tick"),
        Err(e) => warn!("Scheduled sync failed: {}", e),
    }
}

/// Start the sync scheduler as a background task. Send `true` on the
/// returned sender to stop it.
pub fn start_sync_scheduler<S, T>(
    session: SyncSession<S, T>,
    config: SchedulerConfig,
) -> (watch::Sender<bool>, tokio::task::JoinHandle<()>)
where
    S: LocalStore + 'static,
    T: Transport + 'static,
{
    let (tx, rx) = watch::channel(false);
    let scheduler = SyncScheduler::new(session, config, rx);
    let handle = tokio::spawn(scheduler.start());
    (tx, handle)
}
