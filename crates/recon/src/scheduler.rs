//! Periodic reconciliation
//!
//! Runs `ReconciliationJob::run_all` every `interval` until told to stop.
//! A tick that fires while a run is still going is skipped, never queued.

use crate::job::{ReconciliationJob, RunSummary};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Handle to a running scheduler
pub struct ReconciliationScheduler {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<usize>,
}

impl ReconciliationScheduler {
    /// Start running `job` now and then every `interval`
    ///
    /// `on_run` sees each finished run's summary.
    pub fn spawn<F>(job: Arc<ReconciliationJob>, interval: Duration, on_run: F) -> Self
    where
        F: Fn(&RunSummary) + Send + 'static,
    {
        let (shutdown, mut stop) = watch::channel(false);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut runs = 0usize;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    changed = stop.changed() => {
                        if changed.is_err() || *stop.borrow() {
                            break;
                        }
                        continue;
                    }
                }

                match job.run_all().await {
                    Ok(summary) => on_run(&summary),
                    Err(e) => tracing::error!(code = e.code(), error = %e, "Reconciliation run failed"),
                }
                runs += 1;

                if *stop.borrow() {
                    break;
                }
            }

            tracing::info!(runs, "Reconciliation scheduler stopped");
            runs
        });

        tracing::info!(interval_ms = interval.as_millis() as u64, "Reconciliation scheduler started");
        Self { shutdown, handle }
    }

    /// Ask the scheduler to stop after the current run; returns the number of runs
    pub async fn shutdown(self) -> usize {
        let _ = self.shutdown.send(true);
        self.handle.await.unwrap_or(0)
    }
}
