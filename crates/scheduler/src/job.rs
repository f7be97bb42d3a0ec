//! Single-flight periodic job runner.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// A unit of background work run on a schedule.
#[async_trait]
pub trait Job: Send + Sync + 'static {
    /// What one run produces, e.g. a report of the records it touched.
    type Output: Send;

    /// Short name used as the metric prefix and in logs.
    fn name(&self) -> &'static str;

    async fn run(&self) -> Self::Output;
}

/// Result of asking a [`PeriodicJob`] to tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome<T> {
    Ran(T),
    /// A previous run was still in progress; nothing was done.
    Skipped,
}

impl<T> TickOutcome<T> {
    pub fn is_skipped(&self) -> bool {
        matches!(self, TickOutcome::Skipped)
    }

    pub fn into_output(self) -> Option<T> {
        match self {
            TickOutcome::Ran(output) => Some(output),
            TickOutcome::Skipped => None,
        }
    }
}

/// Clears the running flag when a run ends, even by panic.
struct RunGuard<'a>(&'a AtomicBool);

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Runs a [`Job`] on a fixed interval, never overlapping with itself.
///
/// Scheduled ticks and manual triggers share the same running flag: a tick
/// that finds a run in progress is skipped, not queued.
pub struct PeriodicJob<J: Job> {
    job: Arc<J>,
    interval: Duration,
    running: AtomicBool,
}

impl<J: Job> PeriodicJob<J> {
    pub fn new(job: J, interval: Duration) -> Self {
        Self {
            job: Arc::new(job),
            interval,
            running: AtomicBool::new(false),
        }
    }

    pub fn job(&self) -> &J {
        &self.job
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Runs the job once unless a run is already in progress.
    pub async fn tick(&self) -> TickOutcome<J::Output> {
        let name = self.job.name();
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            metrics::counter!(format!("{name}_ticks_skipped_total")).increment(1);
            tracing::warn!(job = name, "previous run still in progress, skipping tick");
            return TickOutcome::Skipped;
        }
        let _guard = RunGuard(&self.running);

        metrics::counter!(format!("{name}_ticks_total")).increment(1);
        let started = std::time::Instant::now();
        let output = self.job.run().await;
        metrics::histogram!(format!("{name}_tick_duration_seconds"))
            .record(started.elapsed().as_secs_f64());
        TickOutcome::Ran(output)
    }

    /// Ticks every `interval` until `shutdown` flips to true or its sender
    /// is dropped. The first tick fires immediately.
    pub fn spawn(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let name = self.job.name();
            tracing::info!(
                job = name,
                interval_secs = self.interval.as_secs(),
                "periodic job started"
            );

            let mut interval = tokio::time::interval(self.interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    _ = interval.tick() => {
                        self.tick().await;
                    }
                }
            }
            tracing::info!(job = name, "periodic job stopped");
        })
    }
}
