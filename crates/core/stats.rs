//! Throughput counters and the periodic stats logger.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Cumulative outcome counters shared by every queue of a manager.
#[derive(Debug, Default)]
pub struct Stats {
    completed: AtomicU64,
    retried: AtomicU64,
    failed: AtomicU64,
    completed_since_report: AtomicU64,
}

/// Point-in-time copy of [`Stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub completed: u64,
    pub retried: u64,
    pub failed: u64,
}

impl Stats {
    pub fn record_completed(&self) {
        self.completed.fetch_add(1, Ordering::Relaxed);
        self.completed_since_report.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retried(&self) {
        self.retried.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            completed: self.completed.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }

    /// Completed count since the previous call, resetting the window.
    fn take_window(&self) -> u64 {
        self.completed_since_report.swap(0, Ordering::Relaxed)
    }
}

/// Periodically logs throughput until shutdown is signalled.
pub(crate) struct StatsReporter {
    stats: Arc<Stats>,
    interval: Duration,
    shutdown: watch::Receiver<bool>,
}

impl StatsReporter {
    pub(crate) fn new(
        stats: Arc<Stats>,
        interval: Duration,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            stats,
            interval,
            shutdown,
        }
    }

    pub(crate) async fn run(mut self) {
        tracing::debug!("Stats reporter started");

        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick completes immediately.
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = self.shutdown.changed() => break,
            }

            let window = self.stats.take_window();
            let totals = self.stats.snapshot();
            let per_minute = window as f64 * 60.0 / self.interval.as_secs_f64().max(f64::EPSILON);

            tracing::info!(
                completed = window,
                per_minute = per_minute,
                total_completed = totals.completed,
                total_retried = totals.retried,
                total_failed = totals.failed,
                "Queue throughput"
            );
        }

        tracing::debug!("Stats reporter stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let stats = Stats::default();
        stats.record_completed();
        stats.record_completed();
        stats.record_retried();
        stats.record_failed();

        assert_eq!(
            stats.snapshot(),
            StatsSnapshot {
                completed: 2,
                retried: 1,
                failed: 1
            }
        );
    }

    #[test]
    fn test_window_resets() {
        let stats = Stats::default();
        stats.record_completed();
        assert_eq!(stats.take_window(), 1);
        assert_eq!(stats.take_window(), 0);
        // Cumulative total is untouched
        assert_eq!(stats.snapshot().completed, 1);
    }

    #[tokio::test]
    async fn test_reporter_stops_on_signal() {
        let (tx, rx) = watch::channel(false);
        let reporter =
            StatsReporter::new(Arc::new(Stats::default()), Duration::from_secs(3600), rx);
        let handle = tokio::spawn(reporter.run());

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("reporter did not stop")
            .unwrap();
    }
}
