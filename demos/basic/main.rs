//! Basic demo using the SQLite store.
//!
//! Registers two queues, dispatches a handful of jobs with different
//! priorities and delays, and runs the manager until Ctrl+C or 15 seconds
//! have passed. One handler fails its first attempt to show retry backoff.
//!
//! Run with: `cargo run -p demo-basic`
//! Point `DATABASE_URL` at a file (e.g. `sqlite:demo.db`) to keep the jobs.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tq_core::{
    DispatchOptions, Dispatcher, HandlerWorker, JobError, JobRecord, JobResult, QueueManager,
    Worker,
};
use tq_sqlite::SqliteStore;
use tracing_subscriber::EnvFilter;

/// Refresh of a character's public data.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct FetchCharacter {
    character_id: u64,
}

/// Notification payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Notify {
    to: String,
    subject: String,
}

/// Fetches characters; every third call fails to exercise retries.
struct CharacterWorker {
    calls: AtomicUsize,
}

#[async_trait]
impl Worker for CharacterWorker {
    fn queue_name(&self) -> &str {
        "esi"
    }

    fn concurrency(&self) -> usize {
        4
    }

    fn poll_interval(&self) -> Duration {
        Duration::from_millis(250)
    }

    async fn handle(&self, payload: serde_json::Value, job: &JobRecord) -> JobResult {
        let request: FetchCharacter = serde_json::from_value(payload)?;

        tokio::time::sleep(Duration::from_millis(300)).await;

        if self.calls.fetch_add(1, Ordering::SeqCst) % 3 == 0 && job.attempts == 1 {
            return Err(JobError::new(format!(
                "upstream returned 502 for character {}",
                request.character_id
            )));
        }

        tracing::info!(
            character_id = request.character_id,
            attempt = job.attempts,
            "Character refreshed"
        );
        Ok(())
    }

    async fn on_stop(&self) {
        tracing::info!(calls = self.calls.load(Ordering::SeqCst), "Character worker stopped");
    }
}

async fn send_notification(notify: Notify, _job: JobRecord) -> JobResult {
    tokio::time::sleep(Duration::from_millis(100)).await;
    tracing::info!(to = %notify.to, subject = %notify.subject, "Notification sent");
    Ok(())
}

#[tokio::main]
async fn main() -> tq_core::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let database_url =
        std::env::var("DATABASE_URL").unwrap_or_else(|_| "sqlite::memory:".to_string());
    let store = SqliteStore::new(&database_url, "tq").await?;

    let manager = Arc::new(QueueManager::new(store.clone()));
    manager.register_worker(CharacterWorker {
        calls: AtomicUsize::new(0),
    })?;
    manager.register_worker(
        HandlerWorker::new("notifications", send_notification)
            .with_concurrency(2)
            .with_poll_interval(Duration::from_millis(500)),
    )?;

    let dispatcher = Dispatcher::new(store);

    for character_id in [90, 91, 92, 93, 94, 95] {
        dispatcher
            .dispatch(
                "esi",
                "character",
                &FetchCharacter { character_id },
                DispatchOptions::default(),
            )
            .await?;
    }

    // Lower value runs first
    dispatcher
        .dispatch(
            "notifications",
            "email",
            &Notify {
                to: "alice@example.com".to_string(),
                subject: "Password reset".to_string(),
            },
            DispatchOptions::default().priority(0),
        )
        .await?;
    dispatcher
        .dispatch(
            "notifications",
            "email",
            &Notify {
                to: "bob@example.com".to_string(),
                subject: "Weekly digest".to_string(),
            },
            DispatchOptions::default()
                .priority(5)
                .delay(Duration::from_secs(3)),
        )
        .await?;

    tracing::info!("Press Ctrl+C to stop");

    let reporter = {
        let manager = manager.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(2));
            loop {
                interval.tick().await;
                let status = manager.status();
                tracing::info!(
                    running = status.running,
                    active_jobs = status.active_jobs,
                    "Status"
                );
            }
        })
    };

    manager
        .run_until(async {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = tokio::time::sleep(Duration::from_secs(15)) => {}
            }
        })
        .await?;
    reporter.abort();

    for queue in ["esi", "notifications"] {
        let counts = dispatcher.counts(queue).await?;
        tracing::info!(
            queue = queue,
            pending = counts.pending,
            completed = counts.completed,
            failed = counts.failed,
            "Final counts"
        );
    }

    Ok(())
}
