//! Worker contract: the per-queue handler plugged into the queue manager.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use std::future::Future;
use std::marker::PhantomData;
use std::time::Duration;

use crate::job::JobRecord;

/// Result type for job handlers.
pub type JobResult = std::result::Result<(), JobError>;

/// Error returned from job handlers.
///
/// Any handler failure counts against the job's attempts; the queue manager
/// decides between retry and permanent failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobError {
    /// Error message, stored on the job record.
    pub message: String,
}

impl JobError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl std::fmt::Display for JobError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

impl<E: std::error::Error> From<E> for JobError {
    fn from(err: E) -> Self {
        Self::new(err.to_string())
    }
}

/// A handler bound to exactly one queue.
///
/// The worker declares how many of its jobs may run at once and how often its
/// queue is polled. `handle` receives the deserialized payload and the claimed
/// record (with `attempts` already incremented for this run).
#[async_trait]
pub trait Worker: Send + Sync {
    /// Queue this worker drains.
    fn queue_name(&self) -> &str;

    /// Maximum number of simultaneously in-flight jobs for the queue.
    fn concurrency(&self) -> usize;

    /// How often the queue is polled for new work.
    fn poll_interval(&self) -> Duration;

    /// Perform the work.
    async fn handle(&self, payload: serde_json::Value, job: &JobRecord) -> JobResult;

    /// Called synchronously when the worker is registered.
    fn on_register(&self) {}

    /// Called during graceful shutdown, after polling stopped and in-flight
    /// jobs drained or the drain timed out.
    async fn on_stop(&self) {}
}

/// Worker built from a queue name and an async closure over a typed payload.
///
/// A payload that fails to deserialize into `T` is reported as a handler
/// failure.
pub struct HandlerWorker<T, F, Fut>
where
    T: DeserializeOwned + Send + Sync + 'static,
    F: Fn(T, JobRecord) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = JobResult> + Send + 'static,
{
    queue: String,
    concurrency: usize,
    poll_interval: Duration,
    handler: F,
    _phantom: PhantomData<fn() -> T>,
}

impl<T, F, Fut> HandlerWorker<T, F, Fut>
where
    T: DeserializeOwned + Send + Sync + 'static,
    F: Fn(T, JobRecord) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = JobResult> + Send + 'static,
{
    /// Create a worker with concurrency 1 and a one second poll interval.
    pub fn new(queue: impl Into<String>, handler: F) -> Self {
        Self {
            queue: queue.into(),
            concurrency: 1,
            poll_interval: Duration::from_secs(1),
            handler,
            _phantom: PhantomData,
        }
    }

    /// Set the concurrency ceiling.
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    /// Set the poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

#[async_trait]
impl<T, F, Fut> Worker for HandlerWorker<T, F, Fut>
where
    T: DeserializeOwned + Send + Sync + 'static,
    F: Fn(T, JobRecord) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = JobResult> + Send + 'static,
{
    fn queue_name(&self) -> &str {
        &self.queue
    }

    fn concurrency(&self) -> usize {
        self.concurrency
    }

    fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    async fn handle(&self, payload: serde_json::Value, job: &JobRecord) -> JobResult {
        let payload: T = serde_json::from_value(payload)
            .map_err(|e| JobError::new(format!("Invalid payload: {}", e)))?;
        (self.handler)(payload, job.clone()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{DispatchOptions, JobId, NewJob};
    use serde::Deserialize;

    #[derive(Debug, Deserialize)]
    struct FetchCorporation {
        corporation_id: u64,
    }

    fn record(payload: &str) -> JobRecord {
        NewJob::new("esi", "corporation", payload, &DispatchOptions::default(), 0)
            .unwrap()
            .into_record(JobId(1))
    }

    #[test]
    fn test_job_error_from_std_error() {
        let io = std::io::Error::new(std::io::ErrorKind::TimedOut, "upstream timed out");
        let err: JobError = io.into();
        assert_eq!(err.message, "upstream timed out");
        assert_eq!(err.to_string(), "upstream timed out");
    }

    #[test]
    fn test_handler_worker_defaults() {
        let worker = HandlerWorker::new("esi", |_: FetchCorporation, _: JobRecord| async {
            JobResult::Ok(())
        });
        assert_eq!(worker.queue_name(), "esi");
        assert_eq!(worker.concurrency(), 1);
        assert_eq!(worker.poll_interval(), Duration::from_secs(1));

        let worker = worker
            .with_concurrency(8)
            .with_poll_interval(Duration::from_millis(250));
        assert_eq!(worker.concurrency(), 8);
        assert_eq!(worker.poll_interval(), Duration::from_millis(250));
    }

    #[tokio::test]
    async fn test_handler_worker_typed_payload() {
        let handler = |job: FetchCorporation, record: JobRecord| async move {
            if job.corporation_id == 98 && record.id == JobId(1) {
                JobResult::Ok(())
            } else {
                Err(JobError::new("unexpected payload"))
            }
        };
        let worker = HandlerWorker::new("esi", handler);

        let payload = serde_json::json!({ "corporation_id": 98 });
        let result = worker.handle(payload, &record("{}")).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_handler_worker_bad_payload_is_failure() {
        let worker = HandlerWorker::new("esi", |_: FetchCorporation, _: JobRecord| async {
            JobResult::Ok(())
        });

        let result = worker
            .handle(serde_json::json!({ "wrong": true }), &record("{}"))
            .await;
        let err = result.unwrap_err();
        assert!(err.message.starts_with("Invalid payload"));
    }
}
