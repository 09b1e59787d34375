//! Dispatcher for enqueueing jobs.

use serde::Serialize;

use crate::error::Result;
use crate::job::{current_timestamp_millis, DispatchOptions, JobId, JobRecord, NewJob, QueueCounts};
use crate::store::{SharedStore, Store};

/// The write path into the queue from producer code.
///
/// Dispatching only inserts a row; execution is triggered by a
/// [`crate::QueueManager`] polling the same store.
#[derive(Clone)]
pub struct Dispatcher<S: Store + Clone = SharedStore> {
    store: S,
}

impl Dispatcher<SharedStore> {
    /// Create a new dispatcher with a shared store.
    pub fn new(store: impl Store + 'static) -> Self {
        Self {
            store: SharedStore::new(store),
        }
    }
}

impl<S: Store + Clone> Dispatcher<S> {
    /// Create a new dispatcher with a specific store.
    pub fn with_store(store: S) -> Self {
        Self { store }
    }

    /// Enqueue a job.
    ///
    /// The payload is serialized to JSON. Returns once the store has accepted
    /// the row; store failures propagate so the caller can decide whether to
    /// retry.
    pub async fn dispatch<T>(
        &self,
        queue: &str,
        job_type: &str,
        payload: &T,
        options: DispatchOptions,
    ) -> Result<JobId>
    where
        T: Serialize + ?Sized,
    {
        let payload = serde_json::to_string(payload)?;
        self.dispatch_raw(queue, job_type, payload, options).await
    }

    /// Enqueue a job whose payload is already serialized.
    pub async fn dispatch_raw(
        &self,
        queue: &str,
        job_type: &str,
        payload: String,
        options: DispatchOptions,
    ) -> Result<JobId> {
        let job = NewJob::new(queue, job_type, payload, &options, current_timestamp_millis())?;
        let available_at = job.available_at;

        let job_id = self.store.insert_job(job).await?;

        tracing::debug!(
            job_id = %job_id,
            queue = %queue,
            job_type = %job_type,
            priority = options.priority,
            available_at = available_at,
            "Job dispatched"
        );
        Ok(job_id)
    }

    /// Look up a job record, e.g. to poll its outcome.
    pub async fn job(&self, id: JobId) -> Result<Option<JobRecord>> {
        self.store.get_job(id).await
    }

    /// Job counts of a queue by status.
    pub async fn counts(&self, queue: &str) -> Result<QueueCounts> {
        self.store.queue_counts(queue).await
    }

    /// Permanently failed jobs of a queue, newest first.
    pub async fn failed_jobs(&self, queue: &str, limit: usize) -> Result<Vec<JobRecord>> {
        self.store.list_failed(queue, limit).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TqError;
    use crate::job::JobStatus;
    use crate::memory::MemoryStore;
    use serde::Deserialize;
    use std::time::Duration;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct FetchCharacter {
        character_id: u64,
    }

    #[tokio::test]
    async fn test_dispatch_defaults() {
        let store = MemoryStore::new();
        let dispatcher = Dispatcher::new(store.clone());

        let before = current_timestamp_millis();
        let id = dispatcher
            .dispatch(
                "esi",
                "character",
                &FetchCharacter { character_id: 90 },
                DispatchOptions::default(),
            )
            .await
            .unwrap();
        let after = current_timestamp_millis();

        let job = dispatcher.job(id).await.unwrap().unwrap();
        assert_eq!(job.queue, "esi");
        assert_eq!(job.job_type, "character");
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.attempts, 0);
        assert_eq!(job.max_attempts, 3);
        assert_eq!(job.priority, 0);
        assert!(job.available_at >= before && job.available_at <= after);
        assert_eq!(job.available_at, job.created_at);

        let payload: FetchCharacter = serde_json::from_str(&job.payload).unwrap();
        assert_eq!(payload, FetchCharacter { character_id: 90 });
    }

    #[tokio::test]
    async fn test_dispatch_with_options() {
        let dispatcher = Dispatcher::new(MemoryStore::new());
        let options = DispatchOptions::default()
            .priority(5)
            .delay(Duration::from_secs(60))
            .max_attempts(5);

        let id = dispatcher
            .dispatch("prices", "refresh", &serde_json::json!({}), options)
            .await
            .unwrap();

        let job = dispatcher.job(id).await.unwrap().unwrap();
        assert_eq!(job.priority, 5);
        assert_eq!(job.max_attempts, 5);
        assert_eq!(job.available_at - job.created_at, 60_000);
    }

    #[tokio::test]
    async fn test_dispatch_does_not_execute() {
        let store = MemoryStore::new();
        let dispatcher = Dispatcher::new(store.clone());
        dispatcher
            .dispatch_raw("q1", "t", "{}".to_string(), DispatchOptions::default())
            .await
            .unwrap();

        let counts = dispatcher.counts("q1").await.unwrap();
        assert_eq!(counts.pending, 1);
        assert_eq!(counts.processing, 0);
    }

    #[tokio::test]
    async fn test_dispatch_invalid_options() {
        let dispatcher = Dispatcher::new(MemoryStore::new());
        let result = dispatcher
            .dispatch_raw(
                "q1",
                "t",
                "{}".to_string(),
                DispatchOptions::default().max_attempts(0),
            )
            .await;
        assert!(matches!(result, Err(TqError::Config(_))));
    }
}
