//! Storage abstraction for persisted job records.
//!
//! The queue engine only ever talks to a [`Store`]. Implementations exist for
//! SQLite and PostgreSQL in their own crates, and [`crate::MemoryStore`] keeps
//! everything in process.

use async_trait::async_trait;
use std::sync::Arc;

use crate::error::Result;
use crate::job::{JobId, JobRecord, NewJob, QueueCounts};

/// Store trait for job record persistence.
///
/// Implementations must be thread-safe (Send + Sync). Every method that moves a
/// row out of a status must be a single conditional update keyed on the
/// expected prior status; that condition is what keeps two claimers from
/// taking the same row.
///
/// Transient lock conditions (busy database, deadlock, serialization failure)
/// should be reported as [`crate::TqError::Contention`].
#[async_trait]
pub trait Store: Send + Sync {
    // ========== Dispatch ==========

    /// Insert a new `pending` job and return its assigned id.
    async fn insert_job(&self, job: NewJob) -> Result<JobId>;

    /// Fetch a job by id.
    async fn get_job(&self, id: JobId) -> Result<Option<JobRecord>>;

    // ========== Claim ==========

    /// Read-only candidate selection.
    ///
    /// Returns up to `limit` ids with `queue = queue`, `status = pending`,
    /// `available_at <= now` and `attempts < max_attempts`, ordered by
    /// `priority ASC, id DESC`. Must not take write locks.
    async fn find_candidates(&self, queue: &str, now: i64, limit: usize) -> Result<Vec<JobId>>;

    /// Move one row from `pending` to `processing`.
    ///
    /// Sets `reserved_at = now` and increments `attempts`, only if the row is
    /// still pending. Returns the updated row, or `None` if the condition did
    /// not hold.
    async fn reserve_job(&self, id: JobId, now: i64) -> Result<Option<JobRecord>>;

    /// Batch form of [`Store::reserve_job`] in a single statement.
    ///
    /// Returns exactly the rows this call transitioned.
    async fn reserve_jobs(&self, ids: &[JobId], now: i64) -> Result<Vec<JobRecord>>;

    // ========== Outcomes ==========

    /// `processing -> completed`, stamping `processed_at`.
    ///
    /// Returns `false` if the row was not processing.
    async fn complete_job(&self, id: JobId, now: i64) -> Result<bool>;

    /// `processing -> pending` with a new `available_at` and the failure message.
    async fn retry_job(&self, id: JobId, available_at: i64, error: &str) -> Result<bool>;

    /// `processing -> failed`, stamping `processed_at` and the failure message.
    async fn fail_job(&self, id: JobId, now: i64, error: &str) -> Result<bool>;

    // ========== Monitoring ==========

    /// Count jobs of a queue by status.
    async fn queue_counts(&self, queue: &str) -> Result<QueueCounts>;

    /// Permanently failed jobs of a queue, newest first.
    async fn list_failed(&self, queue: &str, limit: usize) -> Result<Vec<JobRecord>>;
}

/// A type-erased store that can be shared across threads.
pub type DynStore = Arc<dyn Store>;

/// Wrapper around Arc<dyn Store> for convenience.
#[derive(Clone)]
pub struct SharedStore {
    inner: DynStore,
}

impl SharedStore {
    /// Create a new SharedStore from any Store implementation.
    pub fn new<S: Store + 'static>(store: S) -> Self {
        Self {
            inner: Arc::new(store),
        }
    }

    /// Get a reference to the inner store.
    pub fn inner(&self) -> &DynStore {
        &self.inner
    }
}

#[async_trait]
impl Store for SharedStore {
    async fn insert_job(&self, job: NewJob) -> Result<JobId> {
        self.inner.insert_job(job).await
    }

    async fn get_job(&self, id: JobId) -> Result<Option<JobRecord>> {
        self.inner.get_job(id).await
    }

    async fn find_candidates(&self, queue: &str, now: i64, limit: usize) -> Result<Vec<JobId>> {
        self.inner.find_candidates(queue, now, limit).await
    }

    async fn reserve_job(&self, id: JobId, now: i64) -> Result<Option<JobRecord>> {
        self.inner.reserve_job(id, now).await
    }

    async fn reserve_jobs(&self, ids: &[JobId], now: i64) -> Result<Vec<JobRecord>> {
        self.inner.reserve_jobs(ids, now).await
    }

    async fn complete_job(&self, id: JobId, now: i64) -> Result<bool> {
        self.inner.complete_job(id, now).await
    }

    async fn retry_job(&self, id: JobId, available_at: i64, error: &str) -> Result<bool> {
        self.inner.retry_job(id, available_at, error).await
    }

    async fn fail_job(&self, id: JobId, now: i64, error: &str) -> Result<bool> {
        self.inner.fail_job(id, now, error).await
    }

    async fn queue_counts(&self, queue: &str) -> Result<QueueCounts> {
        self.inner.queue_counts(queue).await
    }

    async fn list_failed(&self, queue: &str, limit: usize) -> Result<Vec<JobRecord>> {
        self.inner.list_failed(queue, limit).await
    }
}
