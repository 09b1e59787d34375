//! SQLite store for the tq job processor.
//!
//! Jobs live in a single `{namespace}_jobs` table. Claims use a plain
//! `SELECT` for candidates followed by `UPDATE ... WHERE status = 'pending'
//! RETURNING ...`, so no explicit transaction is held between the two phases.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use tq_sqlite::SqliteStore;
//! use tq_core::Dispatcher;
//!
//! #[tokio::main]
//! async fn main() -> tq_core::Result<()> {
//!     let store = SqliteStore::new("sqlite:jobs.db", "myapp").await?;
//!     let dispatcher = Dispatcher::new(store);
//!     Ok(())
//! }
//! ```

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use std::time::Duration;
use tq_core::{JobId, JobRecord, JobStatus, NewJob, QueueCounts, Result, Store, TqError};

const COLUMNS: &str = "id, queue, job_type, payload, status, available_at, reserved_at, \
                       processed_at, created_at, attempts, max_attempts, priority, error";

/// How long a connection waits on a locked database before reporting busy.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Pool settings for `database_url`.
///
/// An in-memory database lives only as long as its connection, so that
/// connection is never reaped for idleness or age.
fn pool_options(database_url: &str) -> SqlitePoolOptions {
    // SQLite works best with single connection for writes
    let options = SqlitePoolOptions::new().max_connections(1);
    if database_url.contains(":memory:") || database_url.contains("mode=memory") {
        options.idle_timeout(None).max_lifetime(None)
    } else {
        options
    }
}

/// SQLite store for job records.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
    namespace: String,
}

impl SqliteStore {
    /// Create a new SQLite store.
    ///
    /// The database_url should be in the format: `sqlite:path/to/db.sqlite` or `sqlite::memory:`
    pub async fn new(database_url: &str, namespace: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(|e| TqError::Config(format!("Invalid SQLite URL: {}", e)))?
            .create_if_missing(true)
            .busy_timeout(BUSY_TIMEOUT);

        let pool = pool_options(database_url)
            .connect_with(options)
            .await
            .map_err(|e| TqError::Backend(format!("Failed to connect to SQLite: {}", e)))?;

        Self::with_pool(pool, namespace).await
    }

    /// Create an in-memory SQLite store (useful for testing).
    pub async fn in_memory(namespace: &str) -> Result<Self> {
        Self::new("sqlite::memory:", namespace).await
    }

    /// Use an existing pool, creating the jobs table if needed.
    pub async fn with_pool(pool: SqlitePool, namespace: &str) -> Result<Self> {
        validate_namespace(namespace)?;

        let store = Self {
            pool,
            namespace: namespace.to_string(),
        };
        store.init_tables().await?;

        tracing::debug!(namespace = %namespace, "SQLite store ready");
        Ok(store)
    }

    /// Initialize the required tables.
    async fn init_tables(&self) -> Result<()> {
        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {} (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                queue TEXT NOT NULL,
                job_type TEXT NOT NULL,
                payload TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                available_at INTEGER NOT NULL,
                reserved_at INTEGER,
                processed_at INTEGER,
                created_at INTEGER NOT NULL,
                attempts INTEGER NOT NULL DEFAULT 0,
                max_attempts INTEGER NOT NULL DEFAULT 3,
                priority INTEGER NOT NULL DEFAULT 0,
                error TEXT
            )
            "#,
            self.jobs_table()
        ))
        .execute(&self.pool)
        .await
        .map_err(|e| map_err("Failed to create jobs table", e))?;

        // Serves the candidate query
        sqlx::query(&format!(
            "CREATE INDEX IF NOT EXISTS idx_{}_jobs_claim ON {} (queue, status, priority, available_at)",
            self.namespace,
            self.jobs_table()
        ))
        .execute(&self.pool)
        .await
        .map_err(|e| map_err("Failed to create claim index", e))?;

        Ok(())
    }

    fn jobs_table(&self) -> String {
        format!("{}_jobs", self.namespace)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

/// Table names are interpolated into SQL, so only identifier characters pass.
fn validate_namespace(namespace: &str) -> Result<()> {
    let valid = !namespace.is_empty()
        && namespace
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(TqError::Config(format!("Invalid namespace: {:?}", namespace)))
    }
}

/// Busy and locked databases are contention, everything else a backend error.
fn map_err(context: &str, e: sqlx::Error) -> TqError {
    if let sqlx::Error::Database(db) = &e {
        let busy = matches!(db.code().as_deref(), Some("5" | "6" | "261" | "262" | "517"))
            || db.message().contains("database is locked");
        if busy {
            return TqError::Contention(format!("{}: {}", context, e));
        }
    }
    TqError::Backend(format!("{}: {}", context, e))
}

#[derive(sqlx::FromRow)]
struct JobRow {
    id: i64,
    queue: String,
    job_type: String,
    payload: String,
    status: String,
    available_at: i64,
    reserved_at: Option<i64>,
    processed_at: Option<i64>,
    created_at: i64,
    attempts: i64,
    max_attempts: i64,
    priority: i64,
    error: Option<String>,
}

fn column_int<T: TryFrom<i64>>(value: i64, column: &str) -> Result<T> {
    T::try_from(value)
        .map_err(|_| TqError::Backend(format!("Column {} out of range: {}", column, value)))
}

impl TryFrom<JobRow> for JobRecord {
    type Error = TqError;

    fn try_from(row: JobRow) -> Result<Self> {
        Ok(JobRecord {
            id: JobId(row.id),
            queue: row.queue,
            job_type: row.job_type,
            payload: row.payload,
            status: JobStatus::from_str(&row.status)?,
            available_at: row.available_at,
            reserved_at: row.reserved_at,
            processed_at: row.processed_at,
            created_at: row.created_at,
            attempts: column_int(row.attempts, "attempts")?,
            max_attempts: column_int(row.max_attempts, "max_attempts")?,
            priority: column_int(row.priority, "priority")?,
            error: row.error,
        })
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn insert_job(&self, job: NewJob) -> Result<JobId> {
        let row: (i64,) = sqlx::query_as(&format!(
            "INSERT INTO {} (queue, job_type, payload, status, available_at, created_at, attempts, max_attempts, priority) \
             VALUES (?, ?, ?, 'pending', ?, ?, 0, ?, ?) RETURNING id",
            self.jobs_table()
        ))
        .bind(&job.queue)
        .bind(&job.job_type)
        .bind(&job.payload)
        .bind(job.available_at)
        .bind(job.created_at)
        .bind(i64::from(job.max_attempts))
        .bind(i64::from(job.priority))
        .fetch_one(&self.pool)
        .await
        .map_err(|e| map_err("Failed to insert job", e))?;

        Ok(JobId(row.0))
    }

    async fn get_job(&self, id: JobId) -> Result<Option<JobRecord>> {
        let row: Option<JobRow> = sqlx::query_as(&format!(
            "SELECT {} FROM {} WHERE id = ?",
            COLUMNS,
            self.jobs_table()
        ))
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_err("Failed to get job", e))?;

        row.map(JobRecord::try_from).transpose()
    }

    async fn find_candidates(&self, queue: &str, now: i64, limit: usize) -> Result<Vec<JobId>> {
        let rows: Vec<(i64,)> = sqlx::query_as(&format!(
            "SELECT id FROM {} \
             WHERE queue = ? AND status = 'pending' AND available_at <= ? AND attempts < max_attempts \
             ORDER BY priority ASC, id DESC LIMIT ?",
            self.jobs_table()
        ))
        .bind(queue)
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_err("Failed to select candidates", e))?;

        Ok(rows.into_iter().map(|(id,)| JobId(id)).collect())
    }

    async fn reserve_job(&self, id: JobId, now: i64) -> Result<Option<JobRecord>> {
        let row: Option<JobRow> = sqlx::query_as(&format!(
            "UPDATE {} SET status = 'processing', reserved_at = ?, attempts = attempts + 1 \
             WHERE id = ? AND status = 'pending' RETURNING {}",
            self.jobs_table(),
            COLUMNS
        ))
        .bind(now)
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_err("Failed to reserve job", e))?;

        row.map(JobRecord::try_from).transpose()
    }

    async fn reserve_jobs(&self, ids: &[JobId], now: i64) -> Result<Vec<JobRecord>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let placeholders = vec!["?"; ids.len()].join(", ");
        let sql = format!(
            "UPDATE {} SET status = 'processing', reserved_at = ?, attempts = attempts + 1 \
             WHERE id IN ({}) AND status = 'pending' RETURNING {}",
            self.jobs_table(),
            placeholders,
            COLUMNS
        );

        let mut query = sqlx::query_as::<_, JobRow>(&sql).bind(now);
        for id in ids {
            query = query.bind(id.0);
        }

        let rows = query
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_err("Failed to reserve jobs", e))?;

        rows.into_iter().map(JobRecord::try_from).collect()
    }

    async fn complete_job(&self, id: JobId, now: i64) -> Result<bool> {
        let result = sqlx::query(&format!(
            "UPDATE {} SET status = 'completed', processed_at = ? WHERE id = ? AND status = 'processing'",
            self.jobs_table()
        ))
        .bind(now)
        .bind(id.0)
        .execute(&self.pool)
        .await
        .map_err(|e| map_err("Failed to complete job", e))?;

        Ok(result.rows_affected() == 1)
    }

    async fn retry_job(&self, id: JobId, available_at: i64, error: &str) -> Result<bool> {
        let result = sqlx::query(&format!(
            "UPDATE {} SET status = 'pending', available_at = ?, error = ? WHERE id = ? AND status = 'processing'",
            self.jobs_table()
        ))
        .bind(available_at)
        .bind(error)
        .bind(id.0)
        .execute(&self.pool)
        .await
        .map_err(|e| map_err("Failed to retry job", e))?;

        Ok(result.rows_affected() == 1)
    }

    async fn fail_job(&self, id: JobId, now: i64, error: &str) -> Result<bool> {
        let result = sqlx::query(&format!(
            "UPDATE {} SET status = 'failed', processed_at = ?, error = ? WHERE id = ? AND status = 'processing'",
            self.jobs_table()
        ))
        .bind(now)
        .bind(error)
        .bind(id.0)
        .execute(&self.pool)
        .await
        .map_err(|e| map_err("Failed to fail job", e))?;

        Ok(result.rows_affected() == 1)
    }

    async fn queue_counts(&self, queue: &str) -> Result<QueueCounts> {
        let rows: Vec<(String, i64)> = sqlx::query_as(&format!(
            "SELECT status, COUNT(*) FROM {} WHERE queue = ? GROUP BY status",
            self.jobs_table()
        ))
        .bind(queue)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_err("Failed to count jobs", e))?;

        let mut counts = QueueCounts::default();
        for (status, count) in rows {
            let count = count as u64;
            match JobStatus::from_str(&status)? {
                JobStatus::Pending => counts.pending = count,
                JobStatus::Processing => counts.processing = count,
                JobStatus::Completed => counts.completed = count,
                JobStatus::Failed => counts.failed = count,
            }
        }
        Ok(counts)
    }

    async fn list_failed(&self, queue: &str, limit: usize) -> Result<Vec<JobRecord>> {
        let rows: Vec<JobRow> = sqlx::query_as(&format!(
            "SELECT {} FROM {} WHERE queue = ? AND status = 'failed' ORDER BY id DESC LIMIT ?",
            COLUMNS,
            self.jobs_table()
        ))
        .bind(queue)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_err("Failed to list failed jobs", e))?;

        rows.into_iter().map(JobRecord::try_from).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tq_core::{
        claim_job, claim_jobs_batch, DispatchOptions, Dispatcher, HandlerWorker, JobResult,
        ManagerConfig, QueueManager,
    };

    fn new_job(queue: &str, priority: i32, now: i64) -> NewJob {
        NewJob::new(queue, "t", "{}", &DispatchOptions::default().priority(priority), now).unwrap()
    }

    #[test]
    fn test_validate_namespace() {
        assert!(validate_namespace("myapp").is_ok());
        assert!(validate_namespace("my_app_2").is_ok());
        assert!(validate_namespace("").is_err());
        assert!(validate_namespace("app; DROP TABLE x").is_err());
    }

    #[test]
    fn test_memory_pool_keeps_its_connection() {
        for url in ["sqlite::memory:", "sqlite:file:jobs?mode=memory&cache=shared"] {
            let options = pool_options(url);
            assert!(options.get_idle_timeout().is_none(), "{}", url);
            assert!(options.get_max_lifetime().is_none(), "{}", url);
            assert_eq!(options.get_max_connections(), 1);
        }

        let file = pool_options("sqlite:jobs.db");
        assert!(file.get_idle_timeout().is_some());
        assert!(file.get_max_lifetime().is_some());
    }

    #[tokio::test]
    async fn test_insert_and_get() {
        let store = SqliteStore::in_memory("test").await.unwrap();
        let id = store.insert_job(new_job("esi", 2, 1_000)).await.unwrap();

        let job = store.get_job(id).await.unwrap().unwrap();
        assert_eq!(job.queue, "esi");
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.priority, 2);
        assert_eq!(job.attempts, 0);
        assert_eq!(job.max_attempts, 3);
        assert_eq!(job.available_at, 1_000);
        assert!(job.reserved_at.is_none());

        assert!(store.get_job(JobId(999)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_corrupt_counters_are_rejected() {
        let store = SqliteStore::in_memory("test").await.unwrap();
        let id = store.insert_job(new_job("esi", 0, 0)).await.unwrap();

        sqlx::query(&format!("UPDATE {} SET attempts = -1 WHERE id = ?", store.jobs_table()))
            .bind(id.0)
            .execute(store.pool())
            .await
            .unwrap();

        let err = store.get_job(id).await.unwrap_err();
        assert!(matches!(err, TqError::Backend(ref msg) if msg.contains("attempts")));
    }

    #[tokio::test]
    async fn test_candidates_order_and_eligibility() {
        let store = SqliteStore::in_memory("test").await.unwrap();
        let low = store.insert_job(new_job("q", 5, 0)).await.unwrap();
        let old = store.insert_job(new_job("q", 0, 0)).await.unwrap();
        let new = store.insert_job(new_job("q", 0, 0)).await.unwrap();
        store.insert_job(new_job("q", 0, 10_000)).await.unwrap();
        store.insert_job(new_job("other", 0, 0)).await.unwrap();

        let ids = store.find_candidates("q", 100, 10).await.unwrap();
        assert_eq!(ids, vec![new, old, low]);

        let ids = store.find_candidates("q", 100, 1).await.unwrap();
        assert_eq!(ids, vec![new]);
    }

    #[tokio::test]
    async fn test_reserve_is_conditional() {
        let store = SqliteStore::in_memory("test").await.unwrap();
        let id = store.insert_job(new_job("q", 0, 0)).await.unwrap();

        let job = store.reserve_job(id, 50).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Processing);
        assert_eq!(job.attempts, 1);
        assert_eq!(job.reserved_at, Some(50));

        assert!(store.reserve_job(id, 60).await.unwrap().is_none());
        assert_eq!(store.get_job(id).await.unwrap().unwrap().attempts, 1);
    }

    #[tokio::test]
    async fn test_reserve_jobs_returns_only_transitioned() {
        let store = SqliteStore::in_memory("test").await.unwrap();
        let a = store.insert_job(new_job("q", 0, 0)).await.unwrap();
        let b = store.insert_job(new_job("q", 0, 0)).await.unwrap();
        let c = store.insert_job(new_job("q", 0, 0)).await.unwrap();
        store.reserve_job(b, 1).await.unwrap().unwrap();

        let mut reserved: Vec<JobId> = store
            .reserve_jobs(&[a, b, c], 2)
            .await
            .unwrap()
            .into_iter()
            .map(|job| job.id)
            .collect();
        reserved.sort();
        assert_eq!(reserved, vec![a, c]);

        assert!(store.reserve_jobs(&[], 3).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_outcomes_require_processing() {
        let store = SqliteStore::in_memory("test").await.unwrap();
        let id = store.insert_job(new_job("q", 0, 0)).await.unwrap();

        assert!(!store.complete_job(id, 1).await.unwrap());

        store.reserve_job(id, 1).await.unwrap().unwrap();
        assert!(store.retry_job(id, 1_001, "timeout").await.unwrap());
        let job = store.get_job(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.available_at, 1_001);
        assert_eq!(job.error.as_deref(), Some("timeout"));

        store.reserve_job(id, 2_000).await.unwrap().unwrap();
        assert!(store.fail_job(id, 2_500, "gone").await.unwrap());
        assert!(!store.complete_job(id, 3_000).await.unwrap());

        let job = store.get_job(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.processed_at, Some(2_500));

        let failed = store.list_failed("q", 10).await.unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].id, id);

        let counts = store.queue_counts("q").await.unwrap();
        assert_eq!(counts.failed, 1);
        assert_eq!(counts.pending, 0);
    }

    #[tokio::test]
    async fn test_claim_through_store() {
        let store = SqliteStore::in_memory("test").await.unwrap();
        for _ in 0..5 {
            store.insert_job(new_job("q", 0, 0)).await.unwrap();
        }

        let one = claim_job(&store, "q", 10).await.unwrap().unwrap();
        assert_eq!(one.status, JobStatus::Processing);

        let batch = claim_jobs_batch(&store, "q", 10, 10).await.unwrap();
        assert_eq!(batch.len(), 4);
        assert!(batch.iter().all(|job| job.id != one.id));

        assert!(claim_job(&store, "q", 10).await.unwrap().is_none());
        assert_eq!(store.queue_counts("q").await.unwrap().processing, 5);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_competing_claimers_on_shared_file() {
        let path = std::env::temp_dir().join(format!(
            "tq_sqlite_test_{}_{}.db",
            std::process::id(),
            tq_core::current_timestamp_millis()
        ));
        let url = format!("sqlite:{}", path.display());

        let first = SqliteStore::new(&url, "shared").await.unwrap();
        let second = SqliteStore::new(&url, "shared").await.unwrap();
        for _ in 0..20 {
            first.insert_job(new_job("q", 0, 0)).await.unwrap();
        }

        let claimers: Vec<_> = [first.clone(), second.clone(), first.clone(), second.clone()]
            .into_iter()
            .map(|store| {
                tokio::spawn(async move {
                    let mut claimed = Vec::new();
                    loop {
                        match claim_job(&store, "q", 10).await.unwrap() {
                            Some(job) => claimed.push(job.id),
                            None => {
                                if store.queue_counts("q").await.unwrap().pending == 0 {
                                    break;
                                }
                            }
                        }
                    }
                    claimed
                })
            })
            .collect();

        let mut all = Vec::new();
        for claimer in claimers {
            all.extend(claimer.await.unwrap());
        }
        all.sort();
        let before = all.len();
        all.dedup();

        assert_eq!(before, 20);
        assert_eq!(all.len(), 20);

        first.pool().close().await;
        second.pool().close().await;
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_manager_drains_sqlite_queue() {
        let store = SqliteStore::in_memory("test").await.unwrap();
        let dispatcher = Dispatcher::new(store.clone());
        let manager = QueueManager::new(store.clone()).with_config(
            ManagerConfig::builder()
                .drain_poll_interval(Duration::from_millis(10))
                .build(),
        );

        let handled = Arc::new(AtomicUsize::new(0));
        let counter = handled.clone();
        let worker = HandlerWorker::new("prices", move |_: serde_json::Value, _: JobRecord| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                JobResult::Ok(())
            }
        })
        .with_concurrency(3)
        .with_poll_interval(Duration::from_millis(10));
        manager.register_worker(worker).unwrap();

        for type_id in 0..9 {
            dispatcher
                .dispatch(
                    "prices",
                    "refresh",
                    &serde_json::json!({ "type_id": type_id }),
                    DispatchOptions::default(),
                )
                .await
                .unwrap();
        }

        manager.start().unwrap();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while store.queue_counts("prices").await.unwrap().completed < 9
            && tokio::time::Instant::now() < deadline
        {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        manager.stop(Duration::from_secs(1)).await.unwrap();

        assert_eq!(store.queue_counts("prices").await.unwrap().completed, 9);
        assert_eq!(handled.load(Ordering::SeqCst), 9);
    }
}
