//! PostgreSQL store for the tq job processor.
//!
//! Many processes may share one table. The claim CAS is a single
//! `UPDATE ... WHERE status = 'pending' RETURNING ...`, which Postgres applies
//! atomically per row under its default isolation level.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use tq_postgres::PostgresStore;
//! use tq_core::Dispatcher;
//!
//! #[tokio::main]
//! async fn main() -> tq_core::Result<()> {
//!     let store = PostgresStore::new("postgres://localhost/mydb", "myapp").await?;
//!     let dispatcher = Dispatcher::new(store);
//!     Ok(())
//! }
//! ```

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::str::FromStr;
use tq_core::{JobId, JobRecord, JobStatus, NewJob, QueueCounts, Result, Store, TqError};

const COLUMNS: &str = "id, queue, job_type, payload, status, available_at, reserved_at, \
                       processed_at, created_at, attempts, max_attempts, priority, error";

/// serialization_failure, deadlock_detected, lock_not_available
const TRANSIENT_CODES: [&str; 3] = ["40001", "40P01", "55P03"];

/// PostgreSQL store for job records.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
    namespace: String,
}

impl PostgresStore {
    /// Create a new PostgreSQL store.
    pub async fn new(database_url: &str, namespace: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .map_err(|e| TqError::Backend(format!("Failed to connect to PostgreSQL: {}", e)))?;

        Self::with_pool(pool, namespace).await
    }

    /// Use an existing pool, creating the jobs table if needed.
    pub async fn with_pool(pool: PgPool, namespace: &str) -> Result<Self> {
        if namespace.is_empty()
            || !namespace
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return Err(TqError::Config(format!("Invalid namespace: {:?}", namespace)));
        }

        let store = Self {
            pool,
            namespace: namespace.to_string(),
        };
        store.init_tables().await?;

        tracing::debug!(namespace = %namespace, "PostgreSQL store ready");
        Ok(store)
    }

    /// Initialize the required tables.
    async fn init_tables(&self) -> Result<()> {
        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {} (
                id BIGSERIAL PRIMARY KEY,
                queue TEXT NOT NULL,
                job_type TEXT NOT NULL,
                payload TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                available_at BIGINT NOT NULL,
                reserved_at BIGINT,
                processed_at BIGINT,
                created_at BIGINT NOT NULL,
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

        sqlx::query(&format!(
            "CREATE INDEX IF NOT EXISTS idx_{}_jobs_claim ON {} (queue, status, priority, available_at)",
            self.namespace,
            self.jobs_table()
        ))
        .execute(&self.pool)
        .await
        .ok(); // Concurrent creators may race on the index

        Ok(())
    }

    fn jobs_table(&self) -> String {
        format!("{}_jobs", self.namespace)
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn map_err(context: &str, e: sqlx::Error) -> TqError {
    if let sqlx::Error::Database(db) = &e {
        if let Some(code) = db.code() {
            if TRANSIENT_CODES.iter().any(|transient| code == *transient) {
                return TqError::Contention(format!("{}: {}", context, e));
            }
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
    attempts: i32,
    max_attempts: i32,
    priority: i32,
    error: Option<String>,
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
            attempts: row.attempts.max(0) as u32,
            max_attempts: row.max_attempts.max(0) as u32,
            priority: row.priority,
            error: row.error,
        })
    }
}

#[async_trait]
impl Store for PostgresStore {
    async fn insert_job(&self, job: NewJob) -> Result<JobId> {
        let max_attempts = i32::try_from(job.max_attempts).map_err(|_| {
            TqError::Config(format!("max_attempts out of range: {}", job.max_attempts))
        })?;

        let row: (i64,) = sqlx::query_as(&format!(
            "INSERT INTO {} (queue, job_type, payload, status, available_at, created_at, attempts, max_attempts, priority) \
             VALUES ($1, $2, $3, 'pending', $4, $5, 0, $6, $7) RETURNING id",
            self.jobs_table()
        ))
        .bind(&job.queue)
        .bind(&job.job_type)
        .bind(&job.payload)
        .bind(job.available_at)
        .bind(job.created_at)
        .bind(max_attempts)
        .bind(job.priority)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| map_err("Failed to insert job", e))?;

        Ok(JobId(row.0))
    }

    async fn get_job(&self, id: JobId) -> Result<Option<JobRecord>> {
        let row: Option<JobRow> = sqlx::query_as(&format!(
            "SELECT {} FROM {} WHERE id = $1",
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
             WHERE queue = $1 AND status = 'pending' AND available_at <= $2 AND attempts < max_attempts \
             ORDER BY priority ASC, id DESC LIMIT $3",
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
            "UPDATE {} SET status = 'processing', reserved_at = $1, attempts = attempts + 1 \
             WHERE id = $2 AND status = 'pending' RETURNING {}",
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

        let ids: Vec<i64> = ids.iter().map(|id| id.0).collect();
        let rows: Vec<JobRow> = sqlx::query_as(&format!(
            "UPDATE {} SET status = 'processing', reserved_at = $1, attempts = attempts + 1 \
             WHERE id = ANY($2) AND status = 'pending' RETURNING {}",
            self.jobs_table(),
            COLUMNS
        ))
        .bind(now)
        .bind(&ids)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_err("Failed to reserve jobs", e))?;

        rows.into_iter().map(JobRecord::try_from).collect()
    }

    async fn complete_job(&self, id: JobId, now: i64) -> Result<bool> {
        let result = sqlx::query(&format!(
            "UPDATE {} SET status = 'completed', processed_at = $1 WHERE id = $2 AND status = 'processing'",
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
            "UPDATE {} SET status = 'pending', available_at = $1, error = $2 WHERE id = $3 AND status = 'processing'",
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
            "UPDATE {} SET status = 'failed', processed_at = $1, error = $2 WHERE id = $3 AND status = 'processing'",
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
            "SELECT status, COUNT(*) FROM {} WHERE queue = $1 GROUP BY status",
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
            "SELECT {} FROM {} WHERE queue = $1 AND status = 'failed' ORDER BY id DESC LIMIT $2",
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

// ========== Integration Tests (require PostgreSQL) ==========
