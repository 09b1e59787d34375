//! In-process store.
//!
//! Keeps job records in a map behind an async lock. Useful for tests and for
//! single-process deployments that do not need durability.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::error::Result;
use crate::job::{JobId, JobRecord, JobStatus, NewJob, QueueCounts};
use crate::store::Store;

#[derive(Default)]
struct Table {
    next_id: i64,
    rows: BTreeMap<JobId, JobRecord>,
}

/// Store backed by process memory.
#[derive(Clone, Default)]
pub struct MemoryStore {
    table: Arc<RwLock<Table>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of rows in every status.
    pub async fn len(&self) -> usize {
        self.table.read().await.rows.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    fn transition(
        table: &mut Table,
        id: JobId,
        from: JobStatus,
        apply: impl FnOnce(&mut JobRecord),
    ) -> bool {
        match table.rows.get_mut(&id) {
            Some(row) if row.status == from => {
                apply(row);
                true
            }
            _ => false,
        }
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn insert_job(&self, job: NewJob) -> Result<JobId> {
        let mut table = self.table.write().await;
        table.next_id += 1;
        let id = JobId(table.next_id);
        table.rows.insert(id, job.into_record(id));
        Ok(id)
    }

    async fn get_job(&self, id: JobId) -> Result<Option<JobRecord>> {
        Ok(self.table.read().await.rows.get(&id).cloned())
    }

    async fn find_candidates(&self, queue: &str, now: i64, limit: usize) -> Result<Vec<JobId>> {
        let table = self.table.read().await;
        let mut candidates: Vec<&JobRecord> = table
            .rows
            .values()
            .filter(|row| row.queue == queue && row.is_claimable(now))
            .collect();

        candidates.sort_by(|a, b| a.priority.cmp(&b.priority).then(b.id.cmp(&a.id)));

        Ok(candidates.into_iter().take(limit).map(|row| row.id).collect())
    }

    async fn reserve_job(&self, id: JobId, now: i64) -> Result<Option<JobRecord>> {
        let mut table = self.table.write().await;
        let reserved = Self::transition(&mut table, id, JobStatus::Pending, |row| {
            row.status = JobStatus::Processing;
            row.reserved_at = Some(now);
            row.attempts += 1;
        });

        Ok(reserved.then(|| table.rows[&id].clone()))
    }

    async fn reserve_jobs(&self, ids: &[JobId], now: i64) -> Result<Vec<JobRecord>> {
        let mut table = self.table.write().await;
        let mut claimed = Vec::with_capacity(ids.len());

        for &id in ids {
            let reserved = Self::transition(&mut table, id, JobStatus::Pending, |row| {
                row.status = JobStatus::Processing;
                row.reserved_at = Some(now);
                row.attempts += 1;
            });
            if reserved {
                claimed.push(table.rows[&id].clone());
            }
        }

        Ok(claimed)
    }

    async fn complete_job(&self, id: JobId, now: i64) -> Result<bool> {
        let mut table = self.table.write().await;
        Ok(Self::transition(&mut table, id, JobStatus::Processing, |row| {
            row.status = JobStatus::Completed;
            row.processed_at = Some(now);
        }))
    }

    async fn retry_job(&self, id: JobId, available_at: i64, error: &str) -> Result<bool> {
        let mut table = self.table.write().await;
        Ok(Self::transition(&mut table, id, JobStatus::Processing, |row| {
            row.status = JobStatus::Pending;
            row.available_at = available_at;
            row.error = Some(error.to_string());
        }))
    }

    async fn fail_job(&self, id: JobId, now: i64, error: &str) -> Result<bool> {
        let mut table = self.table.write().await;
        Ok(Self::transition(&mut table, id, JobStatus::Processing, |row| {
            row.status = JobStatus::Failed;
            row.processed_at = Some(now);
            row.error = Some(error.to_string());
        }))
    }

    async fn queue_counts(&self, queue: &str) -> Result<QueueCounts> {
        let table = self.table.read().await;
        let mut counts = QueueCounts::default();
        for row in table.rows.values().filter(|row| row.queue == queue) {
            match row.status {
                JobStatus::Pending => counts.pending += 1,
                JobStatus::Processing => counts.processing += 1,
                JobStatus::Completed => counts.completed += 1,
                JobStatus::Failed => counts.failed += 1,
            }
        }
        Ok(counts)
    }

    async fn list_failed(&self, queue: &str, limit: usize) -> Result<Vec<JobRecord>> {
        let table = self.table.read().await;
        Ok(table
            .rows
            .values()
            .rev()
            .filter(|row| row.queue == queue && row.status == JobStatus::Failed)
            .take(limit)
            .cloned()
            .collect())
    }
}
