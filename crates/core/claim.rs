//! Atomic claiming of pending jobs.
//!
//! A claim is two steps: a read-only select of candidate ids, then a
//! compare-and-swap update keyed on `status = pending`. If the swap loses (a
//! concurrent claimer got there first, or the store reported a lock conflict)
//! the claim yields nothing and the next poll tick tries again. There is no
//! retry loop here.

use crate::error::Result;
use crate::job::JobRecord;
use crate::store::Store;

/// Claim the most urgent eligible job of `queue`.
///
/// Returns `Ok(None)` when no job is eligible, when the swap lost a race, or
/// when the store reported a transient lock condition.
pub async fn claim_job<S: Store + ?Sized>(
    store: &S,
    queue: &str,
    now: i64,
) -> Result<Option<JobRecord>> {
    let candidate = match store.find_candidates(queue, now, 1).await {
        Ok(ids) => ids.into_iter().next(),
        Err(e) if e.is_transient() => {
            tracing::debug!(queue = %queue, error = %e, "Candidate select contended");
            return Ok(None);
        }
        Err(e) => return Err(e),
    };

    let Some(id) = candidate else {
        return Ok(None);
    };

    match store.reserve_job(id, now).await {
        Ok(Some(job)) => {
            tracing::debug!(
                queue = %queue,
                job_id = %job.id,
                attempts = job.attempts,
                "Job claimed"
            );
            Ok(Some(job))
        }
        Ok(None) => {
            tracing::trace!(queue = %queue, job_id = %id, "Claim lost to another poller");
            Ok(None)
        }
        Err(e) if e.is_transient() => {
            tracing::debug!(queue = %queue, job_id = %id, error = %e, "Claim contended");
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

/// Claim up to `limit` eligible jobs of `queue` with one conditional update.
///
/// The result holds exactly the rows this call moved to `processing`; races
/// may shrink it below `limit`.
pub async fn claim_jobs_batch<S: Store + ?Sized>(
    store: &S,
    queue: &str,
    limit: usize,
    now: i64,
) -> Result<Vec<JobRecord>> {
    if limit == 0 {
        return Ok(Vec::new());
    }

    let ids = match store.find_candidates(queue, now, limit).await {
        Ok(ids) => ids,
        Err(e) if e.is_transient() => {
            tracing::debug!(queue = %queue, error = %e, "Candidate select contended");
            return Ok(Vec::new());
        }
        Err(e) => return Err(e),
    };

    if ids.is_empty() {
        return Ok(Vec::new());
    }

    match store.reserve_jobs(&ids, now).await {
        Ok(jobs) => {
            if jobs.len() < ids.len() {
                tracing::trace!(
                    queue = %queue,
                    wanted = ids.len(),
                    claimed = jobs.len(),
                    "Batch claim partially lost"
                );
            }
            tracing::debug!(queue = %queue, count = jobs.len(), "Jobs claimed");
            Ok(jobs)
        }
        Err(e) if e.is_transient() => {
            tracing::debug!(queue = %queue, error = %e, "Batch claim contended");
            Ok(Vec::new())
        }
        Err(e) => Err(e),
    }
}
