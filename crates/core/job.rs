//! Job record and related types.

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Result, TqError};

/// Default ceiling on claim attempts.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Store-assigned, monotonically increasing job identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct JobId(pub i64);

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Waiting to be claimed (fresh or scheduled for retry).
    Pending,
    /// Claimed by a worker and executing.
    Processing,
    /// Handler finished successfully. Terminal.
    Completed,
    /// Attempts exhausted. Terminal.
    Failed,
}

impl JobStatus {
    /// Name used in the persisted schema.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    /// Whether no further transition is possible.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = TqError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "processing" => Ok(JobStatus::Processing),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(TqError::Backend(format!("Unknown job status: {}", other))),
        }
    }
}

/// A persisted unit of work and its execution state.
///
/// Timestamps are Unix epoch milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub queue: String,
    pub job_type: String,
    /// Serialized payload, opaque to the engine.
    pub payload: String,
    pub status: JobStatus,
    pub available_at: i64,
    pub reserved_at: Option<i64>,
    pub processed_at: Option<i64>,
    pub created_at: i64,
    pub attempts: u32,
    pub max_attempts: u32,
    /// Lower values are more urgent.
    pub priority: i32,
    /// Last failure message.
    pub error: Option<String>,
}

impl JobRecord {
    /// Whether a claim at `now` may pick this row.
    pub fn is_claimable(&self, now: i64) -> bool {
        self.status == JobStatus::Pending
            && self.available_at <= now
            && self.attempts < self.max_attempts
    }

    /// Whether another failure would still leave attempts for a retry.
    pub fn can_retry(&self) -> bool {
        self.attempts < self.max_attempts
    }
}

/// A job about to be inserted; the store assigns the id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewJob {
    pub queue: String,
    pub job_type: String,
    pub payload: String,
    pub priority: i32,
    pub max_attempts: u32,
    pub available_at: i64,
    pub created_at: i64,
}

impl NewJob {
    /// Build an insertable job from dispatch arguments, stamped at `now`.
    pub fn new(
        queue: impl Into<String>,
        job_type: impl Into<String>,
        payload: impl Into<String>,
        options: &DispatchOptions,
        now: i64,
    ) -> Result<Self> {
        options.validate()?;
        Ok(Self {
            queue: queue.into(),
            job_type: job_type.into(),
            payload: payload.into(),
            priority: options.priority,
            max_attempts: options.max_attempts,
            available_at: millis_after(now, options.delay),
            created_at: now,
        })
    }

    /// The pending record this job becomes once the store assigns `id`.
    pub fn into_record(self, id: JobId) -> JobRecord {
        JobRecord {
            id,
            queue: self.queue,
            job_type: self.job_type,
            payload: self.payload,
            status: JobStatus::Pending,
            available_at: self.available_at,
            reserved_at: None,
            processed_at: None,
            created_at: self.created_at,
            attempts: 0,
            max_attempts: self.max_attempts,
            priority: self.priority,
            error: None,
        }
    }
}

/// Options accepted by `Dispatcher::dispatch`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchOptions {
    /// Lower values are claimed first.
    pub priority: i32,
    /// How long before the job becomes eligible for claim.
    pub delay: Duration,
    /// Ceiling on claim attempts before permanent failure.
    pub max_attempts: u32,
}

impl Default for DispatchOptions {
    fn default() -> Self {
        Self {
            priority: 0,
            delay: Duration::ZERO,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

impl DispatchOptions {
    /// Set the priority.
    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Set the initial delay.
    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Set the attempt ceiling.
    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(TqError::Config(
                "max_attempts must be at least 1".to_string(),
            ));
        }
        if self.priority < 0 {
            return Err(TqError::Config(format!(
                "priority must be non-negative, got {}",
                self.priority
            )));
        }
        Ok(())
    }
}

/// Per-queue job counts by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounts {
    pub pending: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
}

/// Backoff before a failed job becomes eligible again: `attempts²` seconds.
pub fn retry_delay(attempts: u32) -> Duration {
    let secs = u64::from(attempts).saturating_mul(u64::from(attempts));
    Duration::from_secs(secs)
}

/// `now` plus `delay` in epoch milliseconds, saturating at `i64::MAX`.
pub fn millis_after(now: i64, delay: Duration) -> i64 {
    i64::try_from(delay.as_millis())
        .ok()
        .and_then(|delay| now.checked_add(delay))
        .unwrap_or(i64::MAX)
}

/// Get current Unix timestamp in milliseconds.
pub fn current_timestamp_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}
