//! # tq-core - Core types and engine for the tq job processor
//!
//! Jobs are rows in a relational table. Producers insert them through a
//! [`Dispatcher`]; a [`QueueManager`] polls each registered queue, claims due
//! jobs with a two-phase compare-and-swap, runs them through the queue's
//! [`Worker`] and records the outcome with quadratic retry backoff.
//!
//! This crate provides:
//! - `Store` trait for storage implementations, plus an in-memory `MemoryStore`
//! - `JobRecord`, `JobId`, `JobStatus`, `DispatchOptions` types
//! - `Dispatcher` for enqueueing jobs
//! - `QueueManager` and the `Worker` contract for processing them
//! - Error types
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use serde::Deserialize;
//! use tq_core::{
//!     DispatchOptions, Dispatcher, HandlerWorker, JobRecord, JobResult, MemoryStore, QueueManager,
//! };
//!
//! #[derive(Deserialize)]
//! struct FetchCharacter {
//!     character_id: u64,
//! }
//!
//! #[tokio::main]
//! async fn main() -> tq_core::Result<()> {
//!     let store = MemoryStore::new();
//!
//!     let manager = QueueManager::new(store.clone());
//!     manager.register_worker(
//!         HandlerWorker::new("esi", |job: FetchCharacter, _record: JobRecord| async move {
//!             println!("Fetching character {}", job.character_id);
//!             JobResult::Ok(())
//!         })
//!         .with_concurrency(4)
//!         .with_poll_interval(Duration::from_millis(500)),
//!     )?;
//!
//!     let dispatcher = Dispatcher::new(store);
//!     let payload = serde_json::json!({ "character_id": 90 });
//!     dispatcher
//!         .dispatch("esi", "character", &payload, DispatchOptions::default())
//!         .await?;
//!
//!     manager.run().await
//! }
//! ```

mod claim;
mod config;
mod dispatcher;
mod error;
mod job;
mod manager;
mod memory;
mod stats;
mod store;
mod worker;

// Re-export main types
pub use claim::{claim_job, claim_jobs_batch};
pub use config::{ManagerConfig, ManagerConfigBuilder};
pub use dispatcher::Dispatcher;
pub use error::{Result, TqError};
pub use job::{
    current_timestamp_millis, millis_after, retry_delay, DispatchOptions, JobId, JobRecord,
    JobStatus, NewJob, QueueCounts, DEFAULT_MAX_ATTEMPTS,
};
pub use manager::{ManagerStatus, QueueManager};
pub use memory::MemoryStore;
pub use stats::{Stats, StatsSnapshot};
pub use store::{DynStore, SharedStore, Store};
pub use worker::{HandlerWorker, JobError, JobResult, Worker};
