//! Queue manager: per-queue poll loops, execution, retry policy and shutdown.

use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinSet;

use crate::claim::{claim_job, claim_jobs_batch};
use crate::config::ManagerConfig;
use crate::error::{Result, TqError};
use crate::job::{
    current_timestamp_millis, millis_after, retry_delay, JobId, JobRecord, JobStatus,
};
use crate::stats::{Stats, StatsReporter, StatsSnapshot};
use crate::store::{SharedStore, Store};
use crate::worker::Worker;

/// Read-only snapshot for external monitoring.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ManagerStatus {
    pub running: bool,
    pub queues: Vec<String>,
    pub active_jobs: usize,
}

/// Per-queue sets of job ids currently executing.
#[derive(Default)]
struct InFlight {
    queues: Mutex<HashMap<String, HashSet<JobId>>>,
    notify: Notify,
}

impl InFlight {
    fn enter(self: &Arc<Self>, queue: &str, id: JobId) -> InFlightGuard {
        lock(&self.queues)
            .entry(queue.to_string())
            .or_default()
            .insert(id);
        InFlightGuard {
            in_flight: self.clone(),
            queue: queue.to_string(),
            id,
        }
    }

    fn count(&self, queue: &str) -> usize {
        lock(&self.queues).get(queue).map_or(0, HashSet::len)
    }

    fn ids(&self, queue: &str) -> Vec<JobId> {
        let mut ids: Vec<JobId> = lock(&self.queues)
            .get(queue)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default();
        ids.sort();
        ids
    }

    fn total(&self) -> usize {
        lock(&self.queues).values().map(HashSet::len).sum()
    }
}

/// Removes its job from the in-flight set when dropped, whatever way the
/// execution task ends.
struct InFlightGuard {
    in_flight: Arc<InFlight>,
    queue: String,
    id: JobId,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if let Some(set) = lock(&self.in_flight.queues).get_mut(&self.queue) {
            set.remove(&self.id);
        }
        self.in_flight.notify.notify_waiters();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Handles of the loops spawned by `start`.
struct RunningLoops {
    shutdown: watch::Sender<bool>,
    tasks: JoinSet<()>,
}

/// Owns the worker registry and drives one poll loop per registered queue.
///
/// Constructed once and shared by reference (or `Arc`) with whatever starts
/// and stops it.
pub struct QueueManager<S: Store + Clone + 'static = SharedStore> {
    store: S,
    config: ManagerConfig,
    workers: Mutex<BTreeMap<String, Arc<dyn Worker>>>,
    running: Arc<AtomicBool>,
    in_flight: Arc<InFlight>,
    stats: Arc<Stats>,
    loops: Mutex<Option<RunningLoops>>,
}

impl QueueManager<SharedStore> {
    /// Create a manager over a shared store with default configuration.
    pub fn new(store: impl Store + 'static) -> Self {
        Self::with_store(SharedStore::new(store))
    }
}

impl<S: Store + Clone + 'static> QueueManager<S> {
    /// Create a manager over a specific store with default configuration.
    pub fn with_store(store: S) -> Self {
        Self {
            store,
            config: ManagerConfig::default(),
            workers: Mutex::new(BTreeMap::new()),
            running: Arc::new(AtomicBool::new(false)),
            in_flight: Arc::new(InFlight::default()),
            stats: Arc::new(Stats::default()),
            loops: Mutex::new(None),
        }
    }

    /// Replace the configuration.
    pub fn with_config(mut self, config: ManagerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// Bind a worker to its queue and call its `on_register` hook.
    pub fn register_worker(&self, worker: impl Worker + 'static) -> Result<()> {
        self.register_shared(Arc::new(worker))
    }

    /// Like [`QueueManager::register_worker`] for an already shared worker.
    pub fn register_shared(&self, worker: Arc<dyn Worker>) -> Result<()> {
        let queue = worker.queue_name().to_string();

        if worker.concurrency() == 0 {
            return Err(TqError::Config(format!(
                "Worker for queue {} declares zero concurrency",
                queue
            )));
        }
        if worker.poll_interval().is_zero() {
            return Err(TqError::Config(format!(
                "Worker for queue {} declares a zero poll interval",
                queue
            )));
        }
        {
            // `start` flips `running` under this lock, so a worker registered
            // here is always part of its snapshot.
            let mut workers = lock(&self.workers);
            if self.running.load(Ordering::SeqCst) {
                return Err(TqError::Manager(
                    "Cannot register workers while running".to_string(),
                ));
            }
            if workers.contains_key(&queue) {
                return Err(TqError::WorkerAlreadyRegistered(queue));
            }
            workers.insert(queue.clone(), worker.clone());
        }

        worker.on_register();

        tracing::info!(
            queue = %queue,
            concurrency = worker.concurrency(),
            poll_interval_ms = worker.poll_interval().as_millis() as u64,
            "Worker registered"
        );
        Ok(())
    }

    /// Start one poll loop per registered queue plus the stats loop.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self) -> Result<()> {
        let mut loops = lock(&self.loops);
        if loops.is_some() {
            return Err(TqError::Manager("Queue manager already started".to_string()));
        }

        let workers: Vec<Arc<dyn Worker>> = {
            let registry = lock(&self.workers);
            self.running.store(true, Ordering::SeqCst);
            registry.values().cloned().collect()
        };
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut tasks = JoinSet::new();

        for worker in workers {
            let poller = QueuePoller {
                queue: worker.queue_name().to_string(),
                worker,
                store: self.store.clone(),
                in_flight: self.in_flight.clone(),
                stats: self.stats.clone(),
                batch_threshold: self.config.batch_threshold,
                shutdown: shutdown_rx.clone(),
            };
            tasks.spawn(poller.run());
        }

        let reporter = StatsReporter::new(
            self.stats.clone(),
            self.config.stats_interval,
            shutdown_rx,
        );
        tasks.spawn(reporter.run());

        *loops = Some(RunningLoops {
            shutdown: shutdown_tx,
            tasks,
        });

        tracing::info!(queues = ?self.queue_names(), "Queue manager started");
        Ok(())
    }

    /// Stop polling, wait up to `timeout` for in-flight jobs, then call every
    /// worker's `on_stop`.
    ///
    /// Jobs still running at the deadline are left alone; they finish (and
    /// record their outcome) after this returns.
    pub async fn stop(&self, timeout: Duration) -> Result<()> {
        let loops = lock(&self.loops).take();
        let Some(mut loops) = loops else {
            return Err(TqError::Manager("Queue manager is not running".to_string()));
        };

        let deadline = tokio::time::Instant::now() + timeout;
        self.running.store(false, Ordering::SeqCst);
        // Receivers may already be gone if every loop exited.
        let _ = loops.shutdown.send(true);

        tracing::info!(
            in_flight = self.in_flight.total(),
            "Stopping queue manager, draining..."
        );

        let joined = tokio::time::timeout_at(deadline, async {
            while let Some(result) = loops.tasks.join_next().await {
                if let Err(e) = result {
                    tracing::error!(error = %e, "Poll loop panicked");
                }
            }
        })
        .await;
        if joined.is_err() {
            // A loop mid-tick may hold claimed rows; let it launch them and exit.
            tracing::warn!("Poll loops still busy at shutdown deadline, detaching them");
            loops.tasks.detach_all();
        }

        loop {
            let active = self.in_flight.total();
            if active == 0 {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                tracing::warn!(
                    in_flight = active,
                    timeout_ms = timeout.as_millis() as u64,
                    "Shutdown timeout reached with jobs still in flight"
                );
                break;
            }

            tokio::select! {
                _ = self.in_flight.notify.notified() => {}
                _ = tokio::time::sleep(self.config.drain_poll_interval) => {}
            }
        }

        let workers: Vec<Arc<dyn Worker>> = lock(&self.workers).values().cloned().collect();
        for worker in workers {
            worker.on_stop().await;
        }

        tracing::info!("Queue manager stopped");
        Ok(())
    }

    /// Start, wait for `shutdown` to resolve, then stop with the configured
    /// shutdown timeout.
    pub async fn run_until<F>(&self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        self.start()?;
        shutdown.await;
        tracing::info!("Shutdown requested");
        self.stop(self.config.shutdown_timeout).await
    }

    /// Run until Ctrl+C.
    pub async fn run(&self) -> Result<()> {
        self.run_until(async {
            tokio::signal::ctrl_c().await.ok();
        })
        .await
    }

    pub fn status(&self) -> ManagerStatus {
        ManagerStatus {
            running: self.running.load(Ordering::SeqCst),
            queues: self.queue_names(),
            active_jobs: self.in_flight.total(),
        }
    }

    /// Names of registered queues, sorted.
    pub fn queue_names(&self) -> Vec<String> {
        lock(&self.workers).keys().cloned().collect()
    }

    /// Number of jobs of `queue` currently executing.
    pub fn active_count(&self, queue: &str) -> usize {
        self.in_flight.count(queue)
    }

    /// Ids of jobs of `queue` currently executing.
    pub fn in_flight(&self, queue: &str) -> Vec<JobId> {
        self.in_flight.ids(queue)
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

/// Poll loop of a single queue.
struct QueuePoller<S: Store + Clone + 'static> {
    queue: String,
    worker: Arc<dyn Worker>,
    store: S,
    in_flight: Arc<InFlight>,
    stats: Arc<Stats>,
    batch_threshold: usize,
    shutdown: watch::Receiver<bool>,
}

impl<S: Store + Clone + 'static> QueuePoller<S> {
    async fn run(mut self) {
        tracing::info!(
            queue = %self.queue,
            concurrency = self.worker.concurrency(),
            "Poll loop started"
        );

        let mut interval = tokio::time::interval(self.worker.poll_interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.changed() => break,
                _ = interval.tick() => {}
            }

            // A failed tick (store outage) is logged and retried next tick.
            if let Err(e) = self.tick().await {
                tracing::error!(queue = %self.queue, error = %e, "Poll tick failed");
            }
        }

        tracing::info!(queue = %self.queue, "Poll loop stopped");
    }

    /// Claim as many jobs as there are free slots and launch them.
    async fn tick(&self) -> Result<()> {
        let active = self.in_flight.count(&self.queue);
        let slots = self.worker.concurrency().saturating_sub(active);
        if slots == 0 {
            tracing::trace!(queue = %self.queue, active = active, "Queue saturated");
            return Ok(());
        }

        let now = current_timestamp_millis();

        if slots >= self.batch_threshold {
            for job in claim_jobs_batch(&self.store, &self.queue, slots, now).await? {
                self.launch(job);
            }
        } else {
            for _ in 0..slots {
                match claim_job(&self.store, &self.queue, now).await? {
                    Some(job) => self.launch(job),
                    None => break,
                }
            }
        }

        Ok(())
    }

    /// Mark the job in flight and execute it in a detached task.
    fn launch(&self, job: JobRecord) {
        let guard = self.in_flight.enter(&self.queue, job.id);
        let store = self.store.clone();
        let worker = self.worker.clone();
        let stats = self.stats.clone();

        tokio::spawn(async move {
            let _guard = guard;
            execute(store, worker, job, stats).await;
        });
    }
}

/// Run the handler for a claimed job and record its outcome.
async fn execute<S: Store>(
    store: S,
    worker: Arc<dyn Worker>,
    job: JobRecord,
    stats: Arc<Stats>,
) {
    let outcome = run_handler(worker, job.clone()).await;
    let now = current_timestamp_millis();

    if let Err(e) = record_outcome(&store, &job, outcome, &stats, now).await {
        tracing::error!(
            queue = %job.queue,
            job_id = %job.id,
            attempts = job.attempts,
            error = %e,
            "Failed to record job outcome"
        );
    }
}

/// Deserialize the payload and invoke the handler inside its own task, so a
/// panicking handler becomes an ordinary failure.
async fn run_handler(
    worker: Arc<dyn Worker>,
    job: JobRecord,
) -> std::result::Result<(), String> {
    let payload: serde_json::Value = match serde_json::from_str(&job.payload) {
        Ok(payload) => payload,
        Err(e) => return Err(format!("Invalid payload: {}", e)),
    };

    let handle = tokio::spawn(async move { worker.handle(payload, &job).await });

    match handle.await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(e.message),
        Err(e) if e.is_panic() => Err("handler panicked".to_string()),
        Err(e) => Err(format!("handler aborted: {}", e)),
    }
}

/// Apply the retry policy to a finished job.
///
/// Success completes the job. A failure with attempts left puts it back to
/// pending `attempts²` seconds from `now`; otherwise it fails permanently.
/// Returns the status the job was moved to.
pub(crate) async fn record_outcome<S: Store + ?Sized>(
    store: &S,
    job: &JobRecord,
    outcome: std::result::Result<(), String>,
    stats: &Stats,
    now: i64,
) -> Result<JobStatus> {
    let (status, applied) = match outcome {
        Ok(()) => {
            let applied = store.complete_job(job.id, now).await?;
            if applied {
                stats.record_completed();
                tracing::debug!(
                    queue = %job.queue,
                    job_id = %job.id,
                    attempts = job.attempts,
                    "Job completed"
                );
            }
            (JobStatus::Completed, applied)
        }
        Err(message) if job.can_retry() => {
            let delay = retry_delay(job.attempts);
            let available_at = millis_after(now, delay);
            let applied = store.retry_job(job.id, available_at, &message).await?;
            if applied {
                stats.record_retried();
                tracing::info!(
                    queue = %job.queue,
                    job_id = %job.id,
                    attempts = job.attempts,
                    max_attempts = job.max_attempts,
                    retry_in_secs = delay.as_secs(),
                    error = %message,
                    "Job failed, scheduled for retry"
                );
            }
            (JobStatus::Pending, applied)
        }
        Err(message) => {
            let applied = store.fail_job(job.id, now, &message).await?;
            if applied {
                stats.record_failed();
                tracing::warn!(
                    queue = %job.queue,
                    job_id = %job.id,
                    attempts = job.attempts,
                    error = %message,
                    "Job failed permanently"
                );
            }
            (JobStatus::Failed, applied)
        }
    };

    if !applied {
        tracing::warn!(
            queue = %job.queue,
            job_id = %job.id,
            status = %status,
            "Job was no longer processing, outcome not recorded"
        );
    }

    Ok(status)
}
