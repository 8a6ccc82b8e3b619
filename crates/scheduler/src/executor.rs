//! Competing-worker job executor.
//!
//! Each executor runs on its own thread and competes with every other
//! executor (in this process or elsewhere) through the store's claim
//! semantics. One loop iteration:
//!
//! 1. drain hints: a reactive hint claims the hinted job directly,
//! 2. claim a batch of due jobs,
//! 3. execute each in its own unit of work and commit,
//! 4. route failures to the manager's failure bookkeeping,
//! 5. with nothing to do, wait for a hint or the poll interval.

use std::sync::{Arc, Mutex, mpsc};
use std::thread;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, error, info, warn};

use jobforge_events::{JobEventKind, Subscription};

use crate::error::JobError;
use crate::jobs::types::Job;
use crate::manager::{ExecutionOutcome, JobManager};
use crate::notify::ExecutorHint;
use crate::unit_of_work::UnitOfWork;

/// Executor runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExecutorStats {
    pub jobs_processed: u64,
    pub jobs_succeeded: u64,
    pub jobs_failed: u64,
    /// Failures that used up the last retry.
    pub jobs_exhausted: u64,
    /// Async jobs requeued after losing a commit race.
    pub jobs_requeued: u64,
    pub hints_received: u64,
    pub uptime_secs: u64,
}

/// Handle to control a running executor.
#[derive(Debug)]
pub struct JobExecutorHandle {
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
    stats: Arc<Mutex<ExecutorStats>>,
}

impl JobExecutorHandle {
    /// Request graceful shutdown and wait for the loop to exit.
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }

    pub fn stats(&self) -> ExecutorStats {
        self.stats.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

pub struct AsyncJobExecutor {
    manager: Arc<JobManager>,
    hints: Option<Subscription<ExecutorHint>>,
    stats: Arc<Mutex<ExecutorStats>>,
}

impl AsyncJobExecutor {
    pub fn new(manager: Arc<JobManager>) -> Self {
        Self {
            manager,
            hints: None,
            stats: Arc::new(Mutex::new(ExecutorStats::default())),
        }
    }

    /// Listen for post-commit hints.
    pub fn with_hints(mut self, hints: Subscription<ExecutorHint>) -> Self {
        self.hints = Some(hints);
        self
    }

    pub fn name(&self) -> &str {
        &self.manager.config().name
    }

    pub fn stats(&self) -> ExecutorStats {
        self.stats.lock().map(|s| s.clone()).unwrap_or_default()
    }

    fn record(&self, f: impl FnOnce(&mut ExecutorStats)) {
        if let Ok(mut stats) = self.stats.lock() {
            f(&mut stats);
        }
    }

    /// Spawn the executor loop on a named background thread.
    pub fn spawn(self) -> std::io::Result<JobExecutorHandle> {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let stats = self.stats.clone();

        let join = thread::Builder::new()
            .name(self.name().to_string())
            .spawn(move || executor_loop(self, shutdown_rx))?;

        Ok(JobExecutorHandle {
            shutdown: shutdown_tx,
            join: Some(join),
            stats,
        })
    }

    /// One round: pending hints, then a batch of due jobs. Returns the number
    /// of jobs executed.
    pub fn tick(&self) -> Result<usize, JobError> {
        let mut executed = 0;
        if let Some(hints) = &self.hints {
            for hint in hints.drain() {
                executed += self.handle_hint(hint);
            }
        }

        let limit = self.manager.config().max_jobs_per_acquisition.max(1);
        let jobs = self.manager.acquire_due_jobs(limit)?;
        for job in jobs {
            debug!(executor = %self.name(), job_id = %job.id, handler_type = %job.handler_type, "claimed job");
            let _ = self.execute_job(&job);
            executed += 1;
        }
        Ok(executed)
    }

    fn handle_hint(&self, hint: ExecutorHint) -> usize {
        self.record(|s| s.hints_received += 1);
        match hint {
            ExecutorHint::JobAdded(job) => match self.manager.acquire_job(&job) {
                Ok(Some(claimed)) => {
                    let _ = self.execute_job(&claimed);
                    1
                }
                Ok(None) => {
                    debug!(executor = %self.name(), job_id = %job.id, "hinted job already taken");
                    0
                }
                Err(err) => {
                    error!(executor = %self.name(), job_id = %job.id, error = %err, "failed to claim hinted job");
                    0
                }
            },
            // The acquisition that follows picks the work up.
            ExecutorHint::Wake => 0,
        }
    }

    /// Execute a claimed job in its own unit of work. Failures are booked
    /// before they are returned.
    pub fn execute_job(&self, job: &Job) -> Result<ExecutionOutcome, JobError> {
        self.record(|s| s.jobs_processed += 1);

        let mut uow = UnitOfWork::new();
        let outcome = match self.manager.execute(&mut uow, job) {
            Ok(outcome) => outcome,
            Err(err) => {
                uow.rollback();
                self.handle_failure(job, &err);
                return Err(err);
            }
        };

        if let Err(err) = uow.commit(self.manager.store().as_ref()) {
            let err = JobError::from(err);
            if err.is_transient() {
                self.handle_lost_race(job, &err);
            } else {
                self.handle_failure(job, &err);
            }
            return Err(err);
        }

        self.record(|s| s.jobs_succeeded += 1);
        self.manager.emit(JobEventKind::JobExecutionSuccess, job, None);
        debug!(executor = %self.name(), job_id = %job.id, outcome = ?outcome, "job completed");
        Ok(outcome)
    }

    fn handle_lost_race(&self, job: &Job, err: &JobError) {
        if job.kind.is_timer() {
            // Another worker fired (or touched) this timer first.
            debug!(executor = %self.name(), job_id = %job.id, error = %err, "timer commit lost the race");
            return;
        }

        let mut uow = UnitOfWork::new();
        let requeued = self
            .manager
            .retry_async_job(&mut uow, job)
            .and_then(|requeued| Ok(uow.commit(self.manager.store().as_ref()).map(|()| requeued)?));
        match requeued {
            Ok(Some(_)) => self.record(|s| s.jobs_requeued += 1),
            Ok(None) => {}
            Err(retry_err) => {
                error!(executor = %self.name(), job_id = %job.id, error = %retry_err, "failed to requeue job");
            }
        }
    }

    fn handle_failure(&self, job: &Job, err: &JobError) {
        self.record(|s| s.jobs_failed += 1);
        self.manager
            .emit(JobEventKind::JobExecutionFailure, job, Some(err.to_string()));
        warn!(executor = %self.name(), job_id = %job.id, handler_type = %job.handler_type, error = %err, "job execution failed");

        let mut uow = UnitOfWork::new();
        let booked = self
            .manager
            .record_failure(&mut uow, job, err)
            .and_then(|updated| Ok(uow.commit(self.manager.store().as_ref()).map(|()| updated)?));
        match booked {
            Ok(updated) if updated.is_failed() => self.record(|s| s.jobs_exhausted += 1),
            Ok(_) => {}
            Err(book_err) => {
                error!(executor = %self.name(), job_id = %job.id, error = %book_err, "failed to record job failure");
            }
        }
    }

    fn wait(&self, shutdown_rx: &mpsc::Receiver<()>, poll_interval: Duration) -> bool {
        match &self.hints {
            Some(hints) => {
                if let Ok(hint) = hints.recv_timeout(poll_interval) {
                    self.handle_hint(hint);
                }
                shutdown_rx.try_recv().is_ok()
            }
            None => shutdown_rx.recv_timeout(poll_interval).is_ok(),
        }
    }
}

fn executor_loop(executor: AsyncJobExecutor, shutdown_rx: mpsc::Receiver<()>) {
    let config = executor.manager.config().clone();
    info!(executor = %config.name, mode = ?config.mode, "job executor started");
    let started = Instant::now();

    loop {
        if shutdown_rx.try_recv().is_ok() {
            break;
        }
        executor.record(|s| s.uptime_secs = started.elapsed().as_secs());

        let executed = match executor.tick() {
            Ok(n) => n,
            Err(err) => {
                error!(executor = %config.name, error = %err, "failed to acquire jobs");
                0
            }
        };

        if executed == 0 && executor.wait(&shutdown_rx, config.poll_interval) {
            break;
        }
    }

    info!(executor = %config.name, "job executor stopped");
}
