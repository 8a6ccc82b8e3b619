//! Explicit transaction boundary for scheduler mutations.
//!
//! Everything the scheduler writes during one engine operation is buffered in
//! a [`UnitOfWork`] and applied to the [`JobStore`] as one atomic batch.
//! Post-commit callbacks (executor hints) run only after that batch lands;
//! rollback callbacks (undoing in-memory execution links) run when it doesn't.

use std::fmt;

use jobforge_core::JobId;

use crate::jobs::types::Job;
use crate::store::{JobStore, JobStoreError, StoreOp};

type Callback = Box<dyn FnOnce() + Send>;

/// Buffered mutations plus commit/rollback listeners.
#[derive(Default)]
pub struct UnitOfWork {
    ops: Vec<StoreOp>,
    on_commit: Vec<Callback>,
    on_rollback: Vec<Callback>,
}

impl UnitOfWork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, job: Job) {
        self.ops.push(StoreOp::Insert(job));
    }

    /// Replace a stored job. Checked against `job.revision` at commit.
    pub fn update(&mut self, job: Job) {
        self.ops.push(StoreOp::Update(job));
    }

    pub fn delete(&mut self, id: JobId, revision: u32) {
        self.ops.push(StoreOp::Delete { id, revision });
    }

    /// Register a callback that fires once, only after a successful commit.
    pub fn on_commit(&mut self, callback: impl FnOnce() + Send + 'static) {
        self.on_commit.push(Box::new(callback));
    }

    /// Register a callback that fires once if the unit of work is abandoned.
    pub fn on_rollback(&mut self, callback: impl FnOnce() + Send + 'static) {
        self.on_rollback.push(Box::new(callback));
    }

    pub fn ops(&self) -> &[StoreOp] {
        &self.ops
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// The job as this unit of work will leave it, if it inserts or updates it.
    pub fn pending(&self, id: JobId) -> Option<&Job> {
        self.ops.iter().rev().find_map(|op| match op {
            StoreOp::Insert(job) | StoreOp::Update(job) if job.id == id => Some(job),
            _ => None,
        })
    }

    /// Apply the batch. Commit listeners fire in registration order on
    /// success; on failure the rollback listeners fire instead.
    pub fn commit(self, store: &dyn JobStore) -> Result<(), JobStoreError> {
        let UnitOfWork {
            ops,
            on_commit,
            on_rollback,
        } = self;

        match store.apply(ops) {
            Ok(()) => {
                for callback in on_commit {
                    callback();
                }
                Ok(())
            }
            Err(err) => {
                tracing::debug!(error = %err, "unit of work failed to commit");
                for callback in on_rollback.into_iter().rev() {
                    callback();
                }
                Err(err)
            }
        }
    }

    /// Discard buffered mutations. Commit listeners never fire.
    pub fn rollback(self) {
        for callback in self.on_rollback.into_iter().rev() {
            callback();
        }
    }
}

impl fmt::Debug for UnitOfWork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnitOfWork")
            .field("ops", &self.ops)
            .field("on_commit", &self.on_commit.len())
            .field("on_rollback", &self.on_rollback.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryJobStore;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn commit_applies_batch_then_fires_listeners() {
        let store = InMemoryJobStore::new();
        let fired = Arc::new(AtomicUsize::new(0));

        let mut uow = UnitOfWork::new();
        let job = Job::message("notify");
        uow.insert(job.clone());
        let f = fired.clone();
        uow.on_commit(move || {
            f.fetch_add(1, Ordering::SeqCst);
        });

        uow.commit(&store).unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(store.find_by_id(job.id).unwrap().is_some());
    }

    #[test]
    fn rolled_back_work_never_delivers_commit_listeners() {
        let store = InMemoryJobStore::new();
        let committed = Arc::new(AtomicUsize::new(0));
        let rolled_back = Arc::new(AtomicUsize::new(0));

        let mut uow = UnitOfWork::new();
        uow.insert(Job::message("notify"));
        let c = committed.clone();
        uow.on_commit(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        let r = rolled_back.clone();
        uow.on_rollback(move || {
            r.fetch_add(1, Ordering::SeqCst);
        });

        uow.rollback();
        assert_eq!(committed.load(Ordering::SeqCst), 0);
        assert_eq!(rolled_back.load(Ordering::SeqCst), 1);
        assert!(store.is_empty());
    }

    #[test]
    fn failed_commit_runs_rollback_listeners() {
        let store = InMemoryJobStore::new();
        let committed = Arc::new(AtomicUsize::new(0));
        let rolled_back = Arc::new(AtomicUsize::new(0));

        let mut uow = UnitOfWork::new();
        uow.delete(JobId::new(), 1);
        let c = committed.clone();
        uow.on_commit(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        let r = rolled_back.clone();
        uow.on_rollback(move || {
            r.fetch_add(1, Ordering::SeqCst);
        });

        assert!(uow.commit(&store).is_err());
        assert_eq!(committed.load(Ordering::SeqCst), 0);
        assert_eq!(rolled_back.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn pending_sees_latest_buffered_state() {
        let mut uow = UnitOfWork::new();
        let job = Job::message("notify");
        uow.insert(job.clone());
        let mut changed = job.clone();
        changed.retries = 1;
        uow.update(changed);

        assert_eq!(uow.pending(job.id).unwrap().retries, 1);
        assert!(uow.pending(JobId::new()).is_none());
    }
}
