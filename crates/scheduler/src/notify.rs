//! Post-commit executor wake-ups.
//!
//! Hints are never sent directly: they are registered on the caller's
//! [`UnitOfWork`] and delivered only after it commits, so a worker never
//! chases work that was rolled back.

use std::fmt;
use std::sync::Arc;

use tracing::{debug, warn};

use jobforge_events::EventBus;

use crate::jobs::types::Job;
use crate::unit_of_work::UnitOfWork;

/// What an executor is told after a commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutorHint {
    /// Reactive hint: the committed job itself, so the worker can claim it
    /// without re-reading the store.
    JobAdded(Job),
    /// Poll hint: something became due, cut the current wait short.
    Wake,
}

/// Delivery end of the hint transport.
pub trait HintSink: Send + Sync {
    fn deliver(&self, hint: ExecutorHint);
}

impl<B> HintSink for B
where
    B: EventBus<ExecutorHint>,
{
    fn deliver(&self, hint: ExecutorHint) {
        if let Err(err) = self.publish(hint) {
            warn!(error = ?err, "dropped executor hint");
        }
    }
}

/// Registers hints on units of work.
#[derive(Clone)]
pub struct Notifier {
    sink: Option<Arc<dyn HintSink>>,
}

impl Notifier {
    pub fn new(sink: Arc<dyn HintSink>) -> Self {
        Self { sink: Some(sink) }
    }

    /// A notifier with no executor listening.
    pub fn disconnected() -> Self {
        Self { sink: None }
    }

    pub fn is_connected(&self) -> bool {
        self.sink.is_some()
    }

    pub fn hint_reactive(&self, uow: &mut UnitOfWork, job: &Job) {
        let Some(sink) = self.sink.clone() else {
            return;
        };
        let job = job.clone();
        uow.on_commit(move || {
            debug!(job_id = %job.id, "hinting reactive executor");
            sink.deliver(ExecutorHint::JobAdded(job));
        });
    }

    pub fn hint_poll(&self, uow: &mut UnitOfWork) {
        let Some(sink) = self.sink.clone() else {
            return;
        };
        uow.on_commit(move || sink.deliver(ExecutorHint::Wake));
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::disconnected()
    }
}

impl fmt::Debug for Notifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Notifier")
            .field("connected", &self.is_connected())
            .finish()
    }
}
