//! Handler registry: handler type → code that actually does the work.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::execution::Execution;
use crate::jobs::types::Job;
use crate::unit_of_work::UnitOfWork;

/// Failure reported by a handler. Always handed back to the worker's retry
/// policy, never absorbed by the scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct HandlerError {
    pub message: String,
    pub details: Option<String>,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

/// What a handler gets besides the job itself.
pub struct JobContext<'a> {
    pub now: DateTime<Utc>,
    /// Activity id restored from a timer's configuration.
    pub activity_id: Option<&'a str>,
    /// The unit of work the job runs in; writes land with the job's deletion.
    pub uow: &'a mut UnitOfWork,
}

pub trait JobHandler: Send + Sync {
    fn execute(
        &self,
        job: &Job,
        configuration: Option<&str>,
        execution: Option<&Execution>,
        ctx: &mut JobContext<'_>,
    ) -> Result<(), HandlerError>;
}

impl<F> JobHandler for F
where
    F: Fn(&Job, Option<&str>, Option<&Execution>, &mut JobContext<'_>) -> Result<(), HandlerError> + Send + Sync,
{
    fn execute(
        &self,
        job: &Job,
        configuration: Option<&str>,
        execution: Option<&Execution>,
        ctx: &mut JobContext<'_>,
    ) -> Result<(), HandlerError> {
        self(job, configuration, execution, ctx)
    }
}

/// Lookup is by exact handler type, then the `*` fallback.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<H>(&mut self, handler_type: impl Into<String>, handler: H)
    where
        H: JobHandler + 'static,
    {
        self.handlers.insert(handler_type.into(), Arc::new(handler));
    }

    pub fn with<H>(mut self, handler_type: impl Into<String>, handler: H) -> Self
    where
        H: JobHandler + 'static,
    {
        self.register(handler_type, handler);
        self
    }

    pub fn get(&self, handler_type: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers
            .get(handler_type)
            .or_else(|| self.handlers.get("*"))
            .cloned()
    }

    pub fn contains(&self, handler_type: &str) -> bool {
        self.get(handler_type).is_some()
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut types: Vec<&String> = self.handlers.keys().collect();
        types.sort();
        f.debug_struct("HandlerRegistry").field("handler_types", &types).finish()
    }
}
