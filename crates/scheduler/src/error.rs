use thiserror::Error;

use jobforge_core::{EngineError, ExecutionId};

use crate::calendar::CalendarError;
use crate::expression::ExpressionError;
use crate::handler::HandlerError;
use crate::jobs::recurrence::RecurrenceError;
use crate::store::JobStoreError;

/// Errors surfaced by the job manager and executor.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JobError {
    #[error("timer has no due date")]
    MissingDueDate,

    #[error("no handler registered for '{0}'")]
    HandlerNotFound(String),

    #[error("execution not found: {0}")]
    ExecutionNotFound(ExecutionId),

    /// The end-date expression produced something that isn't a date.
    #[error("end date expression yielded a {0} value")]
    InvalidEndDateType(&'static str),

    #[error("invalid timer configuration: {0}")]
    TimerConfiguration(String),

    #[error(transparent)]
    Store(#[from] JobStoreError),

    #[error(transparent)]
    Calendar(#[from] CalendarError),

    #[error(transparent)]
    Recurrence(#[from] RecurrenceError),

    #[error(transparent)]
    Expression(#[from] ExpressionError),

    #[error("handler failed: {0}")]
    Handler(#[from] HandlerError),

    #[error(transparent)]
    Engine(#[from] EngineError),
}

impl JobError {
    /// The caller broke a contract; nothing was mutated.
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            JobError::MissingDueDate | JobError::Engine(EngineError::IllegalArgument(_))
        )
    }

    /// The process model (or the timer's stored configuration) is broken.
    /// Retrying won't help.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            JobError::HandlerNotFound(_)
                | JobError::InvalidEndDateType(_)
                | JobError::TimerConfiguration(_)
                | JobError::Calendar(_)
                | JobError::Recurrence(_)
                | JobError::Expression(_)
                | JobError::Engine(EngineError::Configuration(_))
        )
    }

    /// Lost a race with another worker or transaction; the work itself is fine.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            JobError::Store(JobStoreError::Conflict(_)) | JobError::Engine(EngineError::Conflict(_))
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification() {
        assert!(JobError::MissingDueDate.is_precondition());
        assert!(!JobError::MissingDueDate.is_transient());

        assert!(JobError::from(CalendarError::InvalidDate("x".into())).is_configuration());
        assert!(JobError::InvalidEndDateType("json").is_configuration());

        assert!(JobError::from(JobStoreError::Conflict("stale".into())).is_transient());
        assert!(!JobError::from(JobStoreError::Storage("io".into())).is_transient());

        let handler = JobError::from(HandlerError::new("boom"));
        assert!(!handler.is_precondition() && !handler.is_configuration() && !handler.is_transient());
        assert_eq!(handler.to_string(), "handler failed: boom");
    }
}
