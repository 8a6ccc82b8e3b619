//! `jobforge-scheduler` — durable timers, async continuations and messages.
//!
//! [`JobManager`] owns the job lifecycle, [`JobStore`] is the storage
//! boundary and [`AsyncJobExecutor`] is the competing worker that claims and
//! runs due work.

pub mod calendar;
pub mod config;
pub mod error;
pub mod execution;
pub mod executor;
pub mod expression;
pub mod handler;
pub mod jobs;
pub mod manager;
pub mod notify;
pub mod process;
pub mod store;
pub mod unit_of_work;

#[cfg(test)]
mod integration_tests;

pub use calendar::{BusinessCalendar, CalendarError, CycleBusinessCalendar, CycleRule, IsoDuration};
pub use config::{BackoffStrategy, ExecutorMode, JobExecutorConfig, RetryPolicy};
pub use error::JobError;
pub use execution::{Execution, ExecutionRepository, InMemoryExecutionRepository, VariableScope, VariableValue};
pub use executor::{AsyncJobExecutor, ExecutorStats, JobExecutorHandle};
pub use expression::{ExpressionError, ExpressionEvaluator, VariableExpressionEvaluator};
pub use handler::{HandlerError, HandlerRegistry, JobContext, JobHandler};
pub use jobs::{ExceptionPayload, Iterations, Job, JobKind, Lease, Recurrence, TimerSpec};
pub use manager::{ExecutionOutcome, JobManager, TimerConfiguration};
pub use notify::{ExecutorHint, HintSink, Notifier};
pub use process::{InMemoryProcessDefinitionRepository, ProcessDefinition, ProcessDefinitionRepository};
pub use store::{DueFilter, InMemoryJobStore, JobQuery, JobStore, JobStoreError, Page, StoreOp};
pub use unit_of_work::UnitOfWork;
