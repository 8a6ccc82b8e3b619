use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use jobforge_core::{ExecutionId, JobId, ProcessInstanceId, TenantId};

/// What happened to a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobEventKind {
    /// The job record was inserted.
    EntityCreated,
    /// The job record (and its exception payload) was deleted.
    EntityDeleted,
    /// A timer's handler ran successfully.
    TimerFired,
    /// A worker finished the job and committed.
    JobExecutionSuccess,
    /// A worker's attempt failed; the error is attached.
    JobExecutionFailure,
    /// A failed attempt consumed one retry.
    JobRetriesDecremented,
}

impl JobEventKind {
    /// Stable event name (e.g. `"job.entity_deleted"`).
    pub fn event_type(&self) -> &'static str {
        match self {
            JobEventKind::EntityCreated => "job.entity_created",
            JobEventKind::EntityDeleted => "job.entity_deleted",
            JobEventKind::TimerFired => "job.timer_fired",
            JobEventKind::JobExecutionSuccess => "job.execution_success",
            JobEventKind::JobExecutionFailure => "job.execution_failure",
            JobEventKind::JobRetriesDecremented => "job.retries_decremented",
        }
    }
}

/// Notification about a job, detached from the job record itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobEvent {
    pub kind: JobEventKind,
    pub job_id: JobId,
    pub handler_type: String,
    pub tenant_id: Option<TenantId>,
    pub execution_id: Option<ExecutionId>,
    pub process_instance_id: Option<ProcessInstanceId>,
    pub occurred_at: DateTime<Utc>,
    /// Failure message for `JobExecutionFailure`.
    pub error: Option<String>,
}

impl JobEvent {
    pub fn new(
        kind: JobEventKind,
        job_id: JobId,
        handler_type: impl Into<String>,
        occurred_at: DateTime<Utc>,
    ) -> Self {
        Self {
            kind,
            job_id,
            handler_type: handler_type.into(),
            tenant_id: None,
            execution_id: None,
            process_instance_id: None,
            occurred_at,
            error: None,
        }
    }

    pub fn with_scope(
        mut self,
        tenant_id: Option<TenantId>,
        execution_id: Option<ExecutionId>,
        process_instance_id: Option<ProcessInstanceId>,
    ) -> Self {
        self.tenant_id = tenant_id;
        self.execution_id = execution_id;
        self.process_instance_id = process_instance_id;
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}
