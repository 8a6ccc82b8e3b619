//! Core job types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use jobforge_core::{ExecutionId, JobId, ProcessDefinitionId, ProcessInstanceId, TenantId};

use super::recurrence::{Iterations, Recurrence};

/// Default number of attempts a job gets before it is left as failed.
pub const DEFAULT_RETRIES: u32 = 3;

/// Handler type for async continuations.
pub const ASYNC_CONTINUATION: &str = "async-continuation";
/// Handler type for timers on process start events.
pub const TIMER_START_EVENT: &str = "timer-start-event";
/// Handler type for timers attached to activities inside a running instance.
pub const TRIGGER_TIMER: &str = "trigger-timer";

/// A time-bounded claim on a job by one worker.
///
/// Owner and expiration only ever exist together, which is why they share a
/// struct instead of being two optional fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub owner: String,
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    pub fn new(owner: impl Into<String>, expires_at: DateTime<Utc>) -> Self {
        Self {
            owner: owner.into(),
            expires_at,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Details of the last failure, owned by the job it belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExceptionPayload {
    pub message: String,
    /// Full error chain / diagnostic dump.
    pub details: String,
    pub recorded_at: DateTime<Utc>,
}

impl ExceptionPayload {
    pub fn new(message: impl Into<String>, details: impl Into<String>, recorded_at: DateTime<Utc>) -> Self {
        Self {
            message: message.into(),
            details: details.into(),
            recorded_at,
        }
    }
}

/// Timer-only data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimerSpec {
    pub recurrence: Option<Recurrence>,
    pub end_date: Option<DateTime<Utc>>,
    pub max_iterations: Iterations,
}

impl TimerSpec {
    pub fn once() -> Self {
        Self {
            recurrence: None,
            end_date: None,
            max_iterations: Iterations::Bounded(1),
        }
    }

    pub fn recurring(recurrence: Recurrence) -> Self {
        Self {
            recurrence: Some(recurrence),
            end_date: None,
            max_iterations: Iterations::Bounded(1),
        }
    }

    pub fn with_end_date(mut self, end_date: DateTime<Utc>) -> Self {
        self.end_date = Some(end_date);
        self
    }
}

/// Job variants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobKind {
    /// Continue a process asynchronously after a transaction boundary.
    AsyncContinuation,
    /// A generic message job.
    Message,
    /// A time-driven job, possibly recurring.
    Timer(TimerSpec),
}

impl JobKind {
    pub fn name(&self) -> &'static str {
        match self {
            JobKind::AsyncContinuation => "async_continuation",
            JobKind::Message => "message",
            JobKind::Timer(_) => "timer",
        }
    }

    pub fn is_timer(&self) -> bool {
        matches!(self, JobKind::Timer(_))
    }
}

/// A persisted unit of asynchronous work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    /// Optimistic concurrency revision, bumped by the store on every update.
    pub revision: u32,
    pub kind: JobKind,
    /// Back-reference to the owning execution. Not ownership.
    pub execution_id: Option<ExecutionId>,
    pub process_instance_id: Option<ProcessInstanceId>,
    pub process_definition_id: Option<ProcessDefinitionId>,
    /// Key of the process definition (stable across versions).
    pub process_definition_key: Option<String>,
    pub tenant_id: Option<TenantId>,
    /// `None` means "as soon as possible".
    pub due_date: Option<DateTime<Utc>>,
    pub lease: Option<Lease>,
    pub retries: u32,
    /// Exclusive jobs of one process instance never run concurrently.
    pub exclusive: bool,
    pub handler_type: String,
    pub handler_configuration: Option<String>,
    pub exception: Option<ExceptionPayload>,
}

impl Job {
    fn with_kind(kind: JobKind, handler_type: impl Into<String>) -> Self {
        Self {
            id: JobId::new(),
            revision: 1,
            kind,
            execution_id: None,
            process_instance_id: None,
            process_definition_id: None,
            process_definition_key: None,
            tenant_id: None,
            due_date: None,
            lease: None,
            retries: DEFAULT_RETRIES,
            exclusive: true,
            handler_type: handler_type.into(),
            handler_configuration: None,
            exception: None,
        }
    }

    /// An async continuation for the given execution.
    pub fn async_continuation(execution_id: ExecutionId) -> Self {
        Self::with_kind(JobKind::AsyncContinuation, ASYNC_CONTINUATION).for_execution(execution_id)
    }

    pub fn message(handler_type: impl Into<String>) -> Self {
        Self::with_kind(JobKind::Message, handler_type)
    }

    pub fn timer(handler_type: impl Into<String>, spec: TimerSpec) -> Self {
        Self::with_kind(JobKind::Timer(spec), handler_type)
    }

    pub fn for_execution(mut self, execution_id: ExecutionId) -> Self {
        self.execution_id = Some(execution_id);
        self
    }

    pub fn in_process_instance(mut self, process_instance_id: ProcessInstanceId) -> Self {
        self.process_instance_id = Some(process_instance_id);
        self
    }

    pub fn of_definition(mut self, id: ProcessDefinitionId, key: impl Into<String>) -> Self {
        self.process_definition_id = Some(id);
        self.process_definition_key = Some(key.into());
        self
    }

    pub fn with_tenant(mut self, tenant_id: TenantId) -> Self {
        self.tenant_id = Some(tenant_id);
        self
    }

    pub fn due_at(mut self, due_date: DateTime<Utc>) -> Self {
        self.due_date = Some(due_date);
        self
    }

    pub fn with_configuration(mut self, configuration: impl Into<String>) -> Self {
        self.handler_configuration = Some(configuration.into());
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn non_exclusive(mut self) -> Self {
        self.exclusive = false;
        self
    }

    pub fn timer_spec(&self) -> Option<&TimerSpec> {
        match &self.kind {
            JobKind::Timer(spec) => Some(spec),
            _ => None,
        }
    }

    pub fn timer_spec_mut(&mut self) -> Option<&mut TimerSpec> {
        match &mut self.kind {
            JobKind::Timer(spec) => Some(spec),
            _ => None,
        }
    }

    /// Due now or in the past. A job without a due date is always due.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.due_date.is_none_or(|due| due <= now)
    }

    /// Claimed means a lease is set and has not expired.
    pub fn is_claimed(&self, now: DateTime<Utc>) -> bool {
        self.lease.as_ref().is_some_and(|l| !l.is_expired(now))
    }

    /// Retries exhausted; left for operators.
    pub fn is_failed(&self) -> bool {
        self.retries == 0
    }

    /// Eligible for pickup by a worker right now.
    pub fn is_acquirable(&self, now: DateTime<Utc>) -> bool {
        !self.is_failed() && self.is_due(now) && !self.is_claimed(now)
    }

    /// A fresh record for the next firing of a recurring timer.
    ///
    /// Tenant, execution, definition and handler configuration carry over;
    /// lease, failure state and retries start clean.
    pub fn timer_successor(&self, recurrence: Recurrence, due_date: DateTime<Utc>) -> Option<Job> {
        let spec = self.timer_spec()?;
        let mut successor = self.clone();
        successor.id = JobId::new();
        successor.revision = 1;
        successor.due_date = Some(due_date);
        successor.lease = None;
        successor.exception = None;
        successor.retries = DEFAULT_RETRIES;
        successor.kind = JobKind::Timer(TimerSpec {
            recurrence: Some(recurrence),
            end_date: spec.end_date,
            max_iterations: spec.max_iterations,
        });
        Some(successor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, hour, 0, 0).unwrap()
    }

    #[test]
    fn pickup_requires_due_date_reached_and_no_live_lease() {
        let now = at(10);
        let mut job = Job::message("notify").due_at(at(9));
        assert!(job.is_acquirable(now));

        job.lease = Some(Lease::new("worker-a", now + Duration::minutes(5)));
        assert!(job.is_claimed(now));
        assert!(!job.is_acquirable(now));

        // Expired lease is stealable.
        job.lease = Some(Lease::new("worker-a", now - Duration::seconds(1)));
        assert!(job.is_acquirable(now));

        job.due_date = Some(at(11));
        assert!(!job.is_acquirable(now));
    }

    #[test]
    fn failed_jobs_are_never_acquirable() {
        let job = Job::message("notify").with_retries(0);
        assert!(job.is_failed());
        assert!(!job.is_acquirable(at(10)));
    }

    #[test]
    fn successor_keeps_scope_but_not_state() {
        let recurrence: Recurrence = "R3/PT1H".parse().unwrap();
        let mut timer = Job::timer(TRIGGER_TIMER, TimerSpec::recurring(recurrence.clone()))
            .for_execution(ExecutionId::new("exec-1"))
            .with_tenant(TenantId::new("acme"))
            .with_configuration("boundary-timer")
            .due_at(at(9));
        timer.lease = Some(Lease::new("worker-a", at(10)));
        timer.retries = 1;

        let next: Recurrence = "R2/PT1H".parse().unwrap();
        let successor = timer.timer_successor(next.clone(), at(10)).unwrap();

        assert_ne!(successor.id, timer.id);
        assert_eq!(successor.tenant_id, timer.tenant_id);
        assert_eq!(successor.execution_id, timer.execution_id);
        assert_eq!(successor.handler_configuration, timer.handler_configuration);
        assert_eq!(successor.due_date, Some(at(10)));
        assert!(successor.lease.is_none());
        assert_eq!(successor.retries, DEFAULT_RETRIES);
        assert_eq!(successor.timer_spec().unwrap().recurrence, Some(next));
    }

    #[test]
    fn only_timers_have_successors() {
        let job = Job::message("notify");
        assert!(job.timer_successor("R/PT1H".parse().unwrap(), at(1)).is_none());
    }
}
