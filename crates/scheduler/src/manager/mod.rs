//! Job lifecycle manager.
//!
//! Owns every state transition of a job: insert, schedule, send, execute,
//! retry, failure bookkeeping and delete. All mutations go through the
//! caller's [`UnitOfWork`]; nothing here commits on its own.
//!
//! ## Hinting
//!
//! After `schedule`/`send` the manager registers a post-commit hint:
//! - reactive executors get the job itself,
//! - polling executors get a wake signal when the work is already due.

mod timer;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use jobforge_core::{
    Clock, DeploymentId, EngineError, ExecutionId, JobId, ProcessDefinitionId, ProcessInstanceId, TenantId,
};
use jobforge_events::{EventDispatcher, JobEvent, JobEventKind, NoopEventDispatcher};

use crate::calendar::{BusinessCalendar, CalendarError, CycleBusinessCalendar};
use crate::config::{ExecutorMode, JobExecutorConfig};
use crate::error::JobError;
use crate::execution::{Execution, ExecutionRepository, InMemoryExecutionRepository};
use crate::expression::{ExpressionEvaluator, VariableExpressionEvaluator};
use crate::handler::{HandlerRegistry, JobContext};
use crate::jobs::types::{ExceptionPayload, Job, JobKind, Lease};
use crate::notify::Notifier;
use crate::process::{InMemoryProcessDefinitionRepository, ProcessDefinitionRepository};
use crate::store::{DueFilter, JobQuery, JobStore, JobStoreError, Page};
use crate::unit_of_work::UnitOfWork;

pub use timer::TimerConfiguration;

/// How a call to [`JobManager::execute`] ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionOutcome {
    /// Message or async continuation ran and was deleted.
    Completed,
    /// Timer was past its window and deleted without firing.
    TimerExpired,
    /// Timer fired and was deleted; `successor` is the next firing, if any.
    TimerFired { successor: Option<JobId> },
}

fn add_std(at: DateTime<Utc>, by: std::time::Duration) -> Result<DateTime<Utc>, JobError> {
    chrono::Duration::from_std(by)
        .ok()
        .and_then(|d| at.checked_add_signed(d))
        .ok_or(JobError::Calendar(CalendarError::Overflow))
}

pub struct JobManager {
    store: Arc<dyn JobStore>,
    clock: Arc<dyn Clock>,
    config: JobExecutorConfig,
    handlers: HandlerRegistry,
    executions: Arc<dyn ExecutionRepository>,
    definitions: Arc<dyn ProcessDefinitionRepository>,
    calendar: Arc<dyn BusinessCalendar>,
    expressions: Arc<dyn ExpressionEvaluator>,
    events: Arc<dyn EventDispatcher>,
    notifier: Notifier,
}

impl JobManager {
    /// A manager with in-memory collaborators, no handlers, no events and no
    /// executor listening. Swap pieces in with the `with_*` methods.
    pub fn new(store: Arc<dyn JobStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            calendar: Arc::new(CycleBusinessCalendar::new(clock.clone())),
            clock,
            config: JobExecutorConfig::default(),
            handlers: HandlerRegistry::new(),
            executions: Arc::new(InMemoryExecutionRepository::new()),
            definitions: Arc::new(InMemoryProcessDefinitionRepository::new()),
            expressions: Arc::new(VariableExpressionEvaluator),
            events: Arc::new(NoopEventDispatcher),
            notifier: Notifier::disconnected(),
        }
    }

    pub fn with_config(mut self, config: JobExecutorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_handlers(mut self, handlers: HandlerRegistry) -> Self {
        self.handlers = handlers;
        self
    }

    pub fn with_executions(mut self, executions: Arc<dyn ExecutionRepository>) -> Self {
        self.executions = executions;
        self
    }

    pub fn with_definitions(mut self, definitions: Arc<dyn ProcessDefinitionRepository>) -> Self {
        self.definitions = definitions;
        self
    }

    pub fn with_calendar(mut self, calendar: Arc<dyn BusinessCalendar>) -> Self {
        self.calendar = calendar;
        self
    }

    pub fn with_expressions(mut self, expressions: Arc<dyn ExpressionEvaluator>) -> Self {
        self.expressions = expressions;
        self
    }

    pub fn with_events(mut self, events: Arc<dyn EventDispatcher>) -> Self {
        self.events = events;
        self
    }

    pub fn with_notifier(mut self, notifier: Notifier) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn config(&self) -> &JobExecutorConfig {
        &self.config
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    // ---- lifecycle -------------------------------------------------------

    /// Persist a job. A job linked to an execution joins that execution's job
    /// collection and inherits its tenant when it has none.
    pub fn insert(&self, uow: &mut UnitOfWork, mut job: Job) -> Result<Job, JobError> {
        if let Some(execution_id) = job.execution_id.clone() {
            let execution = self
                .executions
                .find_by_id(&execution_id)?
                .ok_or_else(|| JobError::ExecutionNotFound(execution_id.clone()))?;
            if job.tenant_id.is_none() {
                job.tenant_id = execution.tenant_id.clone();
            }
            self.executions.link_job(&execution_id, job.id)?;
            let executions = self.executions.clone();
            let job_id = job.id;
            uow.on_rollback(move || {
                if let Err(err) = executions.unlink_job(&execution_id, job_id) {
                    warn!(job_id = %job_id, error = %err, "failed to undo execution link");
                }
            });
        }

        uow.insert(job.clone());
        self.emit_on_commit(uow, JobEventKind::EntityCreated, &job, None);
        debug!(job_id = %job.id, handler_type = %job.handler_type, kind = job.kind.name(), "job inserted");
        Ok(job)
    }

    /// Insert a timer. Its due date is mandatory.
    pub fn schedule(&self, uow: &mut UnitOfWork, timer: Job) -> Result<Job, JobError> {
        let due = timer.due_date.ok_or(JobError::MissingDueDate)?;
        if !timer.kind.is_timer() {
            return Err(EngineError::illegal_argument(format!("job {} is not a timer", timer.id)).into());
        }

        let timer = self.insert(uow, timer)?;
        if self.config.mode != ExecutorMode::Reactive && due <= self.clock.now() {
            self.notifier.hint_poll(uow);
        }
        Ok(timer)
    }

    /// Insert a message or async continuation and hint the active executor.
    pub fn send(&self, uow: &mut UnitOfWork, mut message: Job) -> Result<Job, JobError> {
        let now = self.clock.now();
        match self.config.mode {
            ExecutorMode::Reactive => {
                // Keeps pollers off the job while the hinted worker runs it.
                message.due_date = Some(add_std(now, self.config.async_job_lock_time)?);
                message.lease = None;
            }
            ExecutorMode::Inactive => message.due_date = Some(now),
            ExecutorMode::Polling => {}
        }

        let message = self.insert(uow, message)?;
        match self.config.mode {
            ExecutorMode::Reactive => self.notifier.hint_reactive(uow, &message),
            ExecutorMode::Polling => self.notifier.hint_poll(uow),
            ExecutorMode::Inactive => {}
        }
        Ok(message)
    }

    /// Run a job the caller has already claimed.
    pub fn execute(&self, uow: &mut UnitOfWork, job: &Job) -> Result<ExecutionOutcome, JobError> {
        match &job.kind {
            JobKind::AsyncContinuation | JobKind::Message => {
                let execution = self.execution_of(job)?;
                self.run_handler(uow, job, execution.as_ref(), None)?;
                self.delete(uow, job)?;
                Ok(ExecutionOutcome::Completed)
            }
            JobKind::Timer(_) => self.fire_timer(uow, job),
        }
    }

    /// Requeue an async job that lost a commit race: releases the lease and
    /// makes it due again after `retry_wait`. No retry is consumed.
    ///
    /// Returns `None` when the job no longer exists or another executor holds
    /// a live lease on it.
    pub fn retry_async_job(&self, uow: &mut UnitOfWork, job: &Job) -> Result<Option<Job>, JobError> {
        let now = self.clock.now();
        let Some(mut current) = self.store.find_by_id(job.id)? else {
            debug!(job_id = %job.id, "job vanished before retry");
            return Ok(None);
        };
        if let Some(lease) = current.lease.as_ref().filter(|l| l.owner != self.config.name && !l.is_expired(now)) {
            debug!(job_id = %job.id, owner = %lease.owner, "job re-claimed elsewhere, not requeued");
            return Ok(None);
        }
        current.lease = None;
        current.due_date = Some(add_std(now, self.config.retry_wait)?);
        uow.update(current.clone());
        info!(job_id = %job.id, retry_wait_ms = self.config.retry_wait.as_millis() as u64, "async job requeued");
        Ok(Some(current))
    }

    /// Delete a job and its exception payload, and unlink it from its execution.
    pub fn delete(&self, uow: &mut UnitOfWork, job: &Job) -> Result<(), JobError> {
        uow.delete(job.id, job.revision);

        if let Some(execution_id) = job.execution_id.clone() {
            match self.executions.unlink_job(&execution_id, job.id) {
                Ok(()) => {
                    let executions = self.executions.clone();
                    let job_id = job.id;
                    uow.on_rollback(move || {
                        if let Err(err) = executions.link_job(&execution_id, job_id) {
                            warn!(job_id = %job_id, error = %err, "failed to restore execution link");
                        }
                    });
                }
                // The execution may already be gone; the job still goes.
                Err(EngineError::NotFound(_)) => {}
                Err(err) => return Err(err.into()),
            }
        }

        self.emit_on_commit(uow, JobEventKind::EntityDeleted, job, None);
        debug!(job_id = %job.id, "job deleted");
        Ok(())
    }

    /// Book a failed attempt: store the exception, release the lease,
    /// decrement retries and, while retries remain, requeue with backoff.
    pub fn record_failure(&self, uow: &mut UnitOfWork, job: &Job, error: &JobError) -> Result<Job, JobError> {
        let now = self.clock.now();
        let mut current = self
            .store
            .find_by_id(job.id)?
            .ok_or(JobStoreError::NotFound(job.id))?;

        let details = match error {
            JobError::Handler(handler) => handler.details.clone().unwrap_or_else(|| format!("{error:?}")),
            other => format!("{other:?}"),
        };
        current.exception = Some(ExceptionPayload::new(error.to_string(), details, now));
        current.lease = None;
        current.retries = current.retries.saturating_sub(1);

        if current.is_failed() {
            warn!(job_id = %job.id, handler_type = %job.handler_type, error = %error, "job has no retries left");
        } else {
            let attempt = self.config.default_retries.saturating_sub(current.retries).max(1);
            let delay = self.config.retry_policy.delay_for_attempt(attempt);
            current.due_date = Some(add_std(now, delay)?);
            debug!(job_id = %job.id, retries = current.retries, delay_ms = delay.as_millis() as u64, "job requeued after failure");
        }

        uow.update(current.clone());
        self.emit_on_commit(uow, JobEventKind::JobRetriesDecremented, &current, Some(error.to_string()));
        Ok(current)
    }

    // ---- claiming --------------------------------------------------------

    fn lock_time_for(&self, job: &Job) -> std::time::Duration {
        if job.kind.is_timer() {
            self.config.timer_lock_time
        } else {
            self.config.async_job_lock_time
        }
    }

    /// Claim a single job for this executor.
    pub fn acquire_job(&self, job: &Job) -> Result<Option<Job>, JobError> {
        let now = self.clock.now();
        let lease = Lease::new(self.config.name.clone(), add_std(now, self.lock_time_for(job))?);
        Ok(self.store.acquire(job.id, lease, now)?)
    }

    /// Claim up to `limit` due jobs for this executor.
    pub fn acquire_due_jobs(&self, limit: usize) -> Result<Vec<Job>, JobError> {
        let now = self.clock.now();
        let expires = add_std(now, self.config.async_job_lock_time)?;
        Ok(self.store.acquire_due_jobs(&self.config.name, expires, now, limit)?)
    }

    // ---- queries ---------------------------------------------------------

    pub fn find_job_by_id(&self, id: JobId) -> Result<Option<Job>, JobError> {
        Ok(self.store.find_by_id(id)?)
    }

    pub fn exception_payload(&self, id: JobId) -> Result<Option<ExceptionPayload>, JobError> {
        Ok(self.store.exception_payload(id)?)
    }

    pub fn find_next_jobs_to_execute(&self, page: Page) -> Result<Vec<Job>, JobError> {
        Ok(self.store.find_due_jobs(self.clock.now(), DueFilter::All, page)?)
    }

    pub fn find_next_timer_jobs_to_execute(&self, page: Page) -> Result<Vec<Job>, JobError> {
        Ok(self.store.find_due_jobs(self.clock.now(), DueFilter::TimersOnly, page)?)
    }

    pub fn find_async_jobs_due_to_execute(&self, page: Page) -> Result<Vec<Job>, JobError> {
        Ok(self.store.find_due_jobs(self.clock.now(), DueFilter::AsyncOnly, page)?)
    }

    pub fn find_jobs_by_lock_owner(&self, owner: &str, page: Page) -> Result<Vec<Job>, JobError> {
        Ok(self.store.find_by_lock_owner(owner, page)?)
    }

    pub fn find_jobs_by_execution_id(&self, execution_id: &ExecutionId) -> Result<Vec<Job>, JobError> {
        Ok(self.store.find_by_execution(execution_id, false)?)
    }

    pub fn find_timers_by_execution_id(&self, execution_id: &ExecutionId) -> Result<Vec<Job>, JobError> {
        Ok(self.store.find_by_execution(execution_id, true)?)
    }

    pub fn find_exclusive_jobs_to_execute(&self, process_instance_id: &ProcessInstanceId) -> Result<Vec<Job>, JobError> {
        Ok(self
            .store
            .find_exclusive_jobs_to_execute(process_instance_id, self.clock.now())?)
    }

    pub fn find_unlocked_timers_due_before(&self, due: DateTime<Utc>, page: Page) -> Result<Vec<Job>, JobError> {
        Ok(self.store.find_unlocked_timers_due_before(due, page)?)
    }

    pub fn find_jobs_by_type_and_process_definition_ids(
        &self,
        handler_type: &str,
        definitions: &[ProcessDefinitionId],
    ) -> Result<Vec<Job>, JobError> {
        Ok(self.store.find_by_handler_and_definitions(handler_type, definitions)?)
    }

    pub fn find_jobs_by_type_and_process_definition_id(
        &self,
        handler_type: &str,
        definition: &ProcessDefinitionId,
    ) -> Result<Vec<Job>, JobError> {
        Ok(self
            .store
            .find_by_handler_and_definitions(handler_type, std::slice::from_ref(definition))?)
    }

    pub fn find_jobs_by_type_and_process_definition_key_no_tenant(
        &self,
        handler_type: &str,
        definition_key: &str,
    ) -> Result<Vec<Job>, JobError> {
        Ok(self
            .store
            .find_by_handler_and_definition_key(handler_type, definition_key, None)?)
    }

    pub fn find_jobs_by_type_and_process_definition_key_and_tenant(
        &self,
        handler_type: &str,
        definition_key: &str,
        tenant_id: &TenantId,
    ) -> Result<Vec<Job>, JobError> {
        Ok(self
            .store
            .find_by_handler_and_definition_key(handler_type, definition_key, Some(tenant_id))?)
    }

    pub fn find_jobs_by_query(&self, query: &JobQuery, page: Page) -> Result<Vec<Job>, JobError> {
        Ok(self.store.find_by_query(query, page)?)
    }

    pub fn count_jobs_by_query(&self, query: &JobQuery) -> Result<usize, JobError> {
        Ok(self.store.count_by_query(query)?)
    }

    /// Jobs whose retries are exhausted, for operator inspection.
    pub fn find_failed_jobs(&self, page: Page) -> Result<Vec<Job>, JobError> {
        Ok(self.store.find_by_query(&JobQuery::new().no_retries_left(), page)?)
    }

    /// Reassign the tenant of every job belonging to a deployment.
    pub fn update_job_tenant_for_deployment(
        &self,
        deployment: &DeploymentId,
        tenant_id: Option<&TenantId>,
    ) -> Result<usize, JobError> {
        let definitions = self.definitions.definitions_for_deployment(deployment)?;
        if definitions.is_empty() {
            return Ok(0);
        }
        let touched = self.store.update_tenant_for_definitions(&definitions, tenant_id)?;
        info!(deployment_id = %deployment, touched, "job tenant reassigned");
        Ok(touched)
    }

    // ---- internals -------------------------------------------------------

    fn execution_of(&self, job: &Job) -> Result<Option<Execution>, JobError> {
        match &job.execution_id {
            Some(id) => Ok(self.executions.find_by_id(id)?),
            None => Ok(None),
        }
    }

    fn run_handler(
        &self,
        uow: &mut UnitOfWork,
        job: &Job,
        execution: Option<&Execution>,
        activity_id: Option<&str>,
    ) -> Result<(), JobError> {
        let handler = self
            .handlers
            .get(&job.handler_type)
            .ok_or_else(|| JobError::HandlerNotFound(job.handler_type.clone()))?;

        let mut ctx = JobContext {
            now: self.clock.now(),
            activity_id,
            uow,
        };
        handler.execute(job, job.handler_configuration.as_deref(), execution, &mut ctx)?;
        Ok(())
    }

    /// Dispatch a notification if dispatch is enabled.
    pub(crate) fn emit(&self, kind: JobEventKind, job: &Job, error: Option<String>) {
        if let Some(event) = self.event_for(kind, job, error) {
            self.events.dispatch(event);
        }
    }

    /// Dispatch an event once `uow` commits. Rolled-back work stays silent.
    pub(crate) fn emit_on_commit(&self, uow: &mut UnitOfWork, kind: JobEventKind, job: &Job, error: Option<String>) {
        if let Some(event) = self.event_for(kind, job, error) {
            let events = self.events.clone();
            uow.on_commit(move || events.dispatch(event));
        }
    }

    fn event_for(&self, kind: JobEventKind, job: &Job, error: Option<String>) -> Option<JobEvent> {
        if !self.events.is_enabled() {
            return None;
        }
        let mut event = JobEvent::new(kind, job.id, job.handler_type.clone(), self.clock.now()).with_scope(
            job.tenant_id.clone(),
            job.execution_id.clone(),
            job.process_instance_id.clone(),
        );
        if let Some(error) = error {
            event = event.with_error(error);
        }
        Some(event)
    }
}

impl std::fmt::Debug for JobManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobManager")
            .field("config", &self.config)
            .field("handlers", &self.handlers)
            .field("notifier", &self.notifier)
            .finish_non_exhaustive()
    }
}
