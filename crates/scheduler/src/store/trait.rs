use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;

use jobforge_core::{ExecutionId, JobId, ProcessDefinitionId, ProcessInstanceId, TenantId};

use crate::jobs::types::{ExceptionPayload, Job, Lease};

use super::query::{DueFilter, JobQuery, Page};

/// A single mutation inside an atomic batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreOp {
    /// Insert a new record. Fails if the id exists.
    Insert(Job),
    /// Replace a record. `job.revision` must match the stored revision.
    Update(Job),
    /// Delete a record and its exception payload. `revision` must match.
    Delete { id: JobId, revision: u32 },
}

impl StoreOp {
    pub fn job_id(&self) -> JobId {
        match self {
            StoreOp::Insert(job) | StoreOp::Update(job) => job.id,
            StoreOp::Delete { id, .. } => *id,
        }
    }
}

/// Job store operation error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),

    #[error("job already exists: {0}")]
    AlreadyExists(JobId),

    /// Stale revision, concurrent delete, or lease held by someone else.
    #[error("optimistic concurrency check failed: {0}")]
    Conflict(String),

    #[error("storage error: {0}")]
    Storage(String),
}

/// Durable id → job mapping with the range queries the scheduler needs.
///
/// ## Implementation requirements
///
/// - `apply` is atomic: every op in the batch lands or none does.
/// - Updates and deletes check the revision and bump it on update.
/// - Deleting a job deletes its exception payload in the same batch.
/// - The `acquire*` methods claim atomically: they set owner + expiration
///   only on jobs that are unclaimed (or lease-expired), have retries left,
///   and, for exclusive jobs, whose process instance has no other exclusive
///   job under a live lease. `acquire_due_jobs` also requires `due <= now`;
///   `acquire` doesn't, since reactive hints push the due date out.
/// - Jobs without a due date count as due.
pub trait JobStore: Send + Sync {
    /// Apply a batch of mutations atomically.
    fn apply(&self, batch: Vec<StoreOp>) -> Result<(), JobStoreError>;

    fn find_by_id(&self, id: JobId) -> Result<Option<Job>, JobStoreError>;

    /// The stored exception payload of a job, if any.
    fn exception_payload(&self, id: JobId) -> Result<Option<ExceptionPayload>, JobStoreError>;

    /// Jobs with `due <= now`, no live lease and retries left, ordered by due date.
    fn find_due_jobs(
        &self,
        now: DateTime<Utc>,
        filter: DueFilter,
        page: Page,
    ) -> Result<Vec<Job>, JobStoreError>;

    fn find_by_lock_owner(&self, owner: &str, page: Page) -> Result<Vec<Job>, JobStoreError>;

    fn find_by_execution(
        &self,
        execution_id: &ExecutionId,
        timers_only: bool,
    ) -> Result<Vec<Job>, JobStoreError>;

    /// An empty `definitions` slice matches every definition.
    fn find_by_handler_and_definitions(
        &self,
        handler_type: &str,
        definitions: &[ProcessDefinitionId],
    ) -> Result<Vec<Job>, JobStoreError>;

    /// `tenant = None` matches only jobs without a tenant.
    fn find_by_handler_and_definition_key(
        &self,
        handler_type: &str,
        definition_key: &str,
        tenant: Option<&TenantId>,
    ) -> Result<Vec<Job>, JobStoreError>;

    /// Exclusive jobs of an instance that may run now. Empty while any
    /// exclusive job of that instance holds a live lease.
    fn find_exclusive_jobs_to_execute(
        &self,
        process_instance_id: &ProcessInstanceId,
        now: DateTime<Utc>,
    ) -> Result<Vec<Job>, JobStoreError>;

    /// Timers with no lease whose due date is at or before `due`.
    fn find_unlocked_timers_due_before(
        &self,
        due: DateTime<Utc>,
        page: Page,
    ) -> Result<Vec<Job>, JobStoreError>;

    fn find_by_query(&self, query: &JobQuery, page: Page) -> Result<Vec<Job>, JobStoreError>;

    fn count_by_query(&self, query: &JobQuery) -> Result<usize, JobStoreError>;

    /// Claim one job regardless of its due date. `Ok(None)` when it is not
    /// claimable right now.
    fn acquire(&self, id: JobId, lease: Lease, now: DateTime<Utc>) -> Result<Option<Job>, JobStoreError>;

    /// Claim up to `limit` due jobs in due-date order.
    fn acquire_due_jobs(
        &self,
        owner: &str,
        lease_expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Job>, JobStoreError>;

    /// Reassign the tenant of every job of the given definitions. Returns the
    /// number of jobs touched.
    fn update_tenant_for_definitions(
        &self,
        definitions: &[ProcessDefinitionId],
        tenant: Option<&TenantId>,
    ) -> Result<usize, JobStoreError>;
}

impl<S> JobStore for Arc<S>
where
    S: JobStore + ?Sized,
{
    fn apply(&self, batch: Vec<StoreOp>) -> Result<(), JobStoreError> {
        (**self).apply(batch)
    }

    fn find_by_id(&self, id: JobId) -> Result<Option<Job>, JobStoreError> {
        (**self).find_by_id(id)
    }

    fn exception_payload(&self, id: JobId) -> Result<Option<ExceptionPayload>, JobStoreError> {
        (**self).exception_payload(id)
    }

    fn find_due_jobs(
        &self,
        now: DateTime<Utc>,
        filter: DueFilter,
        page: Page,
    ) -> Result<Vec<Job>, JobStoreError> {
        (**self).find_due_jobs(now, filter, page)
    }

    fn find_by_lock_owner(&self, owner: &str, page: Page) -> Result<Vec<Job>, JobStoreError> {
        (**self).find_by_lock_owner(owner, page)
    }

    fn find_by_execution(
        &self,
        execution_id: &ExecutionId,
        timers_only: bool,
    ) -> Result<Vec<Job>, JobStoreError> {
        (**self).find_by_execution(execution_id, timers_only)
    }

    fn find_by_handler_and_definitions(
        &self,
        handler_type: &str,
        definitions: &[ProcessDefinitionId],
    ) -> Result<Vec<Job>, JobStoreError> {
        (**self).find_by_handler_and_definitions(handler_type, definitions)
    }

    fn find_by_handler_and_definition_key(
        &self,
        handler_type: &str,
        definition_key: &str,
        tenant: Option<&TenantId>,
    ) -> Result<Vec<Job>, JobStoreError> {
        (**self).find_by_handler_and_definition_key(handler_type, definition_key, tenant)
    }

    fn find_exclusive_jobs_to_execute(
        &self,
        process_instance_id: &ProcessInstanceId,
        now: DateTime<Utc>,
    ) -> Result<Vec<Job>, JobStoreError> {
        (**self).find_exclusive_jobs_to_execute(process_instance_id, now)
    }

    fn find_unlocked_timers_due_before(
        &self,
        due: DateTime<Utc>,
        page: Page,
    ) -> Result<Vec<Job>, JobStoreError> {
        (**self).find_unlocked_timers_due_before(due, page)
    }

    fn find_by_query(&self, query: &JobQuery, page: Page) -> Result<Vec<Job>, JobStoreError> {
        (**self).find_by_query(query, page)
    }

    fn count_by_query(&self, query: &JobQuery) -> Result<usize, JobStoreError> {
        (**self).count_by_query(query)
    }

    fn acquire(&self, id: JobId, lease: Lease, now: DateTime<Utc>) -> Result<Option<Job>, JobStoreError> {
        (**self).acquire(id, lease, now)
    }

    fn acquire_due_jobs(
        &self,
        owner: &str,
        lease_expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Job>, JobStoreError> {
        (**self).acquire_due_jobs(owner, lease_expires_at, now, limit)
    }

    fn update_tenant_for_definitions(
        &self,
        definitions: &[ProcessDefinitionId],
        tenant: Option<&TenantId>,
    ) -> Result<usize, JobStoreError> {
        (**self).update_tenant_for_definitions(definitions, tenant)
    }
}
