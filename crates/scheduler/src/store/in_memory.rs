use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};

use jobforge_core::{ExecutionId, JobId, ProcessDefinitionId, ProcessInstanceId, TenantId};

use crate::jobs::types::{ExceptionPayload, Job, Lease};

use super::query::{DueFilter, JobQuery, Page};
use super::r#trait::{JobStore, JobStoreError, StoreOp};

/// Jobs without a due date sort first: they are due immediately.
fn due_key(job: &Job) -> DateTime<Utc> {
    job.due_date.unwrap_or(DateTime::<Utc>::MIN_UTC)
}

fn sort_by_due(jobs: &mut [Job]) {
    jobs.sort_by_key(|j| (due_key(j), j.id));
}

#[derive(Debug, Default)]
struct Tables {
    /// Records are kept without their exception; payloads live apart.
    jobs: HashMap<JobId, Job>,
    payloads: HashMap<JobId, ExceptionPayload>,
    due_index: BTreeSet<(DateTime<Utc>, JobId)>,
    by_execution: HashMap<ExecutionId, BTreeSet<JobId>>,
    by_instance: HashMap<ProcessInstanceId, BTreeSet<JobId>>,
}

impl Tables {
    fn hydrate(&self, job: &Job) -> Job {
        let mut job = job.clone();
        job.exception = self.payloads.get(&job.id).cloned();
        job
    }

    fn get(&self, id: JobId) -> Option<Job> {
        self.jobs.get(&id).map(|j| self.hydrate(j))
    }

    fn put(&mut self, mut job: Job) {
        self.remove(job.id);
        if let Some(payload) = job.exception.take() {
            self.payloads.insert(job.id, payload);
        }
        self.due_index.insert((due_key(&job), job.id));
        if let Some(exec) = &job.execution_id {
            self.by_execution.entry(exec.clone()).or_default().insert(job.id);
        }
        if let Some(pid) = &job.process_instance_id {
            self.by_instance.entry(pid.clone()).or_default().insert(job.id);
        }
        self.jobs.insert(job.id, job);
    }

    fn remove(&mut self, id: JobId) -> Option<Job> {
        let mut job = self.jobs.remove(&id)?;
        self.due_index.remove(&(due_key(&job), id));
        if let Some(exec) = &job.execution_id {
            if let Some(ids) = self.by_execution.get_mut(exec) {
                ids.remove(&id);
                if ids.is_empty() {
                    self.by_execution.remove(exec);
                }
            }
        }
        if let Some(pid) = &job.process_instance_id {
            if let Some(ids) = self.by_instance.get_mut(pid) {
                ids.remove(&id);
                if ids.is_empty() {
                    self.by_instance.remove(pid);
                }
            }
        }
        job.exception = self.payloads.remove(&id);
        Some(job)
    }

    fn check_revision(&self, id: JobId, revision: u32) -> Result<(), JobStoreError> {
        match self.jobs.get(&id) {
            None => Err(JobStoreError::Conflict(format!("job {id} was deleted concurrently"))),
            Some(stored) if stored.revision != revision => Err(JobStoreError::Conflict(format!(
                "job {id} is at revision {}, expected {revision}",
                stored.revision
            ))),
            Some(_) => Ok(()),
        }
    }

    /// Applies one op, recording what it takes to undo it.
    fn apply_op(&mut self, op: StoreOp, undo: &mut Vec<(JobId, Option<Job>)>) -> Result<(), JobStoreError> {
        match op {
            StoreOp::Insert(job) => {
                if self.jobs.contains_key(&job.id) {
                    return Err(JobStoreError::AlreadyExists(job.id));
                }
                undo.push((job.id, None));
                self.put(job);
            }
            StoreOp::Update(mut job) => {
                self.check_revision(job.id, job.revision)?;
                let previous = self.remove(job.id);
                undo.push((job.id, previous));
                job.revision += 1;
                self.put(job);
            }
            StoreOp::Delete { id, revision } => {
                self.check_revision(id, revision)?;
                let previous = self.remove(id);
                undo.push((id, previous));
            }
        }
        Ok(())
    }

    fn rollback(&mut self, undo: Vec<(JobId, Option<Job>)>) {
        for (id, previous) in undo.into_iter().rev() {
            self.remove(id);
            if let Some(job) = previous {
                self.put(job);
            }
        }
    }

    fn due_ids(&self, until: DateTime<Utc>) -> impl Iterator<Item = JobId> + '_ {
        self.due_index
            .iter()
            .take_while(move |(due, _)| *due <= until)
            .map(|(_, id)| *id)
    }

    /// Whether another exclusive job of the same instance holds a live lease.
    fn instance_blocked(&self, job: &Job, now: DateTime<Utc>) -> bool {
        if !job.exclusive {
            return false;
        }
        let Some(ids) = job.process_instance_id.as_ref().and_then(|pid| self.by_instance.get(pid)) else {
            return false;
        };
        ids.iter()
            .filter(|id| **id != job.id)
            .filter_map(|id| self.jobs.get(id))
            .any(|other| other.exclusive && other.is_claimed(now))
    }

    fn claim(&mut self, id: JobId, lease: Lease, now: DateTime<Utc>, require_due: bool) -> Option<Job> {
        let job = self.jobs.get(&id)?;
        let eligible = !job.is_failed() && !job.is_claimed(now) && (!require_due || job.is_due(now));
        if !eligible || self.instance_blocked(job, now) {
            return None;
        }
        let job = self.jobs.get_mut(&id)?;
        job.lease = Some(lease);
        job.revision += 1;
        let claimed = job.clone();
        Some(self.hydrate(&claimed))
    }

    fn collect(&self, filter: impl Fn(&Job) -> bool) -> Vec<Job> {
        let mut jobs: Vec<Job> = self
            .jobs
            .values()
            .filter(|j| filter(j))
            .map(|j| self.hydrate(j))
            .collect();
        sort_by_due(&mut jobs);
        jobs
    }
}

/// In-memory job store for tests/dev.
///
/// Keeps a due-date index and per-execution / per-instance indexes so the
/// scheduler's hot queries don't scan every record.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    tables: RwLock<Tables>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn len(&self) -> usize {
        self.tables.read().map(|t| t.jobs.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, Tables>, JobStoreError> {
        self.tables
            .read()
            .map_err(|_| JobStoreError::Storage("lock poisoned".to_string()))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, Tables>, JobStoreError> {
        self.tables
            .write()
            .map_err(|_| JobStoreError::Storage("lock poisoned".to_string()))
    }
}

impl JobStore for InMemoryJobStore {
    fn apply(&self, batch: Vec<StoreOp>) -> Result<(), JobStoreError> {
        if batch.is_empty() {
            return Ok(());
        }
        let mut tables = self.write()?;
        let mut undo = Vec::with_capacity(batch.len());
        for op in batch {
            if let Err(err) = tables.apply_op(op, &mut undo) {
                tables.rollback(undo);
                return Err(err);
            }
        }
        Ok(())
    }

    fn find_by_id(&self, id: JobId) -> Result<Option<Job>, JobStoreError> {
        Ok(self.read()?.get(id))
    }

    fn exception_payload(&self, id: JobId) -> Result<Option<ExceptionPayload>, JobStoreError> {
        Ok(self.read()?.payloads.get(&id).cloned())
    }

    fn find_due_jobs(
        &self,
        now: DateTime<Utc>,
        filter: DueFilter,
        page: Page,
    ) -> Result<Vec<Job>, JobStoreError> {
        let tables = self.read()?;
        Ok(page.apply(
            tables
                .due_ids(now)
                .filter_map(|id| tables.jobs.get(&id))
                .filter(|j| j.is_acquirable(now) && filter.accepts(j))
                .map(|j| tables.hydrate(j)),
        ))
    }

    fn find_by_lock_owner(&self, owner: &str, page: Page) -> Result<Vec<Job>, JobStoreError> {
        let tables = self.read()?;
        let jobs = tables.collect(|j| j.lease.as_ref().is_some_and(|l| l.owner == owner));
        Ok(page.apply(jobs))
    }

    fn find_by_execution(
        &self,
        execution_id: &ExecutionId,
        timers_only: bool,
    ) -> Result<Vec<Job>, JobStoreError> {
        let tables = self.read()?;
        let Some(ids) = tables.by_execution.get(execution_id) else {
            return Ok(vec![]);
        };
        let mut jobs: Vec<Job> = ids
            .iter()
            .filter_map(|id| tables.jobs.get(id))
            .filter(|j| !timers_only || j.kind.is_timer())
            .map(|j| tables.hydrate(j))
            .collect();
        sort_by_due(&mut jobs);
        Ok(jobs)
    }

    fn find_by_handler_and_definitions(
        &self,
        handler_type: &str,
        definitions: &[ProcessDefinitionId],
    ) -> Result<Vec<Job>, JobStoreError> {
        let tables = self.read()?;
        Ok(tables.collect(|j| {
            j.handler_type == handler_type
                && (definitions.is_empty()
                    || j.process_definition_id.as_ref().is_some_and(|d| definitions.contains(d)))
        }))
    }

    fn find_by_handler_and_definition_key(
        &self,
        handler_type: &str,
        definition_key: &str,
        tenant: Option<&TenantId>,
    ) -> Result<Vec<Job>, JobStoreError> {
        let tables = self.read()?;
        Ok(tables.collect(|j| {
            j.handler_type == handler_type
                && j.process_definition_key.as_deref() == Some(definition_key)
                && j.tenant_id.as_ref() == tenant
        }))
    }

    fn find_exclusive_jobs_to_execute(
        &self,
        process_instance_id: &ProcessInstanceId,
        now: DateTime<Utc>,
    ) -> Result<Vec<Job>, JobStoreError> {
        let tables = self.read()?;
        let Some(ids) = tables.by_instance.get(process_instance_id) else {
            return Ok(vec![]);
        };
        let members: Vec<&Job> = ids.iter().filter_map(|id| tables.jobs.get(id)).collect();
        if members.iter().any(|j| j.exclusive && j.is_claimed(now)) {
            return Ok(vec![]);
        }
        let mut jobs: Vec<Job> = members
            .into_iter()
            .filter(|j| j.exclusive && j.is_acquirable(now))
            .map(|j| tables.hydrate(j))
            .collect();
        sort_by_due(&mut jobs);
        Ok(jobs)
    }

    fn find_unlocked_timers_due_before(
        &self,
        due: DateTime<Utc>,
        page: Page,
    ) -> Result<Vec<Job>, JobStoreError> {
        let tables = self.read()?;
        Ok(page.apply(
            tables
                .due_ids(due)
                .filter_map(|id| tables.jobs.get(&id))
                .filter(|j| j.kind.is_timer() && j.lease.is_none())
                .map(|j| tables.hydrate(j)),
        ))
    }

    fn find_by_query(&self, query: &JobQuery, page: Page) -> Result<Vec<Job>, JobStoreError> {
        let tables = self.read()?;
        let jobs = tables.collect(|j| query.matches(&tables.hydrate(j)));
        Ok(page.apply(jobs))
    }

    fn count_by_query(&self, query: &JobQuery) -> Result<usize, JobStoreError> {
        let tables = self.read()?;
        Ok(tables
            .jobs
            .values()
            .filter(|j| query.matches(&tables.hydrate(j)))
            .count())
    }

    fn acquire(&self, id: JobId, lease: Lease, now: DateTime<Utc>) -> Result<Option<Job>, JobStoreError> {
        Ok(self.write()?.claim(id, lease, now, false))
    }

    fn acquire_due_jobs(
        &self,
        owner: &str,
        lease_expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Job>, JobStoreError> {
        let mut tables = self.write()?;
        let candidates: Vec<JobId> = tables.due_ids(now).collect();
        let mut acquired = Vec::new();
        for id in candidates {
            if acquired.len() >= limit {
                break;
            }
            // Claims made earlier in this loop block later exclusive siblings.
            if let Some(job) = tables.claim(id, Lease::new(owner, lease_expires_at), now, true) {
                acquired.push(job);
            }
        }
        Ok(acquired)
    }

    fn update_tenant_for_definitions(
        &self,
        definitions: &[ProcessDefinitionId],
        tenant: Option<&TenantId>,
    ) -> Result<usize, JobStoreError> {
        let mut tables = self.write()?;
        let mut touched = 0;
        for job in tables.jobs.values_mut() {
            if job.process_definition_id.as_ref().is_some_and(|d| definitions.contains(d)) {
                job.tenant_id = tenant.cloned();
                job.revision += 1;
                touched += 1;
            }
        }
        Ok(touched)
    }
}
