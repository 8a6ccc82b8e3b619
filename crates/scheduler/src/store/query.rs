//! Paging and criteria queries over jobs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use jobforge_core::{ExecutionId, ProcessInstanceId, TenantId};

use crate::jobs::types::{Job, JobKind};

/// Offset/limit paging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page {
    pub offset: usize,
    pub limit: usize,
}

impl Default for Page {
    fn default() -> Self {
        Self {
            offset: 0,
            limit: 50,
        }
    }
}

impl Page {
    pub fn new(offset: usize, limit: usize) -> Self {
        Self { offset, limit }
    }

    pub fn first(limit: usize) -> Self {
        Self { offset: 0, limit }
    }

    pub fn all() -> Self {
        Self {
            offset: 0,
            limit: usize::MAX,
        }
    }

    pub fn apply<T>(&self, items: impl IntoIterator<Item = T>) -> Vec<T> {
        items.into_iter().skip(self.offset).take(self.limit).collect()
    }
}

/// Which kinds a due-job query returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DueFilter {
    #[default]
    All,
    TimersOnly,
    /// Async continuations and messages.
    AsyncOnly,
}

impl DueFilter {
    pub fn accepts(&self, job: &Job) -> bool {
        match self {
            DueFilter::All => true,
            DueFilter::TimersOnly => job.kind.is_timer(),
            DueFilter::AsyncOnly => !job.kind.is_timer(),
        }
    }
}

/// Criteria query for operator tooling. Unset fields don't filter.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobQuery {
    pub process_instance_id: Option<ProcessInstanceId>,
    pub execution_id: Option<ExecutionId>,
    pub handler_type: Option<String>,
    pub timers_only: bool,
    pub messages_only: bool,
    /// Only jobs a worker could pick up at this instant.
    pub executable_at: Option<DateTime<Utc>>,
    pub with_exception: bool,
    pub no_retries_left: bool,
    pub tenant_id: Option<TenantId>,
    pub without_tenant: bool,
    /// Only jobs holding a lease that is live at this instant.
    pub locked_at: Option<DateTime<Utc>>,
}

impl JobQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn process_instance(mut self, id: ProcessInstanceId) -> Self {
        self.process_instance_id = Some(id);
        self
    }

    pub fn execution(mut self, id: ExecutionId) -> Self {
        self.execution_id = Some(id);
        self
    }

    pub fn handler_type(mut self, handler_type: impl Into<String>) -> Self {
        self.handler_type = Some(handler_type.into());
        self
    }

    pub fn timers(mut self) -> Self {
        self.timers_only = true;
        self
    }

    pub fn messages(mut self) -> Self {
        self.messages_only = true;
        self
    }

    pub fn executable(mut self, now: DateTime<Utc>) -> Self {
        self.executable_at = Some(now);
        self
    }

    pub fn with_exception(mut self) -> Self {
        self.with_exception = true;
        self
    }

    pub fn no_retries_left(mut self) -> Self {
        self.no_retries_left = true;
        self
    }

    pub fn tenant(mut self, tenant_id: TenantId) -> Self {
        self.tenant_id = Some(tenant_id);
        self
    }

    pub fn without_tenant(mut self) -> Self {
        self.without_tenant = true;
        self
    }

    pub fn locked(mut self, now: DateTime<Utc>) -> Self {
        self.locked_at = Some(now);
        self
    }

    pub fn matches(&self, job: &Job) -> bool {
        if self.process_instance_id.as_ref().is_some_and(|p| job.process_instance_id.as_ref() != Some(p)) {
            return false;
        }
        if self.execution_id.as_ref().is_some_and(|e| job.execution_id.as_ref() != Some(e)) {
            return false;
        }
        if self.handler_type.as_ref().is_some_and(|h| &job.handler_type != h) {
            return false;
        }
        if self.timers_only && !job.kind.is_timer() {
            return false;
        }
        if self.messages_only && job.kind != JobKind::Message {
            return false;
        }
        if self.executable_at.is_some_and(|now| !job.is_acquirable(now)) {
            return false;
        }
        if self.with_exception && job.exception.is_none() {
            return false;
        }
        if self.no_retries_left && !job.is_failed() {
            return false;
        }
        if self.tenant_id.as_ref().is_some_and(|t| job.tenant_id.as_ref() != Some(t)) {
            return false;
        }
        if self.without_tenant && job.tenant_id.is_some() {
            return false;
        }
        if self.locked_at.is_some_and(|now| !job.is_claimed(now)) {
            return false;
        }
        true
    }
}
