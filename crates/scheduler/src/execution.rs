//! Execution-context provider.
//!
//! Executions are owned by the process engine; the scheduler only resolves
//! them by id, reads their variables, and maintains their live job list.

use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use jobforge_core::{EngineError, ExecutionId, JobId, ProcessDefinitionId, ProcessInstanceId, TenantId};

/// A process variable as seen by expressions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum VariableValue {
    Date(DateTime<Utc>),
    Text(String),
    Json(serde_json::Value),
}

impl VariableValue {
    pub fn type_name(&self) -> &'static str {
        match self {
            VariableValue::Date(_) => "date",
            VariableValue::Text(_) => "text",
            VariableValue::Json(_) => "json",
        }
    }
}

/// Anything expressions can read variables from.
pub trait VariableScope {
    fn variable(&self, name: &str) -> Option<VariableValue>;
}

/// Scope for jobs that aren't linked to an execution. Has no variables.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoExecutionScope;

impl VariableScope for NoExecutionScope {
    fn variable(&self, _name: &str) -> Option<VariableValue> {
        None
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Execution {
    pub id: ExecutionId,
    pub process_instance_id: Option<ProcessInstanceId>,
    pub process_definition_id: Option<ProcessDefinitionId>,
    pub tenant_id: Option<TenantId>,
    pub variables: BTreeMap<String, VariableValue>,
    /// Live job collection; kept in step with the store by the job manager.
    pub jobs: Vec<JobId>,
}

impl Execution {
    pub fn new(id: ExecutionId) -> Self {
        Self {
            id,
            process_instance_id: None,
            process_definition_id: None,
            tenant_id: None,
            variables: BTreeMap::new(),
            jobs: Vec::new(),
        }
    }

    pub fn in_process_instance(mut self, id: ProcessInstanceId) -> Self {
        self.process_instance_id = Some(id);
        self
    }

    pub fn of_definition(mut self, id: ProcessDefinitionId) -> Self {
        self.process_definition_id = Some(id);
        self
    }

    pub fn with_tenant(mut self, tenant_id: TenantId) -> Self {
        self.tenant_id = Some(tenant_id);
        self
    }

    pub fn with_variable(mut self, name: impl Into<String>, value: VariableValue) -> Self {
        self.variables.insert(name.into(), value);
        self
    }
}

impl VariableScope for Execution {
    fn variable(&self, name: &str) -> Option<VariableValue> {
        self.variables.get(name).cloned()
    }
}

/// Resolves executions and edits their live job collection.
pub trait ExecutionRepository: Send + Sync {
    fn find_by_id(&self, id: &ExecutionId) -> Result<Option<Execution>, EngineError>;

    /// Append a job to the execution's job collection. Idempotent.
    fn link_job(&self, id: &ExecutionId, job_id: JobId) -> Result<(), EngineError>;

    /// Remove a job from the execution's job collection. Idempotent.
    fn unlink_job(&self, id: &ExecutionId, job_id: JobId) -> Result<(), EngineError>;
}

#[derive(Debug, Default)]
pub struct InMemoryExecutionRepository {
    executions: RwLock<HashMap<ExecutionId, Execution>>,
}

impl InMemoryExecutionRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn save(&self, execution: Execution) -> Result<(), EngineError> {
        let mut executions = self
            .executions
            .write()
            .map_err(|_| EngineError::storage("execution lock poisoned"))?;
        executions.insert(execution.id.clone(), execution);
        Ok(())
    }

    pub fn jobs_of(&self, id: &ExecutionId) -> Vec<JobId> {
        self.executions
            .read()
            .ok()
            .and_then(|e| e.get(id).map(|x| x.jobs.clone()))
            .unwrap_or_default()
    }

    fn edit(&self, id: &ExecutionId, f: impl FnOnce(&mut Execution)) -> Result<(), EngineError> {
        let mut executions = self
            .executions
            .write()
            .map_err(|_| EngineError::storage("execution lock poisoned"))?;
        let execution = executions
            .get_mut(id)
            .ok_or_else(|| EngineError::not_found(format!("execution {id}")))?;
        f(execution);
        Ok(())
    }
}

impl ExecutionRepository for InMemoryExecutionRepository {
    fn find_by_id(&self, id: &ExecutionId) -> Result<Option<Execution>, EngineError> {
        let executions = self
            .executions
            .read()
            .map_err(|_| EngineError::storage("execution lock poisoned"))?;
        Ok(executions.get(id).cloned())
    }

    fn link_job(&self, id: &ExecutionId, job_id: JobId) -> Result<(), EngineError> {
        self.edit(id, |execution| {
            if !execution.jobs.contains(&job_id) {
                execution.jobs.push(job_id);
            }
        })
    }

    fn unlink_job(&self, id: &ExecutionId, job_id: JobId) -> Result<(), EngineError> {
        self.edit(id, |execution| execution.jobs.retain(|j| *j != job_id))
    }
}
