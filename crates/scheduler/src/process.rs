//! Process definition lookups needed by timers and tenant fix-ups.

use std::collections::HashMap;
use std::sync::RwLock;

use jobforge_core::{DeploymentId, EngineError, ProcessDefinitionId, TenantId};

/// The parts of a deployed process model the scheduler reads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessDefinition {
    pub id: ProcessDefinitionId,
    pub key: String,
    pub deployment_id: DeploymentId,
    pub tenant_id: Option<TenantId>,
    /// Timer cycle expressions keyed by flow-element (activity) id.
    pub timer_cycles: HashMap<String, String>,
}

impl ProcessDefinition {
    pub fn new(id: ProcessDefinitionId, key: impl Into<String>, deployment_id: DeploymentId) -> Self {
        Self {
            id,
            key: key.into(),
            deployment_id,
            tenant_id: None,
            timer_cycles: HashMap::new(),
        }
    }

    pub fn with_tenant(mut self, tenant_id: TenantId) -> Self {
        self.tenant_id = Some(tenant_id);
        self
    }

    pub fn with_timer_cycle(mut self, activity_id: impl Into<String>, cycle: impl Into<String>) -> Self {
        self.timer_cycles.insert(activity_id.into(), cycle.into());
        self
    }
}

pub trait ProcessDefinitionRepository: Send + Sync {
    /// Cycle expression declared on a flow element. `None` when the
    /// definition, the element, or its cycle doesn't exist.
    fn timer_cycle(
        &self,
        definition: &ProcessDefinitionId,
        activity_id: &str,
    ) -> Result<Option<String>, EngineError>;

    fn definitions_for_deployment(&self, deployment: &DeploymentId) -> Result<Vec<ProcessDefinitionId>, EngineError>;
}

#[derive(Debug, Default)]
pub struct InMemoryProcessDefinitionRepository {
    definitions: RwLock<HashMap<ProcessDefinitionId, ProcessDefinition>>,
}

impl InMemoryProcessDefinitionRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn deploy(&self, definition: ProcessDefinition) -> Result<(), EngineError> {
        let mut definitions = self
            .definitions
            .write()
            .map_err(|_| EngineError::conflict("definition lock poisoned"))?;
        definitions.insert(definition.id.clone(), definition);
        Ok(())
    }
}

impl ProcessDefinitionRepository for InMemoryProcessDefinitionRepository {
    fn timer_cycle(
        &self,
        definition: &ProcessDefinitionId,
        activity_id: &str,
    ) -> Result<Option<String>, EngineError> {
        let definitions = self
            .definitions
            .read()
            .map_err(|_| EngineError::conflict("definition lock poisoned"))?;
        Ok(definitions
            .get(definition)
            .and_then(|d| d.timer_cycles.get(activity_id).cloned()))
    }

    fn definitions_for_deployment(&self, deployment: &DeploymentId) -> Result<Vec<ProcessDefinitionId>, EngineError> {
        let definitions = self
            .definitions
            .read()
            .map_err(|_| EngineError::conflict("definition lock poisoned"))?;
        let mut ids: Vec<ProcessDefinitionId> = definitions
            .values()
            .filter(|d| &d.deployment_id == deployment)
            .map(|d| d.id.clone())
            .collect();
        ids.sort();
        Ok(ids)
    }
}
