//! `jobforge-core` — shared building blocks for the job scheduling engine.
//!
//! Identifiers, the engine error taxonomy and the wall clock. No storage or
//! runtime concerns live here.

pub mod clock;
pub mod error;
pub mod id;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{EngineError, EngineResult};
pub use id::{DeploymentId, ExecutionId, JobId, ProcessDefinitionId, ProcessInstanceId, TenantId};
