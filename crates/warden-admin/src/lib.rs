//! Policy admin command service: slash-command parsing, rate limiting,
//! atomic policy mutation with audit trail, and rollback.

pub mod audit;
pub mod contracts;
pub mod registry;
pub mod service;

pub use audit::{PolicyAuditEntry, PolicyAuditStore};
pub use contracts::{ActorSource, PolicyActorContext, PolicyCommand, PolicyExecutionOptions, PolicyExecutionResult, PolicyOutcome};
pub use registry::{PolicyCommandRegistry, PolicyCommandSpec};
pub use service::PolicyAdminService;
