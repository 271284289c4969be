//! Core library for running untrusted programs in pooled, isolated instances.
//!
//! The engine is organised around four subsystems:
//!
//! - **Instance pool**: pre-created, reusable runtime instances with health
//!   checking, scaling and expiry on background tasks
//! - **Constraint compiler**: resolves per-request resource limits against
//!   language and system defaults
//! - **Orchestrator**: stages a program into an instance, compiles and runs it
//!   under limits, and classifies the outcome
//! - **Scheduler**: moves submissions through their lifecycle on a bounded
//!   worker queue, with cancellation and webhook callbacks
//!
//! [`Engine`] wires these together over a [`ContainerRuntime`]; the Docker
//! implementation lives in [`runtime::docker`].

pub mod command;
pub mod config;
pub mod constraints;
pub mod engine;
pub mod errors;
pub mod executor;
pub mod language;
pub mod notifier;
pub mod pool;
pub mod runtime;
pub mod scheduler;
pub mod status;
pub mod submission;

pub use config::{load_config, ConfigLoader, EngineConfig};
pub use constraints::{ConstraintCompiler, ConstraintOverrides, ConstraintSet, FileSystemAccess};
pub use engine::{Engine, EngineBuilder};
pub use errors::{RuntimeError, SandpitError};
pub use executor::{ExecutionRequest, ExecutionResult, Orchestrator};
pub use language::{LanguageDescriptor, LanguageRegistry, StaticLanguageRegistry};
pub use notifier::{Notifier, WebhookNotifier};
pub use pool::{Pool, PoolStatistics, RuntimeInstance};
pub use runtime::{ContainerRuntime, DockerRuntime};
pub use scheduler::{JobStatus, QueueStatistics, Scheduler};
pub use status::{RuntimeErrorKind, Status};
pub use submission::{
    InMemorySubmissionStore, Payload, Submission, SubmissionRequest, SubmissionStore,
    SubmissionView,
};

#[cfg(test)]
pub mod test_utils;
