//! Engine contracts and external collaborators for berth.
//!
//! This crate defines the blocking `ContainerEngine` driver trait with its
//! in-memory `MockEngine`, the `TemplateResolver` used to render configuration
//! placeholders, and the `OperatorClient` that answers readiness checks over
//! HTTP.

pub mod engine;
pub mod mock;
pub mod operator;
pub mod template;

pub use engine::{
    select_engine, ContainerEngine, EngineAction, EngineEvent, EngineHandle, EngineState,
    EngineStatus, NetworkAttachment, RunSpec, LABEL_CONTAINER, LABEL_GROUP, LABEL_MANAGED,
};
pub use mock::{CallCounts, MockEngine};
pub use operator::{HttpOperatorClient, OperatorClient, OperatorConfig};
pub use template::{Resolution, StaticResolver, TemplateResolver};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("engine '{0}' is not available on this system")]
    EngineUnavailable(String),
    #[error("container '{0}' not found")]
    ContainerNotFound(String),
    #[error("engine call failed: {0}")]
    ExecFailed(String),
    #[error("template resolution failed: {0}")]
    Template(String),
    #[error("operator call failed: {0}")]
    Operator(String),
    #[error("serialization error: {0}")]
    Serialization(String),
}
