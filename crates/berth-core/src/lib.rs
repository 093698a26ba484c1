//! Reconciliation engine for berth-managed containers.
//!
//! This crate ties definitions, the container engine, and the operator client
//! into the `Agent`: a per-container status state machine driven by one
//! watcher task per replica, with dependency resolution and readiness probing
//! fanned out over short-lived tasks, a replica planner that scales families
//! without recreating survivors, and a registry that doubles as the crash-loop
//! backoff tracker.

pub mod agent;
pub mod config;
pub mod container;
pub mod dependency;
pub mod events;
pub mod probe;
pub mod readiness;
pub mod registry;
pub mod replicas;
pub mod status;
pub mod watcher;

pub use agent::{Agent, ApplyOutcome};
pub use config::AgentConfig;
pub use container::{ContainerSnapshot, ManagedContainer, RuntimeState};
pub use dependency::DependencyResolver;
pub use probe::{Attempt, ProbeCheck, ProbeReport, Verdict};
pub use readiness::ReadinessProber;
pub use registry::{ContainerHandle, Registry};
pub use replicas::ReplicaPlan;
pub use status::{ContainerState, Status, StatusGraph};
pub use watcher::{Watcher, WatcherContext, WatcherSignal};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("definition error: {0}")]
    Definition(#[from] berth_schema::DefinitionError),
    #[error("runtime error: {0}")]
    Runtime(#[from] berth_runtime::RuntimeError),
    #[error("invalid state transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },
    #[error("container not found: {0}")]
    NotFound(String),
    #[error("timed out: {0}")]
    Timeout(String),
    #[error("background task failed: {0}")]
    Task(String),
    #[error("config error: {0}")]
    Config(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
