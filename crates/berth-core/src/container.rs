use crate::status::{ContainerState, Status, StatusGraph};
use berth_runtime::{EngineHandle, EngineState, EngineStatus, NetworkAttachment};
use berth_schema::{definition_digest, ContainerDefinition, ContainerKey, OwnerRef};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

/// What the agent has learned about the engine-side container.
#[derive(Debug, Clone, Default)]
pub struct RuntimeState {
    pub engine: Option<EngineHandle>,
    pub engine_status: Option<EngineStatus>,
    pub networks: Vec<NetworkAttachment>,
    /// Configuration after template substitution.
    pub configuration: BTreeMap<String, String>,
    pub owner: Option<OwnerRef>,
}

impl RuntimeState {
    pub fn observe(&mut self, state: &EngineState) {
        self.engine_status = Some(state.status);
        self.networks.clone_from(&state.networks);
    }

    pub fn forget_engine(&mut self) {
        self.engine = None;
        self.engine_status = None;
        self.networks.clear();
    }
}

/// One managed replica, owned and mutated only by its watcher.
#[derive(Debug, Clone)]
pub struct ManagedContainer {
    pub key: ContainerKey,
    /// Private copy of the applied definition.
    pub definition: ContainerDefinition,
    pub digest: String,
    pub runtime: RuntimeState,
    pub status: Status,
    /// Readiness confirmed since the container was last started.
    pub readiness_passed: bool,
    pub reconciling: bool,
    pub last_error: Option<String>,
}

impl ManagedContainer {
    pub fn new(key: ContainerKey, definition: &ContainerDefinition, graph: Arc<StatusGraph>) -> Self {
        let runtime = RuntimeState {
            owner: definition.meta.owner.clone(),
            ..RuntimeState::default()
        };
        Self {
            key,
            definition: definition.clone(),
            digest: definition_digest(definition).to_string(),
            runtime,
            status: Status::new(graph),
            readiness_passed: false,
            reconciling: false,
            last_error: None,
        }
    }

    pub fn state(&self) -> ContainerState {
        self.status.state()
    }

    /// Swap in a newly applied definition.
    pub fn replace_definition(&mut self, definition: &ContainerDefinition) {
        self.definition = definition.clone();
        self.digest = definition_digest(definition).to_string();
        self.runtime.owner.clone_from(&definition.meta.owner);
    }

    pub fn snapshot(&self) -> ContainerSnapshot {
        ContainerSnapshot {
            key: self.key.clone(),
            state: self.state(),
            engine_id: self.runtime.engine.as_ref().map(|h| h.id.clone()),
            engine_status: self.runtime.engine_status,
            networks: self.runtime.networks.clone(),
            configuration: self.runtime.configuration.clone(),
            owner: self.runtime.owner.clone(),
            readiness_passed: self.readiness_passed,
            digest: self.digest.clone(),
            last_update: self.status.last_update(),
            last_error: self.last_error.clone(),
        }
    }
}

/// Read-only view of an entity, published by its watcher after every pass.
#[derive(Debug, Clone, Serialize)]
pub struct ContainerSnapshot {
    pub key: ContainerKey,
    pub state: ContainerState,
    pub engine_id: Option<String>,
    pub engine_status: Option<EngineStatus>,
    pub networks: Vec<NetworkAttachment>,
    pub configuration: BTreeMap<String, String>,
    pub owner: Option<OwnerRef>,
    pub readiness_passed: bool,
    pub digest: String,
    pub last_update: DateTime<Utc>,
    pub last_error: Option<String>,
}

impl ContainerSnapshot {
    /// Up and past its readiness checks. Wildcard dependencies wait for this.
    pub fn is_ready(&self) -> bool {
        self.readiness_passed && self.state.is_converged()
    }

    /// Nothing is left for the watcher to do until something external
    /// happens. A running entity counts only once readiness has passed.
    pub fn is_settled(&self) -> bool {
        match self.state {
            ContainerState::Running => self.readiness_passed,
            state => state.is_settled(),
        }
    }
}
