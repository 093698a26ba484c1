use crate::RuntimeError;
use berth_schema::{
    ContainerDefinition, ContainerKey, GeneratedName, Group, PortMapping, ResourceRef,
    VolumeMount,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

/// Engine label marking a container as managed by berth.
pub const LABEL_MANAGED: &str = "berth.managed";
/// Engine label carrying the container's group.
pub const LABEL_GROUP: &str = "berth.group";
/// Engine label carrying the container's generated name.
pub const LABEL_CONTAINER: &str = "berth.container";

/// Everything the engine needs to start one replica.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunSpec {
    pub key: ContainerKey,
    pub image: String,
    pub tag: String,
    pub networks: Vec<String>,
    pub ports: Vec<PortMapping>,
    pub env: BTreeMap<String, String>,
    pub volumes: Vec<VolumeMount>,
    pub capabilities: Vec<String>,
    pub resources: Vec<ResourceRef>,
    pub configuration: BTreeMap<String, String>,
    pub labels: BTreeMap<String, String>,
}

impl RunSpec {
    /// Build a run spec from a definition plus its already-resolved env and
    /// configuration. Management labels always override user labels.
    pub fn new(
        key: &ContainerKey,
        def: &ContainerDefinition,
        env: BTreeMap<String, String>,
        configuration: BTreeMap<String, String>,
    ) -> Self {
        let mut labels = def.meta.labels.clone();
        labels.insert(LABEL_MANAGED.to_owned(), "true".to_owned());
        labels.insert(LABEL_GROUP.to_owned(), key.group.to_string());
        labels.insert(LABEL_CONTAINER.to_owned(), key.container.to_string());

        Self {
            key: key.clone(),
            image: def.spec.image.clone(),
            tag: def.spec.tag.clone(),
            networks: def.spec.networks.clone(),
            ports: def.spec.ports.clone(),
            env,
            volumes: def.spec.volumes.clone(),
            capabilities: def.spec.capabilities.clone(),
            resources: def.spec.resources.clone(),
            configuration,
            labels,
        }
    }

    pub fn image_ref(&self) -> String {
        format!("{}:{}", self.image, self.tag)
    }
}

/// Opaque reference to a container created by the engine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct EngineHandle {
    pub id: String,
    pub name: GeneratedName,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EngineStatus {
    Created,
    Running,
    Exited,
    Dead,
    /// The engine no longer knows the container.
    Missing,
}

impl EngineStatus {
    pub fn is_running(self) -> bool {
        self == Self::Running
    }

    pub fn has_exited(self) -> bool {
        matches!(self, Self::Exited | Self::Dead | Self::Missing)
    }
}

impl fmt::Display for EngineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Running => write!(f, "running"),
            Self::Exited => write!(f, "exited"),
            Self::Dead => write!(f, "dead"),
            Self::Missing => write!(f, "missing"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NetworkAttachment {
    pub id: String,
    pub name: String,
    pub ip: String,
}

/// Observed engine-side state of one container.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EngineState {
    pub id: String,
    pub status: EngineStatus,
    pub exit_code: Option<i32>,
    pub networks: Vec<NetworkAttachment>,
}

impl EngineState {
    pub fn missing(id: &str) -> Self {
        Self {
            id: id.to_owned(),
            status: EngineStatus::Missing,
            exit_code: None,
            networks: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EngineAction {
    Start,
    Stop,
    Kill,
    Die,
    Connect,
    Disconnect,
}

impl fmt::Display for EngineAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Start => write!(f, "start"),
            Self::Stop => write!(f, "stop"),
            Self::Kill => write!(f, "kill"),
            Self::Die => write!(f, "die"),
            Self::Connect => write!(f, "connect"),
            Self::Disconnect => write!(f, "disconnect"),
        }
    }
}

/// One entry of the engine's event stream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EngineEvent {
    pub container_id: String,
    pub action: EngineAction,
    pub labels: BTreeMap<String, String>,
}

impl EngineEvent {
    /// Group and generated name of the container, if it is managed by berth.
    /// Foreign containers (no management label) yield `None`.
    pub fn managed_target(&self) -> Option<(Group, GeneratedName)> {
        if self.labels.get(LABEL_MANAGED).map(String::as_str) != Some("true") {
            return None;
        }
        let group = self.labels.get(LABEL_GROUP)?;
        let container = self.labels.get(LABEL_CONTAINER)?;
        Some((Group::new(group.as_str()), GeneratedName::new(container.as_str())))
    }
}

/// Driver for the local container engine.
///
/// Calls are blocking; async callers are expected to run them on a blocking
/// thread with their own deadline.
pub trait ContainerEngine: Send + Sync {
    fn name(&self) -> &str;

    /// Create and start a container for `spec`.
    fn run(&self, spec: &RunSpec) -> Result<EngineHandle, RuntimeError>;

    /// Inspect a container. Unknown containers yield
    /// [`RuntimeError::ContainerNotFound`].
    fn get(&self, handle: &EngineHandle) -> Result<EngineState, RuntimeError>;

    /// Stop gracefully, killing after `timeout`.
    fn stop(&self, handle: &EngineHandle, timeout: Duration) -> Result<(), RuntimeError>;

    fn delete(&self, handle: &EngineHandle) -> Result<(), RuntimeError>;

    /// Subscribe to the engine's container event stream.
    fn subscribe(&self) -> broadcast::Receiver<EngineEvent>;
}

pub fn select_engine(name: &str) -> Result<Arc<dyn ContainerEngine>, RuntimeError> {
    match name {
        "mock" => Ok(Arc::new(crate::mock::MockEngine::new())),
        other => Err(RuntimeError::EngineUnavailable(other.to_owned())),
    }
}
