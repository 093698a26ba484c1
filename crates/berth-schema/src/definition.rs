use crate::types::{ContainerName, Group};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Probe timeout used when a dependency or readiness check declares none,
/// or declares one that does not parse.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(30);

/// Name that stands for "every member of the group" in a dependency.
pub const WILDCARD: &str = "*";

#[derive(Debug, Error)]
pub enum DefinitionError {
    #[error("failed to read definition file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse definition: {0}")]
    ParseToml(#[from] toml::de::Error),
    #[error("{0} must not be empty")]
    EmptyField(&'static str),
    #[error("invalid {field} '{value}': must match [a-zA-Z0-9_-]")]
    InvalidName { field: &'static str, value: String },
    #[error("spec.replicas must be at least 1")]
    NoReplicas,
    #[error("invalid port mapping '{0}': ports must be numeric")]
    InvalidPort(String),
    #[error("invalid env entry '{0}', expected KEY=VALUE")]
    InvalidEnv(String),
    #[error("invalid readiness check '{name}': {reason}")]
    InvalidReadiness { name: String, reason: String },
}

/// Declared desired state of one container family (all replicas of `group/name`).
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ContainerDefinition {
    pub meta: Meta,
    pub spec: ContainerSpec,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Meta {
    pub group: Group,
    pub name: ContainerName,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<OwnerRef>,
}

/// Reference to the object of another kind that owns this container.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct OwnerRef {
    pub kind: String,
    pub group: String,
    pub name: String,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ContainerSpec {
    pub image: String,
    #[serde(default = "default_tag")]
    pub tag: String,
    #[serde(default = "default_replicas")]
    pub replicas: u32,
    #[serde(default)]
    pub networks: Vec<String>,
    #[serde(default)]
    pub ports: Vec<PortMapping>,
    #[serde(default)]
    pub env: Vec<String>,
    #[serde(default)]
    pub volumes: Vec<VolumeMount>,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub dependencies: Vec<DependencyRef>,
    #[serde(default)]
    pub readiness: Vec<ReadinessCheck>,
    #[serde(default)]
    pub resources: Vec<ResourceRef>,
    #[serde(default)]
    pub configuration: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct PortMapping {
    pub container: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct VolumeMount {
    pub source: String,
    pub target: String,
    #[serde(default)]
    pub read_only: bool,
}

/// A prerequisite that must be present before a container is started.
///
/// `name == "*"` means every entity currently registered in `group`.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct DependencyRef {
    pub group: Group,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,
}

impl DependencyRef {
    pub fn new(group: impl Into<Group>, name: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            name: name.into(),
            timeout: None,
        }
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: &str) -> Self {
        self.timeout = Some(timeout.to_owned());
        self
    }

    pub fn is_wildcard(&self) -> bool {
        self.name == WILDCARD
    }

    /// The declared deadline, or `default` when none is declared.
    pub fn timeout_or(&self, default: Duration) -> Duration {
        declared_timeout(self.timeout.as_deref(), default)
    }
}

impl fmt::Display for DependencyRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.group, self.name)
    }
}

/// Readiness check delegated to an operator endpoint `{host}/{kind}/{operator}`.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ReadinessCheck {
    pub name: String,
    pub operator: String,
    #[serde(default = "default_readiness_kind")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,
    #[serde(default)]
    pub body: BTreeMap<String, String>,
}

impl ReadinessCheck {
    /// The declared deadline, or `default` when none is declared.
    pub fn timeout_or(&self, default: Duration) -> Duration {
        declared_timeout(self.timeout.as_deref(), default)
    }
}

/// Reference to a configuration resource mounted into the container.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ResourceRef {
    pub group: String,
    pub name: String,
    pub key: String,
    pub mount_point: String,
}

fn default_tag() -> String {
    "latest".to_owned()
}

fn default_replicas() -> u32 {
    1
}

fn default_readiness_kind() -> String {
    "readiness".to_owned()
}

/// Parse a timeout such as `500ms`, `30s`, `5m` or `1h`.
///
/// Absent or unparsable input yields [`DEFAULT_PROBE_TIMEOUT`].
fn declared_timeout(declared: Option<&str>, default: Duration) -> Duration {
    match declared {
        Some(_) => parse_timeout(declared),
        None => default,
    }
}

pub fn parse_timeout(input: Option<&str>) -> Duration {
    input
        .and_then(parse_duration)
        .unwrap_or(DEFAULT_PROBE_TIMEOUT)
}

fn parse_duration(input: &str) -> Option<Duration> {
    let input = input.trim();
    let split = input.find(|c: char| !c.is_ascii_digit())?;
    let (digits, unit) = input.split_at(split);
    let value: u64 = digits.parse().ok()?;
    let duration = match unit {
        "ms" => Duration::from_millis(value),
        "s" => Duration::from_secs(value),
        "m" => Duration::from_secs(value.checked_mul(60)?),
        "h" => Duration::from_secs(value.checked_mul(3600)?),
        _ => return None,
    };
    (!duration.is_zero()).then_some(duration)
}

fn validate_name(field: &'static str, value: &str) -> Result<(), DefinitionError> {
    if value.is_empty() {
        return Err(DefinitionError::EmptyField(field));
    }
    if !value
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
    {
        return Err(DefinitionError::InvalidName {
            field,
            value: value.to_owned(),
        });
    }
    Ok(())
}

fn is_port(value: &str) -> bool {
    value.parse::<u16>().is_ok_and(|p| p > 0)
}

impl ContainerDefinition {
    pub fn group(&self) -> &Group {
        &self.meta.group
    }

    pub fn name(&self) -> &ContainerName {
        &self.meta.name
    }

    pub fn replicas(&self) -> u32 {
        self.spec.replicas
    }

    pub fn validate(&self) -> Result<(), DefinitionError> {
        validate_name("meta.group", &self.meta.group)?;
        validate_name("meta.name", &self.meta.name)?;

        if self.spec.image.trim().is_empty() {
            return Err(DefinitionError::EmptyField("spec.image"));
        }
        if self.spec.tag.trim().is_empty() {
            return Err(DefinitionError::EmptyField("spec.tag"));
        }
        if self.spec.replicas == 0 {
            return Err(DefinitionError::NoReplicas);
        }

        for port in &self.spec.ports {
            let host_ok = match port.host.as_deref() {
                Some(host) => is_port(host),
                None => true,
            };
            if !is_port(&port.container) || !host_ok {
                let spec = match &port.host {
                    Some(host) => format!("{host}:{}", port.container),
                    None => port.container.clone(),
                };
                return Err(DefinitionError::InvalidPort(spec));
            }
        }

        for entry in &self.spec.env {
            match entry.split_once('=') {
                Some((key, _)) if !key.is_empty() => {}
                _ => return Err(DefinitionError::InvalidEnv(entry.clone())),
            }
        }

        for dep in &self.spec.dependencies {
            validate_name("dependency group", &dep.group)?;
            if !dep.is_wildcard() {
                validate_name("dependency name", &dep.name)?;
            }
        }

        for check in &self.spec.readiness {
            if check.name.is_empty() {
                return Err(DefinitionError::EmptyField("readiness.name"));
            }
            if check.operator.is_empty() {
                return Err(DefinitionError::InvalidReadiness {
                    name: check.name.clone(),
                    reason: "operator must not be empty".to_owned(),
                });
            }
            if check.kind.is_empty() || check.kind.contains('/') {
                return Err(DefinitionError::InvalidReadiness {
                    name: check.name.clone(),
                    reason: format!("invalid kind '{}'", check.kind),
                });
            }
        }

        Ok(())
    }

    /// Environment entries as a `KEY -> VALUE` map. Later duplicates win.
    pub fn env_map(&self) -> BTreeMap<String, String> {
        self.spec
            .env
            .iter()
            .filter_map(|entry| entry.split_once('='))
            .map(|(k, v)| (k.to_owned(), v.to_owned()))
            .collect()
    }
}

pub fn parse_definition_str(input: &str) -> Result<ContainerDefinition, DefinitionError> {
    Ok(toml::from_str(input)?)
}

pub fn parse_definition_file(path: impl AsRef<Path>) -> Result<ContainerDefinition, DefinitionError> {
    let content = fs::read_to_string(path)?;
    parse_definition_str(&content)
}
