//! Container definitions, identifiers, digests, and changelogs for berth.
//!
//! This crate defines the schema layer: TOML/JSON container definitions
//! (`ContainerDefinition`) with validation, identifier newtypes and generated
//! replica names, content digests used for drift detection
//! (`definition_digest`), and field-level changelogs that tell a replica-count
//! change apart from a real spec change (`Changelog`).

pub mod changelog;
pub mod definition;
pub mod identity;
pub mod types;

pub use changelog::{Changelog, REPLICAS_FIELD};
pub use definition::{
    parse_definition_file, parse_definition_str, parse_timeout, ContainerDefinition,
    ContainerSpec, DefinitionError, DependencyRef, Meta, OwnerRef, PortMapping, ReadinessCheck,
    ResourceRef, VolumeMount, DEFAULT_PROBE_TIMEOUT, WILDCARD,
};
pub use identity::{definition_digest, DefinitionDigest};
pub use types::{generated_name, ContainerKey, ContainerName, GeneratedName, Group};
