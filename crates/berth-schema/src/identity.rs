use crate::definition::ContainerDefinition;
use serde::Serialize;
use std::fmt;

/// Content digest of a container definition.
///
/// Two definitions with the same digest describe the same desired state; the
/// core uses it to tell a re-apply of identical content from real drift.
#[derive(Debug, Clone, Serialize, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct DefinitionDigest(String);

impl DefinitionDigest {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 12 hex characters, for log lines.
    pub fn short(&self) -> &str {
        &self.0[..12]
    }
}

impl fmt::Display for DefinitionDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Blake3 over the canonical JSON form of the definition.
///
/// All maps in the definition are ordered, so field order in the source file
/// does not affect the digest. List order does.
pub fn definition_digest(def: &ContainerDefinition) -> DefinitionDigest {
    // Serializing plain data with string keys cannot fail.
    let json = serde_json::to_vec(def).unwrap_or_default();
    DefinitionDigest(blake3::hash(&json).to_hex().to_string())
}
