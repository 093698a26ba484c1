use crate::definition::ContainerDefinition;
use serde::Serialize;
use serde_json::Value;

/// Field path that carries the replica count.
pub const REPLICAS_FIELD: &str = "spec.replicas";

/// Field-level difference between two versions of a container definition.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct Changelog {
    /// Dotted paths of every changed field, sorted. List entries are reported
    /// as the list itself (`spec.env`), not per element.
    pub changed: Vec<String>,
}

impl Changelog {
    /// Compare `old` against `new`. A missing `old` (first apply) is reported
    /// as a change of the whole definition.
    pub fn between(old: Option<&ContainerDefinition>, new: &ContainerDefinition) -> Self {
        let Some(old) = old else {
            return Self {
                changed: vec![String::new()],
            };
        };
        let old = serde_json::to_value(old).unwrap_or(Value::Null);
        let new = serde_json::to_value(new).unwrap_or(Value::Null);

        let mut changed = Vec::new();
        collect_changes("", &old, &new, &mut changed);
        changed.sort();
        changed.dedup();
        Self { changed }
    }

    pub fn is_empty(&self) -> bool {
        self.changed.is_empty()
    }

    /// True when the replica count is the only field that differs.
    pub fn is_replica_only(&self) -> bool {
        self.changed.len() == 1 && self.changed[0] == REPLICAS_FIELD
    }

    /// True when anything other than the replica count differs.
    pub fn has_spec_changes(&self) -> bool {
        self.changed.iter().any(|c| c != REPLICAS_FIELD)
    }
}

fn join(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        key.to_owned()
    } else {
        format!("{prefix}.{key}")
    }
}

fn collect_changes(path: &str, old: &Value, new: &Value, changed: &mut Vec<String>) {
    match (old, new) {
        (Value::Object(a), Value::Object(b)) => {
            for (key, av) in a {
                let child = join(path, key);
                match b.get(key) {
                    Some(bv) => collect_changes(&child, av, bv, changed),
                    None => changed.push(child),
                }
            }
            for key in b.keys().filter(|k| !a.contains_key(*k)) {
                changed.push(join(path, key));
            }
        }
        (a, b) if a != b => changed.push(path.to_owned()),
        _ => {}
    }
}
