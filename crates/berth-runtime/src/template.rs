use crate::RuntimeError;
use berth_schema::DependencyRef;
use std::collections::BTreeMap;

const OPEN: &str = "{{";
const CLOSE: &str = "}}";

/// Output of template resolution.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Resolution {
    pub values: BTreeMap<String, String>,
    /// Objects referenced by placeholders, one entry per `(group, id)`.
    pub dependencies: Vec<DependencyRef>,
}

/// Substitutes `{{kind.group.id.key}}` placeholders in configuration values.
pub trait TemplateResolver: Send + Sync {
    fn resolve(&self, values: &BTreeMap<String, String>) -> Result<Resolution, RuntimeError>;
}

/// Resolver backed by an in-memory table of `kind.group.id.key -> value`.
#[derive(Debug, Clone, Default)]
pub struct StaticResolver {
    entries: BTreeMap<String, String>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, path: &str, value: &str) -> Self {
        self.insert(path, value);
        self
    }

    pub fn insert(&mut self, path: &str, value: &str) {
        self.entries.insert(path.to_owned(), value.to_owned());
    }

    fn render(
        &self,
        input: &str,
        dependencies: &mut Vec<DependencyRef>,
    ) -> Result<String, RuntimeError> {
        let mut out = String::with_capacity(input.len());
        let mut rest = input;

        while let Some(start) = rest.find(OPEN) {
            out.push_str(&rest[..start]);
            let after_open = &rest[start + OPEN.len()..];
            let end = after_open.find(CLOSE).ok_or_else(|| {
                RuntimeError::Template(format!("unterminated placeholder in '{input}'"))
            })?;
            let path = after_open[..end].trim();

            let parts: Vec<&str> = path.split('.').collect();
            if parts.len() != 4 || parts.iter().any(|p| p.is_empty()) {
                return Err(RuntimeError::Template(format!(
                    "malformed placeholder '{path}', expected kind.group.id.key"
                )));
            }
            let value = self.entries.get(path).ok_or_else(|| {
                RuntimeError::Template(format!("unresolved placeholder '{path}'"))
            })?;
            out.push_str(value);

            let dep = DependencyRef::new(parts[1], parts[2]);
            if !dependencies.contains(&dep) {
                dependencies.push(dep);
            }

            rest = &after_open[end + CLOSE.len()..];
        }
        out.push_str(rest);
        Ok(out)
    }
}

impl TemplateResolver for StaticResolver {
    fn resolve(&self, values: &BTreeMap<String, String>) -> Result<Resolution, RuntimeError> {
        let mut resolution = Resolution::default();
        for (key, value) in values {
            let rendered = self.render(value, &mut resolution.dependencies)?;
            resolution.values.insert(key.clone(), rendered);
        }
        Ok(resolution)
    }
}
