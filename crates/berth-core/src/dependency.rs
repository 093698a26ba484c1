use crate::probe::{run_checks, Attempt, ProbeCheck, ProbeReport};
use crate::registry::Registry;
use berth_schema::DependencyRef;
use std::sync::Arc;
use std::time::Duration;

/// Decides whether an entity's declared dependencies are satisfied.
#[derive(Clone)]
pub struct DependencyResolver {
    registry: Arc<Registry>,
    retry_interval: Duration,
    default_timeout: Duration,
}

impl DependencyResolver {
    pub fn new(
        registry: Arc<Registry>,
        retry_interval: Duration,
        default_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            retry_interval,
            default_timeout,
        }
    }

    pub async fn resolve(&self, dependencies: &[DependencyRef]) -> ProbeReport {
        let checks = dependencies
            .iter()
            .map(|dep| {
                let registry = Arc::clone(&self.registry);
                let target = dep.clone();
                let timeout = dep.timeout_or(self.default_timeout);
                ProbeCheck::new(dep.to_string(), timeout, move || {
                    let attempt = check_once(&registry, &target);
                    Box::pin(async move { attempt })
                })
            })
            .collect();
        run_checks(checks, self.retry_interval).await
    }
}

/// One look at the registry for `dep`.
///
/// A wildcard needs every member of the group to be ready. A named dependency
/// only needs to be registered; its own readiness is not consulted.
pub fn check_once(registry: &Registry, dep: &DependencyRef) -> Attempt {
    let Some(members) = registry.find_group(&dep.group) else {
        return Attempt::Missing;
    };
    if members.is_empty() {
        return Attempt::Missing;
    }

    if dep.is_wildcard() {
        let waiting = members.iter().filter(|m| !m.snapshot().is_ready()).count();
        return if waiting == 0 {
            Attempt::Success
        } else {
            Attempt::Retry(format!(
                "{waiting} of {} members of {} not ready",
                members.len(),
                dep.group
            ))
        };
    }

    let present = members
        .iter()
        .any(|m| m.key().container == dep.name || m.key().name == dep.name);
    if present {
        Attempt::Success
    } else {
        Attempt::Missing
    }
}
