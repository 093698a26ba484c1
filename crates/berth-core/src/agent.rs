use crate::config::AgentConfig;
use crate::container::ContainerSnapshot;
use crate::dependency::DependencyResolver;
use crate::events;
use crate::readiness::ReadinessProber;
use crate::registry::{ContainerHandle, Registry};
use crate::replicas::{self, ReplicaPlan};
use crate::status::{ContainerState, StatusGraph};
use crate::watcher::{Watcher, WatcherContext, WatcherSignal};
use crate::CoreError;
use berth_runtime::{
    select_engine, ContainerEngine, HttpOperatorClient, OperatorClient, StaticResolver,
    TemplateResolver,
};
use berth_schema::{Changelog, ContainerDefinition, ContainerKey, ContainerName, Group};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

const SETTLE_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// What a call to [`Agent::apply`] changed.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ApplyOutcome {
    pub changelog: Changelog,
    pub plan: ReplicaPlan,
    pub created: Vec<ContainerKey>,
    pub updated: Vec<ContainerKey>,
    pub destroyed: Vec<ContainerKey>,
}

impl ApplyOutcome {
    /// Keys whose watchers were started or woken by this apply.
    pub fn dispatched(&self) -> Vec<ContainerKey> {
        self.created
            .iter()
            .chain(&self.updated)
            .cloned()
            .collect()
    }

    pub fn is_noop(&self) -> bool {
        self.created.is_empty() && self.updated.is_empty() && self.destroyed.is_empty()
    }
}

/// Node-local agent: accepts definitions and keeps their replicas converged.
///
/// Methods that start watchers must be called from inside a Tokio runtime.
pub struct Agent {
    ctx: Arc<WatcherContext>,
    applied: Mutex<BTreeMap<(Group, ContainerName), ContainerDefinition>>,
    shutdown: watch::Sender<bool>,
}

impl Agent {
    pub fn new(
        config: AgentConfig,
        engine: Arc<dyn ContainerEngine>,
        templates: Arc<dyn TemplateResolver>,
        operators: Arc<dyn OperatorClient>,
    ) -> Self {
        let registry = Arc::new(Registry::new());
        let dependencies = DependencyResolver::new(
            Arc::clone(&registry),
            config.probe_retry_interval(),
            config.default_probe_timeout(),
        );
        let readiness = ReadinessProber::new(
            operators,
            Arc::clone(&templates),
            config.probe_retry_interval(),
            config.default_probe_timeout(),
        );
        let (shutdown, shutdown_rx) = watch::channel(false);
        let ctx = WatcherContext {
            config,
            graph: Arc::new(StatusGraph::new()),
            registry,
            engine,
            templates,
            dependencies,
            readiness,
            shutdown: shutdown_rx,
        };
        Self {
            ctx: Arc::new(ctx),
            applied: Mutex::new(BTreeMap::new()),
            shutdown,
        }
    }

    /// Build an agent from configuration alone: the named engine, an empty
    /// template table, and an HTTP operator client.
    pub fn from_config(config: AgentConfig) -> Result<Self, CoreError> {
        config.validate()?;
        let engine = select_engine(&config.engine)?;
        let operators = Arc::new(HttpOperatorClient::new(config.operator_config()));
        Ok(Self::new(
            config,
            engine,
            Arc::new(StaticResolver::new()),
            operators,
        ))
    }

    pub fn config(&self) -> &AgentConfig {
        &self.ctx.config
    }

    pub fn engine(&self) -> &Arc<dyn ContainerEngine> {
        &self.ctx.engine
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.ctx.registry
    }

    fn applied(&self) -> MutexGuard<'_, BTreeMap<(Group, ContainerName), ContainerDefinition>> {
        self.applied.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Apply a definition: diff it against the previous one for the same
    /// group and name, then create, update, and destroy replicas to match.
    pub fn apply(&self, definition: ContainerDefinition) -> Result<ApplyOutcome, CoreError> {
        definition.validate()?;
        let group = definition.group().clone();
        let name = definition.name().clone();

        let mut applied = self.applied();
        let previous = applied.get(&(group.clone(), name.clone()));
        let changelog = Changelog::between(previous, &definition);
        let highest = self.ctx.registry.highest_index(&group, &name);
        let plan = replicas::plan(definition.replicas(), highest, &changelog);
        debug!(
            "apply {group}/{name}: changed {:?}, plan {plan:?}",
            changelog.changed
        );

        let mut outcome = ApplyOutcome {
            changelog,
            ..ApplyOutcome::default()
        };

        for key in plan.create_keys(&group, &name) {
            self.start_watcher(key.clone(), &definition);
            outcome.created.push(key);
        }
        for key in plan.destroy_keys(&group, &name) {
            if let Some(handle) = self.ctx.registry.get(&key.group, &key.container) {
                handle.wake(WatcherSignal::Delete);
                outcome.destroyed.push(key);
            }
        }
        for key in plan.update_keys(&group, &name) {
            if let Some(handle) = self.ctx.registry.get(&key.group, &key.container) {
                handle.wake(WatcherSignal::SpecUpdated(Box::new(definition.clone())));
                outcome.updated.push(key);
            }
        }

        info!(
            "applied {group}/{name}: {} created, {} updated, {} destroyed",
            outcome.created.len(),
            outcome.updated.len(),
            outcome.destroyed.len()
        );
        outcome.plan = plan;
        applied.insert((group, name), definition);
        Ok(outcome)
    }

    fn start_watcher(&self, key: ContainerKey, definition: &ContainerDefinition) {
        let watcher = Watcher::new(Arc::clone(&self.ctx), key, definition);
        if let Some(previous) = self.ctx.registry.insert(Arc::clone(watcher.handle())) {
            debug!("{} replaces an entity still being deleted", previous.key());
        }
        watcher.spawn();
    }

    /// Mark every replica of `group`/`name` for deletion.
    pub fn remove(&self, group: &str, name: &str) -> Result<Vec<ContainerKey>, CoreError> {
        self.applied()
            .remove(&(Group::new(group), ContainerName::new(name)));
        let family = self.ctx.registry.family(group, name);
        if family.is_empty() {
            return Err(CoreError::NotFound(format!("{group}/{name}")));
        }
        let keys = family
            .iter()
            .filter(|handle| handle.wake(WatcherSignal::Delete))
            .map(|handle| handle.key().clone())
            .collect();
        info!("removing {group}/{name}");
        Ok(keys)
    }

    /// Operator restart of one entity. Only backoff, dead, and
    /// invalid-configuration entities react; the counter is reset.
    pub fn restart(&self, group: &str, container: &str) -> Result<(), CoreError> {
        let handle = self.handle(group, container)?;
        handle.wake(WatcherSignal::Restart);
        Ok(())
    }

    /// Mark every entity for deletion. Returns how many were signalled.
    pub fn drain(&self) -> usize {
        self.applied().clear();
        let handles = self.ctx.registry.all();
        let count = handles
            .iter()
            .filter(|handle| handle.wake(WatcherSignal::Delete))
            .count();
        info!("draining {count} containers");
        count
    }

    fn handle(&self, group: &str, container: &str) -> Result<Arc<ContainerHandle>, CoreError> {
        self.ctx
            .registry
            .get(group, container)
            .ok_or_else(|| CoreError::NotFound(format!("{group}/{container}")))
    }

    pub fn snapshot(&self, group: &str, container: &str) -> Option<ContainerSnapshot> {
        self.ctx
            .registry
            .get(group, container)
            .map(|handle| handle.snapshot())
    }

    /// Snapshots of every registered entity, ordered by group and name.
    pub fn list(&self) -> Vec<ContainerSnapshot> {
        let mut snapshots: Vec<_> = self
            .ctx
            .registry
            .all()
            .iter()
            .map(|handle| handle.snapshot())
            .collect();
        snapshots.sort_by(|a, b| a.key.cmp(&b.key));
        snapshots
    }

    pub fn state(&self, group: &str, container: &str) -> Option<ContainerState> {
        self.ctx
            .registry
            .get(group, container)
            .map(|handle| handle.state())
    }

    /// Wait until the entity reports `state`. `Running` counts only once
    /// readiness has passed.
    pub async fn wait_for_state(
        &self,
        group: &str,
        container: &str,
        state: ContainerState,
        timeout: Duration,
    ) -> Result<ContainerSnapshot, CoreError> {
        let handle = self.handle(group, container)?;
        let mut status = handle.subscribe();
        let reached_state = |s: &ContainerSnapshot| {
            s.state == state && (state != ContainerState::Running || s.readiness_passed)
        };
        let reached = tokio::time::timeout(timeout, status.wait_for(reached_state))
            .await
            .map(|waited| waited.map(|snapshot| snapshot.clone()));
        match reached {
            Ok(Ok(snapshot)) => Ok(snapshot),
            Ok(Err(_)) => Err(CoreError::NotFound(format!(
                "{group}/{container} was removed while waiting for {state}"
            ))),
            Err(_) => Err(CoreError::Timeout(format!(
                "{group}/{container} did not reach {state} within {timeout:?} (now {})",
                handle.state()
            ))),
        }
    }

    /// Wait until the entity's watcher has exited and it left the registry.
    pub async fn wait_for_removal(
        &self,
        group: &str,
        container: &str,
        timeout: Duration,
    ) -> Result<(), CoreError> {
        let Some(handle) = self.ctx.registry.get(group, container) else {
            return Ok(());
        };
        let mut status = handle.subscribe();
        drop(handle);
        let closed = async {
            while status.changed().await.is_ok() {}
        };
        tokio::time::timeout(timeout, closed).await.map_err(|_| {
            CoreError::Timeout(format!(
                "{group}/{container} still registered after {timeout:?}"
            ))
        })
    }

    /// Wait until every registered entity is settled.
    pub async fn wait_until_settled(&self, timeout: Duration) -> Result<(), CoreError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let pending: Vec<String> = self
                .list()
                .iter()
                .filter(|s| !s.is_settled())
                .map(|s| format!("{} ({})", s.key, s.state))
                .collect();
            if pending.is_empty() {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(CoreError::Timeout(format!(
                    "not settled after {timeout:?}: {}",
                    pending.join(", ")
                )));
            }
            tokio::time::sleep(SETTLE_POLL_INTERVAL).await;
        }
    }

    /// Start forwarding engine events to watchers.
    pub fn spawn_event_listener(&self) -> JoinHandle<()> {
        events::spawn_event_listener(
            self.ctx.engine.as_ref(),
            Arc::clone(&self.ctx.registry),
            self.shutdown.subscribe(),
        )
    }

    /// Stop every watcher and the event listener. Engine containers are left
    /// as they are.
    pub fn shutdown(&self) {
        info!("shutting down agent");
        self.shutdown.send_replace(true);
    }
}

impl Drop for Agent {
    fn drop(&mut self) {
        self.shutdown.send_replace(true);
    }
}
