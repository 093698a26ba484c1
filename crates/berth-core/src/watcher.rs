//! The per-entity reconcile loop.
//!
//! A watcher owns its `ManagedContainer` outright: it is the only code that
//! changes the entity's state or runtime data. Everything else (the event
//! listener, probe tasks, the agent) talks to it through its wake channel and
//! reads the snapshot it publishes after every step.

use crate::config::AgentConfig;
use crate::container::{ContainerSnapshot, ManagedContainer};
use crate::dependency::DependencyResolver;
use crate::probe::ProbeReport;
use crate::readiness::ReadinessProber;
use crate::registry::{ContainerHandle, Registry};
use crate::status::{ContainerState, StatusGraph};
use crate::CoreError;
use berth_runtime::{
    ContainerEngine, EngineAction, EngineState, EngineStatus, RunSpec, RuntimeError,
    TemplateResolver,
};
use berth_schema::{ContainerDefinition, ContainerKey};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, info_span, warn, Instrument};

const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Messages accepted on a watcher's wake channel.
#[derive(Debug)]
pub enum WatcherSignal {
    /// Run one reconcile pass now.
    Reconcile,
    /// The engine reported `action` for `container_id`.
    Engine {
        container_id: String,
        action: EngineAction,
    },
    /// A changed definition was applied to this entity's family.
    SpecUpdated(Box<ContainerDefinition>),
    Delete,
    /// Leave backoff or a failed state and start from scratch.
    Restart,
    Dependencies { pass: u64, report: ProbeReport },
    Readiness { pass: u64, report: ProbeReport },
}

/// Collaborators shared by every watcher of one agent.
pub struct WatcherContext {
    pub config: AgentConfig,
    pub graph: Arc<StatusGraph>,
    pub registry: Arc<Registry>,
    pub engine: Arc<dyn ContainerEngine>,
    pub templates: Arc<dyn TemplateResolver>,
    pub dependencies: DependencyResolver,
    pub readiness: ReadinessProber,
    pub shutdown: watch::Receiver<bool>,
}

impl WatcherContext {
    /// Run a blocking engine call off the async workers, bounded by the
    /// configured engine call timeout.
    pub async fn engine_call<T, F>(&self, what: &str, call: F) -> Result<T, CoreError>
    where
        T: Send + 'static,
        F: FnOnce(&dyn ContainerEngine) -> Result<T, RuntimeError> + Send + 'static,
    {
        let engine = Arc::clone(&self.engine);
        let limit = self.config.engine_call_timeout();
        let task = tokio::task::spawn_blocking(move || call(engine.as_ref()));
        match tokio::time::timeout(limit, task).await {
            Ok(Ok(result)) => result.map_err(CoreError::from),
            Ok(Err(e)) => Err(CoreError::Task(e.to_string())),
            Err(_) => Err(CoreError::Timeout(format!(
                "engine {what} did not return within {limit:?}"
            ))),
        }
    }
}

pub struct Watcher {
    ctx: Arc<WatcherContext>,
    container: ManagedContainer,
    handle: Arc<ContainerHandle>,
    wake_tx: mpsc::UnboundedSender<WatcherSignal>,
    wake_rx: mpsc::UnboundedReceiver<WatcherSignal>,
    published: watch::Sender<ContainerSnapshot>,
    /// Bumped whenever a probe run starts; results from older runs are dropped.
    pass: u64,
    /// A new definition arrived while readiness was in flight.
    drift_pending: bool,
    finished: bool,
}

impl Watcher {
    pub fn new(
        ctx: Arc<WatcherContext>,
        key: ContainerKey,
        definition: &ContainerDefinition,
    ) -> Self {
        let container = ManagedContainer::new(key.clone(), definition, Arc::clone(&ctx.graph));
        let (published, status_rx) = watch::channel(container.snapshot());
        let (wake_tx, wake_rx) = mpsc::unbounded_channel();
        let handle = Arc::new(ContainerHandle::new(key, status_rx, wake_tx.clone()));
        Self {
            ctx,
            container,
            handle,
            wake_tx,
            wake_rx,
            published,
            pass: 0,
            drift_pending: false,
            finished: false,
        }
    }

    /// The registry entry for this watcher's entity.
    pub fn handle(&self) -> &Arc<ContainerHandle> {
        &self.handle
    }

    pub fn spawn(self) -> JoinHandle<()> {
        let key = &self.container.key;
        let span = info_span!("watcher", group = %key.group, container = %key.container);
        tokio::spawn(self.run().instrument(span))
    }

    pub async fn run(mut self) {
        let tick = self.ctx.config.tick_interval();
        let mut ticker = tokio::time::interval_at(Instant::now() + tick, tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut shutdown = self.ctx.shutdown.clone();

        debug!("watcher started");
        self.requeue();
        while !self.finished {
            if *shutdown.borrow_and_update() {
                debug!("agent shutting down");
                break;
            }
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                Some(signal) = self.wake_rx.recv() => self.handle_signal(signal).await,
                _ = ticker.tick() => {
                    if !self.container.reconciling {
                        self.reconcile_once().await;
                    }
                }
            }
        }

        self.ctx.registry.remove(&self.handle);
        debug!("watcher stopped");
    }

    fn requeue(&self) {
        // The receiver lives in `self`, so this cannot fail while we run.
        let _ = self.wake_tx.send(WatcherSignal::Reconcile);
    }

    fn publish(&self) {
        self.published.send_replace(self.container.snapshot());
    }

    fn transition(&mut self, to: ContainerState) -> bool {
        let from = self.container.state();
        match self.container.status.transition(to) {
            Ok(()) => {
                debug!("{from} -> {to}");
                self.publish();
                true
            }
            Err(e) => {
                error!("{e}");
                false
            }
        }
    }

    fn transition_and_requeue(&mut self, to: ContainerState) {
        if self.transition(to) {
            self.requeue();
        }
    }

    fn fail(&mut self, to: ContainerState, reason: String) {
        warn!("{reason}");
        self.container.last_error = Some(reason);
        self.transition_and_requeue(to);
    }

    fn reset_backoff(&self) {
        let key = &self.container.key;
        self.ctx.registry.backoff_reset(&key.group, &key.container);
    }

    async fn handle_signal(&mut self, signal: WatcherSignal) {
        match signal {
            WatcherSignal::Reconcile => self.reconcile_once().await,
            WatcherSignal::Engine {
                container_id,
                action,
            } => self.on_engine_event(&container_id, action).await,
            WatcherSignal::SpecUpdated(definition) => self.on_spec_updated(&definition),
            WatcherSignal::Delete => self.on_delete(),
            WatcherSignal::Restart => self.on_restart().await,
            WatcherSignal::Dependencies { pass, report } => self.on_dependencies(pass, &report),
            WatcherSignal::Readiness { pass, report } => self.on_readiness(pass, &report),
        }
        self.publish();
    }

    async fn reconcile_once(&mut self) {
        if self.container.reconciling {
            return;
        }
        self.container.reconciling = true;

        match self.container.state() {
            ContainerState::Created => self.start_dependencies(),
            ContainerState::DependsSolved => self.start_container().await,
            ContainerState::DependsFailed => {
                warn!("dependencies failed, treating container as dead");
                self.transition_and_requeue(ContainerState::Dead);
            }
            ContainerState::ReadinessCheck => self.check_still_running().await,
            ContainerState::ReadinessFailed => self.stop_unready().await,
            ContainerState::ReadinessReady => self.confirm_running().await,
            ContainerState::Drifted => self.redeploy().await,
            ContainerState::Reconciling => self.transition_and_requeue(ContainerState::Created),
            ContainerState::Dead => self.recover_dead().await,
            // Terminal: retried on every tick until the engine delete succeeds.
            ContainerState::PendingDelete => self.delete().await,
            ContainerState::DependsSolving
            | ContainerState::Running
            | ContainerState::Killed
            | ContainerState::Backoff
            | ContainerState::InvalidConfiguration => {}
        }

        self.container.reconciling = false;
        self.publish();
    }

    fn start_dependencies(&mut self) {
        if !self.transition(ContainerState::DependsSolving) {
            return;
        }
        self.pass += 1;
        let pass = self.pass;
        let resolver = self.ctx.dependencies.clone();
        let dependencies = self.container.definition.spec.dependencies.clone();
        let wake = self.wake_tx.clone();
        tokio::spawn(async move {
            let report = resolver.resolve(&dependencies).await;
            let _ = wake.send(WatcherSignal::Dependencies { pass, report });
        });
    }

    fn start_readiness(&mut self) {
        if !self.transition(ContainerState::ReadinessCheck) {
            return;
        }
        self.pass += 1;
        let pass = self.pass;
        let prober = self.ctx.readiness.clone();
        let checks = self.container.definition.spec.readiness.clone();
        let wake = self.wake_tx.clone();
        tokio::spawn(async move {
            let report = prober.probe(&checks).await;
            let _ = wake.send(WatcherSignal::Readiness { pass, report });
        });
    }

    async fn start_container(&mut self) {
        let definition = &self.container.definition;
        let prepared = self
            .ctx
            .templates
            .resolve(&definition.env_map())
            .and_then(|env| {
                let configuration = self.ctx.templates.resolve(&definition.spec.configuration)?;
                Ok((env, configuration))
            });
        let (env, configuration) = match prepared {
            Ok(resolved) => resolved,
            Err(e) => {
                let reason = format!("configuration rejected: {e}");
                self.fail(ContainerState::InvalidConfiguration, reason);
                return;
            }
        };
        for dep in env.dependencies.iter().chain(&configuration.dependencies) {
            debug!("configuration references {dep}");
        }

        let spec = RunSpec::new(
            &self.container.key,
            definition,
            env.values,
            configuration.values.clone(),
        );
        self.container.runtime.configuration = configuration.values;
        self.container.readiness_passed = false;

        match self.ctx.engine_call("run", move |engine| engine.run(&spec)).await {
            Ok(handle) => {
                info!(engine_id = %handle.id, "container started");
                self.container.runtime.engine = Some(handle);
                self.container.last_error = None;
                if let Err(e) = self.observe().await {
                    debug!("inspect after start failed: {e}");
                }
                if self.transition(ContainerState::Running) {
                    self.start_readiness();
                }
            }
            Err(e) => self.fail(ContainerState::Dead, format!("run failed: {e}")),
        }
    }

    async fn check_still_running(&mut self) {
        match self.observe().await {
            Ok(Some(state)) if state.status.is_running() => {}
            Ok(_) => self.fail(
                ContainerState::Dead,
                "container stopped during readiness checks".to_owned(),
            ),
            Err(e) => warn!("inspect failed: {e}"),
        }
    }

    async fn stop_unready(&mut self) {
        if let Err(e) = self.stop_and_wait().await {
            warn!("stopping unready container failed: {e}");
        }
        self.transition_and_requeue(ContainerState::Dead);
    }

    async fn confirm_running(&mut self) {
        match self.observe().await {
            Ok(Some(state)) if state.status.is_running() => {
                // Cleared first so nobody observes Running with a stale count.
                self.reset_backoff();
                if self.transition(ContainerState::Running) {
                    info!("container running");
                    if std::mem::take(&mut self.drift_pending) {
                        self.transition_and_requeue(ContainerState::Drifted);
                    }
                }
            }
            Ok(_) => self.fail(
                ContainerState::Dead,
                "container exited before it was confirmed running".to_owned(),
            ),
            Err(e) => warn!("inspect failed: {e}"),
        }
    }

    async fn redeploy(&mut self) {
        if !self.transition(ContainerState::Reconciling) {
            return;
        }
        match self.teardown().await {
            Ok(()) => {
                self.reset_backoff();
                self.transition_and_requeue(ContainerState::Created);
            }
            Err(e) => self.fail(ContainerState::Dead, format!("redeploy cleanup failed: {e}")),
        }
    }

    async fn recover_dead(&mut self) {
        let exited = match self.observe().await {
            Ok(Some(state)) => state.status.has_exited(),
            Ok(None) => true,
            Err(e) => {
                warn!("inspect failed: {e}");
                return;
            }
        };
        if !exited {
            debug!("waiting for container to exit");
            return;
        }
        if let Err(e) = self.remove_container().await {
            warn!("removing dead container failed: {e}");
            return;
        }

        let key = &self.container.key;
        let failures = self.ctx.registry.backoff_increment(&key.group, &key.container);
        if failures > self.ctx.config.backoff_limit {
            warn!(failures, "crash loop detected, backing off");
            self.reset_backoff();
            self.transition(ContainerState::Backoff);
            return;
        }
        debug!(failures, "recreating container");
        self.transition_and_requeue(ContainerState::Created);
    }

    /// Stop and delete the engine container. The entity leaves the registry
    /// only once the engine delete succeeded; a failed stop does not prevent
    /// the delete attempt.
    async fn delete(&mut self) {
        if let Err(e) = self.stop_and_wait().await {
            warn!("stopping container before delete failed: {e}");
        }
        if let Err(e) = self.remove_container().await {
            warn!("engine delete failed, will retry: {e}");
            return;
        }
        self.ctx.registry.remove(&self.handle);
        self.finished = true;
        info!("container removed");
    }

    async fn on_engine_event(&mut self, container_id: &str, action: EngineAction) {
        let state = self.container.state();
        let current = self.container.runtime.engine.as_ref().map(|h| h.id.as_str());
        if current != Some(container_id) {
            debug!("ignoring {action} for previous container {container_id}");
            return;
        }
        if matches!(
            state,
            ContainerState::PendingDelete | ContainerState::Reconciling
        ) {
            return;
        }

        match action {
            EngineAction::Die
                if matches!(
                    state,
                    ContainerState::Running
                        | ContainerState::ReadinessReady
                        | ContainerState::ReadinessCheck
                        | ContainerState::Killed
                ) =>
            {
                self.container.runtime.engine_status = Some(EngineStatus::Exited);
                self.fail(ContainerState::Dead, "container died".to_owned());
            }
            EngineAction::Kill
                if matches!(
                    state,
                    ContainerState::Running
                        | ContainerState::ReadinessReady
                        | ContainerState::ReadinessCheck
                ) =>
            {
                warn!("container killed");
                self.transition(ContainerState::Killed);
            }
            EngineAction::Connect | EngineAction::Disconnect => {
                if let Err(e) = self.observe().await {
                    warn!("refreshing networks failed: {e}");
                }
            }
            other => debug!("engine event {other} in state {state}"),
        }
    }

    fn on_spec_updated(&mut self, definition: &ContainerDefinition) {
        if self.container.state() == ContainerState::PendingDelete {
            debug!("ignoring definition update while pending delete");
            return;
        }
        self.container.replace_definition(definition);
        info!(digest = %self.container.digest, "definition updated");

        match self.container.state() {
            ContainerState::Running | ContainerState::ReadinessReady => {
                self.transition_and_requeue(ContainerState::Drifted);
            }
            ContainerState::Backoff | ContainerState::InvalidConfiguration => {
                self.reset_backoff();
                self.transition_and_requeue(ContainerState::Drifted);
            }
            ContainerState::ReadinessCheck => self.drift_pending = true,
            // Not started yet, or about to be recreated: the next run picks up
            // the new definition.
            _ => {}
        }
    }

    fn on_delete(&mut self) {
        if self.container.state() != ContainerState::PendingDelete {
            self.transition_and_requeue(ContainerState::PendingDelete);
        }
    }

    async fn on_restart(&mut self) {
        let state = self.container.state();
        if !matches!(
            state,
            ContainerState::Backoff | ContainerState::Dead | ContainerState::InvalidConfiguration
        ) {
            info!("restart ignored in state {state}");
            return;
        }
        if let Err(e) = self.teardown().await {
            warn!("cleanup before restart failed: {e}");
        }
        self.reset_backoff();
        self.container.last_error = None;
        info!("restarting");
        self.transition_and_requeue(ContainerState::Created);
    }

    fn on_dependencies(&mut self, pass: u64, report: &ProbeReport) {
        if pass != self.pass || self.container.state() != ContainerState::DependsSolving {
            debug!("dropping stale dependency result");
            return;
        }
        match report.explain() {
            None => {
                self.container.last_error = None;
                self.transition_and_requeue(ContainerState::DependsSolved);
            }
            Some(reason) => self.fail(
                ContainerState::DependsFailed,
                format!("not all dependencies resolved: {reason}"),
            ),
        }
    }

    fn on_readiness(&mut self, pass: u64, report: &ProbeReport) {
        if pass != self.pass || self.container.state() != ContainerState::ReadinessCheck {
            debug!("dropping stale readiness result");
            return;
        }
        match report.explain() {
            None => {
                self.container.readiness_passed = true;
                self.transition_and_requeue(ContainerState::ReadinessReady);
            }
            Some(reason) => self.fail(
                ContainerState::ReadinessFailed,
                format!("readiness failed: {reason}"),
            ),
        }
    }

    /// Inspect the engine container, recording what was seen. `None` when
    /// there is no container. An unknown container reads as missing.
    async fn observe(&mut self) -> Result<Option<EngineState>, CoreError> {
        let Some(handle) = self.container.runtime.engine.clone() else {
            return Ok(None);
        };
        let state = match self
            .ctx
            .engine_call("inspect", move |engine| engine.get(&handle))
            .await
        {
            Ok(state) => state,
            Err(CoreError::Runtime(RuntimeError::ContainerNotFound(id))) => {
                EngineState::missing(&id)
            }
            Err(e) => return Err(e),
        };
        self.container.runtime.observe(&state);
        Ok(Some(state))
    }

    /// Stop the container if it is running and wait for it to exit.
    async fn stop_and_wait(&mut self) -> Result<(), CoreError> {
        let Some(handle) = self.container.runtime.engine.clone() else {
            return Ok(());
        };
        match self.observe().await? {
            Some(state) if state.status.is_running() => {}
            _ => return Ok(()),
        }

        let grace = self.ctx.config.stop_timeout();
        self.ctx
            .engine_call("stop", move |engine| engine.stop(&handle, grace))
            .await?;

        let limit = self.ctx.config.exit_wait_timeout();
        let deadline = Instant::now() + limit;
        loop {
            match self.observe().await? {
                Some(state) if !state.status.has_exited() => {}
                _ => return Ok(()),
            }
            if Instant::now() >= deadline {
                return Err(CoreError::Timeout(format!(
                    "container did not exit within {limit:?}"
                )));
            }
            tokio::time::sleep(EXIT_POLL_INTERVAL).await;
        }
    }

    /// Delete the engine container. An already missing container counts as
    /// deleted.
    async fn remove_container(&mut self) -> Result<(), CoreError> {
        let Some(handle) = self.container.runtime.engine.clone() else {
            return Ok(());
        };
        match self
            .ctx
            .engine_call("delete", move |engine| engine.delete(&handle))
            .await
        {
            Ok(()) | Err(CoreError::Runtime(RuntimeError::ContainerNotFound(_))) => {
                self.container.runtime.forget_engine();
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn teardown(&mut self) -> Result<(), CoreError> {
        self.stop_and_wait().await?;
        self.remove_container().await
    }
}
