use berth_core::{Agent, AgentConfig, ContainerState, WatcherSignal};
use berth_runtime::{
    ContainerEngine, EngineEvent, EngineHandle, EngineState, MockEngine, OperatorClient, RunSpec,
    RuntimeError, StaticResolver,
};
use berth_schema::{parse_definition_str, ContainerDefinition, ContainerKey};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

const WAIT: Duration = Duration::from_secs(10);

struct AlwaysReady;

impl OperatorClient for AlwaysReady {
    fn call(
        &self,
        _kind: &str,
        _operator: &str,
        _body: &BTreeMap<String, String>,
    ) -> Result<u16, RuntimeError> {
        Ok(200)
    }
}

/// Mock engine whose stop and delete calls can be switched to fail.
struct StuckEngine {
    inner: MockEngine,
    stop_fails: AtomicBool,
    delete_fails: AtomicBool,
    delete_attempts: AtomicU32,
}

impl StuckEngine {
    fn new() -> Self {
        Self {
            inner: MockEngine::new(),
            stop_fails: AtomicBool::new(false),
            delete_fails: AtomicBool::new(false),
            delete_attempts: AtomicU32::new(0),
        }
    }

    fn jam(&self, stop: bool, delete: bool) {
        self.stop_fails.store(stop, Ordering::SeqCst);
        self.delete_fails.store(delete, Ordering::SeqCst);
    }

    fn delete_attempts(&self) -> u32 {
        self.delete_attempts.load(Ordering::SeqCst)
    }
}

impl ContainerEngine for StuckEngine {
    fn name(&self) -> &str {
        "stuck"
    }

    fn run(&self, spec: &RunSpec) -> Result<EngineHandle, RuntimeError> {
        self.inner.run(spec)
    }

    fn get(&self, handle: &EngineHandle) -> Result<EngineState, RuntimeError> {
        self.inner.get(handle)
    }

    fn stop(&self, handle: &EngineHandle, timeout: Duration) -> Result<(), RuntimeError> {
        if self.stop_fails.load(Ordering::SeqCst) {
            return Err(RuntimeError::ExecFailed("stop refused".to_owned()));
        }
        self.inner.stop(handle, timeout)
    }

    fn delete(&self, handle: &EngineHandle) -> Result<(), RuntimeError> {
        self.delete_attempts.fetch_add(1, Ordering::SeqCst);
        if self.delete_fails.load(Ordering::SeqCst) {
            return Err(RuntimeError::ExecFailed("delete refused".to_owned()));
        }
        self.inner.delete(handle)
    }

    fn subscribe(&self) -> tokio::sync::broadcast::Receiver<EngineEvent> {
        self.inner.subscribe()
    }
}

fn start_agent(
    config: AgentConfig,
    engine: Arc<dyn ContainerEngine>,
    templates: StaticResolver,
) -> Agent {
    let agent = Agent::new(config, engine, Arc::new(templates), Arc::new(AlwaysReady));
    agent.spawn_event_listener();
    agent
}

fn agent_with(config: AgentConfig, templates: StaticResolver) -> (Agent, Arc<MockEngine>) {
    let engine = Arc::new(MockEngine::new());
    let agent = start_agent(
        config,
        Arc::clone(&engine) as Arc<dyn ContainerEngine>,
        templates,
    );
    (agent, engine)
}

fn stuck_agent() -> (Agent, Arc<StuckEngine>) {
    let engine = Arc::new(StuckEngine::new());
    let agent = start_agent(
        AgentConfig::fast(),
        Arc::clone(&engine) as Arc<dyn ContainerEngine>,
        StaticResolver::new(),
    );
    (agent, engine)
}

fn agent() -> (Agent, Arc<MockEngine>) {
    agent_with(AgentConfig::fast(), StaticResolver::new())
}

fn nginx(replicas: u32, tag: &str) -> ContainerDefinition {
    parse_definition_str(&format!(
        r#"
[meta]
group = "web"
name = "nginx"

[spec]
image = "nginx"
tag = "{tag}"
replicas = {replicas}
networks = ["frontend"]
"#
    ))
    .unwrap()
}

fn keys(names: &[(&str, &str, u32)]) -> Vec<ContainerKey> {
    names
        .iter()
        .map(|(group, name, index)| ContainerKey::new(*group, *name, *index))
        .collect()
}

async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = Instant::now() + WAIT;
    while !check() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn replicas_start_and_become_ready() {
    let (agent, engine) = agent();

    let outcome = agent.apply(nginx(2, "1.25")).unwrap();
    assert_eq!(
        outcome.created,
        keys(&[("web", "nginx", 2), ("web", "nginx", 1)])
    );
    assert!(outcome.updated.is_empty());

    for container in ["web-nginx-1", "web-nginx-2"] {
        let snapshot = agent
            .wait_for_state("web", container, ContainerState::Running, WAIT)
            .await
            .unwrap();
        assert!(snapshot.is_ready());
        assert_eq!(snapshot.networks.len(), 1);
        assert!(snapshot.engine_id.is_some());
    }
    assert_eq!(engine.total_runs(), 2);
    assert_eq!(engine.running().len(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn scaling_up_leaves_existing_replicas_alone() {
    let (agent, engine) = agent();
    agent.apply(nginx(2, "1.25")).unwrap();
    agent.wait_until_settled(WAIT).await.unwrap();

    let outcome = agent.apply(nginx(3, "1.25")).unwrap();
    assert_eq!(outcome.created, keys(&[("web", "nginx", 3)]));
    assert!(outcome.updated.is_empty());
    assert!(outcome.changelog.is_replica_only());

    agent
        .wait_for_state("web", "web-nginx-3", ContainerState::Running, WAIT)
        .await
        .unwrap();
    assert_eq!(engine.total_runs(), 3);
    for container in ["web-nginx-1", "web-nginx-2"] {
        let calls = engine.calls(container);
        assert_eq!((calls.run, calls.stop, calls.delete), (1, 0, 0));
        assert_eq!(agent.state("web", container), Some(ContainerState::Running));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn scaling_down_removes_highest_indices_first() {
    let (agent, engine) = agent();
    agent.apply(nginx(3, "1.25")).unwrap();
    agent.wait_until_settled(WAIT).await.unwrap();

    let outcome = agent.apply(nginx(1, "1.25")).unwrap();
    assert_eq!(
        outcome.destroyed,
        keys(&[("web", "nginx", 3), ("web", "nginx", 2)])
    );

    for container in ["web-nginx-3", "web-nginx-2"] {
        agent.wait_for_removal("web", container, WAIT).await.unwrap();
        assert_eq!(agent.state("web", container), None);
        assert_eq!(engine.delete_count(container), 1);
    }
    assert_eq!(engine.calls("web-nginx-1").stop, 0);
    assert_eq!(agent.registry().len(), 1);
    assert_eq!(engine.container_count(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reapplying_identical_definition_is_a_noop() {
    let (agent, engine) = agent();
    agent.apply(nginx(1, "1.25")).unwrap();
    agent.wait_until_settled(WAIT).await.unwrap();

    let outcome = agent.apply(nginx(1, "1.25")).unwrap();
    assert!(outcome.is_noop());
    assert!(outcome.changelog.is_empty());

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(engine.total_runs(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn changed_definition_recreates_replicas() {
    let (agent, engine) = agent();
    agent.apply(nginx(1, "1.25")).unwrap();
    let before = agent
        .wait_for_state("web", "web-nginx-1", ContainerState::Running, WAIT)
        .await
        .unwrap();

    let outcome = agent.apply(nginx(1, "1.27")).unwrap();
    assert_eq!(outcome.updated, keys(&[("web", "nginx", 1)]));
    assert!(outcome.created.is_empty());
    assert!(outcome.changelog.has_spec_changes());

    eventually("second run", || engine.run_count("web-nginx-1") == 2).await;
    let after = agent
        .wait_for_state("web", "web-nginx-1", ContainerState::Running, WAIT)
        .await
        .unwrap();
    assert_ne!(after.digest, before.digest);
    assert_ne!(after.engine_id, before.engine_id);
    let calls = engine.calls("web-nginx-1");
    assert_eq!((calls.stop, calls.delete), (1, 1));
    assert_eq!(engine.container_count(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn crashed_container_is_recreated() {
    let (agent, engine) = agent();
    agent.apply(nginx(1, "1.25")).unwrap();
    agent
        .wait_for_state("web", "web-nginx-1", ContainerState::Running, WAIT)
        .await
        .unwrap();

    assert!(engine.crash("web-nginx-1"));
    eventually("recreation", || engine.run_count("web-nginx-1") == 2).await;
    agent
        .wait_for_state("web", "web-nginx-1", ContainerState::Running, WAIT)
        .await
        .unwrap();
    assert_eq!(engine.delete_count("web-nginx-1"), 1);
    assert_eq!(agent.registry().backoff_count("web", "web-nginx-1"), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn killed_container_is_recreated() {
    let (agent, engine) = agent();
    agent.apply(nginx(1, "1.25")).unwrap();
    agent
        .wait_for_state("web", "web-nginx-1", ContainerState::Running, WAIT)
        .await
        .unwrap();

    assert!(engine.kill("web-nginx-1"));
    eventually("recreation", || engine.run_count("web-nginx-1") == 2).await;
    agent
        .wait_for_state("web", "web-nginx-1", ContainerState::Running, WAIT)
        .await
        .unwrap();
    assert_eq!(engine.running().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failing_runs_end_in_backoff_until_restarted() {
    let (agent, engine) = agent();
    engine.fail_runs("web-nginx-1", 6);
    agent.apply(nginx(1, "1.25")).unwrap();

    let snapshot = agent
        .wait_for_state("web", "web-nginx-1", ContainerState::Backoff, WAIT)
        .await
        .unwrap();
    assert_eq!(engine.run_count("web-nginx-1"), 6);
    assert!(snapshot.last_error.unwrap().contains("run failed"));
    assert_eq!(agent.registry().backoff_count("web", "web-nginx-1"), 0);

    // Backoff is settled: nothing retries on its own.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(engine.run_count("web-nginx-1"), 6);

    agent.restart("web", "web-nginx-1").unwrap();
    agent
        .wait_for_state("web", "web-nginx-1", ContainerState::Running, WAIT)
        .await
        .unwrap();
    assert_eq!(engine.run_count("web-nginx-1"), 7);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn crash_loop_respects_backoff_limit() {
    let (agent, engine) = agent_with(
        AgentConfig::fast().with_backoff_limit(2),
        StaticResolver::new(),
    );
    engine.crash_on_start("web-nginx-1");
    agent.apply(nginx(1, "1.25")).unwrap();

    agent
        .wait_for_state("web", "web-nginx-1", ContainerState::Backoff, WAIT)
        .await
        .unwrap();
    assert_eq!(engine.run_count("web-nginx-1"), 3);
    assert_eq!(engine.container_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn restart_is_ignored_while_running() {
    let (agent, engine) = agent();
    agent.apply(nginx(1, "1.25")).unwrap();
    agent
        .wait_for_state("web", "web-nginx-1", ContainerState::Running, WAIT)
        .await
        .unwrap();

    agent.restart("web", "web-nginx-1").unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(agent.state("web", "web-nginx-1"), Some(ContainerState::Running));
    assert_eq!(engine.run_count("web-nginx-1"), 1);
    assert!(agent.restart("web", "web-nginx-9").is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unresolvable_configuration_is_not_started() {
    let (agent, engine) = agent();
    let mut def = nginx(1, "1.25");
    def.spec.configuration.insert(
        "dsn".to_owned(),
        "postgres://{{ secret.db.pg.password }}@db".to_owned(),
    );
    agent.apply(def.clone()).unwrap();

    let snapshot = agent
        .wait_for_state(
            "web",
            "web-nginx-1",
            ContainerState::InvalidConfiguration,
            WAIT,
        )
        .await
        .unwrap();
    assert!(snapshot.last_error.unwrap().contains("unresolved"));
    assert_eq!(engine.total_runs(), 0);

    // Fixing the definition moves the entity out of the failed state.
    def.spec
        .configuration
        .insert("dsn".to_owned(), "postgres://app@db".to_owned());
    agent.apply(def).unwrap();
    let snapshot = agent
        .wait_for_state("web", "web-nginx-1", ContainerState::Running, WAIT)
        .await
        .unwrap();
    assert_eq!(snapshot.configuration["dsn"], "postgres://app@db");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn configuration_templates_are_resolved_before_start() {
    let templates = StaticResolver::new().with("secret.db.pg.password", "hunter2");
    let (agent, _engine) = agent_with(AgentConfig::fast(), templates);
    let mut def = nginx(1, "1.25");
    def.spec.configuration.insert(
        "dsn".to_owned(),
        "postgres://app:{{ secret.db.pg.password }}@db".to_owned(),
    );
    agent.apply(def).unwrap();

    let snapshot = agent
        .wait_for_state("web", "web-nginx-1", ContainerState::Running, WAIT)
        .await
        .unwrap();
    assert_eq!(snapshot.configuration["dsn"], "postgres://app:hunter2@db");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn removal_tears_down_every_replica() {
    let (agent, engine) = agent();
    agent.apply(nginx(2, "1.25")).unwrap();
    agent.wait_until_settled(WAIT).await.unwrap();

    let removed = agent.remove("web", "nginx").unwrap();
    assert_eq!(removed.len(), 2);
    for container in ["web-nginx-1", "web-nginx-2"] {
        agent.wait_for_removal("web", container, WAIT).await.unwrap();
    }
    assert!(agent.registry().is_empty());
    assert_eq!(engine.container_count(), 0);
    assert!(agent.remove("web", "nginx").is_err());

    // A later apply starts over from index 1.
    let outcome = agent.apply(nginx(1, "1.25")).unwrap();
    assert_eq!(outcome.created, keys(&[("web", "nginx", 1)]));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failed_engine_delete_keeps_entity_until_retry_succeeds() {
    let (agent, engine) = stuck_agent();
    agent.apply(nginx(1, "1.25")).unwrap();
    agent
        .wait_for_state("web", "web-nginx-1", ContainerState::Running, WAIT)
        .await
        .unwrap();

    engine.jam(true, true);
    agent.remove("web", "nginx").unwrap();
    eventually("repeated delete attempts", || engine.delete_attempts() >= 3).await;
    assert_eq!(
        agent.state("web", "web-nginx-1"),
        Some(ContainerState::PendingDelete)
    );
    assert_eq!(engine.inner.container_count(), 1);

    // The stop keeps failing; the delete alone is enough.
    engine.jam(true, false);
    agent
        .wait_for_removal("web", "web-nginx-1", WAIT)
        .await
        .unwrap();
    assert!(agent.registry().is_empty());
    assert_eq!(engine.inner.container_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn pending_delete_is_never_revived() {
    let (agent, engine) = stuck_agent();
    agent.apply(nginx(1, "1.25")).unwrap();
    agent
        .wait_for_state("web", "web-nginx-1", ContainerState::Running, WAIT)
        .await
        .unwrap();

    let handle = agent.registry().get("web", "web-nginx-1").unwrap();
    let digest = handle.snapshot().digest;

    engine.jam(true, true);
    agent.remove("web", "nginx").unwrap();
    eventually("first delete attempt", || engine.delete_attempts() >= 1).await;

    agent.restart("web", "web-nginx-1").unwrap();
    assert!(handle.wake(WatcherSignal::SpecUpdated(Box::new(nginx(1, "1.27")))));
    assert!(engine.inner.crash("web-nginx-1"));

    let attempts = engine.delete_attempts();
    eventually("more delete attempts", || engine.delete_attempts() >= attempts + 2).await;
    let snapshot = agent.snapshot("web", "web-nginx-1").unwrap();
    assert_eq!(snapshot.state, ContainerState::PendingDelete);
    assert_eq!(snapshot.digest, digest);
    assert_eq!(engine.inner.run_count("web-nginx-1"), 1);

    engine.jam(false, false);
    drop(handle);
    agent
        .wait_for_removal("web", "web-nginx-1", WAIT)
        .await
        .unwrap();
    assert!(agent.snapshot("web", "web-nginx-1").is_none());
    assert_eq!(engine.inner.run_count("web-nginx-1"), 1);
    assert_eq!(engine.inner.container_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn drain_removes_all_families() {
    let (agent, engine) = agent();
    agent.apply(nginx(2, "1.25")).unwrap();
    agent
        .apply(
            parse_definition_str(
                "[meta]\ngroup = \"db\"\nname = \"pg\"\n[spec]\nimage = \"postgres\"\n",
            )
            .unwrap(),
        )
        .unwrap();
    agent.wait_until_settled(WAIT).await.unwrap();

    assert_eq!(agent.drain(), 3);
    eventually("empty registry", || agent.registry().is_empty()).await;
    assert_eq!(engine.container_count(), 0);
    assert!(agent.list().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shutdown_stops_watchers_but_keeps_containers() {
    let (agent, engine) = agent();
    agent.apply(nginx(2, "1.25")).unwrap();
    agent.wait_until_settled(WAIT).await.unwrap();

    agent.shutdown();
    eventually("watchers to stop", || agent.registry().is_empty()).await;
    assert_eq!(engine.running().len(), 2);
    assert_eq!(engine.delete_count("web-nginx-1"), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn list_reports_snapshots_in_key_order() {
    let (agent, _engine) = agent();
    agent.apply(nginx(3, "1.25")).unwrap();
    agent.wait_until_settled(WAIT).await.unwrap();

    let listed: Vec<String> = agent
        .list()
        .iter()
        .map(|s| s.key.container.to_string())
        .collect();
    assert_eq!(listed, ["web-nginx-1", "web-nginx-2", "web-nginx-3"]);
    assert!(agent.list().iter().all(|s| s.state == ContainerState::Running));
}
