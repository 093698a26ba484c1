use super::{
    colorize_state, json_pretty, load_definition, parse_assignment, EXIT_FAILURE, EXIT_SUCCESS,
};
use berth_core::{Agent, AgentConfig, ContainerSnapshot, ContainerState};
use berth_runtime::{
    ContainerEngine, HttpOperatorClient, MockEngine, OperatorClient, RuntimeError, StaticResolver,
};
use berth_schema::ContainerDefinition;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct SimulateOptions {
    pub files: Vec<PathBuf>,
    /// Agent config file. Without one, millisecond intervals are used.
    pub config: Option<PathBuf>,
    /// Template values as `kind.group.id.key=value`.
    pub values: Vec<String>,
    /// Generated names whose containers exit right after starting.
    pub crash: Vec<String>,
    /// `generated-name=count` run failures to inject.
    pub fail_runs: Vec<String>,
    /// Answer every readiness check with 200 instead of calling operators.
    pub assume_ready: bool,
    pub timeout: Duration,
}

/// Operator stand-in that reports every check as ready.
struct AssumeReady;

impl OperatorClient for AssumeReady {
    fn call(
        &self,
        _kind: &str,
        _operator: &str,
        _body: &BTreeMap<String, String>,
    ) -> Result<u16, RuntimeError> {
        Ok(200)
    }
}

pub fn run(options: &SimulateOptions, json: bool) -> Result<u8, String> {
    let definitions = options
        .files
        .iter()
        .map(|path| load_definition(path))
        .collect::<Result<Vec<_>, _>>()?;
    let config = match &options.config {
        Some(path) => AgentConfig::load(path).map_err(|e| e.to_string())?,
        None => AgentConfig::fast(),
    };

    let engine = Arc::new(MockEngine::new());
    for name in &options.crash {
        engine.crash_on_start(name);
    }
    for entry in &options.fail_runs {
        let (name, count) = parse_assignment(entry)?;
        let count: u32 = count
            .parse()
            .map_err(|_| format!("invalid failure count in '{entry}'"))?;
        engine.fail_runs(&name, count);
    }

    let mut templates = StaticResolver::new();
    for entry in &options.values {
        let (path, value) = parse_assignment(entry)?;
        templates.insert(&path, &value);
    }

    let operators: Arc<dyn OperatorClient> = if options.assume_ready {
        Arc::new(AssumeReady)
    } else {
        Arc::new(HttpOperatorClient::new(config.operator_config()))
    };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| format!("failed to start async runtime: {e}"))?;
    let result = runtime.block_on(async {
        let agent = Agent::new(
            config,
            Arc::clone(&engine) as Arc<dyn ContainerEngine>,
            Arc::new(templates),
            operators,
        );
        agent.spawn_event_listener();
        simulate(&agent, definitions, options.timeout).await
    });
    // Probe tasks may still be blocked on operator calls.
    runtime.shutdown_timeout(SHUTDOWN_GRACE);
    let snapshots = result?;

    let converged = snapshots
        .iter()
        .all(|s| s.state == ContainerState::Running && s.readiness_passed);

    if json {
        let runs: BTreeMap<String, u32> = snapshots
            .iter()
            .map(|s| {
                let name = s.key.container.to_string();
                let runs = engine.run_count(&name);
                (name, runs)
            })
            .collect();
        let payload = serde_json::json!({
            "converged": converged,
            "containers": snapshots,
            "runs": runs,
        });
        println!("{}", json_pretty(&payload)?);
    } else {
        print_table(&snapshots, &engine);
    }

    Ok(if converged { EXIT_SUCCESS } else { EXIT_FAILURE })
}

async fn simulate(
    agent: &Agent,
    definitions: Vec<ContainerDefinition>,
    timeout: Duration,
) -> Result<Vec<ContainerSnapshot>, String> {
    for definition in definitions {
        agent.apply(definition).map_err(|e| e.to_string())?;
    }
    if let Err(e) = agent.wait_until_settled(timeout).await {
        warn!("{e}");
    }
    let snapshots = agent.list();
    agent.shutdown();
    Ok(snapshots)
}

fn print_table(snapshots: &[ContainerSnapshot], engine: &MockEngine) {
    if snapshots.is_empty() {
        println!("no containers");
        return;
    }
    println!(
        "{:<12} {:<24} {:<18} {:<5} ERROR",
        "GROUP", "CONTAINER", "STATE", "RUNS"
    );
    for snapshot in snapshots {
        let state = snapshot.state;
        // Pad before coloring so escape codes do not break alignment.
        let padding = " ".repeat(18usize.saturating_sub(state.as_str().len()));
        println!(
            "{:<12} {:<24} {}{padding} {:<5} {}",
            snapshot.key.group.as_str(),
            snapshot.key.container.as_str(),
            colorize_state(state),
            engine.run_count(&snapshot.key.container),
            snapshot.last_error.as_deref().unwrap_or("")
        );
    }
}
