use crate::engine::{
    ContainerEngine, EngineAction, EngineEvent, EngineHandle, EngineState, EngineStatus,
    NetworkAttachment, RunSpec,
};
use crate::RuntimeError;
use berth_schema::GeneratedName;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast;

const EVENT_CAPACITY: usize = 256;

/// Number of driver calls made against one generated name.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCounts {
    pub run: u32,
    pub stop: u32,
    pub delete: u32,
}

struct MockContainer {
    name: GeneratedName,
    status: EngineStatus,
    exit_code: Option<i32>,
    labels: BTreeMap<String, String>,
    networks: Vec<NetworkAttachment>,
}

#[derive(Default)]
struct MockState {
    containers: BTreeMap<String, MockContainer>,
    next_id: u64,
    calls: BTreeMap<GeneratedName, CallCounts>,
    failing_runs: BTreeMap<GeneratedName, u32>,
    crash_on_start: BTreeSet<GeneratedName>,
}

/// In-memory container engine.
///
/// Records every call per generated name and can be told to fail runs or to
/// crash containers right after they start, emitting the same events a real
/// engine would.
pub struct MockEngine {
    state: Mutex<MockState>,
    events: broadcast::Sender<EngineEvent>,
}

impl Default for MockEngine {
    fn default() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            state: Mutex::new(MockState::default()),
            events,
        }
    }
}

impl MockEngine {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, id: &str, action: EngineAction, labels: &BTreeMap<String, String>) {
        // No subscribers is fine: nobody is watching yet.
        let _ = self.events.send(EngineEvent {
            container_id: id.to_owned(),
            action,
            labels: labels.clone(),
        });
    }

    /// Make the next `count` runs of `name` fail.
    pub fn fail_runs(&self, name: &str, count: u32) {
        self.lock()
            .failing_runs
            .insert(GeneratedName::new(name), count);
    }

    /// Containers started for `name` exit immediately with code 1.
    pub fn crash_on_start(&self, name: &str) {
        self.lock().crash_on_start.insert(GeneratedName::new(name));
    }

    pub fn stop_crashing(&self, name: &str) {
        self.lock().crash_on_start.remove(name);
    }

    pub fn calls(&self, name: &str) -> CallCounts {
        self.lock().calls.get(name).copied().unwrap_or_default()
    }

    pub fn run_count(&self, name: &str) -> u32 {
        self.calls(name).run
    }

    pub fn stop_count(&self, name: &str) -> u32 {
        self.calls(name).stop
    }

    pub fn delete_count(&self, name: &str) -> u32 {
        self.calls(name).delete
    }

    pub fn total_runs(&self) -> u32 {
        self.lock().calls.values().map(|c| c.run).sum()
    }

    /// Generated names of containers currently running.
    pub fn running(&self) -> Vec<GeneratedName> {
        self.lock()
            .containers
            .values()
            .filter(|c| c.status.is_running())
            .map(|c| c.name.clone())
            .collect()
    }

    /// Number of containers the engine still knows, in any status.
    pub fn container_count(&self) -> usize {
        self.lock().containers.len()
    }

    /// Simulate a crash of the running container for `name`.
    pub fn crash(&self, name: &str) -> bool {
        self.terminate(name, &[EngineAction::Die], 137)
    }

    /// Simulate an external kill of the running container for `name`.
    pub fn kill(&self, name: &str) -> bool {
        self.terminate(name, &[EngineAction::Kill, EngineAction::Die], 137)
    }

    fn terminate(&self, name: &str, actions: &[EngineAction], exit_code: i32) -> bool {
        let mut state = self.lock();
        let Some((id, container)) = state
            .containers
            .iter_mut()
            .find(|(_, c)| c.name == name && c.status.is_running())
        else {
            return false;
        };
        container.status = EngineStatus::Exited;
        container.exit_code = Some(exit_code);
        let id = id.clone();
        let labels = container.labels.clone();
        drop(state);
        for action in actions {
            self.emit(&id, *action, &labels);
        }
        true
    }
}

impl ContainerEngine for MockEngine {
    fn name(&self) -> &str {
        "mock"
    }

    fn run(&self, spec: &RunSpec) -> Result<EngineHandle, RuntimeError> {
        let name = spec.key.container.clone();
        let mut state = self.lock();
        state.calls.entry(name.clone()).or_default().run += 1;

        if let Some(remaining) = state.failing_runs.get_mut(&name) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(RuntimeError::ExecFailed(format!(
                    "mock run of {name} failed"
                )));
            }
        }

        state.next_id += 1;
        let id = format!("mock-{:08x}", state.next_id);
        let networks = spec
            .networks
            .iter()
            .enumerate()
            .map(|(i, net)| NetworkAttachment {
                id: format!("net-{net}"),
                name: net.clone(),
                ip: format!("10.0.{}.{}", i, state.next_id % 250 + 2),
            })
            .collect();
        let crashes = state.crash_on_start.contains(&name);
        state.containers.insert(
            id.clone(),
            MockContainer {
                name: name.clone(),
                status: if crashes {
                    EngineStatus::Exited
                } else {
                    EngineStatus::Running
                },
                exit_code: crashes.then_some(1),
                labels: spec.labels.clone(),
                networks,
            },
        );
        drop(state);

        self.emit(&id, EngineAction::Start, &spec.labels);
        if crashes {
            self.emit(&id, EngineAction::Die, &spec.labels);
        }
        Ok(EngineHandle { id, name })
    }

    fn get(&self, handle: &EngineHandle) -> Result<EngineState, RuntimeError> {
        let state = self.lock();
        let container = state
            .containers
            .get(&handle.id)
            .ok_or_else(|| RuntimeError::ContainerNotFound(handle.id.clone()))?;
        Ok(EngineState {
            id: handle.id.clone(),
            status: container.status,
            exit_code: container.exit_code,
            networks: container.networks.clone(),
        })
    }

    fn stop(&self, handle: &EngineHandle, _timeout: Duration) -> Result<(), RuntimeError> {
        let mut state = self.lock();
        state.calls.entry(handle.name.clone()).or_default().stop += 1;
        let container = state
            .containers
            .get_mut(&handle.id)
            .ok_or_else(|| RuntimeError::ContainerNotFound(handle.id.clone()))?;
        if !container.status.is_running() {
            return Ok(());
        }
        container.status = EngineStatus::Exited;
        container.exit_code = Some(0);
        let labels = container.labels.clone();
        drop(state);

        self.emit(&handle.id, EngineAction::Die, &labels);
        self.emit(&handle.id, EngineAction::Stop, &labels);
        Ok(())
    }

    fn delete(&self, handle: &EngineHandle) -> Result<(), RuntimeError> {
        let mut state = self.lock();
        state.calls.entry(handle.name.clone()).or_default().delete += 1;
        if state.containers.remove(&handle.id).is_none() {
            return Err(RuntimeError::ContainerNotFound(handle.id.clone()));
        }
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }
}
