use crate::registry::Registry;
use crate::watcher::WatcherSignal;
use berth_runtime::{ContainerEngine, EngineEvent};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

/// Forward engine events for managed containers to their watchers.
///
/// The subscription is taken before this returns, so every event emitted
/// afterwards is seen. Events never touch entity state directly.
pub fn spawn_event_listener(
    engine: &dyn ContainerEngine,
    registry: Arc<Registry>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    let mut events = engine.subscribe();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                received = events.recv() => match received {
                    Ok(event) => {
                        dispatch(&registry, event);
                    }
                    Err(RecvError::Lagged(missed)) => {
                        warn!("engine event stream lagged by {missed} events, resyncing");
                        for handle in registry.all() {
                            handle.wake(WatcherSignal::Reconcile);
                        }
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }
        debug!("engine event listener stopped");
    })
}

/// Route one event to the watcher of the container it names.
pub fn dispatch(registry: &Registry, event: EngineEvent) -> bool {
    let Some((group, container)) = event.managed_target() else {
        trace!("ignoring event for unmanaged container {}", event.container_id);
        return false;
    };
    let Some(handle) = registry.get(&group, &container) else {
        debug!("no entity for {group}/{container}, dropping {}", event.action);
        return false;
    };
    handle.wake(WatcherSignal::Engine {
        container_id: event.container_id,
        action: event.action,
    })
}
