//! Shared map of managed entities and their consecutive-failure counters.
//!
//! Both maps live under one reader/writer lock. Entities are keyed by group and
//! generated name; each entry is the handle through which other tasks observe
//! the entity and wake its watcher. Handles never expose the entity mutably.

use crate::container::ContainerSnapshot;
use crate::status::ContainerState;
use crate::watcher::WatcherSignal;
use berth_schema::{ContainerKey, GeneratedName, Group};
use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::{mpsc, watch};

/// Registry entry for one entity.
#[derive(Debug)]
pub struct ContainerHandle {
    key: ContainerKey,
    status: watch::Receiver<ContainerSnapshot>,
    wake: mpsc::UnboundedSender<WatcherSignal>,
}

impl ContainerHandle {
    pub fn new(
        key: ContainerKey,
        status: watch::Receiver<ContainerSnapshot>,
        wake: mpsc::UnboundedSender<WatcherSignal>,
    ) -> Self {
        Self { key, status, wake }
    }

    pub fn key(&self) -> &ContainerKey {
        &self.key
    }

    pub fn state(&self) -> ContainerState {
        self.status.borrow().state
    }

    pub fn snapshot(&self) -> ContainerSnapshot {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ContainerSnapshot> {
        self.status.clone()
    }

    /// Queue `signal` for the watcher. Returns false once the watcher is gone.
    pub fn wake(&self, signal: WatcherSignal) -> bool {
        self.wake.send(signal).is_ok()
    }
}

#[derive(Default)]
struct Inner {
    containers: BTreeMap<Group, BTreeMap<GeneratedName, Arc<ContainerHandle>>>,
    backoff: BTreeMap<Group, BTreeMap<GeneratedName, u32>>,
}

#[derive(Default)]
pub struct Registry {
    inner: RwLock<Inner>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register `handle`, returning the entry it displaced, if any.
    pub fn insert(&self, handle: Arc<ContainerHandle>) -> Option<Arc<ContainerHandle>> {
        let key = handle.key().clone();
        self.write()
            .containers
            .entry(key.group)
            .or_default()
            .insert(key.container, handle)
    }

    /// Remove `handle` if it is still the registered entry for its key.
    /// A replacement registered under the same name is left alone.
    pub fn remove(&self, handle: &Arc<ContainerHandle>) -> bool {
        let key = handle.key();
        let mut inner = self.write();
        let Some(members) = inner.containers.get_mut(&key.group) else {
            return false;
        };
        let current = members
            .get(&key.container)
            .is_some_and(|registered| Arc::ptr_eq(registered, handle));
        if !current {
            return false;
        }
        members.remove(&key.container);
        if members.is_empty() {
            inner.containers.remove(&key.group);
        }
        if let Some(counters) = inner.backoff.get_mut(&key.group) {
            counters.remove(&key.container);
            if counters.is_empty() {
                inner.backoff.remove(&key.group);
            }
        }
        true
    }

    pub fn get(&self, group: &str, container: &str) -> Option<Arc<ContainerHandle>> {
        self.read().containers.get(group)?.get(container).cloned()
    }

    pub fn contains(&self, group: &str, container: &str) -> bool {
        self.get(group, container).is_some()
    }

    /// Members of `group`, or `None` when the group has never been registered
    /// or has been emptied.
    pub fn find_group(&self, group: &str) -> Option<Vec<Arc<ContainerHandle>>> {
        let inner = self.read();
        let members = inner.containers.get(group)?;
        Some(members.values().cloned().collect())
    }

    /// Every replica of `group`/`name`, ordered by index.
    pub fn family(&self, group: &str, name: &str) -> Vec<Arc<ContainerHandle>> {
        let mut family: Vec<_> = self
            .read()
            .containers
            .get(group)
            .into_iter()
            .flat_map(BTreeMap::values)
            .filter(|h| h.key().name == name)
            .cloned()
            .collect();
        family.sort_by_key(|h| h.key().index);
        family
    }

    /// Highest replica index of `group`/`name` that is not being deleted.
    pub fn highest_index(&self, group: &str, name: &str) -> u32 {
        self.family(group, name)
            .iter()
            .filter(|h| h.state() != ContainerState::PendingDelete)
            .map(|h| h.key().index)
            .max()
            .unwrap_or(0)
    }

    pub fn all(&self) -> Vec<Arc<ContainerHandle>> {
        self.read()
            .containers
            .values()
            .flat_map(BTreeMap::values)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.read().containers.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Record one more consecutive failure and return the new count.
    pub fn backoff_increment(&self, group: &str, container: &str) -> u32 {
        let mut inner = self.write();
        let counter = inner
            .backoff
            .entry(Group::new(group))
            .or_default()
            .entry(GeneratedName::new(container))
            .or_insert(0);
        *counter += 1;
        *counter
    }

    pub fn backoff_reset(&self, group: &str, container: &str) {
        if let Some(counters) = self.write().backoff.get_mut(group) {
            counters.remove(container);
        }
    }

    pub fn backoff_count(&self, group: &str, container: &str) -> u32 {
        self.read()
            .backoff
            .get(group)
            .and_then(|counters| counters.get(container))
            .copied()
            .unwrap_or(0)
    }
}
