use berth_schema::{Changelog, ContainerKey};
use serde::Serialize;

/// Which replica indices to create, destroy, and update for one
/// `group`/`name` family.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReplicaPlan {
    /// Indices above the previous highest, highest first.
    pub create: Vec<u32>,
    /// Indices above the desired count, highest first.
    pub destroy: Vec<u32>,
    /// Surviving indices that must receive the new definition. Empty when the
    /// replica count is the only change.
    pub update: Vec<u32>,
    pub previous_highest: u32,
}

impl ReplicaPlan {
    pub fn is_empty(&self) -> bool {
        self.create.is_empty() && self.destroy.is_empty() && self.update.is_empty()
    }

    pub fn create_keys(&self, group: &str, name: &str) -> Vec<ContainerKey> {
        keys(&self.create, group, name)
    }

    pub fn destroy_keys(&self, group: &str, name: &str) -> Vec<ContainerKey> {
        keys(&self.destroy, group, name)
    }

    pub fn update_keys(&self, group: &str, name: &str) -> Vec<ContainerKey> {
        keys(&self.update, group, name)
    }
}

fn keys(indices: &[u32], group: &str, name: &str) -> Vec<ContainerKey> {
    indices
        .iter()
        .map(|&i| ContainerKey::new(group, name, i))
        .collect()
}

/// Plan the move from `highest` existing replicas to `desired`.
///
/// A changelog that only touches the replica count never schedules updates,
/// so scaling leaves the surviving replicas alone.
pub fn plan(desired: u32, highest: u32, changelog: &Changelog) -> ReplicaPlan {
    let create = if desired > highest {
        (highest + 1..=desired).rev().collect()
    } else {
        Vec::new()
    };
    let destroy = if desired < highest {
        (desired + 1..=highest).rev().collect()
    } else {
        Vec::new()
    };
    let update = if changelog.has_spec_changes() {
        (1..=desired.min(highest)).collect()
    } else {
        Vec::new()
    };

    ReplicaPlan {
        create,
        destroy,
        update,
        previous_highest: highest,
    }
}
