use crate::CoreError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerState {
    Created,
    DependsSolving,
    DependsSolved,
    DependsFailed,
    Running,
    Reconciling,
    Drifted,
    Dead,
    ReadinessCheck,
    ReadinessReady,
    ReadinessFailed,
    Backoff,
    PendingDelete,
    Killed,
    InvalidConfiguration,
}

impl ContainerState {
    pub const ALL: [ContainerState; 15] = [
        Self::Created,
        Self::DependsSolving,
        Self::DependsSolved,
        Self::DependsFailed,
        Self::Running,
        Self::Reconciling,
        Self::Drifted,
        Self::Dead,
        Self::ReadinessCheck,
        Self::ReadinessReady,
        Self::ReadinessFailed,
        Self::Backoff,
        Self::PendingDelete,
        Self::Killed,
        Self::InvalidConfiguration,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::DependsSolving => "depends_solving",
            Self::DependsSolved => "depends_solved",
            Self::DependsFailed => "depends_failed",
            Self::Running => "running",
            Self::Reconciling => "reconciling",
            Self::Drifted => "drifted",
            Self::Dead => "dead",
            Self::ReadinessCheck => "readiness_check",
            Self::ReadinessReady => "readiness_ready",
            Self::ReadinessFailed => "readiness_failed",
            Self::Backoff => "backoff",
            Self::PendingDelete => "pending_delete",
            Self::Killed => "killed",
            Self::InvalidConfiguration => "invalid_configuration",
        }
    }

    /// States in which the entity needs no further action from its watcher.
    pub fn is_settled(self) -> bool {
        matches!(
            self,
            Self::Running | Self::Backoff | Self::InvalidConfiguration
        )
    }

    /// Running with its container up, whether or not readiness has been
    /// confirmed in this pass.
    pub fn is_converged(self) -> bool {
        matches!(self, Self::Running | Self::ReadinessReady)
    }
}

impl fmt::Display for ContainerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The legal transitions between container states.
///
/// Edges are fixed when the graph is built; the graph is shared read-only by
/// every entity.
#[derive(Debug, Clone)]
pub struct StatusGraph {
    edges: BTreeMap<ContainerState, BTreeSet<ContainerState>>,
}

impl Default for StatusGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusGraph {
    pub fn new() -> Self {
        use ContainerState::{
            Backoff, Created, Dead, DependsFailed, DependsSolved, DependsSolving, Drifted,
            InvalidConfiguration, Killed, PendingDelete, ReadinessCheck, ReadinessFailed,
            ReadinessReady, Reconciling, Running,
        };

        let table: [(ContainerState, &[ContainerState]); 15] = [
            (Created, &[DependsSolving]),
            (DependsSolving, &[DependsSolved, DependsFailed]),
            (
                DependsSolved,
                &[Running, Dead, InvalidConfiguration],
            ),
            (DependsFailed, &[Dead]),
            (
                Running,
                &[ReadinessCheck, Dead, Killed, Drifted, Reconciling],
            ),
            (
                ReadinessCheck,
                &[ReadinessReady, ReadinessFailed, Dead, Killed],
            ),
            (ReadinessReady, &[Running, Dead, Drifted]),
            (ReadinessFailed, &[Dead]),
            (Drifted, &[Reconciling]),
            (Reconciling, &[Created, Dead]),
            (Dead, &[Created, Backoff, Reconciling, Dead, Drifted]),
            (Killed, &[Dead, Drifted]),
            (Backoff, &[Created, Drifted]),
            (InvalidConfiguration, &[Created, Drifted]),
            (PendingDelete, &[]),
        ];

        let mut edges = BTreeMap::new();
        for (from, targets) in table {
            let mut set: BTreeSet<ContainerState> = targets.iter().copied().collect();
            if from != PendingDelete {
                set.insert(PendingDelete);
            }
            edges.insert(from, set);
        }
        Self { edges }
    }

    pub fn allows(&self, from: ContainerState, to: ContainerState) -> bool {
        self.edges.get(&from).is_some_and(|targets| targets.contains(&to))
    }

    pub fn successors(&self, from: ContainerState) -> impl Iterator<Item = ContainerState> + '_ {
        self.edges.get(&from).into_iter().flatten().copied()
    }

    pub fn validate_transition(
        &self,
        from: ContainerState,
        to: ContainerState,
    ) -> Result<(), CoreError> {
        if self.allows(from, to) {
            Ok(())
        } else {
            Err(CoreError::InvalidTransition {
                from: from.to_string(),
                to: to.to_string(),
            })
        }
    }
}

/// Current state of one entity plus the time it last changed.
#[derive(Debug, Clone)]
pub struct Status {
    state: ContainerState,
    graph: Arc<StatusGraph>,
    last_update: DateTime<Utc>,
}

impl Status {
    pub fn new(graph: Arc<StatusGraph>) -> Self {
        Self {
            state: ContainerState::Created,
            graph,
            last_update: Utc::now(),
        }
    }

    pub fn state(&self) -> ContainerState {
        self.state
    }

    pub fn last_update(&self) -> DateTime<Utc> {
        self.last_update
    }

    /// Move to `to` if the graph has an edge from the current state.
    /// A rejected transition leaves the state untouched.
    pub fn transition(&mut self, to: ContainerState) -> Result<(), CoreError> {
        self.graph.validate_transition(self.state, to)?;
        self.state = to;
        self.last_update = Utc::now();
        Ok(())
    }

    pub fn if_state_is(&self, state: ContainerState) -> bool {
        self.state == state
    }
}
