//! Cluster lifecycle state machine
//!
//! A run walks one cluster through these states:
//!
//! ```text
//! Absent -> Provisioning(Network) -> Provisioning(Compute)
//!        -> Provisioning(ControlPlane) -> ControlPlaneReady
//!        -> Provisioning(Agents) -> AgentsReady -> CniReady -> Validated
//! ```
//!
//! `Reclaimed` is the entry point when an existing cluster is reused and
//! `TornDown` is reachable from anywhere. A failed bring-up attempt returns
//! to `Provisioning(ControlPlane)` (retry on the same bootstrap VM) or to
//! `Absent` (rollback). Any other move is a bug and fails with
//! [`Error::InvalidState`].

use std::fmt;
use std::sync::Mutex;

use tracing::info;

use crate::error::{Error, Result};

/// Provisioning sub-phase.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    /// Resource group and networking
    Network,
    /// Virtual machines
    Compute,
    /// Management cluster and workload control plane
    ControlPlane,
    /// Worker machines
    Agents,
}

/// Observed state of the cluster a run manages.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ClusterState {
    #[default]
    Absent,
    Provisioning(Phase),
    ControlPlaneReady,
    AgentsReady,
    CniReady,
    Validated,
    /// Reused from an earlier run without creating anything
    Reclaimed,
    TornDown,
}

impl fmt::Display for ClusterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Absent => write!(f, "Absent"),
            Self::Provisioning(phase) => write!(f, "Provisioning({:?})", phase),
            Self::ControlPlaneReady => write!(f, "ControlPlaneReady"),
            Self::AgentsReady => write!(f, "AgentsReady"),
            Self::CniReady => write!(f, "CniReady"),
            Self::Validated => write!(f, "Validated"),
            Self::Reclaimed => write!(f, "Reclaimed"),
            Self::TornDown => write!(f, "TornDown"),
        }
    }
}

impl ClusterState {
    /// Whether moving from `self` to `next` is allowed
    pub fn can_transition_to(&self, next: ClusterState) -> bool {
        use ClusterState::*;
        use Phase::*;

        if next == TornDown {
            return *self != TornDown;
        }
        let in_flight = matches!(
            self,
            Provisioning(_) | ControlPlaneReady | AgentsReady | CniReady
        );
        match (*self, next) {
            (Absent, Provisioning(Network)) | (Absent, Reclaimed) => true,
            (Provisioning(Network), Provisioning(Compute)) => true,
            (Provisioning(Compute), Provisioning(ControlPlane)) => true,
            (Provisioning(ControlPlane), ControlPlaneReady) => true,
            (ControlPlaneReady, Provisioning(Agents)) => true,
            (Provisioning(Agents), AgentsReady) => true,
            (AgentsReady, CniReady) => true,
            (CniReady, Validated) => true,
            // rollback, or another bring-up attempt on the same bootstrap VM
            (_, Absent) | (_, Provisioning(ControlPlane)) => in_flight,
            _ => false,
        }
    }

    /// Whether the cluster can serve tests
    pub fn is_usable(&self) -> bool {
        matches!(
            self,
            ClusterState::CniReady | ClusterState::Validated | ClusterState::Reclaimed
        )
    }
}

/// The state of one cluster, shared by the steps acting on it.
#[derive(Debug)]
pub struct Lifecycle {
    resource: String,
    state: Mutex<ClusterState>,
}

impl Lifecycle {
    /// Track a cluster that does not exist yet
    pub fn new(resource: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            state: Mutex::new(ClusterState::Absent),
        }
    }

    /// Current state
    pub fn state(&self) -> ClusterState {
        match self.state.lock() {
            Ok(state) => *state,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    /// Move to `next`, or fail with [`Error::InvalidState`]
    pub fn advance(&self, next: ClusterState) -> Result<()> {
        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        if !state.can_transition_to(next) {
            return Err(Error::invalid_state(
                &self.resource,
                format!("cannot move from {} to {}", *state, next),
            ));
        }
        info!(cluster = %self.resource, from = %*state, to = %next, "Cluster state transition");
        *state = next;
        Ok(())
    }
}
