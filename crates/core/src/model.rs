use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::validation::BatchError;
use crate::{new_ulid, EpochMs};

/// Which controller a batch is routed to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TargetKind {
    /// A container managed by the container runtime.
    Workload,
    /// A network interface managed by the traffic-shaping tool.
    Interface,
}

impl std::fmt::Display for TargetKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TargetKind::Workload => f.write_str("workload"),
            TargetKind::Interface => f.write_str("interface"),
        }
    }
}

/// Membership of a workload in a virtual network.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Attached to the network.
    Connected,
    /// Not attached (also the answer for networks never seen).
    #[default]
    Disconnected,
}

/// Resource changes for one workload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct WorkloadChange {
    /// Relative CPU weight (container runtime default is 1024).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_shares: Option<u64>,
    /// Memory ceiling in container-runtime notation, e.g. `512m`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_limit: Option<String>,
    /// Networks to join or leave.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub networks: BTreeMap<String, ConnectionState>,
}

impl WorkloadChange {
    /// True when no attribute is present.
    pub fn is_empty(&self) -> bool {
        self.cpu_shares.is_none() && self.memory_limit.is_none() && self.networks.is_empty()
    }
}

/// Network impairment changes for one interface.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct InterfaceChange {
    /// Rate limit, e.g. `10Mbps`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bandwidth: Option<String>,
    /// Added round-trip delay, e.g. `10ms`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay: Option<String>,
    /// Packet loss rate in percent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loss: Option<String>,
    /// Bring the link up (`true`) or down (`false`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active: Option<bool>,
}

impl InterfaceChange {
    /// True when any shaping attribute (bandwidth, delay, loss) is present.
    pub fn touches_rules(&self) -> bool {
        self.bandwidth.is_some() || self.delay.is_some() || self.loss.is_some()
    }

    /// True when no attribute is present.
    pub fn is_empty(&self) -> bool {
        !self.touches_rules() && self.active.is_none()
    }
}

/// Kind-specific payload of an action.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Change {
    /// Container runtime change.
    Workload(WorkloadChange),
    /// Traffic shaping change.
    Interface(InterfaceChange),
}

impl Change {
    /// Target kind this change is routed to.
    pub fn kind(&self) -> TargetKind {
        match self {
            Change::Workload(_) => TargetKind::Workload,
            Change::Interface(_) => TargetKind::Interface,
        }
    }

    /// True when firing the change would not touch any attribute.
    pub fn is_empty(&self) -> bool {
        match self {
            Change::Workload(c) => c.is_empty(),
            Change::Interface(c) => c.is_empty(),
        }
    }
}

/// One timed instruction. Immutable once parsed; consumed by exactly one firing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Action {
    /// Absolute fire time (ms epoch).
    pub scheduled_at_ms: EpochMs,
    /// Workload name or interface name.
    pub target: String,
    /// What to change.
    pub change: Change,
}

/// Actions submitted together. Never empty.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Batch {
    id: String,
    kind: TargetKind,
    actions: Vec<Action>,
}

impl Batch {
    /// Builds a batch, rejecting empty input and actions of a foreign kind.
    pub fn new(kind: TargetKind, actions: Vec<Action>) -> Result<Self, BatchError> {
        if actions.is_empty() {
            return Err(BatchError::Empty);
        }
        if let Some(index) = actions.iter().position(|a| a.change.kind() != kind) {
            return Err(BatchError::KindMismatch { index, expected: kind });
        }
        Ok(Self {
            id: new_ulid().to_string(),
            kind,
            actions,
        })
    }

    /// Batch id (ULID).
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Target kind shared by every action.
    pub fn kind(&self) -> TargetKind {
        self.kind
    }

    /// Actions in submission order.
    pub fn actions(&self) -> &[Action] {
        &self.actions
    }

    /// Latest scheduled time over all actions.
    pub fn latest_ms(&self) -> EpochMs {
        // Non-empty by construction.
        self.actions
            .iter()
            .map(|a| a.scheduled_at_ms)
            .max()
            .unwrap_or_default()
    }

    /// Splits the batch into its id and actions.
    pub fn into_parts(self) -> (String, Vec<Action>) {
        (self.id, self.actions)
    }
}

/// Believed configuration of one workload or interface.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct TargetStatus {
    /// CPU weight; 0 until set.
    pub cpu_shares: u64,
    /// Memory ceiling; empty until set.
    pub memory_limit: String,
    /// Rate limit; empty until set or observed.
    pub bandwidth: String,
    /// Delay; empty until set or observed.
    pub latency: String,
    /// Loss rate; empty until set or observed.
    pub packet_loss: String,
    /// Link state, if the agent ever toggled it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active: Option<bool>,
    /// Network memberships the agent changed.
    #[serde(default)]
    pub connections: BTreeMap<String, ConnectionState>,
}

impl TargetStatus {
    /// Membership in `network`; networks never touched read as disconnected.
    pub fn connection(&self, network: &str) -> ConnectionState {
        self.connections.get(network).copied().unwrap_or_default()
    }

    /// Overwrites shaping values with whatever the live report contains.
    pub fn absorb_live(&mut self, live: &LiveRules) {
        if let Some(v) = &live.bandwidth {
            self.bandwidth = v.clone();
        }
        if let Some(v) = &live.delay {
            self.latency = v.clone();
        }
        if let Some(v) = &live.loss {
            self.packet_loss = v.clone();
        }
    }
}

/// Shaping values reported by the traffic-shaping tool.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct LiveRules {
    /// Observed rate.
    pub bandwidth: Option<String>,
    /// Observed delay.
    pub delay: Option<String>,
    /// Observed loss.
    pub loss: Option<String>,
}

/// Immutable copy of every tracked target at one instant.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Snapshot {
    /// Capture time (ms epoch).
    pub captured_at_ms: EpochMs,
    /// Target id -> status.
    pub targets: BTreeMap<String, TargetStatus>,
}

/// A completed batch's snapshot, addressed by stage id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StageReport {
    /// Gapless, increasing from 0.
    pub stage: u64,
    /// Batch that produced the stage.
    pub batch_id: String,
    /// State after the batch settled.
    pub snapshot: Snapshot,
}
