//! Supporting types for the SyncTarget CRD

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Top-level health signal on a SyncTarget
pub const CONDITION_READY: &str = "Ready";
/// Aggregate health of all resource synchronizers
pub const CONDITION_SYNCER_READY: &str = "SyncerReady";
/// Whether the physical cluster answers heartbeat probes
pub const CONDITION_HEARTBEAT_READY: &str = "HeartbeatReady";
/// Per-object condition written into a logical object's status
pub const CONDITION_SYNCED: &str = "Synced";

/// SyncTarget lifecycle phase
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum SyncTargetPhase {
    /// Registered, not yet validated or deployed
    #[default]
    Pending,
    /// Agent deployed, synchronizers running, heartbeats succeeding
    Active,
    /// Running but the physical cluster stopped answering heartbeats
    Unavailable,
    /// Deletion requested; cleanup in progress
    Terminating,
}

impl SyncTargetPhase {
    /// Every phase, in lifecycle order
    pub const ALL: [SyncTargetPhase; 4] = [
        Self::Pending,
        Self::Active,
        Self::Unavailable,
        Self::Terminating,
    ];

    /// Lowercase metric label value
    pub fn as_label(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Unavailable => "unavailable",
            Self::Terminating => "terminating",
        }
    }

    /// True once the engine has been started for this target
    pub fn is_running(&self) -> bool {
        matches!(self, Self::Active | Self::Unavailable)
    }
}

impl std::fmt::Display for SyncTargetPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "Pending"),
            Self::Active => write!(f, "Active"),
            Self::Unavailable => write!(f, "Unavailable"),
            Self::Terminating => write!(f, "Terminating"),
        }
    }
}

/// Condition status following Kubernetes conventions
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionStatus {
    /// Condition is true
    True,
    /// Condition is false
    False,
    /// Condition status is unknown
    #[default]
    Unknown,
}

impl From<bool> for ConditionStatus {
    fn from(value: bool) -> Self {
        if value {
            Self::True
        } else {
            Self::False
        }
    }
}

impl std::fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::True => write!(f, "True"),
            Self::False => write!(f, "False"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Kubernetes-style condition
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct Condition {
    /// Type of condition (e.g., Ready, HeartbeatReady)
    #[serde(rename = "type")]
    pub type_: String,

    /// Status of the condition (True, False, Unknown)
    pub status: ConditionStatus,

    /// Machine-readable reason for the condition
    pub reason: String,

    /// Human-readable message
    pub message: String,

    /// Last time the condition transitioned
    #[serde(rename = "lastTransitionTime")]
    pub last_transition_time: DateTime<Utc>,
}

impl Condition {
    /// Create a new condition with the current timestamp
    pub fn new(
        type_: impl Into<String>,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            type_: type_.into(),
            status,
            reason: reason.into(),
            message: message.into(),
            last_transition_time: Utc::now(),
        }
    }

    /// True if type, status, reason and message match (timestamp ignored)
    pub fn same_state(&self, other: &Condition) -> bool {
        self.type_ == other.type_
            && self.status == other.status
            && self.reason == other.reason
            && self.message == other.message
    }
}

/// Upsert `condition` into `conditions` by type.
///
/// `lastTransitionTime` is carried over from the existing entry when the
/// status did not change, so repeated identical proposals do not churn the
/// timestamp.
pub fn set_condition(conditions: &mut Vec<Condition>, mut condition: Condition) {
    match conditions.iter_mut().find(|c| c.type_ == condition.type_) {
        Some(existing) => {
            if existing.status == condition.status {
                condition.last_transition_time = existing.last_transition_time;
            }
            *existing = condition;
        }
        None => conditions.push(condition),
    }
}
