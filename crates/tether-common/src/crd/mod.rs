//! Custom Resource Definitions for Tether

mod sync_target;
mod types;

pub use sync_target::{
    AgentSpec, RetentionPolicy, SupportedResource, SyncTarget, SyncTargetSpec, SyncTargetStatus,
    DEFAULT_AGENT_REPLICAS,
};
pub use types::{
    set_condition, Condition, ConditionStatus, SyncTargetPhase, CONDITION_HEARTBEAT_READY,
    CONDITION_READY, CONDITION_SYNCED, CONDITION_SYNCER_READY,
};
