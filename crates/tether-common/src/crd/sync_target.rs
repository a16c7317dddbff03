//! SyncTarget Custom Resource Definition
//!
//! A SyncTarget registers one physical cluster with a logical workspace. The
//! syncer serving it owns the record's status and finalizer; operators own
//! the spec.

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{Condition, SyncTargetPhase};
use crate::TETHER_SYSTEM_NAMESPACE;

/// Default number of agent replicas on the physical cluster
pub const DEFAULT_AGENT_REPLICAS: i32 = 1;

/// Specification for a SyncTarget
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "workload.tether.dev",
    version = "v1alpha1",
    kind = "SyncTarget",
    plural = "synctargets",
    shortname = "st",
    status = "SyncTargetStatus",
    namespaced = false,
    printcolumn = r#"{"name":"Workspace","type":"string","jsonPath":".spec.workspace"}"#,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Heartbeat","type":"date","jsonPath":".status.lastHeartbeatTime"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct SyncTargetSpec {
    /// Logical-workspace path this target belongs to (e.g. "root:org:team")
    pub workspace: String,

    /// Resource types the physical cluster is declared to support.
    ///
    /// Empty means no restriction beyond what both sides serve.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub supported_resources: Vec<SupportedResource>,

    /// On-target agent deployment settings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<AgentSpec>,

    /// What termination does with physical objects already synced
    #[serde(default)]
    pub retention: RetentionPolicy,
}

/// A declared resource capability, `{group, resource}`
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub struct SupportedResource {
    /// API group; empty string for the core group
    #[serde(default)]
    pub group: String,
    /// Plural resource name (e.g. "deployments")
    pub resource: String,
}

impl SupportedResource {
    /// Build a declaration for the given group and plural resource
    pub fn new(group: impl Into<String>, resource: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            resource: resource.into(),
        }
    }

    /// True if this declaration names the given group and plural
    pub fn matches(&self, group: &str, resource: &str) -> bool {
        self.group == group && self.resource == resource
    }
}

impl std::fmt::Display for SupportedResource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.group.is_empty() {
            write!(f, "{}", self.resource)
        } else {
            write!(f, "{}.{}", self.resource, self.group)
        }
    }
}

/// Agent deployment settings
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AgentSpec {
    /// Container image for the agent
    pub image: String,

    /// Namespace on the physical cluster (default: tether-system)
    #[serde(default = "default_agent_namespace")]
    pub namespace: String,

    /// Replica count (default: 1)
    #[serde(default = "default_agent_replicas")]
    pub replicas: i32,
}

fn default_agent_namespace() -> String {
    TETHER_SYSTEM_NAMESPACE.to_string()
}

fn default_agent_replicas() -> i32 {
    DEFAULT_AGENT_REPLICAS
}

/// Handling of synced physical objects when the SyncTarget is deleted
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum RetentionPolicy {
    /// Delete every physical object carrying this target's tracking label
    #[default]
    Delete,
    /// Leave physical objects in place
    Orphan,
}

impl std::fmt::Display for RetentionPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Delete => write!(f, "Delete"),
            Self::Orphan => write!(f, "Orphan"),
        }
    }
}

impl SyncTargetSpec {
    /// Validate the SyncTarget specification
    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.workspace.trim().is_empty() {
            return Err(crate::Error::validation_for_field(
                "SyncTarget",
                "spec.workspace",
                "workspace cannot be empty",
            ));
        }

        for (i, res) in self.supported_resources.iter().enumerate() {
            if res.resource.is_empty() {
                return Err(crate::Error::validation_for_field(
                    "SyncTarget",
                    format!("spec.supportedResources[{}].resource", i),
                    "resource cannot be empty",
                ));
            }
            if res.resource.chars().any(|c| c.is_uppercase()) {
                return Err(crate::Error::validation_for_field(
                    "SyncTarget",
                    format!("spec.supportedResources[{}].resource", i),
                    format!("resource '{}' must be a lowercase plural", res.resource),
                ));
            }
        }

        if let Some(agent) = &self.agent {
            if agent.image.is_empty() {
                return Err(crate::Error::validation_for_field(
                    "SyncTarget",
                    "spec.agent.image",
                    "agent image cannot be empty",
                ));
            }
            if agent.namespace.is_empty() {
                return Err(crate::Error::validation_for_field(
                    "SyncTarget",
                    "spec.agent.namespace",
                    "agent namespace cannot be empty",
                ));
            }
            if agent.replicas < 0 {
                return Err(crate::Error::validation_for_field(
                    "SyncTarget",
                    "spec.agent.replicas",
                    "replicas cannot be negative",
                ));
            }
        }

        Ok(())
    }

    /// True if `{group, resource}` passes the declared capability list
    pub fn declares(&self, group: &str, resource: &str) -> bool {
        self.supported_resources.is_empty()
            || self
                .supported_resources
                .iter()
                .any(|r| r.matches(group, resource))
    }
}

/// Status for a SyncTarget
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SyncTargetStatus {
    /// The generation of the spec last processed by the lifecycle manager
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Current lifecycle phase
    #[serde(default)]
    pub phase: SyncTargetPhase,

    /// Human-readable message about current state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Ready, SyncerReady and HeartbeatReady conditions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Time of the last successful heartbeat probe
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_heartbeat_time: Option<DateTime<Utc>>,

    /// Heartbeat sequence number
    #[serde(default)]
    pub heartbeat_count: u64,

    /// Cumulative failed heartbeats
    #[serde(default)]
    pub heartbeat_errors: u64,

    /// Resource types currently synchronized (e.g. "deployments.apps")
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub synced_resources: Vec<String>,

    /// Types that lost eligibility while tracked objects remained
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub orphaned_resources: Vec<String>,
}

impl SyncTargetStatus {
    /// Create a new status with the given phase
    pub fn with_phase(phase: SyncTargetPhase) -> Self {
        Self {
            phase,
            ..Default::default()
        }
    }

    /// Set the message and return self for chaining
    pub fn message(mut self, msg: impl Into<String>) -> Self {
        self.message = Some(msg.into());
        self
    }

    /// Upsert a condition and return self for chaining
    pub fn condition(mut self, condition: Condition) -> Self {
        super::types::set_condition(&mut self.conditions, condition);
        self
    }

    /// Look up a condition by type
    pub fn get_condition(&self, type_: &str) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.type_ == type_)
    }

    /// Compare two statuses ignoring condition timestamps.
    ///
    /// Used as the idempotency guard before patching.
    pub fn is_equivalent(&self, other: &SyncTargetStatus) -> bool {
        self.phase == other.phase
            && self.message == other.message
            && self.observed_generation == other.observed_generation
            && self.last_heartbeat_time == other.last_heartbeat_time
            && self.heartbeat_count == other.heartbeat_count
            && self.heartbeat_errors == other.heartbeat_errors
            && self.synced_resources == other.synced_resources
            && self.orphaned_resources == other.orphaned_resources
            && self.conditions.len() == other.conditions.len()
            && self.conditions.iter().all(|c| {
                other
                    .get_condition(&c.type_)
                    .is_some_and(|o| o.same_state(c))
            })
    }
}

impl SyncTarget {
    /// Current phase, defaulting to Pending when no status is recorded
    pub fn phase(&self) -> SyncTargetPhase {
        self.status
            .as_ref()
            .map(|s| s.phase.clone())
            .unwrap_or_default()
    }

    /// Agent namespace, honoring the default
    pub fn agent_namespace(&self) -> &str {
        self.spec
            .agent
            .as_ref()
            .map(|a| a.namespace.as_str())
            .unwrap_or(TETHER_SYSTEM_NAMESPACE)
    }
}
