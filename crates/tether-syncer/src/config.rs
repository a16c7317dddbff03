//! Syncer configuration
//!
//! Loaded once at startup from an optional YAML file, then overridden by
//! command-line flags. The resulting [`SyncerConfig`] is read-only and is
//! handed to every component at construction time.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use tether_common::retry::BackoffPolicy;
use tether_common::{Error, ResourceType, Result};

/// Types never synchronized regardless of discovery or declarations.
///
/// These are cluster plumbing or control-plane-only APIs; syncing them would
/// either fight the physical cluster's own controllers or leak control-plane
/// objects onto the target.
pub const BUILTIN_DENY: &[&str] = &[
    "events",
    "events.events.k8s.io",
    "namespaces",
    "nodes",
    "pods",
    "replicasets.apps",
    "endpoints",
    "endpointslices.discovery.k8s.io",
    "leases.coordination.k8s.io",
    "componentstatuses",
    "bindings",
    "customresourcedefinitions.apiextensions.k8s.io",
    "apiservices.apiregistration.k8s.io",
    "synctargets.workload.tether.dev",
];

/// Top-level syncer configuration
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct SyncerConfig {
    /// Name of the SyncTarget this process serves
    pub sync_target: String,

    /// Kubeconfig for the logical workspace; `None` infers from the environment
    pub logical_kubeconfig: Option<PathBuf>,

    /// Kubeconfig for the physical cluster, as resolved by placement
    pub physical_kubeconfig: Option<PathBuf>,

    /// Worker tasks per resource type
    pub workers: usize,

    /// Full resync period per synchronizer, in seconds
    pub resync_period_secs: u64,

    /// Heartbeat probe period, in seconds
    pub heartbeat_period_secs: u64,

    /// Consecutive heartbeat failures before HeartbeatReady=False
    pub heartbeat_failure_threshold: u32,

    /// Consecutive non-transient failures before a pair is Degraded
    pub max_consecutive_failures: u32,

    /// Degraded plus failed pairs tolerated before SyncerReady=False
    pub degraded_threshold: usize,

    /// Deadline for any single remote call, in seconds
    pub call_timeout_secs: u64,

    /// Base delay for per-key retry backoff, in seconds
    pub backoff_base_secs: u64,

    /// Cap for per-key retry backoff, in seconds
    pub backoff_cap_secs: u64,

    /// Resource discovery period, in seconds
    pub discovery_period_secs: u64,

    /// Only these types are eligible when non-empty (`resource.group` form)
    pub allow: Vec<String>,

    /// Types never eligible (`resource.group` form); added to [`BUILTIN_DENY`]
    pub deny: Vec<String>,

    /// Field transformations applied on the way to the physical cluster
    pub transforms: TransformConfig,

    /// Feature flags
    pub features: FeatureFlags,
}

impl Default for SyncerConfig {
    fn default() -> Self {
        Self {
            sync_target: String::new(),
            logical_kubeconfig: None,
            physical_kubeconfig: None,
            workers: 4,
            resync_period_secs: 600,
            heartbeat_period_secs: 30,
            heartbeat_failure_threshold: 3,
            max_consecutive_failures: 5,
            degraded_threshold: 0,
            call_timeout_secs: 30,
            backoff_base_secs: 1,
            backoff_cap_secs: 300,
            discovery_period_secs: 60,
            allow: Vec::new(),
            deny: Vec::new(),
            transforms: TransformConfig::default(),
            features: FeatureFlags::default(),
        }
    }
}

/// Namespace mapping between logical and physical sides
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(tag = "strategy", rename_all = "camelCase")]
pub enum NamespaceStrategy {
    /// Physical namespace equals the logical namespace
    #[default]
    Identity,
    /// `<prefix>-<hash(workspace/namespace)>`, isolating workspaces that
    /// share a physical cluster
    Prefixed {
        /// Prefix of every physical namespace
        prefix: String,
    },
}

/// Field transformation settings
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct TransformConfig {
    /// Namespace remapping
    pub namespace: NamespaceStrategy,
    /// Per-kind rules applied in order
    pub rules: Vec<TransformRule>,
}

/// One field transformation rule
///
/// Applies to objects whose kind is listed in `kinds` (all kinds when
/// empty) and, if `when_annotation` is set, that carry that annotation on
/// the logical side.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct TransformRule {
    /// Kinds the rule applies to
    pub kinds: Vec<String>,
    /// Annotation that must be present for the rule to fire
    pub when_annotation: Option<String>,
    /// JSON pointer → value to set (e.g. resource limit overrides)
    pub set: BTreeMap<String, serde_json::Value>,
    /// JSON pointers to remove
    pub remove: Vec<String>,
}

/// Boolean feature flags read at startup
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct FeatureFlags {
    /// Reflect physical status into logical objects
    pub status_upsync: bool,
}

impl Default for FeatureFlags {
    fn default() -> Self {
        Self {
            status_upsync: true,
        }
    }
}

impl SyncerConfig {
    /// Load a config file; missing fields take their defaults
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::config(format!("failed to read {}: {}", path.display(), e)))?;
        Self::from_yaml(&raw)
    }

    /// Parse a YAML document
    pub fn from_yaml(raw: &str) -> Result<Self> {
        serde_yaml::from_str(raw).map_err(|e| Error::config(format!("invalid config: {}", e)))
    }

    /// Reject configurations the syncer cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.sync_target.is_empty() {
            return Err(Error::config("syncTarget must be set"));
        }
        if self.workers == 0 {
            return Err(Error::config("workers must be at least 1"));
        }
        for (name, value) in [
            ("resyncPeriodSecs", self.resync_period_secs),
            ("heartbeatPeriodSecs", self.heartbeat_period_secs),
            ("callTimeoutSecs", self.call_timeout_secs),
            ("backoffBaseSecs", self.backoff_base_secs),
            ("discoveryPeriodSecs", self.discovery_period_secs),
        ] {
            if value == 0 {
                return Err(Error::config(format!("{} must be greater than 0", name)));
            }
        }
        if self.backoff_cap_secs < self.backoff_base_secs {
            return Err(Error::config("backoffCapSecs must be >= backoffBaseSecs"));
        }
        if self.heartbeat_failure_threshold == 0 {
            return Err(Error::config("heartbeatFailureThreshold must be at least 1"));
        }
        if self.max_consecutive_failures == 0 {
            return Err(Error::config("maxConsecutiveFailures must be at least 1"));
        }

        for filter in self.allow.iter().chain(self.deny.iter()) {
            validate_filter(filter)?;
        }

        if let NamespaceStrategy::Prefixed { prefix } = &self.transforms.namespace {
            if prefix.is_empty() || prefix.len() > 40 || !is_dns_label(prefix) {
                return Err(Error::config(format!(
                    "namespace prefix '{}' must be a DNS label of at most 40 characters",
                    prefix
                )));
            }
        }

        for rule in &self.transforms.rules {
            for pointer in rule.set.keys().chain(rule.remove.iter()) {
                if !pointer.starts_with('/') {
                    return Err(Error::config(format!(
                        "transform pointer '{}' must start with '/'",
                        pointer
                    )));
                }
            }
        }

        Ok(())
    }

    /// Deadline for remote calls
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    /// Full resync period
    pub fn resync_period(&self) -> Duration {
        Duration::from_secs(self.resync_period_secs)
    }

    /// Heartbeat period
    pub fn heartbeat_period(&self) -> Duration {
        Duration::from_secs(self.heartbeat_period_secs)
    }

    /// Discovery period
    pub fn discovery_period(&self) -> Duration {
        Duration::from_secs(self.discovery_period_secs)
    }

    /// Retry backoff for work items and lifecycle errors
    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy::new(
            Duration::from_secs(self.backoff_base_secs),
            Duration::from_secs(self.backoff_cap_secs),
        )
    }

    /// Apply the allow and deny filters to a type
    pub fn permits(&self, rt: &ResourceType) -> bool {
        let gr = rt.group_resource();
        let denied = BUILTIN_DENY.iter().any(|d| filter_matches(d, rt, &gr))
            || self.deny.iter().any(|d| filter_matches(d, rt, &gr));
        if denied {
            return false;
        }
        self.allow.is_empty() || self.allow.iter().any(|a| filter_matches(a, rt, &gr))
    }
}

/// `resource.group`, `resource` (core) or `*.group`
fn filter_matches(filter: &str, rt: &ResourceType, group_resource: &str) -> bool {
    match filter.strip_prefix("*.") {
        Some(group) => rt.group == group,
        None => filter == group_resource,
    }
}

fn validate_filter(filter: &str) -> Result<()> {
    let valid = !filter.is_empty()
        && !filter.chars().any(char::is_whitespace)
        && !filter.contains('/')
        && filter != "*."
        && filter.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || "-.*".contains(c))
        && filter.matches('*').count() <= 1
        && (!filter.contains('*') || filter.starts_with("*."));
    if valid {
        Ok(())
    } else {
        Err(Error::config(format!(
            "malformed resource filter '{}', expected 'resource.group', 'resource' or '*.group'",
            filter
        )))
    }
}

fn is_dns_label(s: &str) -> bool {
    s.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        && !s.starts_with('-')
        && !s.ends_with('-')
}
