//! Common types for Tether: CRDs, errors, and utilities

#![deny(missing_docs)]

pub mod crd;
pub mod error;
pub mod events;
pub mod kube_utils;
pub mod metrics;
pub mod resource;
pub mod retry;
pub mod telemetry;

pub use error::{Error, ErrorKind};
pub use resource::{ObjectKey, ResourceType};

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Namespace for Tether system resources on the physical cluster (agent, RBAC)
pub const TETHER_SYSTEM_NAMESPACE: &str = "tether-system";

/// Field manager name used for every write issued by the syncer
pub const FIELD_MANAGER: &str = "tether-syncer";

/// Finalizer guarding SyncTarget deletion until cleanup has completed
pub const SYNCER_FINALIZER: &str = "workload.tether.dev/syncer";

/// Label (and annotation) carrying the owning SyncTarget name.
///
/// On logical objects it is the placement decision; on physical objects it
/// marks the object as created by this syncer.
pub const SYNC_TARGET_LABEL: &str = "tether.dev/sync-target";

/// Annotation carrying the owning SyncTarget UID on physical objects
pub const SYNC_TARGET_UID_ANNOTATION: &str = "tether.dev/sync-target-uid";

/// Annotation carrying the logical-workspace path on physical objects
pub const WORKSPACE_ANNOTATION: &str = "tether.dev/workspace";

/// Annotation carrying the logical-side namespace on physical objects
pub const LOGICAL_NAMESPACE_ANNOTATION: &str = "tether.dev/logical-namespace";

/// Annotation carrying the timestamp of the last write from the syncer
pub const LAST_SYNC_ANNOTATION: &str = "tether.dev/last-sync";

/// Prefix shared by every control-plane-only label and annotation
pub const TETHER_KEY_PREFIX: &str = "tether.dev/";

/// Build the label selector that scopes objects to a SyncTarget
pub fn sync_target_selector(target: &str) -> String {
    format!("{}={}", SYNC_TARGET_LABEL, target)
}
