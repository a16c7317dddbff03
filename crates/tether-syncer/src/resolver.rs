//! Conflict resolution between the logical and physical snapshots
//!
//! [`resolve`] is a pure function of the two snapshots, the markers from the
//! last successful sync, and the type's flavor. Running it twice on the same
//! inputs yields the same decision, so work items can be retried freely.
//!
//! Ownership is asymmetric: the logical side wins for spec, the physical
//! side wins for status.

use chrono::{DateTime, Utc};
use kube::api::DynamicObject;

use tether_common::crd::ConditionStatus;
use tether_common::ObjectKey;

use crate::pairs::SyncMarkers;
use crate::transform::{
    drifted, is_deleting, spec_view, status_of, with_status, with_synced_condition,
    TransformContext,
};

/// Reason on the `Synced=False` condition after out-of-band physical removal
pub const REASON_PHYSICAL_REMOVED: &str = "PhysicalObjectRemoved";
/// Reason on the `Synced=False` condition after a validation rejection
pub const REASON_VALIDATION_FAILED: &str = "ValidationFailed";
/// Reason on the `Synced=False` condition once a pair is degraded
pub const REASON_SYNC_DEGRADED: &str = "SyncDegraded";

/// Per-type synchronizer behavior
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SyncFlavor {
    /// Spec flows down, status flows up
    SpecAndStatus,
    /// Spec flows down; the type has no status to reflect
    SpecOnly,
}

impl SyncFlavor {
    /// True if physical status is copied to the logical object
    pub fn upsyncs_status(&self) -> bool {
        matches!(self, Self::SpecAndStatus)
    }
}

/// One write to perform
#[derive(Clone, Debug, PartialEq)]
pub enum SyncAction {
    /// Create the object on the physical cluster
    CreatePhysical(DynamicObject),
    /// Replace the physical object (carries the physical resourceVersion)
    UpdatePhysical(DynamicObject),
    /// Delete a tracked physical object
    DeletePhysical {
        /// Physical key
        key: ObjectKey,
        /// Precondition
        resource_version: Option<String>,
    },
    /// Replace the logical status (carries the logical resourceVersion)
    UpdateLogicalStatus(DynamicObject),
    /// Record out-of-band physical removal, optionally with a status write
    ReportPhysicalRemoved(Option<DynamicObject>),
}

/// Outcome of resolution
#[derive(Clone, Debug, PartialEq)]
pub enum Decision {
    /// Both sides agree; refresh markers only
    Noop,
    /// Perform writes in order
    Apply {
        /// Writes, physical spec before logical status
        actions: Vec<SyncAction>,
        /// Both sides changed spec since the last sync
        conflict: bool,
    },
    /// Object gone on both sides; drop the pair
    Forget,
    /// Physical object not created by this syncer; leave it alone
    Ignore,
}

/// Inputs for one resolution
#[derive(Clone, Copy, Debug)]
pub struct ResolveInput<'a> {
    /// Logical snapshot
    pub logical: Option<&'a DynamicObject>,
    /// Physical snapshot
    pub physical: Option<&'a DynamicObject>,
    /// Markers from the last successful sync
    pub markers: Option<&'a SyncMarkers>,
    /// Type flavor
    pub flavor: SyncFlavor,
    /// Feature flag; disables upsync for every type when false
    pub status_upsync: bool,
    /// Timestamp for the last-sync annotation
    pub now: DateTime<Utc>,
}

/// Decide what to write for one key
pub fn resolve(ctx: &TransformContext, input: ResolveInput<'_>) -> Decision {
    let logical = input.logical.filter(|l| !is_deleting(l));

    match (logical, input.physical) {
        (None, None) => Decision::Forget,

        (None, Some(physical)) => {
            if !ctx.is_tracked(physical) {
                return Decision::Ignore;
            }
            Decision::Apply {
                actions: vec![SyncAction::DeletePhysical {
                    key: ObjectKey::of(physical),
                    resource_version: physical.metadata.resource_version.clone(),
                }],
                conflict: false,
            }
        }

        (Some(logical), None) => {
            let previously_synced = input.markers.is_some_and(|m| m.physical_rv.is_some());
            let spec_changed = input
                .markers
                .map_or(true, |m| m.logical_spec_changed(logical));

            if previously_synced && !spec_changed {
                let status_write = if input.flavor.upsyncs_status() {
                    with_synced_condition(
                        logical,
                        ConditionStatus::False,
                        REASON_PHYSICAL_REMOVED,
                        &format!(
                            "object was removed from sync target {}; edit the spec to recreate it",
                            ctx.target.name
                        ),
                    )
                } else {
                    None
                };
                return Decision::Apply {
                    actions: vec![SyncAction::ReportPhysicalRemoved(status_write)],
                    conflict: false,
                };
            }

            Decision::Apply {
                actions: vec![SyncAction::CreatePhysical(
                    ctx.to_physical(logical, input.now),
                )],
                conflict: false,
            }
        }

        (Some(logical), Some(physical)) => {
            if !ctx.is_tracked(physical) {
                return Decision::Ignore;
            }
            resolve_both(ctx, logical, physical, input)
        }
    }
}

fn resolve_both(
    ctx: &TransformContext,
    logical: &DynamicObject,
    physical: &DynamicObject,
    input: ResolveInput<'_>,
) -> Decision {
    let mut desired = ctx.to_physical(logical, input.now);
    let desired_view = spec_view(&desired);
    let actual_view = spec_view(physical);
    let drift = drifted(&actual_view, &desired_view);

    let logical_changed = input
        .markers
        .is_some_and(|m| m.logical_spec_changed(logical));
    let physical_changed = input
        .markers
        .is_some_and(|m| m.physical_spec_changed(physical));

    let mut actions = Vec::new();

    if drift || (logical_changed && actual_view != desired_view) {
        desired.metadata.resource_version = physical.metadata.resource_version.clone();
        actions.push(SyncAction::UpdatePhysical(desired));
    }

    if input.status_upsync && input.flavor.upsyncs_status() {
        let physical_status = status_of(physical);
        if physical_status.is_some() && physical_status != status_of(logical) {
            actions.push(SyncAction::UpdateLogicalStatus(with_status(
                logical,
                physical_status.cloned(),
            )));
        }
    }

    if actions.is_empty() {
        Decision::Noop
    } else {
        Decision::Apply {
            actions,
            conflict: logical_changed && physical_changed && drift,
        }
    }
}
