//! OpenTelemetry instruments for the syncer
//!
//! Instruments are created lazily against the global meter, so recording is
//! a no-op until [`crate::telemetry::init_telemetry`] installs an exporter.

use once_cell::sync::Lazy;
use opentelemetry::global;
use opentelemetry::metrics::{Counter, Gauge, Meter};
use opentelemetry::KeyValue;

use crate::crd::SyncTargetPhase;

static METER: Lazy<Meter> = Lazy::new(|| global::meter("tether"));

/// Counter of heartbeat probes
///
/// Labels:
/// - `sync_target`: SyncTarget name
/// - `result`: success, error
pub static HEARTBEATS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("tether_heartbeats_total")
        .with_description("Heartbeat probes against the physical cluster")
        .with_unit("{heartbeats}")
        .build()
});

/// Counter of per-object sync operations
///
/// Labels:
/// - `resource`: group/resource, e.g. `deployments.apps`
/// - `result`: see [`SyncResult`]
pub static SYNC_OPERATIONS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("tether_sync_operations_total")
        .with_description("Reconciliations of tracked resource pairs")
        .with_unit("{operations}")
        .build()
});

/// Gauge set to 1 for the current SyncTarget phase and 0 for the others
///
/// Labels:
/// - `sync_target`: SyncTarget name
/// - `phase`: pending, active, unavailable, terminating
pub static SYNC_TARGET_PHASE: Lazy<Gauge<i64>> = Lazy::new(|| {
    METER
        .i64_gauge("tether_sync_target_phase")
        .with_description("Current lifecycle phase of the SyncTarget")
        .build()
});

/// Gauge of running resource synchronizers
///
/// Labels:
/// - `sync_target`: SyncTarget name
pub static ACTIVE_SYNCHRONIZERS: Lazy<Gauge<i64>> = Lazy::new(|| {
    METER
        .i64_gauge("tether_active_synchronizers")
        .with_description("Number of resource types currently being synchronized")
        .with_unit("{synchronizers}")
        .build()
});

/// Outcome label for [`SYNC_OPERATIONS`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncResult {
    /// A write was performed on either side
    Synced,
    /// Both sides already agreed
    Noop,
    /// Optimistic-concurrency rejection; requeued
    Conflict,
    /// Any other failure
    Error,
}

impl SyncResult {
    /// Convert to label value
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Synced => "synced",
            Self::Noop => "noop",
            Self::Conflict => "conflict",
            Self::Error => "error",
        }
    }
}

/// Record the outcome of one reconcile
pub fn record_sync(resource: &str, result: SyncResult) {
    SYNC_OPERATIONS.add(
        1,
        &[
            KeyValue::new("resource", resource.to_string()),
            KeyValue::new("result", result.as_str()),
        ],
    );
}

/// Record one heartbeat probe
pub fn record_heartbeat(sync_target: &str, success: bool) {
    HEARTBEATS.add(
        1,
        &[
            KeyValue::new("sync_target", sync_target.to_string()),
            KeyValue::new("result", if success { "success" } else { "error" }),
        ],
    );
}

/// Publish the current phase for a SyncTarget
pub fn record_phase(sync_target: &str, current: &SyncTargetPhase) {
    for phase in SyncTargetPhase::ALL {
        let value = if &phase == current { 1 } else { 0 };
        SYNC_TARGET_PHASE.record(
            value,
            &[
                KeyValue::new("sync_target", sync_target.to_string()),
                KeyValue::new("phase", phase.as_label()),
            ],
        );
    }
}

/// Publish the number of running synchronizers
pub fn record_active_synchronizers(sync_target: &str, count: usize) {
    ACTIVE_SYNCHRONIZERS.record(
        count as i64,
        &[KeyValue::new("sync_target", sync_target.to_string())],
    );
}
