//! Tracked resource pairs
//!
//! One table per synchronizer, keyed by the logical object key. The table is
//! rebuilt from a full resync after a restart; nothing here is persisted.

use std::fmt;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use kube::api::DynamicObject;

use tether_common::ObjectKey;

/// Lifecycle state of a pair
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PairState {
    /// Last reconcile succeeded
    #[default]
    Synced,
    /// Too many consecutive failures; waiting for the periodic resync
    Degraded,
    /// Rejected as invalid; waiting for a logical spec change
    Failed,
    /// Physical object removed out-of-band; waiting for a logical spec change
    PhysicalRemoved,
    /// Resource type lost eligibility; the pair is no longer reconciled
    Orphaned,
}

impl fmt::Display for PairState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Synced => write!(f, "Synced"),
            Self::Degraded => write!(f, "Degraded"),
            Self::Failed => write!(f, "Failed"),
            Self::PhysicalRemoved => write!(f, "PhysicalRemoved"),
            Self::Orphaned => write!(f, "Orphaned"),
        }
    }
}

/// Versions observed at the last successful sync
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SyncMarkers {
    /// Logical resourceVersion
    pub logical_rv: Option<String>,
    /// Logical generation (bumps on spec changes only)
    pub logical_generation: Option<i64>,
    /// Physical resourceVersion
    pub physical_rv: Option<String>,
    /// Physical generation
    pub physical_generation: Option<i64>,
}

impl SyncMarkers {
    /// Capture the versions of whatever currently exists on each side
    pub fn observe(logical: Option<&DynamicObject>, physical: Option<&DynamicObject>) -> Self {
        Self {
            logical_rv: logical.and_then(|o| o.metadata.resource_version.clone()),
            logical_generation: logical.and_then(|o| o.metadata.generation),
            physical_rv: physical.and_then(|o| o.metadata.resource_version.clone()),
            physical_generation: physical.and_then(|o| o.metadata.generation),
        }
    }

    /// True if the logical spec moved since these markers were taken.
    ///
    /// Falls back to resourceVersion for types without a generation
    /// (ConfigMap, Secret, ServiceAccount).
    pub fn logical_spec_changed(&self, logical: &DynamicObject) -> bool {
        match (self.logical_generation, logical.metadata.generation) {
            (Some(recorded), Some(current)) => recorded != current,
            _ => self.logical_rv != logical.metadata.resource_version,
        }
    }

    /// True if the physical spec moved since these markers were taken.
    ///
    /// Falls back to resourceVersion for types without a generation.
    pub fn physical_spec_changed(&self, physical: &DynamicObject) -> bool {
        match (self.physical_generation, physical.metadata.generation) {
            (Some(recorded), Some(current)) => recorded != current,
            _ => self.physical_rv != physical.metadata.resource_version,
        }
    }
}

/// Sync bookkeeping for one logical/physical pair
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TrackedPair {
    /// Versions at the last successful sync
    pub markers: SyncMarkers,
    /// Time of the last successful sync
    pub last_sync: Option<DateTime<Utc>>,
    /// Both sides changed spec since the previous sync
    pub conflict: bool,
    /// Current state
    pub state: PairState,
    /// Consecutive non-transient failures
    pub consecutive_failures: u32,
    /// Most recent error message
    pub last_error: Option<String>,
    /// Logical generation that was rejected as invalid
    pub failed_generation: Option<i64>,
    /// Logical resourceVersion at the rejection, for types without a generation
    pub failed_rv: Option<String>,
}

impl TrackedPair {
    /// True if `logical` is still the version that was rejected as invalid
    pub fn rejected(&self, logical: &DynamicObject) -> bool {
        if self.state != PairState::Failed {
            return false;
        }
        match (self.failed_generation, logical.metadata.generation) {
            (Some(failed), Some(current)) => failed == current,
            _ => self.failed_rv.is_some() && self.failed_rv == logical.metadata.resource_version,
        }
    }
}

/// Aggregate pair counts for health reporting
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PairCounts {
    /// All tracked pairs
    pub total: usize,
    /// Pairs in `Degraded`
    pub degraded: usize,
    /// Pairs in `Failed`
    pub failed: usize,
    /// Pairs in `PhysicalRemoved`
    pub physical_removed: usize,
    /// Pairs in `Orphaned`
    pub orphaned: usize,
}

/// Concurrent pair table for one resource type
#[derive(Default)]
pub struct PairTable {
    pairs: DashMap<ObjectKey, TrackedPair>,
}

impl PairTable {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of one pair
    pub fn get(&self, key: &ObjectKey) -> Option<TrackedPair> {
        self.pairs.get(key).map(|p| p.clone())
    }

    /// Record a successful reconcile.
    ///
    /// Clears failure tracking and stores the new markers.
    pub fn record_success(
        &self,
        key: &ObjectKey,
        markers: SyncMarkers,
        conflict: bool,
        state: PairState,
    ) {
        let mut entry = self.pairs.entry(key.clone()).or_default();
        entry.markers = markers;
        entry.last_sync = Some(Utc::now());
        entry.conflict = conflict;
        entry.state = state;
        entry.consecutive_failures = 0;
        entry.last_error = None;
        entry.failed_generation = None;
        entry.failed_rv = None;
    }

    /// Record a failure that counts toward degradation.
    ///
    /// Returns the resulting state: `Degraded` once `max_failures`
    /// consecutive failures have been seen, otherwise the previous state.
    pub fn record_failure(&self, key: &ObjectKey, error: &str, max_failures: u32) -> PairState {
        let mut entry = self.pairs.entry(key.clone()).or_default();
        entry.consecutive_failures += 1;
        entry.last_error = Some(error.to_string());
        if entry.consecutive_failures >= max_failures {
            entry.state = PairState::Degraded;
        }
        entry.state
    }

    /// Record a failure that does not count toward degradation
    pub fn record_transient(&self, key: &ObjectKey, error: &str) {
        let mut entry = self.pairs.entry(key.clone()).or_default();
        entry.last_error = Some(error.to_string());
    }

    /// Mark a pair permanently failed for the given logical version
    pub fn mark_failed(&self, key: &ObjectKey, logical: Option<&DynamicObject>, error: &str) {
        let mut entry = self.pairs.entry(key.clone()).or_default();
        entry.state = PairState::Failed;
        entry.failed_generation = logical.and_then(|l| l.metadata.generation);
        entry.failed_rv = logical.and_then(|l| l.metadata.resource_version.clone());
        entry.last_error = Some(error.to_string());
    }

    /// Forget a pair
    pub fn remove(&self, key: &ObjectKey) -> Option<TrackedPair> {
        self.pairs.remove(key).map(|(_, p)| p)
    }

    /// All keys currently tracked
    pub fn keys(&self) -> Vec<ObjectKey> {
        self.pairs.iter().map(|e| e.key().clone()).collect()
    }

    /// Mark every pair `Orphaned`; returns how many were marked
    pub fn mark_orphaned(&self) -> usize {
        let mut count = 0;
        for mut entry in self.pairs.iter_mut() {
            entry.state = PairState::Orphaned;
            count += 1;
        }
        count
    }

    /// Number of tracked pairs
    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    /// True when no pairs are tracked
    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    /// Count pairs by state
    pub fn counts(&self) -> PairCounts {
        let mut counts = PairCounts::default();
        for entry in self.pairs.iter() {
            counts.total += 1;
            match entry.state {
                PairState::Degraded => counts.degraded += 1,
                PairState::Failed => counts.failed += 1,
                PairState::PhysicalRemoved => counts.physical_removed += 1,
                PairState::Orphaned => counts.orphaned += 1,
                PairState::Synced => {}
            }
        }
        counts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_common::ResourceType;

    fn key() -> ObjectKey {
        ObjectKey::namespaced("default", "web")
    }

    fn object(rv: &str, generation: Option<i64>) -> DynamicObject {
        let ar = ResourceType::new("apps/v1", "Deployment", true).api_resource();
        let mut obj = DynamicObject::new("web", &ar).within("default");
        obj.metadata.resource_version = Some(rv.to_string());
        obj.metadata.generation = generation;
        obj
    }

    #[test]
    fn test_failures_degrade_at_threshold() {
        let table = PairTable::new();
        for _ in 0..4 {
            assert_eq!(table.record_failure(&key(), "forbidden", 5), PairState::Synced);
        }
        assert_eq!(table.record_failure(&key(), "forbidden", 5), PairState::Degraded);
        assert_eq!(table.counts().degraded, 1);

        // Recovery resets the counter
        table.record_success(&key(), SyncMarkers::default(), false, PairState::Synced);
        let pair = table.get(&key()).unwrap();
        assert_eq!(pair.state, PairState::Synced);
        assert_eq!(pair.consecutive_failures, 0);
        assert!(pair.last_error.is_none());
    }

    #[test]
    fn test_transient_failures_do_not_count() {
        let table = PairTable::new();
        for _ in 0..10 {
            table.record_transient(&key(), "timeout");
        }
        let pair = table.get(&key()).unwrap();
        assert_eq!(pair.consecutive_failures, 0);
        assert_eq!(pair.state, PairState::Synced);
    }

    #[test]
    fn test_mark_orphaned() {
        let table = PairTable::new();
        table.record_success(&key(), SyncMarkers::default(), false, PairState::Synced);
        table.mark_failed(
            &ObjectKey::namespaced("default", "bad"),
            Some(&object("4", Some(2))),
            "invalid",
        );
        assert_eq!(table.mark_orphaned(), 2);
        assert_eq!(table.counts().orphaned, 2);
    }

    #[test]
    fn test_marker_change_detection() {
        let markers = SyncMarkers::observe(Some(&object("5", Some(2))), Some(&object("9", Some(1))));

        // Status-only write bumps rv, not generation
        assert!(!markers.logical_spec_changed(&object("6", Some(2))));
        assert!(markers.logical_spec_changed(&object("7", Some(3))));
        assert!(!markers.physical_spec_changed(&object("12", Some(1))));
        assert!(markers.physical_spec_changed(&object("13", Some(2))));

        // Without generations, any rv change counts
        let no_gen = SyncMarkers::observe(None, Some(&object("3", None)));
        assert!(!no_gen.physical_spec_changed(&object("3", None)));
        assert!(no_gen.physical_spec_changed(&object("4", None)));
    }

    #[test]
    fn test_logical_change_without_generation_uses_resource_version() {
        let markers = SyncMarkers::observe(Some(&object("5", None)), Some(&object("9", None)));
        assert!(!markers.logical_spec_changed(&object("5", None)));
        assert!(markers.logical_spec_changed(&object("6", None)));
    }

    #[test]
    fn test_rejection_tracks_resource_version_without_generation() {
        let table = PairTable::new();
        table.mark_failed(&key(), Some(&object("5", None)), "invalid");
        let pair = table.get(&key()).unwrap();
        assert!(pair.rejected(&object("5", None)));
        assert!(!pair.rejected(&object("6", None)));

        table.mark_failed(&key(), Some(&object("5", Some(3))), "invalid");
        let pair = table.get(&key()).unwrap();
        assert!(pair.rejected(&object("8", Some(3))));
        assert!(!pair.rejected(&object("9", Some(4))));
    }
}
