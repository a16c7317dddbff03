//! Resource discovery
//!
//! Decides which resource types are synchronized and keeps exactly one
//! running [`ResourceSynchronizer`] per eligible type. A type is eligible
//! when it is served by both sides with the same group/version/kind, is
//! declared by the SyncTarget, and passes the configured filters.
//!
//! Losing eligibility stops the synchronizer but never deletes physical
//! objects; the type's pairs are marked orphaned and reported.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use tether_common::crd::SupportedResource;
use tether_common::metrics;
use tether_common::{Error, ResourceType, Result};

use crate::registry::SynchronizerRegistry;
use crate::status::SyncHealthSource;
use crate::store::{with_timeout, Side};
use crate::synchronizer::{ResourceSynchronizer, SyncHealth};

/// Result of one discovery pass
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DiscoveryDelta {
    /// Types whose synchronizer was started
    pub started: Vec<String>,
    /// Types whose synchronizer was stopped and orphaned
    pub stopped: Vec<String>,
}

impl DiscoveryDelta {
    /// True if nothing changed
    pub fn is_empty(&self) -> bool {
        self.started.is_empty() && self.stopped.is_empty()
    }
}

/// Maintains the set of running synchronizers
pub struct ResourceDiscovery {
    registry: SynchronizerRegistry,
    declared: RwLock<Vec<SupportedResource>>,
    running: DashMap<String, Arc<ResourceSynchronizer>>,
    orphaned: DashMap<String, usize>,
    paused: AtomicBool,
    trigger: Notify,
    cancel: Mutex<Option<CancellationToken>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ResourceDiscovery {
    /// Create discovery over a registry with the target's declared types
    pub fn new(registry: SynchronizerRegistry, declared: Vec<SupportedResource>) -> Self {
        Self {
            registry,
            declared: RwLock::new(declared),
            running: DashMap::new(),
            orphaned: DashMap::new(),
            paused: AtomicBool::new(false),
            trigger: Notify::new(),
            cancel: Mutex::new(None),
            task: Mutex::new(None),
        }
    }

    fn target(&self) -> &str {
        &self.registry.context().target.name
    }

    /// Replace the declared capability list and trigger a pass
    pub fn set_declared(&self, declared: Vec<SupportedResource>) {
        let changed = {
            let mut current = self.declared.write();
            if *current == declared {
                false
            } else {
                *current = declared;
                true
            }
        };
        if changed {
            info!(sync_target = %self.target(), "Declared resources changed");
            self.notify();
        }
    }

    /// Request an immediate discovery pass
    pub fn notify(&self) {
        self.trigger.notify_one();
    }

    /// Compute the eligible types
    pub async fn discover(&self) -> Result<Vec<ResourceType>> {
        let timeout = self.registry.config().call_timeout();
        let logical = with_timeout(
            Side::Logical,
            "discovery",
            timeout,
            self.registry.logical().served_types(),
        )
        .await?;
        let physical = with_timeout(
            Side::Physical,
            "discovery",
            timeout,
            self.registry.physical().served_types(),
        )
        .await?;

        let declared = self.declared.read().clone();
        let config = self.registry.config();

        let mut eligible: Vec<ResourceType> = logical
            .into_iter()
            .filter(|rt| {
                physical
                    .iter()
                    .any(|p| p.same_gvk(rt) && p.namespaced == rt.namespaced)
            })
            .filter(|rt| {
                declared.is_empty() || declared.iter().any(|d| d.matches(&rt.group, &rt.plural))
            })
            .filter(|rt| config.permits(rt))
            .collect();
        eligible.sort();
        eligible.dedup_by(|a, b| a.group_resource() == b.group_resource());
        Ok(eligible)
    }

    /// Start synchronizers for new types and stop those no longer eligible
    pub async fn reconcile_synchronizers(&self, parent: &CancellationToken) -> Result<DiscoveryDelta> {
        let eligible = self.discover().await?;
        let wanted: BTreeSet<String> = eligible.iter().map(ResourceType::group_resource).collect();
        let mut delta = DiscoveryDelta::default();

        for rt in &eligible {
            let name = rt.group_resource();
            if self.running.contains_key(&name) {
                continue;
            }
            self.orphaned.remove(&name);
            let sync = self.registry.build(rt);
            if self.paused.load(Ordering::SeqCst) {
                sync.pause_writes();
            }
            sync.start(parent);
            info!(sync_target = %self.target(), resource = %name, flavor = ?sync.flavor(), "Type became eligible");
            self.running.insert(name.clone(), sync);
            delta.started.push(name);
        }

        let lost: Vec<String> = self
            .running
            .iter()
            .map(|e| e.key().clone())
            .filter(|name| !wanted.contains(name))
            .collect();
        for name in lost {
            let Some((_, sync)) = self.running.remove(&name) else {
                continue;
            };
            sync.stop().await;
            let pairs = sync.mark_orphaned();
            warn!(
                sync_target = %self.target(),
                resource = %name,
                pairs,
                "Type lost eligibility, physical objects left in place"
            );
            self.orphaned.insert(name.clone(), pairs);
            delta.stopped.push(name);
        }

        metrics::record_active_synchronizers(self.target(), self.running.len());
        if !delta.is_empty() {
            debug!(sync_target = %self.target(), ?delta, "Discovery pass changed synchronizers");
        }
        Ok(delta)
    }

    /// Run discovery periodically and on notification until cancelled
    pub fn start(self: &Arc<Self>, parent: &CancellationToken) {
        let mut cancel = self.cancel.lock();
        if cancel.is_some() {
            return;
        }
        let token = parent.child_token();
        let discovery = self.clone();
        let loop_token = token.clone();
        let period = self.registry.config().discovery_period();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = loop_token.cancelled() => break,
                    _ = ticker.tick() => {}
                    _ = discovery.trigger.notified() => {}
                }
                if let Err(e) = discovery.reconcile_synchronizers(&loop_token).await {
                    error!(sync_target = %discovery.target(), error = %e, "Discovery pass failed");
                }
            }
            debug!("Discovery loop exiting");
        });

        *self.task.lock() = Some(handle);
        *cancel = Some(token);
    }

    /// Pause writes on every running synchronizer and any started later
    pub fn pause_all(&self) {
        self.paused.store(true, Ordering::SeqCst);
        for entry in self.running.iter() {
            entry.value().pause_writes();
        }
    }

    /// Delete tracked physical objects for every synced type.
    ///
    /// With nothing running (a restart during termination) the currently
    /// eligible types are cleaned through stopped synchronizers. Every type
    /// is attempted; the first failure is returned.
    pub async fn cleanup_all(&self) -> Result<usize> {
        let mut syncs: Vec<Arc<ResourceSynchronizer>> =
            self.running.iter().map(|e| e.value().clone()).collect();
        if syncs.is_empty() {
            syncs = self
                .discover()
                .await?
                .iter()
                .map(|rt| self.registry.build(rt))
                .collect();
        }

        let mut deleted = 0;
        let mut first_error: Option<Error> = None;
        for sync in syncs {
            match sync.cleanup_physical().await {
                Ok(n) => deleted += n,
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(deleted),
        }
    }

    /// Stop the discovery loop and every synchronizer
    pub async fn stop_all(&self) {
        if let Some(token) = self.cancel.lock().take() {
            token.cancel();
        }
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(error = %e, "Discovery task panicked");
            }
        }

        let names: Vec<String> = self.running.iter().map(|e| e.key().clone()).collect();
        for name in names {
            if let Some((_, sync)) = self.running.remove(&name) {
                sync.stop().await;
            }
        }
        metrics::record_active_synchronizers(self.target(), 0);
    }

    /// Running synchronizer for a `resource.group`
    pub fn synchronizer(&self, group_resource: &str) -> Option<Arc<ResourceSynchronizer>> {
        self.running.get(group_resource).map(|e| e.value().clone())
    }
}

impl SyncHealthSource for ResourceDiscovery {
    fn health(&self) -> Vec<SyncHealth> {
        let mut health: Vec<SyncHealth> = self.running.iter().map(|e| e.value().health()).collect();
        health.sort_by(|a, b| a.resource.cmp(&b.resource));
        health
    }

    fn synced_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.running.iter().map(|e| e.key().clone()).collect();
        types.sort();
        types
    }

    fn orphaned_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self
            .orphaned
            .iter()
            .filter(|e| *e.value() > 0)
            .map(|e| e.key().clone())
            .collect();
        types.sort();
        types
    }
}
