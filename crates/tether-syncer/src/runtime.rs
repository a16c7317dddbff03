//! Root task tree for one SyncTarget
//!
//! [`SyncRuntime`] owns the root cancellation token and assembles discovery,
//! the synchronizer registry and the status reporter from the two cluster
//! stores once the lifecycle controller starts the target. Status proposals
//! are re-published on a channel that outlives restarts of the engine, so
//! the controller can subscribe before anything is running.

use std::sync::Arc;

use async_trait::async_trait;
use kube::ResourceExt;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use tether_common::crd::{SupportedResource, SyncTarget};
use tether_common::Result;

use crate::config::SyncerConfig;
use crate::discovery::ResourceDiscovery;
use crate::lifecycle::SyncEngine;
use crate::registry::SynchronizerRegistry;
use crate::status::{StatusProposal, StatusReporter, SyncHealthSource};
use crate::store::{with_timeout, ClusterStore, Side};
use crate::transform::{TargetIdentity, TransformContext};

struct Running {
    token: CancellationToken,
    discovery: Arc<ResourceDiscovery>,
    tasks: Vec<JoinHandle<()>>,
}

/// The sync engine for the served SyncTarget
pub struct SyncRuntime {
    config: Arc<SyncerConfig>,
    logical: Arc<dyn ClusterStore>,
    physical: Arc<dyn ClusterStore>,
    root: CancellationToken,
    proposals: watch::Sender<Option<StatusProposal>>,
    running: Mutex<Option<Running>>,
}

impl SyncRuntime {
    /// Create a stopped runtime; every task it spawns is a child of `root`
    pub fn new(
        config: Arc<SyncerConfig>,
        logical: Arc<dyn ClusterStore>,
        physical: Arc<dyn ClusterStore>,
        root: &CancellationToken,
    ) -> Self {
        let (proposals, _) = watch::channel(None);
        Self {
            config,
            logical,
            physical,
            root: root.child_token(),
            proposals,
            running: Mutex::new(None),
        }
    }

    /// Receive every status proposal, across engine restarts
    pub fn subscribe(&self) -> watch::Receiver<Option<StatusProposal>> {
        self.proposals.subscribe()
    }

    /// Discovery of the running engine
    pub fn discovery(&self) -> Option<Arc<ResourceDiscovery>> {
        self.running.lock().as_ref().map(|r| r.discovery.clone())
    }

    fn assemble(&self, target: &SyncTarget) -> ResourceDiscovery {
        let identity = TargetIdentity {
            name: target.name_any(),
            uid: target.uid().unwrap_or_default(),
            workspace: target.spec.workspace.clone(),
        };
        let ctx = Arc::new(TransformContext::new(
            identity,
            self.config.transforms.clone(),
        ));
        let registry = SynchronizerRegistry::new(
            self.logical.clone(),
            self.physical.clone(),
            ctx,
            self.config.clone(),
        );
        ResourceDiscovery::new(registry, target.spec.supported_resources.clone())
    }

    fn forward(&self, reporter: &StatusReporter, token: CancellationToken) -> JoinHandle<()> {
        let mut rx = reporter.subscribe();
        let tx = self.proposals.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    changed = rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let proposal = rx.borrow_and_update().clone();
                        tx.send_replace(proposal);
                    }
                }
            }
        })
    }
}

#[async_trait]
impl SyncEngine for SyncRuntime {
    async fn probe(&self) -> Result<String> {
        with_timeout(
            Side::Physical,
            "probe",
            self.config.call_timeout(),
            self.physical.probe(),
        )
        .await
    }

    async fn start(&self, target: &SyncTarget) -> Result<()> {
        let mut running = self.running.lock();
        if running.is_some() {
            return Ok(());
        }

        let token = self.root.child_token();
        let discovery = Arc::new(self.assemble(target));
        discovery.start(&token);

        let reporter = Arc::new(StatusReporter::new(
            target.name_any(),
            self.physical.clone(),
            discovery.clone() as Arc<dyn SyncHealthSource>,
            self.config.clone(),
        ));
        let tasks = vec![
            self.forward(&reporter, token.clone()),
            reporter.start(&token),
        ];

        info!(sync_target = %target.name_any(), "Sync runtime started");
        *running = Some(Running {
            token,
            discovery,
            tasks,
        });
        Ok(())
    }

    fn is_started(&self) -> bool {
        self.running.lock().is_some()
    }

    fn update_declared(&self, declared: Vec<SupportedResource>) {
        if let Some(discovery) = self.discovery() {
            discovery.set_declared(declared);
        }
    }

    fn pause_writes(&self) {
        if let Some(discovery) = self.discovery() {
            discovery.pause_all();
        }
    }

    async fn cleanup_physical(&self, target: &SyncTarget) -> Result<usize> {
        match self.discovery() {
            Some(discovery) => discovery.cleanup_all().await,
            None => self.assemble(target).cleanup_all().await,
        }
    }

    async fn stop(&self) {
        let Some(running) = self.running.lock().take() else {
            return;
        };
        running.token.cancel();
        running.discovery.stop_all().await;
        for task in running.tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Runtime task panicked");
            }
        }
        info!("Sync runtime stopped");
    }

    fn latest(&self) -> Option<StatusProposal> {
        self.proposals.borrow().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::time::Duration;

    use kube::api::DynamicObject;
    use serde_json::json;
    use tether_common::crd::{RetentionPolicy, SyncTargetSpec};
    use tether_common::{ObjectKey, ResourceType, SYNC_TARGET_LABEL};

    use crate::store::memory::MemoryStore;
    use crate::synchronizer::eventually;

    fn configmaps() -> ResourceType {
        ResourceType::new("v1", "ConfigMap", true)
    }

    fn target() -> SyncTarget {
        let mut target = SyncTarget::new(
            "edge-1",
            SyncTargetSpec {
                workspace: "root:org".to_string(),
                supported_resources: vec![],
                agent: None,
                retention: RetentionPolicy::Delete,
            },
        );
        target.metadata.uid = Some("st-uid".to_string());
        target
    }

    fn labelled(name: &str) -> DynamicObject {
        let mut obj = DynamicObject::new(name, &configmaps().api_resource())
            .within("default")
            .data(json!({"data": {"k": "v"}}));
        obj.metadata.labels = Some(BTreeMap::from([(
            SYNC_TARGET_LABEL.to_string(),
            "edge-1".to_string(),
        )]));
        obj
    }

    fn runtime() -> (SyncRuntime, Arc<MemoryStore>, Arc<MemoryStore>) {
        let logical = Arc::new(MemoryStore::new(Side::Logical).with_types(vec![configmaps()]));
        let physical = Arc::new(MemoryStore::new(Side::Physical).with_types(vec![configmaps()]));
        let config = SyncerConfig {
            heartbeat_period_secs: 1,
            ..SyncerConfig::default()
        };
        let rt = SyncRuntime::new(
            Arc::new(config),
            logical.clone(),
            physical.clone(),
            &CancellationToken::new(),
        );
        (rt, logical, physical)
    }

    /// Story: the controller starts the engine for a registered target
    ///
    /// Discovery brings up a synchronizer, the logical object lands on the
    /// physical cluster, and a heartbeat proposal reaches subscribers.
    #[tokio::test]
    async fn story_started_runtime_syncs_and_reports() {
        let (rt, logical, physical) = runtime();
        let mut proposals = rt.subscribe();
        logical.insert(&configmaps(), labelled("settings"));

        rt.start(&target()).await.unwrap();
        rt.start(&target()).await.unwrap();
        assert!(rt.is_started());

        let key = ObjectKey::namespaced("default", "settings");
        assert!(
            eventually(Duration::from_secs(5), || physical
                .object(&configmaps(), &key)
                .is_some())
            .await
        );

        tokio::time::timeout(Duration::from_secs(5), proposals.changed())
            .await
            .expect("proposal published")
            .unwrap();
        let latest = rt.latest().expect("latest proposal");
        assert!(latest.heartbeat_ready);
        assert!(latest.heartbeat.count >= 1);

        rt.stop().await;
        assert!(!rt.is_started());
        assert!(rt.discovery().is_none());
    }

    #[tokio::test]
    async fn test_cleanup_without_start_uses_eligible_types() {
        let (rt, _logical, physical) = runtime();
        physical.insert(&configmaps(), labelled("tracked"));
        let mut foreign = labelled("foreign");
        foreign.metadata.labels = None;
        physical.insert(&configmaps(), foreign);

        let deleted = rt.cleanup_physical(&target()).await.unwrap();

        assert_eq!(deleted, 1);
        assert!(physical
            .object(&configmaps(), &ObjectKey::namespaced("default", "tracked"))
            .is_none());
        assert!(physical
            .object(&configmaps(), &ObjectKey::namespaced("default", "foreign"))
            .is_some());
        assert!(!rt.is_started());
    }

    #[tokio::test]
    async fn test_paused_runtime_stops_writing() {
        let (rt, logical, physical) = runtime();
        rt.start(&target()).await.unwrap();
        let discovery = rt.discovery().unwrap();
        assert!(
            eventually(Duration::from_secs(5), || discovery.synced_types()
                == vec!["configmaps"])
            .await
        );

        rt.pause_writes();
        let before = physical.write_count();
        logical.insert(&configmaps(), labelled("late"));
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(physical.write_count(), before);
        rt.stop().await;
    }

    #[tokio::test]
    async fn test_unreachable_physical_fails_probe() {
        let (rt, _logical, physical) = runtime();
        physical.set_unreachable(true);
        assert!(rt.probe().await.is_err());
        physical.set_unreachable(false);
        assert!(rt.probe().await.is_ok());
    }
}
