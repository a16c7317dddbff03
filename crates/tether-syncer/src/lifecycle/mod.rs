//! SyncTarget lifecycle controller
//!
//! Drives a SyncTarget through `Pending -> Active <-> Unavailable ->
//! Terminating`. The controller owns the finalizer and is the only writer
//! of SyncTarget status; health comes from the status reporter's latest
//! proposal, and every new proposal triggers a reconcile.

pub mod agent;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use kube::api::{Api, Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::{Client, Resource, ResourceExt};
#[cfg(test)]
use mockall::automock;
use tracing::{debug, error, info, instrument, warn};

use tether_common::crd::{
    set_condition, Condition, ConditionStatus, RetentionPolicy, SupportedResource, SyncTarget,
    SyncTargetPhase, SyncTargetStatus, CONDITION_READY,
};
use tether_common::events::{actions, reasons, EventPublisher, KubeEventPublisher};
use tether_common::retry::BackoffPolicy;
use tether_common::{metrics, Error, Result, FIELD_MANAGER, SYNCER_FINALIZER};

use crate::status::StatusProposal;

use self::agent::{AgentDeployer, AgentOutcome};

/// Requeue interval while running, in addition to proposal-driven triggers
pub const RUNNING_REQUEUE: Duration = Duration::from_secs(60);

/// Kubernetes operations on the SyncTarget record
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SyncTargetClient: Send + Sync {
    /// Merge-patch the status subresource
    async fn patch_status(&self, name: &str, status: &SyncTargetStatus) -> Result<()>;

    /// Add a finalizer if not already present
    async fn add_finalizer(&self, name: &str, finalizer: &str) -> Result<()>;

    /// Remove a finalizer if present
    async fn remove_finalizer(&self, name: &str, finalizer: &str) -> Result<()>;
}

/// The running sync machinery for one target
///
/// Implemented by [`crate::runtime::SyncRuntime`]; the controller only sees
/// this seam.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SyncEngine: Send + Sync {
    /// Probe the physical cluster; returns its version
    async fn probe(&self) -> Result<String>;

    /// Start discovery, synchronizers and the status reporter. Idempotent.
    async fn start(&self, target: &SyncTarget) -> Result<()>;

    /// True once started and until stopped
    fn is_started(&self) -> bool;

    /// Replace the declared capability list of a running engine
    fn update_declared(&self, declared: Vec<SupportedResource>);

    /// Stop every synchronizer from writing; watches keep running
    fn pause_writes(&self);

    /// Delete tracked physical objects for every synced type
    async fn cleanup_physical(&self, target: &SyncTarget) -> Result<usize>;

    /// Cancel every task and wait for them to exit
    async fn stop(&self);

    /// Most recent status proposal
    fn latest(&self) -> Option<StatusProposal>;
}

/// Default [`SyncTargetClient`] backed by kube
pub struct KubeSyncTargetClient {
    client: Client,
}

impl KubeSyncTargetClient {
    /// Wrap a logical-side client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self) -> Api<SyncTarget> {
        Api::all(self.client.clone())
    }

    async fn patch_finalizers(&self, target: &SyncTarget, finalizers: Vec<String>) -> Result<()> {
        let patch = finalizer_patch(target, finalizers);
        self.api()
            .patch(
                &target.name_any(),
                &PatchParams::apply(FIELD_MANAGER),
                &Patch::Merge(&patch),
            )
            .await?;
        Ok(())
    }
}

/// Merge patch replacing the finalizer list.
///
/// Carries the resourceVersion the list was read at, so a concurrent
/// finalizer change by another writer fails with 409 instead of being lost.
fn finalizer_patch(target: &SyncTarget, finalizers: Vec<String>) -> serde_json::Value {
    serde_json::json!({
        "metadata": {
            "resourceVersion": target.resource_version(),
            "finalizers": finalizers
        }
    })
}

#[async_trait]
impl SyncTargetClient for KubeSyncTargetClient {
    async fn patch_status(&self, name: &str, status: &SyncTargetStatus) -> Result<()> {
        let patch = serde_json::json!({ "status": status });
        self.api()
            .patch_status(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn add_finalizer(&self, name: &str, finalizer: &str) -> Result<()> {
        let target = self.api().get(name).await?;
        let mut finalizers = target.finalizers().to_vec();
        if finalizers.iter().any(|f| f == finalizer) {
            return Ok(());
        }
        finalizers.push(finalizer.to_string());
        self.patch_finalizers(&target, finalizers).await
    }

    async fn remove_finalizer(&self, name: &str, finalizer: &str) -> Result<()> {
        let target = self.api().get(name).await?;
        if !target.finalizers().iter().any(|f| f == finalizer) {
            return Ok(());
        }
        let finalizers: Vec<String> = target
            .finalizers()
            .iter()
            .filter(|f| *f != finalizer)
            .cloned()
            .collect();
        self.patch_finalizers(&target, finalizers).await
    }
}

/// Controller context shared across reconciles
///
/// Use [`ContextBuilder`] to construct instances:
///
/// ```text
/// let ctx = Context::builder(client, engine, agent).build();
/// ```
pub struct Context {
    /// SyncTarget record operations
    pub kube: Arc<dyn SyncTargetClient>,
    /// Agent workload on the physical cluster
    pub agent: Arc<dyn AgentDeployer>,
    /// Sync machinery for the served target
    pub engine: Arc<dyn SyncEngine>,
    /// Kubernetes Events
    pub events: Arc<dyn EventPublisher>,
    /// Backoff applied by [`error_policy`]
    pub backoff: BackoffPolicy,
    /// Consecutive failed reconciles per SyncTarget
    pub attempts: DashMap<String, u32>,
}

impl Context {
    /// Create a builder for constructing a Context
    pub fn builder(
        client: Client,
        engine: Arc<dyn SyncEngine>,
        agent: Arc<dyn AgentDeployer>,
    ) -> ContextBuilder {
        ContextBuilder::new(client, engine, agent)
    }

    /// Create a context from test doubles
    #[cfg(test)]
    pub fn for_testing(
        kube: Arc<dyn SyncTargetClient>,
        agent: Arc<dyn AgentDeployer>,
        engine: Arc<dyn SyncEngine>,
    ) -> Self {
        Self {
            kube,
            agent,
            engine,
            events: Arc::new(tether_common::events::NoopEventPublisher),
            backoff: BackoffPolicy::new(Duration::from_secs(1), Duration::from_secs(300))
                .deterministic(),
            attempts: DashMap::new(),
        }
    }
}

/// Builder for constructing [`Context`] instances
pub struct ContextBuilder {
    client: Client,
    engine: Arc<dyn SyncEngine>,
    agent: Arc<dyn AgentDeployer>,
    kube: Option<Arc<dyn SyncTargetClient>>,
    events: Option<Arc<dyn EventPublisher>>,
    backoff: Option<BackoffPolicy>,
}

impl ContextBuilder {
    fn new(client: Client, engine: Arc<dyn SyncEngine>, agent: Arc<dyn AgentDeployer>) -> Self {
        Self {
            client,
            engine,
            agent,
            kube: None,
            events: None,
            backoff: None,
        }
    }

    /// Override the SyncTarget client
    pub fn kube_client(mut self, kube: Arc<dyn SyncTargetClient>) -> Self {
        self.kube = Some(kube);
        self
    }

    /// Override the event publisher
    pub fn events(mut self, events: Arc<dyn EventPublisher>) -> Self {
        self.events = Some(events);
        self
    }

    /// Backoff for failed reconciles
    pub fn backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = Some(backoff);
        self
    }

    /// Build the Context
    pub fn build(self) -> Context {
        Context {
            kube: self
                .kube
                .unwrap_or_else(|| Arc::new(KubeSyncTargetClient::new(self.client.clone()))),
            agent: self.agent,
            engine: self.engine,
            events: self.events.unwrap_or_else(|| {
                Arc::new(KubeEventPublisher::new(self.client.clone(), FIELD_MANAGER))
            }),
            backoff: self.backoff.unwrap_or_else(|| {
                BackoffPolicy::new(Duration::from_secs(1), Duration::from_secs(300))
            }),
            attempts: DashMap::new(),
        }
    }
}

/// Reconcile a SyncTarget
#[instrument(skip(target, ctx), fields(sync_target = %target.name_any()))]
pub async fn reconcile(target: Arc<SyncTarget>, ctx: Arc<Context>) -> Result<Action> {
    let name = target.name_any();
    debug!("reconciling sync target");

    let action = if target.metadata.deletion_timestamp.is_some() {
        handle_deletion(&target, &ctx).await?
    } else if !has_finalizer(&target) {
        info!("Adding finalizer");
        ctx.kube.add_finalizer(&name, SYNCER_FINALIZER).await?;
        publish(&ctx, &target, EventType::Normal, reasons::REGISTERED, actions::RECONCILE, None)
            .await;
        Action::requeue(Duration::from_secs(1))
    } else if let Err(e) = target.spec.validate() {
        warn!(error = %e, "SyncTarget spec is invalid");
        let status = invalid_status(&target, &e);
        update_status(&target, &ctx, status).await?;
        publish(
            &ctx,
            &target,
            EventType::Warning,
            reasons::INVALID_SPEC,
            actions::RECONCILE,
            Some(e.to_string()),
        )
        .await;
        Action::await_change()
    } else {
        reconcile_running(&target, &ctx).await?
    };

    ctx.attempts.remove(&name);
    Ok(action)
}

/// Bring up the engine if needed and reflect the latest proposal
async fn reconcile_running(target: &SyncTarget, ctx: &Context) -> Result<Action> {
    let spec_changed = target.status.as_ref().and_then(|s| s.observed_generation)
        != target.metadata.generation;

    if !ctx.engine.is_started() {
        let version = ctx.engine.probe().await?;
        info!(%version, "Physical cluster reachable");
        ensure_agent(target, ctx).await?;
        ctx.engine.start(target).await?;
        info!("Sync engine started");
    } else if spec_changed {
        ctx.engine
            .update_declared(target.spec.supported_resources.clone());
        ensure_agent(target, ctx).await?;
    }

    let proposal = ctx.engine.latest();
    let phase = match &proposal {
        Some(p) if !p.heartbeat_ready => SyncTargetPhase::Unavailable,
        _ => SyncTargetPhase::Active,
    };
    let status = running_status(target, phase, proposal.as_ref());
    update_status(target, ctx, status).await?;

    Ok(Action::requeue(RUNNING_REQUEUE))
}

async fn ensure_agent(target: &SyncTarget, ctx: &Context) -> Result<()> {
    let outcome = ctx.agent.ensure(target).await?;
    if matches!(outcome, AgentOutcome::Created | AgentOutcome::Updated) {
        publish(
            ctx,
            target,
            EventType::Normal,
            reasons::AGENT_DEPLOYED,
            actions::DEPLOY,
            Some(format!("agent {:?}", outcome).to_lowercase()),
        )
        .await;
    }
    Ok(())
}

/// Run termination and release the finalizer once every step has succeeded
async fn handle_deletion(target: &SyncTarget, ctx: &Context) -> Result<Action> {
    if !has_finalizer(target) {
        return Ok(Action::await_change());
    }

    if target.phase() != SyncTargetPhase::Terminating {
        let mut status = target.status.clone().unwrap_or_default();
        status.phase = SyncTargetPhase::Terminating;
        status.message = Some("Cleaning up physical cluster".to_string());
        set_condition(
            &mut status.conditions,
            Condition::new(
                CONDITION_READY,
                ConditionStatus::False,
                "Terminating",
                "SyncTarget is being deleted",
            ),
        );
        update_status(target, ctx, status).await?;
    }

    if let Err(e) = terminate(target, ctx).await {
        error!(error = %e, "Termination step failed; finalizer retained");
        publish(
            ctx,
            target,
            EventType::Warning,
            reasons::CLEANUP_FAILED,
            actions::CLEANUP,
            Some(e.to_string()),
        )
        .await;
        return Err(e);
    }

    ctx.kube
        .remove_finalizer(&target.name_any(), SYNCER_FINALIZER)
        .await?;
    info!("Cleanup complete; finalizer removed");
    publish(ctx, target, EventType::Normal, reasons::CLEANUP_COMPLETE, actions::CLEANUP, None)
        .await;
    Ok(Action::await_change())
}

/// Termination steps, in order
async fn terminate(target: &SyncTarget, ctx: &Context) -> Result<()> {
    let name = target.name_any();

    ctx.engine.pause_writes();

    if target.spec.agent.is_some() {
        ctx.agent.delete(target).await?;
        if ctx.agent.exists(target).await? {
            return Err(Error::cleanup(
                &name,
                "agent-teardown",
                "agent deployment still present",
            ));
        }
    }

    match target.spec.retention {
        RetentionPolicy::Delete => {
            let deleted = ctx
                .engine
                .cleanup_physical(target)
                .await
                .map_err(|e| Error::cleanup(&name, "object-cleanup", e.to_string()))?;
            info!(deleted, "Deleted tracked physical objects");
        }
        RetentionPolicy::Orphan => {
            info!("Retention is Orphan; leaving physical objects in place");
        }
    }

    ctx.engine.stop().await;
    Ok(())
}

/// Status for a running target built from the latest proposal
fn running_status(
    target: &SyncTarget,
    phase: SyncTargetPhase,
    proposal: Option<&StatusProposal>,
) -> SyncTargetStatus {
    let mut status = target.status.clone().unwrap_or_default();
    status.phase = phase;
    status.observed_generation = target.metadata.generation;

    match proposal {
        Some(p) => {
            for condition in p.conditions() {
                set_condition(&mut status.conditions, condition);
            }
            status.last_heartbeat_time = p.heartbeat.last_heartbeat;
            status.heartbeat_count = p.heartbeat.count;
            status.heartbeat_errors = p.heartbeat.errors;
            status.synced_resources = p.synced_resources.clone();
            status.orphaned_resources = p.orphaned_resources.clone();
            status.message = if p.ready() {
                None
            } else {
                p.heartbeat
                    .last_error
                    .clone()
                    .or_else(|| Some(format!("{} unhealthy pairs", p.unhealthy_pairs)))
            };
        }
        None => {
            set_condition(
                &mut status.conditions,
                Condition::new(
                    CONDITION_READY,
                    ConditionStatus::Unknown,
                    "AwaitingHeartbeat",
                    "Waiting for the first heartbeat",
                ),
            );
            status.message = None;
        }
    }
    status
}

fn invalid_status(target: &SyncTarget, err: &Error) -> SyncTargetStatus {
    let mut status = target.status.clone().unwrap_or_default();
    status.observed_generation = target.metadata.generation;
    status.message = Some(err.to_string());
    set_condition(
        &mut status.conditions,
        Condition::new(
            CONDITION_READY,
            ConditionStatus::False,
            "InvalidSpec",
            err.to_string(),
        ),
    );
    status
}

/// Patch status unless it is equivalent to what is recorded
async fn update_status(target: &SyncTarget, ctx: &Context, status: SyncTargetStatus) -> Result<()> {
    let current = target.status.clone().unwrap_or_default();
    if target.status.is_some() && current.is_equivalent(&status) {
        debug!("Status unchanged; skipping patch");
        return Ok(());
    }

    let name = target.name_any();
    ctx.kube.patch_status(&name, &status).await?;
    metrics::record_phase(&name, &status.phase);

    if current.phase != status.phase {
        info!(from = %current.phase, to = %status.phase, "Phase transition");
        let reason = match status.phase {
            SyncTargetPhase::Active => Some(reasons::ACTIVE),
            SyncTargetPhase::Unavailable => Some(reasons::UNAVAILABLE),
            SyncTargetPhase::Terminating => Some(reasons::TERMINATING),
            SyncTargetPhase::Pending => None,
        };
        if let Some(reason) = reason {
            let type_ = if status.phase == SyncTargetPhase::Unavailable {
                EventType::Warning
            } else {
                EventType::Normal
            };
            publish(ctx, target, type_, reason, actions::RECONCILE, status.message.clone()).await;
        }
    }
    Ok(())
}

async fn publish(
    ctx: &Context,
    target: &SyncTarget,
    type_: EventType,
    reason: &str,
    action: &str,
    note: Option<String>,
) {
    ctx.events
        .publish(&target.object_ref(&()), type_, reason, action, note)
        .await;
}

fn has_finalizer(target: &SyncTarget) -> bool {
    target
        .finalizers()
        .iter()
        .any(|f| f == SYNCER_FINALIZER)
}

/// Requeue a failed reconcile with per-target exponential backoff
pub fn error_policy(target: Arc<SyncTarget>, error: &Error, ctx: Arc<Context>) -> Action {
    let name = target.name_any();
    let attempt = {
        let mut entry = ctx.attempts.entry(name.clone()).or_insert(0);
        *entry += 1;
        *entry
    };
    let delay = ctx.backoff.delay_for(attempt);
    error!(
        ?error,
        sync_target = %name,
        attempt,
        retry_in = ?delay,
        "reconciliation failed"
    );
    Action::requeue(delay)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use chrono::Utc;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use tether_common::crd::{AgentSpec, SyncTargetSpec};

    use crate::lifecycle::agent::MockAgentDeployer;
    use crate::status::HeartbeatRecord;

    fn sample_target(name: &str) -> SyncTarget {
        let mut target = SyncTarget::new(
            name,
            SyncTargetSpec {
                workspace: "root:org:team".to_string(),
                supported_resources: vec![SupportedResource::new("apps", "deployments")],
                agent: Some(AgentSpec {
                    image: "ghcr.io/tether/agent:v0.1.0".to_string(),
                    namespace: "tether-system".to_string(),
                    replicas: 1,
                }),
                retention: RetentionPolicy::Delete,
            },
        );
        target.metadata.finalizers = Some(vec![SYNCER_FINALIZER.to_string()]);
        target.metadata.generation = Some(1);
        target
    }

    fn target_with_phase(name: &str, phase: SyncTargetPhase) -> SyncTarget {
        let mut target = sample_target(name);
        let mut status = SyncTargetStatus::with_phase(phase);
        status.observed_generation = Some(1);
        target.status = Some(status);
        target
    }

    fn deleting(mut target: SyncTarget) -> SyncTarget {
        target.metadata.deletion_timestamp = Some(Time(Utc::now()));
        target
    }

    fn proposal(heartbeat_ready: bool) -> StatusProposal {
        StatusProposal {
            heartbeat: HeartbeatRecord {
                count: 7,
                last_heartbeat: Some(Utc::now()),
                errors: if heartbeat_ready { 0 } else { 3 },
                consecutive_failures: if heartbeat_ready { 0 } else { 3 },
                last_error: (!heartbeat_ready).then(|| "connection refused".to_string()),
            },
            heartbeat_ready,
            syncer_ready: true,
            unhealthy_pairs: 0,
            synced_resources: vec!["deployments.apps".to_string()],
            orphaned_resources: vec![],
        }
    }

    /// Captured status patches and finalizer removals
    #[derive(Clone, Default)]
    struct Capture {
        statuses: Arc<Mutex<Vec<SyncTargetStatus>>>,
        finalizer_removals: Arc<AtomicUsize>,
    }

    impl Capture {
        fn last_phase(&self) -> Option<SyncTargetPhase> {
            self.statuses
                .lock()
                .expect("mutex should not be poisoned")
                .last()
                .map(|s| s.phase.clone())
        }

        fn last_status(&self) -> Option<SyncTargetStatus> {
            self.statuses
                .lock()
                .expect("mutex should not be poisoned")
                .last()
                .cloned()
        }

        fn patches(&self) -> usize {
            self.statuses
                .lock()
                .expect("mutex should not be poisoned")
                .len()
        }

        fn removals(&self) -> usize {
            self.finalizer_removals.load(Ordering::SeqCst)
        }
    }

    fn capturing_kube(capture: &Capture) -> MockSyncTargetClient {
        let mut kube = MockSyncTargetClient::new();
        let statuses = capture.statuses.clone();
        kube.expect_patch_status().returning(move |_, status| {
            statuses
                .lock()
                .expect("mutex should not be poisoned")
                .push(status.clone());
            Ok(())
        });
        kube.expect_add_finalizer().returning(|_, _| Ok(()));
        let removals = capture.finalizer_removals.clone();
        kube.expect_remove_finalizer().returning(move |_, _| {
            removals.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        kube
    }

    fn ready_agent() -> MockAgentDeployer {
        let mut agent = MockAgentDeployer::new();
        agent
            .expect_ensure()
            .returning(|_| Ok(AgentOutcome::Unchanged));
        agent.expect_delete().returning(|_| Ok(()));
        agent.expect_exists().returning(|_| Ok(false));
        agent
    }

    fn running_engine(latest: Option<StatusProposal>) -> MockSyncEngine {
        let mut engine = MockSyncEngine::new();
        engine.expect_is_started().return_const(true);
        engine.expect_update_declared().return_const(());
        engine.expect_latest().return_const(latest);
        engine
    }

    fn context(
        kube: MockSyncTargetClient,
        agent: MockAgentDeployer,
        engine: MockSyncEngine,
    ) -> Arc<Context> {
        Arc::new(Context::for_testing(
            Arc::new(kube),
            Arc::new(agent),
            Arc::new(engine),
        ))
    }

    mod registration {
        use super::*;

        /// Story: an operator creates a SyncTarget
        ///
        /// The first reconcile only claims the record with the finalizer and
        /// requeues quickly; nothing is deployed before the finalizer is in
        /// place.
        #[tokio::test]
        async fn story_new_target_gets_finalizer_first() {
            let mut target = sample_target("edge-1");
            target.metadata.finalizers = None;

            let mut kube = MockSyncTargetClient::new();
            kube.expect_add_finalizer()
                .withf(|name, finalizer| name == "edge-1" && finalizer == SYNCER_FINALIZER)
                .times(1)
                .returning(|_, _| Ok(()));
            let ctx = context(kube, MockAgentDeployer::new(), MockSyncEngine::new());

            let action = reconcile(Arc::new(target), ctx).await.expect("reconcile");
            assert_eq!(action, Action::requeue(Duration::from_secs(1)));
        }

        /// Story: a pending target is validated, probed, given an agent and
        /// started, then reported Active
        #[tokio::test]
        async fn story_pending_target_becomes_active() {
            let capture = Capture::default();
            let target = target_with_phase("edge-1", SyncTargetPhase::Pending);

            let started = Arc::new(AtomicUsize::new(0));
            let mut engine = MockSyncEngine::new();
            engine.expect_is_started().return_const(false);
            engine
                .expect_probe()
                .times(1)
                .returning(|| Ok("v1.32.0".to_string()));
            let counter = started.clone();
            engine.expect_start().times(1).returning(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
            engine.expect_latest().return_const(Some(proposal(true)));

            let mut agent = MockAgentDeployer::new();
            agent
                .expect_ensure()
                .times(1)
                .returning(|_| Ok(AgentOutcome::Created));

            let ctx = context(capturing_kube(&capture), agent, engine);
            let action = reconcile(Arc::new(target), ctx).await.expect("reconcile");

            assert_eq!(started.load(Ordering::SeqCst), 1);
            assert_eq!(capture.last_phase(), Some(SyncTargetPhase::Active));
            let status = capture.last_status().expect("status patched");
            assert_eq!(status.heartbeat_count, 7);
            assert_eq!(status.synced_resources, vec!["deployments.apps"]);
            assert_eq!(
                status.get_condition(CONDITION_READY).map(|c| c.status.clone()),
                Some(ConditionStatus::True)
            );
            assert_eq!(action, Action::requeue(RUNNING_REQUEUE));
        }

        /// Story: an unreachable physical cluster keeps the target Pending
        /// and the error propagates for backoff
        #[tokio::test]
        async fn story_unreachable_cluster_blocks_activation() {
            let capture = Capture::default();
            let target = target_with_phase("edge-1", SyncTargetPhase::Pending);

            let mut engine = MockSyncEngine::new();
            engine.expect_is_started().return_const(false);
            engine
                .expect_probe()
                .returning(|| Err(Error::connectivity("physical", "connection refused")));
            engine.expect_start().never();

            let ctx = context(capturing_kube(&capture), MockAgentDeployer::new(), engine);
            let result = reconcile(Arc::new(target.clone()), ctx.clone()).await;

            let err = result.expect_err("probe failure should propagate");
            assert!(err.to_string().contains("connection refused"));
            assert_eq!(capture.patches(), 0);

            let first = error_policy(Arc::new(target.clone()), &err, ctx.clone());
            let second = error_policy(Arc::new(target), &err, ctx);
            assert_eq!(first, Action::requeue(Duration::from_secs(1)));
            assert_eq!(second, Action::requeue(Duration::from_secs(2)));
        }

        /// Story: an invalid spec is reported and waits for an edit
        #[tokio::test]
        async fn story_invalid_spec_awaits_change() {
            let capture = Capture::default();
            let mut target = target_with_phase("edge-1", SyncTargetPhase::Pending);
            target.spec.workspace = String::new();

            let mut engine = MockSyncEngine::new();
            engine.expect_start().never();
            engine.expect_probe().never();

            let ctx = context(capturing_kube(&capture), MockAgentDeployer::new(), engine);
            let action = reconcile(Arc::new(target), ctx).await.expect("reconcile");

            assert_eq!(action, Action::await_change());
            let status = capture.last_status().expect("status patched");
            assert_eq!(status.phase, SyncTargetPhase::Pending);
            let ready = status.get_condition(CONDITION_READY).expect("Ready");
            assert_eq!(ready.status, ConditionStatus::False);
            assert_eq!(ready.reason, "InvalidSpec");
        }
    }

    mod health {
        use super::*;

        #[tokio::test]
        async fn test_failed_heartbeat_moves_to_unavailable() {
            let capture = Capture::default();
            let target = target_with_phase("edge-1", SyncTargetPhase::Active);
            let ctx = context(
                capturing_kube(&capture),
                ready_agent(),
                running_engine(Some(proposal(false))),
            );

            reconcile(Arc::new(target), ctx).await.expect("reconcile");

            let status = capture.last_status().expect("status patched");
            assert_eq!(status.phase, SyncTargetPhase::Unavailable);
            assert_eq!(status.message.as_deref(), Some("connection refused"));
            assert_eq!(
                status.get_condition(CONDITION_READY).map(|c| c.status.clone()),
                Some(ConditionStatus::False)
            );
        }

        #[tokio::test]
        async fn test_recovered_heartbeat_returns_to_active() {
            let capture = Capture::default();
            let target = target_with_phase("edge-1", SyncTargetPhase::Unavailable);
            let ctx = context(
                capturing_kube(&capture),
                ready_agent(),
                running_engine(Some(proposal(true))),
            );

            reconcile(Arc::new(target), ctx).await.expect("reconcile");
            assert_eq!(capture.last_phase(), Some(SyncTargetPhase::Active));
        }

        /// Story: the same proposal is reconciled twice
        ///
        /// The second reconcile sees the status it wrote and must not patch
        /// again.
        #[tokio::test]
        async fn story_unchanged_status_is_not_patched() {
            let capture = Capture::default();
            let p = proposal(true);
            let target = target_with_phase("edge-1", SyncTargetPhase::Active);
            let ctx = context(
                capturing_kube(&capture),
                ready_agent(),
                running_engine(Some(p.clone())),
            );

            reconcile(Arc::new(target.clone()), ctx.clone())
                .await
                .expect("reconcile");
            assert_eq!(capture.patches(), 1);

            let mut written = target;
            written.status = capture.last_status();
            reconcile(Arc::new(written), ctx).await.expect("reconcile");
            assert_eq!(capture.patches(), 1);
        }

        #[tokio::test]
        async fn test_spec_edit_refreshes_declarations_and_agent() {
            let capture = Capture::default();
            let mut target = target_with_phase("edge-1", SyncTargetPhase::Active);
            target.metadata.generation = Some(2);

            let mut engine = MockSyncEngine::new();
            engine.expect_is_started().return_const(true);
            engine
                .expect_update_declared()
                .withf(|declared| declared.len() == 1)
                .times(1)
                .return_const(());
            engine.expect_latest().return_const(Some(proposal(true)));

            let mut agent = MockAgentDeployer::new();
            agent
                .expect_ensure()
                .times(1)
                .returning(|_| Ok(AgentOutcome::Updated));

            let ctx = context(capturing_kube(&capture), agent, engine);
            reconcile(Arc::new(target), ctx).await.expect("reconcile");

            let status = capture.last_status().expect("status patched");
            assert_eq!(status.observed_generation, Some(2));
        }
    }

    mod termination {
        use super::*;

        /// Story: deleting a target whose object cleanup fails once
        ///
        /// The first attempt pauses writes, removes the agent, then fails to
        /// delete tracked objects; the finalizer stays and the error goes to
        /// the backoff policy. The retry succeeds, the engine stops, and only
        /// then is the finalizer removed.
        #[tokio::test]
        async fn story_cleanup_failure_retains_finalizer_until_retry_succeeds() {
            let capture = Capture::default();
            let target = deleting(target_with_phase("edge-1", SyncTargetPhase::Active));

            let cleanups = Arc::new(AtomicUsize::new(0));
            let stops = Arc::new(AtomicUsize::new(0));
            let mut engine = MockSyncEngine::new();
            engine.expect_pause_writes().return_const(());
            let counter = cleanups.clone();
            engine.expect_cleanup_physical().returning(move |_| {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(Error::connectivity("physical", "timed out listing deployments"))
                } else {
                    Ok(3)
                }
            });
            let stopped = stops.clone();
            engine.expect_stop().returning(move || {
                stopped.fetch_add(1, Ordering::SeqCst);
            });

            let ctx = context(capturing_kube(&capture), ready_agent(), engine);

            let first = reconcile(Arc::new(target.clone()), ctx.clone()).await;
            let err = first.expect_err("cleanup failure should propagate");
            assert_eq!(err.kind(), tether_common::ErrorKind::LifecycleCleanup);
            assert_eq!(capture.last_phase(), Some(SyncTargetPhase::Terminating));
            assert_eq!(capture.removals(), 0, "finalizer must be retained");
            assert_eq!(stops.load(Ordering::SeqCst), 0);
            assert_eq!(
                error_policy(Arc::new(target.clone()), &err, ctx.clone()),
                Action::requeue(Duration::from_secs(1))
            );

            let mut retried = target;
            retried.status = capture.last_status();
            let action = reconcile(Arc::new(retried), ctx.clone())
                .await
                .expect("retry should succeed");

            assert_eq!(action, Action::await_change());
            assert_eq!(cleanups.load(Ordering::SeqCst), 2);
            assert_eq!(stops.load(Ordering::SeqCst), 1);
            assert_eq!(capture.removals(), 1);
            assert!(ctx.attempts.get("edge-1").is_none());
        }

        #[tokio::test]
        async fn test_lingering_agent_blocks_cleanup() {
            let capture = Capture::default();
            let target = deleting(target_with_phase("edge-1", SyncTargetPhase::Terminating));

            let mut agent = MockAgentDeployer::new();
            agent.expect_delete().returning(|_| Ok(()));
            agent.expect_exists().returning(|_| Ok(true));

            let mut engine = MockSyncEngine::new();
            engine.expect_pause_writes().return_const(());
            engine.expect_cleanup_physical().never();
            engine.expect_stop().never();

            let ctx = context(capturing_kube(&capture), agent, engine);
            let err = reconcile(Arc::new(target), ctx)
                .await
                .expect_err("agent still present");

            assert!(err.to_string().contains("agent-teardown"));
            assert_eq!(capture.removals(), 0);
        }

        #[tokio::test]
        async fn test_orphan_retention_skips_object_cleanup() {
            let capture = Capture::default();
            let mut target = target_with_phase("edge-1", SyncTargetPhase::Terminating);
            target.spec.retention = RetentionPolicy::Orphan;
            let target = deleting(target);

            let mut engine = MockSyncEngine::new();
            engine.expect_pause_writes().return_const(());
            engine.expect_cleanup_physical().never();
            engine.expect_stop().times(1).return_const(());

            let ctx = context(capturing_kube(&capture), ready_agent(), engine);
            reconcile(Arc::new(target), ctx).await.expect("reconcile");

            assert_eq!(capture.removals(), 1);
            assert_eq!(capture.patches(), 0, "already Terminating");
        }

        #[tokio::test]
        async fn test_target_without_agent_skips_agent_teardown() {
            let capture = Capture::default();
            let mut target = target_with_phase("edge-1", SyncTargetPhase::Terminating);
            target.spec.agent = None;
            let target = deleting(target);

            let mut agent = MockAgentDeployer::new();
            agent.expect_delete().never();
            agent.expect_exists().never();

            let mut engine = MockSyncEngine::new();
            engine.expect_pause_writes().return_const(());
            engine.expect_cleanup_physical().times(1).returning(|_| Ok(0));
            engine.expect_stop().times(1).return_const(());

            let ctx = context(capturing_kube(&capture), agent, engine);
            reconcile(Arc::new(target), ctx).await.expect("reconcile");
            assert_eq!(capture.removals(), 1);
        }

        #[tokio::test]
        async fn test_deleted_target_without_finalizer_is_ignored() {
            let mut target = deleting(sample_target("edge-1"));
            target.metadata.finalizers = None;
            let ctx = context(
                MockSyncTargetClient::new(),
                MockAgentDeployer::new(),
                MockSyncEngine::new(),
            );
            let action = reconcile(Arc::new(target), ctx).await.expect("reconcile");
            assert_eq!(action, Action::await_change());
        }
    }

    #[test]
    fn test_finalizer_patch_is_guarded_by_resource_version() {
        let mut target = sample_target("edge-1");
        target.metadata.resource_version = Some("812".to_string());
        target.metadata.finalizers = Some(vec!["backup.example/hold".to_string()]);

        let patch = finalizer_patch(
            &target,
            vec![
                "backup.example/hold".to_string(),
                SYNCER_FINALIZER.to_string(),
            ],
        );

        assert_eq!(patch["metadata"]["resourceVersion"], "812");
        assert_eq!(
            patch["metadata"]["finalizers"],
            serde_json::json!(["backup.example/hold", SYNCER_FINALIZER])
        );
    }

    #[test]
    fn test_status_without_proposal_awaits_heartbeat() {
        let target = target_with_phase("edge-1", SyncTargetPhase::Pending);
        let status = running_status(&target, SyncTargetPhase::Active, None);
        let ready = status.get_condition(CONDITION_READY).expect("Ready");
        assert_eq!(ready.status, ConditionStatus::Unknown);
        assert_eq!(ready.reason, "AwaitingHeartbeat");
    }
}
