//! Per-type resource synchronizer
//!
//! A [`ResourceSynchronizer`] owns everything for one resource type: two
//! watch tasks (logical and physical) feeding a single [`WorkQueue`], a pool
//! of workers draining it, a periodic resync task, and the [`PairTable`].
//!
//! Workers fetch both snapshots, ask the resolver for a decision and apply
//! it with resourceVersion preconditions. Errors are routed by kind:
//!
//! | kind | handling |
//! | --- | --- |
//! | optimistic conflict, transient, not found | requeue with backoff, never degrade |
//! | both sides edited spec | logical wins in the same pass, one backoff requeue to re-check |
//! | validation | pair `Failed`, `Synced=False` on the logical object, no retry |
//! | anything else | requeue until `max_consecutive_failures`, then `Degraded` and `Synced=False` |

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::StreamExt;
use kube::api::DynamicObject;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use tether_common::crd::ConditionStatus;
use tether_common::metrics::{self, SyncResult};
use tether_common::{Error, ErrorKind, ObjectKey, ResourceType, Result, SYNC_TARGET_LABEL};

use crate::config::SyncerConfig;
use crate::pairs::{PairState, PairTable, SyncMarkers};
use crate::queue::{WorkItem, WorkQueue, WorkReason};
use crate::resolver::{
    resolve, Decision, ResolveInput, SyncAction, SyncFlavor, REASON_SYNC_DEGRADED,
    REASON_VALIDATION_FAILED,
};
use crate::store::{with_timeout, ClusterStore, Side};
use crate::transform::{logical_key_of, synced_condition, with_synced_condition, TransformContext};

/// Reason on the `Synced=True` condition written when a pair recovers
pub const REASON_SYNCED: &str = "Synced";

/// Result of one successful reconcile
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Nothing to write
    Noop,
    /// Writes were performed
    Applied {
        /// Number of writes
        writes: usize,
        /// Both sides had changed spec
        conflict: bool,
    },
    /// Gone on both sides; pair dropped
    Forgotten,
    /// Physical object not owned by this target
    Ignored,
    /// Pair is `Failed` or `Orphaned` and was not touched
    Skipped,
    /// Writes are paused
    Paused,
}

/// Point-in-time health of one synchronizer
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SyncHealth {
    /// `resource.group` of the type
    pub resource: String,
    /// Tracked pairs
    pub pairs: usize,
    /// Successful reconciles
    pub successes: u64,
    /// Failed reconciles
    pub errors: u64,
    /// Reconciles where both sides had changed spec
    pub conflicts: u64,
    /// Pairs in `Degraded`
    pub degraded: usize,
    /// Pairs in `Failed`
    pub failed: usize,
    /// Pairs in `Orphaned`
    pub orphaned: usize,
    /// Keys waiting in the queue
    pub queue_depth: usize,
}

impl SyncHealth {
    /// Pairs that count against the readiness threshold
    pub fn unhealthy_pairs(&self) -> usize {
        self.degraded + self.failed
    }
}

struct Inner {
    rt: ResourceType,
    flavor: SyncFlavor,
    logical: Arc<dyn ClusterStore>,
    physical: Arc<dyn ClusterStore>,
    ctx: Arc<TransformContext>,
    config: Arc<SyncerConfig>,
    pairs: PairTable,
    queue: Arc<WorkQueue<ObjectKey>>,
    paused: AtomicBool,
    successes: AtomicU64,
    errors: AtomicU64,
    conflicts: AtomicU64,
}

/// Bidirectional sync loop for one resource type
pub struct ResourceSynchronizer {
    inner: Arc<Inner>,
    cancel: Mutex<Option<CancellationToken>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ResourceSynchronizer {
    /// Create a stopped synchronizer
    pub fn new(
        rt: ResourceType,
        flavor: SyncFlavor,
        logical: Arc<dyn ClusterStore>,
        physical: Arc<dyn ClusterStore>,
        ctx: Arc<TransformContext>,
        config: Arc<SyncerConfig>,
    ) -> Self {
        let queue = Arc::new(WorkQueue::new(config.backoff()));
        Self {
            inner: Arc::new(Inner {
                rt,
                flavor,
                logical,
                physical,
                ctx,
                config,
                pairs: PairTable::new(),
                queue,
                paused: AtomicBool::new(false),
                successes: AtomicU64::new(0),
                errors: AtomicU64::new(0),
                conflicts: AtomicU64::new(0),
            }),
            cancel: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// The type this synchronizer serves
    pub fn resource_type(&self) -> &ResourceType {
        &self.inner.rt
    }

    /// The flavor chosen for the type
    pub fn flavor(&self) -> SyncFlavor {
        self.inner.flavor
    }

    /// Spawn watches, workers and resync under a child of `parent`.
    ///
    /// Calling `start` on a running synchronizer does nothing.
    pub fn start(&self, parent: &CancellationToken) {
        let mut cancel = self.cancel.lock();
        if cancel.is_some() {
            return;
        }
        let token = parent.child_token();
        let mut tasks = self.tasks.lock();

        tasks.push(tokio::spawn(watch_side(
            self.inner.clone(),
            Side::Logical,
            token.clone(),
        )));
        tasks.push(tokio::spawn(watch_side(
            self.inner.clone(),
            Side::Physical,
            token.clone(),
        )));
        tasks.push(tokio::spawn(resync_loop(self.inner.clone(), token.clone())));
        for worker in 0..self.inner.config.workers {
            tasks.push(tokio::spawn(run_worker(
                self.inner.clone(),
                worker,
                token.clone(),
            )));
        }

        info!(
            resource = %self.inner.rt,
            flavor = ?self.inner.flavor,
            workers = self.inner.config.workers,
            "Synchronizer started"
        );
        *cancel = Some(token);
    }

    /// Cancel all tasks and wait for in-flight work to finish
    pub async fn stop(&self) {
        let token = self.cancel.lock().take();
        let Some(token) = token else {
            return;
        };
        token.cancel();
        self.inner.queue.shutdown();

        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                warn!(resource = %self.inner.rt, error = %e, "Synchronizer task panicked");
            }
        }
        info!(resource = %self.inner.rt, "Synchronizer stopped");
    }

    /// True while tasks are running
    pub fn is_running(&self) -> bool {
        self.cancel.lock().is_some()
    }

    /// Stop issuing writes; watches keep running
    pub fn pause_writes(&self) {
        if !self.inner.paused.swap(true, Ordering::SeqCst) {
            info!(resource = %self.inner.rt, "Synchronizer writes paused");
        }
    }

    /// Current health counters
    pub fn health(&self) -> SyncHealth {
        let counts = self.inner.pairs.counts();
        SyncHealth {
            resource: self.inner.rt.group_resource(),
            pairs: counts.total,
            successes: self.inner.successes.load(Ordering::Relaxed),
            errors: self.inner.errors.load(Ordering::Relaxed),
            conflicts: self.inner.conflicts.load(Ordering::Relaxed),
            degraded: counts.degraded,
            failed: counts.failed,
            orphaned: counts.orphaned,
            queue_depth: self.inner.queue.len(),
        }
    }

    /// Mark every pair `Orphaned`; returns how many there were
    pub fn mark_orphaned(&self) -> usize {
        self.inner.pairs.mark_orphaned()
    }

    /// Snapshot of one pair
    pub fn pair(&self, key: &ObjectKey) -> Option<crate::pairs::TrackedPair> {
        self.inner.pairs.get(key)
    }

    /// Rate-limited requeues pending for a key
    pub fn pending_retries(&self, key: &ObjectKey) -> u32 {
        self.inner.queue.num_requeues(key)
    }

    /// Reconcile one key the way a worker does, including error routing
    pub async fn sync_key(&self, key: &ObjectKey) -> Result<SyncOutcome> {
        self.inner.process(key).await
    }

    /// Delete every physical object of this type tracked for the target.
    ///
    /// Attempts all objects and returns the first error, if any.
    pub async fn cleanup_physical(&self) -> Result<usize> {
        self.inner.cleanup_physical().await
    }
}

async fn watch_side(inner: Arc<Inner>, side: Side, cancel: CancellationToken) {
    let selector = inner.ctx.selector();
    let (store, reason) = match side {
        Side::Logical => (&inner.logical, WorkReason::LogicalEvent),
        Side::Physical => (&inner.physical, WorkReason::PhysicalEvent),
    };
    let mut events = store.watch(&inner.rt, &selector);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            event = events.next() => match event {
                Some(Ok(obj)) => {
                    let key = match side {
                        Side::Logical => ObjectKey::of(&obj),
                        Side::Physical => logical_key_of(&obj),
                    };
                    inner.queue.add(key, reason);
                }
                Some(Err(e)) => {
                    warn!(resource = %inner.rt, %side, error = %e, "Watch error");
                }
                None => {
                    warn!(resource = %inner.rt, %side, "Watch stream ended");
                    break;
                }
            }
        }
    }
    debug!(resource = %inner.rt, %side, "Watch task exiting");
}

async fn resync_loop(inner: Arc<Inner>, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(inner.config.resync_period());
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => inner.resync().await,
        }
    }
}

async fn run_worker(inner: Arc<Inner>, worker: usize, cancel: CancellationToken) {
    while let Some(WorkItem { key, reason }) = inner.queue.get(&cancel).await {
        debug!(resource = %inner.rt, worker, %key, %reason, "Processing");
        // Result is already routed and logged
        let _ = inner.process(&key).await;
        inner.queue.done(&key);
    }
    debug!(resource = %inner.rt, worker, "Worker exiting");
}

impl Inner {
    async fn timed<T>(
        &self,
        side: Side,
        operation: &str,
        fut: impl std::future::Future<Output = Result<T>>,
    ) -> Result<T> {
        with_timeout(side, operation, self.config.call_timeout(), fut).await
    }

    async fn resync(&self) {
        let selector = self.ctx.selector();
        let mut keys = self.pairs.keys();

        match self
            .timed(Side::Logical, "list", self.logical.list(&self.rt, &selector))
            .await
        {
            Ok(objects) => keys.extend(objects.iter().map(ObjectKey::of)),
            Err(e) => warn!(resource = %self.rt, error = %e, "Resync list of logical side failed"),
        }
        match self
            .timed(Side::Physical, "list", self.physical.list(&self.rt, &selector))
            .await
        {
            Ok(objects) => keys.extend(objects.iter().map(logical_key_of)),
            Err(e) => warn!(resource = %self.rt, error = %e, "Resync list of physical side failed"),
        }

        debug!(resource = %self.rt, keys = keys.len(), "Resync");
        for key in keys {
            self.queue.add(key, WorkReason::Resync);
        }
    }

    async fn process(&self, key: &ObjectKey) -> Result<SyncOutcome> {
        let resource = self.rt.group_resource();
        match self.reconcile(key).await {
            Ok(outcome) => {
                if matches!(outcome, SyncOutcome::Applied { conflict: true, .. }) {
                    let delay = self.queue.add_rate_limited(key.clone());
                    debug!(resource = %self.rt, %key, ?delay, "Conflict resolved, re-checking after backoff");
                } else {
                    self.queue.forget(key);
                }
                match outcome {
                    SyncOutcome::Applied { .. } => {
                        self.successes.fetch_add(1, Ordering::Relaxed);
                        metrics::record_sync(&resource, SyncResult::Synced);
                    }
                    SyncOutcome::Noop => metrics::record_sync(&resource, SyncResult::Noop),
                    _ => {}
                }
                Ok(outcome)
            }
            Err(e) => {
                self.errors.fetch_add(1, Ordering::Relaxed);
                let result = if e.is_conflict() {
                    SyncResult::Conflict
                } else {
                    SyncResult::Error
                };
                metrics::record_sync(&resource, result);
                self.route_error(key, &e).await;
                Err(e)
            }
        }
    }

    async fn route_error(&self, key: &ObjectKey, error: &Error) {
        let message = error.to_string();
        match error.kind() {
            ErrorKind::OptimisticConflict | ErrorKind::NotFound => {
                self.pairs.record_transient(key, &message);
                let delay = self.queue.add_rate_limited(key.clone());
                debug!(resource = %self.rt, %key, ?delay, error = %message, "Requeued after stale read");
            }
            ErrorKind::TransientConnectivity => {
                self.pairs.record_transient(key, &message);
                let delay = self.queue.add_rate_limited(key.clone());
                warn!(resource = %self.rt, %key, ?delay, error = %message, "Transient failure, retrying");
            }
            ErrorKind::Validation => {
                self.queue.forget(key);
                warn!(resource = %self.rt, %key, error = %message, "Rejected as invalid, waiting for a spec change");
            }
            ErrorKind::LifecycleCleanup | ErrorKind::Internal => {
                let state = self.pairs.record_failure(
                    key,
                    &message,
                    self.config.max_consecutive_failures,
                );
                if state == PairState::Degraded {
                    self.queue.forget(key);
                    warn!(resource = %self.rt, %key, error = %message, "Pair degraded, waiting for resync");
                    self.report_degraded(key, &message).await;
                } else {
                    let delay = self.queue.add_rate_limited(key.clone());
                    warn!(resource = %self.rt, %key, ?delay, error = %message, "Sync failed, retrying");
                }
            }
        }
    }

    #[instrument(skip(self), fields(resource = %self.rt))]
    async fn reconcile(&self, key: &ObjectKey) -> Result<SyncOutcome> {
        if self.paused.load(Ordering::SeqCst) {
            return Ok(SyncOutcome::Paused);
        }

        let physical_key = self.ctx.physical_key(key);
        let logical = self
            .timed(Side::Logical, "get", self.logical.get(&self.rt, key))
            .await?;
        let physical = self
            .timed(Side::Physical, "get", self.physical.get(&self.rt, &physical_key))
            .await?;

        let pair = self.pairs.get(key);
        if let Some(pair) = &pair {
            match pair.state {
                PairState::Orphaned => return Ok(SyncOutcome::Skipped),
                PairState::Failed if logical.as_ref().is_some_and(|l| pair.rejected(l)) => {
                    return Ok(SyncOutcome::Skipped);
                }
                _ => {}
            }
        }

        let decision = resolve(
            &self.ctx,
            ResolveInput {
                logical: logical.as_ref(),
                physical: physical.as_ref(),
                markers: pair.as_ref().map(|p| &p.markers),
                flavor: self.flavor,
                status_upsync: self.config.features.status_upsync,
                now: Utc::now(),
            },
        );

        match decision {
            Decision::Noop => {
                let conflict = pair.as_ref().is_some_and(|p| p.conflict);
                self.pairs.record_success(
                    key,
                    SyncMarkers::observe(logical.as_ref(), physical.as_ref()),
                    conflict,
                    PairState::Synced,
                );
                let recovered = self
                    .clear_stale_condition(
                        pair.as_ref().map(|p| p.state),
                        PairState::Synced,
                        logical.as_ref(),
                    )
                    .await?;
                if recovered > 0 {
                    return Ok(SyncOutcome::Applied {
                        writes: recovered,
                        conflict: false,
                    });
                }
                Ok(SyncOutcome::Noop)
            }
            Decision::Forget => {
                if self.pairs.remove(key).is_some() {
                    debug!(%key, "Forgot pair");
                }
                Ok(SyncOutcome::Forgotten)
            }
            Decision::Ignore => {
                debug!(%key, "Physical object not owned by this target, ignoring");
                Ok(SyncOutcome::Ignored)
            }
            Decision::Apply { actions, conflict } => {
                if conflict {
                    self.conflicts.fetch_add(1, Ordering::Relaxed);
                    warn!(%key, "Both sides changed spec since last sync, logical spec wins");
                }
                let previous = pair.as_ref().map(|p| p.state);
                let (writes, state, markers, logical_now) =
                    self.apply(key, logical, actions, pair.as_ref()).await?;
                if markers.logical_rv.is_none() && markers.physical_rv.is_none() {
                    self.pairs.remove(key);
                } else {
                    self.pairs.record_success(key, markers, conflict, state);
                }
                let recovered = self
                    .clear_stale_condition(previous, state, logical_now.as_ref())
                    .await?;
                Ok(SyncOutcome::Applied {
                    writes: writes + recovered,
                    conflict,
                })
            }
        }
    }

    /// Perform the decision's writes in order.
    ///
    /// Returns the write count, the resulting pair state, fresh markers and
    /// the latest logical object.
    async fn apply(
        &self,
        key: &ObjectKey,
        logical: Option<DynamicObject>,
        actions: Vec<SyncAction>,
        pair: Option<&crate::pairs::TrackedPair>,
    ) -> Result<(usize, PairState, SyncMarkers, Option<DynamicObject>)> {
        let mut logical_now = logical;
        let mut physical_now: Option<DynamicObject> = None;
        let mut physical_seen = true;
        let mut state = PairState::Synced;
        let mut writes = 0;

        for action in actions {
            match action {
                SyncAction::CreatePhysical(obj) => {
                    if let Some(ns) = obj.metadata.namespace.as_deref() {
                        let labels = [(SYNC_TARGET_LABEL, self.ctx.target.name.as_str())];
                        self.timed(
                            Side::Physical,
                            "ensure_namespace",
                            self.physical.ensure_namespace(ns, &labels),
                        )
                        .await?;
                    }
                    let created = self
                        .write_physical("create", self.physical.create(&self.rt, &obj), &logical_now, key)
                        .await?;
                    info!(%key, physical = %ObjectKey::of(&created), "Created physical object");
                    physical_now = Some(created);
                    writes += 1;
                }
                SyncAction::UpdatePhysical(obj) => {
                    let updated = self
                        .write_physical("replace", self.physical.replace(&self.rt, &obj), &logical_now, key)
                        .await?;
                    info!(%key, "Updated physical spec");
                    physical_now = Some(updated);
                    writes += 1;
                }
                SyncAction::DeletePhysical {
                    key: physical_key,
                    resource_version,
                } => {
                    self.timed(
                        Side::Physical,
                        "delete",
                        self.physical
                            .delete(&self.rt, &physical_key, resource_version.as_deref()),
                    )
                    .await?;
                    info!(%key, physical = %physical_key, "Deleted physical object");
                    physical_seen = false;
                    writes += 1;
                }
                SyncAction::UpdateLogicalStatus(obj) => {
                    let updated = self
                        .timed(
                            Side::Logical,
                            "replace_status",
                            self.logical.replace_status(&self.rt, &obj),
                        )
                        .await?;
                    debug!(%key, "Reflected physical status");
                    logical_now = Some(updated);
                    writes += 1;
                }
                SyncAction::ReportPhysicalRemoved(status_write) => {
                    if let Some(obj) = status_write {
                        let updated = self
                            .timed(
                                Side::Logical,
                                "replace_status",
                                self.logical.replace_status(&self.rt, &obj),
                            )
                            .await?;
                        info!(%key, "Physical object removed out-of-band, reported on logical status");
                        logical_now = Some(updated);
                        writes += 1;
                    }
                    physical_seen = false;
                    state = PairState::PhysicalRemoved;
                }
            }
        }

        if physical_now.is_none() && physical_seen {
            physical_now = self
                .timed(
                    Side::Physical,
                    "get",
                    self.physical.get(&self.rt, &self.ctx.physical_key(key)),
                )
                .await?;
        }

        let mut markers = SyncMarkers::observe(logical_now.as_ref(), physical_now.as_ref());
        if state == PairState::PhysicalRemoved {
            // Remember that the object existed so the removal is not undone
            if let Some(previous) = pair {
                markers.physical_rv = previous.markers.physical_rv.clone();
                markers.physical_generation = previous.markers.physical_generation;
            }
        }
        Ok((writes, state, markers, logical_now))
    }

    /// Physical spec write; a validation rejection fails the pair
    async fn write_physical(
        &self,
        operation: &str,
        fut: impl std::future::Future<Output = Result<DynamicObject>>,
        logical: &Option<DynamicObject>,
        key: &ObjectKey,
    ) -> Result<DynamicObject> {
        match self.timed(Side::Physical, operation, fut).await {
            Ok(obj) => Ok(obj),
            Err(e) if e.kind() == ErrorKind::Validation => {
                self.fail_validation(key, logical.as_ref(), &e).await;
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    async fn fail_validation(&self, key: &ObjectKey, logical: Option<&DynamicObject>, error: &Error) {
        let message = error.to_string();
        let written = match logical {
            Some(l) => {
                self.write_synced_false(key, l, REASON_VALIDATION_FAILED, &message)
                    .await
            }
            None => None,
        };
        // The status write moves resourceVersion; remember the version it left
        self.pairs
            .mark_failed(key, written.as_ref().or(logical), &message);
    }

    /// Surface a degraded pair on the logical object's status
    async fn report_degraded(&self, key: &ObjectKey, message: &str) {
        if !self.flavor.upsyncs_status() {
            return;
        }
        match self
            .timed(Side::Logical, "get", self.logical.get(&self.rt, key))
            .await
        {
            Ok(Some(logical)) => {
                self.write_synced_false(key, &logical, REASON_SYNC_DEGRADED, message)
                    .await;
            }
            Ok(None) => {}
            Err(e) => warn!(%key, error = %e, "Failed to read logical object for degraded report"),
        }
    }

    /// Write `Synced=False` onto a logical object's status.
    ///
    /// Skipped for spec-only types and when the condition is already set.
    /// Returns the written object.
    async fn write_synced_false(
        &self,
        key: &ObjectKey,
        logical: &DynamicObject,
        reason: &str,
        message: &str,
    ) -> Option<DynamicObject> {
        if !self.flavor.upsyncs_status() {
            return None;
        }
        let updated = with_synced_condition(logical, ConditionStatus::False, reason, message)?;
        match self
            .timed(
                Side::Logical,
                "replace_status",
                self.logical.replace_status(&self.rt, &updated),
            )
            .await
        {
            Ok(written) => Some(written),
            Err(e) => {
                warn!(%key, reason, error = %e, "Failed to record sync failure on logical status");
                None
            }
        }
    }

    /// After a `Failed`, `Degraded` or `PhysicalRemoved` pair recovers, flip
    /// its `Synced` condition back to true. Returns the number of writes.
    async fn clear_stale_condition(
        &self,
        previous: Option<PairState>,
        state: PairState,
        logical: Option<&DynamicObject>,
    ) -> Result<usize> {
        let recovering = matches!(
            previous,
            Some(PairState::Failed | PairState::Degraded | PairState::PhysicalRemoved)
        ) && state == PairState::Synced;
        if !recovering || !self.flavor.upsyncs_status() {
            return Ok(0);
        }
        let Some(logical) = logical else {
            return Ok(0);
        };
        if !synced_condition(logical).is_some_and(|c| c.status == ConditionStatus::False) {
            return Ok(0);
        }
        let Some(updated) = with_synced_condition(
            logical,
            ConditionStatus::True,
            REASON_SYNCED,
            &format!("in sync with {}", self.ctx.target.name),
        ) else {
            return Ok(0);
        };
        let key = ObjectKey::of(logical);
        let written = self
            .timed(
                Side::Logical,
                "replace_status",
                self.logical.replace_status(&self.rt, &updated),
            )
            .await?;
        let mut markers = self.pairs.get(&key).map(|p| p.markers).unwrap_or_default();
        markers.logical_rv = written.metadata.resource_version.clone();
        self.pairs
            .record_success(&key, markers, false, PairState::Synced);
        Ok(1)
    }

    async fn cleanup_physical(&self) -> Result<usize> {
        let selector = self.ctx.selector();
        let objects = self
            .timed(Side::Physical, "list", self.physical.list(&self.rt, &selector))
            .await?;

        let mut deleted = 0;
        let mut first_error = None;
        for obj in objects.iter().filter(|o| self.ctx.is_tracked(o)) {
            let key = ObjectKey::of(obj);
            let result = self
                .timed(
                    Side::Physical,
                    "delete",
                    self.physical
                        .delete(&self.rt, &key, obj.metadata.resource_version.as_deref()),
                )
                .await;
            match result {
                Ok(()) => {
                    deleted += 1;
                    self.pairs.remove(&logical_key_of(obj));
                }
                Err(e) => {
                    warn!(resource = %self.rt, %key, error = %e, "Cleanup delete failed");
                    first_error.get_or_insert(e);
                }
            }
        }

        info!(resource = %self.rt, deleted, "Physical cleanup pass finished");
        match first_error {
            Some(e) => Err(Error::cleanup(
                self.ctx.target.name.clone(),
                format!("delete {}", self.rt.group_resource()),
                e.to_string(),
            )),
            None => Ok(deleted),
        }
    }
}

/// Poll until `check` holds or `limit` elapses
#[cfg(test)]
pub(crate) async fn eventually(limit: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
