//! Heartbeat and aggregate health reporting
//!
//! The [`StatusReporter`] probes the physical cluster on a fixed period and
//! folds the result together with synchronizer health into a
//! [`StatusProposal`]. Proposals are published over a `tokio::sync::watch`
//! channel; the lifecycle manager is the only component that writes them to
//! the SyncTarget.

use std::sync::Arc;

use chrono::{DateTime, Utc};
#[cfg(test)]
use mockall::automock;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use tether_common::crd::{
    Condition, ConditionStatus, CONDITION_HEARTBEAT_READY, CONDITION_READY,
    CONDITION_SYNCER_READY,
};
use tether_common::metrics;

use crate::config::SyncerConfig;
use crate::store::{with_timeout, ClusterStore};
use crate::synchronizer::SyncHealth;

/// Source of per-type synchronizer health
#[cfg_attr(test, automock)]
pub trait SyncHealthSource: Send + Sync {
    /// Health of every running synchronizer
    fn health(&self) -> Vec<SyncHealth>;
    /// Types currently synchronized
    fn synced_types(&self) -> Vec<String>;
    /// Types that lost eligibility with pairs left behind
    fn orphaned_types(&self) -> Vec<String>;
}

/// Heartbeat bookkeeping
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HeartbeatRecord {
    /// Heartbeat sequence number; incremented every tick
    pub count: u64,
    /// Time of the last successful probe
    pub last_heartbeat: Option<DateTime<Utc>>,
    /// Cumulative failed probes
    pub errors: u64,
    /// Failed probes since the last success
    pub consecutive_failures: u32,
    /// Most recent probe error
    pub last_error: Option<String>,
}

/// Proposed health for the SyncTarget, built on every tick
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StatusProposal {
    /// Heartbeat state at the time of the proposal
    pub heartbeat: HeartbeatRecord,
    /// Physical cluster answering within the failure threshold
    pub heartbeat_ready: bool,
    /// Degraded plus failed pairs within the threshold
    pub syncer_ready: bool,
    /// Degraded plus failed pairs across all types
    pub unhealthy_pairs: usize,
    /// Types currently synchronized
    pub synced_resources: Vec<String>,
    /// Types orphaned by discovery
    pub orphaned_resources: Vec<String>,
}

impl StatusProposal {
    /// Top-level readiness
    pub fn ready(&self) -> bool {
        self.heartbeat_ready && self.syncer_ready
    }

    /// `HeartbeatReady`, `SyncerReady` and `Ready` conditions for this proposal
    pub fn conditions(&self) -> Vec<Condition> {
        let heartbeat = if self.heartbeat_ready {
            Condition::new(
                CONDITION_HEARTBEAT_READY,
                ConditionStatus::True,
                "HeartbeatSucceeded",
                "physical cluster is reachable",
            )
        } else {
            Condition::new(
                CONDITION_HEARTBEAT_READY,
                ConditionStatus::False,
                "HeartbeatFailed",
                format!(
                    "{} consecutive heartbeat failures: {}",
                    self.heartbeat.consecutive_failures,
                    self.heartbeat.last_error.as_deref().unwrap_or("unknown error")
                ),
            )
        };

        let syncer = if self.syncer_ready {
            Condition::new(
                CONDITION_SYNCER_READY,
                ConditionStatus::True,
                "SynchronizersHealthy",
                format!("{} resource types synchronized", self.synced_resources.len()),
            )
        } else {
            Condition::new(
                CONDITION_SYNCER_READY,
                ConditionStatus::False,
                "PairsDegraded",
                format!("{} pairs degraded or failed", self.unhealthy_pairs),
            )
        };

        let ready = match (self.heartbeat_ready, self.syncer_ready) {
            (true, true) => Condition::new(CONDITION_READY, ConditionStatus::True, "Ready", ""),
            (false, _) => Condition::new(
                CONDITION_READY,
                ConditionStatus::False,
                "HeartbeatFailed",
                "physical cluster is unreachable",
            ),
            (true, false) => Condition::new(
                CONDITION_READY,
                ConditionStatus::False,
                "SyncerNotReady",
                "one or more synchronizers are degraded",
            ),
        };

        vec![ready, syncer, heartbeat]
    }
}

/// Periodic heartbeat and health aggregation
pub struct StatusReporter {
    target: String,
    physical: Arc<dyn ClusterStore>,
    health: Arc<dyn SyncHealthSource>,
    config: Arc<SyncerConfig>,
    record: Mutex<HeartbeatRecord>,
    proposals: watch::Sender<Option<StatusProposal>>,
}

impl StatusReporter {
    /// Create a reporter probing `physical`
    pub fn new(
        target: impl Into<String>,
        physical: Arc<dyn ClusterStore>,
        health: Arc<dyn SyncHealthSource>,
        config: Arc<SyncerConfig>,
    ) -> Self {
        let (proposals, _) = watch::channel(None);
        Self {
            target: target.into(),
            physical,
            health,
            config,
            record: Mutex::new(HeartbeatRecord::default()),
            proposals,
        }
    }

    /// Receive every new proposal
    pub fn subscribe(&self) -> watch::Receiver<Option<StatusProposal>> {
        self.proposals.subscribe()
    }

    /// Most recent proposal, if a tick has run
    pub fn latest(&self) -> Option<StatusProposal> {
        self.proposals.borrow().clone()
    }

    /// Probe once, update the heartbeat record and publish a proposal
    pub async fn tick(&self) -> StatusProposal {
        let probe = with_timeout(
            self.physical.side(),
            "heartbeat",
            self.config.call_timeout(),
            self.physical.probe(),
        )
        .await;

        let heartbeat = {
            let mut record = self.record.lock();
            record.count += 1;
            match &probe {
                Ok(version) => {
                    if record.consecutive_failures > 0 {
                        info!(
                            sync_target = %self.target,
                            failures = record.consecutive_failures,
                            "Heartbeat recovered"
                        );
                    }
                    debug!(sync_target = %self.target, %version, seq = record.count, "Heartbeat");
                    record.last_heartbeat = Some(Utc::now());
                    record.consecutive_failures = 0;
                    record.last_error = None;
                }
                Err(e) => {
                    record.errors += 1;
                    record.consecutive_failures += 1;
                    record.last_error = Some(e.to_string());
                    warn!(
                        sync_target = %self.target,
                        failures = record.consecutive_failures,
                        error = %e,
                        "Heartbeat failed"
                    );
                }
            }
            record.clone()
        };
        metrics::record_heartbeat(&self.target, probe.is_ok());

        let unhealthy_pairs: usize = self
            .health
            .health()
            .iter()
            .map(SyncHealth::unhealthy_pairs)
            .sum();

        let proposal = StatusProposal {
            heartbeat_ready: heartbeat.consecutive_failures
                < self.config.heartbeat_failure_threshold,
            syncer_ready: unhealthy_pairs <= self.config.degraded_threshold,
            unhealthy_pairs,
            synced_resources: self.health.synced_types(),
            orphaned_resources: self.health.orphaned_types(),
            heartbeat,
        };

        self.proposals.send_replace(Some(proposal.clone()));
        proposal
    }

    /// Tick every heartbeat period until cancelled
    pub fn start(self: &Arc<Self>, parent: &CancellationToken) -> JoinHandle<()> {
        let reporter = self.clone();
        let token = parent.child_token();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(reporter.config.heartbeat_period());
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        reporter.tick().await;
                    }
                }
            }
            debug!(sync_target = %reporter.target, "Status reporter exiting");
        })
    }
}
