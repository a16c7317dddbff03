//! Tether syncer: bidirectional workload synchronization between a logical
//! workspace and one physical cluster
//!
//! The lifecycle controller starts a [`runtime::SyncRuntime`] for the served
//! SyncTarget. The runtime runs resource discovery, one synchronizer per
//! eligible type and the status reporter under a single cancellation tree.

#![cfg_attr(not(test), deny(missing_docs))]

pub mod config;
pub mod discovery;
pub mod lifecycle;
pub mod pairs;
pub mod queue;
pub mod registry;
pub mod resolver;
pub mod runtime;
pub mod status;
pub mod store;
pub mod synchronizer;
pub mod transform;

pub use config::SyncerConfig;
pub use runtime::SyncRuntime;
