//! Kubernetes Events for SyncTarget lifecycle transitions
//!
//! Events are fire-and-forget: a failed publish is logged and swallowed so it
//! can never block a phase transition or cleanup step.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::Client;
use tracing::warn;

/// Publishes Kubernetes Events about an object
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish one event. Never fails from the caller's point of view.
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    );
}

/// Publisher backed by `kube::runtime::events::Recorder`
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    /// `controller_name` becomes the event's reportingComponent
    pub fn new(client: Client, controller_name: &str) -> Self {
        let reporter = Reporter {
            controller: controller_name.to_string(),
            instance: std::env::var("POD_NAME").ok(),
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let event = Event {
            type_,
            reason: reason.to_string(),
            note,
            action: action.to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, resource_ref).await {
            warn!(reason, action, error = %e, "Failed to publish Kubernetes event");
        }
    }
}

/// Publisher that drops every event
pub struct NoopEventPublisher;

#[async_trait]
impl EventPublisher for NoopEventPublisher {
    async fn publish(
        &self,
        _resource_ref: &ObjectReference,
        _type_: EventType,
        _reason: &str,
        _action: &str,
        _note: Option<String>,
    ) {
    }
}

/// Event reasons (REASON column of `kubectl get events`)
pub mod reasons {
    /// Finalizer added; SyncTarget registered with this syncer
    pub const REGISTERED: &str = "Registered";
    /// Spec failed validation
    pub const INVALID_SPEC: &str = "InvalidSpec";
    /// Agent workload created or updated on the physical cluster
    pub const AGENT_DEPLOYED: &str = "AgentDeployed";
    /// Phase moved to Active
    pub const ACTIVE: &str = "Active";
    /// Phase moved to Unavailable
    pub const UNAVAILABLE: &str = "Unavailable";
    /// Deletion observed; cleanup started
    pub const TERMINATING: &str = "Terminating";
    /// A termination step failed and will be retried
    pub const CLEANUP_FAILED: &str = "CleanupFailed";
    /// All cleanup finished; finalizer removed
    pub const CLEANUP_COMPLETE: &str = "CleanupComplete";
}

/// Event actions (ACTION column of `kubectl get events`)
pub mod actions {
    /// Normal reconciliation
    pub const RECONCILE: &str = "Reconcile";
    /// Deploying the agent
    pub const DEPLOY: &str = "Deploy";
    /// Termination cleanup
    pub const CLEANUP: &str = "Cleanup";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn noop_publisher_accepts_events() {
        let publisher = NoopEventPublisher;
        publisher
            .publish(
                &ObjectReference::default(),
                EventType::Warning,
                reasons::CLEANUP_FAILED,
                actions::CLEANUP,
                Some("agent deployment still present".to_string()),
            )
            .await;
    }

    #[test]
    fn publishers_are_object_safe() {
        let _boxed: Box<dyn EventPublisher> = Box::new(NoopEventPublisher);
    }
}
