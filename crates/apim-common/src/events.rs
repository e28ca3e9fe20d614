//! Kubernetes Event recording for the APIM controllers.
//!
//! Events are fire-and-forget: a failed publish is logged and never breaks
//! reconciliation.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::Client;
use tracing::warn;

/// Trait for publishing Kubernetes Events.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish an Event on the given resource.
    ///
    /// * `resource_ref` - The object this event is about
    /// * `type_` - Normal or Warning
    /// * `reason` - Machine-readable reason, see [`reasons`]
    /// * `action` - What the controller was doing, see [`actions`]
    /// * `note` - Optional human-readable message
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    );
}

/// Production implementation wrapping `kube::runtime::events::Recorder`.
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    /// Create a publisher reporting as `controller_name`
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
            warn!(
                reason,
                action,
                error = %e,
                "Failed to publish Kubernetes event"
            );
        }
    }
}

/// No-op implementation for tests.
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

/// Well-known event reason strings.
pub mod reasons {
    /// A work order was created for an application
    pub const WORK_ORDER_CREATED: &str = "WorkOrderCreated";
    /// The control plane matches the declared API
    pub const SYNC_SUCCEEDED: &str = "SyncSucceeded";
    /// A synchronization attempt failed and will be retried
    pub const SYNC_FAILED: &str = "SyncFailed";
    /// The declared API could not be turned into a work order
    pub const VALIDATION_FAILED: &str = "ValidationFailed";
}

/// Well-known event action strings.
pub mod actions {
    /// Turning a readiness or edit signal into a work order
    pub const DISPATCH: &str = "Dispatch";
    /// Driving a work order against the control plane
    pub const SYNCHRONIZE: &str = "Synchronize";
}
