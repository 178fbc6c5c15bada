//! Event recorder: publishes one Normal/Warning Kubernetes Event per
//! actuator action, the only externally-visible trace of an act besides
//! logs (spec.md §7, "operators see exactly one Normal or Warning event
//! per act").

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::Client;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Normal,
    Warning,
}

/// Write-only, best-effort, asynchronous sink. A publish failure is
/// logged but never propagated — the event recorder is a collaborator,
/// not part of the reconciler's correctness contract.
#[async_trait]
pub trait EventRecorder: Send + Sync {
    async fn record(&self, severity: Severity, reason: &str, message: String);
}

pub struct KubeEventRecorder {
    recorder: Recorder,
}

impl KubeEventRecorder {
    pub fn new(client: Client, node_name: &str) -> Self {
        let reporter = Reporter {
            controller: "node-mechanic".to_string(),
            instance: Some(node_name.to_string()),
        };
        let object_ref = ObjectReference {
            kind: Some("Node".to_string()),
            name: Some(node_name.to_string()),
            api_version: Some("v1".to_string()),
            ..Default::default()
        };
        Self {
            recorder: Recorder::new(client, reporter, object_ref),
        }
    }
}

#[async_trait]
impl EventRecorder for KubeEventRecorder {
    async fn record(&self, severity: Severity, reason: &str, message: String) {
        let type_ = match severity {
            Severity::Normal => EventType::Normal,
            Severity::Warning => EventType::Warning,
        };
        let event = Event {
            type_,
            reason: reason.to_string(),
            note: Some(message),
            action: "Reconciling".to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(event).await {
            warn!(error = %e, reason, "event_publish_failed");
        }
    }
}

#[cfg(any(test, feature = "test-util"))]
pub mod fake {
    use super::*;
    use std::sync::Mutex;

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct RecordedEvent {
        pub severity: Severity,
        pub reason: String,
        pub message: String,
    }

    #[derive(Default)]
    pub struct FakeEventRecorder {
        pub events: Mutex<Vec<RecordedEvent>>,
    }

    impl FakeEventRecorder {
        /// The reasons recorded so far, in order, for test assertions.
        pub fn recorded_reasons(&self) -> Vec<String> {
            self.events.lock().unwrap().iter().map(|e| e.reason.clone()).collect()
        }
    }

    #[async_trait]
    impl EventRecorder for FakeEventRecorder {
        async fn record(&self, severity: Severity, reason: &str, message: String) {
            self.events.lock().unwrap().push(RecordedEvent {
                severity,
                reason: reason.to_string(),
                message,
            });
        }
    }
}
