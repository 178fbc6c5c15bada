//! Metadata probe: queries the instance metadata service for scheduled
//! platform maintenance events affecting this VM.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;

const DEFAULT_ENDPOINT: &str = "169.254.169.254";
const API_VERSION: &str = "2020-07-01";
const MAX_ATTEMPTS: u32 = 4;
/// Retry delays for attempts after a clean-EOF response, capped at 10s.
const RETRY_DELAYS_SECS: [u64; 3] = [2, 4, 8];

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("transport error calling metadata service: {0}")]
    Transport(#[source] reqwest::Error),
    #[error("metadata service returned status {0}")]
    Status(StatusCode),
    #[error("failed to decode metadata service response: {0}")]
    Decode(#[source] reqwest::Error),
    #[error("metadata service closed the connection after {attempts} attempts")]
    EofRetriesExhausted { attempts: u32 },
    #[error("probe cancelled")]
    Cancelled,
}

/// Platform event kind. `Unknown` preserves forward compatibility with wire
/// values the evaluator/resolver don't recognize; decoding never fails on
/// these.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    Reboot,
    Redeploy,
    Freeze,
    Preempt,
    Terminate,
    Unknown(String),
}

impl From<&str> for EventKind {
    fn from(s: &str) -> Self {
        match s {
            "Reboot" => EventKind::Reboot,
            "Redeploy" => EventKind::Redeploy,
            "Freeze" => EventKind::Freeze,
            "Preempt" => EventKind::Preempt,
            "Terminate" => EventKind::Terminate,
            other => EventKind::Unknown(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventStatus {
    Scheduled,
    Started,
    Unknown(String),
}

impl From<&str> for EventStatus {
    fn from(s: &str) -> Self {
        match s {
            "Scheduled" => EventStatus::Scheduled,
            "Started" => EventStatus::Started,
            other => EventStatus::Unknown(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventSource {
    Platform,
    User,
    Unknown(String),
}

impl From<&str> for EventSource {
    fn from(s: &str) -> Self {
        match s {
            "Platform" => EventSource::Platform,
            "User" => EventSource::User,
            other => EventSource::Unknown(other.to_string()),
        }
    }
}

/// A single scheduled platform event, decoded from the metadata service's
/// wire format into a shape the policy resolver consumes directly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledEvent {
    pub event_id: String,
    pub kind: EventKind,
    pub resource_type: String,
    pub resources: Vec<String>,
    pub status: EventStatus,
    pub not_before: Option<DateTime<Utc>>,
    pub description: String,
    pub source: EventSource,
    pub duration_secs: Option<i64>,
}

impl ScheduledEvent {
    pub fn is_virtual_machine(&self) -> bool {
        self.resource_type == "VirtualMachine"
    }

    /// Exact match or substring match, tolerating platform-side prefixing.
    pub fn targets_instance(&self, instance_name: &str) -> bool {
        self.resources
            .iter()
            .any(|r| r == instance_name || r.contains(instance_name))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScheduledEventResponse {
    pub incarnation_id: i64,
    pub events: Vec<ScheduledEvent>,
}

#[derive(Debug, Deserialize)]
struct WireResponse {
    #[serde(rename = "DocumentIncarnation")]
    document_incarnation: i64,
    #[serde(rename = "Events")]
    events: Vec<WireEvent>,
}

#[derive(Debug, Deserialize)]
struct WireEvent {
    #[serde(rename = "EventId")]
    event_id: String,
    #[serde(rename = "EventType")]
    event_type: String,
    #[serde(rename = "ResourceType")]
    resource_type: String,
    #[serde(rename = "Resources", default)]
    resources: Vec<String>,
    #[serde(rename = "EventStatus")]
    event_status: String,
    #[serde(rename = "NotBefore", default)]
    not_before: String,
    #[serde(rename = "Description", default)]
    description: String,
    #[serde(rename = "EventSource")]
    event_source: String,
    #[serde(rename = "DurationInSeconds", default)]
    duration_in_seconds: Option<i64>,
}

fn parse_not_before(raw: &str) -> Option<DateTime<Utc>> {
    if raw.trim().is_empty() {
        debug!("metadata_event_missing_not_before");
        return None;
    }
    NaiveDateTime::parse_from_str(raw.trim(), "%a, %d %b %Y %H:%M:%S GMT")
        .map(|naive| naive.and_utc())
        .map_err(|e| {
            debug!(raw, error = %e, "metadata_event_not_before_unparseable");
        })
        .ok()
}

impl From<WireEvent> for ScheduledEvent {
    fn from(w: WireEvent) -> Self {
        ScheduledEvent {
            event_id: w.event_id,
            kind: EventKind::from(w.event_type.as_str()),
            resource_type: w.resource_type,
            resources: w.resources,
            status: EventStatus::from(w.event_status.as_str()),
            not_before: parse_not_before(&w.not_before),
            description: w.description,
            source: EventSource::from(w.event_source.as_str()),
            duration_secs: w.duration_in_seconds,
        }
    }
}

impl From<WireResponse> for ScheduledEventResponse {
    fn from(w: WireResponse) -> Self {
        ScheduledEventResponse {
            incarnation_id: w.document_incarnation,
            events: w.events.into_iter().map(ScheduledEvent::from).collect(),
        }
    }
}

/// The probe is stateless and safe to call concurrently, though the
/// reconciler never does so.
#[async_trait]
pub trait MetadataProbe: Send + Sync {
    async fn probe(&self) -> Result<ScheduledEventResponse, ProbeError>;
}

/// Real implementation against the platform metadata endpoint.
pub struct HttpMetadataProbe {
    client: Client,
    endpoint: String,
    cancel: CancellationToken,
}

impl HttpMetadataProbe {
    pub fn new(cancel: CancellationToken) -> Result<Self, ProbeError> {
        Self::with_endpoint(DEFAULT_ENDPOINT, cancel)
    }

    /// Constructs a probe against an arbitrary endpoint, so tests can point
    /// it at a local HTTP stub instead of the real link-local address.
    pub fn with_endpoint(endpoint: impl Into<String>, cancel: CancellationToken) -> Result<Self, ProbeError> {
        let client = Client::builder()
            .no_proxy()
            .build()
            .map_err(ProbeError::Transport)?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            cancel,
        })
    }

    fn url(&self) -> String {
        format!("http://{}/metadata/scheduledevents?api-version={API_VERSION}", self.endpoint)
    }

    async fn fetch_once(&self) -> Result<ScheduledEventResponse, ProbeError> {
        let response = self
            .client
            .get(self.url())
            .header("Metadata", "true")
            .send()
            .await
            .map_err(ProbeError::Transport)?;

        if !response.status().is_success() {
            return Err(ProbeError::Status(response.status()));
        }

        let wire: WireResponse = response.json().await.map_err(ProbeError::Decode)?;
        Ok(wire.into())
    }
}

fn is_clean_eof(err: &ProbeError) -> bool {
    let ProbeError::Transport(e) = err else {
        return false;
    };
    let mut source: Option<&(dyn std::error::Error + 'static)> = Some(e);
    while let Some(s) = source {
        if let Some(io_err) = s.downcast_ref::<std::io::Error>() {
            if io_err.kind() == std::io::ErrorKind::UnexpectedEof {
                return true;
            }
        }
        if s.to_string().contains("connection closed before message completed") {
            return true;
        }
        source = s.source();
    }
    false
}

#[async_trait]
impl MetadataProbe for HttpMetadataProbe {
    async fn probe(&self) -> Result<ScheduledEventResponse, ProbeError> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            if self.cancel.is_cancelled() {
                return Err(ProbeError::Cancelled);
            }

            match self.fetch_once().await {
                Ok(resp) => return Ok(resp),
                Err(err) if is_clean_eof(&err) && attempt < MAX_ATTEMPTS => {
                    let delay = RETRY_DELAYS_SECS
                        .get((attempt - 1) as usize)
                        .copied()
                        .unwrap_or(10)
                        .min(10);
                    debug!(attempt, delay, "metadata_probe_clean_eof_retrying");
                    crate::metrics::PROBE_RETRIES.inc();
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_secs(delay)) => {}
                        _ = self.cancel.cancelled() => return Err(ProbeError::Cancelled),
                    }
                }
                Err(err) if is_clean_eof(&err) => {
                    return Err(ProbeError::EofRetriesExhausted { attempts: attempt });
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[cfg(any(test, feature = "test-util"))]
pub mod fake {
    use super::*;
    use std::sync::Mutex;

    /// In-memory double returning a fixed response, for reconciler tests
    /// that don't need a live metadata service.
    pub struct FakeProbe {
        response: Mutex<ScheduledEventResponse>,
        calls: Mutex<u32>,
    }

    impl FakeProbe {
        pub fn with_events(events: Vec<ScheduledEvent>) -> Self {
            Self {
                response: Mutex::new(ScheduledEventResponse { incarnation_id: 1, events }),
                calls: Mutex::new(0),
            }
        }

        pub fn calls(&self) -> u32 {
            *self.calls.lock().unwrap()
        }
    }

    #[async_trait]
    impl MetadataProbe for FakeProbe {
        async fn probe(&self) -> Result<ScheduledEventResponse, ProbeError> {
            *self.calls.lock().unwrap() += 1;
            Ok(self.response.lock().unwrap().clone())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{routing::get, Json, Router};
    use tokio::net::TcpListener;

    async fn spawn_stub(body: serde_json::Value) -> String {
        let router = Router::new().route(
            "/metadata/scheduledevents",
            get(move || {
                let body = body.clone();
                async move { Json(body) }
            }),
        );
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        addr.to_string()
    }

    #[tokio::test]
    async fn decodes_well_formed_response() {
        let addr = spawn_stub(serde_json::json!({
            "DocumentIncarnation": 3,
            "Events": [{
                "EventId": "abc",
                "EventType": "Freeze",
                "ResourceType": "VirtualMachine",
                "Resources": ["test-vmss_1"],
                "EventStatus": "Scheduled",
                "NotBefore": "",
                "Description": "Virtual machine is being paused because of a memory-preserving Live Migration operation.",
                "EventSource": "Platform",
                "DurationInSeconds": 9
            }]
        }))
        .await;

        let probe = HttpMetadataProbe::with_endpoint(addr, CancellationToken::new()).unwrap();
        let resp = probe.probe().await.unwrap();
        assert_eq!(resp.incarnation_id, 3);
        assert_eq!(resp.events.len(), 1);
        assert_eq!(resp.events[0].kind, EventKind::Freeze);
        assert!(resp.events[0].is_virtual_machine());
        assert!(resp.events[0].targets_instance("test-vmss_1"));
        assert!(resp.events[0].not_before.is_none());
    }

    #[tokio::test]
    async fn tolerates_unrecognized_event_kind_and_extra_fields() {
        let addr = spawn_stub(serde_json::json!({
            "DocumentIncarnation": 1,
            "Events": [{
                "EventId": "xyz",
                "EventType": "SomeFutureKind",
                "ResourceType": "VirtualMachine",
                "Resources": ["node_7"],
                "EventStatus": "Started",
                "NotBefore": "Mon, 19 Sep 2022 18:29:47 GMT",
                "Description": "",
                "EventSource": "Platform",
                "DurationInSeconds": -1,
                "SomeFieldWeDontKnowAbout": 42
            }]
        }))
        .await;

        let probe = HttpMetadataProbe::with_endpoint(addr, CancellationToken::new()).unwrap();
        let resp = probe.probe().await.unwrap();
        assert_eq!(resp.events[0].kind, EventKind::Unknown("SomeFutureKind".to_string()));
        assert!(resp.events[0].not_before.is_some());
    }

    #[tokio::test]
    async fn empty_events_list_decodes_cleanly() {
        let addr = spawn_stub(serde_json::json!({ "DocumentIncarnation": 0, "Events": [] })).await;
        let probe = HttpMetadataProbe::with_endpoint(addr, CancellationToken::new()).unwrap();
        let resp = probe.probe().await.unwrap();
        assert!(resp.events.is_empty());
    }

    #[test]
    fn not_before_empty_string_is_none() {
        assert!(parse_not_before("").is_none());
        assert!(parse_not_before("   ").is_none());
    }

    #[test]
    fn not_before_garbage_is_none_not_a_panic() {
        assert!(parse_not_before("not a date").is_none());
    }

    #[test]
    fn retry_delay_schedule_is_capped_at_ten_seconds() {
        for d in RETRY_DELAYS_SECS {
            assert!(d <= 10);
        }
    }
}
