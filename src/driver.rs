//! The driver: turns external triggers (a node watch, or a timer) into
//! calls to [`crate::reconciler::Reconciler`], and serves `/healthz`,
//! `/readyz`, and `/metrics` alongside it.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Node;
use kube::{Api, Client};
use kube_runtime::reflector::{self, Store};
use kube_runtime::watcher::{self, Config, Event};
use prometheus::{Encoder, TextEncoder};
use rand::Rng;
use tokio::signal;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::actuator::{self, NodeCache, NodeSnapshot};
use crate::config::{ConfigWatcher, NodePolicy};
use crate::reconciler::{PassMode, Reconciler};

/// Backs [`NodeCache`] with the local reflector store the watch loop keeps
/// in sync, so P1 reads the cluster API cache in watch mode instead of
/// issuing a live GET (spec.md §4.5 P1).
struct ReflectorNodeCache {
    store: Store<Node>,
}

impl NodeCache for ReflectorNodeCache {
    fn get(&self) -> Option<NodeSnapshot> {
        self.store.state().first().map(|node| actuator::snapshot_from(node.as_ref()))
    }
}

const INITIAL_SYNC_TIMEOUT: Duration = Duration::from_secs(30);
const POLL_JITTER_MILLIS: i64 = 500;

pub(crate) struct DriverState {
    pub(crate) ready: bool,
}

pub type SharedDriverState = Arc<Mutex<DriverState>>;

/// Runs the agent until a termination signal arrives: the reconcile loop
/// (watch or polling, per `policy.bypass_problem_detector`) and the HTTP
/// server both stop before this returns.
pub async fn run(
    client: Client,
    reconciler: Reconciler,
    policy: NodePolicy,
    config_path: Option<std::path::PathBuf>,
    http_addr: SocketAddr,
    cancel: CancellationToken,
) -> Result<()> {
    crate::metrics::init();

    let reconciler = Arc::new(reconciler);
    let node_name = policy.node_name.clone();
    let policy = Arc::new(Mutex::new(policy));
    let driver_state: SharedDriverState = Arc::new(Mutex::new(DriverState { ready: false }));

    let config_watcher = match config_path {
        Some(path) => match ConfigWatcher::new(&path) {
            Ok(w) => Some(w),
            Err(e) => {
                warn!(error = %e, "config_watch_unavailable_continuing_with_static_policy");
                None
            }
        },
        None => None,
    };

    let bypass = policy.lock().await.bypass_problem_detector;

    let reconcile_handle = {
        let reconciler = reconciler.clone();
        let policy = policy.clone();
        let driver_state = driver_state.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if bypass {
                polling_loop(reconciler, policy, config_watcher, node_name, driver_state, cancel).await
            } else {
                watch_loop(client, reconciler, policy, config_watcher, node_name, driver_state, cancel).await
            }
        })
    };

    let http_handle = {
        let driver_state = driver_state.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { serve_http(http_addr, driver_state, cancel).await })
    };

    signal::ctrl_c().await.context("failed to listen for ctrl_c")?;
    info!("shutdown_signal_received");
    cancel.cancel();

    let _ = reconcile_handle.await;
    let _ = http_handle.await?;

    info!("driver_stopped");
    Ok(())
}

async fn maybe_reload(
    config_watcher: &Option<ConfigWatcher>,
    policy: &Arc<Mutex<NodePolicy>>,
    node_name: &str,
) {
    let Some(watcher) = config_watcher else {
        return;
    };
    if let Some(new_policy) = watcher.poll_reload(node_name) {
        info!("policy_reloaded");
        *policy.lock().await = new_policy;
    }
}

async fn watch_loop(
    client: Client,
    reconciler: Arc<Reconciler>,
    policy: Arc<Mutex<NodePolicy>>,
    config_watcher: Option<ConfigWatcher>,
    node_name: String,
    driver_state: SharedDriverState,
    cancel: CancellationToken,
) {
    let nodes: Api<Node> = Api::all(client);
    let watch_config = Config::default().fields(format!("metadata.name={node_name}"));
    let (reader, writer) = reflector::store::<Node>();
    let mut stream = reflector::reflector(writer, watcher::watcher(nodes, watch_config)).boxed();
    let cache: Arc<dyn NodeCache> = Arc::new(ReflectorNodeCache { store: reader });

    match tokio::time::timeout(INITIAL_SYNC_TIMEOUT, stream.next()).await {
        Ok(Some(Ok(_))) => {
            info!("initial_watch_sync_completed");
        }
        Ok(Some(Err(e))) => {
            warn!(error = %e, "initial_watch_sync_error_continuing");
        }
        Ok(None) => {
            warn!("watch_stream_ended_during_initial_sync");
        }
        Err(_) => {
            warn!(timeout_secs = INITIAL_SYNC_TIMEOUT.as_secs(), "initial_watch_sync_timed_out_continuing");
        }
    }
    driver_state.lock().await.ready = true;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("watch_loop_shutting_down");
                return;
            }
            event = stream.next() => {
                match event {
                    Some(Ok(Event::Applied(_) | Event::Restarted(_))) => {
                        maybe_reload(&config_watcher, &policy, &node_name).await;
                        let snapshot = policy.lock().await.clone();
                        run_pass(&reconciler, &snapshot, PassMode::Watch, Some(cache.as_ref())).await;
                    }
                    Some(Ok(Event::Deleted(_))) => {
                        info!("owned_node_deleted");
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "watch_stream_error");
                    }
                    None => {
                        warn!("watch_stream_ended_restarting_not_supported_shutting_down");
                        return;
                    }
                }
            }
        }
    }
}

async fn polling_loop(
    reconciler: Arc<Reconciler>,
    policy: Arc<Mutex<NodePolicy>>,
    config_watcher: Option<ConfigWatcher>,
    node_name: String,
    driver_state: SharedDriverState,
    cancel: CancellationToken,
) {
    driver_state.lock().await.ready = true;

    loop {
        maybe_reload(&config_watcher, &policy, &node_name).await;
        let snapshot = policy.lock().await.clone();
        run_pass(&reconciler, &snapshot, PassMode::Polling, None).await;

        let base = Duration::from_secs(snapshot.optional_conditions.polling_interval_secs());
        let jitter_millis = rand::thread_rng().gen_range(-POLL_JITTER_MILLIS..=POLL_JITTER_MILLIS);
        let interval = base.as_millis() as i64 + jitter_millis;
        let interval = Duration::from_millis(interval.max(0) as u64);

        tokio::select! {
            _ = cancel.cancelled() => {
                info!("polling_loop_shutting_down");
                return;
            }
            _ = tokio::time::sleep(interval) => {}
        }
    }
}

async fn run_pass(reconciler: &Reconciler, policy: &NodePolicy, mode: PassMode, cache: Option<&dyn NodeCache>) {
    match reconciler.reconcile_pass(policy, mode, cache).await {
        Ok(_) => {}
        Err(e) => warn!(error = %e, "reconcile_pass_failed"),
    }
}

pub(crate) fn build_router(state: SharedDriverState) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/healthz", get(|| async { (StatusCode::OK, "OK") }))
        .route(
            "/readyz",
            get({
                let state = state.clone();
                move || ready_handler(state.clone())
            }),
        )
}

async fn serve_http(addr: SocketAddr, state: SharedDriverState, cancel: CancellationToken) -> Result<()> {
    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind HTTP server on {addr}"))?;

    info!(%addr, "http_server_started");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            cancel.cancelled().await;
        })
        .await?;

    Ok(())
}

async fn ready_handler(state: SharedDriverState) -> impl IntoResponse {
    let state = state.lock().await;
    if state.ready {
        (StatusCode::OK, "READY")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "NOT READY")
    }
}

async fn metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = crate::metrics::REGISTRY.gather();
    let mut buffer = Vec::new();

    match encoder.encode(&metric_families, &mut buffer) {
        Ok(_) => match String::from_utf8(buffer) {
            Ok(body) => (StatusCode::OK, body),
            Err(_) => (StatusCode::INTERNAL_SERVER_ERROR, "metrics encoding error".to_string()),
        },
        Err(_) => (StatusCode::INTERNAL_SERVER_ERROR, "metrics encoding error".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn test_state(ready: bool) -> SharedDriverState {
        Arc::new(Mutex::new(DriverState { ready }))
    }

    #[tokio::test]
    async fn healthz_returns_ok() {
        let app = build_router(test_state(false));
        let req = Request::builder().uri("/healthz").body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn readyz_reflects_state() {
        let app = build_router(test_state(false));
        let req = Request::builder().uri("/readyz").body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);

        let app = build_router(test_state(true));
        let req = Request::builder().uri("/readyz").body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"READY");
    }

    #[tokio::test]
    async fn metrics_endpoint_serves_prometheus_text() {
        crate::metrics::init();
        let app = build_router(test_state(true));
        let req = Request::builder().uri("/metrics").body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        assert!(String::from_utf8_lossy(&body).contains("mechanic_reconcile_total"));
    }
}
