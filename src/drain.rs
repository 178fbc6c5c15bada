//! Drain helper: evicts pods from a cordoned node.
//!
//! This is the "external drain helper" spec.md treats as a collaborator —
//! the actuator only invokes it and interprets a terminal result. Kept as
//! its own bounded module rather than folded into the actuator, since pod
//! eviction (PDB-respecting, daemonset-aware) is a distinct concern with
//! its own failure modes.

use std::collections::HashSet;

use futures::{stream, StreamExt};
use k8s_openapi::api::core::v1::Pod;
use kube::api::{EvictParams, ListParams};
use kube::{Api, Client, ResourceExt};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Pods are evicted five at a time; waiting for PDB admission is included
/// in this limit so we don't hammer the API server.
const CONCURRENT_EVICTIONS: usize = 5;

#[derive(Debug, Error)]
pub enum DrainError {
    #[error("failed to list pods on node {node_name}: {source}")]
    ListPods {
        node_name: String,
        #[source]
        source: kube::Error,
    },
    #[error("drain failed for node {node_name}: {reason}")]
    Failed { node_name: String, reason: String },
    #[error("drain of node {node_name} cancelled")]
    Cancelled { node_name: String },
}

/// Evicts every evictable pod on `node_name`. Force-evicts unmanaged
/// pods, includes pods with emptyDir volumes, ignores DaemonSet-owned and
/// static mirror pods, and applies no grace-period override. A pod whose
/// individual eviction fails is logged and counted; if any target pod was
/// not evicted, returns `DrainError::Failed` so the actuator/reconciler
/// treat the drain as incomplete and retry on the next pass (spec.md
/// §4.4/§7 — a drain failure is reported, not swallowed).
pub async fn drain_node(client: &Client, node_name: &str, cancel: &CancellationToken) -> Result<(), DrainError> {
    if cancel.is_cancelled() {
        return Err(DrainError::Cancelled {
            node_name: node_name.to_string(),
        });
    }

    let targets = find_target_pods(client, node_name).await?;
    let total = targets.len();

    let evictions = stream::iter(targets)
        .map(|pod| {
            let client = client.clone();
            async move {
                match evict_pod(&client, &pod).await {
                    Ok(()) => None,
                    Err(e) => {
                        warn!(pod = %pod.name_any(), error = %e, "pod_eviction_failed");
                        Some(pod.name_any())
                    }
                }
            }
        })
        .buffer_unordered(CONCURRENT_EVICTIONS)
        .filter_map(|failed| async move { failed })
        .collect::<Vec<String>>();

    let failed = tokio::select! {
        failed = evictions => failed,
        _ = cancel.cancelled() => {
            return Err(DrainError::Cancelled { node_name: node_name.to_string() });
        }
    };

    if !failed.is_empty() {
        return Err(DrainError::Failed {
            node_name: node_name.to_string(),
            reason: format!("{}/{total} pods failed to evict: {}", failed.len(), failed.join(", ")),
        });
    }

    Ok(())
}

async fn find_target_pods(client: &Client, node_name: &str) -> Result<Vec<Pod>, DrainError> {
    let pods: Api<Pod> = Api::all(client.clone());
    let list = pods
        .list(&ListParams {
            field_selector: Some(format!("spec.nodeName={node_name}")),
            ..Default::default()
        })
        .await
        .map_err(|source| DrainError::ListPods {
            node_name: node_name.to_string(),
            source,
        })?;

    Ok(filter_drainable(list.items))
}

fn filter_drainable(pods: Vec<Pod>) -> Vec<Pod> {
    pods.into_iter()
        .filter(|pod| {
            if is_daemonset_owned(pod) {
                debug!(pod = %pod.name_any(), "skipping_daemonset_pod");
                return false;
            }
            if is_mirror_pod(pod) {
                debug!(pod = %pod.name_any(), "skipping_mirror_pod");
                return false;
            }
            true
        })
        .collect()
}

fn is_daemonset_owned(pod: &Pod) -> bool {
    pod.metadata
        .owner_references
        .as_ref()
        .is_some_and(|refs| refs.iter().any(|r| r.controller == Some(true) && r.kind == "DaemonSet"))
}

fn is_mirror_pod(pod: &Pod) -> bool {
    pod.metadata
        .annotations
        .as_ref()
        .is_some_and(|a| a.contains_key("kubernetes.io/config.mirror"))
}

async fn evict_pod(client: &Client, pod: &Pod) -> Result<(), kube::Error> {
    let ns = pod.metadata.namespace.clone();
    let api: Api<Pod> = match ns {
        Some(ref ns) => Api::namespaced(client.clone(), ns),
        None => Api::default_namespaced(client.clone()),
    };

    api.evict(&pod.name_any(), &EvictParams::default()).await?;
    info!(pod = %pod.name_any(), "pod_evicted");
    Ok(())
}

/// Exposed for tests that want to exercise the filtering rules without a
/// cluster connection.
#[allow(dead_code)]
pub(crate) fn drainable_names(pods: Vec<Pod>) -> HashSet<String> {
    filter_drainable(pods).into_iter().map(|p| p.name_any()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
    use kube::api::ObjectMeta;
    use std::collections::BTreeMap;

    fn pod(name: &str) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("default".to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn daemonset_owned_pods_are_skipped() {
        let mut p = pod("ds-pod");
        p.metadata.owner_references = Some(vec![OwnerReference {
            controller: Some(true),
            kind: "DaemonSet".to_string(),
            name: "my-ds".to_string(),
            api_version: "apps/v1".to_string(),
            uid: "1".to_string(),
            ..Default::default()
        }]);
        let names = drainable_names(vec![p]);
        assert!(names.is_empty());
    }

    #[test]
    fn mirror_pods_are_skipped() {
        let mut p = pod("mirror-pod");
        let mut annotations = BTreeMap::new();
        annotations.insert("kubernetes.io/config.mirror".to_string(), "hash".to_string());
        p.metadata.annotations = Some(annotations);
        let names = drainable_names(vec![p]);
        assert!(names.is_empty());
    }

    #[test]
    fn ordinary_pods_are_drainable() {
        let p = pod("app-pod");
        let names = drainable_names(vec![p]);
        assert_eq!(names, HashSet::from(["app-pod".to_string()]));
    }

    #[test]
    fn replicaset_owned_pods_are_drainable() {
        let mut p = pod("rs-pod");
        p.metadata.owner_references = Some(vec![OwnerReference {
            controller: Some(true),
            kind: "ReplicaSet".to_string(),
            name: "my-rs".to_string(),
            api_version: "apps/v1".to_string(),
            uid: "1".to_string(),
            ..Default::default()
        }]);
        let names = drainable_names(vec![p]);
        assert_eq!(names, HashSet::from(["rs-pod".to_string()]));
    }
}
