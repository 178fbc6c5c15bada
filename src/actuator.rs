//! Node actuator: cordon, uncordon, and drain against the cluster API.
//!
//! Each operation is idempotent with respect to observable node state.
//! Cordon/uncordon retries on write conflict; drain delegates to
//! [`crate::drain`] and is not itself retried — the reconciler re-enters
//! the state machine on the next pass if a drain fails.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use k8s_openapi::api::core::v1::Node;
use kube::api::{Patch, PatchParams};
use kube::{Api, Client, ResourceExt};
use serde_json::json;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::evaluator::{ConditionStatus, NodeCondition};

/// The sole durable marker that this tool performed a cordon.
pub const OWNERSHIP_LABEL: &str = "mechanic.cordoned";
const FIELD_MANAGER: &str = "node-mechanic";
const MAX_CONFLICT_RETRIES: u32 = 5;

#[derive(Debug, Error)]
pub enum ActuatorError {
    #[error("failed to fetch node {name}: {source}")]
    Fetch {
        name: String,
        #[source]
        source: kube::Error,
    },
    #[error("failed to cordon node {name} after retrying on conflict: {reason}")]
    CordonFailed { name: String, reason: String },
    #[error("failed to uncordon node {name} after retrying on conflict: {reason}")]
    UncordonFailed { name: String, reason: String },
    #[error("cordon of node {name} did not verify: unschedulable={unschedulable}, owned={owned}")]
    VerifyFailed {
        name: String,
        unschedulable: bool,
        owned: bool,
    },
    #[error("drain failed: {0}")]
    DrainFailed(#[from] crate::drain::DrainError),
    #[error("operation on node {name} cancelled")]
    Cancelled { name: String },
}

/// A read-through cache over the node object's observable state. In watch
/// mode the driver keeps this populated from its local reflector store so
/// P1 reads the cluster API cache rather than issuing a live GET on every
/// pass (spec.md §4.5 P1: "cluster API cache (watch mode) or live (polling
/// mode)"). Polling mode has no cache and always falls through to a live
/// [`NodeActuator::snapshot`] read.
pub trait NodeCache: Send + Sync {
    fn get(&self) -> Option<NodeSnapshot>;
}

/// A read of the owned node's observable state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeSnapshot {
    pub name: String,
    pub unschedulable: bool,
    pub owned: bool,
    pub conditions: Vec<NodeCondition>,
}

pub(crate) fn snapshot_from(node: &Node) -> NodeSnapshot {
    let unschedulable = node.spec.as_ref().and_then(|s| s.unschedulable).unwrap_or(false);
    let owned = node
        .metadata
        .labels
        .as_ref()
        .and_then(|l| l.get(OWNERSHIP_LABEL))
        .map(|v| v == "true")
        .unwrap_or(false);
    let conditions = node
        .status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .map(|conds| {
            conds
                .iter()
                .map(|c| NodeCondition::new(c.type_.clone(), ConditionStatus::from(c.status.as_str())))
                .collect()
        })
        .unwrap_or_default();

    NodeSnapshot {
        name: node.name_any(),
        unschedulable,
        owned,
        conditions,
    }
}

fn is_conflict(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(e) if e.code == 409)
}

async fn retry_on_conflict<F, Fut, T>(mut op: F) -> Result<T, kube::Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, kube::Error>>,
{
    let mut backoff = ExponentialBackoff {
        initial_interval: Duration::from_millis(200),
        max_interval: Duration::from_secs(5),
        ..ExponentialBackoff::default()
    };
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if is_conflict(&e) && attempt < MAX_CONFLICT_RETRIES => {
                let delay = backoff.next_backoff().unwrap_or(Duration::from_secs(1));
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Injected collaborator: cordon, uncordon, drain, and a node snapshot
/// read. Modeled as a trait so the reconciler can be exercised against a
/// fake implementation without a live cluster.
#[async_trait]
pub trait NodeActuator: Send + Sync {
    async fn snapshot(&self) -> Result<NodeSnapshot, ActuatorError>;
    /// Returns `cordoned=true` on success, whether or not a cluster write
    /// was needed.
    async fn cordon(&self) -> Result<bool, ActuatorError>;
    async fn uncordon(&self) -> Result<(), ActuatorError>;
    async fn drain(&self) -> Result<bool, ActuatorError>;
}

pub struct KubeNodeActuator {
    client: Client,
    node_name: String,
    cancel: CancellationToken,
}

impl KubeNodeActuator {
    pub fn new(client: Client, node_name: impl Into<String>, cancel: CancellationToken) -> Self {
        Self {
            client,
            node_name: node_name.into(),
            cancel,
        }
    }

    fn api(&self) -> Api<Node> {
        Api::all(self.client.clone())
    }

    fn cancelled(&self) -> ActuatorError {
        ActuatorError::Cancelled {
            name: self.node_name.clone(),
        }
    }
}

#[async_trait]
impl NodeActuator for KubeNodeActuator {
    async fn snapshot(&self) -> Result<NodeSnapshot, ActuatorError> {
        if self.cancel.is_cancelled() {
            return Err(self.cancelled());
        }
        let node = tokio::select! {
            res = self.api().get(&self.node_name) => res.map_err(|source| ActuatorError::Fetch {
                name: self.node_name.clone(),
                source,
            })?,
            _ = self.cancel.cancelled() => return Err(self.cancelled()),
        };
        Ok(snapshot_from(&node))
    }

    async fn cordon(&self) -> Result<bool, ActuatorError> {
        let current = self.snapshot().await?;

        if current.unschedulable {
            if current.owned {
                info!(node = %self.node_name, "cordon_already_owned");
            } else {
                warn!(node = %self.node_name, "node_already_cordoned_by_other_owner");
            }
            return Ok(true);
        }

        let api = self.api();
        let name = self.node_name.clone();
        let patch = json!({
            "spec": { "unschedulable": true },
            "metadata": { "labels": { OWNERSHIP_LABEL: "true" } }
        });
        let retry = retry_on_conflict(|| {
            let api = api.clone();
            let name = name.clone();
            let patch = patch.clone();
            async move {
                api.patch(&name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
                    .await
                    .map(|_| ())
            }
        });
        tokio::select! {
            res = retry => res.map_err(|source| ActuatorError::CordonFailed {
                name: self.node_name.clone(),
                reason: source.to_string(),
            })?,
            _ = self.cancel.cancelled() => return Err(self.cancelled()),
        };

        let verify = self.snapshot().await?;
        if !verify.unschedulable || !verify.owned {
            return Err(ActuatorError::VerifyFailed {
                name: self.node_name.clone(),
                unschedulable: verify.unschedulable,
                owned: verify.owned,
            });
        }

        info!(node = %self.node_name, "node_cordoned");
        Ok(true)
    }

    async fn uncordon(&self) -> Result<(), ActuatorError> {
        let api = self.api();
        let name = self.node_name.clone();
        let patch = json!({
            "spec": { "unschedulable": false },
            "metadata": { "labels": { OWNERSHIP_LABEL: serde_json::Value::Null } }
        });
        let retry = retry_on_conflict(|| {
            let api = api.clone();
            let name = name.clone();
            let patch = patch.clone();
            async move {
                api.patch(&name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
                    .await
                    .map(|_| ())
            }
        });
        tokio::select! {
            res = retry => res.map_err(|source| ActuatorError::UncordonFailed {
                name: self.node_name.clone(),
                reason: source.to_string(),
            })?,
            _ = self.cancel.cancelled() => return Err(self.cancelled()),
        };

        info!(node = %self.node_name, "node_uncordoned");
        Ok(())
    }

    async fn drain(&self) -> Result<bool, ActuatorError> {
        crate::drain::drain_node(&self.client, &self.node_name, &self.cancel).await?;
        Ok(true)
    }
}

#[cfg(any(test, feature = "test-util"))]
pub mod fake {
    use super::*;
    use std::sync::Mutex;

    /// In-memory double for the reconciler's unit tests. Tracks write
    /// counts so tests can assert idempotence (Testable Property 8).
    pub struct FakeNodeActuator {
        pub state: Mutex<NodeSnapshot>,
        pub cordon_writes: Mutex<u32>,
        pub drain_calls: Mutex<u32>,
        pub fail_cordon: bool,
        pub fail_drain: bool,
    }

    impl FakeNodeActuator {
        pub fn new(name: impl Into<String>) -> Self {
            Self {
                state: Mutex::new(NodeSnapshot {
                    name: name.into(),
                    unschedulable: false,
                    owned: false,
                    conditions: vec![],
                }),
                cordon_writes: Mutex::new(0),
                drain_calls: Mutex::new(0),
                fail_cordon: false,
                fail_drain: false,
            }
        }

        pub fn with_snapshot(snapshot: NodeSnapshot) -> Self {
            Self {
                state: Mutex::new(snapshot),
                cordon_writes: Mutex::new(0),
                drain_calls: Mutex::new(0),
                fail_cordon: false,
                fail_drain: false,
            }
        }

        /// Synchronous snapshot read for test assertions.
        pub fn snapshot_for_test(&self) -> NodeSnapshot {
            self.state.lock().unwrap().clone()
        }

        pub fn drain_call_count(&self) -> u32 {
            *self.drain_calls.lock().unwrap()
        }
    }

    #[async_trait]
    impl NodeActuator for FakeNodeActuator {
        async fn snapshot(&self) -> Result<NodeSnapshot, ActuatorError> {
            Ok(self.state.lock().unwrap().clone())
        }

        async fn cordon(&self) -> Result<bool, ActuatorError> {
            if self.fail_cordon {
                return Err(ActuatorError::CordonFailed {
                    name: self.state.lock().unwrap().name.clone(),
                    reason: "simulated cordon failure".to_string(),
                });
            }
            let mut state = self.state.lock().unwrap();
            if !state.unschedulable {
                state.unschedulable = true;
                state.owned = true;
                *self.cordon_writes.lock().unwrap() += 1;
            }
            Ok(true)
        }

        async fn uncordon(&self) -> Result<(), ActuatorError> {
            let mut state = self.state.lock().unwrap();
            state.unschedulable = false;
            state.owned = false;
            Ok(())
        }

        async fn drain(&self) -> Result<bool, ActuatorError> {
            *self.drain_calls.lock().unwrap() += 1;
            if self.fail_drain {
                return Err(ActuatorError::DrainFailed(crate::drain::DrainError::Failed {
                    node_name: self.state.lock().unwrap().name.clone(),
                    reason: "simulated drain failure".to_string(),
                }));
            }
            Ok(true)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fake::FakeNodeActuator;
    use super::*;

    #[tokio::test]
    async fn two_consecutive_cordons_write_once() {
        let actuator = FakeNodeActuator::new("test-vmss000001");
        assert!(actuator.cordon().await.unwrap());
        assert!(actuator.cordon().await.unwrap());
        assert_eq!(*actuator.cordon_writes.lock().unwrap(), 1);
        let snap = actuator.snapshot().await.unwrap();
        assert!(snap.unschedulable);
        assert!(snap.owned);
    }

    #[tokio::test]
    async fn uncordon_then_cordon_restores_ownership() {
        let actuator = FakeNodeActuator::new("test-vmss000001");
        actuator.cordon().await.unwrap();
        actuator.uncordon().await.unwrap();
        let mid = actuator.snapshot().await.unwrap();
        assert!(!mid.unschedulable);
        assert!(!mid.owned);

        actuator.cordon().await.unwrap();
        let after = actuator.snapshot().await.unwrap();
        assert!(after.unschedulable);
        assert!(after.owned);
    }
}
