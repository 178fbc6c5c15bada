use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use kube::Client;
use tokio_util::sync::CancellationToken;
use tracing::info;

use node_mechanic::actuator::{KubeNodeActuator, NodeActuator};
use node_mechanic::config::NodePolicy;
use node_mechanic::driver;
use node_mechanic::events::KubeEventRecorder;
use node_mechanic::identity::NodeIdentity;
use node_mechanic::metadata::HttpMetadataProbe;
use node_mechanic::reconciler::Reconciler;
use node_mechanic::state::{new_shared, AgentState};

pub async fn run(config: Option<PathBuf>, http_addr: SocketAddr) -> anyhow::Result<()> {
    let policy = NodePolicy::load(config.as_deref()).context("failed to load policy")?;
    info!(node = %policy.node_name, "starting_node_mechanic");

    let identity = NodeIdentity::derive(&policy.node_name).context("failed to derive node identity")?;

    let client = Client::try_default().await.context("failed to build Kubernetes client")?;
    let cancel = CancellationToken::new();

    let actuator = Arc::new(KubeNodeActuator::new(client.clone(), identity.node_name.clone(), cancel.clone()));
    let seed = actuator.snapshot().await.context("failed initial node snapshot")?;

    let probe = Arc::new(HttpMetadataProbe::new(cancel.clone()).context("failed to build metadata probe")?);
    let events = Arc::new(KubeEventRecorder::new(client.clone(), &identity.node_name));
    let state = new_shared(AgentState::seeded(seed.unschedulable));

    let reconciler = Reconciler::new(identity, actuator, probe, events, state);

    driver::run(client, reconciler, policy, config, http_addr, cancel).await
}
