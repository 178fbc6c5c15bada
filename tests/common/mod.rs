use std::sync::Arc;

use node_mechanic::actuator::{fake::FakeNodeActuator, NodeSnapshot};
use node_mechanic::evaluator::NodeCondition;
use node_mechanic::events::fake::FakeEventRecorder;
use node_mechanic::identity::NodeIdentity;
use node_mechanic::metadata::fake::FakeProbe;
use node_mechanic::metadata::{EventKind, EventSource, EventStatus, ScheduledEvent};
use node_mechanic::reconciler::Reconciler;
use node_mechanic::state::{new_shared, AgentState};

pub const TEST_NODE: &str = "test-vmss000001";
pub const TEST_INSTANCE: &str = "test-vmss_1";

pub fn scheduled_event(kind: EventKind, resources: &[&str], description: &str) -> ScheduledEvent {
    ScheduledEvent {
        event_id: "evt".to_string(),
        kind,
        resource_type: "VirtualMachine".to_string(),
        resources: resources.iter().map(|s| s.to_string()).collect(),
        status: EventStatus::Scheduled,
        not_before: None,
        description: description.to_string(),
        source: EventSource::Platform,
        duration_secs: None,
    }
}

pub fn node_snapshot(unschedulable: bool, owned: bool, conditions: Vec<NodeCondition>) -> NodeSnapshot {
    NodeSnapshot {
        name: TEST_NODE.to_string(),
        unschedulable,
        owned,
        conditions,
    }
}

pub fn harness(
    snapshot: NodeSnapshot,
    probe_events: Vec<ScheduledEvent>,
) -> (Reconciler, Arc<FakeNodeActuator>, Arc<FakeEventRecorder>, Arc<FakeProbe>) {
    let actuator = Arc::new(FakeNodeActuator::with_snapshot(snapshot));
    let probe = Arc::new(FakeProbe::with_events(probe_events));
    let events = Arc::new(FakeEventRecorder::default());
    let state = new_shared(AgentState::default());
    let identity = NodeIdentity::derive(TEST_NODE).expect("fixed test node name derives cleanly");
    let reconciler = Reconciler::new(identity, actuator.clone(), probe.clone(), events.clone(), state);
    (reconciler, actuator, events, probe)
}
