//! Policy resolver: decides whether a set of scheduled platform events
//! justifies draining this node.

use crate::config::NodePolicy;
use crate::metadata::{EventKind, ScheduledEvent};

/// The literal substring that distinguishes a memory-preserving live
/// migration from a regular freeze. Centralized here per the design note
/// in spec.md §9 — a single hook for a future, richer signal.
pub const LIVE_MIGRATION_PHRASE: &str = "memory-preserving Live Migration";

fn matches_node(event: &ScheduledEvent, instance_name: &str) -> bool {
    event.is_virtual_machine() && event.targets_instance(instance_name)
}

fn is_live_migration_event(event: &ScheduledEvent) -> bool {
    event.kind == EventKind::Freeze && event.description.contains(LIVE_MIGRATION_PHRASE)
}

/// Determine whether any event in `events` justifies draining under
/// `policy`, for the node identified by `instance_name`. The first
/// matching event that decides "drain" short-circuits the scan.
pub fn resolve_drain(events: &[ScheduledEvent], policy: &NodePolicy, instance_name: &str) -> bool {
    let se = &policy.scheduled_events;
    for event in events {
        if !matches_node(event, instance_name) {
            continue;
        }

        let drain = match event.kind {
            EventKind::Reboot => se.reboot,
            EventKind::Redeploy => se.redeploy,
            EventKind::Preempt => se.preempt,
            EventKind::Terminate => se.terminate,
            EventKind::Freeze if is_live_migration_event(event) => se.live_migration,
            EventKind::Freeze => se.freeze,
            EventKind::Unknown(_) => false,
        };

        if drain {
            return true;
        }
    }
    false
}

/// Used on the scheduled-event fast path to disambiguate freeze vs. live
/// migration when a node condition has already signalled a drainable
/// event. Returns true iff a matching freeze event's description
/// identifies it as a live migration *and* policy enables draining on
/// live migration.
pub fn is_live_migration(events: &[ScheduledEvent], policy: &NodePolicy, instance_name: &str) -> bool {
    events
        .iter()
        .any(|e| matches_node(e, instance_name) && is_live_migration_event(e) && policy.scheduled_events.live_migration)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{EventSource, EventStatus};

    fn event(kind: EventKind, resources: &[&str], description: &str) -> ScheduledEvent {
        ScheduledEvent {
            event_id: "evt-1".to_string(),
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

    fn policy(f: impl FnOnce(&mut NodePolicy)) -> NodePolicy {
        let mut p = NodePolicy::default();
        f(&mut p);
        p
    }

    #[test]
    fn empty_event_list_does_not_drain() {
        let p = NodePolicy::default();
        assert!(!resolve_drain(&[], &p, "test-vmss_1"));
    }

    #[test]
    fn non_vm_resource_type_is_ignored() {
        let mut e = event(EventKind::Reboot, &["test-vmss_1"], "");
        e.resource_type = "Disk".to_string();
        let p = policy(|p| p.scheduled_events.reboot = true);
        assert!(!resolve_drain(&[e], &p, "test-vmss_1"));
    }

    #[test]
    fn s1_live_migration_drains_when_live_migration_enabled() {
        let e = event(
            EventKind::Freeze,
            &["test-vmss_1"],
            "Virtual machine is being paused because of a memory-preserving Live Migration operation.",
        );
        let p = policy(|p| {
            p.scheduled_events.freeze = false;
            p.scheduled_events.live_migration = true;
        });
        assert!(resolve_drain(&[e.clone()], &p, "test-vmss_1"));
        assert!(is_live_migration(&[e], &p, "test-vmss_1"));
    }

    #[test]
    fn s2_regular_freeze_does_not_drain_when_disabled() {
        let e = event(EventKind::Freeze, &["test-vmss_1"], "freeze maintenance");
        let p = policy(|p| {
            p.scheduled_events.freeze = false;
            p.scheduled_events.live_migration = true;
        });
        assert!(!resolve_drain(&[e], &p, "test-vmss_1"));
    }

    #[test]
    fn s3_regular_freeze_drains_when_enabled() {
        let e = event(EventKind::Freeze, &["test-vmss_1"], "freeze maintenance");
        let p = policy(|p| {
            p.scheduled_events.freeze = true;
            p.scheduled_events.live_migration = false;
        });
        assert!(resolve_drain(&[e], &p, "test-vmss_1"));
    }

    #[test]
    fn s4_event_for_different_instance_does_not_drain() {
        let e = event(EventKind::Reboot, &["test-vmss_4"], "");
        let p = policy(|p| p.scheduled_events.reboot = true);
        assert!(!resolve_drain(&[e], &p, "test-vmss_1"));
    }

    #[test]
    fn substring_match_tolerates_platform_prefixing() {
        let e = event(EventKind::Reboot, &["prefix-test-vmss_1-suffix"], "");
        let p = policy(|p| p.scheduled_events.reboot = true);
        assert!(resolve_drain(&[e], &p, "test-vmss_1"));
    }

    #[test]
    fn unknown_event_kind_never_drains() {
        let e = event(EventKind::Unknown("SomeNewKind".to_string()), &["test-vmss_1"], "");
        let p = policy(|p| {
            p.scheduled_events.reboot = true;
            p.scheduled_events.redeploy = true;
            p.scheduled_events.preempt = true;
            p.scheduled_events.terminate = true;
            p.scheduled_events.freeze = true;
            p.scheduled_events.live_migration = true;
        });
        assert!(!resolve_drain(&[e], &p, "test-vmss_1"));
    }

    #[test]
    fn first_matching_event_short_circuits() {
        let events = vec![
            event(EventKind::Reboot, &["test-vmss_1"], ""),
            event(EventKind::Terminate, &["test-vmss_1"], ""),
        ];
        let p = policy(|p| {
            p.scheduled_events.reboot = true;
            p.scheduled_events.terminate = false;
        });
        assert!(resolve_drain(&events, &p, "test-vmss_1"));
    }

    #[test]
    fn is_live_migration_false_without_matching_freeze() {
        let p = policy(|p| p.scheduled_events.live_migration = true);
        assert!(!is_live_migration(&[], &p, "test-vmss_1"));
    }

    #[test]
    fn is_live_migration_false_when_policy_disabled_even_if_text_matches() {
        let e = event(
            EventKind::Freeze,
            &["test-vmss_1"],
            "memory-preserving Live Migration in progress",
        );
        let p = policy(|p| p.scheduled_events.live_migration = false);
        assert!(!is_live_migration(&[e], &p, "test-vmss_1"));
    }
}
