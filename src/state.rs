//! Per-agent mutable state, guarded by a non-blocking mutex.
//!
//! `AgentState` is shared between the driver's trigger source (a watch
//! callback or a timer tick) and the reconciler. The entry guard in
//! [`crate::reconciler`] uses [`tokio::sync::Mutex::try_lock`] rather than
//! an awaiting acquire: on contention, the triggering event is dropped
//! instead of queued (spec.md §9 — deliberate back-pressure, not a
//! fairness policy).

use std::sync::Arc;

use tokio::sync::Mutex;

/// Mutable per-agent record. Recomputed every reconcile pass; only
/// `is_cordoned` and the ownership label persist meaning across passes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AgentState {
    pub has_drainable_condition: bool,
    pub condition_is_scheduled_event: bool,
    pub is_cordoned: bool,
    pub is_drained: bool,
    pub should_drain: bool,
}

impl AgentState {
    /// Seed state at startup from the node's current unschedulable flag,
    /// per spec.md §3 ("AgentState ... seeded from the current node
    /// object's unschedulable flag").
    pub fn seeded(unschedulable: bool) -> Self {
        Self {
            is_cordoned: unschedulable,
            ..Default::default()
        }
    }
}

pub type SharedState = Arc<Mutex<AgentState>>;

pub fn new_shared(initial: AgentState) -> SharedState {
    Arc::new(Mutex::new(initial))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seeded_state_mirrors_unschedulable_flag() {
        assert!(AgentState::seeded(true).is_cordoned);
        assert!(!AgentState::seeded(false).is_cordoned);
    }

    #[test]
    fn default_state_has_no_drain_decision() {
        let s = AgentState::default();
        assert!(!s.should_drain);
        assert!(!s.is_drained);
    }
}
