//! The reconciler: the state machine that sequences the evaluator,
//! metadata probe, policy resolver, and node actuator under a per-agent
//! exclusion lock (spec.md §4.5).

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, warn};

use crate::actuator::{ActuatorError, NodeActuator, NodeCache};
use crate::config::NodePolicy;
use crate::evaluator::evaluate;
use crate::events::{EventRecorder, Severity};
use crate::identity::NodeIdentity;
use crate::metadata::{MetadataProbe, ProbeError};
use crate::metrics;
use crate::policy::{is_live_migration, resolve_drain};
use crate::state::SharedState;

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("failed to read node state: {0}")]
    Snapshot(#[from] ActuatorError),
    #[error("metadata probe failed: {0}")]
    Probe(#[from] ProbeError),
}

/// Outcome of one call to [`Reconciler::reconcile_pass`]. Distinguishes a
/// dropped trigger (entry-guard contention, not an error) from a
/// completed pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassOutcome {
    Skipped,
    Completed,
}

/// Selects which parts of the state machine a pass runs: watch-driven
/// passes evaluate node conditions (P2); polling passes skip straight to
/// probing and resolving, per spec.md §4.6.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassMode {
    Watch,
    Polling,
}

pub struct Reconciler {
    identity: NodeIdentity,
    actuator: Arc<dyn NodeActuator>,
    probe: Arc<dyn MetadataProbe>,
    events: Arc<dyn EventRecorder>,
    state: SharedState,
}

impl Reconciler {
    pub fn new(
        identity: NodeIdentity,
        actuator: Arc<dyn NodeActuator>,
        probe: Arc<dyn MetadataProbe>,
        events: Arc<dyn EventRecorder>,
        state: SharedState,
    ) -> Self {
        Self {
            identity,
            actuator,
            probe,
            events,
            state,
        }
    }

    /// One reconcile pass, corresponding to one external trigger. Never
    /// returns an error for cordon/drain/uncordon failures — those are
    /// reported to the event recorder and logged; only a failed node
    /// snapshot read or a fatal probe error abort the pass early.
    pub async fn reconcile_pass(
        &self,
        policy: &NodePolicy,
        mode: PassMode,
        cache: Option<&dyn NodeCache>,
    ) -> Result<PassOutcome, ReconcileError> {
        let Ok(mut guard) = self.state.try_lock() else {
            debug!(node = %self.identity.node_name, "reconcile_pass_skipped_lock_contention");
            metrics::RECONCILE_SKIPPED.inc();
            return Ok(PassOutcome::Skipped);
        };

        metrics::RECONCILE_TOTAL.inc();
        let _timer = metrics::RECONCILE_DURATION.start_timer();

        match self.run_pass(&mut guard, policy, mode, cache).await {
            Ok(()) => Ok(PassOutcome::Completed),
            Err(e) => {
                metrics::RECONCILE_ERRORS.inc();
                warn!(node = %self.identity.node_name, error = %e, "reconcile_pass_aborted");
                Err(e)
            }
        }
    }

    async fn run_pass(
        &self,
        state: &mut crate::state::AgentState,
        policy: &NodePolicy,
        mode: PassMode,
        cache: Option<&dyn NodeCache>,
    ) -> Result<(), ReconcileError> {
        // P1 — snapshot: the cluster API cache in watch mode (when the
        // driver has one populated), a live read otherwise.
        let cached = if mode == PassMode::Watch { cache.and_then(|c| c.get()) } else { None };
        let snapshot = match cached {
            Some(snapshot) => snapshot,
            None => {
                if mode == PassMode::Watch && cache.is_some() {
                    debug!(node = %self.identity.node_name, "node_cache_miss_falling_back_to_live_read");
                }
                self.actuator.snapshot().await?
            }
        };
        state.is_cordoned = snapshot.unschedulable;
        metrics::CORDONED_GAUGE.set(i64::from(state.is_cordoned));

        // P2 — evaluate (watch mode only).
        if mode == PassMode::Watch {
            let (drainable, is_scheduled_event) = evaluate(&snapshot.conditions, policy);
            state.has_drainable_condition = drainable;
            state.condition_is_scheduled_event = is_scheduled_event;
        }

        // P3 — decide.
        match mode {
            PassMode::Watch => self.decide_watch(state, policy).await?,
            PassMode::Polling => self.decide_polling(state, policy).await?,
        }

        // P4 — act.
        self.act(state).await;

        // P5 — reconcile cordon ownership.
        let refreshed = self.actuator.snapshot().await?;
        self.reconcile_ownership(state, &refreshed).await;

        // P6 — exit: lock releases when `state`'s guard drops in the caller.
        Ok(())
    }

    async fn decide_watch(&self, state: &mut crate::state::AgentState, policy: &NodePolicy) -> Result<(), ReconcileError> {
        if !state.has_drainable_condition {
            state.should_drain = false;
            return Ok(());
        }

        if state.is_cordoned && state.is_drained {
            debug!(node = %self.identity.node_name, "already_cordoned_and_drained");
            state.should_drain = false;
            return Ok(());
        }

        state.should_drain = true;

        if state.condition_is_scheduled_event {
            let response = self.probe.probe().await?;
            let is_lm = is_live_migration(&response.events, policy, &self.identity.instance_name);
            if !is_lm && !policy.scheduled_events.freeze {
                state.should_drain = false;
            } else if is_lm && !policy.scheduled_events.live_migration {
                state.should_drain = false;
            }
        }
        // Optional host-health path (§8 property 5): no probe consultation.

        Ok(())
    }

    async fn decide_polling(&self, state: &mut crate::state::AgentState, policy: &NodePolicy) -> Result<(), ReconcileError> {
        let response = self.probe.probe().await?;
        let drain = resolve_drain(&response.events, policy, &self.identity.instance_name);
        state.has_drainable_condition = drain;
        state.condition_is_scheduled_event = true;
        state.should_drain = drain && !(state.is_cordoned && state.is_drained);
        Ok(())
    }

    async fn act(&self, state: &mut crate::state::AgentState) {
        if !state.should_drain {
            return;
        }

        if !state.is_cordoned {
            match self.actuator.cordon().await {
                Ok(true) | Ok(false) => {
                    state.is_cordoned = true;
                    metrics::CORDON_TOTAL.inc();
                    metrics::CORDONED_GAUGE.set(1);
                    self.events
                        .record(Severity::Normal, "CordonNode", format!("cordoned node {}", self.identity.node_name))
                        .await;
                }
                Err(e) => {
                    warn!(node = %self.identity.node_name, error = %e, "cordon_failed");
                    self.events
                        .record(
                            Severity::Warning,
                            "CordonNode",
                            format!("failed to cordon node {}: {e}", self.identity.node_name),
                        )
                        .await;
                    return; // stop phase: do not attempt drain this pass.
                }
            }
        }

        if !state.is_drained {
            match self.actuator.drain().await {
                Ok(_) => {
                    state.is_drained = true;
                    metrics::DRAIN_TOTAL.inc();
                    self.events
                        .record(Severity::Normal, "DrainNode", format!("drained node {}", self.identity.node_name))
                        .await;
                }
                Err(e) => {
                    warn!(node = %self.identity.node_name, error = %e, "drain_failed");
                    self.events
                        .record(
                            Severity::Warning,
                            "DrainNode",
                            format!("failed to drain node {}: {e}", self.identity.node_name),
                        )
                        .await;
                }
            }
        }
    }

    /// Applies the ownership truth table of spec.md §4.5 (P5).
    async fn reconcile_ownership(&self, state: &mut crate::state::AgentState, refreshed: &crate::actuator::NodeSnapshot) {
        let drainable = state.has_drainable_condition;
        let unschedulable = refreshed.unschedulable;
        let was_cordoned = state.is_cordoned;
        let owned = refreshed.owned;

        if drainable {
            match (unschedulable, was_cordoned) {
                (false, true) => {
                    // Event is imminent; state says we cordoned but the node
                    // isn't — re-cordon.
                    match self.actuator.cordon().await {
                        Ok(_) => {
                            state.is_cordoned = true;
                            metrics::CORDON_TOTAL.inc();
                            self.events
                                .record(Severity::Normal, "CordonNode", format!("re-cordoned node {}", self.identity.node_name))
                                .await;
                        }
                        Err(e) => {
                            warn!(node = %self.identity.node_name, error = %e, "re_cordon_failed");
                        }
                    }
                }
                (true, false) => {
                    // Adopt: someone else (or a prior crashed pass) already
                    // cordoned it on our behalf; no cluster write needed.
                    state.is_cordoned = true;
                }
                _ => {}
            }
            return;
        }

        match (unschedulable, was_cordoned, owned) {
            (true, true, true) => {
                self.uncordon_and_reset(state, "ownership_release").await;
            }
            (true, true, false) => {
                // Foreign cordon; not ours to release.
            }
            (true, false, true) => {
                // State drift: node carries our label but local state lost
                // it. Release it rather than leave an orphaned label.
                self.uncordon_and_reset(state, "ownership_drift").await;
            }
            (true, false, false) => {
                // Not enumerated in spec.md's truth table; mirror the
                // invariant that isCordoned tracks node.unschedulable.
                state.is_cordoned = true;
            }
            (false, true, _) => {
                // Drift: we believed we owned a cordon that no longer exists.
                state.is_cordoned = false;
            }
            (false, false, _) => {}
        }
    }

    async fn uncordon_and_reset(&self, state: &mut crate::state::AgentState, reason: &str) {
        match self.actuator.uncordon().await {
            Ok(()) => {
                state.is_cordoned = false;
                state.should_drain = false;
                state.is_drained = false;
                metrics::UNCORDON_TOTAL.inc();
                metrics::CORDONED_GAUGE.set(0);
                self.events
                    .record(Severity::Normal, "UncordonNode", format!("uncordoned node {}", self.identity.node_name))
                    .await;
            }
            Err(e) => {
                warn!(node = %self.identity.node_name, error = %e, reason, "uncordon_failed");
                self.events
                    .record(
                        Severity::Warning,
                        "UncordonNode",
                        format!("failed to uncordon node {}: {e}", self.identity.node_name),
                    )
                    .await;
            }
        }
    }
}
