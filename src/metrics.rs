//! Prometheus metrics, served from the driver's `/metrics` endpoint.

use std::sync::LazyLock;

use prometheus::{Histogram, HistogramOpts, IntCounter, IntGauge, Registry};

pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

pub static RECONCILE_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    let c = IntCounter::new("mechanic_reconcile_total", "Total reconcile passes executed").expect("metric definition is valid");
    REGISTRY.register(Box::new(c.clone())).expect("metric not yet registered");
    c
});

pub static RECONCILE_ERRORS: LazyLock<IntCounter> = LazyLock::new(|| {
    let c = IntCounter::new("mechanic_reconcile_errors_total", "Total reconcile passes that ended in an error")
        .expect("metric definition is valid");
    REGISTRY.register(Box::new(c.clone())).expect("metric not yet registered");
    c
});

pub static RECONCILE_SKIPPED: LazyLock<IntCounter> = LazyLock::new(|| {
    let c = IntCounter::new(
        "mechanic_reconcile_skipped_total",
        "Total reconcile triggers dropped due to entry-guard contention",
    )
    .expect("metric definition is valid");
    REGISTRY.register(Box::new(c.clone())).expect("metric not yet registered");
    c
});

pub static CORDON_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    let c = IntCounter::new("mechanic_cordon_total", "Total successful cordons").expect("metric definition is valid");
    REGISTRY.register(Box::new(c.clone())).expect("metric not yet registered");
    c
});

pub static UNCORDON_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    let c = IntCounter::new("mechanic_uncordon_total", "Total successful uncordons").expect("metric definition is valid");
    REGISTRY.register(Box::new(c.clone())).expect("metric not yet registered");
    c
});

pub static DRAIN_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    let c = IntCounter::new("mechanic_drain_total", "Total successful drains").expect("metric definition is valid");
    REGISTRY.register(Box::new(c.clone())).expect("metric not yet registered");
    c
});

pub static CORDONED_GAUGE: LazyLock<IntGauge> = LazyLock::new(|| {
    let g = IntGauge::new("mechanic_node_cordoned", "1 if this agent currently believes the node is cordoned")
        .expect("metric definition is valid");
    REGISTRY.register(Box::new(g.clone())).expect("metric not yet registered");
    g
});

pub static RECONCILE_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    let h = Histogram::with_opts(HistogramOpts::new(
        "mechanic_reconcile_duration_seconds",
        "Duration of each reconcile pass in seconds",
    ))
    .expect("metric definition is valid");
    REGISTRY.register(Box::new(h.clone())).expect("metric not yet registered");
    h
});

pub static PROBE_RETRIES: LazyLock<IntCounter> = LazyLock::new(|| {
    let c = IntCounter::new("mechanic_probe_retries_total", "Total metadata probe retries after a clean-EOF response")
        .expect("metric definition is valid");
    REGISTRY.register(Box::new(c.clone())).expect("metric not yet registered");
    c
});

/// Force-initializes every metric so they all appear on `/metrics` even
/// before the first reconcile pass touches them.
pub fn init() {
    LazyLock::force(&RECONCILE_TOTAL);
    LazyLock::force(&RECONCILE_ERRORS);
    LazyLock::force(&RECONCILE_SKIPPED);
    LazyLock::force(&CORDON_TOTAL);
    LazyLock::force(&UNCORDON_TOTAL);
    LazyLock::force(&DRAIN_TOTAL);
    LazyLock::force(&CORDONED_GAUGE);
    LazyLock::force(&RECONCILE_DURATION);
    LazyLock::force(&PROBE_RETRIES);
}
