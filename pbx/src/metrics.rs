//! Prometheus metrics for the signaling core.
//!
//! The registry is owned here; the (out of scope) admin API exports it.

use prometheus::{IntCounter, IntGauge, IntGaugeVec, Opts, Registry};

pub struct Metrics {
    registry: Registry,

    pub calls_in_progress: IntGauge,
    pub invites_total: IntCounter,
    pub registrations: IntGauge,
    pub trunk_status: IntGaugeVec,
    pub trunk_failures: IntCounter,
    pub trace_dropped: IntCounter,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let calls_in_progress =
            IntGauge::new("flowpbx_calls_in_progress", "Calls currently in progress")
                .expect("valid metric definition");
        let invites_total =
            IntCounter::new("flowpbx_invites_total", "Inbound INVITE requests seen")
                .expect("valid metric definition");
        let registrations = IntGauge::new(
            "flowpbx_registrations",
            "Active extension contact bindings",
        )
        .expect("valid metric definition");
        let trunk_status = IntGaugeVec::new(
            Opts::new("flowpbx_trunk_status", "Trunk count per status"),
            &["status"],
        )
        .expect("valid metric definition");
        let trunk_failures = IntCounter::new(
            "flowpbx_trunk_failures_total",
            "Trunk registration/probe failures",
        )
        .expect("valid metric definition");
        let trace_dropped = IntCounter::new(
            "flowpbx_trace_dropped_total",
            "SIP trace frames dropped because the queue was full",
        )
        .expect("valid metric definition");

        for collector in [
            Box::new(calls_in_progress.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(invites_total.clone()),
            Box::new(registrations.clone()),
            Box::new(trunk_status.clone()),
            Box::new(trunk_failures.clone()),
            Box::new(trace_dropped.clone()),
        ] {
            registry
                .register(collector)
                .expect("metrics registered once");
        }

        Self {
            registry,
            calls_in_progress,
            invites_total,
            registrations,
            trunk_status,
            trunk_failures,
            trace_dropped,
        }
    }

    /// Snapshot of all metric families, for the export surface
    pub fn gather(&self) -> Vec<prometheus::proto::MetricFamily> {
        self.registry.gather()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
