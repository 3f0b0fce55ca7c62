// ABOUTME: Prometheus metrics for the bus substrate (routing, correlations, remote processes).
// ABOUTME: Thin recording helpers so call sites never spell metric names directly.

use anyhow::{Context, Result};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Install the global Prometheus recorder. Call once per daemon.
pub fn init_metrics() -> Result<PrometheusHandle> {
    PrometheusBuilder::new()
        .install_recorder()
        .context("Failed to install Prometheus recorder")
}

/// Count one inbound bus message by routing outcome
/// (`correlated`, `handled`, `ignored`, `unhandled`, `decode_error`).
pub fn record_bus_message(outcome: &'static str) {
    metrics::counter!("drc_bus_messages_total", "outcome" => outcome).increment(1);
}

pub fn record_handler_error() {
    metrics::counter!("drc_bus_handler_errors_total").increment(1);
}

pub fn set_pending_correlations(count: usize) {
    metrics::gauge!("drc_correlations_pending").set(count as f64);
}

pub fn set_running_processes(count: usize) {
    metrics::gauge!("drc_processes_running").set(count as f64);
}

pub fn record_spawn_rejected(reason: &'static str) {
    metrics::counter!("drc_process_spawn_rejected_total", "reason" => reason).increment(1);
}

pub fn record_ack_timeout() {
    metrics::counter!("drc_process_ack_timeouts_total").increment(1);
}
