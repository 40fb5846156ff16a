//! Metrics collection and exposition.
//!
//! # Responsibilities
//! - Define upstream metrics (ring shape, health checks, subsets)
//! - Expose Prometheus-compatible metrics endpoint
//!
//! # Metrics
//! - `upstream_ring_size` (gauge): entries in the last built ring
//! - `upstream_ring_min_hashes_per_host` / `_max_` (gauge)
//! - `upstream_health_check_total` (counter): by `outcome`
//!   (attempt, success, failure, network_failure, timeout)
//! - `upstream_health_check_consecutive_failures` (histogram)
//! - `upstream_host_health` (gauge): 1=healthy, 0.5=degraded, 0=unhealthy
//! - `upstream_subsets_active` (gauge), `upstream_subsets_total` (counter): by `event`
//!   (created, removed, selected, fallback, fallback_panic)
//!
//! # Design Decisions
//! - Helpers are free functions; without an installed recorder they are no-ops
//! - Components keep their own atomic stats for tests and callers

use std::net::SocketAddr;

use metrics_exporter_prometheus::PrometheusBuilder;

use crate::load_balancer::ring_hash::Ring;
use crate::upstream::host::HealthState;

/// Install the Prometheus exporter and its scrape endpoint.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics endpoint listening"),
        Err(e) => tracing::error!(error = %e, "Failed to install metrics exporter"),
    }
}

pub fn record_ring_build(ring: &Ring) {
    metrics::gauge!("upstream_ring_size").set(ring.len() as f64);
    metrics::gauge!("upstream_ring_min_hashes_per_host").set(ring.min_hashes_per_host() as f64);
    metrics::gauge!("upstream_ring_max_hashes_per_host").set(ring.max_hashes_per_host() as f64);
}

/// One health check event. `outcome` is a fixed label value.
pub fn record_health_check(outcome: &'static str) {
    metrics::counter!("upstream_health_check_total", "outcome" => outcome).increment(1);
}

pub fn record_consecutive_failures(count: u32) {
    metrics::histogram!("upstream_health_check_consecutive_failures").record(f64::from(count));
}

pub fn record_host_health(host: &str, state: HealthState) {
    let value = match state {
        HealthState::Healthy => 1.0,
        HealthState::Degraded => 0.5,
        HealthState::Unhealthy => 0.0,
    };
    metrics::gauge!("upstream_host_health", "host" => host.to_string()).set(value);
}

pub fn record_subset_event(event: &'static str) {
    metrics::counter!("upstream_subsets_total", "event" => event).increment(1);
}

pub fn record_subsets_active(active: u64) {
    metrics::gauge!("upstream_subsets_active").set(active as f64);
}
