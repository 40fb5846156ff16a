//! Error types shared across the crate.
//!
//! Only configuration problems are surfaced as errors. An unavailable host is
//! an empty selection (`None`) and probe failures stay inside the health
//! checker, where they drive state transitions.

use thiserror::Error;

use crate::config::schema::ProbeKind;
use crate::config::validation::ValidationError;

/// Errors raised while building or reloading upstream configuration.
///
/// A rejected update never partially applies: the caller keeps the previously
/// active configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Ring size bounds are inverted.
    #[error("ring hash: minimum_ring_size ({min}) > maximum_ring_size ({max})")]
    RingSizeBounds { min: u64, max: u64 },

    /// Any other ring hash setting is out of range.
    #[error("ring hash: {0}")]
    RingHash(String),

    /// A subset selector is malformed.
    #[error("subset selector {index}: {reason}")]
    SubsetSelector { index: usize, reason: String },

    /// The cluster-wide subset fallback is malformed.
    #[error("subset fallback: {0}")]
    SubsetFallback(String),

    /// A health check has a non-positive interval, timeout or threshold, or a
    /// payload that cannot be decoded.
    #[error("health check {index}: {reason}")]
    HealthCheck { index: usize, reason: String },

    /// No transport is registered for the configured probe kind.
    #[error("no probe transport registered for {0} health checks")]
    MissingTransport(ProbeKind),

    /// Common load balancer settings are out of range.
    #[error("load balancer: {0}")]
    LoadBalancer(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Validation failed: {}", join_errors(.0))]
    Validation(Vec<ValidationError>),
}

fn join_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

