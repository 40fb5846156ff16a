//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (ring bounds, thresholds, intervals > 0)
//! - Check subset selectors and their fallback references
//! - Detect duplicate clusters and hosts
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: UpstreamConfig → Result<(), Vec<ValidationError>>
//! - Component checks are the same ones the components run at construction,
//!   so a config that validates always builds

use std::collections::HashSet;

use thiserror::Error;

use crate::config::schema::{ClusterConfig, CommonLbConfig, UpstreamConfig};
use crate::health::settings::HealthCheckSettings;
use crate::load_balancer::ring_hash::validate_ring_hash;
use crate::load_balancer::subset::validate_subset_config;
use crate::upstream::host::MAX_HEALTH_CHECKS;

/// A single semantic problem in a configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{field}: {message}")]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl ValidationError {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Validate the whole configuration.
pub fn validate_config(config: &UpstreamConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();
    let mut names = HashSet::new();

    for (i, cluster) in config.clusters.iter().enumerate() {
        if !names.insert(cluster.name.as_str()) {
            errors.push(ValidationError::new(
                format!("clusters[{}].name", i),
                format!("duplicate cluster name '{}'", cluster.name),
            ));
        }
        if let Err(mut cluster_errors) = validate_cluster(cluster) {
            for err in &mut cluster_errors {
                err.field = format!("clusters[{}].{}", i, err.field);
            }
            errors.extend(cluster_errors);
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

/// Validate one cluster. Field names are relative to the cluster.
pub fn validate_cluster(cluster: &ClusterConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if cluster.name.trim().is_empty() {
        errors.push(ValidationError::new("name", "must not be empty"));
    }

    if let Err(e) = validate_ring_hash(&cluster.ring_hash) {
        errors.push(ValidationError::new("ring_hash", e.to_string()));
    }

    if cluster.least_request.choice_count < 2 {
        errors.push(ValidationError::new(
            "least_request.choice_count",
            "must be at least 2",
        ));
    }

    validate_common(&cluster.common, &mut errors);

    if let Some(subset) = &cluster.subset {
        if let Err(e) = validate_subset_config(subset) {
            errors.push(ValidationError::new("subset", e.to_string()));
        }
    }

    if cluster.health_checks.len() > MAX_HEALTH_CHECKS {
        errors.push(ValidationError::new(
            "health_checks",
            format!("at most {} health checks are supported", MAX_HEALTH_CHECKS),
        ));
    }
    for (i, check) in cluster.health_checks.iter().enumerate() {
        if let Err(e) = HealthCheckSettings::from_config(i, check) {
            errors.push(ValidationError::new(
                format!("health_checks[{}]", i),
                e.to_string(),
            ));
        }
    }

    let mut addresses = HashSet::new();
    for (i, host) in cluster.hosts.iter().enumerate() {
        if host.address.trim().is_empty() {
            errors.push(ValidationError::new(
                format!("hosts[{}].address", i),
                "must not be empty",
            ));
        } else if !addresses.insert(host.address.as_str()) {
            errors.push(ValidationError::new(
                format!("hosts[{}].address", i),
                format!("duplicate host '{}'", host.address),
            ));
        }
        if host.weight == 0 {
            errors.push(ValidationError::new(
                format!("hosts[{}].weight", i),
                "must be at least 1",
            ));
        }
    }

    let mut localities = HashSet::new();
    for (i, lw) in cluster.locality_weights.iter().enumerate() {
        if !localities.insert((lw.priority, &lw.locality)) {
            errors.push(ValidationError::new(
                format!("locality_weights[{}]", i),
                format!("duplicate weight for locality {}", lw.locality),
            ));
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn validate_common(common: &CommonLbConfig, errors: &mut Vec<ValidationError>) {
    if !(0.0..=100.0).contains(&common.healthy_panic_threshold) {
        errors.push(ValidationError::new(
            "common.healthy_panic_threshold",
            "must be between 0 and 100",
        ));
    }
    if common.overprovisioning_factor == 0 {
        errors.push(ValidationError::new(
            "common.overprovisioning_factor",
            "must be greater than 0",
        ));
    }
}
