//! Ring hash load balancing.
//!
//! One ring is built per priority from its healthy hosts (all hosts in panic)
//! plus one from its degraded hosts. The request hash picks both the priority
//! and the ring entry, so equal hashes land on the same host while membership
//! is stable.

pub mod hash;
pub mod ring;

use std::sync::Arc;

use crate::config::schema::{CommonLbConfig, RingHashConfig};
use crate::error::ConfigError;
use crate::load_balancer::priority::PriorityTable;
use crate::load_balancer::{LoadBalancer, LoadBalancerContext};
use crate::observability::metrics;
use crate::upstream::host::HostRef;
use crate::upstream::priority_set::PrioritySet;

pub use ring::{Ring, RingEntry, RingStats};

/// Largest ring a configuration may ask for.
pub const MAX_RING_SIZE: u64 = 8 * 1024 * 1024;

/// Reject ring settings that cannot produce a valid, reproducible ring.
pub fn validate_ring_hash(config: &RingHashConfig) -> Result<(), ConfigError> {
    if config.minimum_ring_size > config.maximum_ring_size {
        return Err(ConfigError::RingSizeBounds {
            min: config.minimum_ring_size,
            max: config.maximum_ring_size,
        });
    }
    if config.minimum_ring_size == 0 {
        return Err(ConfigError::RingHash(
            "minimum_ring_size must be greater than 0".to_string(),
        ));
    }
    if config.maximum_ring_size > MAX_RING_SIZE {
        return Err(ConfigError::RingHash(format!(
            "maximum_ring_size must not exceed {}",
            MAX_RING_SIZE
        )));
    }
    if config.use_std_hash {
        return Err(ConfigError::RingHash(
            "use_std_hash is not supported; ring keys must hash identically on every build"
                .to_string(),
        ));
    }
    Ok(())
}

#[derive(Debug)]
pub struct RingHashLoadBalancer {
    table: PriorityTable<Arc<Ring>>,
}

impl RingHashLoadBalancer {
    pub fn new(
        priority_set: &PrioritySet,
        config: &RingHashConfig,
        common: &CommonLbConfig,
        stats: &RingStats,
    ) -> Result<Self, ConfigError> {
        validate_ring_hash(config)?;
        let table = PriorityTable::build(priority_set, common.healthy_panic_threshold, |host_set, source| {
            let (weights, min_weight) = ring::normalize_weights(host_set, source);
            let ring = Ring::from_normalized(&weights, min_weight, config);
            if !ring.is_empty() {
                stats.record(&ring);
                metrics::record_ring_build(&ring);
            }
            Arc::new(ring)
        });
        Ok(Self { table })
    }

    pub fn table(&self) -> &PriorityTable<Arc<Ring>> {
        &self.table
    }
}

impl LoadBalancer for RingHashLoadBalancer {
    fn choose_host(&self, context: &dyn LoadBalancerContext) -> Option<HostRef> {
        let hash = context.compute_hash_key().unwrap_or_else(|| fastrand::u64(..));
        self.table.pick(hash)?.choose_host(hash)
    }
}
