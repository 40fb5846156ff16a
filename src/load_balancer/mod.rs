//! Load balancing subsystem.
//!
//! # Data Flow
//! ```text
//! PrioritySet snapshot (membership or health changed)
//!     → LoadBalancerFactory::create
//!         → priority.rs (priority load, panic per priority)
//!         → strategy structures per priority:
//!             - round_robin.rs (weighted rotation)
//!             - least_request.rs (power of N choices)
//!             - random.rs
//!             - ring_hash/ (consistent hashing ring)
//!     → Arc<dyn LoadBalancer> published by the cluster
//!
//! Request → LoadBalancer::choose_host(context) → Option<HostRef>
//! ```
//!
//! # Design Decisions
//! - A built load balancer is immutable; rebuilding replaces it wholesale
//! - Strategies are one trait selected by a tagged variant, not a hierarchy
//! - The subset engine (subset/) composes one inner load balancer per subset
//! - No host is a normal outcome (`None`); the caller decides what it means

pub mod least_request;
pub mod priority;
pub mod random;
pub mod ring_hash;
pub mod round_robin;
pub mod subset;

use std::fmt;
use std::sync::Arc;

use crate::config::schema::{ClusterConfig, CommonLbConfig, LbPolicy, RingHashConfig};
use crate::error::ConfigError;
use crate::upstream::host::HostRef;
use crate::upstream::metadata::MetadataMatchCriteria;
use crate::upstream::priority_set::PrioritySet;

use least_request::LeastRequestLoadBalancer;
use random::RandomLoadBalancer;
use ring_hash::{RingHashLoadBalancer, RingStats};
use round_robin::RoundRobinLoadBalancer;

/// What a request tells the load balancer about itself.
pub trait LoadBalancerContext: Send + Sync {
    /// Hash used by hashing strategies and to pick a priority.
    fn compute_hash_key(&self) -> Option<u64> {
        None
    }

    /// Metadata the chosen host must carry; used by the subset engine.
    fn metadata_match_criteria(&self) -> Option<&MetadataMatchCriteria> {
        None
    }
}

/// Plain request context.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    hash_key: Option<u64>,
    metadata: Option<MetadataMatchCriteria>,
}

impl RequestContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_hash_key(mut self, hash: u64) -> Self {
        self.hash_key = Some(hash);
        self
    }

    /// Hash `key` (e.g. a session id) with xxHash64.
    pub fn with_hash_of(self, key: impl AsRef<[u8]>) -> Self {
        self.with_hash_key(ring_hash::hash::xx_hash64(key.as_ref()))
    }

    pub fn with_metadata(mut self, criteria: MetadataMatchCriteria) -> Self {
        self.metadata = Some(criteria);
        self
    }
}

impl LoadBalancerContext for RequestContext {
    fn compute_hash_key(&self) -> Option<u64> {
        self.hash_key
    }

    fn metadata_match_criteria(&self) -> Option<&MetadataMatchCriteria> {
        self.metadata.as_ref()
    }
}

/// Request-time host selection over one immutable snapshot.
pub trait LoadBalancer: Send + Sync + fmt::Debug {
    fn choose_host(&self, context: &dyn LoadBalancerContext) -> Option<HostRef>;
}

/// Builds a load balancer for a priority set snapshot.
pub trait LoadBalancerFactory: Send + Sync + fmt::Debug {
    fn create(&self, priority_set: &PrioritySet) -> Arc<dyn LoadBalancer>;
}

/// Strategy selected by configuration.
#[derive(Debug, Clone, PartialEq)]
pub enum LoadBalancerType {
    RoundRobin,
    LeastRequest { choice_count: u32 },
    Random,
    RingHash(RingHashConfig),
}

impl LoadBalancerType {
    pub fn from_config(cluster: &ClusterConfig) -> Self {
        match cluster.lb_policy {
            LbPolicy::RoundRobin => LoadBalancerType::RoundRobin,
            LbPolicy::LeastRequest => LoadBalancerType::LeastRequest {
                choice_count: cluster.least_request.choice_count,
            },
            LbPolicy::Random => LoadBalancerType::Random,
            LbPolicy::RingHash => LoadBalancerType::RingHash(cluster.ring_hash.clone()),
        }
    }
}

/// Factory for the plain (non-subset) strategies.
#[derive(Debug, Clone)]
pub struct StrategyFactory {
    lb_type: LoadBalancerType,
    common: CommonLbConfig,
    ring_stats: Arc<RingStats>,
}

impl StrategyFactory {
    /// Validate the strategy settings up front so `create` cannot fail.
    pub fn new(lb_type: LoadBalancerType, common: CommonLbConfig) -> Result<Self, ConfigError> {
        match &lb_type {
            LoadBalancerType::RingHash(config) => ring_hash::validate_ring_hash(config)?,
            LoadBalancerType::LeastRequest { choice_count } if *choice_count < 2 => {
                return Err(ConfigError::LoadBalancer(
                    "least_request.choice_count must be at least 2".to_string(),
                ));
            }
            _ => {}
        }
        Ok(Self {
            lb_type,
            common,
            ring_stats: Arc::new(RingStats::default()),
        })
    }

    pub fn lb_type(&self) -> &LoadBalancerType {
        &self.lb_type
    }

    pub fn ring_stats(&self) -> &Arc<RingStats> {
        &self.ring_stats
    }
}

impl LoadBalancerFactory for StrategyFactory {
    fn create(&self, priority_set: &PrioritySet) -> Arc<dyn LoadBalancer> {
        let threshold = self.common.healthy_panic_threshold;
        match &self.lb_type {
            LoadBalancerType::RoundRobin => {
                Arc::new(RoundRobinLoadBalancer::new(priority_set, threshold))
            }
            LoadBalancerType::LeastRequest { choice_count } => Arc::new(
                LeastRequestLoadBalancer::new(priority_set, threshold, *choice_count),
            ),
            LoadBalancerType::Random => Arc::new(RandomLoadBalancer::new(priority_set, threshold)),
            LoadBalancerType::RingHash(config) => {
                match RingHashLoadBalancer::new(priority_set, config, &self.common, &self.ring_stats) {
                    Ok(lb) => Arc::new(lb),
                    // Checked in `new`; unreachable in practice.
                    Err(e) => {
                        tracing::error!(error = %e, "ring hash: invalid configuration");
                        Arc::new(EmptyLoadBalancer)
                    }
                }
            }
        }
    }
}

/// Selects nothing.
#[derive(Debug, Default)]
pub struct EmptyLoadBalancer;

impl LoadBalancer for EmptyLoadBalancer {
    fn choose_host(&self, _context: &dyn LoadBalancerContext) -> Option<HostRef> {
        None
    }
}

/// Hash used to pick a priority: the request's hash when it has one.
pub(crate) fn priority_hash(context: &dyn LoadBalancerContext) -> u64 {
    context.compute_hash_key().unwrap_or_else(|| fastrand::u64(..))
}
