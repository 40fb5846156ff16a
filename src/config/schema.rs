//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the upstream
//! clusters. All types derive Serde traits for deserialization from config files.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::upstream::{Locality, MetadataValue};

/// Root configuration.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
#[serde(default)]
pub struct UpstreamConfig {
    /// Observability settings.
    pub observability: ObservabilityConfig,

    /// Upstream cluster definitions.
    pub clusters: Vec<ClusterConfig>,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            metrics_enabled: true,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}

/// One upstream cluster: a named pool of hosts plus how to pick among them.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ClusterConfig {
    /// Cluster identifier for logging/metrics.
    pub name: String,

    /// Balancing strategy used directly, or inside every subset.
    pub lb_policy: LbPolicy,

    pub ring_hash: RingHashConfig,

    pub least_request: LeastRequestConfig,

    pub common: CommonLbConfig,

    /// Metadata subsetting; `None` balances over the whole cluster.
    pub subset: Option<SubsetConfig>,

    /// Active health checks. Hosts are not checked when empty.
    pub health_checks: Vec<HealthCheckConfig>,

    /// Static membership.
    pub hosts: Vec<HostConfig>,

    pub locality_weights: Vec<LocalityWeightConfig>,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            lb_policy: LbPolicy::default(),
            ring_hash: RingHashConfig::default(),
            least_request: LeastRequestConfig::default(),
            common: CommonLbConfig::default(),
            subset: None,
            health_checks: Vec::new(),
            hosts: Vec::new(),
            locality_weights: Vec::new(),
        }
    }
}

/// Balancing strategy.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, Default, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LbPolicy {
    #[default]
    RoundRobin,
    LeastRequest,
    Random,
    RingHash,
}

/// Hash function used to place ring entries.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, Default, PartialEq, Eq)]
pub enum HashFunction {
    #[default]
    #[serde(rename = "XX_HASH")]
    XxHash,
    #[serde(rename = "MURMUR_HASH_2")]
    MurmurHash2,
}

/// Ring hash settings.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct RingHashConfig {
    pub minimum_ring_size: u64,
    pub maximum_ring_size: u64,
    pub hash_function: HashFunction,
    /// Hash keys with the platform hasher. Rejected by validation because the
    /// result differs between builds.
    pub use_std_hash: bool,
}

impl Default for RingHashConfig {
    fn default() -> Self {
        Self {
            minimum_ring_size: 1024,
            maximum_ring_size: 8 * 1024 * 1024,
            hash_function: HashFunction::XxHash,
            use_std_hash: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct LeastRequestConfig {
    /// Number of random hosts compared per pick.
    pub choice_count: u32,
}

impl Default for LeastRequestConfig {
    fn default() -> Self {
        Self { choice_count: 2 }
    }
}

/// Settings shared by every strategy.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct CommonLbConfig {
    /// Percentage of available hosts below which a priority panics.
    pub healthy_panic_threshold: f64,

    /// Percentage applied to a priority's health before spilling to the next.
    pub overprovisioning_factor: u32,
}

impl Default for CommonLbConfig {
    fn default() -> Self {
        Self {
            healthy_panic_threshold: 50.0,
            overprovisioning_factor: 140,
        }
    }
}

/// Cluster-wide subset fallback.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, Default, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubsetFallbackPolicy {
    #[default]
    NoFallback,
    AnyEndpoint,
    DefaultSubset,
}

/// Fallback applied when a selector's subset is missing or empty.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, Default, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SelectorFallbackPolicy {
    #[default]
    NoFallback,
    AnyEndpoint,
    DefaultSubset,
    KeysSubset,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
#[serde(default)]
pub struct SubsetSelectorConfig {
    pub keys: Vec<String>,
    pub fallback_policy: SelectorFallbackPolicy,
    /// Keys retried under `KEYS_SUBSET`.
    pub fallback_keys_subset: Vec<String>,
    /// Metadata used by `DEFAULT_SUBSET`. Empty means the cluster default.
    pub default_subset: BTreeMap<String, MetadataValue>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
#[serde(default)]
pub struct SubsetConfig {
    pub fallback_policy: SubsetFallbackPolicy,
    pub default_subset: BTreeMap<String, MetadataValue>,
    pub subset_selectors: Vec<SubsetSelectorConfig>,
    pub locality_weight_aware: bool,
    pub scale_locality_weight: bool,
    pub panic_mode_any: bool,
    pub list_as_any: bool,
}

/// Active health check settings. Durations are in milliseconds.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct HealthCheckConfig {
    pub timeout_ms: u64,
    pub interval_ms: u64,
    /// Fixed upper bound of random jitter added to every interval.
    pub interval_jitter_ms: u64,
    /// Jitter as a percentage of the interval, added on top of `interval_jitter_ms`.
    pub interval_jitter_percent: u32,
    /// Interval used while the host is unhealthy. Defaults to `interval_ms`.
    pub unhealthy_interval_ms: Option<u64>,
    /// First interval after a health flip. Defaults to the steady interval.
    pub burst_interval_ms: Option<u64>,
    /// Interval used until the host has served a request. Defaults to the
    /// regular intervals.
    pub no_traffic_interval_ms: Option<u64>,
    pub healthy_threshold: u32,
    pub unhealthy_threshold: u32,
    /// Treat newly added hosts as healthy before their first check passes.
    pub always_start_healthy: bool,
    pub probe: ProbeConfig,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 1_000,
            interval_ms: 5_000,
            interval_jitter_ms: 0,
            interval_jitter_percent: 0,
            unhealthy_interval_ms: None,
            burst_interval_ms: None,
            no_traffic_interval_ms: None,
            healthy_threshold: 2,
            unhealthy_threshold: 3,
            always_start_healthy: false,
            probe: ProbeConfig::default(),
        }
    }
}

/// Protocol payload of a health check.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProbeConfig {
    /// Connect, optionally write `send` and expect every `receive` segment.
    /// Segments are hex encoded.
    Tcp {
        #[serde(default)]
        send: Option<String>,
        #[serde(default)]
        receive: Vec<String>,
    },
    Http {
        #[serde(default = "default_http_path")]
        path: String,
        #[serde(default)]
        host: Option<String>,
        /// Accepted statuses. Empty means 200 only.
        #[serde(default)]
        expected_statuses: Vec<u16>,
    },
    Grpc {
        #[serde(default)]
        service_name: Option<String>,
    },
}

fn default_http_path() -> String {
    "/health".to_string()
}

impl Default for ProbeConfig {
    fn default() -> Self {
        ProbeConfig::Tcp {
            send: None,
            receive: Vec::new(),
        }
    }
}

impl ProbeConfig {
    pub fn kind(&self) -> ProbeKind {
        match self {
            ProbeConfig::Tcp { .. } => ProbeKind::Tcp,
            ProbeConfig::Http { .. } => ProbeKind::Http,
            ProbeConfig::Grpc { .. } => ProbeKind::Grpc,
        }
    }
}

/// Probe protocol tag; keys the transport registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProbeKind {
    Tcp,
    Http,
    Grpc,
}

impl fmt::Display for ProbeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProbeKind::Tcp => f.write_str("tcp"),
            ProbeKind::Http => f.write_str("http"),
            ProbeKind::Grpc => f.write_str("grpc"),
        }
    }
}

/// Statically configured host.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct HostConfig {
    /// Host address (e.g., "127.0.0.1:3000").
    pub address: String,

    /// Weight for weighted load balancing (default: 1).
    #[serde(default = "default_weight")]
    pub weight: u32,

    #[serde(default)]
    pub priority: u32,

    #[serde(default)]
    pub locality: Locality,

    #[serde(default)]
    pub metadata: BTreeMap<String, MetadataValue>,
}

fn default_weight() -> u32 {
    1
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct LocalityWeightConfig {
    #[serde(default)]
    pub priority: u32,
    #[serde(flatten)]
    pub locality: Locality,
    pub weight: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config: UpstreamConfig = toml::from_str(
            r#"
            [[clusters]]
            name = "api"
            hosts = [{ address = "10.0.0.1:80" }]
            "#,
        )
        .unwrap();
        let cluster = &config.clusters[0];
        assert_eq!(cluster.lb_policy, LbPolicy::RoundRobin);
        assert_eq!(cluster.ring_hash.minimum_ring_size, 1024);
        assert_eq!(cluster.hosts[0].weight, 1);
        assert!(cluster.subset.is_none());
    }

    #[test]
    fn test_full_cluster_parses() {
        let config: UpstreamConfig = toml::from_str(
            r#"
            [[clusters]]
            name = "cache"
            lb_policy = "RING_HASH"

            [clusters.ring_hash]
            minimum_ring_size = 64
            hash_function = "MURMUR_HASH_2"

            [clusters.subset]
            fallback_policy = "ANY_ENDPOINT"
            default_subset = { version = "v1" }

            [[clusters.subset.subset_selectors]]
            keys = ["version"]
            fallback_policy = "DEFAULT_SUBSET"

            [[clusters.health_checks]]
            interval_ms = 1000
            probe = { type = "tcp", send = "50494e47", receive = ["504f4e47"] }

            [[clusters.hosts]]
            address = "10.0.0.1:6379"
            weight = 2
            metadata = { version = "v1", shard = 3 }
            locality = { region = "eu", zone = "eu-1" }

            [[clusters.locality_weights]]
            region = "eu"
            zone = "eu-1"
            weight = 5
            "#,
        )
        .unwrap();
        let cluster = &config.clusters[0];
        assert_eq!(cluster.lb_policy, LbPolicy::RingHash);
        assert_eq!(cluster.ring_hash.hash_function, HashFunction::MurmurHash2);
        assert_eq!(cluster.health_checks[0].probe.kind(), ProbeKind::Tcp);
        assert_eq!(
            cluster.hosts[0].metadata.get("shard"),
            Some(&MetadataValue::Integer(3))
        );
        assert_eq!(cluster.locality_weights[0].locality.zone, "eu-1");
        let subset = cluster.subset.as_ref().unwrap();
        assert_eq!(
            subset.subset_selectors[0].fallback_policy,
            SelectorFallbackPolicy::DefaultSubset
        );
    }
}
