//! Upstream host abstraction.
//!
//! # Responsibilities
//! - Represent a single upstream endpoint (address, weight, locality, metadata)
//! - Track active requests (for least-request balancing)
//! - Track health state per configured health check
//!
//! Hosts are shared by reference (`HostRef`) between host sets, rings and
//! subsets. Mutable state is atomic so worker threads can read it without
//! locking; only the cluster control loop writes it.

use std::collections::BTreeMap;
use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::upstream::metadata::MetadataValue;

/// Shared handle to a host.
pub type HostRef = Arc<Host>;

/// Maximum number of independent health checks tracked per host.
pub const MAX_HEALTH_CHECKS: usize = 16;

const DEGRADED_SHIFT: usize = MAX_HEALTH_CHECKS;

/// Health state enum.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    Healthy = 0,
    Unhealthy = 1,
    Degraded = 2,
}

impl From<u8> for HealthState {
    fn from(val: u8) -> Self {
        match val {
            1 => HealthState::Unhealthy,
            2 => HealthState::Degraded,
            _ => HealthState::Healthy,
        }
    }
}

impl fmt::Display for HealthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HealthState::Healthy => "healthy",
            HealthState::Unhealthy => "unhealthy",
            HealthState::Degraded => "degraded",
        };
        f.write_str(name)
    }
}

/// Where a host runs. Ordering is used to give localities a stable order.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct Locality {
    pub region: String,
    pub zone: String,
    pub sub_zone: String,
}

impl Locality {
    pub fn new(region: impl Into<String>, zone: impl Into<String>, sub_zone: impl Into<String>) -> Self {
        Self {
            region: region.into(),
            zone: zone.into(),
            sub_zone: sub_zone.into(),
        }
    }
}

impl fmt::Display for Locality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.region, self.zone, self.sub_zone)
    }
}

/// A single upstream host.
#[derive(Debug)]
pub struct Host {
    /// Address string; also the host identity within a cluster.
    address: String,
    locality: Locality,
    metadata: BTreeMap<String, MetadataValue>,
    /// Load balancing weight, always >= 1.
    weight: AtomicU32,
    /// Bit `i` set: check `i` failed. Bit `16 + i` set: check `i` reported degraded.
    health_flags: AtomicU32,
    /// Number of requests currently routed to this host.
    active_requests: AtomicU64,
    /// Requests ever routed to this host.
    total_requests: AtomicU64,
}

impl Host {
    /// Create a healthy host. A weight of zero is raised to one.
    pub fn new(address: impl Into<String>, weight: u32) -> Self {
        Self {
            address: address.into(),
            locality: Locality::default(),
            metadata: BTreeMap::new(),
            weight: AtomicU32::new(weight.max(1)),
            health_flags: AtomicU32::new(0),
            active_requests: AtomicU64::new(0),
            total_requests: AtomicU64::new(0),
        }
    }

    pub fn with_locality(mut self, locality: Locality) -> Self {
        self.locality = locality;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<MetadataValue>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_metadata_map(mut self, metadata: BTreeMap<String, MetadataValue>) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn locality(&self) -> &Locality {
        &self.locality
    }

    pub fn metadata(&self) -> &BTreeMap<String, MetadataValue> {
        &self.metadata
    }

    pub fn metadata_value(&self, key: &str) -> Option<&MetadataValue> {
        self.metadata.get(key)
    }

    pub fn weight(&self) -> u32 {
        self.weight.load(Ordering::Relaxed)
    }

    /// Update the weight. Returns true if it changed.
    pub fn set_weight(&self, weight: u32) -> bool {
        self.weight.swap(weight.max(1), Ordering::Relaxed) != weight.max(1)
    }

    // --- Health Logic ---

    /// Aggregate health: any failed check makes the host unhealthy, otherwise
    /// any degraded check makes it degraded.
    pub fn health(&self) -> HealthState {
        let flags = self.health_flags.load(Ordering::Acquire);
        if flags & Self::failed_mask() != 0 {
            HealthState::Unhealthy
        } else if flags & Self::degraded_mask() != 0 {
            HealthState::Degraded
        } else {
            HealthState::Healthy
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.health() == HealthState::Healthy
    }

    /// State last reported by health check `check`.
    pub fn check_state(&self, check: usize) -> HealthState {
        let flags = self.health_flags.load(Ordering::Acquire);
        if flags & (1 << check) != 0 {
            HealthState::Unhealthy
        } else if flags & (1 << (DEGRADED_SHIFT + check)) != 0 {
            HealthState::Degraded
        } else {
            HealthState::Healthy
        }
    }

    /// Record the state reported by health check `check`. Returns true if the
    /// aggregate health changed.
    pub fn set_check_state(&self, check: usize, state: HealthState) -> bool {
        debug_assert!(check < MAX_HEALTH_CHECKS);
        let failed = 1u32 << check;
        let degraded = 1u32 << (DEGRADED_SHIFT + check);
        let before = self.health();
        let mut current = self.health_flags.load(Ordering::Acquire);
        loop {
            let next = match state {
                HealthState::Healthy => current & !(failed | degraded),
                HealthState::Unhealthy => (current | failed) & !degraded,
                HealthState::Degraded => (current | degraded) & !failed,
            };
            match self.health_flags.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
        before != self.health()
    }

    /// Overwrite the health of a host that is not actively checked.
    pub fn set_health(&self, state: HealthState) -> bool {
        let before = self.health();
        self.health_flags.store(0, Ordering::Release);
        self.set_check_state(0, state);
        before != self.health()
    }

    fn failed_mask() -> u32 {
        (1u32 << MAX_HEALTH_CHECKS) - 1
    }

    fn degraded_mask() -> u32 {
        Self::failed_mask() << DEGRADED_SHIFT
    }

    // --- Request accounting ---

    pub fn active_requests(&self) -> u64 {
        self.active_requests.load(Ordering::Relaxed)
    }

    pub fn total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }

    /// Whether any request was ever routed here.
    pub fn has_traffic(&self) -> bool {
        self.total_requests() > 0
    }

    /// Count a request against this host until the guard is dropped.
    pub fn start_request(self: &Arc<Self>) -> ActiveRequestGuard {
        self.active_requests.fetch_add(1, Ordering::Relaxed);
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        ActiveRequestGuard { host: self.clone() }
    }
}

impl fmt::Display for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.address)
    }
}

/// A RAII guard that manages the active request count.
#[derive(Debug)]
pub struct ActiveRequestGuard {
    host: HostRef,
}

impl Deref for ActiveRequestGuard {
    type Target = Host;
    fn deref(&self) -> &Self::Target {
        &self.host
    }
}

impl Drop for ActiveRequestGuard {
    fn drop(&mut self) {
        self.host.active_requests.fetch_sub(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_weight_is_raised() {
        let host = Host::new("10.0.0.1:80", 0);
        assert_eq!(host.weight(), 1);
        assert!(host.set_weight(5));
        assert!(!host.set_weight(5));
        assert_eq!(host.weight(), 5);
    }

    #[test]
    fn test_aggregate_health_across_checks() {
        let host = Host::new("10.0.0.1:80", 1);
        assert_eq!(host.health(), HealthState::Healthy);

        assert!(host.set_check_state(1, HealthState::Degraded));
        assert_eq!(host.health(), HealthState::Degraded);

        assert!(host.set_check_state(0, HealthState::Unhealthy));
        assert_eq!(host.health(), HealthState::Unhealthy);

        // Check 0 recovers but check 1 still reports degraded.
        assert!(host.set_check_state(0, HealthState::Healthy));
        assert_eq!(host.health(), HealthState::Degraded);
        assert_eq!(host.check_state(1), HealthState::Degraded);
        assert_eq!(host.check_state(0), HealthState::Healthy);
    }

    #[test]
    fn test_request_guard() {
        let host = Arc::new(Host::new("10.0.0.1:80", 1));
        {
            let _g1 = host.start_request();
            let _g2 = host.start_request();
            assert_eq!(host.active_requests(), 2);
        }
        assert_eq!(host.active_requests(), 0);
        assert_eq!(host.total_requests(), 2);
        assert!(host.has_traffic());
    }
}
