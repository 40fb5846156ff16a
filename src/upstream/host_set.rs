//! Hosts at one priority level and their derived partitions.

use std::collections::{BTreeMap, HashSet};

use crate::upstream::host::{HealthState, HostRef, Locality};

/// Default overprovisioning factor, in percent.
pub const DEFAULT_OVERPROVISIONING_FACTOR: u32 = 140;

/// Hosts grouped by locality. Localities are kept in sorted order so that the
/// grouping, and any weights aligned with it, are deterministic.
#[derive(Debug, Clone, Default)]
pub struct HostsPerLocality {
    localities: Vec<Locality>,
    hosts: Vec<Vec<HostRef>>,
}

impl HostsPerLocality {
    fn group(hosts: &[HostRef]) -> Self {
        let mut grouped: BTreeMap<Locality, Vec<HostRef>> = BTreeMap::new();
        for host in hosts {
            grouped.entry(host.locality().clone()).or_default().push(host.clone());
        }
        let (localities, hosts) = grouped.into_iter().unzip();
        Self { localities, hosts }
    }

    /// Same localities, same order, hosts filtered by `keep`.
    fn filtered(&self, keep: impl Fn(&HostRef) -> bool) -> Self {
        Self {
            localities: self.localities.clone(),
            hosts: self
                .hosts
                .iter()
                .map(|hosts| hosts.iter().filter(|h| keep(h)).cloned().collect())
                .collect(),
        }
    }

    pub fn localities(&self) -> &[Locality] {
        &self.localities
    }

    pub fn get(&self) -> &[Vec<HostRef>] {
        &self.hosts
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.iter().all(Vec::is_empty)
    }
}

/// Ordered collection of hosts at one priority level.
///
/// `healthy_hosts` and `degraded_hosts` are always recomputed from `hosts`
/// and each host's current health whenever membership or health changes.
#[derive(Debug, Clone)]
pub struct HostSet {
    priority: u32,
    overprovisioning_factor: u32,
    hosts: Vec<HostRef>,
    healthy_hosts: Vec<HostRef>,
    degraded_hosts: Vec<HostRef>,
    hosts_per_locality: HostsPerLocality,
    healthy_hosts_per_locality: HostsPerLocality,
    degraded_hosts_per_locality: HostsPerLocality,
    /// Weights as configured by discovery, keyed by locality.
    configured_locality_weights: BTreeMap<Locality, u32>,
    /// Weights aligned with `hosts_per_locality.localities()`; `None` when no
    /// locality weighting is configured.
    locality_weights: Option<Vec<u32>>,
}

impl HostSet {
    pub fn new(priority: u32, overprovisioning_factor: u32) -> Self {
        Self {
            priority,
            overprovisioning_factor,
            hosts: Vec::new(),
            healthy_hosts: Vec::new(),
            degraded_hosts: Vec::new(),
            hosts_per_locality: HostsPerLocality::default(),
            healthy_hosts_per_locality: HostsPerLocality::default(),
            degraded_hosts_per_locality: HostsPerLocality::default(),
            configured_locality_weights: BTreeMap::new(),
            locality_weights: None,
        }
    }

    pub fn priority(&self) -> u32 {
        self.priority
    }

    pub fn overprovisioning_factor(&self) -> u32 {
        self.overprovisioning_factor
    }

    pub fn hosts(&self) -> &[HostRef] {
        &self.hosts
    }

    pub fn healthy_hosts(&self) -> &[HostRef] {
        &self.healthy_hosts
    }

    pub fn degraded_hosts(&self) -> &[HostRef] {
        &self.degraded_hosts
    }

    pub fn hosts_per_locality(&self) -> &HostsPerLocality {
        &self.hosts_per_locality
    }

    pub fn healthy_hosts_per_locality(&self) -> &HostsPerLocality {
        &self.healthy_hosts_per_locality
    }

    pub fn degraded_hosts_per_locality(&self) -> &HostsPerLocality {
        &self.degraded_hosts_per_locality
    }

    pub fn locality_weights(&self) -> Option<&[u32]> {
        self.locality_weights.as_deref()
    }

    pub fn configured_locality_weights(&self) -> &BTreeMap<Locality, u32> {
        &self.configured_locality_weights
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }

    pub fn find(&self, address: &str) -> Option<&HostRef> {
        self.hosts.iter().find(|h| h.address() == address)
    }

    /// Apply a membership delta. An added host replaces any existing host with
    /// the same address; removing an unknown host is a no-op.
    pub fn update(&mut self, added: &[HostRef], removed: &[HostRef]) {
        if added.is_empty() && removed.is_empty() {
            return;
        }
        let dropped: HashSet<&str> = removed
            .iter()
            .chain(added.iter())
            .map(|h| h.address())
            .collect();
        self.hosts.retain(|h| !dropped.contains(h.address()));
        self.hosts.extend(added.iter().cloned());
        self.rebuild_partitions();
    }

    /// Replace the configured locality weights.
    pub fn set_locality_weights(&mut self, weights: BTreeMap<Locality, u32>) {
        self.configured_locality_weights = weights;
        self.rebuild_locality_weights();
    }

    /// Recompute partitions after host health flags changed.
    pub fn refresh_health(&mut self) {
        self.rebuild_partitions();
    }

    fn rebuild_partitions(&mut self) {
        self.healthy_hosts = self
            .hosts
            .iter()
            .filter(|h| h.health() == HealthState::Healthy)
            .cloned()
            .collect();
        self.degraded_hosts = self
            .hosts
            .iter()
            .filter(|h| h.health() == HealthState::Degraded)
            .cloned()
            .collect();
        self.hosts_per_locality = HostsPerLocality::group(&self.hosts);
        self.healthy_hosts_per_locality = self
            .hosts_per_locality
            .filtered(|h| h.health() == HealthState::Healthy);
        self.degraded_hosts_per_locality = self
            .hosts_per_locality
            .filtered(|h| h.health() == HealthState::Degraded);
        self.rebuild_locality_weights();
    }

    fn rebuild_locality_weights(&mut self) {
        if self.configured_locality_weights.is_empty() {
            self.locality_weights = None;
            return;
        }
        let weights = self
            .hosts_per_locality
            .localities()
            .iter()
            .map(|locality| {
                self.configured_locality_weights
                    .get(locality)
                    .copied()
                    .unwrap_or(0)
            })
            .collect();
        self.locality_weights = Some(weights);
    }
}
