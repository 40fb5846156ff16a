//! Static discovery: turn a configured host list into membership deltas.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::config::schema::{HostConfig, LocalityWeightConfig};
use crate::upstream::host::{Host, HostRef, Locality};
use crate::upstream::priority_set::PrioritySet;

/// Hosts added to and removed from one priority.
#[derive(Debug, Clone, Default)]
pub struct MembershipUpdate {
    pub priority: u32,
    pub added: Vec<HostRef>,
    pub removed: Vec<HostRef>,
}

impl MembershipUpdate {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Result of comparing the running membership with a desired host list.
#[derive(Debug, Default)]
pub struct HostDiff {
    /// Per priority, in ascending priority order.
    pub updates: Vec<MembershipUpdate>,
    /// Hosts whose only change is their weight.
    pub weight_changes: Vec<(HostRef, u32)>,
}

impl HostDiff {
    pub fn is_empty(&self) -> bool {
        self.updates.iter().all(MembershipUpdate::is_empty) && self.weight_changes.is_empty()
    }
}

pub fn build_host(config: &HostConfig) -> HostRef {
    Arc::new(
        Host::new(config.address.clone(), config.weight)
            .with_locality(config.locality.clone())
            .with_metadata_map(config.metadata.clone()),
    )
}

/// Compute the deltas that turn `current` into `desired`.
///
/// A host keeps its identity (and health) unless its priority, locality or
/// metadata changed; then the old host is removed and a new one added.
pub fn diff_hosts(current: &PrioritySet, desired: &[HostConfig]) -> HostDiff {
    let mut updates: BTreeMap<u32, MembershipUpdate> = BTreeMap::new();
    let mut weight_changes = Vec::new();

    let desired_by_address: HashMap<&str, &HostConfig> =
        desired.iter().map(|h| (h.address.as_str(), h)).collect();

    for host_set in current.host_sets_per_priority() {
        for host in host_set.hosts() {
            if !desired_by_address.contains_key(host.address()) {
                entry(&mut updates, host_set.priority()).removed.push(host.clone());
            }
        }
    }

    for config in desired {
        match current.find_host(&config.address) {
            Some((priority, host)) if same_identity(priority, host, config) => {
                if host.weight() != config.weight.max(1) {
                    weight_changes.push((host.clone(), config.weight));
                }
            }
            Some((priority, host)) => {
                entry(&mut updates, priority).removed.push(host.clone());
                entry(&mut updates, config.priority).added.push(build_host(config));
            }
            None => entry(&mut updates, config.priority).added.push(build_host(config)),
        }
    }

    HostDiff {
        updates: updates.into_values().collect(),
        weight_changes,
    }
}

fn entry(updates: &mut BTreeMap<u32, MembershipUpdate>, priority: u32) -> &mut MembershipUpdate {
    updates.entry(priority).or_insert_with(|| MembershipUpdate {
        priority,
        ..Default::default()
    })
}

fn same_identity(priority: u32, host: &Host, config: &HostConfig) -> bool {
    priority == config.priority && host.locality() == &config.locality && host.metadata() == &config.metadata
}

/// Configured locality weights grouped by priority.
pub fn locality_weights_by_priority(weights: &[LocalityWeightConfig]) -> BTreeMap<u32, BTreeMap<Locality, u32>> {
    let mut out: BTreeMap<u32, BTreeMap<Locality, u32>> = BTreeMap::new();
    for w in weights {
        out.entry(w.priority).or_default().insert(w.locality.clone(), w.weight);
    }
    out
}
