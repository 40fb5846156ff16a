//! Host sets indexed by priority.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::upstream::host::{HostRef, Locality};
use crate::upstream::host_set::{HostSet, DEFAULT_OVERPROVISIONING_FACTOR};

/// Ordered list of host sets, priority 0 first.
///
/// Priorities are dense: asking for priority `n` creates every missing level
/// below it. Host sets are reference counted so cloning a priority set to
/// publish a snapshot is cheap; mutation copies only the touched level.
#[derive(Debug, Clone)]
pub struct PrioritySet {
    host_sets: Vec<Arc<HostSet>>,
    overprovisioning_factor: u32,
}

impl Default for PrioritySet {
    fn default() -> Self {
        Self::new(DEFAULT_OVERPROVISIONING_FACTOR)
    }
}

impl PrioritySet {
    pub fn new(overprovisioning_factor: u32) -> Self {
        Self {
            host_sets: Vec::new(),
            overprovisioning_factor,
        }
    }

    pub fn host_sets_per_priority(&self) -> &[Arc<HostSet>] {
        &self.host_sets
    }

    pub fn host_set(&self, priority: u32) -> Option<&HostSet> {
        self.host_sets.get(priority as usize).map(Arc::as_ref)
    }

    pub fn overprovisioning_factor(&self) -> u32 {
        self.overprovisioning_factor
    }

    /// Mutable access to one level, creating it (and any gap below it) first.
    pub fn get_or_create_host_set(&mut self, priority: u32) -> &mut HostSet {
        while self.host_sets.len() <= priority as usize {
            let next = self.host_sets.len() as u32;
            self.host_sets
                .push(Arc::new(HostSet::new(next, self.overprovisioning_factor)));
        }
        Arc::make_mut(&mut self.host_sets[priority as usize])
    }

    /// Apply a membership delta at one priority.
    pub fn update_hosts(&mut self, priority: u32, added: &[HostRef], removed: &[HostRef]) {
        self.get_or_create_host_set(priority).update(added, removed);
    }

    pub fn set_locality_weights(&mut self, priority: u32, weights: BTreeMap<Locality, u32>) {
        self.get_or_create_host_set(priority).set_locality_weights(weights);
    }

    /// Recompute health partitions at every level.
    pub fn refresh_health(&mut self) {
        for host_set in &mut self.host_sets {
            Arc::make_mut(host_set).refresh_health();
        }
    }

    pub fn all_hosts(&self) -> impl Iterator<Item = &HostRef> {
        self.host_sets.iter().flat_map(|hs| hs.hosts().iter())
    }

    pub fn is_empty(&self) -> bool {
        self.host_sets.iter().all(|hs| hs.is_empty())
    }

    /// Find a host and its priority by address.
    pub fn find_host(&self, address: &str) -> Option<(u32, &HostRef)> {
        self.host_sets
            .iter()
            .find_map(|hs| hs.find(address).map(|h| (hs.priority(), h)))
    }
}
