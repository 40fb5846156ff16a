//! A filtered copy of the cluster's priority set with its own load balancer.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::load_balancer::subset::selector::SubsetSettings;
use crate::load_balancer::{EmptyLoadBalancer, LoadBalancer, LoadBalancerContext, LoadBalancerFactory};
use crate::upstream::host::{Host, HostRef, Locality};
use crate::upstream::metadata::{MetadataValue, SubsetMetadata};
use crate::upstream::priority_set::PrioritySet;

/// True if `host` carries every `(key, value)` of `kvs`. An empty tuple
/// matches every host.
pub fn host_matches(kvs: &[(String, MetadataValue)], host: &Host, list_as_any: bool) -> bool {
    kvs.iter().all(|(key, wanted)| {
        host.metadata_value(key)
            .map(|value| value.matches(wanted, list_as_any))
            .unwrap_or(false)
    })
}

/// Hosts of the cluster matching one metadata tuple, at every priority.
///
/// The original priority set is not stored; callers pass it to each update,
/// so a subset never keeps a removed host or the cluster alive.
#[derive(Debug, Clone)]
pub struct PrioritySubset {
    metadata: SubsetMetadata,
    priority_set: PrioritySet,
    lb: Arc<dyn LoadBalancer>,
}

impl PrioritySubset {
    /// Build from every host currently in `original`.
    pub fn new(
        metadata: SubsetMetadata,
        original: &PrioritySet,
        settings: &SubsetSettings,
        factory: &dyn LoadBalancerFactory,
    ) -> Self {
        let mut subset = Self {
            metadata,
            priority_set: PrioritySet::new(original.overprovisioning_factor()),
            lb: Arc::new(EmptyLoadBalancer),
        };
        for host_set in original.host_sets_per_priority() {
            subset.update(host_set.priority(), host_set.hosts(), &[], original, settings);
        }
        subset.rebuild(factory);
        subset
    }

    pub fn metadata(&self) -> &SubsetMetadata {
        &self.metadata
    }

    pub fn priority_set(&self) -> &PrioritySet {
        &self.priority_set
    }

    /// A subset is active while it holds at least one host.
    pub fn is_active(&self) -> bool {
        !self.priority_set.is_empty()
    }

    pub fn matches(&self, host: &Host, list_as_any: bool) -> bool {
        host_matches(&self.metadata, host, list_as_any)
    }

    /// Apply a membership delta of the original set. Only matching added hosts
    /// enter; removals of hosts not in the subset are no-ops.
    pub fn update(
        &mut self,
        priority: u32,
        added: &[HostRef],
        removed: &[HostRef],
        original: &PrioritySet,
        settings: &SubsetSettings,
    ) {
        let matching: Vec<HostRef> = added
            .iter()
            .filter(|h| self.matches(h, settings.list_as_any))
            .cloned()
            .collect();
        self.priority_set.update_hosts(priority, &matching, removed);
        self.apply_locality_weights(priority, original, settings);
    }

    /// Recompute partitions and locality weights after health or weight changes.
    pub fn refresh(&mut self, original: &PrioritySet, settings: &SubsetSettings) {
        self.priority_set.refresh_health();
        for priority in 0..self.priority_set.host_sets_per_priority().len() as u32 {
            self.apply_locality_weights(priority, original, settings);
        }
    }

    /// Replace the inner load balancer with one built for the current hosts.
    pub fn rebuild(&mut self, factory: &dyn LoadBalancerFactory) {
        self.lb = factory.create(&self.priority_set);
    }

    pub fn choose_host(&self, context: &dyn LoadBalancerContext) -> Option<HostRef> {
        self.lb.choose_host(context)
    }

    fn apply_locality_weights(&mut self, priority: u32, original: &PrioritySet, settings: &SubsetSettings) {
        if !settings.locality_weight_aware {
            return;
        }
        let Some(original_set) = original.host_set(priority) else {
            return;
        };
        let configured = original_set.configured_locality_weights();
        let weights: BTreeMap<Locality, u32> = if settings.scale_locality_weight {
            let host_set = self.priority_set.get_or_create_host_set(priority);
            let per_locality = host_set.hosts_per_locality();
            let original_per_locality = original_set.hosts_per_locality();
            configured
                .iter()
                .map(|(locality, weight)| {
                    let kept = count_in_locality(per_locality.localities(), per_locality.get(), locality);
                    let total = count_in_locality(
                        original_per_locality.localities(),
                        original_per_locality.get(),
                        locality,
                    );
                    let scaled = if total == 0 {
                        0
                    } else {
                        (f64::from(*weight) * kept as f64 / total as f64).round() as u32
                    };
                    (locality.clone(), scaled)
                })
                .collect()
        } else {
            configured.clone()
        };
        self.priority_set.set_locality_weights(priority, weights);
    }
}

fn count_in_locality(localities: &[Locality], hosts: &[Vec<HostRef>], locality: &Locality) -> usize {
    localities
        .iter()
        .position(|l| l == locality)
        .and_then(|i| hosts.get(i))
        .map(Vec::len)
        .unwrap_or(0)
}
