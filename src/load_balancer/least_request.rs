//! Least request load balancing strategy.
//!
//! Draws `choice_count` random hosts and keeps the one with the fewest active
//! requests. Ties keep the earlier draw.

use crate::load_balancer::priority::PriorityTable;
use crate::load_balancer::{priority_hash, LoadBalancer, LoadBalancerContext};
use crate::upstream::host::HostRef;
use crate::upstream::priority_set::PrioritySet;

#[derive(Debug)]
pub struct LeastRequestLoadBalancer {
    table: PriorityTable<Vec<HostRef>>,
    choice_count: u32,
}

impl LeastRequestLoadBalancer {
    pub fn new(priority_set: &PrioritySet, panic_threshold: f64, choice_count: u32) -> Self {
        Self {
            table: PriorityTable::build(priority_set, panic_threshold, |host_set, source| {
                source.hosts(host_set).to_vec()
            }),
            choice_count: choice_count.max(1),
        }
    }
}

/// Power-of-N-choices pick over `hosts`.
pub fn pick_least_requests(hosts: &[HostRef], choice_count: u32) -> Option<HostRef> {
    if hosts.len() <= 1 {
        return hosts.first().cloned();
    }
    (0..choice_count)
        .map(|_| &hosts[fastrand::usize(..hosts.len())])
        .min_by_key(|h| h.active_requests())
        .cloned()
}

impl LoadBalancer for LeastRequestLoadBalancer {
    fn choose_host(&self, context: &dyn LoadBalancerContext) -> Option<HostRef> {
        let hosts = self.table.pick(priority_hash(context))?;
        pick_least_requests(hosts, self.choice_count)
    }
}
