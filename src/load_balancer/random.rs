//! Uniform random load balancing strategy.

use crate::load_balancer::priority::PriorityTable;
use crate::load_balancer::{priority_hash, LoadBalancer, LoadBalancerContext};
use crate::upstream::host::HostRef;
use crate::upstream::priority_set::PrioritySet;

#[derive(Debug)]
pub struct RandomLoadBalancer {
    table: PriorityTable<Vec<HostRef>>,
}

impl RandomLoadBalancer {
    pub fn new(priority_set: &PrioritySet, panic_threshold: f64) -> Self {
        Self {
            table: PriorityTable::build(priority_set, panic_threshold, |host_set, source| {
                source.hosts(host_set).to_vec()
            }),
        }
    }
}

impl LoadBalancer for RandomLoadBalancer {
    fn choose_host(&self, context: &dyn LoadBalancerContext) -> Option<HostRef> {
        let hosts = self.table.pick(priority_hash(context))?;
        if hosts.is_empty() {
            return None;
        }
        Some(hosts[fastrand::usize(..hosts.len())].clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::load_balancer::RequestContext;
    use crate::upstream::host::{HealthState, Host};
    use std::sync::Arc;

    #[test]
    fn test_only_healthy_hosts_chosen() {
        let hosts: Vec<HostRef> = (0..4).map(|i| Arc::new(Host::new(format!("h{}:1", i), 1))).collect();
        let mut set = PrioritySet::default();
        set.update_hosts(0, &hosts, &[]);
        hosts[2].set_health(HealthState::Unhealthy);
        set.refresh_health();

        let lb = RandomLoadBalancer::new(&set, 50.0);
        for _ in 0..100 {
            let picked = lb.choose_host(&RequestContext::new()).unwrap();
            assert_ne!(picked.address(), "h2:1");
        }
    }
}
