//! Weighted round-robin load balancing strategy.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::load_balancer::priority::PriorityTable;
use crate::load_balancer::{priority_hash, LoadBalancer, LoadBalancerContext};
use crate::upstream::host::HostRef;
use crate::upstream::priority_set::PrioritySet;

/// Hosts of one partition with a rotating cursor.
/// A host of weight `w` is returned `w` times per rotation.
#[derive(Debug)]
pub struct RoundRobinList {
    hosts: Vec<HostRef>,
    /// Running weight totals; `cumulative[i]` ends host `i`'s slots.
    cumulative: Vec<u64>,
    counter: AtomicU64,
}

impl RoundRobinList {
    pub fn new(hosts: &[HostRef]) -> Self {
        let mut total = 0;
        let cumulative = hosts
            .iter()
            .map(|h| {
                total += u64::from(h.weight());
                total
            })
            .collect();
        Self {
            hosts: hosts.to_vec(),
            cumulative,
            counter: AtomicU64::new(0),
        }
    }

    pub fn next(&self) -> Option<HostRef> {
        let total = *self.cumulative.last()?;
        let slot = self.counter.fetch_add(1, Ordering::Relaxed) % total;
        let index = self.cumulative.partition_point(|end| *end <= slot);
        self.hosts.get(index).cloned()
    }
}

/// Round-robin selector.
#[derive(Debug)]
pub struct RoundRobinLoadBalancer {
    table: PriorityTable<RoundRobinList>,
}

impl RoundRobinLoadBalancer {
    pub fn new(priority_set: &PrioritySet, panic_threshold: f64) -> Self {
        Self {
            table: PriorityTable::build(priority_set, panic_threshold, |host_set, source| {
                RoundRobinList::new(source.hosts(host_set))
            }),
        }
    }
}

impl LoadBalancer for RoundRobinLoadBalancer {
    fn choose_host(&self, context: &dyn LoadBalancerContext) -> Option<HostRef> {
        self.table.pick(priority_hash(context))?.next()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::load_balancer::RequestContext;
    use crate::upstream::host::Host;
    use std::sync::Arc;

    #[test]
    fn test_round_robin() {
        let b1 = Arc::new(Host::new("127.0.0.1:8080", 1));
        let b2 = Arc::new(Host::new("127.0.0.1:8081", 1));
        let mut set = PrioritySet::default();
        set.update_hosts(0, &[b1.clone(), b2.clone()], &[]);
        let lb = RoundRobinLoadBalancer::new(&set, 50.0);
        let ctx = RequestContext::new();

        let s1 = lb.choose_host(&ctx).unwrap();
        assert_eq!(s1.address(), b1.address());

        let s2 = lb.choose_host(&ctx).unwrap();
        assert_eq!(s2.address(), b2.address());

        let s3 = lb.choose_host(&ctx).unwrap();
        assert_eq!(s3.address(), b1.address());
    }

    #[test]
    fn test_weights_respected() {
        let heavy = Arc::new(Host::new("a:1", 3));
        let light = Arc::new(Host::new("b:1", 1));
        let list = RoundRobinList::new(&[heavy, light]);
        let picks: Vec<String> = (0..8).map(|_| list.next().unwrap().address().to_string()).collect();
        assert_eq!(picks.iter().filter(|a| *a == "a:1").count(), 6);
        assert_eq!(picks.iter().filter(|a| *a == "b:1").count(), 2);
    }

    #[test]
    fn test_empty_list() {
        assert!(RoundRobinList::new(&[]).next().is_none());
    }
}
