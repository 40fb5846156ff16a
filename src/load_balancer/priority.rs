//! Priority load and panic policy shared by every balancing strategy.
//!
//! # Responsibilities
//! - Spread traffic across priority levels by their available capacity
//! - Decide per priority whether to select from healthy hosts or, in panic,
//!   from all hosts
//! - Give each strategy one prebuilt structure per (priority, host source)
//!
//! The state is computed when a load balancer snapshot is built. Snapshots are
//! rebuilt on every health or membership change, so the panic decision always
//! reflects the current partitions.

use crate::upstream::host::HostRef;
use crate::upstream::host_set::{HostSet, HostsPerLocality};
use crate::upstream::priority_set::PrioritySet;

/// Which partition of a priority a request was routed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostAvailability {
    Healthy,
    Degraded,
}

/// Partition of a host set a strategy draws from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostsSource {
    AllHosts,
    HealthyHosts,
    DegradedHosts,
}

impl HostsSource {
    pub fn hosts(self, host_set: &HostSet) -> &[HostRef] {
        match self {
            HostsSource::AllHosts => host_set.hosts(),
            HostsSource::HealthyHosts => host_set.healthy_hosts(),
            HostsSource::DegradedHosts => host_set.degraded_hosts(),
        }
    }

    pub fn hosts_per_locality(self, host_set: &HostSet) -> &HostsPerLocality {
        match self {
            HostsSource::AllHosts => host_set.hosts_per_locality(),
            HostsSource::HealthyHosts => host_set.healthy_hosts_per_locality(),
            HostsSource::DegradedHosts => host_set.degraded_hosts_per_locality(),
        }
    }
}

/// Percentage of traffic sent to each priority, split by availability.
/// Entries across both vectors sum to 100.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PriorityLoad {
    pub healthy: Vec<u32>,
    pub degraded: Vec<u32>,
}

/// A host set panics when fewer than `threshold` percent of its hosts are
/// healthy or degraded. An empty host set always panics (unless the
/// threshold is zero).
pub fn is_host_set_in_panic(host_set: &HostSet, threshold: f64) -> bool {
    let total = host_set.hosts().len();
    let available = host_set.healthy_hosts().len() + host_set.degraded_hosts().len();
    let percent = if total == 0 {
        0.0
    } else {
        100.0 * available as f64 / total as f64
    };
    percent < threshold
}

#[derive(Debug, Clone, Default)]
pub struct PriorityState {
    load: PriorityLoad,
    panic: Vec<bool>,
}

impl PriorityState {
    pub fn compute(priority_set: &PrioritySet, panic_threshold: f64) -> Self {
        let host_sets = priority_set.host_sets_per_priority();
        let levels = host_sets.len().max(1);

        let mut health = vec![0u32; levels];
        let mut degraded = vec![0u32; levels];
        for (i, host_set) in host_sets.iter().enumerate() {
            let total = host_set.hosts().len() as u64;
            if total == 0 {
                continue;
            }
            let factor = u64::from(host_set.overprovisioning_factor());
            health[i] = (factor * host_set.healthy_hosts().len() as u64 / total).min(100) as u32;
            degraded[i] = (factor * host_set.degraded_hosts().len() as u64 / total).min(100) as u32;
        }

        let total_availability = (health.iter().sum::<u32>() + degraded.iter().sum::<u32>()).min(100);

        let mut load = PriorityLoad {
            healthy: vec![0; levels],
            degraded: vec![0; levels],
        };

        if total_availability == 0 {
            // Nothing is available; everything panics and the first populated
            // priority takes all traffic.
            let target = host_sets
                .iter()
                .position(|hs| !hs.is_empty())
                .unwrap_or(0);
            load.healthy[target] = 100;
            return Self {
                load,
                panic: vec![true; levels],
            };
        }

        let mut remaining = 100u32;
        let mut first_available: Option<(usize, HostAvailability)> = None;
        for (i, h) in health.iter().enumerate() {
            let share = remaining.min(h * 100 / total_availability);
            load.healthy[i] = share;
            remaining -= share;
            if share > 0 && first_available.is_none() {
                first_available = Some((i, HostAvailability::Healthy));
            }
        }
        for (i, d) in degraded.iter().enumerate() {
            let share = remaining.min(d * 100 / total_availability);
            load.degraded[i] = share;
            remaining -= share;
            if share > 0 && first_available.is_none() {
                first_available = Some((i, HostAvailability::Degraded));
            }
        }
        // Rounding leftovers go to the first priority that receives traffic.
        if remaining > 0 {
            match first_available {
                Some((i, HostAvailability::Healthy)) => load.healthy[i] += remaining,
                Some((i, HostAvailability::Degraded)) => load.degraded[i] += remaining,
                None => load.healthy[0] += remaining,
            }
        }

        let panic = (0..levels)
            .map(|i| {
                // Spilling to lower priorities is preferred over panicking.
                total_availability < 100
                    && host_sets
                        .get(i)
                        .map(|hs| is_host_set_in_panic(hs, panic_threshold))
                        .unwrap_or(true)
            })
            .collect();

        Self { load, panic }
    }

    pub fn load(&self) -> &PriorityLoad {
        &self.load
    }

    pub fn is_panic(&self, priority: usize) -> bool {
        self.panic.get(priority).copied().unwrap_or(true)
    }

    /// Map a hash onto the load table. `hash % 100` walks the healthy loads
    /// first, then the degraded loads.
    pub fn choose_priority(&self, hash: u64) -> (usize, HostAvailability) {
        let point = (hash % 100) as u32 + 1;
        let mut aggregate = 0;
        for (i, load) in self.load.healthy.iter().enumerate() {
            aggregate += load;
            if point <= aggregate {
                return (i, HostAvailability::Healthy);
            }
        }
        for (i, load) in self.load.degraded.iter().enumerate() {
            aggregate += load;
            if point <= aggregate {
                return (i, HostAvailability::Degraded);
            }
        }
        (0, HostAvailability::Healthy)
    }
}

/// Per-priority structures a strategy selects from.
#[derive(Debug)]
pub struct PriorityLevel<T> {
    /// Built from healthy hosts, or from all hosts when the priority panics.
    pub primary: T,
    /// Built from degraded hosts; `None` in panic.
    pub degraded: Option<T>,
}

/// Priority state plus one prebuilt structure per level.
#[derive(Debug)]
pub struct PriorityTable<T> {
    state: PriorityState,
    levels: Vec<PriorityLevel<T>>,
}

impl<T> PriorityTable<T> {
    pub fn build<F>(priority_set: &PrioritySet, panic_threshold: f64, mut build: F) -> Self
    where
        F: FnMut(&HostSet, HostsSource) -> T,
    {
        let state = PriorityState::compute(priority_set, panic_threshold);
        let levels = priority_set
            .host_sets_per_priority()
            .iter()
            .enumerate()
            .map(|(i, host_set)| {
                if state.is_panic(i) {
                    PriorityLevel {
                        primary: build(host_set, HostsSource::AllHosts),
                        degraded: None,
                    }
                } else {
                    PriorityLevel {
                        primary: build(host_set, HostsSource::HealthyHosts),
                        degraded: Some(build(host_set, HostsSource::DegradedHosts)),
                    }
                }
            })
            .collect();
        Self { state, levels }
    }

    pub fn state(&self) -> &PriorityState {
        &self.state
    }

    pub fn levels(&self) -> &[PriorityLevel<T>] {
        &self.levels
    }

    /// Structure to select from for a request whose priority hash is `hash`.
    pub fn pick(&self, hash: u64) -> Option<&T> {
        let (priority, availability) = self.state.choose_priority(hash);
        let level = self.levels.get(priority)?;
        match availability {
            HostAvailability::Healthy => Some(&level.primary),
            HostAvailability::Degraded => Some(level.degraded.as_ref().unwrap_or(&level.primary)),
        }
    }
}
