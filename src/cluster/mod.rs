//! Upstream clusters and their control loop.
//!
//! # Data Flow
//! ```text
//! ClusterUpdate (membership, static host list, config)   HealthChecker
//!     │                                                       │
//!     └──────────────────▶ Cluster::run (control task) ◀──────┘
//!                              → PrioritySet mutation
//!                              → strategy or subset rebuild
//!                              → ArcSwap<ClusterSnapshot> store
//!
//! Workers: ClusterHandle::choose_host → snapshot load → LoadBalancer
//! ```
//!
//! # Design Decisions
//! - Exactly one task mutates a cluster; workers only read snapshots
//! - Every membership, health or weight change publishes a new snapshot
//! - A configuration update is validated in full before anything changes

pub mod discovery;
pub mod manager;

use std::collections::BTreeMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

use crate::config::schema::{ClusterConfig, HostConfig};
use crate::config::validation::validate_cluster;
use crate::error::ConfigError;
use crate::health::{HealthChecker, HealthTransition, ProbeTransportRegistry};
use crate::load_balancer::subset::{SubsetLoadBalancer, SubsetSettings};
use crate::load_balancer::{
    EmptyLoadBalancer, LoadBalancer, LoadBalancerContext, LoadBalancerFactory, LoadBalancerType,
    StrategyFactory,
};
use crate::upstream::host::{HealthState, HostRef, Locality};
use crate::upstream::priority_set::PrioritySet;

use discovery::{diff_hosts, locality_weights_by_priority, HostDiff};

pub use discovery::{build_host, MembershipUpdate};
pub use manager::ClusterManager;

/// Input to a cluster's control loop.
#[derive(Debug)]
pub enum ClusterUpdate {
    /// Endpoint discovery delta. `removed` holds addresses.
    Membership {
        priority: u32,
        added: Vec<HostRef>,
        removed: Vec<String>,
    },
    /// Replace the static host list.
    Hosts(Vec<HostConfig>),
    /// Replace the whole cluster configuration.
    Config(Box<ClusterConfig>),
    /// Stop the control loop.
    Stop,
}

/// What workers select from.
#[derive(Debug)]
pub struct ClusterSnapshot {
    pub version: u64,
    pub priority_set: PrioritySet,
    pub load_balancer: Arc<dyn LoadBalancer>,
}

impl ClusterSnapshot {
    fn empty() -> Self {
        Self {
            version: 0,
            priority_set: PrioritySet::default(),
            load_balancer: Arc::new(EmptyLoadBalancer),
        }
    }
}

/// Cheap, cloneable reader and update sender for one cluster.
#[derive(Debug, Clone)]
pub struct ClusterHandle {
    name: Arc<str>,
    snapshot: Arc<ArcSwap<ClusterSnapshot>>,
    updates: mpsc::UnboundedSender<ClusterUpdate>,
}

impl ClusterHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Pick a host from the latest published snapshot. Lock free.
    pub fn choose_host(&self, context: &dyn LoadBalancerContext) -> Option<HostRef> {
        self.snapshot.load().load_balancer.choose_host(context)
    }

    pub fn snapshot(&self) -> Arc<ClusterSnapshot> {
        self.snapshot.load_full()
    }

    /// Queue an update for the control loop. False once the loop has exited.
    pub fn send(&self, update: ClusterUpdate) -> bool {
        self.updates.send(update).is_ok()
    }
}

/// Balancing strategy of a cluster.
#[derive(Debug)]
enum ClusterLoadBalancer {
    Plain(StrategyFactory),
    Subset(SubsetLoadBalancer),
}

impl ClusterLoadBalancer {
    fn build(config: &ClusterConfig, priority_set: &PrioritySet) -> Result<Self, ConfigError> {
        let strategy = StrategyFactory::new(LoadBalancerType::from_config(config), config.common.clone())?;
        Ok(match &config.subset {
            Some(subset) => {
                let settings = SubsetSettings::from_config(subset)?;
                ClusterLoadBalancer::Subset(SubsetLoadBalancer::new(settings, priority_set, Arc::new(strategy)))
            }
            None => ClusterLoadBalancer::Plain(strategy),
        })
    }

    fn on_membership(&mut self, priority: u32, added: &[HostRef], removed: &[HostRef], priority_set: &PrioritySet) {
        if let ClusterLoadBalancer::Subset(lb) = self {
            lb.update(priority, added, removed, priority_set);
        }
    }

    fn on_refresh(&mut self, priority_set: &PrioritySet) {
        if let ClusterLoadBalancer::Subset(lb) = self {
            lb.refresh(priority_set);
        }
    }

    fn snapshot(&self, priority_set: &PrioritySet) -> Arc<dyn LoadBalancer> {
        match self {
            ClusterLoadBalancer::Plain(factory) => factory.create(priority_set),
            ClusterLoadBalancer::Subset(lb) => lb.snapshot(),
        }
    }
}

/// One upstream cluster, owned by its control loop.
#[derive(Debug)]
pub struct Cluster {
    name: Arc<str>,
    config: ClusterConfig,
    priority_set: PrioritySet,
    lb: ClusterLoadBalancer,
    health_checker: Option<HealthChecker>,
    transports: ProbeTransportRegistry,
    snapshot: Arc<ArcSwap<ClusterSnapshot>>,
    version: u64,
    updates_tx: mpsc::UnboundedSender<ClusterUpdate>,
    updates_rx: mpsc::UnboundedReceiver<ClusterUpdate>,
}

impl Cluster {
    /// Build a cluster from a validated configuration, including its static
    /// hosts, and publish the first snapshot. Health checks start probing once
    /// `run` is polled.
    pub fn new(config: ClusterConfig, transports: ProbeTransportRegistry) -> Result<Self, ConfigError> {
        validate_cluster(&config).map_err(ConfigError::Validation)?;

        let priority_set = PrioritySet::new(config.common.overprovisioning_factor);
        let health_checker = build_health_checker(&config, &transports)?;
        let lb = ClusterLoadBalancer::build(&config, &priority_set)?;
        let (updates_tx, updates_rx) = mpsc::unbounded_channel();

        let mut cluster = Self {
            name: Arc::from(config.name.as_str()),
            config: ClusterConfig::default(),
            priority_set,
            lb,
            health_checker,
            transports,
            snapshot: Arc::new(ArcSwap::from_pointee(ClusterSnapshot::empty())),
            version: 0,
            updates_tx,
            updates_rx,
        };
        cluster.apply_locality_weights(&config);
        let hosts = config.hosts.clone();
        cluster.config = config;
        cluster.apply_diff(diff_hosts(&cluster.priority_set, &hosts));
        cluster.publish();

        info!(
            cluster = %cluster.name,
            hosts = cluster.priority_set.all_hosts().count(),
            priorities = cluster.priority_set.host_sets_per_priority().len(),
            "Cluster initialized"
        );
        Ok(cluster)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    pub fn priority_set(&self) -> &PrioritySet {
        &self.priority_set
    }

    pub fn health_checker(&self) -> Option<&HealthChecker> {
        self.health_checker.as_ref()
    }

    pub fn subset_load_balancer(&self) -> Option<&SubsetLoadBalancer> {
        match &self.lb {
            ClusterLoadBalancer::Subset(lb) => Some(lb),
            ClusterLoadBalancer::Plain(_) => None,
        }
    }

    pub fn handle(&self) -> ClusterHandle {
        ClusterHandle {
            name: self.name.clone(),
            snapshot: self.snapshot.clone(),
            updates: self.updates_tx.clone(),
        }
    }

    /// Latest published snapshot.
    pub fn snapshot(&self) -> Arc<ClusterSnapshot> {
        self.snapshot.load_full()
    }

    pub fn choose_host(&self, context: &dyn LoadBalancerContext) -> Option<HostRef> {
        self.snapshot.load().load_balancer.choose_host(context)
    }

    /// Apply a discovery delta. `removed` holds addresses; an added host whose
    /// address is already present at `priority` replaces it.
    pub fn on_membership_change(&mut self, priority: u32, added: Vec<HostRef>, removed: &[String]) {
        let removed = match self.priority_set.host_set(priority) {
            Some(host_set) => removed
                .iter()
                .map(String::as_str)
                .chain(added.iter().map(|h| h.address()))
                .filter_map(|address| host_set.find(address).cloned())
                .collect(),
            None => Vec::new(),
        };
        self.apply_diff(HostDiff {
            updates: vec![MembershipUpdate {
                priority,
                added,
                removed,
            }],
            weight_changes: Vec::new(),
        });
        self.publish();
    }

    /// Make the static host list the cluster's membership.
    pub fn set_hosts(&mut self, hosts: &[HostConfig]) {
        let diff = diff_hosts(&self.priority_set, hosts);
        if diff.is_empty() {
            return;
        }
        self.apply_diff(diff);
        self.config.hosts = hosts.to_vec();
        self.publish();
    }

    /// Recompute partitions and rebuild after health checks flipped hosts.
    pub fn on_health_transitions(&mut self, transitions: &[HealthTransition]) {
        if !transitions.iter().any(|t| t.aggregate_changed) {
            return;
        }
        for t in transitions {
            debug!(cluster = %self.name, host = %t.host.address(), check = t.check, from = %t.from, to = %t.to, "Health transition");
        }
        self.refresh();
    }

    /// Change one host's weight without membership churn.
    pub fn update_host_weight(&mut self, address: &str, weight: u32) -> bool {
        let changed = self
            .priority_set
            .find_host(address)
            .map(|(_, host)| host.set_weight(weight))
            .unwrap_or(false);
        if changed {
            self.refresh();
        }
        changed
    }

    pub fn set_locality_weights(&mut self, priority: u32, weights: BTreeMap<Locality, u32>) {
        self.priority_set.set_locality_weights(priority, weights);
        self.refresh();
    }

    /// Replace the configuration. Everything that can fail is built before the
    /// running state is touched; on error the old configuration stays active.
    pub async fn apply_config(&mut self, config: ClusterConfig) -> Result<(), ConfigError> {
        validate_cluster(&config).map_err(ConfigError::Validation)?;
        let checks_changed = config.health_checks != self.config.health_checks;
        let new_checker = if checks_changed {
            build_health_checker(&config, &self.transports)?
        } else {
            None
        };
        // Validates the strategy and subset settings against the current hosts.
        ClusterLoadBalancer::build(&config, &self.priority_set)?;

        if checks_changed {
            let old_count = self.health_checker.as_ref().map(HealthChecker::check_count).unwrap_or(0);
            if let Some(mut old) = self.health_checker.take() {
                old.shutdown().await;
            }
            let new_count = new_checker.as_ref().map(HealthChecker::check_count).unwrap_or(0);
            let hosts: Vec<HostRef> = self.priority_set.all_hosts().cloned().collect();
            for host in &hosts {
                for check in new_count..old_count {
                    host.set_check_state(check, HealthState::Healthy);
                }
            }
            self.health_checker = new_checker;
            if let Some(checker) = &mut self.health_checker {
                checker.adopt_hosts(&hosts);
            }
        }

        if config.common.overprovisioning_factor != self.priority_set.overprovisioning_factor() {
            self.priority_set = rebuild_priority_set(&self.priority_set, config.common.overprovisioning_factor);
        }
        self.apply_locality_weights(&config);
        let diff = diff_hosts(&self.priority_set, &config.hosts);
        self.apply_diff(diff);
        self.priority_set.refresh_health();

        self.lb = ClusterLoadBalancer::build(&config, &self.priority_set)?;
        self.config = config;
        self.publish();
        info!(cluster = %self.name, version = self.version, "Cluster configuration applied");
        Ok(())
    }

    /// Control loop. Exits on shutdown or `ClusterUpdate::Stop`, after
    /// stopping health checks.
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        info!(cluster = %self.name, "Cluster control loop started");
        loop {
            tokio::select! {
                update = self.updates_rx.recv() => {
                    match update {
                        Some(ClusterUpdate::Stop) | None => break,
                        Some(update) => self.handle_update(update).await,
                    }
                }
                transitions = next_transitions(self.health_checker.as_mut()) => {
                    self.on_health_transitions(&transitions);
                }
                _ = shutdown.recv() => {
                    info!(cluster = %self.name, "Cluster received shutdown signal, exiting loop");
                    break;
                }
            }
        }
        if let Some(checker) = &mut self.health_checker {
            checker.shutdown().await;
        }
        info!(cluster = %self.name, "Cluster control loop stopped");
    }

    async fn handle_update(&mut self, update: ClusterUpdate) {
        match update {
            ClusterUpdate::Membership {
                priority,
                added,
                removed,
            } => self.on_membership_change(priority, added, &removed),
            ClusterUpdate::Hosts(hosts) => self.set_hosts(&hosts),
            ClusterUpdate::Config(config) => {
                if let Err(e) = self.apply_config(*config).await {
                    error!(cluster = %self.name, error = %e, "Rejected cluster configuration, keeping current");
                }
            }
            ClusterUpdate::Stop => {}
        }
    }

    /// Apply membership deltas: all removals leave the health checker before
    /// any addition joins it. A host moving between priorities is removed and
    /// re-added, so it gets a fresh session rather than a cancelled one.
    fn apply_diff(&mut self, diff: HostDiff) {
        if let Some(checker) = &mut self.health_checker {
            for update in &diff.updates {
                checker.remove_hosts(&update.removed);
            }
            for update in &diff.updates {
                checker.add_hosts(&update.added);
            }
        }
        for update in &diff.updates {
            if update.is_empty() {
                continue;
            }
            debug!(
                cluster = %self.name,
                priority = update.priority,
                added = update.added.len(),
                removed = update.removed.len(),
                "Membership update"
            );
            self.priority_set
                .update_hosts(update.priority, &update.added, &update.removed);
            self.lb
                .on_membership(update.priority, &update.added, &update.removed, &self.priority_set);
        }
        let mut weights_changed = false;
        for (host, weight) in &diff.weight_changes {
            weights_changed |= host.set_weight(*weight);
        }
        if weights_changed {
            self.lb.on_refresh(&self.priority_set);
        }
    }

    fn apply_locality_weights(&mut self, config: &ClusterConfig) {
        let mut by_priority = locality_weights_by_priority(&config.locality_weights);
        let levels = self.priority_set.host_sets_per_priority().len() as u32;
        let highest = by_priority.keys().next_back().map(|p| p + 1).unwrap_or(0);
        for priority in 0..levels.max(highest) {
            let weights = by_priority.remove(&priority).unwrap_or_default();
            let current = self
                .priority_set
                .host_set(priority)
                .map(|hs| hs.configured_locality_weights() == &weights)
                .unwrap_or(false);
            if !current {
                self.priority_set.set_locality_weights(priority, weights);
            }
        }
    }

    fn refresh(&mut self) {
        self.priority_set.refresh_health();
        self.lb.on_refresh(&self.priority_set);
        self.publish();
    }

    fn publish(&mut self) {
        self.version += 1;
        let snapshot = ClusterSnapshot {
            version: self.version,
            priority_set: self.priority_set.clone(),
            load_balancer: self.lb.snapshot(&self.priority_set),
        };
        self.snapshot.store(Arc::new(snapshot));
        debug!(cluster = %self.name, version = self.version, "Published cluster snapshot");
    }
}

fn build_health_checker(
    config: &ClusterConfig,
    transports: &ProbeTransportRegistry,
) -> Result<Option<HealthChecker>, ConfigError> {
    if config.health_checks.is_empty() {
        return Ok(None);
    }
    HealthChecker::from_config(&config.health_checks, transports).map(Some)
}

fn rebuild_priority_set(old: &PrioritySet, overprovisioning_factor: u32) -> PrioritySet {
    warn!(overprovisioning_factor, "Rebuilding priority set for new overprovisioning factor");
    let mut priority_set = PrioritySet::new(overprovisioning_factor);
    for host_set in old.host_sets_per_priority() {
        priority_set.update_hosts(host_set.priority(), host_set.hosts(), &[]);
        priority_set.set_locality_weights(host_set.priority(), host_set.configured_locality_weights().clone());
    }
    priority_set
}

async fn next_transitions(checker: Option<&mut HealthChecker>) -> Vec<HealthTransition> {
    match checker {
        Some(checker) => checker.next_transitions().await,
        None => std::future::pending().await,
    }
}
