//! Metadata subset load balancing.
//!
//! # Data Flow
//! ```text
//! membership delta (priority, added, removed)
//!     → for each host and each selector key set, the host's metadata tuples
//!     → trie.rs find_or_create (new tuples only when hosts are added)
//!     → host_subset.rs applies the delta to each touched subset, rebuilds
//!       its inner load balancer
//!     → subset_any / default subsets take every delta
//!
//! request metadata criteria
//!     → each selector: criteria filtered to its keys → trie lookup
//!     → active subset? choose from it : selector fallback
//!     → cluster fallback → panic_mode_any
//! ```
//!
//! # Design Decisions
//! - Subsets that become empty stay in the trie, marked inactive
//! - Subsets are created on the control loop when a host with a new tuple is
//!   added, never on the request path
//! - Default subsets are created up front, even when empty

pub mod host_subset;
pub mod selector;
pub mod trie;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{debug, trace};

use crate::load_balancer::{LoadBalancer, LoadBalancerContext, LoadBalancerFactory};
use crate::observability::metrics;
use crate::upstream::host::HostRef;
use crate::upstream::metadata::{describe_metadata, SubsetMetadata};
use crate::upstream::priority_set::PrioritySet;

pub use host_subset::PrioritySubset;
pub use selector::{
    validate_subset_config, ClusterFallback, SelectorFallback, SubsetSelector, SubsetSettings,
};
pub use trie::{extract_subset_metadata, SubsetEntry};

/// Subset engine counters.
#[derive(Debug, Default)]
pub struct SubsetStats {
    active: AtomicU64,
    created: AtomicU64,
    removed: AtomicU64,
    selected: AtomicU64,
    fallback: AtomicU64,
    fallback_panic: AtomicU64,
}

impl SubsetStats {
    pub fn active(&self) -> u64 {
        self.active.load(Ordering::Relaxed)
    }

    pub fn created(&self) -> u64 {
        self.created.load(Ordering::Relaxed)
    }

    pub fn removed(&self) -> u64 {
        self.removed.load(Ordering::Relaxed)
    }

    pub fn selected(&self) -> u64 {
        self.selected.load(Ordering::Relaxed)
    }

    pub fn fallback(&self) -> u64 {
        self.fallback.load(Ordering::Relaxed)
    }

    pub fn fallback_panic(&self) -> u64 {
        self.fallback_panic.load(Ordering::Relaxed)
    }

    fn activated(&self) {
        self.created.fetch_add(1, Ordering::Relaxed);
        let active = self.active.fetch_add(1, Ordering::Relaxed) + 1;
        metrics::record_subset_event("created");
        metrics::record_subsets_active(active);
    }

    fn deactivated(&self) {
        self.removed.fetch_add(1, Ordering::Relaxed);
        let active = self.active.fetch_sub(1, Ordering::Relaxed).saturating_sub(1);
        metrics::record_subset_event("removed");
        metrics::record_subsets_active(active);
    }

    fn count(&self, counter: &AtomicU64, event: &'static str) {
        counter.fetch_add(1, Ordering::Relaxed);
        metrics::record_subset_event(event);
    }
}

/// Immutable view of the subset engine; the published load balancer.
#[derive(Debug, Clone)]
pub struct SubsetSnapshot {
    root: Arc<SubsetEntry>,
    any: Arc<PrioritySubset>,
    defaults: Arc<HashMap<SubsetMetadata, Arc<PrioritySubset>>>,
    settings: Arc<SubsetSettings>,
    stats: Arc<SubsetStats>,
}

impl SubsetSnapshot {
    fn choose_from_trie(&self, kvs: &[(String, crate::upstream::MetadataValue)], context: &dyn LoadBalancerContext) -> Option<HostRef> {
        let entry = self.root.find(kvs)?;
        if !entry.is_active() {
            return None;
        }
        entry.subset()?.choose_host(context)
    }

    fn choose_from_default(&self, metadata: &SubsetMetadata, context: &dyn LoadBalancerContext) -> Option<HostRef> {
        let subset = self.defaults.get(metadata)?;
        if !subset.is_active() {
            return None;
        }
        subset.choose_host(context)
    }

    fn choose_for_selectors(&self, context: &dyn LoadBalancerContext) -> Option<HostRef> {
        let criteria = context.metadata_match_criteria()?;
        if criteria.is_empty() {
            return None;
        }
        for selector in &self.settings.selectors {
            let kvs = criteria.filter(selector.keys());
            if kvs.is_empty() {
                continue;
            }
            if let Some(host) = self.choose_from_trie(&kvs, context) {
                self.stats.count(&self.stats.selected, "selected");
                return Some(host);
            }
            trace!(subset = %describe_metadata(&kvs), "subset lb: no active subset");
            let fallback = match selector.fallback() {
                SelectorFallback::NoFallback => None,
                SelectorFallback::AnyEndpoint => self.any.choose_host(context),
                SelectorFallback::DefaultSubset(metadata) => self.choose_from_default(metadata, context),
                SelectorFallback::KeysSubset(keys) => {
                    let narrowed = criteria.filter(keys);
                    if narrowed.is_empty() {
                        None
                    } else {
                        self.choose_from_trie(&narrowed, context)
                    }
                }
            };
            if let Some(host) = fallback {
                self.stats.count(&self.stats.fallback, "fallback");
                return Some(host);
            }
        }
        None
    }
}

impl LoadBalancer for SubsetSnapshot {
    fn choose_host(&self, context: &dyn LoadBalancerContext) -> Option<HostRef> {
        if let Some(host) = self.choose_for_selectors(context) {
            return Some(host);
        }

        let fallback = match &self.settings.fallback {
            ClusterFallback::NoFallback => None,
            ClusterFallback::AnyEndpoint => self.any.choose_host(context),
            ClusterFallback::DefaultSubset(metadata) => self.choose_from_default(metadata, context),
        };
        if let Some(host) = fallback {
            self.stats.count(&self.stats.fallback, "fallback");
            return Some(host);
        }

        if self.settings.panic_mode_any {
            let host = self.any.choose_host(context);
            if host.is_some() {
                self.stats.count(&self.stats.fallback_panic, "fallback_panic");
            }
            return host;
        }
        None
    }
}

/// Control-side subset engine. Mutated only by the cluster control loop;
/// `snapshot` hands out immutable copies for request-time selection.
#[derive(Debug)]
pub struct SubsetLoadBalancer {
    state: SubsetSnapshot,
    factory: Arc<dyn LoadBalancerFactory>,
}

impl SubsetLoadBalancer {
    /// Build every subset the hosts of `original` belong to, plus the
    /// any-endpoint and default subsets.
    pub fn new(settings: SubsetSettings, original: &PrioritySet, factory: Arc<dyn LoadBalancerFactory>) -> Self {
        let any = PrioritySubset::new(Vec::new(), original, &settings, factory.as_ref());
        let defaults = settings
            .default_subsets()
            .into_iter()
            .map(|metadata| {
                debug!(subset = %describe_metadata(metadata), "subset lb: creating default subset");
                let subset = PrioritySubset::new(metadata.clone(), original, &settings, factory.as_ref());
                (metadata.clone(), Arc::new(subset))
            })
            .collect();

        let mut lb = Self {
            state: SubsetSnapshot {
                root: Arc::new(SubsetEntry::default()),
                any: Arc::new(any),
                defaults: Arc::new(defaults),
                settings: Arc::new(settings),
                stats: Arc::new(SubsetStats::default()),
            },
            factory,
        };
        for host_set in original.host_sets_per_priority() {
            lb.update_trie(host_set.priority(), host_set.hosts(), &[], original);
        }
        lb
    }

    pub fn settings(&self) -> &SubsetSettings {
        &self.state.settings
    }

    pub fn stats(&self) -> &Arc<SubsetStats> {
        &self.state.stats
    }

    pub fn root(&self) -> &SubsetEntry {
        &self.state.root
    }

    /// Immutable copy for request-time selection.
    pub fn snapshot(&self) -> Arc<dyn LoadBalancer> {
        Arc::new(self.state.clone())
    }

    /// Apply a membership delta that `original` already reflects.
    pub fn update(&mut self, priority: u32, added: &[HostRef], removed: &[HostRef], original: &PrioritySet) {
        let settings = self.state.settings.clone();
        let factory = self.factory.clone();

        let any = Arc::make_mut(&mut self.state.any);
        any.update(priority, added, removed, original, &settings);
        any.rebuild(factory.as_ref());

        for subset in Arc::make_mut(&mut self.state.defaults).values_mut() {
            let subset = Arc::make_mut(subset);
            subset.update(priority, added, removed, original, &settings);
            subset.rebuild(factory.as_ref());
        }

        self.update_trie(priority, added, removed, original);
    }

    /// Recompute every subset after health or weight changes.
    pub fn refresh(&mut self, original: &PrioritySet) {
        let settings = self.state.settings.clone();
        let factory = self.factory.clone();
        let mut refresh = |subset: &mut PrioritySubset| {
            subset.refresh(original, &settings);
            subset.rebuild(factory.as_ref());
        };

        refresh(Arc::make_mut(&mut self.state.any));
        for subset in Arc::make_mut(&mut self.state.defaults).values_mut() {
            refresh(Arc::make_mut(subset));
        }
        Arc::make_mut(&mut self.state.root).for_each_subset_mut(&mut refresh);
    }

    fn update_trie(&mut self, priority: u32, added: &[HostRef], removed: &[HostRef], original: &PrioritySet) {
        let settings = self.state.settings.clone();
        let factory = self.factory.clone();
        let stats = self.state.stats.clone();
        let root = Arc::make_mut(&mut self.state.root);
        let mut touched: HashSet<SubsetMetadata> = HashSet::new();

        let delta = added
            .iter()
            .map(|h| (h, true))
            .chain(removed.iter().map(|h| (h, false)));
        for (host, adding) in delta {
            for keys in settings.trie_key_sets() {
                for kvs in extract_subset_metadata(keys, host, settings.list_as_any) {
                    if !touched.insert(kvs.clone()) {
                        continue;
                    }
                    let entry = if adding {
                        Some(root.find_or_create(&kvs))
                    } else {
                        root.find_mut(&kvs)
                    };
                    let Some(entry) = entry else {
                        continue;
                    };

                    match entry.subset_mut() {
                        Some(subset) => {
                            let was_active = subset.is_active();
                            subset.update(priority, added, removed, original, &settings);
                            subset.rebuild(factory.as_ref());
                            match (was_active, subset.is_active()) {
                                (true, false) => {
                                    debug!(subset = %describe_metadata(&kvs), "subset lb: subset emptied");
                                    stats.deactivated();
                                }
                                (false, true) => {
                                    debug!(subset = %describe_metadata(&kvs), "subset lb: subset reactivated");
                                    stats.activated();
                                }
                                _ => {}
                            }
                        }
                        None if adding => {
                            debug!(subset = %describe_metadata(&kvs), "subset lb: creating subset");
                            let subset = PrioritySubset::new(kvs.clone(), original, &settings, factory.as_ref());
                            if subset.is_active() {
                                stats.activated();
                            }
                            entry.set_subset(subset);
                        }
                        None => {}
                    }
                }
            }
        }
    }
}

impl LoadBalancer for SubsetLoadBalancer {
    fn choose_host(&self, context: &dyn LoadBalancerContext) -> Option<HostRef> {
        self.state.choose_host(context)
    }
}
