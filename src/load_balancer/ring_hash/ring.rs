//! Consistent hashing ring.
//!
//! # Responsibilities
//! - Normalize host weights (optionally per locality) so they sum to 1
//! - Scale them so the lightest host gets a whole number of entries
//! - Emit `"{address}_{i}"` keys, hash them, and sort by hash
//! - Map a request hash to the first entry at or after it, wrapping around
//!
//! A built ring is immutable. Rebuilding produces a new ring; lookups in
//! flight keep using the old one until they drop it.

use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{debug, trace};

use crate::config::schema::RingHashConfig;
use crate::error::ConfigError;
use crate::load_balancer::priority::HostsSource;
use crate::load_balancer::ring_hash::hash::hash_key;
use crate::load_balancer::ring_hash::validate_ring_hash;
use crate::upstream::host::HostRef;
use crate::upstream::host_set::{HostSet, HostsPerLocality};

/// Host paired with its share of the ring.
pub type NormalizedHostWeight = (HostRef, f64);

#[derive(Debug, Clone)]
pub struct RingEntry {
    pub hash: u64,
    pub host: HostRef,
}

/// Diagnostics from the most recent ring build.
#[derive(Debug, Default)]
pub struct RingStats {
    size: AtomicU64,
    min_hashes_per_host: AtomicU64,
    max_hashes_per_host: AtomicU64,
    builds: AtomicU64,
}

impl RingStats {
    pub fn record(&self, ring: &Ring) {
        self.size.store(ring.len() as u64, Ordering::Relaxed);
        self.min_hashes_per_host
            .store(ring.min_hashes_per_host(), Ordering::Relaxed);
        self.max_hashes_per_host
            .store(ring.max_hashes_per_host(), Ordering::Relaxed);
        self.builds.fetch_add(1, Ordering::Relaxed);
    }

    pub fn size(&self) -> u64 {
        self.size.load(Ordering::Relaxed)
    }

    pub fn min_hashes_per_host(&self) -> u64 {
        self.min_hashes_per_host.load(Ordering::Relaxed)
    }

    pub fn max_hashes_per_host(&self) -> u64 {
        self.max_hashes_per_host.load(Ordering::Relaxed)
    }

    pub fn builds(&self) -> u64 {
        self.builds.load(Ordering::Relaxed)
    }
}

fn normalize_host_weights(
    hosts: &[HostRef],
    locality_share: f64,
    out: &mut Vec<NormalizedHostWeight>,
    min_weight: &mut f64,
) {
    let sum: u64 = hosts.iter().map(|h| u64::from(h.weight())).sum();
    if sum == 0 {
        return;
    }
    for host in hosts {
        let weight = f64::from(host.weight()) * locality_share / sum as f64;
        out.push((host.clone(), weight));
        *min_weight = min_weight.min(weight);
    }
}

fn normalize_locality_weights(
    hosts_per_locality: &HostsPerLocality,
    locality_weights: &[u32],
    out: &mut Vec<NormalizedHostWeight>,
    min_weight: &mut f64,
) {
    // Localities without hosts would take a share nobody can serve.
    let sum: u64 = locality_weights
        .iter()
        .zip(hosts_per_locality.get())
        .filter(|(_, hosts)| !hosts.is_empty())
        .map(|(w, _)| u64::from(*w))
        .sum();
    if sum == 0 {
        return;
    }
    for (weight, hosts) in locality_weights.iter().zip(hosts_per_locality.get()) {
        if *weight == 0 || hosts.is_empty() {
            continue;
        }
        let share = f64::from(*weight) / sum as f64;
        normalize_host_weights(hosts, share, out, min_weight);
    }
}

/// Normalize weights of `source` hosts so they sum to 1.
///
/// With locality weights, each locality first gets its share of 1 and hosts
/// split that share by weight. Zero-weight localities are skipped; if every
/// locality weight is zero the result is empty. Returns the weights and the
/// smallest one.
pub fn normalize_weights(host_set: &HostSet, source: HostsSource) -> (Vec<NormalizedHostWeight>, f64) {
    let mut out = Vec::new();
    let mut min_weight = 1.0;
    match host_set.locality_weights() {
        Some(weights) if !weights.is_empty() => normalize_locality_weights(
            source.hosts_per_locality(host_set),
            weights,
            &mut out,
            &mut min_weight,
        ),
        _ => normalize_host_weights(source.hosts(host_set), 1.0, &mut out, &mut min_weight),
    }
    (out, min_weight)
}

/// Immutable sorted ring.
#[derive(Debug, Default)]
pub struct Ring {
    entries: Vec<RingEntry>,
    min_hashes_per_host: u64,
    max_hashes_per_host: u64,
}

impl Ring {
    /// Build a ring over the `source` partition of `host_set`.
    pub fn new(host_set: &HostSet, source: HostsSource, config: &RingHashConfig) -> Result<Self, ConfigError> {
        validate_ring_hash(config)?;
        let (weights, min_weight) = normalize_weights(host_set, source);
        Ok(Self::from_normalized(&weights, min_weight, config))
    }

    /// Build from already normalized weights. `config` must have been validated.
    pub fn from_normalized(weights: &[NormalizedHostWeight], min_weight: f64, config: &RingHashConfig) -> Self {
        trace!("ring hash: building ring");
        if weights.is_empty() {
            return Self::default();
        }

        let min_ring_size = config.minimum_ring_size as f64;
        let max_ring_size = config.maximum_ring_size as f64;
        let scale = ((min_weight * min_ring_size).ceil() / min_weight).min(max_ring_size);
        let ring_size = scale.ceil() as u64;

        // Accumulated float error may add one entry past `ring_size`; every
        // host still gets at least one.
        let mut entries = Vec::with_capacity(ring_size as usize + 1);
        let mut current_hashes = 0.0;
        let mut target_hashes = 0.0;
        let mut min_hashes_per_host = ring_size;
        let mut max_hashes_per_host = 0;

        for (host, weight) in weights {
            let address = host.address();
            let mut key = String::with_capacity(address.len() + 21);
            target_hashes += scale * weight;
            let mut i: u64 = 0;
            while current_hashes < target_hashes {
                key.clear();
                key.push_str(address);
                key.push('_');
                key.push_str(&i.to_string());
                let hash = hash_key(config.hash_function, key.as_bytes());
                trace!(hash_key = %key, hash, "ring hash: entry");
                entries.push(RingEntry {
                    hash,
                    host: host.clone(),
                });
                i += 1;
                current_hashes += 1.0;
            }
            min_hashes_per_host = min_hashes_per_host.min(i);
            max_hashes_per_host = max_hashes_per_host.max(i);
        }

        entries.sort_by_key(|e| e.hash);

        debug!(
            ring_size = entries.len(),
            min_hashes_per_host,
            max_hashes_per_host,
            "ring hash: ring built"
        );

        Self {
            entries,
            min_hashes_per_host,
            max_hashes_per_host,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[RingEntry] {
        &self.entries
    }

    pub fn min_hashes_per_host(&self) -> u64 {
        self.min_hashes_per_host
    }

    pub fn max_hashes_per_host(&self) -> u64 {
        self.max_hashes_per_host
    }

    /// Host owning the first entry whose hash is >= `h`, wrapping to the first
    /// entry past the end. `None` for an empty ring.
    pub fn choose_host(&self, h: u64) -> Option<HostRef> {
        if self.entries.is_empty() {
            return None;
        }

        // Ketama search. Indices are signed so `highp` can drop below zero.
        let len = self.entries.len() as i64;
        let mut lowp: i64 = 0;
        let mut highp: i64 = len;
        loop {
            let midp = (lowp + highp) / 2;
            if midp == len {
                return Some(self.entries[0].host.clone());
            }

            let midval = self.entries[midp as usize].hash;
            let midval1 = if midp == 0 {
                0
            } else {
                self.entries[midp as usize - 1].hash
            };

            if h <= midval && h > midval1 {
                return Some(self.entries[midp as usize].host.clone());
            }

            if midval < h {
                lowp = midp + 1;
            } else {
                highp = midp - 1;
            }

            if lowp > highp {
                return Some(self.entries[0].host.clone());
            }
        }
    }
}
