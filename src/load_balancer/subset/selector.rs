//! Compiled subset selectors and fallback policies.

use std::collections::{BTreeMap, BTreeSet};

use crate::config::schema::{
    SelectorFallbackPolicy, SubsetConfig, SubsetFallbackPolicy, SubsetSelectorConfig,
};
use crate::error::ConfigError;
use crate::upstream::metadata::{MetadataValue, SubsetMetadata};

/// What to do when a selector's subset is missing or empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelectorFallback {
    /// Try the next selector.
    NoFallback,
    /// Select from every host.
    AnyEndpoint,
    /// Select from the subset matching this metadata.
    DefaultSubset(SubsetMetadata),
    /// Retry the trie with only these keys of the request.
    KeysSubset(BTreeSet<String>),
}

/// Cluster-wide fallback once no selector produced a host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterFallback {
    NoFallback,
    AnyEndpoint,
    DefaultSubset(SubsetMetadata),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubsetSelector {
    keys: BTreeSet<String>,
    fallback: SelectorFallback,
}

fn to_subset_metadata(map: &BTreeMap<String, MetadataValue>) -> SubsetMetadata {
    map.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
}

impl SubsetSelector {
    /// Compile selector `index`. `cluster_default` is used by `DEFAULT_SUBSET`
    /// when the selector names no metadata of its own.
    pub fn from_config(
        index: usize,
        config: &SubsetSelectorConfig,
        cluster_default: &BTreeMap<String, MetadataValue>,
    ) -> Result<Self, ConfigError> {
        let invalid = |reason: &str| ConfigError::SubsetSelector {
            index,
            reason: reason.to_string(),
        };

        let keys: BTreeSet<String> = config.keys.iter().cloned().collect();
        if keys.is_empty() {
            return Err(invalid("keys must not be empty"));
        }
        if keys.len() != config.keys.len() {
            return Err(invalid("keys must be unique"));
        }

        let fallback = match config.fallback_policy {
            SelectorFallbackPolicy::NoFallback => SelectorFallback::NoFallback,
            SelectorFallbackPolicy::AnyEndpoint => SelectorFallback::AnyEndpoint,
            SelectorFallbackPolicy::DefaultSubset => {
                let metadata = if config.default_subset.is_empty() {
                    cluster_default
                } else {
                    &config.default_subset
                };
                if metadata.is_empty() {
                    return Err(invalid(
                        "DEFAULT_SUBSET fallback requires default_subset metadata",
                    ));
                }
                SelectorFallback::DefaultSubset(to_subset_metadata(metadata))
            }
            SelectorFallbackPolicy::KeysSubset => {
                let fallback_keys: BTreeSet<String> =
                    config.fallback_keys_subset.iter().cloned().collect();
                if fallback_keys.is_empty() {
                    return Err(invalid(
                        "KEYS_SUBSET fallback requires non-empty fallback_keys_subset",
                    ));
                }
                if !fallback_keys.is_subset(&keys) {
                    return Err(invalid(
                        "fallback_keys_subset must be a subset of the selector keys",
                    ));
                }
                if fallback_keys == keys {
                    return Err(invalid(
                        "fallback_keys_subset must not equal the selector keys",
                    ));
                }
                SelectorFallback::KeysSubset(fallback_keys)
            }
        };

        Ok(Self { keys, fallback })
    }

    pub fn new(keys: impl IntoIterator<Item = impl Into<String>>, fallback: SelectorFallback) -> Self {
        Self {
            keys: keys.into_iter().map(Into::into).collect(),
            fallback,
        }
    }

    pub fn keys(&self) -> &BTreeSet<String> {
        &self.keys
    }

    pub fn fallback(&self) -> &SelectorFallback {
        &self.fallback
    }
}

/// Subset configuration after validation.
#[derive(Debug, Clone, PartialEq)]
pub struct SubsetSettings {
    pub selectors: Vec<SubsetSelector>,
    pub fallback: ClusterFallback,
    pub locality_weight_aware: bool,
    pub scale_locality_weight: bool,
    pub panic_mode_any: bool,
    pub list_as_any: bool,
}

impl SubsetSettings {
    pub fn from_config(config: &SubsetConfig) -> Result<Self, ConfigError> {
        let selectors = config
            .subset_selectors
            .iter()
            .enumerate()
            .map(|(i, s)| SubsetSelector::from_config(i, s, &config.default_subset))
            .collect::<Result<Vec<_>, _>>()?;

        let fallback = match config.fallback_policy {
            SubsetFallbackPolicy::NoFallback => ClusterFallback::NoFallback,
            SubsetFallbackPolicy::AnyEndpoint => ClusterFallback::AnyEndpoint,
            SubsetFallbackPolicy::DefaultSubset => {
                if config.default_subset.is_empty() {
                    return Err(ConfigError::SubsetFallback(
                        "DEFAULT_SUBSET requires default_subset metadata".to_string(),
                    ));
                }
                ClusterFallback::DefaultSubset(to_subset_metadata(&config.default_subset))
            }
        };

        if config.scale_locality_weight && !config.locality_weight_aware {
            return Err(ConfigError::SubsetFallback(
                "scale_locality_weight requires locality_weight_aware".to_string(),
            ));
        }

        Ok(Self {
            selectors,
            fallback,
            locality_weight_aware: config.locality_weight_aware,
            scale_locality_weight: config.scale_locality_weight,
            panic_mode_any: config.panic_mode_any,
            list_as_any: config.list_as_any,
        })
    }

    /// Key sets the trie is populated for: every selector's keys plus every
    /// `KEYS_SUBSET` fallback key set, deduplicated, in selector order.
    pub fn trie_key_sets(&self) -> Vec<&BTreeSet<String>> {
        let mut sets: Vec<&BTreeSet<String>> = Vec::new();
        for selector in &self.selectors {
            let candidates = std::iter::once(&selector.keys).chain(match &selector.fallback {
                SelectorFallback::KeysSubset(keys) => Some(keys),
                _ => None,
            });
            for keys in candidates {
                if !sets.contains(&keys) {
                    sets.push(keys);
                }
            }
        }
        sets
    }

    /// Metadata of every subset that must exist regardless of traffic.
    pub fn default_subsets(&self) -> Vec<&SubsetMetadata> {
        let mut out: Vec<&SubsetMetadata> = Vec::new();
        let cluster = match &self.fallback {
            ClusterFallback::DefaultSubset(md) => Some(md),
            _ => None,
        };
        let selectors = self.selectors.iter().filter_map(|s| match &s.fallback {
            SelectorFallback::DefaultSubset(md) => Some(md),
            _ => None,
        });
        for md in cluster.into_iter().chain(selectors) {
            if !out.contains(&md) {
                out.push(md);
            }
        }
        out
    }
}

/// Check a subset configuration without building anything.
pub fn validate_subset_config(config: &SubsetConfig) -> Result<(), ConfigError> {
    SubsetSettings::from_config(config).map(|_| ())
}
