//! Metadata trie of subsets.
//!
//! Each level is keyed by a metadata key and then a value; descending along a
//! sorted `(key, value)` tuple reaches the entry for that tuple. Nodes are
//! shared through `Arc` and copied on write, so a published snapshot keeps
//! its own view while the control loop edits the next one.

use std::collections::HashMap;
use std::sync::Arc;

use crate::load_balancer::subset::host_subset::PrioritySubset;
use crate::upstream::host::Host;
use crate::upstream::metadata::{MetadataValue, SubsetMetadata};

#[derive(Debug, Clone, Default)]
pub struct SubsetEntry {
    children: HashMap<String, HashMap<MetadataValue, Arc<SubsetEntry>>>,
    subset: Option<Arc<PrioritySubset>>,
}

impl SubsetEntry {
    pub fn subset(&self) -> Option<&PrioritySubset> {
        self.subset.as_deref()
    }

    pub fn subset_mut(&mut self) -> Option<&mut PrioritySubset> {
        self.subset.as_mut().map(Arc::make_mut)
    }

    pub fn set_subset(&mut self, subset: PrioritySubset) {
        self.subset = Some(Arc::new(subset));
    }

    /// Initialized and holding at least one host.
    pub fn is_active(&self) -> bool {
        self.subset().map(PrioritySubset::is_active).unwrap_or(false)
    }

    pub fn find(&self, kvs: &[(String, MetadataValue)]) -> Option<&SubsetEntry> {
        match kvs.split_first() {
            None => Some(self),
            Some(((key, value), rest)) => self.children.get(key)?.get(value)?.find(rest),
        }
    }

    pub fn find_mut(&mut self, kvs: &[(String, MetadataValue)]) -> Option<&mut SubsetEntry> {
        match kvs.split_first() {
            None => Some(self),
            Some(((key, value), rest)) => {
                let child = self.children.get_mut(key)?.get_mut(value)?;
                Arc::make_mut(child).find_mut(rest)
            }
        }
    }

    /// Entry for `kvs`, creating empty nodes along the way.
    pub fn find_or_create(&mut self, kvs: &[(String, MetadataValue)]) -> &mut SubsetEntry {
        match kvs.split_first() {
            None => self,
            Some(((key, value), rest)) => {
                let child = self
                    .children
                    .entry(key.clone())
                    .or_default()
                    .entry(value.clone())
                    .or_default();
                Arc::make_mut(child).find_or_create(rest)
            }
        }
    }

    pub fn for_each_subset(&self, f: &mut dyn FnMut(&PrioritySubset)) {
        if let Some(subset) = self.subset() {
            f(subset);
        }
        for values in self.children.values() {
            for child in values.values() {
                child.for_each_subset(f);
            }
        }
    }

    pub fn for_each_subset_mut(&mut self, f: &mut dyn FnMut(&mut PrioritySubset)) {
        if let Some(subset) = self.subset_mut() {
            f(subset);
        }
        for values in self.children.values_mut() {
            for child in values.values_mut() {
                Arc::make_mut(child).for_each_subset_mut(f);
            }
        }
    }
}

/// Every subset tuple `host` belongs to for one key set. Empty when the host
/// lacks any key. With `list_as_any`, each element of a list value yields its
/// own tuple.
pub fn extract_subset_metadata<'a>(
    keys: impl IntoIterator<Item = &'a String>,
    host: &Host,
    list_as_any: bool,
) -> Vec<SubsetMetadata> {
    let mut tuples: Vec<SubsetMetadata> = vec![Vec::new()];
    for key in keys {
        let Some(value) = host.metadata_value(key) else {
            return Vec::new();
        };
        let choices: Vec<&MetadataValue> = match value {
            MetadataValue::List(items) if list_as_any => items.iter().collect(),
            other => vec![other],
        };
        tuples = tuples
            .into_iter()
            .flat_map(|prefix| {
                choices.iter().map(move |choice| {
                    let mut tuple = prefix.clone();
                    tuple.push((key.clone(), (*choice).clone()));
                    tuple
                })
            })
            .collect();
    }
    tuples
}
