//! Endpoint metadata values and request match criteria.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

/// A single metadata value attached to a host or requested by a route.
///
/// Values are compared structurally, so `Integer(1)` and `String("1")` are
/// different values.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetadataValue {
    Bool(bool),
    Integer(i64),
    String(String),
    List(Vec<MetadataValue>),
}

impl MetadataValue {
    /// True if `self` equals `wanted`, or, when `list_as_any` is set and
    /// `self` is a list, if any element equals `wanted`.
    pub fn matches(&self, wanted: &MetadataValue, list_as_any: bool) -> bool {
        if self == wanted {
            return true;
        }
        match self {
            MetadataValue::List(items) if list_as_any => items.iter().any(|item| item == wanted),
            _ => false,
        }
    }
}

impl fmt::Display for MetadataValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetadataValue::Bool(b) => write!(f, "{}", b),
            MetadataValue::Integer(n) => write!(f, "{}", n),
            MetadataValue::String(s) => write!(f, "\"{}\"", s),
            MetadataValue::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
        }
    }
}

impl From<&str> for MetadataValue {
    fn from(value: &str) -> Self {
        MetadataValue::String(value.to_string())
    }
}

impl From<String> for MetadataValue {
    fn from(value: String) -> Self {
        MetadataValue::String(value)
    }
}

impl From<i64> for MetadataValue {
    fn from(value: i64) -> Self {
        MetadataValue::Integer(value)
    }
}

impl From<bool> for MetadataValue {
    fn from(value: bool) -> Self {
        MetadataValue::Bool(value)
    }
}

/// Ordered `(key, value)` tuple identifying one subset. Always sorted by key.
pub type SubsetMetadata = Vec<(String, MetadataValue)>;

/// Render a metadata tuple for logs, e.g. `stage="prod", version="v1"`.
pub fn describe_metadata(kvs: &[(String, MetadataValue)]) -> String {
    if kvs.is_empty() {
        return "<no metadata>".to_string();
    }
    kvs.iter()
        .map(|(key, value)| format!("{}={}", key, value))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Metadata a request wants its upstream host to carry.
///
/// Entries are kept sorted by key (last write wins on duplicate keys) so that
/// trie descent is deterministic.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetadataMatchCriteria {
    criteria: SubsetMetadata,
}

impl MetadataMatchCriteria {
    pub fn new<I, K, V>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<MetadataValue>,
    {
        let mut criteria: SubsetMetadata = Vec::new();
        for (key, value) in entries {
            let key = key.into();
            let value = value.into();
            match criteria.binary_search_by(|(k, _)| k.as_str().cmp(key.as_str())) {
                Ok(pos) => criteria[pos].1 = value,
                Err(pos) => criteria.insert(pos, (key, value)),
            }
        }
        Self { criteria }
    }

    pub fn criteria(&self) -> &[(String, MetadataValue)] {
        &self.criteria
    }

    pub fn is_empty(&self) -> bool {
        self.criteria.is_empty()
    }

    pub fn len(&self) -> usize {
        self.criteria.len()
    }

    /// Keep only the criteria whose key is in `keys`.
    pub fn filter(&self, keys: &BTreeSet<String>) -> SubsetMetadata {
        self.criteria
            .iter()
            .filter(|(key, _)| keys.contains(key))
            .cloned()
            .collect()
    }
}

impl<K, V> FromIterator<(K, V)> for MetadataMatchCriteria
where
    K: Into<String>,
    V: Into<MetadataValue>,
{
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        Self::new(iter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_criteria_sorted_and_deduplicated() {
        let criteria = MetadataMatchCriteria::new([
            ("version", "v2"),
            ("stage", "prod"),
            ("version", "v3"),
        ]);
        let keys: Vec<&str> = criteria.criteria().iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["stage", "version"]);
        assert_eq!(criteria.criteria()[1].1, MetadataValue::from("v3"));
    }

    #[test]
    fn test_filter_keeps_selector_keys() {
        let criteria = MetadataMatchCriteria::new([("version", "v1"), ("stage", "prod")]);
        let keys: BTreeSet<String> = ["version".to_string()].into_iter().collect();
        assert_eq!(
            criteria.filter(&keys),
            vec![("version".to_string(), MetadataValue::from("v1"))]
        );
    }

    #[test]
    fn test_describe_metadata() {
        let kvs = vec![
            ("stage".to_string(), MetadataValue::from("prod")),
            ("shard".to_string(), MetadataValue::from(3i64)),
        ];
        assert_eq!(describe_metadata(&kvs), "stage=\"prod\", shard=3");
        assert_eq!(describe_metadata(&[]), "<no metadata>");
    }

    #[test]
    fn test_list_as_any() {
        let host_value = MetadataValue::List(vec!["v1".into(), "v2".into()]);
        assert!(host_value.matches(&"v2".into(), true));
        assert!(!host_value.matches(&"v2".into(), false));
    }
}
