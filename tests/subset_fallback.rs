//! Subset selection and fallback policies through a running cluster.

use std::collections::{BTreeMap, HashSet};

use upstream_balancer::cluster::build_host;
use upstream_balancer::config::schema::{SelectorFallbackPolicy, SubsetFallbackPolicy, SubsetSelectorConfig};
use upstream_balancer::config::{ClusterConfig, SubsetConfig};
use upstream_balancer::health::ProbeTransportRegistry;
use upstream_balancer::upstream::{HealthState, MetadataMatchCriteria, MetadataValue};
use upstream_balancer::{Cluster, ConfigError, RequestContext};

mod common;

fn version_cluster(subset: SubsetConfig) -> ClusterConfig {
    let mut config = common::cluster(
        "catalog",
        vec![
            common::host_with("10.0.0.1:80", 0, &[("version", "v1"), ("stage", "prod")]),
            common::host_with("10.0.0.2:80", 0, &[("version", "v1"), ("stage", "canary")]),
            common::host_with("10.0.0.3:80", 0, &[("version", "v3"), ("stage", "prod")]),
        ],
    );
    config.subset = Some(subset);
    config
}

fn selector(keys: &[&str], fallback_policy: SelectorFallbackPolicy) -> SubsetSelectorConfig {
    SubsetSelectorConfig {
        keys: keys.iter().map(|k| k.to_string()).collect(),
        fallback_policy,
        ..Default::default()
    }
}

fn metadata(pairs: &[(&str, &str)]) -> BTreeMap<String, MetadataValue> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), MetadataValue::from(*v)))
        .collect()
}

fn request(pairs: &[(&str, &str)]) -> RequestContext {
    RequestContext::new().with_metadata(MetadataMatchCriteria::new(pairs.iter().copied()))
}

fn picks(cluster: &Cluster, ctx: &RequestContext, n: usize) -> HashSet<String> {
    (0..n)
        .filter_map(|_| cluster.choose_host(ctx))
        .map(|h| h.address().to_string())
        .collect()
}

#[test]
fn test_selector_default_subset_serves_missing_version() {
    let mut version = selector(&["version"], SelectorFallbackPolicy::DefaultSubset);
    version.default_subset = metadata(&[("version", "v1")]);
    let cluster = Cluster::new(
        version_cluster(SubsetConfig {
            subset_selectors: vec![version],
            ..Default::default()
        }),
        ProbeTransportRegistry::new(),
    )
    .unwrap();

    let chosen = picks(&cluster, &request(&[("version", "v2")]), 20);
    let expected: HashSet<String> = ["10.0.0.1:80", "10.0.0.2:80"].iter().map(|s| s.to_string()).collect();
    assert_eq!(chosen, expected);

    let stats = cluster.subset_load_balancer().unwrap().stats();
    assert_eq!(stats.fallback(), 20);
    assert_eq!(stats.selected(), 0);
}

#[test]
fn test_selector_default_subset_inherits_cluster_default() {
    let cluster = Cluster::new(
        version_cluster(SubsetConfig {
            default_subset: metadata(&[("version", "v3")]),
            subset_selectors: vec![selector(&["version"], SelectorFallbackPolicy::DefaultSubset)],
            ..Default::default()
        }),
        ProbeTransportRegistry::new(),
    )
    .unwrap();

    let host = cluster.choose_host(&request(&[("version", "v9")])).unwrap();
    assert_eq!(host.address(), "10.0.0.3:80");
}

#[test]
fn test_exact_match_beats_fallback() {
    let cluster = Cluster::new(
        version_cluster(SubsetConfig {
            fallback_policy: SubsetFallbackPolicy::AnyEndpoint,
            subset_selectors: vec![selector(&["version"], SelectorFallbackPolicy::NoFallback)],
            ..Default::default()
        }),
        ProbeTransportRegistry::new(),
    )
    .unwrap();

    for _ in 0..10 {
        let host = cluster.choose_host(&request(&[("version", "v3")])).unwrap();
        assert_eq!(host.address(), "10.0.0.3:80");
    }
    assert_eq!(cluster.subset_load_balancer().unwrap().stats().selected(), 10);
}

#[test]
fn test_cluster_fallback_any_endpoint_versus_no_fallback() {
    let subset = |fallback_policy| SubsetConfig {
        fallback_policy,
        subset_selectors: vec![selector(&["version"], SelectorFallbackPolicy::NoFallback)],
        ..Default::default()
    };

    let any = Cluster::new(version_cluster(subset(SubsetFallbackPolicy::AnyEndpoint)), ProbeTransportRegistry::new()).unwrap();
    assert_eq!(picks(&any, &request(&[("version", "v2")]), 30).len(), 3);
    assert!(any.choose_host(&RequestContext::new()).is_some());

    let none = Cluster::new(version_cluster(subset(SubsetFallbackPolicy::NoFallback)), ProbeTransportRegistry::new()).unwrap();
    assert!(none.choose_host(&request(&[("version", "v2")])).is_none());
    assert!(none.choose_host(&RequestContext::new()).is_none());
}

#[test]
fn test_keys_subset_fallback_drops_keys() {
    let mut both = selector(&["version", "stage"], SelectorFallbackPolicy::KeysSubset);
    both.fallback_keys_subset = vec!["version".to_string()];
    let cluster = Cluster::new(
        version_cluster(SubsetConfig {
            subset_selectors: vec![both],
            ..Default::default()
        }),
        ProbeTransportRegistry::new(),
    )
    .unwrap();

    let exact = cluster.choose_host(&request(&[("version", "v1"), ("stage", "canary")])).unwrap();
    assert_eq!(exact.address(), "10.0.0.2:80");

    let narrowed = cluster.choose_host(&request(&[("version", "v3"), ("stage", "canary")])).unwrap();
    assert_eq!(narrowed.address(), "10.0.0.3:80");
}

#[test]
fn test_membership_creates_new_subset() {
    let mut cluster = Cluster::new(
        version_cluster(SubsetConfig {
            subset_selectors: vec![selector(&["version"], SelectorFallbackPolicy::NoFallback)],
            ..Default::default()
        }),
        ProbeTransportRegistry::new(),
    )
    .unwrap();
    assert!(cluster.choose_host(&request(&[("version", "v4")])).is_none());

    let v4 = build_host(&common::host_with("10.0.0.4:80", 0, &[("version", "v4")]));
    cluster.on_membership_change(0, vec![v4], &[]);
    let host = cluster.choose_host(&request(&[("version", "v4")])).unwrap();
    assert_eq!(host.address(), "10.0.0.4:80");

    cluster.on_membership_change(0, Vec::new(), &["10.0.0.4:80".to_string()]);
    assert!(cluster.choose_host(&request(&[("version", "v4")])).is_none());
}

#[test]
fn test_panic_mode_any_after_all_fallbacks_fail() {
    let cluster = Cluster::new(
        version_cluster(SubsetConfig {
            panic_mode_any: true,
            subset_selectors: vec![selector(&["version"], SelectorFallbackPolicy::NoFallback)],
            ..Default::default()
        }),
        ProbeTransportRegistry::new(),
    )
    .unwrap();

    assert!(cluster.choose_host(&request(&[("version", "v7")])).is_some());
    assert_eq!(cluster.subset_load_balancer().unwrap().stats().fallback_panic(), 1);
}

#[test]
fn test_unhealthy_subset_hosts_still_served_in_panic() {
    let mut cluster = Cluster::new(
        version_cluster(SubsetConfig {
            subset_selectors: vec![selector(&["version"], SelectorFallbackPolicy::NoFallback)],
            ..Default::default()
        }),
        ProbeTransportRegistry::new(),
    )
    .unwrap();
    let v3 = cluster.priority_set().find_host("10.0.0.3:80").unwrap().1.clone();
    v3.set_health(HealthState::Unhealthy);
    // Any rebuild picks up the new health flag.
    cluster.update_host_weight("10.0.0.3:80", 2);

    // The only v3 host is unhealthy, so the subset panics and still picks it.
    let host = cluster.choose_host(&request(&[("version", "v3")])).unwrap();
    assert_eq!(host.address(), "10.0.0.3:80");
}

#[test]
fn test_invalid_subset_config_is_rejected() {
    let config = version_cluster(SubsetConfig {
        fallback_policy: SubsetFallbackPolicy::DefaultSubset,
        subset_selectors: vec![selector(&["version"], SelectorFallbackPolicy::NoFallback)],
        ..Default::default()
    });
    assert!(matches!(
        Cluster::new(config, ProbeTransportRegistry::new()),
        Err(ConfigError::Validation(_)) | Err(ConfigError::SubsetFallback(_))
    ));
}
