//! Cluster control loop: priority failover, panic and configuration updates.

use std::collections::HashMap;
use std::time::Duration;

use upstream_balancer::cluster::build_host;
use upstream_balancer::config::loader::parse_config;
use upstream_balancer::config::schema::{LbPolicy, ProbeKind};
use upstream_balancer::config::ClusterConfig;
use upstream_balancer::health::ProbeTransportRegistry;
use upstream_balancer::{Cluster, ClusterHandle, ClusterManager, ClusterUpdate, RequestContext, Shutdown};

mod common;
use common::{ScriptedTransport, Step};

fn tiered() -> ClusterConfig {
    common::cluster(
        "tiered",
        vec![
            common::host_with("10.0.0.1:80", 0, &[]),
            common::host_with("10.0.0.2:80", 0, &[]),
            common::host_with("10.0.1.1:80", 1, &[]),
        ],
    )
}

/// Host chosen for each priority hash in `0..100`, counted by address.
fn spread(handle: &ClusterHandle) -> HashMap<String, usize> {
    let mut counts = HashMap::new();
    for hash in 0..100u64 {
        let host = handle.choose_host(&RequestContext::new().with_hash_key(hash)).unwrap();
        *counts.entry(host.address().to_string()).or_default() += 1;
    }
    counts
}

async fn wait_for<F: Fn() -> bool>(condition: F) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

#[tokio::test(start_paused = true)]
async fn test_traffic_spills_to_lower_priority() {
    let transport = ScriptedTransport::new();
    transport.script("10.0.0.1:80", [Step::Fail]);
    let mut registry = ProbeTransportRegistry::new();
    registry.register(ProbeKind::Tcp, transport.clone());

    let mut config = tiered();
    let mut check = common::health_check(1, 1);
    check.always_start_healthy = true;
    config.health_checks.push(check);

    let cluster = Cluster::new(config, registry).unwrap();
    let handle = cluster.handle();
    let shutdown = Shutdown::new();
    let task = tokio::spawn(cluster.run(shutdown.subscribe()));

    let counts = spread(&handle);
    assert_eq!(counts.get("10.0.1.1:80"), None);

    tokio::time::sleep(Duration::from_millis(300)).await;
    // Half of priority 0 is healthy: 50% * 1.4 keeps 70% of the load there.
    let counts = spread(&handle);
    assert_eq!(counts.get("10.0.0.1:80"), None);
    assert_eq!(counts["10.0.0.2:80"], 70);
    assert_eq!(counts["10.0.1.1:80"], 30);

    transport.script("10.0.0.2:80", [Step::Fail]);
    tokio::time::sleep(Duration::from_millis(1_000)).await;
    let counts = spread(&handle);
    assert_eq!(counts["10.0.1.1:80"], 100);

    transport.script("10.0.1.1:80", [Step::Fail]);
    tokio::time::sleep(Duration::from_millis(1_000)).await;
    // Nothing is healthy: priority 0 takes everything in panic.
    let counts = spread(&handle);
    assert_eq!(counts.get("10.0.1.1:80"), None);
    assert_eq!(counts.values().sum::<usize>(), 100);

    shutdown.trigger();
    task.await.unwrap();
}

#[tokio::test]
async fn test_published_snapshot_survives_updates() {
    let cluster = Cluster::new(tiered(), ProbeTransportRegistry::new()).unwrap();
    let handle = cluster.handle();
    let shutdown = Shutdown::new();
    let task = tokio::spawn(cluster.run(shutdown.subscribe()));

    let old = handle.snapshot();
    assert!(handle.send(ClusterUpdate::Membership {
        priority: 0,
        added: vec![build_host(&common::host("10.0.0.3:80"))],
        removed: vec!["10.0.0.1:80".to_string(), "10.0.0.2:80".to_string()],
    }));
    assert!(wait_for(|| handle.snapshot().version > old.version).await);

    let ctx = RequestContext::new().with_hash_key(0);
    let stale = old.load_balancer.choose_host(&ctx).unwrap();
    assert!(stale.address().starts_with("10.0.0."));
    assert_ne!(stale.address(), "10.0.0.3:80");
    assert_eq!(handle.choose_host(&ctx).unwrap().address(), "10.0.0.3:80");
    assert_eq!(old.priority_set.host_set(0).unwrap().hosts().len(), 2);

    assert!(handle.send(ClusterUpdate::Stop));
    task.await.unwrap();
    assert!(!handle.send(ClusterUpdate::Stop));
}

#[tokio::test]
async fn test_rejected_config_leaves_cluster_running() {
    let cluster = Cluster::new(tiered(), ProbeTransportRegistry::new()).unwrap();
    let handle = cluster.handle();
    let shutdown = Shutdown::new();
    let task = tokio::spawn(cluster.run(shutdown.subscribe()));

    let mut bad = tiered();
    bad.common.overprovisioning_factor = 0;
    let version = handle.snapshot().version;
    assert!(handle.send(ClusterUpdate::Config(Box::new(bad))));

    let mut good = tiered();
    good.hosts.pop();
    assert!(handle.send(ClusterUpdate::Config(Box::new(good))));
    assert!(wait_for(|| handle.snapshot().priority_set.find_host("10.0.1.1:80").is_none()).await);
    assert_eq!(handle.snapshot().priority_set.overprovisioning_factor(), 140);
    assert!(handle.snapshot().version > version);

    shutdown.trigger();
    task.await.unwrap();
}

#[tokio::test]
async fn test_manager_follows_configuration_file() {
    let config = parse_config(
        r#"
        [[clusters]]
        name = "web"
        lb_policy = "ROUND_ROBIN"

        [[clusters.hosts]]
        address = "10.1.0.1:80"

        [[clusters.hosts]]
        address = "10.1.0.2:80"

        [[clusters]]
        name = "cache"
        lb_policy = "RING_HASH"

        [clusters.ring_hash]
        minimum_ring_size = 64

        [[clusters.hosts]]
        address = "10.2.0.1:6379"
        "#,
    )
    .unwrap();

    let manager = ClusterManager::new(ProbeTransportRegistry::with_tcp());
    let shutdown = Shutdown::new();
    let mut tasks = manager.apply_config(&config, &shutdown);
    assert_eq!(manager.names(), vec!["cache", "web"]);
    assert_eq!(manager.get("cache").unwrap().snapshot().priority_set.all_hosts().count(), 1);

    let session = RequestContext::new().with_hash_of("session-7");
    assert_eq!(manager.choose_host("cache", &session).unwrap().address(), "10.2.0.1:6379");
    assert!(manager.choose_host("missing", &session).is_none());

    let mut next = config.clone();
    next.clusters.retain(|c| c.name == "web");
    next.clusters[0].lb_policy = LbPolicy::Random;
    next.clusters[0].hosts.truncate(1);
    tasks.extend(manager.apply_config(&next, &shutdown));

    assert_eq!(manager.names(), vec!["web"]);
    let web = manager.get("web").unwrap();
    assert!(wait_for(|| web.snapshot().priority_set.all_hosts().count() == 1).await);
    for _ in 0..10 {
        assert_eq!(web.choose_host(&RequestContext::new()).unwrap().address(), "10.1.0.1:80");
    }

    shutdown.trigger();
    let aborted = Shutdown::drain(tasks, Duration::from_secs(5)).await;
    assert_eq!(aborted, 0);
}
