//! Active health checking through the cluster control loop.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use upstream_balancer::config::schema::{ProbeConfig, ProbeKind};
use upstream_balancer::config::{ClusterConfig, HealthCheckConfig};
use upstream_balancer::health::ProbeTransportRegistry;
use upstream_balancer::upstream::HealthState;
use upstream_balancer::{Cluster, ClusterHandle, ClusterUpdate, Shutdown};

mod common;
use common::{ScriptedTransport, Step};

fn start(config: ClusterConfig, registry: ProbeTransportRegistry) -> (ClusterHandle, Shutdown, JoinHandle<()>) {
    let cluster = Cluster::new(config, registry).unwrap();
    let handle = cluster.handle();
    let shutdown = Shutdown::new();
    let task = tokio::spawn(cluster.run(shutdown.subscribe()));
    (handle, shutdown, task)
}

fn scripted(transport: &Arc<ScriptedTransport>) -> ProbeTransportRegistry {
    let mut registry = ProbeTransportRegistry::new();
    registry.register(ProbeKind::Tcp, transport.clone());
    registry
}

fn health_of(handle: &ClusterHandle, address: &str) -> HealthState {
    handle.snapshot().priority_set.find_host(address).unwrap().1.health()
}

fn checked_cluster(addresses: &[&str], check: HealthCheckConfig) -> ClusterConfig {
    let mut config = common::cluster("checked", addresses.iter().map(|a| common::host(a)).collect());
    config.health_checks.push(check);
    config
}

async fn stop(shutdown: Shutdown, task: JoinHandle<()>) {
    shutdown.trigger();
    task.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_host_needs_consecutive_successes_to_turn_healthy() {
    let transport = ScriptedTransport::new();
    let config = checked_cluster(&["10.0.0.1:80"], common::health_check(2, 3));
    let (handle, shutdown, task) = start(config, scripted(&transport));

    assert_eq!(health_of(&handle, "10.0.0.1:80"), HealthState::Unhealthy);
    assert!(handle.snapshot().priority_set.host_set(0).unwrap().healthy_hosts().is_empty());

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(transport.calls("10.0.0.1:80"), 1);
    assert_eq!(health_of(&handle, "10.0.0.1:80"), HealthState::Unhealthy);

    tokio::time::sleep(Duration::from_millis(1_000)).await;
    assert_eq!(transport.calls("10.0.0.1:80"), 2);
    assert_eq!(health_of(&handle, "10.0.0.1:80"), HealthState::Healthy);
    assert_eq!(handle.snapshot().priority_set.host_set(0).unwrap().healthy_hosts().len(), 1);

    stop(shutdown, task).await;
}

#[tokio::test(start_paused = true)]
async fn test_unhealthy_threshold_flips_exactly_once() {
    let transport = ScriptedTransport::new();
    transport.script("10.0.0.1:80", [Step::Fail]);
    let mut check = common::health_check(1, 3);
    check.always_start_healthy = true;
    let (handle, shutdown, task) = start(checked_cluster(&["10.0.0.1:80"], check), scripted(&transport));

    tokio::time::sleep(Duration::from_millis(300)).await;
    let version = handle.snapshot().version;
    assert_eq!(health_of(&handle, "10.0.0.1:80"), HealthState::Healthy);

    tokio::time::sleep(Duration::from_millis(1_000)).await;
    assert_eq!(transport.calls("10.0.0.1:80"), 2);
    assert_eq!(health_of(&handle, "10.0.0.1:80"), HealthState::Healthy);
    assert_eq!(handle.snapshot().version, version);

    tokio::time::sleep(Duration::from_millis(1_000)).await;
    assert_eq!(transport.calls("10.0.0.1:80"), 3);
    assert_eq!(health_of(&handle, "10.0.0.1:80"), HealthState::Unhealthy);
    assert_eq!(handle.snapshot().version, version + 1);

    tokio::time::sleep(Duration::from_millis(3_000)).await;
    assert_eq!(transport.calls("10.0.0.1:80"), 6);
    assert_eq!(handle.snapshot().version, version + 1);

    stop(shutdown, task).await;
}

#[tokio::test(start_paused = true)]
async fn test_hung_probe_times_out() {
    let transport = ScriptedTransport::new();
    transport.script("10.0.0.1:80", [Step::Hang]);
    let mut check = common::health_check(1, 1);
    check.always_start_healthy = true;
    let (handle, shutdown, task) = start(checked_cluster(&["10.0.0.1:80"], check), scripted(&transport));

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(health_of(&handle, "10.0.0.1:80"), HealthState::Healthy);

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(health_of(&handle, "10.0.0.1:80"), HealthState::Unhealthy);

    stop(shutdown, task).await;
}

#[tokio::test(start_paused = true)]
async fn test_recovery_after_failures() {
    let transport = ScriptedTransport::new();
    transport.script("10.0.0.1:80", [Step::Fail, Step::Healthy, Step::Healthy]);
    let mut check = common::health_check(2, 1);
    check.always_start_healthy = true;
    let (handle, shutdown, task) = start(checked_cluster(&["10.0.0.1:80"], check), scripted(&transport));

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(health_of(&handle, "10.0.0.1:80"), HealthState::Unhealthy);

    tokio::time::sleep(Duration::from_millis(1_000)).await;
    assert_eq!(health_of(&handle, "10.0.0.1:80"), HealthState::Unhealthy);

    tokio::time::sleep(Duration::from_millis(1_000)).await;
    assert_eq!(health_of(&handle, "10.0.0.1:80"), HealthState::Healthy);

    stop(shutdown, task).await;
}

#[tokio::test(start_paused = true)]
async fn test_degraded_response_partitions_host() {
    let transport = ScriptedTransport::new();
    transport.script("10.0.0.2:80", [Step::Degraded]);
    let config = checked_cluster(&["10.0.0.1:80", "10.0.0.2:80"], common::health_check(1, 1));
    let (handle, shutdown, task) = start(config, scripted(&transport));

    tokio::time::sleep(Duration::from_millis(300)).await;
    let snapshot = handle.snapshot();
    let host_set = snapshot.priority_set.host_set(0).unwrap();
    assert_eq!(host_set.healthy_hosts().len(), 1);
    assert_eq!(host_set.degraded_hosts().len(), 1);
    assert_eq!(host_set.degraded_hosts()[0].address(), "10.0.0.2:80");

    stop(shutdown, task).await;
}

#[tokio::test(start_paused = true)]
async fn test_removed_host_is_no_longer_probed() {
    let transport = ScriptedTransport::new();
    let check = common::health_check(1, 1);
    let config = checked_cluster(&["10.0.0.1:80", "10.0.0.2:80"], check);
    let (handle, shutdown, task) = start(config, scripted(&transport));

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(transport.calls("10.0.0.2:80"), 1);

    assert!(handle.send(ClusterUpdate::Hosts(vec![common::host("10.0.0.1:80")])));
    tokio::time::sleep(Duration::from_millis(5_000)).await;
    assert_eq!(transport.calls("10.0.0.2:80"), 1);
    assert!(transport.calls("10.0.0.1:80") >= 5);
    assert!(handle.snapshot().priority_set.find_host("10.0.0.2:80").is_none());

    stop(shutdown, task).await;
}

#[tokio::test(start_paused = true)]
async fn test_hosts_added_later_start_unhealthy_and_get_probed() {
    let transport = ScriptedTransport::new();
    let config = checked_cluster(&["10.0.0.1:80"], common::health_check(1, 1));
    let (handle, shutdown, task) = start(config, scripted(&transport));
    tokio::time::sleep(Duration::from_millis(300)).await;

    let added = upstream_balancer::cluster::build_host(&common::host("10.0.0.3:80"));
    assert!(handle.send(ClusterUpdate::Membership {
        priority: 0,
        added: vec![added],
        removed: Vec::new(),
    }));
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(transport.calls("10.0.0.3:80"), 1);
    assert_eq!(health_of(&handle, "10.0.0.3:80"), HealthState::Healthy);

    stop(shutdown, task).await;
}

#[tokio::test]
async fn test_tcp_probe_against_live_backend() {
    let backend = common::start_mock_backend(b"ping", b"pong").await;
    let closed = common::closed_port().await;

    let check = HealthCheckConfig {
        timeout_ms: 1_000,
        interval_ms: 100,
        healthy_threshold: 1,
        unhealthy_threshold: 1,
        probe: ProbeConfig::Tcp {
            send: Some("70696e67".to_string()),
            receive: vec!["706f6e67".to_string()],
        },
        ..Default::default()
    };
    let backend_address = backend.to_string();
    let closed_address = closed.to_string();
    let config = checked_cluster(&[backend_address.as_str(), closed_address.as_str()], check);
    let (handle, shutdown, task) = start(config, ProbeTransportRegistry::with_tcp());

    let mut healthy = false;
    for _ in 0..100 {
        if health_of(&handle, &backend_address) == HealthState::Healthy {
            healthy = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(healthy, "backend never passed its health check");
    assert_eq!(health_of(&handle, &closed_address), HealthState::Unhealthy);

    let ctx = upstream_balancer::RequestContext::new();
    for _ in 0..10 {
        assert_eq!(handle.choose_host(&ctx).unwrap().address(), backend_address);
    }

    stop(shutdown, task).await;
}

#[tokio::test(start_paused = true)]
async fn test_host_moving_priority_gets_a_fresh_session() {
    let transport = ScriptedTransport::new();
    let config = checked_cluster(&["10.0.0.1:80"], common::health_check(1, 1));
    let (handle, shutdown, task) = start(config, scripted(&transport));

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(transport.calls("10.0.0.1:80"), 1);

    assert!(handle.send(ClusterUpdate::Hosts(vec![common::host_with("10.0.0.1:80", 1, &[])])));
    tokio::time::sleep(Duration::from_millis(300)).await;
    // Probed right away instead of waiting out the old session's interval.
    assert_eq!(transport.calls("10.0.0.1:80"), 2);
    let (priority, _) = handle.snapshot().priority_set.find_host("10.0.0.1:80").unwrap();
    assert_eq!(priority, 1);
    assert_eq!(health_of(&handle, "10.0.0.1:80"), HealthState::Healthy);

    stop(shutdown, task).await;
}
