//! Named clusters for the routing layer.

use std::collections::HashSet;

use dashmap::DashMap;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::cluster::{Cluster, ClusterHandle, ClusterUpdate};
use crate::config::schema::{ClusterConfig, UpstreamConfig};
use crate::error::ConfigError;
use crate::health::ProbeTransportRegistry;
use crate::lifecycle::Shutdown;
use crate::load_balancer::LoadBalancerContext;
use crate::upstream::host::HostRef;

/// Cluster handles by name. Reads never block the control loops.
#[derive(Debug)]
pub struct ClusterManager {
    clusters: DashMap<String, ClusterHandle>,
    transports: ProbeTransportRegistry,
}

impl ClusterManager {
    pub fn new(transports: ProbeTransportRegistry) -> Self {
        Self {
            clusters: DashMap::new(),
            transports,
        }
    }

    pub fn get(&self, name: &str) -> Option<ClusterHandle> {
        self.clusters.get(name).map(|entry| entry.value().clone())
    }

    pub fn choose_host(&self, cluster: &str, context: &dyn LoadBalancerContext) -> Option<HostRef> {
        self.clusters.get(cluster)?.choose_host(context)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.clusters.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.clusters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clusters.is_empty()
    }

    /// Build a cluster and spawn its control loop.
    pub fn spawn_cluster(&self, config: ClusterConfig, shutdown: &Shutdown) -> Result<JoinHandle<()>, ConfigError> {
        let cluster = Cluster::new(config, self.transports.clone())?;
        let handle = cluster.handle();
        if let Some(previous) = self.clusters.insert(handle.name().to_string(), handle) {
            previous.send(ClusterUpdate::Stop);
        }
        Ok(tokio::spawn(cluster.run(shutdown.subscribe())))
    }

    /// Bring the running clusters in line with `config`: existing clusters get
    /// the new configuration, new ones are spawned, missing ones are stopped.
    /// Returns the control loops spawned.
    pub fn apply_config(&self, config: &UpstreamConfig, shutdown: &Shutdown) -> Vec<JoinHandle<()>> {
        let wanted: HashSet<&str> = config.clusters.iter().map(|c| c.name.as_str()).collect();
        let stale: Vec<String> = self
            .clusters
            .iter()
            .filter(|e| !wanted.contains(e.key().as_str()))
            .map(|e| e.key().clone())
            .collect();
        for name in stale {
            if let Some((_, handle)) = self.clusters.remove(&name) {
                info!(cluster = %name, "Cluster removed from configuration");
                handle.send(ClusterUpdate::Stop);
            }
        }

        let mut spawned = Vec::new();
        for cluster in &config.clusters {
            let existing = self.get(&cluster.name);
            match existing {
                Some(handle) if handle.send(ClusterUpdate::Config(Box::new(cluster.clone()))) => {}
                _ => match self.spawn_cluster(cluster.clone(), shutdown) {
                    Ok(task) => spawned.push(task),
                    Err(e) => error!(cluster = %cluster.name, error = %e, "Failed to start cluster"),
                },
            }
        }
        spawned
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::HostConfig;
    use crate::load_balancer::RequestContext;
    use std::time::Duration;

    fn cluster(name: &str, address: &str) -> ClusterConfig {
        ClusterConfig {
            name: name.to_string(),
            hosts: vec![HostConfig {
                address: address.to_string(),
                weight: 1,
                priority: 0,
                locality: Default::default(),
                metadata: Default::default(),
            }],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_apply_config_spawns_updates_and_stops() {
        let manager = ClusterManager::new(ProbeTransportRegistry::new());
        let shutdown = Shutdown::new();
        let config = UpstreamConfig {
            clusters: vec![cluster("a", "10.0.0.1:80"), cluster("b", "10.0.0.2:80")],
            ..Default::default()
        };
        let tasks = manager.apply_config(&config, &shutdown);
        assert_eq!(tasks.len(), 2);
        assert_eq!(manager.names(), vec!["a", "b"]);
        let ctx = RequestContext::new();
        assert_eq!(manager.choose_host("a", &ctx).unwrap().address(), "10.0.0.1:80");

        let next = UpstreamConfig {
            clusters: vec![cluster("a", "10.0.0.9:80")],
            ..Default::default()
        };
        assert!(manager.apply_config(&next, &shutdown).is_empty());
        assert!(manager.get("b").is_none());

        let handle = manager.get("a").unwrap();
        let mut updated = false;
        for _ in 0..100 {
            if handle.choose_host(&ctx).map(|h| h.address() == "10.0.0.9:80").unwrap_or(false) {
                updated = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(updated);

        shutdown.trigger();
        for task in tasks {
            task.await.unwrap();
        }
    }
}
