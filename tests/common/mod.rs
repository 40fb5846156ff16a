//! Shared utilities for integration tests.
#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use upstream_balancer::config::schema::{HealthCheckConfig, HostConfig, ProbeConfig};
use upstream_balancer::config::ClusterConfig;
use upstream_balancer::health::{ProbeError, ProbePayload, ProbeResponse, ProbeTransport};
use upstream_balancer::upstream::{Locality, MetadataValue};

/// What a scripted probe answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Healthy,
    Degraded,
    Fail,
    /// Never answers; only the check timeout ends it.
    Hang,
}

/// Probe transport that replays a per-address script. Once a script runs
/// out, the last step repeats. Unknown addresses answer healthy.
#[derive(Debug, Default)]
pub struct ScriptedTransport {
    scripts: Mutex<HashMap<String, VecDeque<Step>>>,
    calls: Mutex<HashMap<String, u32>>,
    total: AtomicU32,
}

impl ScriptedTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn script(&self, address: &str, steps: impl IntoIterator<Item = Step>) {
        self.scripts
            .lock()
            .unwrap()
            .insert(address.to_string(), steps.into_iter().collect());
    }

    pub fn calls(&self, address: &str) -> u32 {
        self.calls.lock().unwrap().get(address).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> u32 {
        self.total.load(Ordering::SeqCst)
    }

    fn next_step(&self, address: &str) -> Step {
        *self.calls.lock().unwrap().entry(address.to_string()).or_default() += 1;
        self.total.fetch_add(1, Ordering::SeqCst);
        let mut scripts = self.scripts.lock().unwrap();
        match scripts.get_mut(address) {
            Some(steps) if steps.len() > 1 => steps.pop_front().unwrap_or(Step::Healthy),
            Some(steps) => steps.front().copied().unwrap_or(Step::Healthy),
            None => Step::Healthy,
        }
    }
}

#[async_trait]
impl ProbeTransport for ScriptedTransport {
    async fn probe(&self, address: &str, _payload: &ProbePayload) -> Result<ProbeResponse, ProbeError> {
        match self.next_step(address) {
            Step::Healthy => Ok(ProbeResponse::Healthy),
            Step::Degraded => Ok(ProbeResponse::Degraded),
            Step::Fail => Err(ProbeError::UnexpectedResponse("scripted failure".to_string())),
            Step::Hang => {
                std::future::pending::<()>().await;
                Ok(ProbeResponse::Healthy)
            }
        }
    }
}

/// Start a TCP backend that answers every `request` it reads with `response`.
/// Returns the bound address.
pub async fn start_mock_backend(request: &'static [u8], response: &'static [u8]) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((mut socket, _)) => {
                    tokio::spawn(async move {
                        let mut buf = vec![0u8; request.len()];
                        if socket.read_exact(&mut buf).await.is_ok() && buf == request {
                            let _ = socket.write_all(response).await;
                        }
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        let _ = socket.shutdown().await;
                    });
                }
                Err(_) => break,
            }
        }
    });
    addr
}

/// An address nothing listens on.
pub async fn closed_port() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}

pub fn host(address: &str) -> HostConfig {
    HostConfig {
        address: address.to_string(),
        weight: 1,
        priority: 0,
        locality: Locality::default(),
        metadata: BTreeMap::new(),
    }
}

pub fn host_with(address: &str, priority: u32, metadata: &[(&str, &str)]) -> HostConfig {
    HostConfig {
        priority,
        metadata: metadata
            .iter()
            .map(|(k, v)| (k.to_string(), MetadataValue::from(*v)))
            .collect(),
        ..host(address)
    }
}

pub fn cluster(name: &str, hosts: Vec<HostConfig>) -> ClusterConfig {
    ClusterConfig {
        name: name.to_string(),
        hosts,
        ..Default::default()
    }
}

/// Health check probing every second with a 500ms timeout.
pub fn health_check(healthy_threshold: u32, unhealthy_threshold: u32) -> HealthCheckConfig {
    HealthCheckConfig {
        timeout_ms: 500,
        interval_ms: 1_000,
        healthy_threshold,
        unhealthy_threshold,
        probe: ProbeConfig::Tcp {
            send: None,
            receive: Vec::new(),
        },
        ..Default::default()
    }
}
