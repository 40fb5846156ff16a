//! Validated health check settings.

use std::time::Duration;

use crate::config::schema::{HealthCheckConfig, ProbeConfig, ProbeKind};
use crate::error::ConfigError;

/// Decoded protocol payload handed to a probe transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbePayload {
    Tcp {
        send: Option<Vec<u8>>,
        receive: Vec<Vec<u8>>,
    },
    Http {
        path: String,
        host: Option<String>,
        expected_statuses: Vec<u16>,
    },
    Grpc {
        service_name: Option<String>,
    },
}

impl ProbePayload {
    pub fn kind(&self) -> ProbeKind {
        match self {
            ProbePayload::Tcp { .. } => ProbeKind::Tcp,
            ProbePayload::Http { .. } => ProbeKind::Http,
            ProbePayload::Grpc { .. } => ProbeKind::Grpc,
        }
    }
}

/// One health check after validation.
#[derive(Debug, Clone, PartialEq)]
pub struct HealthCheckSettings {
    pub timeout: Duration,
    pub interval: Duration,
    pub interval_jitter: Duration,
    pub interval_jitter_percent: u32,
    pub unhealthy_interval: Duration,
    pub burst_interval: Option<Duration>,
    pub no_traffic_interval: Option<Duration>,
    pub healthy_threshold: u32,
    pub unhealthy_threshold: u32,
    pub always_start_healthy: bool,
    pub payload: ProbePayload,
}

impl HealthCheckSettings {
    /// Validate check `index` of a cluster.
    pub fn from_config(index: usize, config: &HealthCheckConfig) -> Result<Self, ConfigError> {
        let invalid = |reason: String| ConfigError::HealthCheck { index, reason };

        if config.interval_ms == 0 {
            return Err(invalid("interval_ms must be positive".to_string()));
        }
        if config.timeout_ms == 0 {
            return Err(invalid("timeout_ms must be positive".to_string()));
        }
        if config.healthy_threshold == 0 {
            return Err(invalid("healthy_threshold must be positive".to_string()));
        }
        if config.unhealthy_threshold == 0 {
            return Err(invalid("unhealthy_threshold must be positive".to_string()));
        }
        if config.unhealthy_interval_ms == Some(0) {
            return Err(invalid("unhealthy_interval_ms must be positive".to_string()));
        }
        if config.burst_interval_ms == Some(0) {
            return Err(invalid("burst_interval_ms must be positive".to_string()));
        }
        if config.no_traffic_interval_ms == Some(0) {
            return Err(invalid("no_traffic_interval_ms must be positive".to_string()));
        }
        if config.interval_jitter_percent > 100 {
            return Err(invalid("interval_jitter_percent must be at most 100".to_string()));
        }

        let payload = decode_payload(&config.probe).map_err(invalid)?;
        let interval = Duration::from_millis(config.interval_ms);

        Ok(Self {
            timeout: Duration::from_millis(config.timeout_ms),
            interval,
            interval_jitter: Duration::from_millis(config.interval_jitter_ms),
            interval_jitter_percent: config.interval_jitter_percent,
            unhealthy_interval: config
                .unhealthy_interval_ms
                .map(Duration::from_millis)
                .unwrap_or(interval),
            burst_interval: config.burst_interval_ms.map(Duration::from_millis),
            no_traffic_interval: config.no_traffic_interval_ms.map(Duration::from_millis),
            healthy_threshold: config.healthy_threshold,
            unhealthy_threshold: config.unhealthy_threshold,
            always_start_healthy: config.always_start_healthy,
            payload,
        })
    }

    pub fn kind(&self) -> ProbeKind {
        self.payload.kind()
    }
}

fn decode_payload(probe: &ProbeConfig) -> Result<ProbePayload, String> {
    match probe {
        ProbeConfig::Tcp { send, receive } => {
            let send = send
                .as_deref()
                .map(|s| decode_hex(s).map_err(|e| format!("probe.send: {}", e)))
                .transpose()?;
            let receive = receive
                .iter()
                .enumerate()
                .map(|(i, s)| decode_hex(s).map_err(|e| format!("probe.receive[{}]: {}", i, e)))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(ProbePayload::Tcp { send, receive })
        }
        ProbeConfig::Http {
            path,
            host,
            expected_statuses,
        } => {
            if !path.starts_with('/') {
                return Err(format!("probe.path must start with '/', got {:?}", path));
            }
            if let Some(status) = expected_statuses.iter().find(|s| !(100..600).contains(*s)) {
                return Err(format!("probe.expected_statuses: {} is not an HTTP status", status));
            }
            let expected_statuses = if expected_statuses.is_empty() {
                vec![200]
            } else {
                expected_statuses.clone()
            };
            Ok(ProbePayload::Http {
                path: path.clone(),
                host: host.clone(),
                expected_statuses,
            })
        }
        ProbeConfig::Grpc { service_name } => Ok(ProbePayload::Grpc {
            service_name: service_name.clone(),
        }),
    }
}

/// Decode a hex string; whitespace between byte pairs is ignored.
pub fn decode_hex(text: &str) -> Result<Vec<u8>, String> {
    let digits: String = text.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    if digits.is_empty() {
        return Err("empty hex payload".to_string());
    }
    hex::decode(&digits).map_err(|e| format!("{} in {:?}", e, text))
}
