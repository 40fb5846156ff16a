//! Probe transports.
//!
//! A transport performs one network exchange for a probe and reports the
//! outcome. Transports are registered per probe kind and injected into the
//! health checker; there is no global registry.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::config::schema::ProbeKind;
use crate::health::settings::ProbePayload;
use crate::health::tcp::TcpProbeTransport;

/// Why a probe failed. Consumed by the health checker, never surfaced.
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("connect failed: {0}")]
    Connect(#[source] std::io::Error),

    #[error("I/O error: {0}")]
    Io(#[source] std::io::Error),

    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),

    #[error("transport cannot send {0} probes")]
    UnsupportedPayload(ProbeKind),
}

impl ProbeError {
    /// Connection level failure, as opposed to a bad answer.
    pub fn is_network(&self) -> bool {
        matches!(self, ProbeError::Connect(_) | ProbeError::Io(_))
    }
}

/// A passing probe. A degraded answer keeps the host eligible but ranks it
/// behind healthy hosts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeResponse {
    Healthy,
    Degraded,
}

#[async_trait]
pub trait ProbeTransport: Send + Sync + fmt::Debug {
    /// Run one probe against `address`. Dropping the future abandons the probe
    /// and closes whatever connection it holds.
    async fn probe(&self, address: &str, payload: &ProbePayload) -> Result<ProbeResponse, ProbeError>;
}

/// Transports keyed by probe kind.
#[derive(Debug, Clone, Default)]
pub struct ProbeTransportRegistry {
    transports: HashMap<ProbeKind, Arc<dyn ProbeTransport>>,
}

impl ProbeTransportRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in TCP transport.
    pub fn with_tcp() -> Self {
        let mut registry = Self::new();
        registry.register(ProbeKind::Tcp, Arc::new(TcpProbeTransport::default()));
        registry
    }

    pub fn register(&mut self, kind: ProbeKind, transport: Arc<dyn ProbeTransport>) -> &mut Self {
        self.transports.insert(kind, transport);
        self
    }

    pub fn get(&self, kind: ProbeKind) -> Option<Arc<dyn ProbeTransport>> {
        self.transports.get(&kind).cloned()
    }
}
