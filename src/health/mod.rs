//! Health checking subsystem.
//!
//! # Data Flow
//! ```text
//! Active health checks (active.rs):
//!     Interval timer (interval.rs, with jitter)
//!     → Probe through the registered transport (transport.rs, tcp.rs)
//!     → Timeout timer aborts a probe that does not answer
//!     → Outcome recorded by the session (state.rs)
//!     → Verdict flips returned to the cluster control loop
//!
//! State machine (state.rs):
//!     Unhealthy ←→ Healthy ←→ Degraded
//!     With thresholds to prevent flapping
//! ```
//!
//! # Design Decisions
//! - Probe failures never surface as errors; they only move counters and state
//! - State transitions require consecutive successes/failures
//! - Health state is per (host, check); a host is unhealthy if any check says so
//! - Transports are injected per probe kind

pub mod active;
pub mod interval;
pub mod settings;
pub mod state;
pub mod tcp;
pub mod transport;

pub use active::{HealthCheckStats, HealthChecker};
pub use settings::{HealthCheckSettings, ProbePayload};
pub use state::{HealthCheckSession, HealthTransition, ProbeOutcome, SessionState};
pub use tcp::{TcpHealthCheckMatcher, TcpProbeTransport};
pub use transport::{ProbeError, ProbeResponse, ProbeTransport, ProbeTransportRegistry};
