//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! Ring builds, health checks, subset updates produce:
//!     → tracing events (structured key/value fields)
//!     → metrics.rs (counters, gauges, histograms)
//!
//! Consumers:
//!     → logging.rs subscriber (stdout)
//!     → Metrics endpoint (Prometheus scrape)
//! ```
//!
//! # Design Decisions
//! - Structured logging with host address and priority fields
//! - Metrics are cheap (atomic increments)

pub mod logging;
pub mod metrics;
