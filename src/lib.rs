//! Upstream load balancing core.
//!
//! Picks one upstream host per request from a cluster of hosts spread over
//! priorities and localities, while an active health checker keeps each
//! host's health current.
//!
//! # Architecture Overview
//!
//! ```text
//!   config file ──▶ config ──▶ cluster::ClusterManager
//!                                   │ one control task per cluster
//!                                   ▼
//!                   ┌──────────── cluster::Cluster ─────────────┐
//!                   │  upstream::PrioritySet (hosts, health)    │
//!                   │  health::HealthChecker (probes, timers)   │
//!                   │  load_balancer (ring hash, subsets, ...)  │
//!                   └──────────────┬────────────────────────────┘
//!                                  │ ArcSwap snapshot
//!                                  ▼
//!   request ──▶ ClusterHandle::choose_host(context) ──▶ Option<HostRef>
//! ```
//!
//! Cross-cutting: `observability` (tracing, metrics), `lifecycle`
//! (shutdown), `error` (configuration errors).

// Core model
pub mod config;
pub mod error;
pub mod upstream;

// Traffic management
pub mod cluster;
pub mod health;
pub mod load_balancer;

// Cross-cutting concerns
pub mod lifecycle;
pub mod observability;

pub use cluster::{Cluster, ClusterHandle, ClusterManager, ClusterUpdate};
pub use config::UpstreamConfig;
pub use error::ConfigError;
pub use lifecycle::Shutdown;
pub use load_balancer::{LoadBalancer, LoadBalancerContext, RequestContext};
pub use upstream::{Host, HostRef};
