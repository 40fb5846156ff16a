//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → Trigger graceful shutdown
//!
//! Shutdown (shutdown.rs):
//!     Trigger → cluster control loops exit → health checks cancel
//!     in-flight probes → drain with deadline → Exit
//! ```
//!
//! # Design Decisions
//! - One broadcast channel; every control loop subscribes
//! - Shutdown has timeout: loops still running after the deadline are aborted

pub mod shutdown;
pub mod signals;

pub use shutdown::Shutdown;
