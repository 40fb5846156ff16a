//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML, or JSON by extension)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks, every error collected)
//!     → UpstreamConfig (validated, immutable)
//!     → one ClusterConfig handed to each cluster control loop
//!
//! On file change:
//!     watcher.rs sees a write to the file (or a rename into place)
//!     → loader.rs loads and validates it
//!     → unchanged configurations are dropped
//!     → ClusterManager spawns, updates or stops clusters by name
//! ```
//!
//! # Design Decisions
//! - A cluster only ever sees a configuration that validated as a whole
//! - Almost every field has a default, so a cluster can be a name and hosts
//! - Validation reports every problem at once, with the field path

pub mod loader;
pub mod schema;
pub mod validation;
pub mod watcher;

pub use schema::ClusterConfig;
pub use schema::HealthCheckConfig;
pub use schema::RingHashConfig;
pub use schema::SubsetConfig;
pub use schema::UpstreamConfig;
