//! Upstream entity model.
//!
//! # Data Flow
//! ```text
//! discovery (membership delta: priority, added, removed)
//!     → priority_set.rs (dense levels, copy-on-write per level)
//!     → host_set.rs (hosts + healthy/degraded partitions, per locality)
//!
//! health checker flips a host flag (host.rs)
//!     → host_set.rs partitions recomputed on refresh
//! ```
//!
//! # Design Decisions
//! - Hosts are `Arc`-shared; nothing owns them exclusively
//! - Partitions are derived data, never edited directly
//! - Localities sort deterministically so weights align across rebuilds

pub mod host;
pub mod host_set;
pub mod metadata;
pub mod priority_set;

pub use host::{HealthState, Host, HostRef, Locality};
pub use host_set::{HostSet, HostsPerLocality};
pub use metadata::{describe_metadata, MetadataMatchCriteria, MetadataValue, SubsetMetadata};
pub use priority_set::PrioritySet;
