//! MeshLab placement scheduler — decides which cluster node each device runs on.
//!
//! The scheduler turns a lab topology into an affinity graph, partitions
//! that graph into one group per available node and returns the result
//! as a [`PlacementConstraint`] the deployer pins units with.
//!
//! # Components
//!
//! - **`affinity`** — adjacency matrix of shared collision domains
//! - **`hints`** — semantic routing-protocol hints layered on the matrix
//! - **`strategy`** — the partitioning capability and its registry
//! - **`round_robin`**, **`spectral`**, **`hierarchical`** — strategies
//! - **`scheduler`** — one-to-one fallback, validation, node binding

pub mod affinity;
pub mod constraint;
pub mod error;
pub mod hierarchical;
pub mod hints;
mod linalg;
pub mod round_robin;
pub mod scheduler;
pub mod spectral;
pub mod strategy;

pub use affinity::{AffinityGraph, AffinityMatrix, AffinityMode, LabelIndex};
pub use constraint::{PlacementConstraint, PlacementGroup};
pub use error::{PlacementError, PlacementResult};
pub use scheduler::{Scheduler, schedule};
pub use strategy::{PartitionStrategy, StrategyConfig, StrategyRegistry};
