//! Placement error types.

use thiserror::Error;

/// Errors that can occur while computing a placement.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PlacementError {
    #[error("invalid scheduler input: {0}")]
    InvalidInput(String),

    #[error("cannot build {requested} non-empty groups from {devices} devices")]
    TooManyGroups { requested: usize, devices: usize },

    #[error("unknown placement strategy: {0}")]
    UnknownStrategy(String),

    #[error("strategy `{strategy}` returned an invalid partition: {reason}")]
    InvalidPartition { strategy: String, reason: String },

    #[error(transparent)]
    Topology(#[from] meshlab_core::TopologyError),
}

pub type PlacementResult<T> = Result<T, PlacementError>;
