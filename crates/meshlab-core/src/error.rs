//! Error types for the topology model and settings.

use thiserror::Error;

/// Result type alias for topology operations.
pub type TopologyResult<T> = Result<T, TopologyError>;

/// Errors raised while building or validating a lab topology.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TopologyError {
    #[error("invalid topology: {0}")]
    InvalidTopology(String),

    #[error("name `{name}` is not usable as a {kind} name")]
    NameConflict { kind: &'static str, name: String },

    #[error("interface {interface} already set on device `{device}`")]
    DuplicateInterface { device: String, interface: u32 },
}

/// Errors raised while loading `meshlab.toml`.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read settings: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse settings: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid settings: {0}")]
    Invalid(String),
}
