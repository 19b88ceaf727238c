//! meshlab-core — shared types for MeshLab.
//!
//! Holds the in-memory topology model of a lab (devices, collision
//! domains and the interfaces binding them), the cluster node type the
//! scheduler places devices on, the namespace identity derived from a
//! lab path, and the `meshlab.toml` settings file.
//!
//! Nothing in this crate performs backend I/O.

pub mod config;
pub mod error;
pub mod identity;
pub mod names;
pub mod topology;
pub mod types;

pub use config::Settings;
pub use error::{ConfigError, TopologyError, TopologyResult};
pub use identity::LabHash;
pub use topology::{Device, Lab, Lan};
pub use types::*;
