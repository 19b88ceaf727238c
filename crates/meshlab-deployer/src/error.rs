//! Backend and deployer error types.

use meshlab_core::{LabState, TopologyError};
use meshlab_placement::PlacementError;
use thiserror::Error;

/// Errors reported by a provisioning backend.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BackendError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("backend unavailable: {0}")]
    Unavailable(String),

    #[error("{resource}: {message}")]
    Operation { resource: String, message: String },
}

impl BackendError {
    pub fn operation(resource: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Operation {
            resource: resource.into(),
            message: message.into(),
        }
    }
}

pub type BackendResult<T> = Result<T, BackendError>;

/// One resource that could not be provisioned or removed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    /// `unit:<device>`, `segment:<lan>`, `attach:<device>:<iface>`, ...
    pub resource: String,
    pub error: BackendError,
}

impl std::fmt::Display for Failure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.resource, self.error)
    }
}

/// Errors that can occur during deploy, undeploy and info queries.
#[derive(Debug, Error)]
pub enum DeployError {
    #[error(transparent)]
    Topology(#[from] TopologyError),

    #[error(transparent)]
    Placement(#[from] PlacementError),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error("{} resources failed: {}", .failures.len(), summarize(.failures))]
    Partial { failures: Vec<Failure> },

    #[error("lab {lab} cannot move from {from} to {to}")]
    InvalidTransition {
        lab: String,
        from: LabState,
        to: LabState,
    },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl DeployError {
    /// Failures collected by a partial deploy or undeploy, empty otherwise.
    pub fn failures(&self) -> &[Failure] {
        match self {
            DeployError::Partial { failures } => failures,
            _ => &[],
        }
    }
}

fn summarize(failures: &[Failure]) -> String {
    failures
        .iter()
        .map(Failure::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

pub type DeployResult<T> = Result<T, DeployError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_lists_every_failure() {
        let err = DeployError::Partial {
            failures: vec![
                Failure {
                    resource: "unit:r1".into(),
                    error: BackendError::operation("r1", "image missing"),
                },
                Failure {
                    resource: "segment:A".into(),
                    error: BackendError::NotFound("A".into()),
                },
            ],
        };
        let msg = err.to_string();
        assert!(msg.starts_with("2 resources failed"));
        assert!(msg.contains("unit:r1: r1: image missing"));
        assert_eq!(err.failures().len(), 2);
    }

    #[test]
    fn name_conflicts_surface_through_topology() {
        let err: DeployError = TopologyError::NameConflict {
            kind: "device",
            name: "bad name".into(),
        }
        .into();
        assert!(matches!(err, DeployError::Topology(TopologyError::NameConflict { .. })));
        assert!(err.failures().is_empty());
    }
}
