//! Shared types used across MeshLab crates.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A physical or virtual host that device units can be scheduled on.
///
/// Supplied by the backend; the core never creates nodes itself.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClusterNode {
    pub name: String,
}

impl ClusterNode {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl fmt::Display for ClusterNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Lifecycle phase of a lab as tracked by the deployer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LabState {
    Undeployed,
    Deploying,
    Deployed,
    Undeploying,
}

impl LabState {
    /// Whether the deployer may move a lab from `self` to `next`.
    ///
    /// A partially deployed lab stays `Deploying`, so both a retry
    /// (`Deploying -> Deploying`) and a teardown
    /// (`Deploying -> Undeploying`) are allowed. A failed teardown stays
    /// `Undeploying` and may be retried or redeployed. Removing only some
    /// devices leaves the lab `Deploying`, since `Deployed` always means
    /// every device is up.
    pub fn can_transition(self, next: LabState) -> bool {
        use LabState::*;
        matches!(
            (self, next),
            (Undeployed, Deploying)
                | (Deploying, Deploying)
                | (Deploying, Deployed)
                | (Deploying, Undeploying)
                | (Deployed, Undeploying)
                | (Undeploying, Undeploying)
                | (Undeploying, Undeployed)
                | (Undeploying, Deploying)
        )
    }

    pub fn label(&self) -> &'static str {
        match self {
            LabState::Undeployed => "UNDEPLOYED",
            LabState::Deploying => "DEPLOYING",
            LabState::Deployed => "DEPLOYED",
            LabState::Undeploying => "UNDEPLOYING",
        }
    }
}

impl fmt::Display for LabState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}
