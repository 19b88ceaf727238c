//! Scheduler output: device groups bound to cluster nodes.

use std::collections::{BTreeMap, BTreeSet};

use meshlab_core::ClusterNode;
use serde::{Deserialize, Serialize};

/// One group of colocated devices and the node it is bound to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlacementGroup {
    pub node: ClusterNode,
    pub devices: BTreeSet<String>,
}

/// A partition of every device of a lab into node-bound groups.
///
/// Group `g` is bound to the `g`-th available node. Computed once per
/// deployment and passed to the deployer read-only.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlacementConstraint {
    /// Strategy that produced the groups.
    pub strategy: String,
    pub groups: Vec<PlacementGroup>,
}

impl PlacementConstraint {
    /// Node the device is bound to, if any.
    pub fn node_for(&self, device: &str) -> Option<&ClusterNode> {
        self.groups
            .iter()
            .find(|g| g.devices.contains(device))
            .map(|g| &g.node)
    }

    /// Device name → node name for every placed device.
    pub fn node_selectors(&self) -> BTreeMap<&str, &str> {
        self.groups
            .iter()
            .flat_map(|g| g.devices.iter().map(move |d| (d.as_str(), g.node.name.as_str())))
            .collect()
    }

    pub fn device_count(&self) -> usize {
        self.groups.iter().map(|g| g.devices.len()).sum()
    }

    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}
