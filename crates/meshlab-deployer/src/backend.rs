//! Provisioning backend capability set.
//!
//! A backend owns three kinds of resources for a lab, all addressable from
//! the lab identity alone:
//!
//! - the **boundary**, created once and holding everything else
//! - one **unit** per device, optionally pinned to a cluster node
//! - one **segment** per collision domain, with unit interfaces attached
//!
//! Handles are deterministic: `unit_handle` and `segment_handle` rebuild
//! them from the identity and a name, so an interrupted deploy can always
//! be found and cleaned up later.

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::pin::Pin;

use meshlab_core::{ClusterNode, LabHash};
use serde::{Deserialize, Serialize};

use crate::error::BackendResult;

/// Boxed future returned by every backend call.
pub type BackendFuture<'a, T> = Pin<Box<dyn Future<Output = BackendResult<T>> + Send + 'a>>;

/// Address of one device unit.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UnitHandle {
    pub lab: LabHash,
    pub device: String,
    /// Backend resource name (container name, pod name, ...).
    pub id: String,
}

/// Address of one collision-domain segment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SegmentHandle {
    pub lab: LabHash,
    pub lan: String,
    pub id: String,
}

/// Everything a backend needs to create a device unit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnitSpec {
    pub device: String,
    pub image: String,
    /// Node-affinity hint from the placement constraint.
    pub node: Option<ClusterNode>,
    /// Interface number → collision domain, as declared by the lab.
    pub interfaces: BTreeMap<u32, String>,
    /// Commands run inside the unit right before it is deleted.
    pub shutdown_commands: Vec<String>,
    /// Shell the shutdown commands are run with (`<shell> -c <command>`).
    pub shell: String,
    pub meta: BTreeMap<String, String>,
}

/// A unit as reported by the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitInfo {
    pub device: String,
    pub id: String,
    pub node: Option<ClusterNode>,
    pub running: bool,
    pub interfaces: BTreeMap<u32, String>,
}

/// A segment as reported by the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentInfo {
    pub lan: String,
    pub id: String,
    /// Attached `(device, interface)` pairs.
    pub endpoints: BTreeSet<(String, u32)>,
}

impl SegmentInfo {
    pub fn devices(&self) -> BTreeSet<&str> {
        self.endpoints.iter().map(|(d, _)| d.as_str()).collect()
    }
}

/// Result of a command run inside a unit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub exit_code: i64,
    pub output: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Capability set every provisioning backend implements.
///
/// Create calls return `BackendError::AlreadyExists` for resources that
/// are already there and delete calls return `BackendError::NotFound` for
/// resources that are gone. The deployer decides which of those matter.
pub trait Backend: Send + Sync {
    /// Short backend name for logs.
    fn name(&self) -> &'static str;

    /// Nodes units can be placed on, in a stable order.
    fn list_nodes(&self) -> BackendFuture<'_, Vec<ClusterNode>>;

    fn boundary_exists<'a>(&'a self, lab: &'a LabHash) -> BackendFuture<'a, bool>;

    fn create_boundary<'a>(&'a self, lab: &'a LabHash) -> BackendFuture<'a, ()>;

    fn delete_boundary<'a>(&'a self, lab: &'a LabHash) -> BackendFuture<'a, ()>;

    /// Every lab this backend holds a boundary for.
    fn list_boundaries(&self) -> BackendFuture<'_, Vec<LabHash>>;

    /// Create the unit of `spec.device`. The unit is not started.
    fn create_unit<'a>(&'a self, lab: &'a LabHash, spec: &'a UnitSpec) -> BackendFuture<'a, UnitHandle>;

    fn unit_handle(&self, lab: &LabHash, device: &str) -> UnitHandle;

    /// Start a created unit.
    ///
    /// Returns `true` when this call moved the unit from stopped to
    /// running and `false` when it was already running.
    fn start_unit<'a>(&'a self, unit: &'a UnitHandle) -> BackendFuture<'a, bool>;

    /// Run the recorded shutdown commands, then delete the unit.
    fn delete_unit<'a>(&'a self, lab: &'a LabHash, device: &'a str) -> BackendFuture<'a, ()>;

    fn list_units<'a>(&'a self, lab: &'a LabHash) -> BackendFuture<'a, Vec<UnitInfo>>;

    fn create_segment<'a>(&'a self, lab: &'a LabHash, lan: &'a str) -> BackendFuture<'a, SegmentHandle>;

    fn segment_handle(&self, lab: &LabHash, lan: &str) -> SegmentHandle;

    /// Attach interface `interface` of `unit` to `segment`.
    fn attach_interface<'a>(
        &'a self,
        segment: &'a SegmentHandle,
        unit: &'a UnitHandle,
        interface: u32,
    ) -> BackendFuture<'a, ()>;

    fn delete_segment<'a>(&'a self, lab: &'a LabHash, lan: &'a str) -> BackendFuture<'a, ()>;

    fn list_segments<'a>(&'a self, lab: &'a LabHash) -> BackendFuture<'a, Vec<SegmentInfo>>;

    /// Run `command` (argv) inside a running unit.
    fn exec<'a>(&'a self, unit: &'a UnitHandle, command: &'a [String]) -> BackendFuture<'a, ExecOutput>;
}
