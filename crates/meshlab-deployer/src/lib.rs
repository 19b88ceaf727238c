//! meshlab-deployer — brings labs up and down on a provisioning backend.
//!
//! The [`Deployer`] drives any [`Backend`] through the lab lifecycle:
//!
//! ```text
//! Deployer
//!   ├── Scheduler (placement constraint per lab)
//!   ├── Backend (boundary, units, segments)
//!   │     ├── DockerBackend (volume, containers, bridge networks)
//!   │     └── MemoryBackend (in-process, multi-node)
//!   └── Per-lab lock + LabState
//! ```
//!
//! Deploy and undeploy are idempotent: conflicts on create and misses on
//! delete are absorbed, so both can be retried after a partial failure.

pub mod backend;
pub mod deployer;
pub mod docker;
pub mod error;
pub mod info;
pub mod memory;

use std::sync::Arc;

use meshlab_core::Settings;

pub use backend::{Backend, ExecOutput, SegmentHandle, SegmentInfo, UnitHandle, UnitInfo, UnitSpec};
pub use deployer::Deployer;
pub use docker::DockerBackend;
pub use error::{BackendError, BackendResult, DeployError, DeployResult, Failure};
pub use info::LabInfo;
pub use memory::{FailPoint, MemoryBackend};

/// Build the backend named by `general.backend`.
pub fn connect_backend(settings: &Settings) -> BackendResult<Arc<dyn Backend>> {
    match settings.general.backend.as_str() {
        "memory" => Ok(Arc::new(MemoryBackend::with_node_names(
            &settings.deploy.memory_nodes,
        ))),
        "docker" => Ok(Arc::new(DockerBackend::connect(&settings.general)?)),
        other => Err(BackendError::operation(
            "backend",
            format!("unknown backend `{other}`"),
        )),
    }
}
