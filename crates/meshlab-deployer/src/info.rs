//! Read-only view of a deployed lab.

use meshlab_core::{LabHash, LabState};
use serde::Serialize;

use crate::backend::{SegmentInfo, UnitInfo};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LabInfo {
    pub lab: LabHash,
    pub state: LabState,
    pub devices: Vec<UnitInfo>,
    pub segments: Vec<SegmentInfo>,
}

impl LabInfo {
    /// Nothing of the lab is deployed.
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty() && self.segments.is_empty()
    }

    pub fn device(&self, name: &str) -> Option<&UnitInfo> {
        self.devices.iter().find(|d| d.device == name)
    }

    /// Keep only the named devices and the segments they are attached to.
    pub(crate) fn filtered(mut self, filter: &[String]) -> Self {
        if filter.is_empty() {
            return self;
        }
        self.devices.retain(|d| filter.contains(&d.device));
        self.segments
            .retain(|s| s.endpoints.iter().any(|(d, _)| filter.contains(d)));
        self
    }
}
