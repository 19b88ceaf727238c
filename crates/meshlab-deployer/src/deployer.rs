//! Lifecycle deployer — turns a lab plus a placement into backend resources.
//!
//! Deploy order for one lab:
//! 1. boundary (once, before any per-device work)
//! 2. units and segments, each bounded by `deploy.parallelism`
//! 3. per device: attach interfaces in ascending order, start, run startup
//!    when this deploy is the one that started the unit
//!
//! Conflicts on create and misses on delete are not errors. Everything
//! else is collected and reported as one [`DeployError::Partial`] after
//! all independent work ran, except an unavailable backend which aborts
//! immediately.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures_util::{StreamExt, stream};
use meshlab_core::config::Settings;
use meshlab_core::topology::Device;
use meshlab_core::{Lab, LabHash, LabState, TopologyError};
use meshlab_placement::{PlacementConstraint, Scheduler};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, error, info, warn};

use crate::backend::{Backend, SegmentHandle, UnitHandle, UnitSpec};
use crate::error::{BackendError, DeployError, DeployResult, Failure};
use crate::info::LabInfo;

/// Resolve a device script against the lab directory.
fn resolve_script(lab_dir: Option<&Path>, script: &Path) -> PathBuf {
    match lab_dir {
        Some(dir) if script.is_relative() => dir.join(script),
        _ => script.to_path_buf(),
    }
}

fn failure(resource: String, error: BackendError) -> Failure {
    Failure { resource, error }
}

/// The first unavailable-backend failure, if any.
fn unavailable(failures: &[Failure]) -> Option<BackendError> {
    failures
        .iter()
        .find(|f| matches!(f.error, BackendError::Unavailable(_)))
        .map(|f| f.error.clone())
}

/// Deploys and tears down labs on one backend.
///
/// Operations on the same lab identity are serialized; different labs
/// proceed concurrently.
pub struct Deployer {
    backend: Arc<dyn Backend>,
    scheduler: Scheduler,
    image: String,
    shell: String,
    parallelism: usize,
    locks: Mutex<HashMap<LabHash, Arc<AsyncMutex<()>>>>,
    states: Mutex<HashMap<LabHash, LabState>>,
}

impl Deployer {
    pub fn new(backend: Arc<dyn Backend>, settings: &Settings) -> Self {
        Self {
            backend,
            scheduler: Scheduler::from_settings(&settings.scheduler),
            image: settings.general.image.clone(),
            shell: settings.general.device_shell.clone(),
            parallelism: settings.deploy.parallelism.max(1),
            locks: Mutex::new(HashMap::new()),
            states: Mutex::new(HashMap::new()),
        }
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn scheduler_mut(&mut self) -> &mut Scheduler {
        &mut self.scheduler
    }

    /// State this deployer last recorded for `lab`.
    pub fn state(&self, lab: &LabHash) -> Option<LabState> {
        self.states().get(lab).copied()
    }

    fn states(&self) -> MutexGuard<'_, HashMap<LabHash, LabState>> {
        self.states.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_for(&self, lab: &LabHash) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks.entry(lab.clone()).or_default().clone()
    }

    fn transition(&self, lab: &LabHash, from: LabState, to: LabState) -> DeployResult<()> {
        if !from.can_transition(to) {
            return Err(DeployError::InvalidTransition {
                lab: lab.to_string(),
                from,
                to,
            });
        }
        let mut states = self.states();
        if to == LabState::Undeployed {
            states.remove(lab);
        } else {
            states.insert(lab.clone(), to);
        }
        info!(lab = %lab, %from, %to, "lab state changed");
        Ok(())
    }

    /// Schedule `lab` over the nodes the backend currently offers.
    ///
    /// `None` arguments fall back to the scheduler settings.
    pub async fn compute_constraints(
        &self,
        lab: &Lab,
        strategy: Option<&str>,
        use_semantic: Option<bool>,
    ) -> DeployResult<PlacementConstraint> {
        let nodes = self.backend.list_nodes().await?;
        let strategy = strategy.unwrap_or(self.scheduler.default_strategy());
        let semantic = use_semantic.unwrap_or(self.scheduler.semantic());
        Ok(self
            .scheduler
            .compute_constraints(lab, &nodes, strategy, semantic)?)
    }

    /// Deploy `lab`, pinning units to nodes when `constraint` is given.
    ///
    /// Deploying a lab this deployer already brought to `Deployed` is a
    /// no-op. Otherwise every step is idempotent, so a retry after a
    /// partial failure only creates what is still missing. Startup
    /// commands run in a unit whenever this deploy moved it from stopped
    /// to running.
    pub async fn deploy(
        &self,
        lab: &Lab,
        constraint: Option<&PlacementConstraint>,
    ) -> DeployResult<LabHash> {
        self.deploy_selected(lab, constraint, None).await
    }

    /// Deploy only the named devices of `lab` and the segments they use.
    ///
    /// The lab becomes `Deployed` once every one of its devices exists on
    /// the backend, and stays `Deploying` until then. An empty list
    /// deploys the whole lab.
    pub async fn deploy_devices(
        &self,
        lab: &Lab,
        constraint: Option<&PlacementConstraint>,
        devices: &[String],
    ) -> DeployResult<LabHash> {
        self.deploy_selected(lab, constraint, Some(devices)).await
    }

    async fn deploy_selected(
        &self,
        lab: &Lab,
        constraint: Option<&PlacementConstraint>,
        filter: Option<&[String]>,
    ) -> DeployResult<LabHash> {
        lab.validate_names()?;
        let mut lab = lab.clone();
        lab.check();
        let hash = lab.identity()?;

        let filter = filter.filter(|f| !f.is_empty());
        if let Some(unknown) = filter
            .into_iter()
            .flatten()
            .find(|name| lab.device(name).is_none())
        {
            let message = format!("unknown device `{unknown}`");
            return Err(TopologyError::InvalidTopology(message).into());
        }
        let selected: Vec<&Device> = lab
            .devices()
            .filter(|d| filter.is_none_or(|f| f.contains(&d.name)))
            .collect();
        let lans: BTreeSet<&str> = match filter {
            Some(_) => selected.iter().copied().flat_map(Device::lans).collect(),
            None => lab.lans().map(|lan| lan.name.as_str()).collect(),
        };

        let lock = self.lock_for(&hash);
        let _guard = lock.lock().await;

        let from = self.state(&hash).unwrap_or(LabState::Undeployed);
        if from == LabState::Deployed {
            info!(lab = %hash, "lab already deployed");
            return Ok(hash);
        }
        self.transition(&hash, from, LabState::Deploying)?;

        match self.backend.create_boundary(&hash).await {
            Ok(()) => info!(lab = %hash, backend = self.backend.name(), "boundary created"),
            Err(BackendError::AlreadyExists(_)) => {
                warn!(lab = %hash, "boundary already exists, reusing it")
            }
            Err(e) => return Err(e.into()),
        }

        let mut failures = Vec::new();

        let hash_ref = &hash;
        let lab_ref = &lab;
        let units: Vec<(&Device, Result<UnitHandle, Failure>)> =
            stream::iter(selected.iter().copied())
                .map(move |device| async move {
                    (device, self.create_unit(lab_ref, hash_ref, device, constraint).await)
                })
                .buffer_unordered(self.parallelism)
                .collect()
                .await;

        let segments: Vec<Result<SegmentHandle, Failure>> = stream::iter(lans)
            .map(move |lan| async move { self.create_segment(hash_ref, lan).await })
            .buffer_unordered(self.parallelism)
            .collect()
            .await;

        let mut ready = Vec::new();
        for (device, result) in units {
            match result {
                Ok(unit) => ready.push((device, unit)),
                Err(f) => failures.push(f),
            }
        }
        let mut by_lan = HashMap::new();
        for result in segments {
            match result {
                Ok(segment) => {
                    by_lan.insert(segment.lan.clone(), segment);
                }
                Err(f) => failures.push(f),
            }
        }
        if let Some(e) = unavailable(&failures) {
            return Err(e.into());
        }

        let by_lan = &by_lan;
        let wired: Vec<Vec<Failure>> = stream::iter(ready)
            .map(move |(device, unit)| async move {
                self.wire_device(lab_ref, device, &unit, by_lan).await
            })
            .buffer_unordered(self.parallelism)
            .collect()
            .await;
        failures.extend(wired.into_iter().flatten());
        if let Some(e) = unavailable(&failures) {
            return Err(e.into());
        }

        if !failures.is_empty() {
            for f in &failures {
                error!(lab = %hash, resource = %f.resource, error = %f.error, "deploy step failed");
            }
            failures.sort_by(|a, b| a.resource.cmp(&b.resource));
            return Err(DeployError::Partial { failures });
        }

        if filter.is_some() {
            let present: BTreeSet<String> = self
                .backend
                .list_units(&hash)
                .await?
                .into_iter()
                .map(|u| u.device)
                .collect();
            let missing = lab.devices().filter(|d| !present.contains(&d.name)).count();
            if missing > 0 {
                info!(lab = %hash, devices = selected.len(), missing, "devices deployed");
                return Ok(hash);
            }
        }

        self.transition(&hash, LabState::Deploying, LabState::Deployed)?;
        info!(lab = %hash, devices = lab.device_count(), lans = lab.lan_count(), "lab deployed");
        Ok(hash)
    }

    async fn unit_spec(
        &self,
        lab: &Lab,
        device: &Device,
        constraint: Option<&PlacementConstraint>,
    ) -> Result<UnitSpec, BackendError> {
        let mut shutdown_commands = Vec::new();
        if let Some(script) = &device.shutdown {
            let path = resolve_script(lab.path(), script);
            let body = tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| BackendError::operation(path.display().to_string(), e.to_string()))?;
            shutdown_commands.push(body);
        }

        Ok(UnitSpec {
            device: device.name.clone(),
            image: device.image.clone().unwrap_or_else(|| self.image.clone()),
            node: constraint.and_then(|c| c.node_for(&device.name)).cloned(),
            interfaces: device.interfaces.clone(),
            shutdown_commands,
            shell: self.shell.clone(),
            meta: device.meta.clone(),
        })
    }

    async fn create_unit(
        &self,
        lab: &Lab,
        hash: &LabHash,
        device: &Device,
        constraint: Option<&PlacementConstraint>,
    ) -> Result<UnitHandle, Failure> {
        let resource = format!("unit:{}", device.name);
        let spec = self
            .unit_spec(lab, device, constraint)
            .await
            .map_err(|e| failure(resource.clone(), e))?;

        match self.backend.create_unit(hash, &spec).await {
            Ok(unit) => {
                info!(
                    lab = %hash,
                    device = %device.name,
                    node = spec.node.as_ref().map(|n| n.name.as_str()).unwrap_or("-"),
                    "unit created"
                );
                Ok(unit)
            }
            Err(BackendError::AlreadyExists(_)) => {
                warn!(lab = %hash, device = %device.name, "unit already exists, reusing it");
                Ok(self.backend.unit_handle(hash, &device.name))
            }
            Err(e) => Err(failure(resource, e)),
        }
    }

    async fn create_segment(&self, hash: &LabHash, lan: &str) -> Result<SegmentHandle, Failure> {
        match self.backend.create_segment(hash, lan).await {
            Ok(segment) => {
                info!(lab = %hash, lan, "segment created");
                Ok(segment)
            }
            Err(BackendError::AlreadyExists(_)) => {
                warn!(lab = %hash, lan, "segment already exists, reusing it");
                Ok(self.backend.segment_handle(hash, lan))
            }
            Err(e) => Err(failure(format!("segment:{lan}"), e)),
        }
    }

    /// Attach interfaces in ascending order, start the unit, then run
    /// startup commands if the unit was stopped.
    ///
    /// A unit left stopped by an earlier failure gets its startup on the
    /// next deploy. A unit that was already running is not started twice.
    async fn wire_device(
        &self,
        lab: &Lab,
        device: &Device,
        unit: &UnitHandle,
        segments: &HashMap<String, SegmentHandle>,
    ) -> Vec<Failure> {
        if let Some(lan) = device.lans().into_iter().find(|lan| !segments.contains_key(*lan)) {
            warn!(device = %device.name, lan, "segment missing, device left stopped");
            return Vec::new();
        }

        for (&interface, lan) in &device.interfaces {
            let Some(segment) = segments.get(lan) else {
                continue;
            };
            match self.backend.attach_interface(segment, unit, interface).await {
                Ok(()) => debug!(device = %device.name, interface, lan = %lan, "interface attached"),
                Err(BackendError::AlreadyExists(_)) => {
                    debug!(device = %device.name, interface, "interface already attached")
                }
                Err(e) => {
                    return vec![failure(format!("attach:{}:{interface}", device.name), e)];
                }
            }
        }

        match self.backend.start_unit(unit).await {
            Ok(true) => debug!(device = %device.name, "unit started"),
            Ok(false) => {
                debug!(device = %device.name, "unit already running");
                return Vec::new();
            }
            Err(e) => return vec![failure(format!("start:{}", device.name), e)],
        }

        match self.run_startup(lab, device, unit).await {
            Ok(()) => Vec::new(),
            Err(e) => vec![failure(format!("startup:{}", device.name), e)],
        }
    }

    async fn run_startup(&self, lab: &Lab, device: &Device, unit: &UnitHandle) -> Result<(), BackendError> {
        let mut commands = Vec::new();
        if let Some(script) = &device.startup {
            let path = resolve_script(lab.path(), script);
            let body = tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| BackendError::operation(path.display().to_string(), e.to_string()))?;
            commands.push(body);
        }
        commands.extend(device.startup_commands.iter().cloned());

        for command in commands {
            let argv = vec![self.shell.clone(), "-c".to_string(), command];
            let output = self.backend.exec(unit, &argv).await?;
            if output.success() {
                debug!(device = %device.name, "startup command finished");
            } else {
                warn!(
                    device = %device.name,
                    exit_code = output.exit_code,
                    output = %output.output.trim_end(),
                    "startup command failed"
                );
            }
        }
        Ok(())
    }

    /// Remove the units of `lab`, or only the named ones.
    ///
    /// Segments no remaining unit is attached to are removed too, and the
    /// boundary goes once no unit is left. Undeploying a lab that has no
    /// resources is a no-op. A lab that keeps some of its units is
    /// `Deploying` afterwards, so the next deploy restores the rest.
    pub async fn undeploy(&self, lab: &LabHash, filter: Option<&[String]>) -> DeployResult<()> {
        let lock = self.lock_for(lab);
        let _guard = lock.lock().await;

        let exists = self.backend.boundary_exists(lab).await?;
        let units = self.backend.list_units(lab).await?;
        if !exists && units.is_empty() {
            debug!(lab = %lab, "nothing to undeploy");
            self.states().remove(lab);
            return Ok(());
        }

        let from = self.state(lab).unwrap_or(LabState::Deployed);
        self.transition(lab, from, LabState::Undeploying)?;

        let targets: Vec<String> = units
            .iter()
            .map(|u| u.device.clone())
            .filter(|d| filter.is_none_or(|f| f.is_empty() || f.contains(d)))
            .collect();

        let mut failures: Vec<Failure> = stream::iter(targets)
            .map(|device| async move {
                match self.backend.delete_unit(lab, &device).await {
                    Ok(()) | Err(BackendError::NotFound(_)) => None,
                    Err(e) => Some(failure(format!("unit:{device}"), e)),
                }
            })
            .buffer_unordered(self.parallelism)
            .filter_map(|f| async move { f })
            .collect()
            .await;
        if let Some(e) = unavailable(&failures) {
            return Err(e.into());
        }

        let remaining: BTreeSet<String> = self
            .backend
            .list_units(lab)
            .await?
            .into_iter()
            .map(|u| u.device)
            .collect();

        for segment in self.backend.list_segments(lab).await? {
            let in_use = segment.endpoints.iter().any(|(d, _)| remaining.contains(d));
            if in_use {
                continue;
            }
            match self.backend.delete_segment(lab, &segment.lan).await {
                Ok(()) => info!(lab = %lab, lan = %segment.lan, "segment deleted"),
                Err(BackendError::NotFound(_)) => {}
                Err(e) => failures.push(failure(format!("segment:{}", segment.lan), e)),
            }
        }

        if remaining.is_empty() {
            match self.backend.delete_boundary(lab).await {
                Ok(()) => info!(lab = %lab, "boundary deleted"),
                Err(BackendError::NotFound(_)) => {}
                Err(e) => failures.push(failure("boundary".to_string(), e)),
            }
        }

        if !failures.is_empty() {
            for f in &failures {
                error!(lab = %lab, resource = %f.resource, error = %f.error, "undeploy step failed");
            }
            failures.sort_by(|a, b| a.resource.cmp(&b.resource));
            return Err(DeployError::Partial { failures });
        }

        if remaining.is_empty() {
            self.transition(lab, LabState::Undeploying, LabState::Undeployed)?;
            info!(lab = %lab, "lab undeployed");
        } else {
            self.transition(lab, LabState::Undeploying, LabState::Deploying)?;
            info!(lab = %lab, remaining = remaining.len(), "devices undeployed");
        }
        Ok(())
    }

    /// Undeploy every lab the backend holds a boundary for.
    pub async fn undeploy_all(&self) -> DeployResult<Vec<LabHash>> {
        let labs = self.backend.list_boundaries().await?;
        let mut failures = Vec::new();

        for lab in &labs {
            match self.undeploy(lab, None).await {
                Ok(()) => {}
                Err(DeployError::Partial { failures: f }) => failures.extend(f),
                Err(DeployError::Backend(e @ BackendError::Unavailable(_))) => return Err(e.into()),
                Err(DeployError::Backend(e)) => failures.push(failure(format!("lab:{lab}"), e)),
                Err(e) => failures.push(failure(
                    format!("lab:{lab}"),
                    BackendError::operation(lab.as_str(), e.to_string()),
                )),
            }
        }

        if !failures.is_empty() {
            return Err(DeployError::Partial { failures });
        }
        info!(labs = labs.len(), "all labs undeployed");
        Ok(labs)
    }

    /// Devices, nodes and segments currently deployed for `lab`.
    pub async fn get_lab_info(&self, lab: &LabHash, filter: Option<&[String]>) -> DeployResult<LabInfo> {
        let devices = self.backend.list_units(lab).await?;
        let segments = self.backend.list_segments(lab).await?;
        let state = match self.state(lab) {
            Some(state) => state,
            None if devices.is_empty() && segments.is_empty() => LabState::Undeployed,
            None => LabState::Deployed,
        };

        let info = LabInfo {
            lab: lab.clone(),
            state,
            devices,
            segments,
        };
        Ok(match filter {
            Some(f) => info.filtered(f),
            None => info,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBackend;

    #[test]
    fn scripts_resolve_against_lab_dir() {
        let dir = Path::new("/labs/one");
        assert_eq!(
            resolve_script(Some(dir), Path::new("r1.startup")),
            PathBuf::from("/labs/one/r1.startup")
        );
        assert_eq!(
            resolve_script(Some(dir), Path::new("/etc/run.sh")),
            PathBuf::from("/etc/run.sh")
        );
        assert_eq!(resolve_script(None, Path::new("x")), PathBuf::from("x"));
    }

    #[test]
    fn invalid_transitions_are_rejected() {
        let d = Deployer::new(Arc::new(MemoryBackend::default()), &Settings::default());
        let lab = LabHash::from_raw("abc");
        let err = d
            .transition(&lab, LabState::Undeployed, LabState::Deployed)
            .unwrap_err();
        assert!(matches!(err, DeployError::InvalidTransition { .. }));
        assert_eq!(d.state(&lab), None);

        d.transition(&lab, LabState::Undeployed, LabState::Deploying).unwrap();
        assert_eq!(d.state(&lab), Some(LabState::Deploying));
    }

    #[tokio::test]
    async fn same_lab_shares_one_lock() {
        let d = Deployer::new(Arc::new(MemoryBackend::default()), &Settings::default());
        let a = LabHash::from_raw("aaa");
        let b = LabHash::from_raw("bbb");
        assert!(Arc::ptr_eq(&d.lock_for(&a), &d.lock_for(&a)));
        assert!(!Arc::ptr_eq(&d.lock_for(&a), &d.lock_for(&b)));

        let held = d.lock_for(&a);
        let _guard = held.lock().await;
        assert!(d.lock_for(&a).try_lock().is_err());
        assert!(d.lock_for(&b).try_lock().is_ok());
    }
}
