//! In-process multi-node backend.
//!
//! Keeps every lab in memory, records each call it receives and can be told
//! to fail specific operations. Used by tests and by `meshctl` with
//! `backend = "memory"` for dry runs.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use meshlab_core::{ClusterNode, LabHash};
use tracing::debug;

use crate::backend::{
    Backend, BackendFuture, ExecOutput, SegmentHandle, SegmentInfo, UnitHandle, UnitInfo, UnitSpec,
};
use crate::error::{BackendError, BackendResult};

/// An operation the backend should fail on.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FailPoint {
    CreateUnit(String),
    CreateSegment(String),
    /// Attaching any interface of this device.
    Attach(String),
    /// Starting this device.
    Start(String),
    /// Commands run inside this device exit with status 1.
    Exec(String),
    DeleteUnit(String),
}

#[derive(Debug)]
struct MemoryUnit {
    spec: UnitSpec,
    node: Option<ClusterNode>,
    running: bool,
    interfaces: BTreeMap<u32, String>,
}

#[derive(Debug, Default)]
struct MemoryLab {
    units: BTreeMap<String, MemoryUnit>,
    segments: BTreeMap<String, BTreeSet<(String, u32)>>,
}

#[derive(Debug, Default)]
struct Inner {
    labs: BTreeMap<LabHash, MemoryLab>,
    calls: Vec<String>,
    exec_log: Vec<(String, Vec<String>)>,
    failures: HashSet<FailPoint>,
    unavailable: bool,
}

impl Inner {
    fn record(&mut self, call: String) -> BackendResult<()> {
        self.calls.push(call);
        if self.unavailable {
            return Err(BackendError::Unavailable("memory backend switched off".into()));
        }
        Ok(())
    }

    fn lab(&mut self, lab: &LabHash) -> BackendResult<&mut MemoryLab> {
        self.labs
            .get_mut(lab)
            .ok_or_else(|| BackendError::NotFound(format!("boundary {lab}")))
    }
}

#[derive(Debug)]
pub struct MemoryBackend {
    nodes: Vec<ClusterNode>,
    inner: Mutex<Inner>,
}

fn ready<'a, T: Send + 'a>(result: BackendResult<T>) -> BackendFuture<'a, T> {
    Box::pin(std::future::ready(result))
}

impl MemoryBackend {
    pub fn new(nodes: Vec<ClusterNode>) -> Self {
        Self {
            nodes,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Backend exposing nodes named after `names`.
    pub fn with_node_names<S: AsRef<str>>(names: &[S]) -> Self {
        Self::new(names.iter().map(|n| ClusterNode::new(n.as_ref())).collect())
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn fail(&self, point: FailPoint) {
        self.inner().failures.insert(point);
    }

    pub fn clear_failures(&self) {
        self.inner().failures.clear();
    }

    /// Make every subsequent call fail with `BackendError::Unavailable`.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.inner().unavailable = unavailable;
    }

    /// Calls received so far, formatted as `operation:target`.
    pub fn calls(&self) -> Vec<String> {
        self.inner().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.inner().calls.clear();
    }

    /// `(device, argv)` of every command run inside a unit.
    pub fn exec_log(&self) -> Vec<(String, Vec<String>)> {
        self.inner().exec_log.clone()
    }

    fn unit_id(lab: &LabHash, device: &str) -> String {
        format!("{}-{device}", lab.short())
    }

    fn segment_id(lab: &LabHash, lan: &str) -> String {
        format!("{}-{lan}", lab.short())
    }

    fn run(inner: &mut Inner, device: &str, command: &[String]) -> ExecOutput {
        inner.exec_log.push((device.to_string(), command.to_vec()));
        let failing = inner.failures.contains(&FailPoint::Exec(device.to_string()));
        ExecOutput {
            exit_code: if failing { 1 } else { 0 },
            output: String::new(),
        }
    }

    fn pick_node(&self, hint: Option<&ClusterNode>) -> BackendResult<Option<ClusterNode>> {
        match hint {
            Some(node) if self.nodes.contains(node) => Ok(Some(node.clone())),
            Some(node) => Err(BackendError::operation(
                format!("node {node}"),
                "not a node of this backend",
            )),
            None => Ok(self.nodes.first().cloned()),
        }
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::with_node_names(&["node-1"])
    }
}

impl Backend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn list_nodes(&self) -> BackendFuture<'_, Vec<ClusterNode>> {
        let result = self.inner().record("list_nodes".into()).map(|_| self.nodes.clone());
        ready(result)
    }

    fn boundary_exists<'a>(&'a self, lab: &'a LabHash) -> BackendFuture<'a, bool> {
        let mut inner = self.inner();
        let result = inner
            .record(format!("boundary_exists:{lab}"))
            .map(|_| inner.labs.contains_key(lab));
        ready(result)
    }

    fn create_boundary<'a>(&'a self, lab: &'a LabHash) -> BackendFuture<'a, ()> {
        let mut inner = self.inner();
        let result = inner.record(format!("create_boundary:{lab}")).and_then(|_| {
            if inner.labs.contains_key(lab) {
                return Err(BackendError::AlreadyExists(format!("boundary {lab}")));
            }
            inner.labs.insert(lab.clone(), MemoryLab::default());
            Ok(())
        });
        ready(result)
    }

    fn delete_boundary<'a>(&'a self, lab: &'a LabHash) -> BackendFuture<'a, ()> {
        let mut inner = self.inner();
        let result = inner.record(format!("delete_boundary:{lab}")).and_then(|_| {
            inner
                .labs
                .remove(lab)
                .map(|_| ())
                .ok_or_else(|| BackendError::NotFound(format!("boundary {lab}")))
        });
        ready(result)
    }

    fn list_boundaries(&self) -> BackendFuture<'_, Vec<LabHash>> {
        let mut inner = self.inner();
        let result = inner
            .record("list_boundaries".into())
            .map(|_| inner.labs.keys().cloned().collect());
        ready(result)
    }

    fn create_unit<'a>(&'a self, lab: &'a LabHash, spec: &'a UnitSpec) -> BackendFuture<'a, UnitHandle> {
        let mut inner = self.inner();
        let result = inner.record(format!("create_unit:{}", spec.device)).and_then(|_| {
            if inner.failures.contains(&FailPoint::CreateUnit(spec.device.clone())) {
                return Err(BackendError::operation(
                    format!("unit {}", spec.device),
                    "injected failure",
                ));
            }
            let node = self.pick_node(spec.node.as_ref())?;
            let record = inner.lab(lab)?;
            if record.units.contains_key(&spec.device) {
                return Err(BackendError::AlreadyExists(format!("unit {}", spec.device)));
            }
            record.units.insert(
                spec.device.clone(),
                MemoryUnit {
                    spec: spec.clone(),
                    node,
                    running: false,
                    interfaces: BTreeMap::new(),
                },
            );
            Ok(self.unit_handle(lab, &spec.device))
        });
        ready(result)
    }

    fn unit_handle(&self, lab: &LabHash, device: &str) -> UnitHandle {
        UnitHandle {
            lab: lab.clone(),
            device: device.to_string(),
            id: Self::unit_id(lab, device),
        }
    }

    fn start_unit<'a>(&'a self, unit: &'a UnitHandle) -> BackendFuture<'a, bool> {
        let mut inner = self.inner();
        let result = inner.record(format!("start_unit:{}", unit.device)).and_then(|_| {
            if inner.failures.contains(&FailPoint::Start(unit.device.clone())) {
                return Err(BackendError::operation(
                    format!("unit {}", unit.device),
                    "injected failure",
                ));
            }
            let record = inner.lab(&unit.lab)?;
            let u = record
                .units
                .get_mut(&unit.device)
                .ok_or_else(|| BackendError::NotFound(format!("unit {}", unit.device)))?;
            let started = !u.running;
            u.running = true;
            Ok(started)
        });
        ready(result)
    }

    fn delete_unit<'a>(&'a self, lab: &'a LabHash, device: &'a str) -> BackendFuture<'a, ()> {
        let mut inner = self.inner();
        let result = inner.record(format!("delete_unit:{device}")).and_then(|_| {
            if inner.failures.contains(&FailPoint::DeleteUnit(device.to_string())) {
                return Err(BackendError::operation(format!("unit {device}"), "injected failure"));
            }
            let record = inner.lab(lab)?;
            let unit = record
                .units
                .remove(device)
                .ok_or_else(|| BackendError::NotFound(format!("unit {device}")))?;
            for endpoints in record.segments.values_mut() {
                endpoints.retain(|(d, _)| d != device);
            }
            if unit.running {
                for command in &unit.spec.shutdown_commands {
                    let argv = vec![unit.spec.shell.clone(), "-c".to_string(), command.clone()];
                    Self::run(&mut inner, device, &argv);
                }
            }
            debug!(lab = %lab, device, "memory unit deleted");
            Ok(())
        });
        ready(result)
    }

    fn list_units<'a>(&'a self, lab: &'a LabHash) -> BackendFuture<'a, Vec<UnitInfo>> {
        let mut inner = self.inner();
        let result = inner.record(format!("list_units:{lab}")).map(|_| {
            inner
                .labs
                .get(lab)
                .map(|record| {
                    record
                        .units
                        .iter()
                        .map(|(device, u)| UnitInfo {
                            device: device.clone(),
                            id: Self::unit_id(lab, device),
                            node: u.node.clone(),
                            running: u.running,
                            interfaces: u.interfaces.clone(),
                        })
                        .collect()
                })
                .unwrap_or_default()
        });
        ready(result)
    }

    fn create_segment<'a>(&'a self, lab: &'a LabHash, lan: &'a str) -> BackendFuture<'a, SegmentHandle> {
        let mut inner = self.inner();
        let result = inner.record(format!("create_segment:{lan}")).and_then(|_| {
            if inner.failures.contains(&FailPoint::CreateSegment(lan.to_string())) {
                return Err(BackendError::operation(format!("segment {lan}"), "injected failure"));
            }
            let record = inner.lab(lab)?;
            if record.segments.contains_key(lan) {
                return Err(BackendError::AlreadyExists(format!("segment {lan}")));
            }
            record.segments.insert(lan.to_string(), BTreeSet::new());
            Ok(self.segment_handle(lab, lan))
        });
        ready(result)
    }

    fn segment_handle(&self, lab: &LabHash, lan: &str) -> SegmentHandle {
        SegmentHandle {
            lab: lab.clone(),
            lan: lan.to_string(),
            id: Self::segment_id(lab, lan),
        }
    }

    fn attach_interface<'a>(
        &'a self,
        segment: &'a SegmentHandle,
        unit: &'a UnitHandle,
        interface: u32,
    ) -> BackendFuture<'a, ()> {
        let mut inner = self.inner();
        let call = format!("attach_interface:{}:{interface}:{}", unit.device, segment.lan);
        let result = inner.record(call).and_then(|_| {
            if inner.failures.contains(&FailPoint::Attach(unit.device.clone())) {
                return Err(BackendError::operation(
                    format!("attach {}:{interface}", unit.device),
                    "injected failure",
                ));
            }
            let record = inner.lab(&segment.lab)?;
            let endpoints = record
                .segments
                .get_mut(&segment.lan)
                .ok_or_else(|| BackendError::NotFound(format!("segment {}", segment.lan)))?;
            let u = record
                .units
                .get_mut(&unit.device)
                .ok_or_else(|| BackendError::NotFound(format!("unit {}", unit.device)))?;
            if u.interfaces.contains_key(&interface) {
                return Err(BackendError::AlreadyExists(format!(
                    "interface {}:{interface}",
                    unit.device
                )));
            }
            u.interfaces.insert(interface, segment.lan.clone());
            endpoints.insert((unit.device.clone(), interface));
            Ok(())
        });
        ready(result)
    }

    fn delete_segment<'a>(&'a self, lab: &'a LabHash, lan: &'a str) -> BackendFuture<'a, ()> {
        let mut inner = self.inner();
        let result = inner.record(format!("delete_segment:{lan}")).and_then(|_| {
            let record = inner.lab(lab)?;
            record
                .segments
                .remove(lan)
                .ok_or_else(|| BackendError::NotFound(format!("segment {lan}")))?;
            for unit in record.units.values_mut() {
                unit.interfaces.retain(|_, l| l != lan);
            }
            Ok(())
        });
        ready(result)
    }

    fn list_segments<'a>(&'a self, lab: &'a LabHash) -> BackendFuture<'a, Vec<SegmentInfo>> {
        let mut inner = self.inner();
        let result = inner.record(format!("list_segments:{lab}")).map(|_| {
            inner
                .labs
                .get(lab)
                .map(|record| {
                    record
                        .segments
                        .iter()
                        .map(|(lan, endpoints)| SegmentInfo {
                            lan: lan.clone(),
                            id: Self::segment_id(lab, lan),
                            endpoints: endpoints.clone(),
                        })
                        .collect()
                })
                .unwrap_or_default()
        });
        ready(result)
    }

    fn exec<'a>(&'a self, unit: &'a UnitHandle, command: &'a [String]) -> BackendFuture<'a, ExecOutput> {
        let mut inner = self.inner();
        let result = inner.record(format!("exec:{}", unit.device)).and_then(|_| {
            let running = inner
                .lab(&unit.lab)?
                .units
                .get(&unit.device)
                .map(|u| u.running)
                .ok_or_else(|| BackendError::NotFound(format!("unit {}", unit.device)))?;
            if !running {
                return Err(BackendError::operation(
                    format!("unit {}", unit.device),
                    "not running",
                ));
            }
            Ok(Self::run(&mut inner, &unit.device, command))
        });
        ready(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lab() -> LabHash {
        meshlab_core::identity::derive_from_name("memory-test")
    }

    fn spec(device: &str, node: Option<&str>) -> UnitSpec {
        UnitSpec {
            device: device.into(),
            image: "img".into(),
            node: node.map(ClusterNode::new),
            shutdown_commands: vec!["echo bye".into()],
            shell: "/bin/ash".into(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn boundary_lifecycle() {
        let b = MemoryBackend::default();
        let lab = lab();
        assert!(!b.boundary_exists(&lab).await.unwrap());
        b.create_boundary(&lab).await.unwrap();
        assert_eq!(
            b.create_boundary(&lab).await.unwrap_err(),
            BackendError::AlreadyExists(format!("boundary {lab}"))
        );
        assert_eq!(b.list_boundaries().await.unwrap(), vec![lab.clone()]);
        b.delete_boundary(&lab).await.unwrap();
        assert!(matches!(b.delete_boundary(&lab).await, Err(BackendError::NotFound(_))));
    }

    #[tokio::test]
    async fn units_need_a_boundary() {
        let b = MemoryBackend::default();
        let err = b.create_unit(&lab(), &spec("r1", None)).await.unwrap_err();
        assert!(matches!(err, BackendError::NotFound(_)));
    }

    #[tokio::test]
    async fn units_are_pinned_to_hinted_node() {
        let b = MemoryBackend::with_node_names(&["n1", "n2"]);
        let lab = lab();
        b.create_boundary(&lab).await.unwrap();
        b.create_unit(&lab, &spec("r1", Some("n2"))).await.unwrap();
        b.create_unit(&lab, &spec("r2", None)).await.unwrap();
        assert!(b.create_unit(&lab, &spec("r3", Some("n9"))).await.is_err());

        let units = b.list_units(&lab).await.unwrap();
        assert_eq!(units[0].node, Some(ClusterNode::new("n2")));
        assert_eq!(units[1].node, Some(ClusterNode::new("n1")));
    }

    #[tokio::test]
    async fn attach_and_delete_keep_both_sides_consistent() {
        let b = MemoryBackend::default();
        let lab = lab();
        b.create_boundary(&lab).await.unwrap();
        let unit = b.create_unit(&lab, &spec("r1", None)).await.unwrap();
        let seg = b.create_segment(&lab, "A").await.unwrap();
        b.attach_interface(&seg, &unit, 0).await.unwrap();
        assert!(matches!(
            b.attach_interface(&seg, &unit, 0).await,
            Err(BackendError::AlreadyExists(_))
        ));

        let segments = b.list_segments(&lab).await.unwrap();
        assert_eq!(segments[0].devices(), ["r1"].into());

        b.start_unit(&unit).await.unwrap();
        b.delete_unit(&lab, "r1").await.unwrap();
        assert!(b.list_segments(&lab).await.unwrap()[0].endpoints.is_empty());
        assert_eq!(
            b.exec_log(),
            vec![(
                "r1".to_string(),
                vec!["/bin/ash".to_string(), "-c".into(), "echo bye".into()]
            )]
        );
    }

    #[tokio::test]
    async fn start_reports_whether_the_unit_was_stopped() {
        let b = MemoryBackend::default();
        let lab = lab();
        b.create_boundary(&lab).await.unwrap();
        let unit = b.create_unit(&lab, &spec("r1", None)).await.unwrap();

        b.fail(FailPoint::Start("r1".into()));
        assert!(b.start_unit(&unit).await.is_err());
        b.clear_failures();

        assert!(b.start_unit(&unit).await.unwrap());
        assert!(!b.start_unit(&unit).await.unwrap());
    }

    #[tokio::test]
    async fn exec_requires_running_unit() {
        let b = MemoryBackend::default();
        let lab = lab();
        b.create_boundary(&lab).await.unwrap();
        let unit = b.create_unit(&lab, &spec("r1", None)).await.unwrap();
        let cmd = vec!["true".to_string()];
        assert!(b.exec(&unit, &cmd).await.is_err());
        b.start_unit(&unit).await.unwrap();
        assert!(b.exec(&unit, &cmd).await.unwrap().success());

        b.fail(FailPoint::Exec("r1".into()));
        assert!(!b.exec(&unit, &cmd).await.unwrap().success());
    }

    #[tokio::test]
    async fn unavailable_backend_fails_everything() {
        let b = MemoryBackend::default();
        b.set_unavailable(true);
        assert!(matches!(b.list_nodes().await, Err(BackendError::Unavailable(_))));
        assert_eq!(b.calls(), vec!["list_nodes".to_string()]);
    }
}
