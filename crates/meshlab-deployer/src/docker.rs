//! Single-host Docker backend.
//!
//! | resource | Docker object |
//! |---|---|
//! | boundary | volume `{device_prefix}_{hash}`, mounted at `/shared` in every unit |
//! | unit | container `{device_prefix}_{device}_{hash}` |
//! | segment | internal bridge network `{net_prefix}_{short}_{lan}` |
//!
//! Every object carries the `meshlab.lab` label, so a lab can be listed
//! and removed from its identity alone.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use bollard::Docker;
use bollard::container::{
    Config, CreateContainerOptions, ListContainersOptions, RemoveContainerOptions,
    StopContainerOptions,
};
use bollard::errors::Error as DockerError;
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::image::CreateImageOptions;
use bollard::models::HostConfig;
use bollard::network::{
    ConnectNetworkOptions, CreateNetworkOptions, DisconnectNetworkOptions, ListNetworksOptions,
};
use bollard::volume::{CreateVolumeOptions, ListVolumesOptions, RemoveVolumeOptions};
use futures_util::StreamExt;
use meshlab_core::config::GeneralSettings;
use meshlab_core::{ClusterNode, LabHash};
use tracing::{debug, info, warn};

use crate::backend::{
    Backend, BackendFuture, ExecOutput, SegmentHandle, SegmentInfo, UnitHandle, UnitInfo, UnitSpec,
};
use crate::error::{BackendError, BackendResult};

const LAB_LABEL: &str = "meshlab.lab";
const DEVICE_LABEL: &str = "meshlab.device";
const LAN_LABEL: &str = "meshlab.lan";
const INTERFACES_LABEL: &str = "meshlab.interfaces";
const SHUTDOWN_LABEL: &str = "meshlab.shutdown";
const SHELL_LABEL: &str = "meshlab.shell";

/// Seconds Docker waits before killing a stopping unit.
const STOP_TIMEOUT: i64 = 3;

/// Translate a Docker API error for `resource`.
fn map_error(resource: &str, err: DockerError) -> BackendError {
    match err {
        DockerError::DockerResponseServerError {
            status_code: 404, ..
        } => BackendError::NotFound(resource.to_string()),
        // 304 is "already started" on container start.
        DockerError::DockerResponseServerError {
            status_code: 304 | 409,
            ..
        } => BackendError::AlreadyExists(resource.to_string()),
        DockerError::DockerResponseServerError {
            status_code,
            message,
        } => BackendError::operation(resource, format!("{status_code}: {message}")),
        e @ (DockerError::IOError { .. }
        | DockerError::HyperResponseError { .. }
        | DockerError::RequestTimeoutError) => BackendError::Unavailable(e.to_string()),
        other => BackendError::operation(resource, other.to_string()),
    }
}

/// `0=A,1=B` ↔ interface map, stored as a container label.
fn encode_interfaces(interfaces: &BTreeMap<u32, String>) -> String {
    interfaces
        .iter()
        .map(|(n, lan)| format!("{n}={lan}"))
        .collect::<Vec<_>>()
        .join(",")
}

fn decode_interfaces(raw: &str) -> BTreeMap<u32, String> {
    raw.split(',')
        .filter_map(|pair| {
            let (n, lan) = pair.split_once('=')?;
            Some((n.parse().ok()?, lan.to_string()))
        })
        .collect()
}

pub struct DockerBackend {
    docker: Docker,
    device_prefix: String,
    net_prefix: String,
    shell: String,
}

impl DockerBackend {
    /// Connect to the local Docker daemon.
    pub fn connect(settings: &GeneralSettings) -> BackendResult<Self> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| BackendError::Unavailable(format!("Docker not available: {e}")))?;
        Ok(Self::with_client(docker, settings))
    }

    pub fn with_client(docker: Docker, settings: &GeneralSettings) -> Self {
        Self {
            docker,
            device_prefix: settings.device_prefix.clone(),
            net_prefix: settings.net_prefix.clone(),
            shell: settings.device_shell.clone(),
        }
    }

    fn volume_name(&self, lab: &LabHash) -> String {
        format!("{}_{lab}", self.device_prefix)
    }

    fn container_name(&self, lab: &LabHash, device: &str) -> String {
        format!("{}_{device}_{lab}", self.device_prefix)
    }

    fn network_name(&self, lab: &LabHash, lan: &str) -> String {
        format!("{}_{}_{lan}", self.net_prefix, lab.short())
    }

    fn lab_filter(lab: &LabHash) -> HashMap<String, Vec<String>> {
        HashMap::from([("label".to_string(), vec![format!("{LAB_LABEL}={lab}")])])
    }

    async fn pull_image(&self, image: &str) -> BackendResult<()> {
        info!(image, "pulling image");
        let options = CreateImageOptions {
            from_image: image.to_string(),
            ..Default::default()
        };
        let mut stream = self.docker.create_image(Some(options), None, None);
        while let Some(progress) = stream.next().await {
            progress.map_err(|e| map_error(&format!("image {image}"), e))?;
        }
        Ok(())
    }

    async fn create_container(&self, name: &str, config: Config<String>) -> BackendResult<()> {
        let options = || CreateContainerOptions {
            name: name.to_string(),
            platform: None,
        };
        match self.docker.create_container(Some(options()), config.clone()).await {
            Ok(_) => Ok(()),
            // 404 on create means the image is missing locally.
            Err(DockerError::DockerResponseServerError {
                status_code: 404, ..
            }) => {
                let image = config.image.clone().unwrap_or_default();
                self.pull_image(&image).await?;
                self.docker
                    .create_container(Some(options()), config)
                    .await
                    .map(|_| ())
                    .map_err(|e| map_error(name, e))
            }
            Err(e) => Err(map_error(name, e)),
        }
    }

    async fn run(&self, container: &str, command: &[String]) -> BackendResult<ExecOutput> {
        let options = CreateExecOptions {
            cmd: Some(command.to_vec()),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        };
        let exec = self
            .docker
            .create_exec(container, options)
            .await
            .map_err(|e| map_error(container, e))?;

        let mut output = String::new();
        if let StartExecResults::Attached { output: mut stream, .. } = self
            .docker
            .start_exec(&exec.id, None)
            .await
            .map_err(|e| map_error(container, e))?
        {
            while let Some(chunk) = stream.next().await {
                let chunk = chunk.map_err(|e| map_error(container, e))?;
                output.push_str(&String::from_utf8_lossy(&chunk.into_bytes()));
            }
        }

        let inspect = self
            .docker
            .inspect_exec(&exec.id)
            .await
            .map_err(|e| map_error(container, e))?;
        Ok(ExecOutput {
            exit_code: inspect.exit_code.unwrap_or_default(),
            output,
        })
    }

    async fn local_node(&self) -> BackendResult<ClusterNode> {
        let info = self.docker.info().await.map_err(|e| map_error("docker info", e))?;
        Ok(ClusterNode::new(info.name.unwrap_or_else(|| "localhost".to_string())))
    }
}

impl Backend for DockerBackend {
    fn name(&self) -> &'static str {
        "docker"
    }

    fn list_nodes(&self) -> BackendFuture<'_, Vec<ClusterNode>> {
        Box::pin(async move { Ok(vec![self.local_node().await?]) })
    }

    fn boundary_exists<'a>(&'a self, lab: &'a LabHash) -> BackendFuture<'a, bool> {
        Box::pin(async move {
            let name = self.volume_name(lab);
            match self.docker.inspect_volume(&name).await {
                Ok(_) => Ok(true),
                Err(e) => match map_error(&name, e) {
                    BackendError::NotFound(_) => Ok(false),
                    other => Err(other),
                },
            }
        })
    }

    fn create_boundary<'a>(&'a self, lab: &'a LabHash) -> BackendFuture<'a, ()> {
        Box::pin(async move {
            let name = self.volume_name(lab);
            // Volume creation is idempotent in Docker, so check first.
            if self.boundary_exists(lab).await? {
                return Err(BackendError::AlreadyExists(name));
            }
            let options = CreateVolumeOptions {
                name: name.clone(),
                labels: HashMap::from([(LAB_LABEL.to_string(), lab.to_string())]),
                ..Default::default()
            };
            self.docker
                .create_volume(options)
                .await
                .map_err(|e| map_error(&name, e))?;
            info!(lab = %lab, volume = %name, "shared volume created");
            Ok(())
        })
    }

    fn delete_boundary<'a>(&'a self, lab: &'a LabHash) -> BackendFuture<'a, ()> {
        Box::pin(async move {
            let name = self.volume_name(lab);
            self.docker
                .remove_volume(&name, Some(RemoveVolumeOptions { force: true }))
                .await
                .map_err(|e| map_error(&name, e))
        })
    }

    fn list_boundaries(&self) -> BackendFuture<'_, Vec<LabHash>> {
        Box::pin(async move {
            let options = ListVolumesOptions {
                filters: HashMap::from([("label".to_string(), vec![LAB_LABEL.to_string()])]),
            };
            let response = self
                .docker
                .list_volumes(Some(options))
                .await
                .map_err(|e| map_error("volumes", e))?;
            let labs: BTreeSet<LabHash> = response
                .volumes
                .unwrap_or_default()
                .iter()
                .filter_map(|v| v.labels.get(LAB_LABEL).map(|l| LabHash::from_raw(l)))
                .collect();
            Ok(labs.into_iter().collect())
        })
    }

    fn create_unit<'a>(&'a self, lab: &'a LabHash, spec: &'a UnitSpec) -> BackendFuture<'a, UnitHandle> {
        Box::pin(async move {
            let handle = self.unit_handle(lab, &spec.device);
            if let Some(node) = &spec.node {
                debug!(device = %spec.device, node = %node, "node hint ignored on a single host");
            }

            let shutdown = serde_json::to_string(&spec.shutdown_commands)
                .map_err(|e| BackendError::operation(&handle.id, e.to_string()))?;
            let mut labels = HashMap::from([
                (LAB_LABEL.to_string(), lab.to_string()),
                (DEVICE_LABEL.to_string(), spec.device.clone()),
                (INTERFACES_LABEL.to_string(), encode_interfaces(&spec.interfaces)),
                (SHUTDOWN_LABEL.to_string(), shutdown),
                (SHELL_LABEL.to_string(), spec.shell.clone()),
            ]);
            for (key, value) in &spec.meta {
                labels.insert(format!("meshlab.meta.{key}"), value.clone());
            }

            let config = Config {
                image: Some(spec.image.clone()),
                hostname: Some(spec.device.clone()),
                labels: Some(labels),
                tty: Some(true),
                open_stdin: Some(true),
                host_config: Some(HostConfig {
                    privileged: Some(true),
                    binds: Some(vec![format!("{}:/shared", self.volume_name(lab))]),
                    ..Default::default()
                }),
                ..Default::default()
            };
            self.create_container(&handle.id, config).await?;

            // Interfaces come from segments only.
            let detach = DisconnectNetworkOptions {
                container: handle.id.clone(),
                force: true,
            };
            if let Err(e) = self.docker.disconnect_network("bridge", detach).await {
                debug!(container = %handle.id, error = %e, "default bridge not detached");
            }

            info!(lab = %lab, device = %spec.device, container = %handle.id, "container created");
            Ok(handle)
        })
    }

    fn unit_handle(&self, lab: &LabHash, device: &str) -> UnitHandle {
        UnitHandle {
            lab: lab.clone(),
            device: device.to_string(),
            id: self.container_name(lab, device),
        }
    }

    fn start_unit<'a>(&'a self, unit: &'a UnitHandle) -> BackendFuture<'a, bool> {
        Box::pin(async move {
            match self.docker.start_container::<String>(&unit.id, None).await {
                Ok(()) => Ok(true),
                Err(DockerError::DockerResponseServerError {
                    status_code: 304, ..
                }) => Ok(false),
                Err(e) => Err(map_error(&unit.id, e)),
            }
        })
    }

    fn delete_unit<'a>(&'a self, lab: &'a LabHash, device: &'a str) -> BackendFuture<'a, ()> {
        Box::pin(async move {
            let name = self.container_name(lab, device);
            let inspect = self
                .docker
                .inspect_container(&name, None)
                .await
                .map_err(|e| map_error(&name, e))?;

            let running = inspect
                .state
                .as_ref()
                .and_then(|s| s.running)
                .unwrap_or(false);
            let labels = inspect.config.as_ref().and_then(|c| c.labels.as_ref());
            let shutdown: Vec<String> = labels
                .and_then(|l| l.get(SHUTDOWN_LABEL))
                .and_then(|raw| serde_json::from_str(raw).ok())
                .unwrap_or_default();
            let shell = labels
                .and_then(|l| l.get(SHELL_LABEL))
                .filter(|s| !s.is_empty())
                .unwrap_or(&self.shell);

            if running {
                for command in &shutdown {
                    let argv = vec![shell.clone(), "-c".to_string(), command.clone()];
                    if let Err(e) = self.run(&name, &argv).await {
                        warn!(device, error = %e, "shutdown command failed");
                    }
                }
                let stop = StopContainerOptions { t: STOP_TIMEOUT };
                if let Err(e) = self.docker.stop_container(&name, Some(stop)).await {
                    debug!(container = %name, error = %e, "stop before remove failed");
                }
            }

            let options = RemoveContainerOptions {
                force: true,
                ..Default::default()
            };
            self.docker
                .remove_container(&name, Some(options))
                .await
                .map_err(|e| map_error(&name, e))?;
            info!(lab = %lab, device, container = %name, "container removed");
            Ok(())
        })
    }

    fn list_units<'a>(&'a self, lab: &'a LabHash) -> BackendFuture<'a, Vec<UnitInfo>> {
        Box::pin(async move {
            let options = ListContainersOptions {
                all: true,
                filters: Self::lab_filter(lab),
                ..Default::default()
            };
            let containers = self
                .docker
                .list_containers(Some(options))
                .await
                .map_err(|e| map_error("containers", e))?;
            let node = self.local_node().await.ok();

            let mut units: Vec<UnitInfo> = containers
                .into_iter()
                .filter_map(|c| {
                    let labels = c.labels.unwrap_or_default();
                    let device = labels.get(DEVICE_LABEL)?.clone();
                    Some(UnitInfo {
                        id: self.container_name(lab, &device),
                        node: node.clone(),
                        running: c.state.as_deref() == Some("running"),
                        interfaces: labels
                            .get(INTERFACES_LABEL)
                            .map(|raw| decode_interfaces(raw))
                            .unwrap_or_default(),
                        device,
                    })
                })
                .collect();
            units.sort_by(|a, b| a.device.cmp(&b.device));
            Ok(units)
        })
    }

    fn create_segment<'a>(&'a self, lab: &'a LabHash, lan: &'a str) -> BackendFuture<'a, SegmentHandle> {
        Box::pin(async move {
            let handle = self.segment_handle(lab, lan);
            let options = CreateNetworkOptions {
                name: handle.id.clone(),
                check_duplicate: true,
                driver: "bridge".to_string(),
                internal: true,
                labels: HashMap::from([
                    (LAB_LABEL.to_string(), lab.to_string()),
                    (LAN_LABEL.to_string(), lan.to_string()),
                ]),
                ..Default::default()
            };
            self.docker
                .create_network(options)
                .await
                .map_err(|e| map_error(&handle.id, e))?;
            info!(lab = %lab, lan, network = %handle.id, "network created");
            Ok(handle)
        })
    }

    fn segment_handle(&self, lab: &LabHash, lan: &str) -> SegmentHandle {
        SegmentHandle {
            lab: lab.clone(),
            lan: lan.to_string(),
            id: self.network_name(lab, lan),
        }
    }

    fn attach_interface<'a>(
        &'a self,
        segment: &'a SegmentHandle,
        unit: &'a UnitHandle,
        interface: u32,
    ) -> BackendFuture<'a, ()> {
        Box::pin(async move {
            // Docker numbers interfaces in connection order, so callers
            // attach in ascending interface order.
            let options = ConnectNetworkOptions {
                container: unit.id.clone(),
                ..Default::default()
            };
            let resource = format!("{}:{interface}", unit.id);
            self.docker
                .connect_network(&segment.id, options)
                .await
                .map_err(|e| map_error(&resource, e))?;
            debug!(device = %unit.device, interface, network = %segment.id, "interface attached");
            Ok(())
        })
    }

    fn delete_segment<'a>(&'a self, lab: &'a LabHash, lan: &'a str) -> BackendFuture<'a, ()> {
        Box::pin(async move {
            let name = self.network_name(lab, lan);
            self.docker
                .remove_network(&name)
                .await
                .map_err(|e| map_error(&name, e))?;
            info!(lab = %lab, lan, network = %name, "network removed");
            Ok(())
        })
    }

    fn list_segments<'a>(&'a self, lab: &'a LabHash) -> BackendFuture<'a, Vec<SegmentInfo>> {
        Box::pin(async move {
            let options = ListNetworksOptions {
                filters: Self::lab_filter(lab),
            };
            let networks = self
                .docker
                .list_networks(Some(options))
                .await
                .map_err(|e| map_error("networks", e))?;

            let units = self.list_units(lab).await?;
            let by_container: HashMap<&str, &UnitInfo> =
                units.iter().map(|u| (u.id.as_str(), u)).collect();

            let mut segments = Vec::new();
            for network in networks {
                let Some(lan) = network.labels.as_ref().and_then(|l| l.get(LAN_LABEL)).cloned() else {
                    continue;
                };
                let id = self.network_name(lab, &lan);
                // Listing does not include attached containers.
                let detail = self
                    .docker
                    .inspect_network::<String>(&id, None)
                    .await
                    .map_err(|e| map_error(&id, e))?;

                let attached = detail.containers.unwrap_or_default();
                let endpoints = attached_endpoints(
                    &lan,
                    attached.values().filter_map(|c| c.name.as_deref()),
                    &by_container,
                );
                segments.push(SegmentInfo { lan, id, endpoints });
            }
            segments.sort_by(|a, b| a.lan.cmp(&b.lan));
            Ok(segments)
        })
    }

    fn exec<'a>(&'a self, unit: &'a UnitHandle, command: &'a [String]) -> BackendFuture<'a, ExecOutput> {
        Box::pin(async move { self.run(&unit.id, command).await })
    }
}

/// Endpoints of `lan` among the containers actually attached to its network.
///
/// A unit that declares an interface on `lan` but whose attach never
/// happened is left out.
fn attached_endpoints<'a>(
    lan: &str,
    attached: impl Iterator<Item = &'a str>,
    by_container: &HashMap<&str, &UnitInfo>,
) -> BTreeSet<(String, u32)> {
    attached
        .filter_map(|name| by_container.get(name).copied())
        .flat_map(|unit| {
            unit.interfaces
                .iter()
                .filter(|(_, l)| l.as_str() == lan)
                .map(|(n, _)| (unit.device.clone(), *n))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend() -> DockerBackend {
        // Building a client does not contact the daemon.
        let docker = Docker::connect_with_local_defaults().unwrap();
        DockerBackend::with_client(docker, &GeneralSettings::default())
    }

    #[test]
    fn resource_names() {
        let b = backend();
        let lab = LabHash::from_raw("0123456789abcdef0123456789abcdef");
        assert_eq!(b.volume_name(&lab), "meshlab_0123456789abcdef0123456789abcdef");
        assert_eq!(
            b.container_name(&lab, "r1"),
            "meshlab_r1_0123456789abcdef0123456789abcdef"
        );
        assert_eq!(b.network_name(&lab, "A"), "meshlab_0123456_A");
        assert_eq!(b.unit_handle(&lab, "r1").id, b.container_name(&lab, "r1"));
        assert_eq!(b.segment_handle(&lab, "A").id, b.network_name(&lab, "A"));
    }

    #[test]
    fn interfaces_label_round_trip() {
        let interfaces: BTreeMap<u32, String> =
            [(0, "A".to_string()), (1, "B".to_string())].into();
        let raw = encode_interfaces(&interfaces);
        assert_eq!(raw, "0=A,1=B");
        assert_eq!(decode_interfaces(&raw), interfaces);
        assert!(decode_interfaces("").is_empty());
        assert_eq!(decode_interfaces("x=A,2=C").len(), 1);
    }

    #[test]
    fn docker_status_codes_map_to_backend_errors() {
        let server = |status_code| DockerError::DockerResponseServerError {
            status_code,
            message: "boom".into(),
        };
        assert_eq!(map_error("c", server(404)), BackendError::NotFound("c".into()));
        assert_eq!(map_error("c", server(409)), BackendError::AlreadyExists("c".into()));
        assert_eq!(map_error("c", server(304)), BackendError::AlreadyExists("c".into()));
        assert!(matches!(map_error("c", server(500)), BackendError::Operation { .. }));
        assert!(matches!(
            map_error("c", DockerError::RequestTimeoutError),
            BackendError::Unavailable(_)
        ));
    }

    #[test]
    fn segment_endpoints_come_from_attached_containers() {
        let unit = |device: &str, lans: &[&str]| UnitInfo {
            device: device.into(),
            id: format!("meshlab_{device}_x"),
            node: None,
            running: true,
            interfaces: lans.iter().enumerate().map(|(n, l)| (n as u32, l.to_string())).collect(),
        };
        let r1 = unit("r1", &["A", "B"]);
        let r2 = unit("r2", &["B", "A"]);
        let pc = unit("pc", &["A"]);
        let by_container: HashMap<&str, &UnitInfo> =
            [&r1, &r2, &pc].into_iter().map(|u| (u.id.as_str(), u)).collect();

        // pc declares eth0 on A but was never attached.
        let endpoints = attached_endpoints(
            "A",
            ["meshlab_r2_x", "meshlab_r1_x", "some_other_container"].into_iter(),
            &by_container,
        );
        assert_eq!(
            endpoints,
            BTreeSet::from([("r1".to_string(), 0), ("r2".to_string(), 1)])
        );
        assert!(attached_endpoints("A", std::iter::empty(), &by_container).is_empty());
    }
}
