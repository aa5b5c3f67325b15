//! Docker cluster back-end, grounded on
//! `original_source/cluster/DockerCluster.py`, ported from the `docker`
//! Python SDK to `bollard`.

use crate::manifest::ContainerSpec;
use crate::{ClusterAdapter, ClusterError, ServiceManifest, LABEL_NAME, LABEL_PORT};
use async_trait::async_trait;
use bollard::container::{
    Config as ContainerConfig, CreateContainerOptions, ListContainersOptions, StartContainerOptions,
    StopContainerOptions,
};
use bollard::models::{ContainerSummary, HostConfig, PortBinding};
use bollard::Docker;
use edge_core::{Deployment, Ipv4Addr, Service, ServiceInstance, SocketAddr4};
use std::collections::HashMap;

/// One Docker daemon attachment. `host_ip` is the address clients reach
/// published ports on (the daemon host), matching `DockerCluster._ip`.
pub struct DockerBackend {
    host_ip: Ipv4Addr,
    client: Docker,
}

impl DockerBackend {
    pub fn connect_local(host_ip: Ipv4Addr) -> Result<Self, ClusterError> {
        let client = Docker::connect_with_local_defaults()
            .map_err(|e| ClusterError::unavailable(format!("docker connect: {e}")))?;
        Ok(Self { host_ip, client })
    }

    fn label_filter(label: Option<&str>) -> HashMap<String, Vec<String>> {
        let mut filters = HashMap::new();
        match label {
            Some(l) => filters.insert("label".to_string(), vec![format!("{LABEL_NAME}={l}")]),
            None => filters.insert("label".to_string(), vec![LABEL_NAME.to_string()]),
        };
        filters
    }

    async fn create_one(
        &self,
        manifest: &ServiceManifest,
        cont: &ContainerSpec,
        host_paths: &HashMap<String, String>,
    ) -> Result<ContainerSummary, ClusterError> {
        let binds: Vec<String> = cont
            .volume_mounts
            .iter()
            .filter_map(|(name, path)| host_paths.get(name).map(|host| format!("{host}:{path}")))
            .collect();

        let mut exposed_ports = HashMap::new();
        let mut port_bindings = HashMap::new();
        for port in &cont.ports {
            exposed_ports.insert(format!("{port}/tcp"), HashMap::new());
            port_bindings.insert(
                format!("{port}/tcp"),
                Some(vec![PortBinding {
                    host_ip: None,
                    host_port: None, // random host port, matching the original's `ports: {port: None}`
                }]),
            );
        }

        let mut command = cont.command.clone();
        command.extend(cont.args.clone());

        let mut labels = HashMap::new();
        labels.insert(LABEL_NAME.to_string(), manifest.label.clone());
        labels.insert(LABEL_PORT.to_string(), manifest.port.to_string());

        let config = ContainerConfig {
            image: Some(cont.image.clone()),
            cmd: if command.is_empty() { None } else { Some(command) },
            labels: Some(labels),
            exposed_ports: Some(exposed_ports),
            host_config: Some(HostConfig {
                binds: if binds.is_empty() { None } else { Some(binds) },
                port_bindings: Some(port_bindings),
                ..Default::default()
            }),
            ..Default::default()
        };

        let created = self
            .client
            .create_container(
                Some(CreateContainerOptions {
                    name: format!("{}-{}", manifest.label, cont.name),
                    platform: None,
                }),
                config,
            )
            .await
            .map_err(|e| ClusterError::transient(format!("create container {}: {e}", cont.name)))?;

        let summaries = self
            .client
            .list_containers(Some(ListContainersOptions {
                all: true,
                filters: {
                    let mut f = HashMap::new();
                    f.insert("id".to_string(), vec![created.id]);
                    f
                },
                ..Default::default()
            }))
            .await
            .map_err(|e| ClusterError::transient(format!("inspect created container: {e}")))?;

        summaries
            .into_iter()
            .next()
            .ok_or_else(|| ClusterError::transient("container disappeared immediately after create"))
    }

    fn local_port(summary: &ContainerSummary) -> Option<u16> {
        summary
            .ports
            .as_ref()?
            .iter()
            .find_map(|p| p.public_port)
            .map(|p| p as u16)
    }
}

#[async_trait]
impl ClusterAdapter for DockerBackend {
    async fn connect(&self) -> Result<(), ClusterError> {
        self.client
            .ping()
            .await
            .map(|_| ())
            .map_err(|e| ClusterError::unavailable(format!("docker ping: {e}")))
    }

    async fn deploy(&self, manifest: &ServiceManifest) -> Result<ServiceInstance, ClusterError> {
        let containers = manifest.containers();
        let first = containers
            .first()
            .ok_or_else(|| ClusterError::transient("manifest declares no containers"))?;

        // Materialize emptyDir volumes that don't already have a host path.
        // Leaked by design on controller crash — see SPEC_FULL.md §9 (c).
        let mut host_paths: HashMap<String, String> = HashMap::new();
        for (name, existing) in manifest.empty_dir_volumes() {
            let path = match existing {
                Some(p) => p,
                None => {
                    let dir = tempfile::Builder::new()
                        .prefix("edgeD-")
                        .tempdir()
                        .map_err(|e| ClusterError::transient(format!("temp volume dir: {e}")))?;
                    let path = dir.into_path();
                    #[cfg(unix)]
                    {
                        use std::os::unix::fs::PermissionsExt;
                        let _ = std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o777));
                    }
                    path.display().to_string()
                }
            };
            host_paths.insert(name, path);
        }

        // First container on the caller's task to minimize perceived latency;
        // the rest run concurrently on the runtime's worker pool.
        let first_summary = self.create_one(manifest, first, &host_paths).await?;

        let mut rest_handles = Vec::new();
        for cont in &containers[1..] {
            let cont = cont.clone();
            let manifest = manifest.clone();
            let host_paths = host_paths.clone();
            let docker = self.client.clone();
            let host_ip = self.host_ip;
            rest_handles.push(tokio::spawn(async move {
                let backend = DockerBackend { host_ip, client: docker };
                backend.create_one(&manifest, &cont, &host_paths).await
            }));
        }

        let mut summaries = vec![first_summary];
        for handle in rest_handles {
            let summary = handle
                .await
                .map_err(|e| ClusterError::transient(format!("container creation task panicked: {e}")))??;
            summaries.push(summary);
        }

        let service = Service::new(SocketAddr4::new(self.host_ip, manifest.port), manifest.label.clone());
        let mut instance = ServiceInstance::new(service, self.host_ip);
        if let Some(port) = summaries.iter().find_map(Self::local_port) {
            instance.cluster_addr = Some(SocketAddr4::new(self.host_ip, port));
        }
        Ok(instance)
    }

    async fn scale(&self, instance: &ServiceInstance, replicas: u32) -> Result<(), ClusterError> {
        let filters = Self::label_filter(Some(&instance.service.label));
        let containers = self
            .client
            .list_containers(Some(ListContainersOptions {
                all: true,
                filters,
                ..Default::default()
            }))
            .await
            .map_err(|e| ClusterError::transient(format!("list containers for scale: {e}")))?;

        for summary in &containers {
            let id = summary.id.clone().unwrap_or_default();
            let running = summary.state.as_deref() == Some("running");

            if replicas >= 1 {
                if running {
                    continue; // idempotent: already running
                }
                self.client
                    .start_container(&id, None::<StartContainerOptions<String>>)
                    .await
                    .map_err(|e| ClusterError::transient(format!("start {id}: {e}")))?;
            } else {
                if !running {
                    continue; // idempotent: already stopped
                }
                self.client
                    .stop_container(&id, None::<StopContainerOptions>)
                    .await
                    .map_err(|e| ClusterError::transient(format!("stop {id}: {e}")))?;
            }
        }
        Ok(())
    }

    async fn services(&self, label: Option<&str>) -> Result<Vec<ServiceInstance>, ClusterError> {
        let containers = self
            .client
            .list_containers(Some(ListContainersOptions {
                all: true,
                filters: Self::label_filter(label),
                ..Default::default()
            }))
            .await
            .map_err(|e| ClusterError::transient(format!("list services: {e}")))?;

        // Merge containers sharing a virtual address into one instance, even
        // across differing labels — preserved as-observed from the original
        // (`DockerCluster._combine`, which groups by `svc.service.vAddr`, not
        // by label); see SPEC_FULL.md §9 open question (b).
        let mut by_vaddr: HashMap<SocketAddr4, ServiceInstance> = HashMap::new();
        for summary in containers {
            let labels = summary.labels.clone().unwrap_or_default();
            let Some(svc_label) = labels.get(LABEL_NAME).cloned() else {
                continue;
            };
            let port: u16 = labels
                .get(LABEL_PORT)
                .and_then(|p| p.parse().ok())
                .unwrap_or(0);
            let vaddr = SocketAddr4::new(self.host_ip, port);

            let entry = by_vaddr.entry(vaddr).or_insert_with(|| {
                let service = Service::new(vaddr, svc_label.clone());
                let mut inst = ServiceInstance::new(service, self.host_ip);
                inst.deployment = Deployment::new(1, 0);
                inst
            });

            if let Some(local_port) = Self::local_port(&summary) {
                entry.cluster_addr = Some(SocketAddr4::new(self.host_ip, local_port));
                entry.deployment = Deployment::new(1, 1);
            }
        }
        Ok(by_vaddr.into_values().collect())
    }

    async fn deployments(&self, label: Option<&str>) -> Result<Vec<Deployment>, ClusterError> {
        Ok(self
            .services(label)
            .await?
            .into_iter()
            .map(|i| i.deployment)
            .collect())
    }

    async fn pods(&self, label: Option<&str>) -> Result<Vec<Ipv4Addr>, ClusterError> {
        // Docker containers don't carry a pod IP distinct from the host;
        // the host address stands in, matching the original's direct use of
        // container port mappings rather than a pod network.
        Ok(self
            .services(label)
            .await?
            .into_iter()
            .filter(|i| i.deployment.is_ready())
            .map(|_| self.host_ip)
            .collect())
    }
}
