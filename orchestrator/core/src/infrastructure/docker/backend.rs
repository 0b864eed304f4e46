// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, NetworkingConfig, RemoveContainerOptions,
    StartContainerOptions, StopContainerOptions,
};
use bollard::models::{
    EndpointIpamConfig, EndpointSettings, HostConfig, Ipam, IpamConfig, PortBinding,
};
use bollard::network::{CreateNetworkOptions, InspectNetworkOptions};
use bollard::Docker;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use tracing::{debug, info, warn};

use super::{
    connect, ensure_image, exec, force_remove, ENCLAVE_LABEL, SERVICE_NAME_LABEL,
    SERVICE_UUID_LABEL,
};
use crate::domain::backend::{BackendError, ContainerBackend};
use crate::domain::config::{EnclaveConfigManifest, Ipv4Subnet};
use crate::domain::service::{
    EnclaveId, ExecResult, Service, ServiceConfig, ServiceName, ServiceRegistration, ServiceStatus,
    ServiceUuid,
};
use crate::infrastructure::ip_allocator::FreeIpAddrTracker;

struct Registered {
    name: ServiceName,
    ip: Ipv4Addr,
    container_id: Option<String>,
    ip_released: bool,
}

struct DockerState {
    ips: FreeIpAddrTracker,
    registrations: HashMap<ServiceUuid, Registered>,
}

impl DockerState {
    fn release_ip(&mut self, uuid: &ServiceUuid) {
        if let Some(registered) = self.registrations.get_mut(uuid) {
            if !registered.ip_released {
                self.ips.release(registered.ip);
                registered.ip_released = true;
            }
        }
    }
}

/// Runs every service as a container on one user-defined bridge network with
/// a statically assigned private IP.
pub struct DockerContainerBackend {
    docker: Docker,
    network_name: String,
    subnet: Ipv4Subnet,
    stop_timeout_seconds: i64,
    state: Mutex<DockerState>,
}

impl DockerContainerBackend {
    pub fn new(config: &EnclaveConfigManifest) -> Result<Self, BackendError> {
        let docker = connect(config.spec.docker.socket.as_deref())
            .map_err(BackendError::ConnectionFailed)?;
        let subnet = config
            .subnet()
            .map_err(|e| BackendError::ConnectionFailed(e.to_string()))?;
        Ok(Self {
            docker,
            network_name: config.spec.network.docker_network.clone(),
            subnet,
            stop_timeout_seconds: config.spec.docker.stop_timeout_seconds,
            state: Mutex::new(DockerState {
                ips: FreeIpAddrTracker::new(subnet),
                registrations: HashMap::new(),
            }),
        })
    }

    /// Verify Docker daemon is accessible
    pub async fn healthcheck(&self) -> Result<(), BackendError> {
        self.docker.ping().await.map_err(|e| {
            BackendError::ConnectionFailed(format!(
                "Cannot connect to Docker daemon: {}\n\nVerify with: docker ps",
                e
            ))
        })?;
        Ok(())
    }

    /// Create the enclave bridge network unless it already exists.
    pub async fn ensure_network(&self, enclave: &EnclaveId) -> Result<(), BackendError> {
        if self
            .docker
            .inspect_network(&self.network_name, None::<InspectNetworkOptions<String>>)
            .await
            .is_ok()
        {
            debug!("Docker network {} already exists", self.network_name);
            return Ok(());
        }

        let gateway = Ipv4Addr::from(u32::from(self.subnet.network) + 1);
        let options = CreateNetworkOptions {
            name: self.network_name.clone(),
            driver: "bridge".to_string(),
            attachable: true,
            ipam: Ipam {
                config: Some(vec![IpamConfig {
                    subnet: Some(self.subnet.to_string()),
                    gateway: Some(gateway.to_string()),
                    ..Default::default()
                }]),
                ..Default::default()
            },
            labels: HashMap::from([(ENCLAVE_LABEL.to_string(), enclave.to_string())]),
            ..Default::default()
        };
        self.docker
            .create_network(options)
            .await
            .map_err(|e| BackendError::ConnectionFailed(format!(
                "Failed to create Docker network {}: {}",
                self.network_name, e
            )))?;
        info!("Created Docker network {} ({})", self.network_name, self.subnet);
        Ok(())
    }

    fn container_of(&self, uuid: &ServiceUuid) -> Result<String, BackendError> {
        self.state
            .lock()
            .registrations
            .get(uuid)
            .and_then(|registered| registered.container_id.clone())
            .ok_or_else(|| BackendError::ServiceNotFound(uuid.clone()))
    }

    fn container_config(
        &self,
        enclave: &EnclaveId,
        registration: &ServiceRegistration,
        config: &ServiceConfig,
    ) -> Config<String> {
        let exposed_ports: HashMap<String, HashMap<(), ()>> = config
            .private_ports
            .values()
            .map(|port| {
                (
                    format!("{}/{}", port.number, port.transport_protocol.as_docker_str()),
                    HashMap::new(),
                )
            })
            .collect();

        let port_bindings: HashMap<String, Option<Vec<PortBinding>>> = config
            .public_ports
            .iter()
            .filter_map(|(id, public)| {
                let private = config.private_ports.get(id)?;
                Some((
                    format!("{}/{}", private.number, private.transport_protocol.as_docker_str()),
                    Some(vec![PortBinding {
                        host_ip: Some("0.0.0.0".to_string()),
                        host_port: Some(public.number.to_string()),
                    }]),
                ))
            })
            .collect();

        let mut host_config = HostConfig {
            network_mode: Some(self.network_name.clone()),
            port_bindings: (!port_bindings.is_empty()).then_some(port_bindings),
            ..Default::default()
        };
        if config.memory_allocation_megabytes > 0 {
            host_config.memory = Some((config.memory_allocation_megabytes * 1024 * 1024) as i64);
        }
        if config.cpu_allocation_millicpus > 0 {
            // 1 milli CPU = 1e6 nano CPUs
            host_config.nano_cpus = Some((config.cpu_allocation_millicpus as i64) * 1_000_000);
        }

        let endpoint = EndpointSettings {
            ipam_config: Some(EndpointIpamConfig {
                ipv4_address: Some(registration.private_ip.to_string()),
                ..Default::default()
            }),
            ..Default::default()
        };

        Config {
            image: Some(config.image.clone()),
            hostname: Some(registration.name.to_string()),
            entrypoint: (!config.entrypoint.is_empty()).then(|| config.entrypoint.clone()),
            cmd: (!config.cmd.is_empty()).then(|| config.cmd.clone()),
            env: Some(config.env.iter().map(|(k, v)| format!("{}={}", k, v)).collect()),
            exposed_ports: Some(exposed_ports),
            labels: Some(HashMap::from([
                (ENCLAVE_LABEL.to_string(), enclave.to_string()),
                (SERVICE_UUID_LABEL.to_string(), registration.uuid.to_string()),
                (SERVICE_NAME_LABEL.to_string(), registration.name.to_string()),
            ])),
            host_config: Some(host_config),
            networking_config: Some(NetworkingConfig {
                endpoints_config: HashMap::from([(self.network_name.clone(), endpoint)]),
            }),
            ..Default::default()
        }
    }
}

#[async_trait]
impl ContainerBackend for DockerContainerBackend {
    async fn register_service(
        &self,
        _enclave: &EnclaveId,
        name: &ServiceName,
    ) -> Result<ServiceRegistration, BackendError> {
        let mut state = self.state.lock();
        let ip = state
            .ips
            .allocate()
            .ok_or_else(|| BackendError::NoFreeIpAddress(self.subnet.to_string()))?;
        let uuid = ServiceUuid::generate();
        state.registrations.insert(
            uuid.clone(),
            Registered {
                name: name.clone(),
                ip,
                container_id: None,
                ip_released: false,
            },
        );
        Ok(ServiceRegistration::new(name.clone(), uuid, IpAddr::V4(ip)))
    }

    async fn unregister_service(
        &self,
        _enclave: &EnclaveId,
        uuid: &ServiceUuid,
    ) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        state.release_ip(uuid);
        state
            .registrations
            .remove(uuid)
            .map(|_| ())
            .ok_or_else(|| BackendError::ServiceNotFound(uuid.clone()))
    }

    async fn start_service(
        &self,
        enclave: &EnclaveId,
        registration: &ServiceRegistration,
        config: &ServiceConfig,
    ) -> Result<Service, BackendError> {
        let uuid = &registration.uuid;
        if !self.state.lock().registrations.contains_key(uuid) {
            return Err(BackendError::ServiceNotFound(uuid.clone()));
        }
        let start_failed = |reason: String| BackendError::StartFailed {
            uuid: uuid.clone(),
            reason,
        };

        ensure_image(&self.docker, &config.image)
            .await
            .map_err(start_failed)?;

        let options = CreateContainerOptions {
            name: format!("{}--{}", registration.name, uuid),
            platform: None,
        };
        let created = self
            .docker
            .create_container(Some(options), self.container_config(enclave, registration, config))
            .await
            .map_err(|e| start_failed(e.to_string()))?;
        let container_id = created.id;

        if let Err(e) = self
            .docker
            .start_container(&container_id, None::<StartContainerOptions<String>>)
            .await
        {
            if let Err(remove_error) = force_remove(&self.docker, &container_id).await {
                warn!(
                    "Failed to remove container {} after failed start: {}",
                    container_id, remove_error
                );
            }
            return Err(start_failed(format!("Failed to start container: {}", e)));
        }

        if let Some(registered) = self.state.lock().registrations.get_mut(uuid) {
            registered.container_id = Some(container_id.clone());
        }
        info!("Started container {} for service '{}'", container_id, registration.name);

        Ok(Service {
            registration: registration.clone(),
            container_id,
            status: ServiceStatus::Running,
            private_ports: config.private_ports.clone(),
            public_ip: (!config.public_ports.is_empty()).then_some(IpAddr::V4(Ipv4Addr::LOCALHOST)),
            public_ports: config.public_ports.clone(),
            started_at: Utc::now(),
        })
    }

    async fn stop_service(
        &self,
        _enclave: &EnclaveId,
        uuid: &ServiceUuid,
    ) -> Result<(), BackendError> {
        let container_id = self.container_of(uuid)?;
        self.docker
            .stop_container(
                &container_id,
                Some(StopContainerOptions {
                    t: self.stop_timeout_seconds,
                }),
            )
            .await
            .map_err(|e| BackendError::StopFailed {
                uuid: uuid.clone(),
                reason: e.to_string(),
            })?;
        self.state.lock().release_ip(uuid);
        info!("Stopped container {}", container_id);
        Ok(())
    }

    async fn destroy_service(
        &self,
        _enclave: &EnclaveId,
        uuid: &ServiceUuid,
    ) -> Result<(), BackendError> {
        let container_id = self.container_of(uuid)?;
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        self.docker
            .remove_container(&container_id, Some(options))
            .await
            .map_err(|e| BackendError::DestroyFailed {
                uuid: uuid.clone(),
                reason: e.to_string(),
            })?;

        if let Some(registered) = self.state.lock().registrations.get_mut(uuid) {
            registered.container_id = None;
        }
        info!("Destroyed container {}", container_id);
        Ok(())
    }

    async fn pause_service(
        &self,
        _enclave: &EnclaveId,
        uuid: &ServiceUuid,
    ) -> Result<(), BackendError> {
        let container_id = self.container_of(uuid)?;
        self.docker
            .pause_container(&container_id)
            .await
            .map_err(|e| BackendError::PauseFailed {
                uuid: uuid.clone(),
                reason: e.to_string(),
            })
    }

    async fn unpause_service(
        &self,
        _enclave: &EnclaveId,
        uuid: &ServiceUuid,
    ) -> Result<(), BackendError> {
        let container_id = self.container_of(uuid)?;
        self.docker
            .unpause_container(&container_id)
            .await
            .map_err(|e| BackendError::PauseFailed {
                uuid: uuid.clone(),
                reason: e.to_string(),
            })
    }

    async fn exec_command(
        &self,
        _enclave: &EnclaveId,
        uuid: &ServiceUuid,
        command: &[String],
    ) -> Result<ExecResult, BackendError> {
        let container_id = self.container_of(uuid)?;
        let (exit_code, output) = exec(&self.docker, &container_id, command.to_vec())
            .await
            .map_err(|e| BackendError::ExecFailed {
                uuid: uuid.clone(),
                reason: e.to_string(),
            })?;
        Ok(ExecResult { exit_code, output })
    }
}
