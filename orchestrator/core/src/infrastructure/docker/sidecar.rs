// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, RemoveContainerOptions, StartContainerOptions,
};
use bollard::models::HostConfig;
use bollard::Docker;
use std::collections::HashMap;
use tracing::{debug, info, warn};

use super::{
    connect, ensure_image, exec, force_remove, ENCLAVE_LABEL, SERVICE_NAME_LABEL,
    SERVICE_UUID_LABEL,
};
use crate::domain::config::EnclaveConfigManifest;
use crate::domain::service::{EnclaveId, Service};
use crate::domain::sidecar::{NetworkingSidecar, NetworkingSidecarManager, SidecarError};

/// Each sidecar is a long-lived container that joins the network namespace
/// of its service and holds `NET_ADMIN`, so `tc` run inside it shapes the
/// service's own egress.
pub struct DockerNetworkingSidecarManager {
    docker: Docker,
    image: String,
    interface: String,
}

impl DockerNetworkingSidecarManager {
    pub fn new(config: &EnclaveConfigManifest) -> anyhow::Result<Self> {
        let docker = connect(config.spec.docker.socket.as_deref()).map_err(anyhow::Error::msg)?;
        Ok(Self {
            docker,
            image: config.spec.docker.sidecar_image.clone(),
            interface: config.spec.network.interface.clone(),
        })
    }

    /// Every command runs in a single shell; the first failing one stops the
    /// chain and its exit code is reported.
    fn shell_command(commands: &[String]) -> Vec<String> {
        vec!["sh".to_string(), "-c".to_string(), commands.join(" && ")]
    }
}

#[async_trait]
impl NetworkingSidecarManager for DockerNetworkingSidecarManager {
    async fn add(
        &self,
        enclave: &EnclaveId,
        service: &Service,
    ) -> Result<NetworkingSidecar, SidecarError> {
        let creation_failed = |reason: String| SidecarError::CreationFailed {
            service: service.name().clone(),
            reason,
        };

        ensure_image(&self.docker, &self.image)
            .await
            .map_err(creation_failed)?;

        let host_config = HostConfig {
            network_mode: Some(format!("container:{}", service.container_id)),
            cap_add: Some(vec!["NET_ADMIN".to_string()]),
            ..Default::default()
        };
        let config = Config {
            image: Some(self.image.clone()),
            cmd: Some(vec!["sleep".to_string(), "infinity".to_string()]),
            labels: Some(HashMap::from([
                (ENCLAVE_LABEL.to_string(), enclave.to_string()),
                (SERVICE_UUID_LABEL.to_string(), service.uuid().to_string()),
                (SERVICE_NAME_LABEL.to_string(), service.name().to_string()),
            ])),
            host_config: Some(host_config),
            ..Default::default()
        };
        let options = CreateContainerOptions {
            name: format!("{}--networking-sidecar-{}", service.name(), service.uuid()),
            platform: None,
        };

        let created = self
            .docker
            .create_container(Some(options), config)
            .await
            .map_err(|e| creation_failed(e.to_string()))?;
        if let Err(e) = self
            .docker
            .start_container(&created.id, None::<StartContainerOptions<String>>)
            .await
        {
            if let Err(remove_error) = force_remove(&self.docker, &created.id).await {
                warn!(
                    "Failed to remove sidecar container {} after failed start: {}",
                    created.id, remove_error
                );
            }
            return Err(creation_failed(format!("Failed to start sidecar container: {}", e)));
        }

        info!(
            "Started networking sidecar {} for service '{}'",
            created.id,
            service.name()
        );
        Ok(NetworkingSidecar::new(
            service.name().clone(),
            service.uuid().clone(),
            created.id,
            self.interface.clone(),
        ))
    }

    async fn remove(
        &self,
        _enclave: &EnclaveId,
        sidecar: &NetworkingSidecar,
    ) -> Result<(), SidecarError> {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        self.docker
            .remove_container(&sidecar.container_id, Some(options))
            .await
            .map_err(|e| SidecarError::RemovalFailed {
                service: sidecar.service_name.clone(),
                reason: e.to_string(),
            })?;
        debug!("Removed networking sidecar {}", sidecar.container_id);
        Ok(())
    }

    async fn run_commands(
        &self,
        _enclave: &EnclaveId,
        sidecar: &NetworkingSidecar,
        commands: &[String],
    ) -> Result<(), SidecarError> {
        if commands.is_empty() {
            return Ok(());
        }
        debug!(
            "Running {} traffic control command(s) in sidecar of '{}'",
            commands.len(),
            sidecar.service_name
        );
        let command = Self::shell_command(commands);
        let (exit_code, output) = exec(&self.docker, &sidecar.container_id, command)
            .await
            .map_err(|e| SidecarError::ExecFailed {
                service: sidecar.service_name.clone(),
                reason: e.to_string(),
            })?;
        if exit_code != 0 {
            warn!(
                "Traffic control commands in sidecar of '{}' exited with {}: {}",
                sidecar.service_name, exit_code, output
            );
            return Err(SidecarError::CommandFailed {
                service: sidecar.service_name.clone(),
                exit_code,
                output,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_commands_are_chained_in_one_shell() {
        let commands = vec![
            "tc qdisc del dev eth0 root".to_string(),
            "tc qdisc add dev eth0 root handle 1: htb default 1".to_string(),
        ];
        assert_eq!(
            DockerNetworkingSidecarManager::shell_command(&commands),
            vec![
                "sh".to_string(),
                "-c".to_string(),
                "tc qdisc del dev eth0 root && tc qdisc add dev eth0 root handle 1: htb default 1"
                    .to_string(),
            ]
        );
    }
}
