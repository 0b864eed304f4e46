// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Docker implementations of the container backend and the networking
//! sidecar manager, sharing one connection routine and one exec routine.

pub mod backend;
pub mod sidecar;

pub use backend::DockerContainerBackend;
pub use sidecar::DockerNetworkingSidecarManager;

use bollard::container::{LogOutput, RemoveContainerOptions};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::image::CreateImageOptions;
use bollard::models::ExecInspectResponse;
use bollard::Docker;
use futures::StreamExt;
use thiserror::Error;
use tracing::info;

/// Labels carried by every container the enclave creates.
pub const ENCLAVE_LABEL: &str = "aegis.enclave-id";
pub const SERVICE_UUID_LABEL: &str = "aegis.service-uuid";
pub const SERVICE_NAME_LABEL: &str = "aegis.service-name";

/// Connect to the Docker daemon through a custom socket, or auto-detect it.
pub fn connect(socket_path: Option<&str>) -> Result<Docker, String> {
    match socket_path {
        Some(path) => {
            #[cfg(unix)]
            let result = Docker::connect_with_unix(path, 120, bollard::API_DEFAULT_VERSION);

            #[cfg(windows)]
            let result = Docker::connect_with_named_pipe(path, 120, bollard::API_DEFAULT_VERSION);

            result.map_err(|e| {
                format!(
                    "Failed to connect to Docker at {}: {}\n\n\
                     Ensure Docker is running and the socket path is correct.",
                    path, e
                )
            })
        }
        None => Docker::connect_with_local_defaults().map_err(|e| {
            format!(
                "Failed to connect to Docker: {}\n\n\
                 Common causes:\n\
                 - Docker daemon not running (check: docker ps)\n\
                 - Permission denied accessing Docker socket",
                e
            )
        }),
    }
}

/// Pull `image` unless it is already present locally.
pub async fn ensure_image(docker: &Docker, image: &str) -> Result<(), String> {
    if docker.inspect_image(image).await.is_ok() {
        return Ok(());
    }
    info!("Pulling image: {}", image);
    let options = Some(CreateImageOptions {
        from_image: image.to_string(),
        ..Default::default()
    });
    let mut stream = docker.create_image(options, None, None);
    while let Some(result) = stream.next().await {
        if let Err(e) = result {
            return Err(format!(
                "Failed to pull image {}: {}\n\nTry manually: docker pull {}",
                image, e, image
            ));
        }
    }
    info!("Successfully pulled image: {}", image);
    Ok(())
}

#[derive(Debug, Error)]
pub enum ExecError {
    #[error(transparent)]
    Docker(#[from] bollard::errors::Error),
    #[error("exec {0} finished without reporting an exit code")]
    MissingExitCode(String),
}

/// Force-remove a container that never became usable.
pub async fn force_remove(
    docker: &Docker,
    container_id: &str,
) -> Result<(), bollard::errors::Error> {
    let options = RemoveContainerOptions {
        force: true,
        ..Default::default()
    };
    docker.remove_container(container_id, Some(options)).await
}

/// A finished exec without an exit code is reported as an error, never as success.
fn exit_code_of(exec_id: &str, inspect: &ExecInspectResponse) -> Result<i64, ExecError> {
    inspect
        .exit_code
        .ok_or_else(|| ExecError::MissingExitCode(exec_id.to_string()))
}

/// Run `cmd` in a container and collect its exit code and combined output.
pub async fn exec(
    docker: &Docker,
    container_id: &str,
    cmd: Vec<String>,
) -> Result<(i64, String), ExecError> {
    let exec_config = CreateExecOptions {
        attach_stdout: Some(true),
        attach_stderr: Some(true),
        cmd: Some(cmd),
        ..Default::default()
    };
    let exec = docker.create_exec(container_id, exec_config).await?;

    let mut output = String::new();
    if let StartExecResults::Attached { output: mut stream, .. } =
        docker.start_exec(&exec.id, None).await?
    {
        while let Some(message) = stream.next().await {
            match message? {
                LogOutput::StdOut { message } | LogOutput::StdErr { message } => {
                    output.push_str(&String::from_utf8_lossy(&message));
                }
                _ => {}
            }
        }
    }

    let inspect = docker.inspect_exec(&exec.id).await?;
    Ok((exit_code_of(&exec.id, &inspect)?, output))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_exit_code_is_an_error() {
        let inspect = ExecInspectResponse::default();
        assert!(matches!(
            exit_code_of("exec-1", &inspect),
            Err(ExecError::MissingExitCode(id)) if id == "exec-1"
        ));

        let inspect = ExecInspectResponse {
            exit_code: Some(2),
            ..Default::default()
        };
        assert_eq!(exit_code_of("exec-1", &inspect).unwrap(), 2);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_force_remove_reports_unreachable_daemon() {
        let docker = Docker::connect_with_unix(
            "/nonexistent/aegis-test/docker.sock",
            1,
            bollard::API_DEFAULT_VERSION,
        )
        .unwrap();
        assert!(force_remove(&docker, "sidecar-1").await.is_err());
    }
}
