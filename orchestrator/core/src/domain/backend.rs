// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::service::{
    EnclaveId, ExecResult, Service, ServiceConfig, ServiceName, ServiceRegistration, ServiceUuid,
};

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("Failed to connect to container engine: {0}")]
    ConnectionFailed(String),
    #[error("Failed to register service '{name}': {reason}")]
    RegistrationFailed { name: ServiceName, reason: String },
    #[error("No free IP address left in subnet {0}")]
    NoFreeIpAddress(String),
    #[error("Service not found in backend: {0}")]
    ServiceNotFound(ServiceUuid),
    #[error("Failed to start service {uuid}: {reason}")]
    StartFailed { uuid: ServiceUuid, reason: String },
    #[error("Failed to stop service {uuid}: {reason}")]
    StopFailed { uuid: ServiceUuid, reason: String },
    #[error("Failed to destroy service {uuid}: {reason}")]
    DestroyFailed { uuid: ServiceUuid, reason: String },
    #[error("Failed to pause or unpause service {uuid}: {reason}")]
    PauseFailed { uuid: ServiceUuid, reason: String },
    #[error("Failed to execute command in service {uuid}: {reason}")]
    ExecFailed { uuid: ServiceUuid, reason: String },
}

/// Container engine that realizes service lifecycle effects.
///
/// Registration only reserves identity and a private IP; no container exists
/// until `start_service`. Every other call is keyed by the service UUID.
/// Containers and registrations are released separately: `destroy_service`
/// removes the container only, `unregister_service` releases the identity.
#[async_trait]
pub trait ContainerBackend: Send + Sync {
    async fn register_service(
        &self,
        enclave: &EnclaveId,
        name: &ServiceName,
    ) -> Result<ServiceRegistration, BackendError>;

    async fn unregister_service(
        &self,
        enclave: &EnclaveId,
        uuid: &ServiceUuid,
    ) -> Result<(), BackendError>;

    async fn start_service(
        &self,
        enclave: &EnclaveId,
        registration: &ServiceRegistration,
        config: &ServiceConfig,
    ) -> Result<Service, BackendError>;

    /// Stops the container but keeps it around so its logs survive. The
    /// private IP is released.
    async fn stop_service(&self, enclave: &EnclaveId, uuid: &ServiceUuid)
        -> Result<(), BackendError>;

    async fn destroy_service(
        &self,
        enclave: &EnclaveId,
        uuid: &ServiceUuid,
    ) -> Result<(), BackendError>;

    async fn pause_service(
        &self,
        enclave: &EnclaveId,
        uuid: &ServiceUuid,
    ) -> Result<(), BackendError>;

    async fn unpause_service(
        &self,
        enclave: &EnclaveId,
        uuid: &ServiceUuid,
    ) -> Result<(), BackendError>;

    async fn exec_command(
        &self,
        enclave: &EnclaveId,
        uuid: &ServiceUuid,
        command: &[String],
    ) -> Result<ExecResult, BackendError>;
}
