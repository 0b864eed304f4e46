// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! In-memory container backend and sidecar manager.
//!
//! Both keep their state behind a `parking_lot::Mutex`, record every call and
//! accept per-service failure injection, so the service network can be
//! exercised without a container engine.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;
use tracing::debug;

use crate::domain::backend::{BackendError, ContainerBackend};
use crate::domain::config::Ipv4Subnet;
use crate::domain::service::{
    EnclaveId, ExecResult, Service, ServiceConfig, ServiceName, ServiceRegistration, ServiceStatus,
    ServiceUuid,
};
use crate::domain::sidecar::{NetworkingSidecar, NetworkingSidecarManager, SidecarError};
use crate::infrastructure::ip_allocator::FreeIpAddrTracker;

const DEFAULT_SUBNET: Ipv4Subnet = Ipv4Subnet {
    network: Ipv4Addr::new(10, 0, 0, 0),
    prefix_length: 16,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendOperation {
    Register,
    Unregister,
    Start,
    Stop,
    Destroy,
    Pause,
    Unpause,
    Exec,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendCall {
    pub operation: BackendOperation,
    pub service: ServiceName,
}

#[derive(Debug)]
struct Record {
    name: ServiceName,
    ip: Ipv4Addr,
    ip_released: bool,
    container: Option<ServiceStatus>,
}

struct BackendState {
    ips: FreeIpAddrTracker,
    uuids: VecDeque<ServiceUuid>,
    records: HashMap<ServiceUuid, Record>,
    failures: HashSet<(BackendOperation, ServiceName)>,
    calls: Vec<BackendCall>,
}

pub struct InMemoryContainerBackend {
    state: Mutex<BackendState>,
    start_delay: Option<Duration>,
}

impl InMemoryContainerBackend {
    pub fn new() -> Self {
        Self::with_subnet(DEFAULT_SUBNET)
    }

    pub fn with_subnet(subnet: Ipv4Subnet) -> Self {
        Self {
            state: Mutex::new(BackendState {
                ips: FreeIpAddrTracker::new(subnet),
                uuids: VecDeque::new(),
                records: HashMap::new(),
                failures: HashSet::new(),
                calls: Vec::new(),
            }),
            start_delay: None,
        }
    }

    /// Registrations consume these UUIDs in order before generating new ones.
    pub fn with_uuids(self, uuids: impl IntoIterator<Item = ServiceUuid>) -> Self {
        self.state.lock().uuids.extend(uuids);
        self
    }

    /// Container starts take this long, which leaves room to cancel them.
    pub fn with_start_delay(mut self, delay: Duration) -> Self {
        self.start_delay = Some(delay);
        self
    }

    pub fn fail_on(&self, operation: BackendOperation, service: ServiceName) {
        self.state.lock().failures.insert((operation, service));
    }

    pub fn clear_failures(&self) {
        self.state.lock().failures.clear();
    }

    pub fn calls(&self) -> Vec<BackendCall> {
        self.state.lock().calls.clone()
    }

    pub fn calls_for(&self, operation: BackendOperation) -> Vec<ServiceName> {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|call| call.operation == operation)
            .map(|call| call.service.clone())
            .collect()
    }

    pub fn is_registered(&self, uuid: &ServiceUuid) -> bool {
        self.state.lock().records.contains_key(uuid)
    }

    pub fn status_of(&self, uuid: &ServiceUuid) -> Option<ServiceStatus> {
        self.state
            .lock()
            .records
            .get(uuid)
            .and_then(|record| record.container)
    }

    pub fn is_running(&self, uuid: &ServiceUuid) -> bool {
        self.status_of(uuid) == Some(ServiceStatus::Running)
    }

    pub fn is_paused(&self, uuid: &ServiceUuid) -> bool {
        self.status_of(uuid) == Some(ServiceStatus::Paused)
    }

    pub fn ips_in_use(&self) -> usize {
        self.state.lock().ips.in_use()
    }

    /// Records the call, then applies any injected failure.
    fn begin(
        state: &mut BackendState,
        operation: BackendOperation,
        service: &ServiceName,
    ) -> Result<(), String> {
        state.calls.push(BackendCall {
            operation,
            service: service.clone(),
        });
        if state.failures.contains(&(operation, service.clone())) {
            return Err(format!("injected {:?} failure", operation));
        }
        Ok(())
    }

    fn name_of(state: &BackendState, uuid: &ServiceUuid) -> Result<ServiceName, BackendError> {
        state
            .records
            .get(uuid)
            .map(|record| record.name.clone())
            .ok_or_else(|| BackendError::ServiceNotFound(uuid.clone()))
    }

    fn set_status(
        &self,
        uuid: &ServiceUuid,
        operation: BackendOperation,
        status: ServiceStatus,
    ) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        let name = Self::name_of(&state, uuid)?;
        Self::begin(&mut state, operation, &name).map_err(|reason| BackendError::PauseFailed {
            uuid: uuid.clone(),
            reason,
        })?;
        let record = state
            .records
            .get_mut(uuid)
            .ok_or_else(|| BackendError::ServiceNotFound(uuid.clone()))?;
        if record.container.is_none() {
            return Err(BackendError::PauseFailed {
                uuid: uuid.clone(),
                reason: "service has no container".to_string(),
            });
        }
        record.container = Some(status);
        Ok(())
    }
}

impl Default for InMemoryContainerBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ContainerBackend for InMemoryContainerBackend {
    async fn register_service(
        &self,
        _enclave: &EnclaveId,
        name: &ServiceName,
    ) -> Result<ServiceRegistration, BackendError> {
        let mut state = self.state.lock();
        Self::begin(&mut state, BackendOperation::Register, name).map_err(|reason| {
            BackendError::RegistrationFailed {
                name: name.clone(),
                reason,
            }
        })?;
        let ip = state
            .ips
            .allocate()
            .ok_or_else(|| BackendError::NoFreeIpAddress(state.ips.subnet().to_string()))?;
        let uuid = state.uuids.pop_front().unwrap_or_else(ServiceUuid::generate);
        state.records.insert(
            uuid.clone(),
            Record {
                name: name.clone(),
                ip,
                ip_released: false,
                container: None,
            },
        );
        debug!("Registered '{}' as {} at {}", name, uuid, ip);
        Ok(ServiceRegistration::new(name.clone(), uuid, IpAddr::V4(ip)))
    }

    async fn unregister_service(
        &self,
        _enclave: &EnclaveId,
        uuid: &ServiceUuid,
    ) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        let name = Self::name_of(&state, uuid)?;
        Self::begin(&mut state, BackendOperation::Unregister, &name).map_err(|reason| {
            BackendError::DestroyFailed {
                uuid: uuid.clone(),
                reason,
            }
        })?;
        if let Some(record) = state.records.remove(uuid) {
            if !record.ip_released {
                state.ips.release(record.ip);
            }
        }
        Ok(())
    }

    async fn start_service(
        &self,
        _enclave: &EnclaveId,
        registration: &ServiceRegistration,
        config: &ServiceConfig,
    ) -> Result<Service, BackendError> {
        if let Some(delay) = self.start_delay {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.state.lock();
        let uuid = &registration.uuid;
        Self::name_of(&state, uuid)?;
        Self::begin(&mut state, BackendOperation::Start, &registration.name).map_err(
            |reason| BackendError::StartFailed {
                uuid: uuid.clone(),
                reason,
            },
        )?;
        if let Some(record) = state.records.get_mut(uuid) {
            record.container = Some(ServiceStatus::Running);
        }
        Ok(Service {
            registration: registration.clone(),
            container_id: format!("container-{}", uuid.shortened()),
            status: ServiceStatus::Running,
            private_ports: config.private_ports.clone(),
            public_ip: None,
            public_ports: config.public_ports.clone(),
            started_at: Utc::now(),
        })
    }

    async fn stop_service(
        &self,
        _enclave: &EnclaveId,
        uuid: &ServiceUuid,
    ) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        let name = Self::name_of(&state, uuid)?;
        Self::begin(&mut state, BackendOperation::Stop, &name).map_err(|reason| {
            BackendError::StopFailed {
                uuid: uuid.clone(),
                reason,
            }
        })?;
        let ip = match state.records.get_mut(uuid) {
            Some(record) if record.ip_released => None,
            Some(record) => {
                record.container = Some(ServiceStatus::Stopped);
                record.ip_released = true;
                Some(record.ip)
            }
            None => return Err(BackendError::ServiceNotFound(uuid.clone())),
        };
        if let Some(ip) = ip {
            state.ips.release(ip);
        }
        Ok(())
    }

    async fn destroy_service(
        &self,
        _enclave: &EnclaveId,
        uuid: &ServiceUuid,
    ) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        let name = Self::name_of(&state, uuid)?;
        Self::begin(&mut state, BackendOperation::Destroy, &name).map_err(|reason| {
            BackendError::DestroyFailed {
                uuid: uuid.clone(),
                reason,
            }
        })?;
        match state.records.get_mut(uuid) {
            Some(record) if record.container.is_some() => {
                record.container = None;
                Ok(())
            }
            _ => Err(BackendError::DestroyFailed {
                uuid: uuid.clone(),
                reason: "service has no container".to_string(),
            }),
        }
    }

    async fn pause_service(
        &self,
        _enclave: &EnclaveId,
        uuid: &ServiceUuid,
    ) -> Result<(), BackendError> {
        self.set_status(uuid, BackendOperation::Pause, ServiceStatus::Paused)
    }

    async fn unpause_service(
        &self,
        _enclave: &EnclaveId,
        uuid: &ServiceUuid,
    ) -> Result<(), BackendError> {
        self.set_status(uuid, BackendOperation::Unpause, ServiceStatus::Running)
    }

    async fn exec_command(
        &self,
        _enclave: &EnclaveId,
        uuid: &ServiceUuid,
        command: &[String],
    ) -> Result<ExecResult, BackendError> {
        let mut state = self.state.lock();
        let name = Self::name_of(&state, uuid)?;
        Self::begin(&mut state, BackendOperation::Exec, &name).map_err(|reason| {
            BackendError::ExecFailed {
                uuid: uuid.clone(),
                reason,
            }
        })?;
        Ok(ExecResult {
            exit_code: 0,
            output: command.join(" "),
        })
    }
}

/// One command batch as received by [`InMemorySidecarManager`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedBatch {
    pub service: ServiceName,
    pub commands: Vec<String>,
}

#[derive(Default)]
struct SidecarState {
    live: BTreeSet<ServiceName>,
    removed: Vec<ServiceName>,
    batches: Vec<RecordedBatch>,
    failing_commands: HashSet<ServiceName>,
    failing_adds: HashSet<ServiceName>,
    failing_removals: HashSet<ServiceName>,
}

#[derive(Default)]
pub struct InMemorySidecarManager {
    state: Mutex<SidecarState>,
}

impl InMemorySidecarManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_commands_for(&self, service: ServiceName) {
        self.state.lock().failing_commands.insert(service);
    }

    pub fn fail_add_for(&self, service: ServiceName) {
        self.state.lock().failing_adds.insert(service);
    }

    pub fn fail_remove_for(&self, service: ServiceName) {
        self.state.lock().failing_removals.insert(service);
    }

    pub fn clear_failures(&self) {
        let mut state = self.state.lock();
        state.failing_commands.clear();
        state.failing_adds.clear();
        state.failing_removals.clear();
    }

    /// Every batch run so far, initialization included, in dispatch order.
    pub fn batches(&self) -> Vec<RecordedBatch> {
        self.state.lock().batches.clone()
    }

    pub fn batches_for(&self, service: &ServiceName) -> Vec<RecordedBatch> {
        self.state
            .lock()
            .batches
            .iter()
            .filter(|batch| &batch.service == service)
            .cloned()
            .collect()
    }

    pub fn live_sidecars(&self) -> BTreeSet<ServiceName> {
        self.state.lock().live.clone()
    }

    pub fn removed(&self) -> Vec<ServiceName> {
        self.state.lock().removed.clone()
    }
}

#[async_trait]
impl NetworkingSidecarManager for InMemorySidecarManager {
    async fn add(
        &self,
        _enclave: &EnclaveId,
        service: &Service,
    ) -> Result<NetworkingSidecar, SidecarError> {
        let mut state = self.state.lock();
        if state.failing_adds.contains(service.name()) {
            return Err(SidecarError::CreationFailed {
                service: service.name().clone(),
                reason: "injected creation failure".to_string(),
            });
        }
        state.live.insert(service.name().clone());
        Ok(NetworkingSidecar::new(
            service.name().clone(),
            service.uuid().clone(),
            format!("sidecar-{}", service.uuid().shortened()),
            crate::domain::sidecar::DEFAULT_SIDECAR_INTERFACE,
        ))
    }

    async fn remove(
        &self,
        _enclave: &EnclaveId,
        sidecar: &NetworkingSidecar,
    ) -> Result<(), SidecarError> {
        let mut state = self.state.lock();
        if state.failing_removals.contains(&sidecar.service_name) {
            return Err(SidecarError::RemovalFailed {
                service: sidecar.service_name.clone(),
                reason: "injected removal failure".to_string(),
            });
        }
        state.live.remove(&sidecar.service_name);
        state.removed.push(sidecar.service_name.clone());
        Ok(())
    }

    async fn run_commands(
        &self,
        _enclave: &EnclaveId,
        sidecar: &NetworkingSidecar,
        commands: &[String],
    ) -> Result<(), SidecarError> {
        let mut state = self.state.lock();
        if state.failing_commands.contains(&sidecar.service_name) {
            return Err(SidecarError::CommandFailed {
                service: sidecar.service_name.clone(),
                exit_code: 1,
                output: "injected command failure".to_string(),
            });
        }
        state.batches.push(RecordedBatch {
            service: sidecar.service_name.clone(),
            commands: commands.to_vec(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_injected_uuids_are_used_in_order() {
        let backend = InMemoryContainerBackend::new().with_uuids([
            ServiceUuid::new("11111111111111111111111111111111"),
            ServiceUuid::new("22222222222222222222222222222222"),
        ]);
        let enclave = EnclaveId::new("e");
        let a = backend
            .register_service(&enclave, &ServiceName::new("a"))
            .await
            .unwrap();
        let b = backend
            .register_service(&enclave, &ServiceName::new("b"))
            .await
            .unwrap();
        assert_eq!(a.uuid.as_str(), "11111111111111111111111111111111");
        assert_eq!(b.uuid.as_str(), "22222222222222222222222222222222");
        assert_eq!(a.private_ip, IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)));
    }

    #[tokio::test]
    async fn test_stop_releases_ip_and_keeps_container() {
        let backend = InMemoryContainerBackend::new();
        let enclave = EnclaveId::new("e");
        let registration = backend
            .register_service(&enclave, &ServiceName::new("a"))
            .await
            .unwrap();
        backend
            .start_service(&enclave, &registration, &ServiceConfig::new("alpine"))
            .await
            .unwrap();
        backend.stop_service(&enclave, &registration.uuid).await.unwrap();

        assert_eq!(backend.status_of(&registration.uuid), Some(ServiceStatus::Stopped));
        assert_eq!(backend.ips_in_use(), 0);
    }

    #[tokio::test]
    async fn test_destroy_keeps_registration() {
        let backend = InMemoryContainerBackend::new();
        let enclave = EnclaveId::new("e");
        let registration = backend
            .register_service(&enclave, &ServiceName::new("a"))
            .await
            .unwrap();
        backend
            .start_service(&enclave, &registration, &ServiceConfig::new("alpine"))
            .await
            .unwrap();
        backend.destroy_service(&enclave, &registration.uuid).await.unwrap();

        assert!(backend.is_registered(&registration.uuid));
        assert_eq!(backend.status_of(&registration.uuid), None);
        backend.unregister_service(&enclave, &registration.uuid).await.unwrap();
        assert_eq!(backend.ips_in_use(), 0);
    }

    #[tokio::test]
    async fn test_failure_injection_is_recorded() {
        let backend = InMemoryContainerBackend::new();
        backend.fail_on(BackendOperation::Register, ServiceName::new("a"));
        let err = backend
            .register_service(&EnclaveId::new("e"), &ServiceName::new("a"))
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::RegistrationFailed { .. }));
        assert_eq!(backend.calls_for(BackendOperation::Register), vec![ServiceName::new("a")]);
        assert_eq!(backend.ips_in_use(), 0);
    }

    #[tokio::test]
    async fn test_unknown_uuid_is_not_found() {
        let backend = InMemoryContainerBackend::new();
        let err = backend
            .destroy_service(&EnclaveId::new("e"), &ServiceUuid::new("missing"))
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::ServiceNotFound(_)));
    }
}
