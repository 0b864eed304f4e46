// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Service Network Application Service
//!
//! Orchestrates the services of one enclave, coordinating:
//! - Domain layer: PartitionTopology, ServiceRegistry
//! - Container backend: registration, container lifecycle, exec
//! - Networking sidecars: traffic control that realizes partitions
//! - Event bus: publishing NetworkEvents for observability
//!
//! One `tokio::sync::Mutex` guards the topology, the registry and the
//! sidecar map. Every public operation holds it for its whole duration,
//! backend round-trips included, so no caller ever observes a half-applied
//! mutation. The HTTP probe is the only operation that releases it before
//! doing I/O.

use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use chrono::Utc;

use crate::application::rollback::{Compensation, CompensationContext, Rollback};
use crate::application::traffic_sync::{update_all_connections_from_topology, SyncError, SyncScope};
use crate::domain::backend::{BackendError, ContainerBackend};
use crate::domain::config::EnclaveConfigManifest;
use crate::domain::events::NetworkEvent;
use crate::domain::partition_topology::{
    PartitionConnection, PartitionConnectionId, PartitionId, PartitionTopology, TopologyError,
};
use crate::domain::registry::{RegistryError, ServiceRegistry};
use crate::domain::service::{
    EnclaveId, ExecResult, Service, ServiceConfig, ServiceName, ServiceRegistration, ServiceStatus,
    ServiceUuid, ServiceValidationError, TransportProtocol, UpdateServiceConfig,
};
use crate::domain::sidecar::{NetworkingSidecar, NetworkingSidecarManager, SidecarError};
use crate::infrastructure::event_bus::EventBus;

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("the service network has been destroyed")]
    Destroyed,

    #[error("cannot {operation}: network partitioning is not enabled for this enclave")]
    PartitioningDisabled { operation: &'static str },

    #[error("invalid service name: {0}")]
    InvalidServiceName(#[source] ServiceValidationError),

    #[error("invalid configuration for service '{service}': {source}")]
    InvalidServiceConfig {
        service: ServiceName,
        #[source]
        source: ServiceValidationError,
    },

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("service '{0}' has already been started")]
    AlreadyStarted(ServiceName),

    #[error("service '{0}' is registered but has not been started")]
    NotStarted(ServiceName),

    #[error("topology update failed during {operation}: {source}")]
    Topology {
        operation: &'static str,
        #[source]
        source: TopologyError,
    },

    #[error("{step} failed for service '{service}': {source}")]
    Backend {
        service: ServiceName,
        step: &'static str,
        #[source]
        source: BackendError,
    },

    #[error("{step} failed for service '{service}': {source}")]
    Sidecar {
        service: ServiceName,
        step: &'static str,
        #[source]
        source: SidecarError,
    },

    #[error(transparent)]
    TrafficControlSync(#[from] SyncError),

    #[error("cannot move a service to status {0:?} through pause or unpause")]
    InvalidStatusChange(ServiceStatus),

    #[error("operation cancelled during {step}")]
    Cancelled { step: &'static str },

    #[error("service '{service}' has no private TCP port '{port_id}'")]
    PortNotFound { service: ServiceName, port_id: String },

    #[error("unsupported HTTP method '{0}'; only GET and POST are allowed")]
    UnsupportedHttpMethod(String),

    #[error("failed to build the HTTP client: {0}")]
    HttpClient(#[source] reqwest::Error),

    #[error("HTTP request to {url} failed: {source}")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },
}

fn topology_error(operation: &'static str) -> impl FnOnce(TopologyError) -> NetworkError {
    move |source| NetworkError::Topology { operation, source }
}

fn backend_error(
    service: &ServiceName,
    step: &'static str,
) -> impl FnOnce(BackendError) -> NetworkError {
    let service = service.clone();
    move |source| NetworkError::Backend {
        service,
        step,
        source,
    }
}

fn sidecar_error(
    service: &ServiceName,
    step: &'static str,
) -> impl FnOnce(SidecarError) -> NetworkError {
    let service = service.clone();
    move |source| NetworkError::Sidecar {
        service,
        step,
        source,
    }
}

/// Races a forward step against cancellation.
pub(crate) async fn cancellable<F>(
    token: &CancellationToken,
    step: &'static str,
    future: F,
) -> Result<F::Output, NetworkError>
where
    F: Future,
{
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(NetworkError::Cancelled { step }),
        output = future => Ok(output),
    }
}

// ============================================================================
// Results
// ============================================================================

/// Per-item results of a bulk operation.
#[derive(Debug)]
pub struct BulkOutcome<T> {
    pub successes: BTreeMap<ServiceName, T>,
    pub failures: BTreeMap<ServiceName, NetworkError>,
}

impl<T> BulkOutcome<T> {
    pub fn new() -> Self {
        Self {
            successes: BTreeMap::new(),
            failures: BTreeMap::new(),
        }
    }

    pub fn is_complete_success(&self) -> bool {
        self.failures.is_empty()
    }
}

impl<T> Default for BulkOutcome<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone)]
pub struct HttpServiceRequest {
    pub port_id: String,
    pub method: String,
    pub content_type: Option<String>,
    pub endpoint: String,
    pub body: String,
}

impl HttpServiceRequest {
    pub fn get(port_id: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            port_id: port_id.into(),
            method: "GET".to_string(),
            content_type: None,
            endpoint: endpoint.into(),
            body: String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpServiceResponse {
    pub status: u16,
    pub body: String,
}

// ============================================================================
// State
// ============================================================================

/// A service that changed partition: name, source, target.
type PartitionMove = (ServiceName, PartitionId, PartitionId);

pub(crate) struct NetworkState {
    pub destroyed: bool,
    pub topology: PartitionTopology,
    pub registry: ServiceRegistry,
    pub sidecars: BTreeMap<ServiceName, NetworkingSidecar>,
}

impl NetworkState {
    pub fn new(default_connection: PartitionConnection) -> Self {
        Self {
            destroyed: false,
            topology: PartitionTopology::new(default_connection),
            registry: ServiceRegistry::new(),
            sidecars: BTreeMap::new(),
        }
    }
}

/// An empty partition id means the default partition.
fn normalize_partition(partition: PartitionId) -> PartitionId {
    if partition.as_str().trim().is_empty() {
        PartitionId::default_partition()
    } else {
        partition
    }
}

// ============================================================================
// Service Trait
// ============================================================================

#[async_trait]
pub trait ServiceNetwork: Send + Sync {
    /// Reserve identity and a private IP and place the service in a partition
    /// (the default one when `None`).
    async fn register_service(
        &self,
        name: ServiceName,
        partition: Option<PartitionId>,
        token: &CancellationToken,
    ) -> Result<ServiceRegistration, NetworkError>;

    /// Start a service, registering it first when needed. A registration
    /// made by this call is undone on failure; a prior one is kept.
    async fn start_service(
        &self,
        name: ServiceName,
        config: ServiceConfig,
        token: &CancellationToken,
    ) -> Result<Service, NetworkError>;

    async fn start_services(
        &self,
        configs: BTreeMap<ServiceName, ServiceConfig>,
        token: &CancellationToken,
    ) -> BulkOutcome<Service>;

    /// Move services between partitions. Keys are service identifiers.
    /// Fails as a whole, with every move undone, if the traffic control push
    /// fails.
    async fn update_service(
        &self,
        updates: BTreeMap<ServiceName, UpdateServiceConfig>,
        token: &CancellationToken,
    ) -> Result<BulkOutcome<PartitionId>, NetworkError>;

    /// Stops (not destroys) the container so its logs survive.
    async fn remove_service(
        &self,
        identifier: &str,
        token: &CancellationToken,
    ) -> Result<ServiceUuid, NetworkError>;

    async fn pause_service(
        &self,
        identifier: &str,
        token: &CancellationToken,
    ) -> Result<(), NetworkError>;

    async fn unpause_service(
        &self,
        identifier: &str,
        token: &CancellationToken,
    ) -> Result<(), NetworkError>;

    /// Holds the network lock until the command completes.
    async fn exec_command(
        &self,
        identifier: &str,
        command: Vec<String>,
        token: &CancellationToken,
    ) -> Result<ExecResult, NetworkError>;

    async fn http_request_service(
        &self,
        identifier: &str,
        request: HttpServiceRequest,
        token: &CancellationToken,
    ) -> Result<HttpServiceResponse, NetworkError>;

    async fn repartition(
        &self,
        membership: BTreeMap<PartitionId, BTreeSet<ServiceName>>,
        connections: BTreeMap<PartitionConnectionId, PartitionConnection>,
        default_connection: PartitionConnection,
        token: &CancellationToken,
    ) -> Result<(), NetworkError>;

    /// Partitions that do not exist yet are created.
    async fn set_connection(
        &self,
        a: PartitionId,
        b: PartitionId,
        connection: PartitionConnection,
        token: &CancellationToken,
    ) -> Result<(), NetworkError>;

    /// No-op when either partition is unknown or the pair already uses the
    /// default connection.
    async fn unset_connection(
        &self,
        a: PartitionId,
        b: PartitionId,
        token: &CancellationToken,
    ) -> Result<(), NetworkError>;

    async fn set_default_connection(
        &self,
        connection: PartitionConnection,
        token: &CancellationToken,
    ) -> Result<(), NetworkError>;

    async fn get_service(&self, identifier: &str) -> Result<Service, NetworkError>;

    async fn get_service_registration(
        &self,
        identifier: &str,
    ) -> Result<ServiceRegistration, NetworkError>;

    async fn get_service_names(&self) -> BTreeSet<ServiceName>;

    async fn get_ip_address_for_service(&self, identifier: &str) -> Option<IpAddr>;

    async fn get_partition_of(&self, identifier: &str) -> Result<PartitionId, NetworkError>;

    async fn topology_snapshot(&self) -> PartitionTopology;

    fn is_partitioning_enabled(&self) -> bool;

    /// Tear the enclave down. Every item is attempted; afterwards every
    /// operation fails with [`NetworkError::Destroyed`].
    async fn destroy(&self) -> Result<BulkOutcome<()>, NetworkError>;
}

// ============================================================================
// Default Implementation
// ============================================================================

pub struct DefaultServiceNetwork {
    enclave_id: EnclaveId,
    partitioning_enabled: bool,
    backend: Arc<dyn ContainerBackend>,
    sidecar_manager: Arc<dyn NetworkingSidecarManager>,
    event_bus: Arc<EventBus>,
    http_client: reqwest::Client,
    state: Mutex<NetworkState>,
}

impl DefaultServiceNetwork {
    pub fn new(
        enclave_id: EnclaveId,
        partitioning_enabled: bool,
        default_connection: PartitionConnection,
        backend: Arc<dyn ContainerBackend>,
        sidecar_manager: Arc<dyn NetworkingSidecarManager>,
        event_bus: Arc<EventBus>,
    ) -> Result<Self, NetworkError> {
        info!(
            "Creating service network for enclave {} (partitioning enabled: {})",
            enclave_id, partitioning_enabled
        );
        // Probes target enclave-private addresses, never a proxy.
        let http_client = reqwest::Client::builder()
            .no_proxy()
            .build()
            .map_err(NetworkError::HttpClient)?;
        Ok(Self {
            enclave_id,
            partitioning_enabled,
            backend,
            sidecar_manager,
            event_bus,
            http_client,
            state: Mutex::new(NetworkState::new(default_connection)),
        })
    }

    pub fn from_config(
        config: &EnclaveConfigManifest,
        backend: Arc<dyn ContainerBackend>,
        sidecar_manager: Arc<dyn NetworkingSidecarManager>,
        event_bus: Arc<EventBus>,
    ) -> anyhow::Result<Self> {
        config.validate()?;
        Ok(Self::new(
            EnclaveId::new(config.spec.enclave.id.clone()),
            config.spec.enclave.partitioning_enabled,
            config.spec.default_connection,
            backend,
            sidecar_manager,
            event_bus,
        )?)
    }

    pub fn enclave_id(&self) -> &EnclaveId {
        &self.enclave_id
    }

    async fn lock(&self) -> Result<MutexGuard<'_, NetworkState>, NetworkError> {
        let state = self.state.lock().await;
        if state.destroyed {
            return Err(NetworkError::Destroyed);
        }
        Ok(state)
    }

    fn require_partitioning(&self, operation: &'static str) -> Result<(), NetworkError> {
        if self.partitioning_enabled {
            Ok(())
        } else {
            Err(NetworkError::PartitioningDisabled { operation })
        }
    }

    /// Commits on success, unwinds every pending compensation on failure.
    async fn finish<T>(
        &self,
        rollback: Rollback,
        state: &mut NetworkState,
        result: Result<T, NetworkError>,
    ) -> Result<T, NetworkError> {
        match result {
            Ok(value) => {
                rollback.commit();
                Ok(value)
            }
            Err(e) => {
                let mut ctx = CompensationContext {
                    enclave_id: &self.enclave_id,
                    state,
                    backend: self.backend.as_ref(),
                    sidecar_manager: self.sidecar_manager.as_ref(),
                };
                rollback.unwind(&mut ctx).await;
                Err(e)
            }
        }
    }

    async fn sync(
        &self,
        state: &mut NetworkState,
        scope: SyncScope,
        token: &CancellationToken,
    ) -> Result<(), NetworkError> {
        let result = update_all_connections_from_topology(
            &self.enclave_id,
            state,
            self.sidecar_manager.as_ref(),
            &scope,
            token,
        )
        .await;
        if let Err(NetworkError::TrafficControlSync(e)) = &result {
            warn!("Traffic control sync in enclave {} failed: {}", self.enclave_id, e);
            self.event_bus
                .publish_network_event(NetworkEvent::TrafficControlSyncFailed {
                    enclave_id: self.enclave_id.clone(),
                    failed_services: e.failed_services(),
                    failed_at: Utc::now(),
                });
        }
        result
    }

    /// Full matrix push after a topology mutation; a failure restores the
    /// topology and then pushes again.
    async fn sync_topology_change(
        &self,
        state: &mut NetworkState,
        rollback: &mut Rollback,
        token: &CancellationToken,
    ) -> Result<(), NetworkError> {
        rollback.push_final(Compensation::ResyncTrafficControl);
        self.sync(state, SyncScope::All, token).await
    }

    fn publish_topology_changed(&self, operation: &str) {
        self.event_bus
            .publish_network_event(NetworkEvent::TopologyChanged {
                enclave_id: self.enclave_id.clone(),
                operation: operation.to_string(),
                changed_at: Utc::now(),
            });
    }

    fn started_service(state: &NetworkState, name: &ServiceName) -> Result<Service, NetworkError> {
        state
            .registry
            .service(name)
            .cloned()
            .ok_or_else(|| NetworkError::NotStarted(name.clone()))
    }

    async fn register_locked(
        &self,
        state: &mut NetworkState,
        rollback: &mut Rollback,
        name: ServiceName,
        partition: PartitionId,
        token: &CancellationToken,
    ) -> Result<ServiceRegistration, NetworkError> {
        name.validate().map_err(NetworkError::InvalidServiceName)?;
        if state.registry.contains(&name) {
            return Err(RegistryError::NameTaken(name).into());
        }
        if !state.topology.has_partition(&partition) {
            return Err(NetworkError::Topology {
                operation: "register_service",
                source: TopologyError::PartitionNotFound(partition),
            });
        }

        let registration = cancellable(
            token,
            "register service",
            self.backend.register_service(&self.enclave_id, &name),
        )
        .await?
        .map_err(backend_error(&name, "register service"))?;
        rollback.push(Compensation::UnregisterService(registration.uuid.clone()));

        state.registry.insert(registration.clone())?;
        rollback.push(Compensation::ForgetRegistration(name.clone()));

        state
            .topology
            .add_service(name.clone(), &partition)
            .map_err(topology_error("register_service"))?;
        rollback.push(Compensation::RemoveFromTopology(name.clone()));

        debug!(
            "Registered service '{}' with UUID {} at {} in partition '{}'",
            name, registration.uuid, registration.private_ip, partition
        );
        Ok(registration)
    }

    fn publish_registered(&self, registration: &ServiceRegistration, partition: PartitionId) {
        self.event_bus
            .publish_network_event(NetworkEvent::ServiceRegistered {
                enclave_id: self.enclave_id.clone(),
                service_name: registration.name.clone(),
                service_uuid: registration.uuid.clone(),
                private_ip: registration.private_ip,
                partition,
                registered_at: registration.registered_at,
            });
    }

    async fn start_service_locked(
        &self,
        state: &mut NetworkState,
        rollback: &mut Rollback,
        name: ServiceName,
        config: ServiceConfig,
        token: &CancellationToken,
    ) -> Result<(Service, Option<ServiceRegistration>), NetworkError> {
        name.validate().map_err(NetworkError::InvalidServiceName)?;
        config
            .validate()
            .map_err(|source| NetworkError::InvalidServiceConfig {
                service: name.clone(),
                source,
            })?;
        if state.registry.is_started(&name) {
            return Err(NetworkError::AlreadyStarted(name));
        }

        let requested = config.subnetwork.clone().map(normalize_partition);
        if let Some(partition) = &requested {
            if !state.topology.has_partition(partition) {
                debug!(
                    "Partition '{}' does not exist yet; creating it to host service '{}'",
                    partition, name
                );
                state
                    .topology
                    .create_empty_partition_with_default_connection(partition.clone())
                    .map_err(topology_error("start_service"))?;
                rollback.push(Compensation::RemovePartition(partition.clone()));
            }
        }

        let (registration, newly_registered) = match state.registry.registration(&name).cloned() {
            Some(registration) => {
                if let Some(partition) = &requested {
                    let previous = state
                        .topology
                        .move_service_to_partition(&name, partition)
                        .map_err(topology_error("start_service"))?;
                    if &previous != partition {
                        rollback.push(Compensation::MoveService {
                            service: name.clone(),
                            partition: previous,
                        });
                    }
                }
                (registration, None)
            }
            None => {
                let partition = requested
                    .clone()
                    .unwrap_or_else(|| state.topology.default_partition().clone());
                let registration = self
                    .register_locked(state, rollback, name.clone(), partition, token)
                    .await?;
                (registration.clone(), Some(registration))
            }
        };

        // Peers learn the rules for the new IP before its container exists.
        if self.partitioning_enabled {
            rollback.push_final(Compensation::ResyncTrafficControl);
            self.sync(state, SyncScope::AllExcept(name.clone()), token)
                .await?;
        }

        let service = cancellable(
            token,
            "start container",
            self.backend
                .start_service(&self.enclave_id, &registration, &config),
        )
        .await?
        .map_err(backend_error(&name, "start container"))?;
        rollback.push(Compensation::DestroyService(registration.uuid.clone()));

        state.registry.mark_started(service.clone())?;
        rollback.push(Compensation::ClearStartedService(name.clone()));

        if self.partitioning_enabled {
            let sidecar = cancellable(
                token,
                "create sidecar",
                self.sidecar_manager.add(&self.enclave_id, &service),
            )
            .await?
            .map_err(sidecar_error(&name, "create sidecar"))?;
            state.sidecars.insert(name.clone(), sidecar.clone());
            rollback.push(Compensation::RemoveSidecar(name.clone()));

            let commands = sidecar.initialize_commands();
            cancellable(
                token,
                "initialize traffic control",
                self.sidecar_manager
                    .run_commands(&self.enclave_id, &sidecar, &commands),
            )
            .await?
            .map_err(sidecar_error(&name, "initialize traffic control"))?;
            if let Some(sidecar) = state.sidecars.get_mut(&name) {
                sidecar.mark_initialized();
            }

            self.sync(state, SyncScope::Only(name.clone()), token).await?;
            debug!("Applied traffic control configuration for service '{}'", name);
        }

        Ok((service, newly_registered))
    }

    async fn update_service_locked(
        &self,
        state: &mut NetworkState,
        rollback: &mut Rollback,
        updates: BTreeMap<ServiceName, UpdateServiceConfig>,
        token: &CancellationToken,
    ) -> Result<(BulkOutcome<PartitionId>, Vec<PartitionMove>), NetworkError> {
        let mut outcome = BulkOutcome::new();
        let mut created = Vec::new();
        let mut moves = Vec::new();

        for (key, update) in updates {
            let name = match state.registry.resolve(key.as_str()) {
                Ok(name) => name,
                Err(e) => {
                    outcome.failures.insert(key, e.into());
                    continue;
                }
            };
            let Some(current) = state.topology.partition_of(&name).cloned() else {
                outcome.failures.insert(
                    key,
                    NetworkError::Topology {
                        operation: "update_service",
                        source: TopologyError::ServiceNotFound(name),
                    },
                );
                continue;
            };
            let Some(target) = update.subnetwork.map(normalize_partition) else {
                outcome.successes.insert(key, current);
                continue;
            };
            if target == current {
                outcome.successes.insert(key, current);
                continue;
            }

            if !state.topology.has_partition(&target) {
                debug!(
                    "Partition '{}' does not exist yet; creating it to host service '{}'",
                    target, name
                );
                if let Err(e) = state
                    .topology
                    .create_empty_partition_with_default_connection(target.clone())
                {
                    outcome.failures.insert(key, topology_error("update_service")(e));
                    continue;
                }
                rollback.push(Compensation::RemovePartitionIfEmpty(target.clone()));
                created.push(target.clone());
            }

            match state.topology.move_service_to_partition(&name, &target) {
                Ok(previous) => {
                    rollback.push(Compensation::MoveService {
                        service: name.clone(),
                        partition: previous.clone(),
                    });
                    moves.push((name, previous, target.clone()));
                    outcome.successes.insert(key, target);
                }
                Err(e) => {
                    outcome.failures.insert(key, topology_error("update_service")(e));
                }
            }
        }

        if !moves.is_empty() {
            self.sync_topology_change(state, rollback, token).await?;
        }

        for partition in created {
            let empty = state
                .topology
                .partition_services(&partition)
                .map(|services| services.is_empty())
                .unwrap_or(false);
            if empty {
                if let Err(e) = state.topology.remove_partition(&partition) {
                    warn!(
                        "Partition '{}' was left empty but could not be removed: {}",
                        partition, e
                    );
                }
            }
        }

        Ok((outcome, moves))
    }

    async fn remove_service_locked(
        &self,
        state: &mut NetworkState,
        identifier: &str,
        token: &CancellationToken,
    ) -> Result<(ServiceName, ServiceUuid), NetworkError> {
        let name = state.registry.resolve(identifier)?;
        let uuid = state
            .registry
            .registration(&name)
            .map(|registration| registration.uuid.clone())
            .ok_or_else(|| RegistryError::NotFound(identifier.to_string()))?;

        // Each step is recorded as soon as it succeeds, so a retry resumes
        // where a failed removal stopped.
        if let Some(sidecar) = state.sidecars.get(&name).cloned() {
            cancellable(
                token,
                "remove sidecar",
                self.sidecar_manager.remove(&self.enclave_id, &sidecar),
            )
            .await?
            .map_err(sidecar_error(&name, "remove sidecar"))?;
            state.sidecars.remove(&name);
            debug!("Removed networking sidecar of service '{}'", name);
        }

        let running = state
            .registry
            .service(&name)
            .is_some_and(|service| service.status != ServiceStatus::Stopped);
        if running {
            cancellable(
                token,
                "stop container",
                self.backend.stop_service(&self.enclave_id, &uuid),
            )
            .await?
            .map_err(backend_error(&name, "stop container"))?;
            if let Some(service) = state.registry.service_mut(&name) {
                service.status = ServiceStatus::Stopped;
            }
        }

        // Peers keep rules for the released IP until the next full sync
        // overwrites them; they match nothing in the meantime.
        cancellable(
            token,
            "unregister service",
            self.backend.unregister_service(&self.enclave_id, &uuid),
        )
        .await?
        .map_err(backend_error(&name, "unregister service"))?;

        if let Err(e) = state.topology.remove_service(&name) {
            warn!("Service '{}' was missing from the topology during removal: {}", name, e);
        }
        state.registry.remove(&name);
        Ok((name, uuid))
    }

    async fn set_status(
        &self,
        identifier: &str,
        status: ServiceStatus,
        token: &CancellationToken,
    ) -> Result<(), NetworkError> {
        let mut state = self.lock().await?;
        let name = state.registry.resolve(identifier)?;
        let service = Self::started_service(&state, &name)?;
        let uuid = service.uuid().clone();

        match status {
            ServiceStatus::Paused => cancellable(
                token,
                "pause service",
                self.backend.pause_service(&self.enclave_id, &uuid),
            )
            .await?
            .map_err(backend_error(&name, "pause service"))?,
            ServiceStatus::Running => cancellable(
                token,
                "unpause service",
                self.backend.unpause_service(&self.enclave_id, &uuid),
            )
            .await?
            .map_err(backend_error(&name, "unpause service"))?,
            ServiceStatus::Stopped => return Err(NetworkError::InvalidStatusChange(status)),
        }

        if let Some(service) = state.registry.service_mut(&name) {
            service.status = status;
        }
        debug!("Service '{}' is now {:?}", name, status);
        Ok(())
    }
}

#[async_trait]
impl ServiceNetwork for DefaultServiceNetwork {
    async fn register_service(
        &self,
        name: ServiceName,
        partition: Option<PartitionId>,
        token: &CancellationToken,
    ) -> Result<ServiceRegistration, NetworkError> {
        let mut state = self.lock().await?;
        let partition = partition
            .map(normalize_partition)
            .unwrap_or_else(|| state.topology.default_partition().clone());

        let mut rollback = Rollback::new("register_service");
        let result = self
            .register_locked(&mut state, &mut rollback, name, partition.clone(), token)
            .await;
        let registration = self.finish(rollback, &mut state, result).await?;

        info!("Registered service '{}' in enclave {}", registration.name, self.enclave_id);
        metrics::counter!("aegis_enclave_services_registered_total").increment(1);
        self.publish_registered(&registration, partition);
        Ok(registration)
    }

    async fn start_service(
        &self,
        name: ServiceName,
        config: ServiceConfig,
        token: &CancellationToken,
    ) -> Result<Service, NetworkError> {
        let mut state = self.lock().await?;
        let mut rollback = Rollback::new("start_service");
        let result = self
            .start_service_locked(&mut state, &mut rollback, name, config, token)
            .await;
        let (service, newly_registered) = self.finish(rollback, &mut state, result).await?;

        if let Some(registration) = newly_registered {
            let partition = state
                .topology
                .partition_of(&registration.name)
                .cloned()
                .unwrap_or_else(PartitionId::default_partition);
            self.publish_registered(&registration, partition);
        }
        info!(
            "Started service '{}' ({}) in enclave {}",
            service.name(),
            service.container_id,
            self.enclave_id
        );
        metrics::counter!("aegis_enclave_services_started_total").increment(1);
        self.event_bus
            .publish_network_event(NetworkEvent::ServiceStarted {
                enclave_id: self.enclave_id.clone(),
                service_name: service.name().clone(),
                service_uuid: service.uuid().clone(),
                container_id: service.container_id.clone(),
                started_at: service.started_at,
            });
        Ok(service)
    }

    async fn start_services(
        &self,
        configs: BTreeMap<ServiceName, ServiceConfig>,
        token: &CancellationToken,
    ) -> BulkOutcome<Service> {
        let mut outcome = BulkOutcome::new();
        for (name, config) in configs {
            match self.start_service(name.clone(), config, token).await {
                Ok(service) => {
                    outcome.successes.insert(name, service);
                }
                Err(e) => {
                    warn!("Failed to start service '{}': {}", name, e);
                    outcome.failures.insert(name, e);
                }
            }
        }
        outcome
    }

    async fn update_service(
        &self,
        updates: BTreeMap<ServiceName, UpdateServiceConfig>,
        token: &CancellationToken,
    ) -> Result<BulkOutcome<PartitionId>, NetworkError> {
        let mut state = self.lock().await?;
        let mut rollback = Rollback::new("update_service");
        let result = self
            .update_service_locked(&mut state, &mut rollback, updates, token)
            .await;
        let (outcome, moves) = self.finish(rollback, &mut state, result).await?;

        for (service_name, from, to) in moves {
            info!("Moved service '{}' from partition '{}' to '{}'", service_name, from, to);
            self.event_bus
                .publish_network_event(NetworkEvent::ServiceMoved {
                    enclave_id: self.enclave_id.clone(),
                    service_name,
                    from,
                    to,
                    moved_at: Utc::now(),
                });
        }
        Ok(outcome)
    }

    async fn remove_service(
        &self,
        identifier: &str,
        token: &CancellationToken,
    ) -> Result<ServiceUuid, NetworkError> {
        let mut state = self.lock().await?;
        let (name, uuid) = self.remove_service_locked(&mut state, identifier, token).await?;

        info!("Removed service '{}' ({}) from enclave {}", name, uuid, self.enclave_id);
        metrics::counter!("aegis_enclave_services_removed_total").increment(1);
        self.event_bus
            .publish_network_event(NetworkEvent::ServiceRemoved {
                enclave_id: self.enclave_id.clone(),
                service_name: name,
                service_uuid: uuid.clone(),
                removed_at: Utc::now(),
            });
        Ok(uuid)
    }

    async fn pause_service(
        &self,
        identifier: &str,
        token: &CancellationToken,
    ) -> Result<(), NetworkError> {
        self.set_status(identifier, ServiceStatus::Paused, token).await
    }

    async fn unpause_service(
        &self,
        identifier: &str,
        token: &CancellationToken,
    ) -> Result<(), NetworkError> {
        self.set_status(identifier, ServiceStatus::Running, token).await
    }

    async fn exec_command(
        &self,
        identifier: &str,
        command: Vec<String>,
        token: &CancellationToken,
    ) -> Result<ExecResult, NetworkError> {
        let state = self.lock().await?;
        let name = state.registry.resolve(identifier)?;
        let service = Self::started_service(&state, &name)?;
        debug!("Executing {:?} in service '{}'", command, name);

        cancellable(
            token,
            "exec command",
            self.backend
                .exec_command(&self.enclave_id, service.uuid(), &command),
        )
        .await?
        .map_err(backend_error(&name, "exec command"))
    }

    async fn http_request_service(
        &self,
        identifier: &str,
        request: HttpServiceRequest,
        token: &CancellationToken,
    ) -> Result<HttpServiceResponse, NetworkError> {
        let method = match request.method.to_ascii_uppercase().as_str() {
            "GET" => reqwest::Method::GET,
            "POST" => reqwest::Method::POST,
            _ => return Err(NetworkError::UnsupportedHttpMethod(request.method)),
        };

        let address = {
            let state = self.lock().await?;
            let name = state.registry.resolve(identifier)?;
            let service = Self::started_service(&state, &name)?;
            let port = service
                .private_ports
                .get(&request.port_id)
                .filter(|port| port.transport_protocol == TransportProtocol::Tcp)
                .ok_or_else(|| NetworkError::PortNotFound {
                    service: name.clone(),
                    port_id: request.port_id.clone(),
                })?;
            SocketAddr::new(service.private_ip(), port.number)
        };

        let endpoint = if request.endpoint.starts_with('/') {
            request.endpoint
        } else {
            format!("/{}", request.endpoint)
        };
        let url = format!("http://{}{}", address, endpoint);
        debug!("Sending {} request to {}", method, url);

        let mut builder = self.http_client.request(method, &url);
        if let Some(content_type) = &request.content_type {
            builder = builder.header(reqwest::header::CONTENT_TYPE, content_type.as_str());
        }
        if !request.body.is_empty() {
            builder = builder.body(request.body);
        }

        let response = cancellable(token, "http request", builder.send())
            .await?
            .map_err(|source| NetworkError::Http {
                url: url.clone(),
                source,
            })?;
        let status = response.status().as_u16();
        let body = cancellable(token, "http response body", response.text())
            .await?
            .map_err(|source| NetworkError::Http { url, source })?;
        Ok(HttpServiceResponse { status, body })
    }

    async fn repartition(
        &self,
        membership: BTreeMap<PartitionId, BTreeSet<ServiceName>>,
        connections: BTreeMap<PartitionConnectionId, PartitionConnection>,
        default_connection: PartitionConnection,
        token: &CancellationToken,
    ) -> Result<(), NetworkError> {
        let mut state = self.lock().await?;
        self.require_partitioning("repartition")?;

        let snapshot = state.topology.clone();
        state
            .topology
            .repartition(membership, connections, default_connection)
            .map_err(topology_error("repartition"))?;

        let mut rollback = Rollback::new("repartition");
        rollback.push(Compensation::RestoreTopology(Box::new(snapshot)));
        let result = self.sync_topology_change(&mut state, &mut rollback, token).await;
        self.finish(rollback, &mut state, result).await?;

        info!("Repartitioned enclave {}", self.enclave_id);
        self.publish_topology_changed("repartition");
        Ok(())
    }

    async fn set_connection(
        &self,
        a: PartitionId,
        b: PartitionId,
        connection: PartitionConnection,
        token: &CancellationToken,
    ) -> Result<(), NetworkError> {
        let mut state = self.lock().await?;
        self.require_partitioning("set connection")?;
        connection
            .validate()
            .map_err(topology_error("set_connection"))?;
        if a == b {
            return Err(NetworkError::Topology {
                operation: "set_connection",
                source: TopologyError::SelfConnection(a),
            });
        }

        let mut rollback = Rollback::new("set_connection");
        let result = async {
            for partition in [&a, &b] {
                if !state.topology.has_partition(partition) {
                    debug!(
                        "Partition '{}' of connection '{}'-'{}' does not exist yet; creating it",
                        partition, a, b
                    );
                    state
                        .topology
                        .create_empty_partition_with_default_connection(partition.clone())
                        .map_err(topology_error("set_connection"))?;
                    rollback.push(Compensation::RemovePartition(partition.clone()));
                }
            }

            let (was_default, previous) = state
                .topology
                .get_partition_connection(&a, &b)
                .map_err(topology_error("set_connection"))?;
            state
                .topology
                .set_connection(&a, &b, connection)
                .map_err(topology_error("set_connection"))?;
            rollback.push(Compensation::RestoreConnection {
                a: a.clone(),
                b: b.clone(),
                previous: (!was_default).then_some(previous),
            });

            self.sync_topology_change(&mut state, &mut rollback, token).await
        }
        .await;
        self.finish(rollback, &mut state, result).await?;

        info!("Set connection between '{}' and '{}' in enclave {}", a, b, self.enclave_id);
        self.publish_topology_changed("set_connection");
        Ok(())
    }

    async fn unset_connection(
        &self,
        a: PartitionId,
        b: PartitionId,
        token: &CancellationToken,
    ) -> Result<(), NetworkError> {
        let mut state = self.lock().await?;
        self.require_partitioning("unset connection")?;

        for partition in [&a, &b] {
            if !state.topology.has_partition(partition) {
                warn!(
                    "Partition '{}' of connection '{}'-'{}' does not exist; nothing to unset",
                    partition, a, b
                );
                return Ok(());
            }
        }
        let (was_default, previous) = state
            .topology
            .get_partition_connection(&a, &b)
            .map_err(topology_error("unset_connection"))?;
        if was_default {
            debug!(
                "Connection between '{}' and '{}' is already the default; nothing to do",
                a, b
            );
            return Ok(());
        }

        state
            .topology
            .unset_connection(&a, &b)
            .map_err(topology_error("unset_connection"))?;
        let mut rollback = Rollback::new("unset_connection");
        rollback.push(Compensation::RestoreConnection {
            a: a.clone(),
            b: b.clone(),
            previous: Some(previous),
        });
        let result = self.sync_topology_change(&mut state, &mut rollback, token).await;
        self.finish(rollback, &mut state, result).await?;

        info!("Unset connection between '{}' and '{}' in enclave {}", a, b, self.enclave_id);
        self.publish_topology_changed("unset_connection");
        Ok(())
    }

    async fn set_default_connection(
        &self,
        connection: PartitionConnection,
        token: &CancellationToken,
    ) -> Result<(), NetworkError> {
        let mut state = self.lock().await?;
        self.require_partitioning("set default connection")?;

        let previous = state
            .topology
            .set_default_connection(connection)
            .map_err(topology_error("set_default_connection"))?;
        let mut rollback = Rollback::new("set_default_connection");
        rollback.push(Compensation::RestoreDefaultConnection(previous));
        let result = self.sync_topology_change(&mut state, &mut rollback, token).await;
        self.finish(rollback, &mut state, result).await?;

        info!("Set default connection in enclave {}", self.enclave_id);
        self.publish_topology_changed("set_default_connection");
        Ok(())
    }

    async fn get_service(&self, identifier: &str) -> Result<Service, NetworkError> {
        let state = self.lock().await?;
        let name = state.registry.resolve(identifier)?;
        Self::started_service(&state, &name)
    }

    async fn get_service_registration(
        &self,
        identifier: &str,
    ) -> Result<ServiceRegistration, NetworkError> {
        let state = self.lock().await?;
        let name = state.registry.resolve(identifier)?;
        state
            .registry
            .registration(&name)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(identifier.to_string()).into())
    }

    async fn get_service_names(&self) -> BTreeSet<ServiceName> {
        let state = self.state.lock().await;
        state.registry.names().cloned().collect()
    }

    async fn get_ip_address_for_service(&self, identifier: &str) -> Option<IpAddr> {
        let state = self.state.lock().await;
        let name = state.registry.resolve(identifier).ok()?;
        state.registry.ip_of(&name)
    }

    async fn get_partition_of(&self, identifier: &str) -> Result<PartitionId, NetworkError> {
        let state = self.lock().await?;
        let name = state.registry.resolve(identifier)?;
        state
            .topology
            .partition_of(&name)
            .cloned()
            .ok_or_else(|| NetworkError::Topology {
                operation: "get_partition_of",
                source: TopologyError::ServiceNotFound(name),
            })
    }

    async fn topology_snapshot(&self) -> PartitionTopology {
        self.state.lock().await.topology.clone()
    }

    fn is_partitioning_enabled(&self) -> bool {
        self.partitioning_enabled
    }

    async fn destroy(&self) -> Result<BulkOutcome<()>, NetworkError> {
        let mut state = self.lock().await?;
        info!("Destroying service network of enclave {}", self.enclave_id);
        let mut outcome = BulkOutcome::new();

        let sidecars = std::mem::take(&mut state.sidecars);
        for (name, sidecar) in sidecars {
            if let Err(source) = self.sidecar_manager.remove(&self.enclave_id, &sidecar).await {
                outcome.failures.insert(
                    name.clone(),
                    NetworkError::Sidecar {
                        service: name,
                        step: "remove sidecar",
                        source,
                    },
                );
            }
        }

        let names: Vec<ServiceName> = state.registry.names().cloned().collect();
        for name in names {
            let Some((registration, service)) = state.registry.remove(&name) else {
                continue;
            };
            let mut result = Ok(());
            if service.is_some() {
                result = self
                    .backend
                    .destroy_service(&self.enclave_id, &registration.uuid)
                    .await;
            }
            if result.is_ok() {
                result = self
                    .backend
                    .unregister_service(&self.enclave_id, &registration.uuid)
                    .await;
            }
            match result {
                Ok(()) if !outcome.failures.contains_key(&name) => {
                    outcome.successes.insert(name, ());
                }
                Ok(()) => {}
                Err(source) => {
                    let error = NetworkError::Backend {
                        service: name.clone(),
                        step: "destroy service",
                        source,
                    };
                    // The sidecar failure recorded first is the one reported.
                    if let Some(first) = outcome.failures.get(&name) {
                        warn!(
                            "Service '{}' also failed after {}: {}",
                            name, first, error
                        );
                    } else {
                        outcome.failures.insert(name, error);
                    }
                }
            }
        }

        let default_connection = state.topology.get_default_connection();
        state.topology = PartitionTopology::new(default_connection);
        state.destroyed = true;

        if !outcome.is_complete_success() {
            warn!(
                "Enclave {} destroyed with {} failure(s); clean up leftover resources manually",
                self.enclave_id,
                outcome.failures.len()
            );
        }
        self.publish_topology_changed("destroy");
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::service::PortSpec;
    use crate::infrastructure::in_memory::{InMemoryContainerBackend, InMemorySidecarManager};

    type Fixture = (
        DefaultServiceNetwork,
        Arc<InMemoryContainerBackend>,
        Arc<InMemorySidecarManager>,
    );

    fn network(partitioning: bool) -> Fixture {
        let backend = Arc::new(InMemoryContainerBackend::new());
        let sidecars = Arc::new(InMemorySidecarManager::new());
        let network = DefaultServiceNetwork::new(
            EnclaveId::new("enclave-test"),
            partitioning,
            PartitionConnection::open(),
            backend.clone(),
            sidecars.clone(),
            Arc::new(EventBus::new(64)),
        )
        .unwrap();
        (network, backend, sidecars)
    }

    fn config() -> ServiceConfig {
        ServiceConfig::new("nginx:latest").with_private_port("http", PortSpec::tcp(80))
    }

    #[tokio::test]
    async fn test_start_without_partitioning_creates_no_sidecar() {
        let (network, backend, sidecars) = network(false);
        let token = CancellationToken::new();
        let service = network
            .start_service(ServiceName::new("web"), config(), &token)
            .await
            .unwrap();
        assert_eq!(service.status, ServiceStatus::Running);
        assert!(backend.is_running(service.uuid()));
        assert!(sidecars.live_sidecars().is_empty());
    }

    #[tokio::test]
    async fn test_partitioning_operations_require_partitioning() {
        let (network, _, _) = network(false);
        let token = CancellationToken::new();
        let err = network
            .set_default_connection(PartitionConnection::blocked(), &token)
            .await
            .unwrap_err();
        assert!(matches!(err, NetworkError::PartitioningDisabled { .. }));
        let err = network
            .unset_connection(PartitionId::new("a"), PartitionId::new("b"), &token)
            .await
            .unwrap_err();
        assert!(matches!(err, NetworkError::PartitioningDisabled { .. }));
    }

    #[tokio::test]
    async fn test_start_twice_is_rejected() {
        let (network, _, _) = network(false);
        let token = CancellationToken::new();
        network
            .start_service(ServiceName::new("web"), config(), &token)
            .await
            .unwrap();
        let err = network
            .start_service(ServiceName::new("web"), config(), &token)
            .await
            .unwrap_err();
        assert!(matches!(err, NetworkError::AlreadyStarted(_)));
    }

    #[tokio::test]
    async fn test_invalid_config_has_no_side_effects() {
        let (network, backend, _) = network(true);
        let token = CancellationToken::new();
        let mut bad = config().with_subnetwork(PartitionId::new("fresh"));
        bad.memory_allocation_megabytes = 2;
        let err = network
            .start_service(ServiceName::new("web"), bad, &token)
            .await
            .unwrap_err();
        assert!(matches!(err, NetworkError::InvalidServiceConfig { .. }));
        assert!(backend.calls().is_empty());
        assert!(!network.topology_snapshot().await.has_partition(&PartitionId::new("fresh")));
    }

    #[tokio::test]
    async fn test_pause_and_unpause_track_status() {
        let (network, backend, _) = network(false);
        let token = CancellationToken::new();
        let service = network
            .start_service(ServiceName::new("web"), config(), &token)
            .await
            .unwrap();

        network.pause_service("web", &token).await.unwrap();
        assert_eq!(network.get_service("web").await.unwrap().status, ServiceStatus::Paused);
        assert!(backend.is_paused(service.uuid()));

        network.unpause_service(service.uuid().as_str(), &token).await.unwrap();
        assert_eq!(network.get_service("web").await.unwrap().status, ServiceStatus::Running);
    }

    #[tokio::test]
    async fn test_status_change_rejects_stopped() {
        let (network, backend, _) = network(false);
        let token = CancellationToken::new();
        let service = network
            .start_service(ServiceName::new("web"), config(), &token)
            .await
            .unwrap();

        let err = network
            .set_status("web", ServiceStatus::Stopped, &token)
            .await
            .unwrap_err();
        assert!(matches!(err, NetworkError::InvalidStatusChange(ServiceStatus::Stopped)));
        assert!(backend.is_running(service.uuid()));
        assert_eq!(network.get_service("web").await.unwrap().status, ServiceStatus::Running);
    }

    #[tokio::test]
    async fn test_exec_requires_started_service() {
        let (network, _, _) = network(false);
        let token = CancellationToken::new();
        network
            .register_service(ServiceName::new("idle"), None, &token)
            .await
            .unwrap();
        let err = network
            .exec_command("idle", vec!["true".to_string()], &token)
            .await
            .unwrap_err();
        assert!(matches!(err, NetworkError::NotStarted(_)));
    }

    #[tokio::test]
    async fn test_http_probe_validates_method_and_port() {
        let (network, _, _) = network(false);
        let token = CancellationToken::new();
        network
            .start_service(ServiceName::new("web"), config(), &token)
            .await
            .unwrap();

        let mut request = HttpServiceRequest::get("http", "/health");
        request.method = "DELETE".to_string();
        let err = network
            .http_request_service("web", request, &token)
            .await
            .unwrap_err();
        assert!(matches!(err, NetworkError::UnsupportedHttpMethod(_)));

        let err = network
            .http_request_service("web", HttpServiceRequest::get("grpc", "/"), &token)
            .await
            .unwrap_err();
        assert!(matches!(err, NetworkError::PortNotFound { .. }));
    }

    #[test]
    fn test_empty_partition_means_default() {
        assert_eq!(
            normalize_partition(PartitionId::new("")),
            PartitionId::default_partition()
        );
        assert_eq!(normalize_partition(PartitionId::new("p1")), PartitionId::new("p1"));
    }
}
