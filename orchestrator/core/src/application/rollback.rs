// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Compensation stack for multi-step service network operations.
//!
//! Each forward step that changes engine or backend state pushes the action
//! that undoes it. If the operation fails, [`Rollback::unwind`] runs the
//! pending actions in reverse order of registration. A failing compensation
//! is logged and the unwind carries on with the rest; the original error is
//! what the caller sees.

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::application::service_network::NetworkState;
use crate::application::traffic_sync::{update_all_connections_from_topology, SyncScope};
use crate::domain::backend::{BackendError, ContainerBackend};
use crate::domain::partition_topology::{
    PartitionConnection, PartitionId, PartitionTopology, TopologyError,
};
use crate::domain::service::{EnclaveId, ServiceName, ServiceUuid};
use crate::domain::sidecar::{NetworkingSidecarManager, SidecarError};

#[derive(Debug, Clone)]
pub(crate) enum Compensation {
    RemovePartition(PartitionId),
    /// Used when other services may have joined the partition meanwhile.
    RemovePartitionIfEmpty(PartitionId),
    UnregisterService(ServiceUuid),
    DestroyService(ServiceUuid),
    ForgetRegistration(ServiceName),
    ClearStartedService(ServiceName),
    RemoveFromTopology(ServiceName),
    MoveService {
        service: ServiceName,
        partition: PartitionId,
    },
    RemoveSidecar(ServiceName),
    RestoreConnection {
        a: PartitionId,
        b: PartitionId,
        previous: Option<PartitionConnection>,
    },
    RestoreDefaultConnection(PartitionConnection),
    RestoreTopology(Box<PartitionTopology>),
    /// Pushes the full matrix again once the topology has been restored.
    ResyncTrafficControl,
}

#[derive(Debug, Error)]
enum CompensationError {
    #[error(transparent)]
    Topology(#[from] TopologyError),
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error(transparent)]
    Sidecar(#[from] SidecarError),
    #[error("{0}")]
    Resync(String),
}

/// Everything a compensation may need to touch.
pub(crate) struct CompensationContext<'a> {
    pub enclave_id: &'a EnclaveId,
    pub state: &'a mut NetworkState,
    pub backend: &'a dyn ContainerBackend,
    pub sidecar_manager: &'a dyn NetworkingSidecarManager,
}

pub(crate) struct Rollback {
    operation: &'static str,
    steps: Vec<Compensation>,
    finished: bool,
}

impl Rollback {
    pub fn new(operation: &'static str) -> Self {
        Self {
            operation,
            steps: Vec::new(),
            finished: false,
        }
    }

    pub fn push(&mut self, compensation: Compensation) {
        self.steps.push(compensation);
    }

    /// Registers a compensation that runs after every other one.
    pub fn push_final(&mut self, compensation: Compensation) {
        self.steps.insert(0, compensation);
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// The operation succeeded; nothing will be undone.
    pub fn commit(mut self) {
        self.steps.clear();
        self.finished = true;
    }

    pub async fn unwind(mut self, ctx: &mut CompensationContext<'_>) {
        self.finished = true;
        let steps = std::mem::take(&mut self.steps);
        if steps.is_empty() {
            return;
        }
        warn!(
            "Rolling back {} step(s) of failed {} in enclave {}",
            steps.len(),
            self.operation,
            ctx.enclave_id
        );
        for step in steps.into_iter().rev() {
            debug!("Applying compensation {:?}", step);
            if let Err(e) = apply(&step, ctx).await {
                metrics::counter!("aegis_enclave_compensations_failed_total").increment(1);
                error!(
                    "Compensation {:?} for failed {} in enclave {} could not be applied and \
                     must be cleaned up manually: {}",
                    step, self.operation, ctx.enclave_id, e
                );
            }
        }
    }
}

impl Drop for Rollback {
    fn drop(&mut self) {
        if !self.finished && !self.steps.is_empty() {
            error!(
                "Rollback for {} dropped with {} pending compensation(s) that were never applied",
                self.operation,
                self.steps.len()
            );
        }
    }
}

async fn apply(
    step: &Compensation,
    ctx: &mut CompensationContext<'_>,
) -> Result<(), CompensationError> {
    let state = &mut *ctx.state;
    match step {
        Compensation::RemovePartition(partition) => {
            state.topology.remove_partition(partition)?;
        }
        Compensation::RemovePartitionIfEmpty(partition) => {
            let empty = state
                .topology
                .partition_services(partition)
                .map(|services| services.is_empty())
                .unwrap_or(false);
            if empty {
                state.topology.remove_partition(partition)?;
            }
        }
        Compensation::UnregisterService(uuid) => {
            ctx.backend.unregister_service(ctx.enclave_id, uuid).await?;
        }
        Compensation::DestroyService(uuid) => {
            ctx.backend.destroy_service(ctx.enclave_id, uuid).await?;
        }
        Compensation::ForgetRegistration(name) => {
            state.registry.remove(name);
        }
        Compensation::ClearStartedService(name) => {
            state.registry.clear_started(name);
        }
        Compensation::RemoveFromTopology(name) => {
            state.topology.remove_service(name)?;
        }
        Compensation::MoveService { service, partition } => {
            state.topology.move_service_to_partition(service, partition)?;
        }
        Compensation::RemoveSidecar(name) => {
            if let Some(sidecar) = state.sidecars.remove(name) {
                ctx.sidecar_manager.remove(ctx.enclave_id, &sidecar).await?;
            }
        }
        Compensation::RestoreConnection { a, b, previous } => match previous {
            Some(connection) => {
                state.topology.set_connection(a, b, *connection)?;
            }
            None => {
                state.topology.unset_connection(a, b)?;
            }
        },
        Compensation::RestoreDefaultConnection(connection) => {
            state.topology.set_default_connection(*connection)?;
        }
        Compensation::RestoreTopology(snapshot) => {
            state.topology = (**snapshot).clone();
        }
        Compensation::ResyncTrafficControl => {
            // Compensations always run to completion.
            let token = CancellationToken::new();
            update_all_connections_from_topology(
                ctx.enclave_id,
                state,
                ctx.sidecar_manager,
                &SyncScope::All,
                &token,
            )
            .await
            .map_err(|e| CompensationError::Resync(e.to_string()))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::service::ServiceRegistration;
    use crate::infrastructure::in_memory::{InMemoryContainerBackend, InMemorySidecarManager};
    use std::net::{IpAddr, Ipv4Addr};

    fn state_with_service() -> NetworkState {
        let mut state = NetworkState::new(PartitionConnection::open());
        let name = ServiceName::new("web");
        state
            .registry
            .insert(ServiceRegistration::new(
                name.clone(),
                ServiceUuid::new("aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa"),
                IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)),
            ))
            .unwrap();
        state
            .topology
            .add_service(name, &PartitionId::default_partition())
            .unwrap();
        state
    }

    #[tokio::test]
    async fn test_unwind_runs_in_reverse_order() {
        let backend = InMemoryContainerBackend::new();
        let sidecars = InMemorySidecarManager::new();
        let enclave = EnclaveId::new("enclave-test");
        let mut state = state_with_service();

        let mut rollback = Rollback::new("test");
        // The partition can only be removed after the service left it.
        let partition = PartitionId::new("temp");
        state
            .topology
            .create_empty_partition_with_default_connection(partition.clone())
            .unwrap();
        rollback.push(Compensation::RemovePartition(partition.clone()));
        state
            .topology
            .move_service_to_partition(&ServiceName::new("web"), &partition)
            .unwrap();
        rollback.push(Compensation::MoveService {
            service: ServiceName::new("web"),
            partition: PartitionId::default_partition(),
        });
        assert_eq!(rollback.len(), 2);

        let mut ctx = CompensationContext {
            enclave_id: &enclave,
            state: &mut state,
            backend: &backend,
            sidecar_manager: &sidecars,
        };
        rollback.unwind(&mut ctx).await;

        assert!(!state.topology.has_partition(&partition));
        assert_eq!(
            state.topology.partition_of(&ServiceName::new("web")),
            Some(&PartitionId::default_partition())
        );
    }

    #[tokio::test]
    async fn test_failed_compensation_does_not_stop_unwind() {
        let backend = InMemoryContainerBackend::new();
        let sidecars = InMemorySidecarManager::new();
        let enclave = EnclaveId::new("enclave-test");
        let mut state = state_with_service();

        let mut rollback = Rollback::new("test");
        rollback.push(Compensation::ForgetRegistration(ServiceName::new("web")));
        // Unknown to the backend, so this one fails.
        rollback.push(Compensation::DestroyService(ServiceUuid::new("missing")));

        let mut ctx = CompensationContext {
            enclave_id: &enclave,
            state: &mut state,
            backend: &backend,
            sidecar_manager: &sidecars,
        };
        rollback.unwind(&mut ctx).await;

        assert!(!state.registry.contains(&ServiceName::new("web")));
    }

    #[test]
    fn test_commit_discards_steps() {
        let mut rollback = Rollback::new("test");
        rollback.push(Compensation::ResyncTrafficControl);
        rollback.commit();
    }
}
