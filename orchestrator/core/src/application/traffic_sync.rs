// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Pushes the connectivity matrix of the topology to the networking sidecars.
//!
//! Every call recomputes the full matrix and rebuilds each addressed
//! sidecar's rule set from scratch. Batches are dispatched concurrently; a
//! failing sidecar is recorded and does not stop dispatch to the others.

use std::collections::BTreeMap;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::application::service_network::{cancellable, NetworkError, NetworkState};
use crate::domain::service::{EnclaveId, ServiceName};
use crate::domain::sidecar::{
    CommandBatch, NetworkingSidecarManager, SidecarError, TrafficControlRules,
};

/// Which sidecars a synchronization addresses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncScope {
    All,
    AllExcept(ServiceName),
    Only(ServiceName),
}

impl SyncScope {
    fn includes(&self, service: &ServiceName) -> bool {
        match self {
            SyncScope::All => true,
            SyncScope::AllExcept(excluded) => excluded != service,
            SyncScope::Only(included) => included == service,
        }
    }
}

#[derive(Debug, Error)]
#[error("traffic control update failed for service(s) {:?}", .failures.keys().collect::<Vec<_>>())]
pub struct SyncError {
    pub failures: BTreeMap<ServiceName, SidecarError>,
}

impl SyncError {
    pub fn failed_services(&self) -> Vec<ServiceName> {
        self.failures.keys().cloned().collect()
    }
}

/// Translates one service's row of the matrix into per-IP rules. Peers
/// without a known IP are skipped.
fn rules_for(
    state: &NetworkState,
    service: &ServiceName,
    row: &BTreeMap<ServiceName, crate::domain::partition_topology::PartitionConnection>,
) -> TrafficControlRules {
    let mut rules = TrafficControlRules::new();
    for (peer, connection) in row {
        match state.registry.ip_of(peer) {
            Some(ip) => {
                rules.insert(ip, *connection);
            }
            None => warn!(
                "Service '{}' has a connection to '{}', which has no registered IP; skipping",
                service, peer
            ),
        }
    }
    rules
}

pub(crate) async fn update_all_connections_from_topology(
    enclave_id: &EnclaveId,
    state: &mut NetworkState,
    manager: &dyn NetworkingSidecarManager,
    scope: &SyncScope,
    token: &CancellationToken,
) -> Result<(), NetworkError> {
    let matrix = state
        .topology
        .get_service_packet_loss_configurations_by_service_name();

    let mut failures: BTreeMap<ServiceName, SidecarError> = BTreeMap::new();
    let mut batches = Vec::new();
    let mut pending_rules: BTreeMap<ServiceName, TrafficControlRules> = BTreeMap::new();

    for (service, row) in &matrix {
        if !scope.includes(service) {
            continue;
        }
        let Some(sidecar) = state.sidecars.get(service) else {
            debug!("Service '{}' has no networking sidecar; skipping", service);
            continue;
        };
        let rules = rules_for(state, service, row);
        match sidecar.update_commands(&rules) {
            Ok(commands) => {
                batches.push(CommandBatch {
                    sidecar: sidecar.clone(),
                    commands,
                });
                pending_rules.insert(service.clone(), rules);
            }
            Err(e) => {
                failures.insert(service.clone(), e);
            }
        }
    }

    if !batches.is_empty() {
        debug!(
            "Dispatching traffic control updates to {} sidecar(s) in enclave {}",
            batches.len(),
            enclave_id
        );
        let results = cancellable(
            token,
            "traffic control dispatch",
            manager.run_batches(enclave_id, &batches),
        )
        .await?;

        for (service, result) in results {
            match result {
                Ok(()) => {
                    if let (Some(sidecar), Some(rules)) = (
                        state.sidecars.get_mut(&service),
                        pending_rules.remove(&service),
                    ) {
                        sidecar.record_applied(rules);
                    }
                }
                Err(e) => {
                    failures.insert(service, e);
                }
            }
        }
        metrics::counter!("aegis_enclave_traffic_control_batches_total")
            .increment(batches.len() as u64);
    }

    if failures.is_empty() {
        Ok(())
    } else {
        metrics::counter!("aegis_enclave_traffic_control_failures_total")
            .increment(failures.len() as u64);
        Err(NetworkError::TrafficControlSync(SyncError { failures }))
    }
}
