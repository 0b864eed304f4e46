// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

use crate::domain::partition_topology::PartitionId;
use crate::domain::service::{EnclaveId, ServiceName, ServiceUuid};

/// Lifecycle milestones of a service network.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NetworkEvent {
    ServiceRegistered {
        enclave_id: EnclaveId,
        service_name: ServiceName,
        service_uuid: ServiceUuid,
        private_ip: IpAddr,
        partition: PartitionId,
        registered_at: DateTime<Utc>,
    },
    ServiceStarted {
        enclave_id: EnclaveId,
        service_name: ServiceName,
        service_uuid: ServiceUuid,
        container_id: String,
        started_at: DateTime<Utc>,
    },
    ServiceRemoved {
        enclave_id: EnclaveId,
        service_name: ServiceName,
        service_uuid: ServiceUuid,
        removed_at: DateTime<Utc>,
    },
    ServiceMoved {
        enclave_id: EnclaveId,
        service_name: ServiceName,
        from: PartitionId,
        to: PartitionId,
        moved_at: DateTime<Utc>,
    },
    /// Emitted after a topology mutation has been pushed to every sidecar.
    TopologyChanged {
        enclave_id: EnclaveId,
        operation: String,
        changed_at: DateTime<Utc>,
    },
    TrafficControlSyncFailed {
        enclave_id: EnclaveId,
        failed_services: Vec<ServiceName>,
        failed_at: DateTime<Utc>,
    },
}

impl NetworkEvent {
    /// Services an event concerns; empty for enclave-wide events.
    pub fn service_names(&self) -> Vec<&ServiceName> {
        match self {
            NetworkEvent::ServiceRegistered { service_name, .. }
            | NetworkEvent::ServiceStarted { service_name, .. }
            | NetworkEvent::ServiceRemoved { service_name, .. }
            | NetworkEvent::ServiceMoved { service_name, .. } => vec![service_name],
            NetworkEvent::TrafficControlSyncFailed { failed_services, .. } => {
                failed_services.iter().collect()
            }
            NetworkEvent::TopologyChanged { .. } => Vec::new(),
        }
    }

    pub fn enclave_id(&self) -> &EnclaveId {
        match self {
            NetworkEvent::ServiceRegistered { enclave_id, .. }
            | NetworkEvent::ServiceStarted { enclave_id, .. }
            | NetworkEvent::ServiceRemoved { enclave_id, .. }
            | NetworkEvent::ServiceMoved { enclave_id, .. }
            | NetworkEvent::TopologyChanged { enclave_id, .. }
            | NetworkEvent::TrafficControlSyncFailed { enclave_id, .. } => enclave_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_events_serialize_with_type_tag() {
        let event = NetworkEvent::ServiceMoved {
            enclave_id: EnclaveId::new("enclave-1"),
            service_name: ServiceName::new("api"),
            from: PartitionId::default_partition(),
            to: PartitionId::new("isolated"),
            moved_at: Utc::now(),
        };

        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "service_moved");
        assert_eq!(value["service_name"], "api");
        assert_eq!(value["to"], "isolated");

        let decoded: NetworkEvent = serde_json::from_value(value).unwrap();
        assert_eq!(decoded.enclave_id().as_str(), "enclave-1");
        assert_eq!(decoded.service_names(), vec![&ServiceName::new("api")]);
    }

    #[test]
    fn test_enclave_wide_events_name_no_service() {
        let event = NetworkEvent::TopologyChanged {
            enclave_id: EnclaveId::new("enclave-1"),
            operation: "repartition".to_string(),
            changed_at: Utc::now(),
        };
        assert!(event.service_names().is_empty());
    }
}
