// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Partition Topology
//!
//! Pure in-memory graph of partitions, service membership and pairwise
//! partition connections. No I/O happens here; the service network owns one
//! instance per enclave and derives every sidecar configuration from it.
//!
//! ## Invariants
//!
//! - The default partition always exists and cannot be removed.
//! - Every service belongs to exactly one partition; `partition_services` and
//!   `service_partitions` are always updated together.
//! - Every partition referenced by a connection override exists.
//! - Services sharing a partition are always fully connected, whatever the
//!   override table says.
//!
//! ## Connectivity resolution
//!
//! ```text
//!   same partition            -> open
//!   explicit override (A, B)  -> override
//!   otherwise                 -> default connection
//! ```

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use thiserror::Error;

use crate::domain::service::ServiceName;

pub const DEFAULT_PARTITION_ID: &str = "default";

/// Packet loss value that represents a fully blocked connection.
pub const BLOCKED_PACKET_LOSS_PERCENTAGE: f32 = 100.0;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum TopologyError {
    #[error("partition id cannot be empty")]
    EmptyPartitionId,
    #[error("partition '{0}' already exists")]
    PartitionAlreadyExists(PartitionId),
    #[error("partition '{0}' does not exist")]
    PartitionNotFound(PartitionId),
    #[error("partition '{partition}' still hosts {services} service(s)")]
    PartitionNotEmpty { partition: PartitionId, services: usize },
    #[error("the default partition '{0}' cannot be removed")]
    CannotRemoveDefaultPartition(PartitionId),
    #[error("service '{service}' is already assigned to partition '{partition}'")]
    ServiceAlreadyAssigned {
        service: ServiceName,
        partition: PartitionId,
    },
    #[error("service '{0}' is not part of the topology")]
    ServiceNotFound(ServiceName),
    #[error("a connection cannot be defined between partition '{0}' and itself")]
    SelfConnection(PartitionId),
    #[error("packet loss percentage {0} must be a number between 0 and 100")]
    InvalidPacketLoss(f32),
    #[error("packet delay correlation {0} must be a number between 0 and 100")]
    InvalidDelayCorrelation(f32),
    #[error("connection between '{first}' and '{second}' is defined more than once")]
    DuplicateConnection {
        first: PartitionId,
        second: PartitionId,
    },
    #[error("service '{service}' is assigned to both '{first}' and '{second}'")]
    ServiceInMultiplePartitions {
        service: ServiceName,
        first: PartitionId,
        second: PartitionId,
    },
    #[error(
        "repartition must reassign exactly the registered services (missing: {missing:?}, unknown: {unknown:?})"
    )]
    RepartitionServiceMismatch {
        missing: Vec<ServiceName>,
        unknown: Vec<ServiceName>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PartitionId(pub String);

impl PartitionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn default_partition() -> Self {
        Self(DEFAULT_PARTITION_ID.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_default(&self) -> bool {
        self.0 == DEFAULT_PARTITION_ID
    }

    pub fn validate(&self) -> Result<(), TopologyError> {
        if self.0.trim().is_empty() {
            return Err(TopologyError::EmptyPartitionId);
        }
        Ok(())
    }
}

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PartitionId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Unordered pair of partitions, stored in lexicographic order so that
/// `(A, B)` and `(B, A)` are the same key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PartitionConnectionId {
    first: PartitionId,
    second: PartitionId,
}

impl PartitionConnectionId {
    pub fn new(a: PartitionId, b: PartitionId) -> Self {
        if a <= b {
            Self { first: a, second: b }
        } else {
            Self { first: b, second: a }
        }
    }

    pub fn first(&self) -> &PartitionId {
        &self.first
    }

    pub fn second(&self) -> &PartitionId {
        &self.second
    }

    pub fn involves(&self, partition: &PartitionId) -> bool {
        &self.first == partition || &self.second == partition
    }
}

impl fmt::Display for PartitionConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}<->{}", self.first, self.second)
    }
}

/// Latency added on top of packet loss, realized with `tc netem delay`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PacketDelay {
    pub delay_ms: u32,
    #[serde(default)]
    pub jitter_ms: u32,
    #[serde(default)]
    pub correlation_percentage: f32,
}

impl PacketDelay {
    pub fn new(delay_ms: u32) -> Self {
        Self {
            delay_ms,
            jitter_ms: 0,
            correlation_percentage: 0.0,
        }
    }

    pub fn with_jitter(mut self, jitter_ms: u32, correlation_percentage: f32) -> Self {
        self.jitter_ms = jitter_ms;
        self.correlation_percentage = correlation_percentage;
        self
    }

    pub fn validate(&self) -> Result<(), TopologyError> {
        if !is_percentage(self.correlation_percentage) {
            return Err(TopologyError::InvalidDelayCorrelation(
                self.correlation_percentage,
            ));
        }
        Ok(())
    }
}

/// Connectivity between two partitions.
///
/// Packet loss is a strength between 0 (fully open) and 100 (fully blocked).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PartitionConnection {
    pub packet_loss_percentage: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub packet_delay: Option<PacketDelay>,
}

impl PartitionConnection {
    pub fn open() -> Self {
        Self {
            packet_loss_percentage: 0.0,
            packet_delay: None,
        }
    }

    pub fn blocked() -> Self {
        Self {
            packet_loss_percentage: BLOCKED_PACKET_LOSS_PERCENTAGE,
            packet_delay: None,
        }
    }

    pub fn with_packet_loss(percentage: f32) -> Result<Self, TopologyError> {
        let connection = Self {
            packet_loss_percentage: percentage,
            packet_delay: None,
        };
        connection.validate()?;
        Ok(connection)
    }

    pub fn with_delay(mut self, delay: PacketDelay) -> Self {
        self.packet_delay = Some(delay);
        self
    }

    pub fn is_open(&self) -> bool {
        self.packet_loss_percentage == 0.0 && self.packet_delay.is_none()
    }

    pub fn is_blocked(&self) -> bool {
        self.packet_loss_percentage >= BLOCKED_PACKET_LOSS_PERCENTAGE
    }

    pub fn validate(&self) -> Result<(), TopologyError> {
        if !is_percentage(self.packet_loss_percentage) {
            return Err(TopologyError::InvalidPacketLoss(self.packet_loss_percentage));
        }
        if let Some(delay) = &self.packet_delay {
            delay.validate()?;
        }
        Ok(())
    }
}

impl Default for PartitionConnection {
    fn default() -> Self {
        Self::open()
    }
}

fn is_percentage(value: f32) -> bool {
    value.is_finite() && (0.0..=100.0).contains(&value)
}

/// Full per-service connectivity matrix: `source -> (peer -> connection)`.
pub type ConnectivityMatrix = BTreeMap<ServiceName, BTreeMap<ServiceName, PartitionConnection>>;

/// Builds an override table from a list of partition pairs, rejecting the same
/// unordered pair given twice.
pub fn connections_from_pairs(
    pairs: impl IntoIterator<Item = (PartitionId, PartitionId, PartitionConnection)>,
) -> Result<BTreeMap<PartitionConnectionId, PartitionConnection>, TopologyError> {
    let mut connections = BTreeMap::new();
    for (a, b, connection) in pairs {
        let id = PartitionConnectionId::new(a, b);
        if connections.contains_key(&id) {
            return Err(TopologyError::DuplicateConnection {
                first: id.first.clone(),
                second: id.second.clone(),
            });
        }
        connections.insert(id, connection);
    }
    Ok(connections)
}

#[derive(Debug, Clone, PartialEq)]
pub struct PartitionTopology {
    default_partition: PartitionId,
    partition_services: BTreeMap<PartitionId, BTreeSet<ServiceName>>,
    service_partitions: BTreeMap<ServiceName, PartitionId>,
    partition_connections: BTreeMap<PartitionConnectionId, PartitionConnection>,
    default_connection: PartitionConnection,
}

impl PartitionTopology {
    pub fn new(default_connection: PartitionConnection) -> Self {
        let default_partition = PartitionId::default_partition();
        let mut partition_services = BTreeMap::new();
        partition_services.insert(default_partition.clone(), BTreeSet::new());
        Self {
            default_partition,
            partition_services,
            service_partitions: BTreeMap::new(),
            partition_connections: BTreeMap::new(),
            default_connection,
        }
    }

    pub fn default_partition(&self) -> &PartitionId {
        &self.default_partition
    }

    pub fn has_partition(&self, id: &PartitionId) -> bool {
        self.partition_services.contains_key(id)
    }

    pub fn partition_ids(&self) -> impl Iterator<Item = &PartitionId> {
        self.partition_services.keys()
    }

    pub fn partition_services(&self, id: &PartitionId) -> Option<&BTreeSet<ServiceName>> {
        self.partition_services.get(id)
    }

    pub fn partition_of(&self, service: &ServiceName) -> Option<&PartitionId> {
        self.service_partitions.get(service)
    }

    pub fn contains_service(&self, service: &ServiceName) -> bool {
        self.service_partitions.contains_key(service)
    }

    pub fn service_names(&self) -> impl Iterator<Item = &ServiceName> {
        self.service_partitions.keys()
    }

    pub fn connection_overrides(&self) -> &BTreeMap<PartitionConnectionId, PartitionConnection> {
        &self.partition_connections
    }

    pub fn create_empty_partition_with_default_connection(
        &mut self,
        id: PartitionId,
    ) -> Result<(), TopologyError> {
        id.validate()?;
        if self.has_partition(&id) {
            return Err(TopologyError::PartitionAlreadyExists(id));
        }
        self.partition_services.insert(id, BTreeSet::new());
        Ok(())
    }

    /// Removes an empty, non-default partition along with any overrides that
    /// reference it.
    pub fn remove_partition(&mut self, id: &PartitionId) -> Result<(), TopologyError> {
        if id == &self.default_partition {
            return Err(TopologyError::CannotRemoveDefaultPartition(id.clone()));
        }
        let services = self
            .partition_services
            .get(id)
            .ok_or_else(|| TopologyError::PartitionNotFound(id.clone()))?;
        if !services.is_empty() {
            return Err(TopologyError::PartitionNotEmpty {
                partition: id.clone(),
                services: services.len(),
            });
        }
        self.partition_services.remove(id);
        self.partition_connections
            .retain(|connection_id, _| !connection_id.involves(id));
        Ok(())
    }

    pub fn add_service(
        &mut self,
        service: ServiceName,
        partition: &PartitionId,
    ) -> Result<(), TopologyError> {
        if let Some(existing) = self.service_partitions.get(&service) {
            return Err(TopologyError::ServiceAlreadyAssigned {
                service,
                partition: existing.clone(),
            });
        }
        let members = self
            .partition_services
            .get_mut(partition)
            .ok_or_else(|| TopologyError::PartitionNotFound(partition.clone()))?;
        members.insert(service.clone());
        self.service_partitions.insert(service, partition.clone());
        Ok(())
    }

    /// Returns the partition the service was removed from.
    pub fn remove_service(&mut self, service: &ServiceName) -> Result<PartitionId, TopologyError> {
        let partition = self
            .service_partitions
            .remove(service)
            .ok_or_else(|| TopologyError::ServiceNotFound(service.clone()))?;
        if let Some(members) = self.partition_services.get_mut(&partition) {
            members.remove(service);
        }
        Ok(partition)
    }

    /// Moves a service between partitions, returning the partition it left.
    /// Both lookups are checked before anything is mutated.
    pub fn move_service_to_partition(
        &mut self,
        service: &ServiceName,
        new_partition: &PartitionId,
    ) -> Result<PartitionId, TopologyError> {
        let previous = self
            .service_partitions
            .get(service)
            .cloned()
            .ok_or_else(|| TopologyError::ServiceNotFound(service.clone()))?;
        if !self.has_partition(new_partition) {
            return Err(TopologyError::PartitionNotFound(new_partition.clone()));
        }
        if &previous == new_partition {
            return Ok(previous);
        }
        if let Some(members) = self.partition_services.get_mut(&previous) {
            members.remove(service);
        }
        if let Some(members) = self.partition_services.get_mut(new_partition) {
            members.insert(service.clone());
        }
        self.service_partitions
            .insert(service.clone(), new_partition.clone());
        Ok(previous)
    }

    /// Installs an override, returning the override it replaced (if any).
    pub fn set_connection(
        &mut self,
        a: &PartitionId,
        b: &PartitionId,
        connection: PartitionConnection,
    ) -> Result<Option<PartitionConnection>, TopologyError> {
        connection.validate()?;
        let id = self.checked_connection_id(a, b)?;
        Ok(self.partition_connections.insert(id, connection))
    }

    /// Reverts a pair to the default connection, returning the removed override.
    pub fn unset_connection(
        &mut self,
        a: &PartitionId,
        b: &PartitionId,
    ) -> Result<Option<PartitionConnection>, TopologyError> {
        let id = self.checked_connection_id(a, b)?;
        Ok(self.partition_connections.remove(&id))
    }

    pub fn set_default_connection(
        &mut self,
        connection: PartitionConnection,
    ) -> Result<PartitionConnection, TopologyError> {
        connection.validate()?;
        Ok(std::mem::replace(&mut self.default_connection, connection))
    }

    pub fn get_default_connection(&self) -> PartitionConnection {
        self.default_connection
    }

    /// Effective connection between two partitions and whether it comes from
    /// the default connection rather than an explicit override.
    ///
    /// A partition is always open towards itself; that case is not reported
    /// as default.
    pub fn get_partition_connection(
        &self,
        a: &PartitionId,
        b: &PartitionId,
    ) -> Result<(bool, PartitionConnection), TopologyError> {
        for partition in [a, b] {
            if !self.has_partition(partition) {
                return Err(TopologyError::PartitionNotFound(partition.clone()));
            }
        }
        Ok(self.resolve_connection(a, b))
    }

    /// Replaces membership, overrides and default connection wholesale.
    ///
    /// The new membership must assign every currently known service exactly
    /// once and no other service. The default partition is added empty when
    /// absent. On any validation failure the topology is left untouched.
    pub fn repartition(
        &mut self,
        new_membership: BTreeMap<PartitionId, BTreeSet<ServiceName>>,
        new_connections: BTreeMap<PartitionConnectionId, PartitionConnection>,
        new_default_connection: PartitionConnection,
    ) -> Result<(), TopologyError> {
        new_default_connection.validate()?;

        let mut partition_services = new_membership;
        partition_services
            .entry(self.default_partition.clone())
            .or_default();

        let mut service_partitions: BTreeMap<ServiceName, PartitionId> = BTreeMap::new();
        for (partition, services) in &partition_services {
            partition.validate()?;
            for service in services {
                if let Some(first) = service_partitions.insert(service.clone(), partition.clone()) {
                    return Err(TopologyError::ServiceInMultiplePartitions {
                        service: service.clone(),
                        first,
                        second: partition.clone(),
                    });
                }
            }
        }

        let missing: Vec<ServiceName> = self
            .service_partitions
            .keys()
            .filter(|service| !service_partitions.contains_key(*service))
            .cloned()
            .collect();
        let unknown: Vec<ServiceName> = service_partitions
            .keys()
            .filter(|service| !self.service_partitions.contains_key(*service))
            .cloned()
            .collect();
        if !missing.is_empty() || !unknown.is_empty() {
            return Err(TopologyError::RepartitionServiceMismatch { missing, unknown });
        }

        for (id, connection) in &new_connections {
            if id.first == id.second {
                return Err(TopologyError::SelfConnection(id.first.clone()));
            }
            for partition in [&id.first, &id.second] {
                if !partition_services.contains_key(partition) {
                    return Err(TopologyError::PartitionNotFound(partition.clone()));
                }
            }
            connection.validate()?;
        }

        self.partition_services = partition_services;
        self.service_partitions = service_partitions;
        self.partition_connections = new_connections;
        self.default_connection = new_default_connection;
        Ok(())
    }

    /// Resolves the connection from every service to every other service.
    ///
    /// Every known service gets a row, including services with no peers.
    pub fn get_service_packet_loss_configurations_by_service_name(&self) -> ConnectivityMatrix {
        let mut matrix = ConnectivityMatrix::new();
        for (source, source_partition) in &self.service_partitions {
            let row = self
                .service_partitions
                .iter()
                .filter(|(target, _)| *target != source)
                .map(|(target, target_partition)| {
                    let (_, connection) =
                        self.resolve_connection(source_partition, target_partition);
                    (target.clone(), connection)
                })
                .collect();
            matrix.insert(source.clone(), row);
        }
        matrix
    }

    fn resolve_connection(&self, a: &PartitionId, b: &PartitionId) -> (bool, PartitionConnection) {
        if a == b {
            return (false, PartitionConnection::open());
        }
        let id = PartitionConnectionId::new(a.clone(), b.clone());
        match self.partition_connections.get(&id) {
            Some(connection) => (false, *connection),
            None => (true, self.default_connection),
        }
    }

    fn checked_connection_id(
        &self,
        a: &PartitionId,
        b: &PartitionId,
    ) -> Result<PartitionConnectionId, TopologyError> {
        if a == b {
            return Err(TopologyError::SelfConnection(a.clone()));
        }
        for partition in [a, b] {
            if !self.has_partition(partition) {
                return Err(TopologyError::PartitionNotFound(partition.clone()));
            }
        }
        Ok(PartitionConnectionId::new(a.clone(), b.clone()))
    }
}

impl Default for PartitionTopology {
    fn default() -> Self {
        Self::new(PartitionConnection::open())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name(s: &str) -> ServiceName {
        ServiceName::new(s)
    }

    fn pid(s: &str) -> PartitionId {
        PartitionId::new(s)
    }

    /// P1 = {A, B}, P2 = {C}
    fn two_partition_topology() -> PartitionTopology {
        let mut topology = PartitionTopology::default();
        topology
            .create_empty_partition_with_default_connection(pid("P1"))
            .unwrap();
        topology
            .create_empty_partition_with_default_connection(pid("P2"))
            .unwrap();
        topology.add_service(name("A"), &pid("P1")).unwrap();
        topology.add_service(name("B"), &pid("P1")).unwrap();
        topology.add_service(name("C"), &pid("P2")).unwrap();
        topology
    }

    fn assert_membership_is_partition(topology: &PartitionTopology) {
        let mut union = BTreeSet::new();
        for id in topology.partition_ids() {
            for service in topology.partition_services(id).unwrap() {
                assert!(union.insert(service.clone()), "{service} listed twice");
                assert_eq!(topology.partition_of(service), Some(id));
            }
        }
        let registered: BTreeSet<ServiceName> = topology.service_names().cloned().collect();
        assert_eq!(union, registered);
    }

    #[test]
    fn test_default_partition_always_exists() {
        let mut topology = PartitionTopology::default();
        assert!(topology.has_partition(&PartitionId::default_partition()));
        assert_eq!(
            topology.remove_partition(&PartitionId::default_partition()),
            Err(TopologyError::CannotRemoveDefaultPartition(
                PartitionId::default_partition()
            ))
        );
    }

    #[test]
    fn test_create_existing_partition_fails() {
        let mut topology = two_partition_topology();
        assert_eq!(
            topology.create_empty_partition_with_default_connection(pid("P1")),
            Err(TopologyError::PartitionAlreadyExists(pid("P1")))
        );
        assert_eq!(
            topology.create_empty_partition_with_default_connection(pid("  ")),
            Err(TopologyError::EmptyPartitionId)
        );
    }

    #[test]
    fn test_remove_non_empty_partition_fails() {
        let mut topology = two_partition_topology();
        assert!(matches!(
            topology.remove_partition(&pid("P2")),
            Err(TopologyError::PartitionNotEmpty { services: 1, .. })
        ));
        topology.remove_service(&name("C")).unwrap();
        topology.remove_partition(&pid("P2")).unwrap();
        assert!(!topology.has_partition(&pid("P2")));
    }

    #[test]
    fn test_remove_partition_drops_its_overrides() {
        let mut topology = two_partition_topology();
        topology
            .create_empty_partition_with_default_connection(pid("P3"))
            .unwrap();
        topology
            .set_connection(&pid("P1"), &pid("P3"), PartitionConnection::blocked())
            .unwrap();
        topology.remove_partition(&pid("P3")).unwrap();
        assert!(topology.connection_overrides().is_empty());
    }

    #[test]
    fn test_add_service_to_missing_partition_fails() {
        let mut topology = PartitionTopology::default();
        assert_eq!(
            topology.add_service(name("A"), &pid("nowhere")),
            Err(TopologyError::PartitionNotFound(pid("nowhere")))
        );
        assert!(!topology.contains_service(&name("A")));
    }

    #[test]
    fn test_add_service_twice_fails() {
        let mut topology = two_partition_topology();
        assert!(matches!(
            topology.add_service(name("A"), &pid("P2")),
            Err(TopologyError::ServiceAlreadyAssigned { .. })
        ));
        assert_eq!(topology.partition_of(&name("A")), Some(&pid("P1")));
    }

    #[test]
    fn test_remove_unknown_service_fails() {
        let mut topology = PartitionTopology::default();
        assert_eq!(
            topology.remove_service(&name("ghost")),
            Err(TopologyError::ServiceNotFound(name("ghost")))
        );
    }

    #[test]
    fn test_move_service_updates_both_indices() {
        let mut topology = two_partition_topology();
        let previous = topology
            .move_service_to_partition(&name("A"), &pid("P2"))
            .unwrap();
        assert_eq!(previous, pid("P1"));
        assert_eq!(topology.partition_of(&name("A")), Some(&pid("P2")));
        assert!(!topology.partition_services(&pid("P1")).unwrap().contains(&name("A")));
        assert_membership_is_partition(&topology);
    }

    #[test]
    fn test_move_to_missing_partition_leaves_service_in_place() {
        let mut topology = two_partition_topology();
        assert!(topology
            .move_service_to_partition(&name("A"), &pid("P9"))
            .is_err());
        assert_eq!(topology.partition_of(&name("A")), Some(&pid("P1")));
        assert_membership_is_partition(&topology);
    }

    #[test]
    fn test_connection_symmetry() {
        let mut topology = two_partition_topology();
        topology
            .set_connection(
                &pid("P2"),
                &pid("P1"),
                PartitionConnection::with_packet_loss(40.0).unwrap(),
            )
            .unwrap();
        assert_eq!(
            topology.get_partition_connection(&pid("P1"), &pid("P2")).unwrap(),
            topology.get_partition_connection(&pid("P2"), &pid("P1")).unwrap()
        );
    }

    #[test]
    fn test_override_precedence() {
        let mut topology = two_partition_topology();
        let default = PartitionConnection::with_packet_loss(10.0).unwrap();
        topology.set_default_connection(default).unwrap();

        topology
            .set_connection(&pid("P1"), &pid("P2"), PartitionConnection::blocked())
            .unwrap();
        assert_eq!(
            topology.get_partition_connection(&pid("P1"), &pid("P2")).unwrap(),
            (false, PartitionConnection::blocked())
        );

        let removed = topology.unset_connection(&pid("P2"), &pid("P1")).unwrap();
        assert_eq!(removed, Some(PartitionConnection::blocked()));
        assert_eq!(
            topology.get_partition_connection(&pid("P1"), &pid("P2")).unwrap(),
            (true, default)
        );
    }

    #[test]
    fn test_empty_partitions_use_default_connection() {
        let mut topology = PartitionTopology::new(PartitionConnection::blocked());
        topology
            .create_empty_partition_with_default_connection(pid("X"))
            .unwrap();
        assert_eq!(
            topology
                .get_partition_connection(&pid("X"), &PartitionId::default_partition())
                .unwrap(),
            (true, PartitionConnection::blocked())
        );
    }

    #[test]
    fn test_set_connection_validation() {
        let mut topology = two_partition_topology();
        assert_eq!(
            topology.set_connection(&pid("P1"), &pid("P1"), PartitionConnection::blocked()),
            Err(TopologyError::SelfConnection(pid("P1")))
        );
        assert_eq!(
            topology.set_connection(&pid("P1"), &pid("P9"), PartitionConnection::blocked()),
            Err(TopologyError::PartitionNotFound(pid("P9")))
        );
        let invalid = PartitionConnection {
            packet_loss_percentage: 120.0,
            packet_delay: None,
        };
        assert_eq!(
            topology.set_connection(&pid("P1"), &pid("P2"), invalid),
            Err(TopologyError::InvalidPacketLoss(120.0))
        );
        assert!(PartitionConnection::with_packet_loss(f32::NAN).is_err());
        assert!(topology.connection_overrides().is_empty());
    }

    #[test]
    fn test_blocked_matrix_between_two_partitions() {
        let mut topology = two_partition_topology();
        topology
            .set_connection(&pid("P1"), &pid("P2"), PartitionConnection::blocked())
            .unwrap();

        let matrix = topology.get_service_packet_loss_configurations_by_service_name();
        assert!(matrix[&name("A")][&name("C")].is_blocked());
        assert!(matrix[&name("B")][&name("C")].is_blocked());
        assert!(matrix[&name("C")][&name("A")].is_blocked());
        assert!(matrix[&name("C")][&name("B")].is_blocked());
        assert!(matrix[&name("A")][&name("B")].is_open());
        assert!(matrix[&name("B")][&name("A")].is_open());
        assert!(!matrix[&name("A")].contains_key(&name("A")));
    }

    #[test]
    fn test_same_partition_is_open_even_with_blocking_default() {
        let mut topology = PartitionTopology::new(PartitionConnection::blocked());
        topology
            .add_service(name("A"), &PartitionId::default_partition())
            .unwrap();
        topology
            .add_service(name("B"), &PartitionId::default_partition())
            .unwrap();
        let matrix = topology.get_service_packet_loss_configurations_by_service_name();
        assert!(matrix[&name("A")][&name("B")].is_open());
    }

    #[test]
    fn test_lone_service_has_empty_row() {
        let mut topology = PartitionTopology::default();
        topology
            .add_service(name("solo"), &PartitionId::default_partition())
            .unwrap();
        let matrix = topology.get_service_packet_loss_configurations_by_service_name();
        assert_eq!(matrix.len(), 1);
        assert!(matrix[&name("solo")].is_empty());
    }

    #[test]
    fn test_repartition_replaces_everything() {
        let mut topology = two_partition_topology();
        let mut membership = BTreeMap::new();
        membership.insert(pid("east"), BTreeSet::from([name("A")]));
        membership.insert(pid("west"), BTreeSet::from([name("B"), name("C")]));
        let connections = connections_from_pairs([(
            pid("west"),
            pid("east"),
            PartitionConnection::blocked(),
        )])
        .unwrap();

        topology
            .repartition(membership, connections, PartitionConnection::open())
            .unwrap();

        assert!(!topology.has_partition(&pid("P1")));
        assert!(topology.has_partition(&PartitionId::default_partition()));
        assert_eq!(topology.partition_of(&name("C")), Some(&pid("west")));
        let matrix = topology.get_service_packet_loss_configurations_by_service_name();
        assert!(matrix[&name("A")][&name("B")].is_blocked());
        assert!(matrix[&name("B")][&name("C")].is_open());
        assert_membership_is_partition(&topology);
    }

    #[test]
    fn test_repartition_rejects_unknown_service_and_keeps_topology() {
        let mut topology = two_partition_topology();
        let before = topology.clone();
        let mut membership = BTreeMap::new();
        membership.insert(pid("P1"), BTreeSet::from([name("A"), name("B"), name("C")]));
        membership.insert(pid("P2"), BTreeSet::from([name("D")]));

        let err = topology
            .repartition(membership, BTreeMap::new(), PartitionConnection::open())
            .unwrap_err();
        assert_eq!(
            err,
            TopologyError::RepartitionServiceMismatch {
                missing: vec![],
                unknown: vec![name("D")],
            }
        );
        assert_eq!(topology, before);
    }

    #[test]
    fn test_repartition_rejects_missing_and_duplicate_services() {
        let mut topology = two_partition_topology();
        let before = topology.clone();

        let mut missing = BTreeMap::new();
        missing.insert(pid("P1"), BTreeSet::from([name("A")]));
        assert!(matches!(
            topology.repartition(missing, BTreeMap::new(), PartitionConnection::open()),
            Err(TopologyError::RepartitionServiceMismatch { .. })
        ));

        let mut duplicate = BTreeMap::new();
        duplicate.insert(pid("P1"), BTreeSet::from([name("A"), name("B")]));
        duplicate.insert(pid("P2"), BTreeSet::from([name("B"), name("C")]));
        assert!(matches!(
            topology.repartition(duplicate, BTreeMap::new(), PartitionConnection::open()),
            Err(TopologyError::ServiceInMultiplePartitions { .. })
        ));
        assert_eq!(topology, before);
    }

    #[test]
    fn test_repartition_rejects_override_on_unknown_partition() {
        let mut topology = two_partition_topology();
        let before = topology.clone();
        let mut membership = BTreeMap::new();
        membership.insert(pid("P1"), BTreeSet::from([name("A"), name("B"), name("C")]));
        let connections = connections_from_pairs([(
            pid("P1"),
            pid("ghost"),
            PartitionConnection::blocked(),
        )])
        .unwrap();
        assert_eq!(
            topology.repartition(membership, connections, PartitionConnection::open()),
            Err(TopologyError::PartitionNotFound(pid("ghost")))
        );
        assert_eq!(topology, before);
    }

    #[test]
    fn test_connections_from_pairs_rejects_reversed_duplicate() {
        let result = connections_from_pairs([
            (pid("A"), pid("B"), PartitionConnection::blocked()),
            (pid("B"), pid("A"), PartitionConnection::open()),
        ]);
        assert_eq!(
            result,
            Err(TopologyError::DuplicateConnection {
                first: pid("A"),
                second: pid("B"),
            })
        );
    }

    #[test]
    fn test_connection_id_is_canonical() {
        let ab = PartitionConnectionId::new(pid("b"), pid("a"));
        assert_eq!(ab.first(), &pid("a"));
        assert_eq!(ab, PartitionConnectionId::new(pid("a"), pid("b")));
    }

    #[test]
    fn test_delay_makes_connection_not_open() {
        let connection = PartitionConnection::open().with_delay(PacketDelay::new(50));
        assert!(!connection.is_open());
        assert!(!connection.is_blocked());
        let bad = PartitionConnection::open()
            .with_delay(PacketDelay::new(10).with_jitter(5, 150.0));
        assert_eq!(bad.validate(), Err(TopologyError::InvalidDelayCorrelation(150.0)));
    }
}
