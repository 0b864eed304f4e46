// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Service Domain Types
//!
//! Identity and lifecycle value objects for the services that live inside an
//! enclave.
//!
//! | Type | Purpose |
//! |------|---------|
//! | [`ServiceName`] | Caller-assigned name, unique while registered |
//! | [`ServiceUuid`] | Generated identity, never reused |
//! | [`ServiceRegistration`] | Reserved identity + private IP (no container yet) |
//! | [`Service`] | A registration whose container has been started |
//! | [`ServiceConfig`] | What the backend needs to start the container |

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;
use thiserror::Error;
use uuid::Uuid;

use crate::domain::partition_topology::PartitionId;

/// Number of leading UUID characters used for the human-friendly short form.
pub const SHORTENED_UUID_LENGTH: usize = 12;

/// Docker refuses memory limits below 6 megabytes.
pub const MIN_MEMORY_ALLOCATION_MEGABYTES: u64 = 6;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ServiceValidationError {
    #[error("service name cannot be empty or whitespace")]
    EmptyName,
    #[error("service name '{0}' contains whitespace or '/'")]
    IllegalCharacters(String),
    #[error("memory allocation of {requested}MB is below the minimum of {minimum}MB")]
    MemoryTooLow { requested: u64, minimum: u64 },
    #[error("container image name cannot be empty")]
    EmptyImage,
    #[error("received {private} private ports but {public} public ports; they must be one to one")]
    PortCountMismatch { private: usize, public: usize },
    #[error("public port '{0}' has no matching private port")]
    UnmatchedPublicPort(String),
    #[error("port number 0 is not valid for port '{0}'")]
    ZeroPort(String),
}

/// Identifier of the enclave a service network belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EnclaveId(pub String);

impl EnclaveId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EnclaveId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ServiceName(pub String);

impl ServiceName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn validate(&self) -> Result<(), ServiceValidationError> {
        if self.0.trim().is_empty() {
            return Err(ServiceValidationError::EmptyName);
        }
        if self.0.chars().any(|c| c.is_whitespace() || c == '/') {
            return Err(ServiceValidationError::IllegalCharacters(self.0.clone()));
        }
        Ok(())
    }
}

impl fmt::Display for ServiceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ServiceName {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

/// Globally unique service identity, in UUID "simple" form (32 hex chars, no dashes).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ServiceUuid(pub String);

impl ServiceUuid {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    pub fn new(uuid: impl Into<String>) -> Self {
        Self(uuid.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short prefix for human-friendly lookup. Not unique.
    pub fn shortened(&self) -> String {
        self.0.chars().take(SHORTENED_UUID_LENGTH).collect()
    }
}

impl fmt::Display for ServiceUuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity reserved for a service before any container exists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceRegistration {
    pub name: ServiceName,
    pub uuid: ServiceUuid,
    pub private_ip: IpAddr,
    pub registered_at: DateTime<Utc>,
}

impl ServiceRegistration {
    pub fn new(name: ServiceName, uuid: ServiceUuid, private_ip: IpAddr) -> Self {
        Self {
            name,
            uuid,
            private_ip,
            registered_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportProtocol {
    Tcp,
    Udp,
    Sctp,
}

impl TransportProtocol {
    /// Suffix used by Docker for exposed-port keys (`8080/tcp`).
    pub fn as_docker_str(&self) -> &'static str {
        match self {
            TransportProtocol::Tcp => "tcp",
            TransportProtocol::Udp => "udp",
            TransportProtocol::Sctp => "sctp",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortSpec {
    pub number: u16,
    pub transport_protocol: TransportProtocol,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub application_protocol: Option<String>,
}

impl PortSpec {
    pub fn tcp(number: u16) -> Self {
        Self {
            number,
            transport_protocol: TransportProtocol::Tcp,
            application_protocol: None,
        }
    }

    pub fn with_application_protocol(mut self, protocol: impl Into<String>) -> Self {
        self.application_protocol = Some(protocol.into());
        self
    }
}

/// Everything the container backend needs to start a registered service.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub image: String,
    #[serde(default)]
    pub private_ports: BTreeMap<String, PortSpec>,
    #[serde(default)]
    pub public_ports: BTreeMap<String, PortSpec>,
    #[serde(default)]
    pub entrypoint: Vec<String>,
    #[serde(default)]
    pub cmd: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// 0 means "no limit".
    #[serde(default)]
    pub cpu_allocation_millicpus: u64,
    /// 0 means "no limit".
    #[serde(default)]
    pub memory_allocation_megabytes: u64,
    /// Partition to place the service in; `None` keeps the current one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subnetwork: Option<PartitionId>,
}

impl ServiceConfig {
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            ..Default::default()
        }
    }

    pub fn with_private_port(mut self, id: impl Into<String>, port: PortSpec) -> Self {
        self.private_ports.insert(id.into(), port);
        self
    }

    pub fn with_subnetwork(mut self, partition: PartitionId) -> Self {
        self.subnetwork = Some(partition);
        self
    }

    pub fn validate(&self) -> Result<(), ServiceValidationError> {
        if self.image.trim().is_empty() {
            return Err(ServiceValidationError::EmptyImage);
        }
        if self.memory_allocation_megabytes != 0
            && self.memory_allocation_megabytes < MIN_MEMORY_ALLOCATION_MEGABYTES
        {
            return Err(ServiceValidationError::MemoryTooLow {
                requested: self.memory_allocation_megabytes,
                minimum: MIN_MEMORY_ALLOCATION_MEGABYTES,
            });
        }
        for (id, port) in self.private_ports.iter().chain(self.public_ports.iter()) {
            if port.number == 0 {
                return Err(ServiceValidationError::ZeroPort(id.clone()));
            }
        }
        if !self.public_ports.is_empty() {
            if self.public_ports.len() != self.private_ports.len() {
                return Err(ServiceValidationError::PortCountMismatch {
                    private: self.private_ports.len(),
                    public: self.public_ports.len(),
                });
            }
            if let Some(id) = self
                .public_ports
                .keys()
                .find(|id| !self.private_ports.contains_key(*id))
            {
                return Err(ServiceValidationError::UnmatchedPublicPort(id.clone()));
            }
        }
        Ok(())
    }
}

/// Bulk partition move request for a single service.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateServiceConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subnetwork: Option<PartitionId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceStatus {
    Running,
    Paused,
    Stopped,
}

/// A registered service whose container has been started.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    pub registration: ServiceRegistration,
    pub container_id: String,
    pub status: ServiceStatus,
    pub private_ports: BTreeMap<String, PortSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_ip: Option<IpAddr>,
    #[serde(default)]
    pub public_ports: BTreeMap<String, PortSpec>,
    pub started_at: DateTime<Utc>,
}

impl Service {
    pub fn name(&self) -> &ServiceName {
        &self.registration.name
    }

    pub fn uuid(&self) -> &ServiceUuid {
        &self.registration.uuid
    }

    pub fn private_ip(&self) -> IpAddr {
        self.registration.private_ip
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecResult {
    pub exit_code: i64,
    pub output: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_uuid_is_simple_hex_and_unique() {
        let a = ServiceUuid::generate();
        let b = ServiceUuid::generate();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 32);
        assert!(a.as_str().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_shortened_uuid_is_prefix() {
        let uuid = ServiceUuid::new("0123456789abcdef0123456789abcdef");
        assert_eq!(uuid.shortened(), "0123456789ab");
        assert!(uuid.as_str().starts_with(&uuid.shortened()));
    }

    #[test]
    fn test_service_name_validation() {
        assert!(ServiceName::new("datastore-1").validate().is_ok());
        assert_eq!(
            ServiceName::new("   ").validate(),
            Err(ServiceValidationError::EmptyName)
        );
        assert!(matches!(
            ServiceName::new("bad name").validate(),
            Err(ServiceValidationError::IllegalCharacters(_))
        ));
        assert!(ServiceName::new("a/b").validate().is_err());
    }

    #[test]
    fn test_memory_allocation_minimum() {
        let mut config = ServiceConfig::new("nginx:latest");
        assert!(config.validate().is_ok());

        config.memory_allocation_megabytes = 5;
        assert_eq!(
            config.validate(),
            Err(ServiceValidationError::MemoryTooLow { requested: 5, minimum: 6 })
        );

        config.memory_allocation_megabytes = 6;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_public_ports_must_match_private_ports() {
        let mut config = ServiceConfig::new("nginx:latest")
            .with_private_port("http", PortSpec::tcp(80))
            .with_private_port("metrics", PortSpec::tcp(9090));
        config.public_ports.insert("http".to_string(), PortSpec::tcp(8080));
        assert!(matches!(
            config.validate(),
            Err(ServiceValidationError::PortCountMismatch { private: 2, public: 1 })
        ));

        config.public_ports.insert("admin".to_string(), PortSpec::tcp(9091));
        assert_eq!(
            config.validate(),
            Err(ServiceValidationError::UnmatchedPublicPort("admin".to_string()))
        );
    }

    #[test]
    fn test_service_config_yaml_defaults() {
        let yaml = "\
image: redis:7
private_ports:
  client:
    number: 6379
    transport_protocol: tcp
";
        let config: ServiceConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.image, "redis:7");
        assert_eq!(config.private_ports["client"].number, 6379);
        assert!(config.subnetwork.is_none());
        assert_eq!(config.memory_allocation_megabytes, 0);
    }
}
