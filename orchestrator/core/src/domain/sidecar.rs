// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Networking Sidecars
//!
//! A networking sidecar is a helper container that shares the network
//! namespace of one started service and shapes that service's outbound
//! traffic with `tc`.
//!
//! ## Qdisc layout
//!
//! ```text
//! root 1: htb (default 1:1)
//!  ├── 1:1   unrestricted
//!  ├── 1:2 ──> 2: netem loss X% [delay ...]   <- peers sharing one connection
//!  └── 1:3 ──> 3: netem ...
//! filters: dst <peer-ip> -> flowid 1:N
//! ```
//!
//! Every update rebuilds the whole tree, so rules from a previous
//! configuration never linger. Peers with an open connection get no filter
//! and fall through to the unrestricted default class.

use async_trait::async_trait;
use futures::future::join_all;
use std::collections::BTreeMap;
use std::net::IpAddr;
use thiserror::Error;

use crate::domain::partition_topology::PartitionConnection;
use crate::domain::service::{EnclaveId, Service, ServiceName, ServiceUuid};

pub const DEFAULT_SIDECAR_INTERFACE: &str = "eth0";

const ROOT_HANDLE: &str = "1:";
const DEFAULT_CLASS_MINOR: u32 = 1;
const FIRST_SHAPED_CLASS_MINOR: u32 = 2;
const CLASS_RATE: &str = "10gbit";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SidecarError {
    #[error("failed to create networking sidecar for service '{service}': {reason}")]
    CreationFailed { service: ServiceName, reason: String },
    #[error("networking sidecar for service '{0}' has not initialized traffic control yet")]
    NotInitialized(ServiceName),
    #[error("failed to run commands in networking sidecar for service '{service}': {reason}")]
    ExecFailed { service: ServiceName, reason: String },
    #[error("traffic control commands for service '{service}' exited with code {exit_code}: {output}")]
    CommandFailed {
        service: ServiceName,
        exit_code: i64,
        output: String,
    },
    #[error("failed to remove networking sidecar for service '{service}': {reason}")]
    RemovalFailed { service: ServiceName, reason: String },
}

/// Per-peer rules pushed to one sidecar, keyed by peer IP.
pub type TrafficControlRules = BTreeMap<IpAddr, PartitionConnection>;

#[derive(Debug, Clone, PartialEq)]
pub struct NetworkingSidecar {
    pub service_name: ServiceName,
    pub service_uuid: ServiceUuid,
    /// Handle used to run commands, e.g. the sidecar container id.
    pub container_id: String,
    interface: String,
    initialized: bool,
    applied: TrafficControlRules,
}

impl NetworkingSidecar {
    pub fn new(
        service_name: ServiceName,
        service_uuid: ServiceUuid,
        container_id: impl Into<String>,
        interface: impl Into<String>,
    ) -> Self {
        Self {
            service_name,
            service_uuid,
            container_id: container_id.into(),
            interface: interface.into(),
            initialized: false,
            applied: TrafficControlRules::new(),
        }
    }

    pub fn interface(&self) -> &str {
        &self.interface
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Rules most recently applied successfully.
    pub fn applied_rules(&self) -> &TrafficControlRules {
        &self.applied
    }

    pub fn initialize_commands(&self) -> Vec<String> {
        let tc = TrafficControlCommands::new(&self.interface);
        vec![tc.delete_root(), tc.add_root_htb(), tc.add_default_class()]
    }

    pub fn mark_initialized(&mut self) {
        self.initialized = true;
    }

    pub fn update_commands(
        &self,
        rules: &TrafficControlRules,
    ) -> Result<Vec<String>, SidecarError> {
        if !self.initialized {
            return Err(SidecarError::NotInitialized(self.service_name.clone()));
        }
        let tc = TrafficControlCommands::new(&self.interface);
        let mut commands = vec![tc.delete_root(), tc.add_root_htb(), tc.add_default_class()];

        let mut minor = FIRST_SHAPED_CLASS_MINOR;
        for (connection, peers) in group_by_connection(rules) {
            commands.push(tc.add_class(minor));
            commands.push(tc.add_netem(minor, &connection));
            for peer in peers {
                commands.push(tc.add_filter(peer, minor));
            }
            minor += 1;
        }
        Ok(commands)
    }

    pub fn record_applied(&mut self, rules: TrafficControlRules) {
        self.applied = rules;
    }
}

/// Groups peers that share an identical, non-open connection, preserving IP order.
fn group_by_connection(rules: &TrafficControlRules) -> Vec<(PartitionConnection, Vec<IpAddr>)> {
    let mut groups: Vec<(PartitionConnection, Vec<IpAddr>)> = Vec::new();
    for (ip, connection) in rules.iter().filter(|(_, c)| !c.is_open()) {
        match groups.iter_mut().find(|(existing, _)| existing == connection) {
            Some((_, peers)) => peers.push(*ip),
            None => groups.push((*connection, vec![*ip])),
        }
    }
    groups
}

/// Builder for the `tc` invocations run inside a sidecar.
pub struct TrafficControlCommands {
    interface: String,
}

impl TrafficControlCommands {
    pub fn new(interface: &str) -> Self {
        Self {
            interface: interface.to_string(),
        }
    }

    /// Tolerates a missing root qdisc so the tree can always be rebuilt.
    pub fn delete_root(&self) -> String {
        format!("tc qdisc del dev {} root 2>/dev/null || true", self.interface)
    }

    pub fn add_root_htb(&self) -> String {
        format!(
            "tc qdisc add dev {} root handle {} htb default {:x}",
            self.interface, ROOT_HANDLE, DEFAULT_CLASS_MINOR
        )
    }

    pub fn add_default_class(&self) -> String {
        self.add_class(DEFAULT_CLASS_MINOR)
    }

    pub fn add_class(&self, minor: u32) -> String {
        format!(
            "tc class add dev {} parent {} classid 1:{:x} htb rate {}",
            self.interface, ROOT_HANDLE, minor, CLASS_RATE
        )
    }

    pub fn add_netem(&self, minor: u32, connection: &PartitionConnection) -> String {
        let mut cmd = format!(
            "tc qdisc add dev {} parent 1:{:x} handle {:x}: netem loss {}%",
            self.interface, minor, minor, connection.packet_loss_percentage
        );
        if let Some(delay) = &connection.packet_delay {
            cmd.push_str(&format!(" delay {}ms", delay.delay_ms));
            if delay.jitter_ms > 0 {
                cmd.push_str(&format!(
                    " {}ms {}%",
                    delay.jitter_ms, delay.correlation_percentage
                ));
            }
        }
        cmd
    }

    pub fn add_filter(&self, peer: IpAddr, minor: u32) -> String {
        let (protocol, matcher, prefix) = match peer {
            IpAddr::V4(_) => ("ip", "ip", 32),
            IpAddr::V6(_) => ("ipv6", "ip6", 128),
        };
        format!(
            "tc filter add dev {} parent {} protocol {} prio 1 u32 match {} dst {}/{} flowid 1:{:x}",
            self.interface, ROOT_HANDLE, protocol, matcher, peer, prefix, minor
        )
    }
}

/// One command batch addressed to one sidecar.
#[derive(Debug, Clone)]
pub struct CommandBatch {
    pub sidecar: NetworkingSidecar,
    pub commands: Vec<String>,
}

/// Creates, removes and drives networking sidecars on behalf of the service
/// network.
#[async_trait]
pub trait NetworkingSidecarManager: Send + Sync {
    /// Creates a sidecar bound to the network namespace of a started service.
    /// The returned sidecar is not initialized.
    async fn add(
        &self,
        enclave: &EnclaveId,
        service: &Service,
    ) -> Result<NetworkingSidecar, SidecarError>;

    async fn remove(
        &self,
        enclave: &EnclaveId,
        sidecar: &NetworkingSidecar,
    ) -> Result<(), SidecarError>;

    /// Runs the commands in order, failing on the first one that fails.
    async fn run_commands(
        &self,
        enclave: &EnclaveId,
        sidecar: &NetworkingSidecar,
        commands: &[String],
    ) -> Result<(), SidecarError>;

    /// Dispatches every batch concurrently and reports each sidecar's outcome.
    /// One failed batch never prevents the others from running.
    async fn run_batches(
        &self,
        enclave: &EnclaveId,
        batches: &[CommandBatch],
    ) -> BTreeMap<ServiceName, Result<(), SidecarError>> {
        let results = join_all(batches.iter().map(|batch| async move {
            let result = self
                .run_commands(enclave, &batch.sidecar, &batch.commands)
                .await;
            (batch.sidecar.service_name.clone(), result)
        }))
        .await;
        results.into_iter().collect()
    }
}
