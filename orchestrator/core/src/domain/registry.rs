// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Service registry: registrations, started services and the identifier
//! indices used to resolve user-supplied identifiers.
//!
//! Resolution order is full UUID, then shortened UUID, then service name. A
//! shortened UUID shared by several live services is ambiguous and never
//! guessed.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::net::IpAddr;
use thiserror::Error;

use crate::domain::service::{Service, ServiceName, ServiceRegistration, ServiceUuid};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("no service matches identifier '{0}'")]
    NotFound(String),
    #[error("identifier '{identifier}' matches multiple services: {matches:?}")]
    Ambiguous {
        identifier: String,
        matches: Vec<ServiceName>,
    },
    #[error("service '{0}' is already registered")]
    NameTaken(ServiceName),
    #[error("service UUID '{0}' has already been issued")]
    UuidReused(ServiceUuid),
}

#[derive(Debug, Clone)]
struct RegistryEntry {
    registration: ServiceRegistration,
    service: Option<Service>,
}

#[derive(Debug, Default)]
pub struct ServiceRegistry {
    by_name: BTreeMap<ServiceName, RegistryEntry>,
    uuid_to_name: HashMap<ServiceUuid, ServiceName>,
    shortened_to_names: HashMap<String, BTreeSet<ServiceName>>,
    // Every UUID ever inserted, including removed ones.
    issued: HashSet<ServiceUuid>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }

    pub fn contains(&self, name: &ServiceName) -> bool {
        self.by_name.contains_key(name)
    }

    pub fn insert(&mut self, registration: ServiceRegistration) -> Result<(), RegistryError> {
        if self.by_name.contains_key(&registration.name) {
            return Err(RegistryError::NameTaken(registration.name));
        }
        if self.issued.contains(&registration.uuid) {
            return Err(RegistryError::UuidReused(registration.uuid));
        }
        let name = registration.name.clone();
        let uuid = registration.uuid.clone();
        self.shortened_to_names
            .entry(uuid.shortened())
            .or_default()
            .insert(name.clone());
        self.uuid_to_name.insert(uuid.clone(), name.clone());
        self.issued.insert(uuid);
        self.by_name.insert(
            name,
            RegistryEntry {
                registration,
                service: None,
            },
        );
        Ok(())
    }

    /// Purges the name, UUID and shortened-UUID entries of a service.
    pub fn remove(&mut self, name: &ServiceName) -> Option<(ServiceRegistration, Option<Service>)> {
        let entry = self.by_name.remove(name)?;
        let uuid = &entry.registration.uuid;
        self.uuid_to_name.remove(uuid);
        let shortened = uuid.shortened();
        if let Some(names) = self.shortened_to_names.get_mut(&shortened) {
            names.remove(name);
            if names.is_empty() {
                self.shortened_to_names.remove(&shortened);
            }
        }
        Some((entry.registration, entry.service))
    }

    pub fn mark_started(&mut self, service: Service) -> Result<(), RegistryError> {
        let entry = self
            .by_name
            .get_mut(service.name())
            .ok_or_else(|| RegistryError::NotFound(service.name().to_string()))?;
        entry.service = Some(service);
        Ok(())
    }

    /// Drops the started-service record, keeping the registration.
    pub fn clear_started(&mut self, name: &ServiceName) -> Option<Service> {
        self.by_name
            .get_mut(name)
            .and_then(|entry| entry.service.take())
    }

    pub fn resolve(&self, identifier: &str) -> Result<ServiceName, RegistryError> {
        if let Some(name) = self.uuid_to_name.get(&ServiceUuid::new(identifier)) {
            return Ok(name.clone());
        }
        if let Some(names) = self.shortened_to_names.get(identifier) {
            match names.len() {
                1 => {
                    if let Some(name) = names.iter().next() {
                        return Ok(name.clone());
                    }
                }
                n if n > 1 => {
                    return Err(RegistryError::Ambiguous {
                        identifier: identifier.to_string(),
                        matches: names.iter().cloned().collect(),
                    })
                }
                _ => {}
            }
        }
        let name = ServiceName::new(identifier);
        if self.by_name.contains_key(&name) {
            return Ok(name);
        }
        Err(RegistryError::NotFound(identifier.to_string()))
    }

    pub fn registration(&self, name: &ServiceName) -> Option<&ServiceRegistration> {
        self.by_name.get(name).map(|entry| &entry.registration)
    }

    pub fn service(&self, name: &ServiceName) -> Option<&Service> {
        self.by_name.get(name).and_then(|entry| entry.service.as_ref())
    }

    pub fn service_mut(&mut self, name: &ServiceName) -> Option<&mut Service> {
        self.by_name
            .get_mut(name)
            .and_then(|entry| entry.service.as_mut())
    }

    pub fn is_started(&self, name: &ServiceName) -> bool {
        self.service(name).is_some()
    }

    pub fn names(&self) -> impl Iterator<Item = &ServiceName> {
        self.by_name.keys()
    }

    pub fn started_services(&self) -> impl Iterator<Item = &Service> {
        self.by_name.values().filter_map(|entry| entry.service.as_ref())
    }

    pub fn ip_of(&self, name: &ServiceName) -> Option<IpAddr> {
        self.registration(name).map(|registration| registration.private_ip)
    }

    pub fn has_issued(&self, uuid: &ServiceUuid) -> bool {
        self.issued.contains(uuid)
    }
}
