// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Enclave service network engine.
//!
//! Tracks every service of an enclave, groups services into network
//! partitions and keeps per-service networking sidecars in sync with the
//! partition connectivity matrix.
//!
//! # Architecture
//!
//! - **Domain:** topology, registry, service identity, backend and sidecar seams
//! - **Application:** [`application::ServiceNetwork`] and its compensation stack
//! - **Infrastructure:** Docker and in-memory backends, event bus, logging

pub mod application;
pub mod domain;
pub mod infrastructure;

pub use application::{DefaultServiceNetwork, NetworkError, ServiceNetwork};
pub use domain::*;
