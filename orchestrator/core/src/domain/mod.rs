// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Domain layer: topology graph, service identity, registry indices and the
//! seams to the container engine and networking sidecars.
//!
//! # Architecture
//!
//! - **Layer:** Domain Layer
//! - **Purpose:** Pure types and traits, no I/O

pub mod backend;
pub mod config;
pub mod events;
pub mod partition_topology;
pub mod registry;
pub mod service;
pub mod sidecar;
