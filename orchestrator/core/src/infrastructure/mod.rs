// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

pub mod docker;
pub mod event_bus;
pub mod in_memory;
pub mod ip_allocator;
pub mod logging;

pub use event_bus::{EventBus, EventBusError};
pub use in_memory::{InMemoryContainerBackend, InMemorySidecarManager};
