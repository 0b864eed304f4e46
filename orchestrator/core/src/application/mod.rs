// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

pub(crate) mod rollback;
pub mod service_network;
pub mod traffic_sync;

pub use service_network::{
    BulkOutcome, DefaultServiceNetwork, HttpServiceRequest, HttpServiceResponse, NetworkError,
    ServiceNetwork,
};
pub use traffic_sync::{SyncError, SyncScope};
