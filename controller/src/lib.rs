// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Control plane for a close fleet.
//!
//! The [`manager::Manager`] reconciles a declared fleet ([`fleet`])
//! against a container backend ([`backend`]), tracks the resulting client
//! and worker instances, and assembles status listings through a
//! per-request [`cache::StatusCache`] over the backend, the config store,
//! and a metrics reader.

pub mod backend;
pub mod cache;
mod clients;
pub mod fleet;
pub mod manager;
pub mod metrics;
pub mod sim;
pub mod stats_url;
mod workers;

pub use backend::{
    BackendError, Container, ContainerBackend, ContainerConfig,
    ContainerFilter, ContainerState, ContainerStatus, Mount,
};
pub use cache::{Sampled, StatusCache, StatusError};
pub use clients::{ClientState, ClientStatus};
pub use fleet::{ClientConfig, FleetConfig, FleetError, WorkerConfig};
pub use manager::{Manager, ManagerError, ManagerOptions, ReconcileErrors};
pub use metrics::{MetricsError, MetricsReader, SeriesKey, SeriesStats};
pub use sim::{SimBackend, SimCounters, SimMetrics};
pub use stats_url::{InstanceScope, StatsUrl, StatsUrlError};
pub use workers::{WorkerState, WorkerStatus};
