// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! In-memory backend and metrics implementations.
//!
//! [`SimBackend`] models just enough of a container engine for the
//! reconciliation engine to be driven against: named containers with
//! inspectable configs, create-or-reuse semantics in `up`, and operation
//! counters so tests can assert how much work a pass actually did.

use crate::backend::{
    BackendError, Container, ContainerBackend, ContainerConfig,
    ContainerFilter, ContainerState, ContainerStatus,
};
use crate::metrics::{MetricsError, MetricsReader, SeriesKey, SeriesStats};
use async_trait::async_trait;
use close_common::ContainerId;
use slog::{debug, info, o, Logger};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;
use tokio::sync::Mutex;

/// Operation counts since the last [`SimBackend::reset_counters`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SimCounters {
    pub lists: usize,
    pub creates: usize,
    pub starts: usize,
    pub stops: usize,
    pub removes: usize,
    pub kills: usize,
}

struct SimContainer {
    id: ContainerId,
    container_id: String,
    config: ContainerConfig,
    state: ContainerState,
    exit_code: i32,
}

impl SimContainer {
    fn status(&self) -> ContainerStatus {
        let status = match self.state {
            ContainerState::Running => "Up (sim)".to_string(),
            ContainerState::Exited => {
                format!("Exited ({}) (sim)", self.exit_code)
            }
            other => format!("{other} (sim)"),
        };
        ContainerStatus {
            id: self.id.clone(),
            container_id: self.container_id.clone(),
            node: None,
            status,
            state: self.state,
            exit_code: self.exit_code,
        }
    }
}

#[derive(Default)]
struct SimInner {
    // keyed by container name
    containers: BTreeMap<String, SimContainer>,
    counters: SimCounters,
    fail_up: BTreeSet<String>,
    seq: u64,
}

/// In-memory [`ContainerBackend`].
pub struct SimBackend {
    log: Logger,
    inner: Mutex<SimInner>,
}

impl SimBackend {
    pub fn new(log: &Logger) -> Self {
        Self {
            log: log.new(o!("component" => "SimBackend")),
            inner: Mutex::new(SimInner::default()),
        }
    }

    pub async fn counters(&self) -> SimCounters {
        self.inner.lock().await.counters.clone()
    }

    pub async fn reset_counters(&self) {
        self.inner.lock().await.counters = SimCounters::default();
    }

    /// Names of all containers, in any state.
    pub async fn container_names(&self) -> Vec<String> {
        self.inner.lock().await.containers.keys().cloned().collect()
    }

    /// Make the next `up` of this identity fail.
    pub async fn fail_next_up(&self, id: &ContainerId) {
        self.inner.lock().await.fail_up.insert(id.to_string());
    }

    /// Force a container into the exited state, as if its process died.
    pub async fn exit(&self, id: &ContainerId, exit_code: i32) {
        let mut inner = self.inner.lock().await;
        if let Some(container) = inner.containers.get_mut(&id.to_string()) {
            container.state = ContainerState::Exited;
            container.exit_code = exit_code;
        }
    }
}

#[async_trait]
impl ContainerBackend for SimBackend {
    async fn list(
        &self,
        filter: &ContainerFilter,
    ) -> Result<Vec<ContainerStatus>, BackendError> {
        let mut inner = self.inner.lock().await;
        inner.counters.lists += 1;
        Ok(inner
            .containers
            .values()
            .filter(|container| filter.matches(&container.id))
            .map(SimContainer::status)
            .collect())
    }

    async fn get(
        &self,
        id: &ContainerId,
    ) -> Result<Option<Container>, BackendError> {
        let inner = self.inner.lock().await;
        Ok(inner.containers.get(&id.to_string()).map(|container| {
            Container {
                status: container.status(),
                config: container.config.clone(),
            }
        }))
    }

    async fn up(
        &self,
        id: &ContainerId,
        config: ContainerConfig,
    ) -> Result<(), BackendError> {
        let name = id.to_string();
        let mut inner = self.inner.lock().await;

        if inner.fail_up.remove(&name) {
            return Err(BackendError::Failed {
                id: id.clone(),
                reason: "injected up failure".to_string(),
            });
        }

        if let Some(existing) = inner.containers.get_mut(&name) {
            if config.satisfied_by(&existing.config) {
                if !existing.state.is_up() {
                    existing.state = ContainerState::Running;
                    existing.exit_code = 0;
                    inner.counters.starts += 1;
                    debug!(self.log, "started"; "container" => &name);
                }
                return Ok(());
            }
            inner.containers.remove(&name);
            inner.counters.removes += 1;
            debug!(self.log, "replacing"; "container" => &name);
        }

        inner.seq += 1;
        let container_id = format!("sim-{:08x}", inner.seq);
        inner.containers.insert(
            name.clone(),
            SimContainer {
                id: id.clone(),
                container_id,
                config,
                state: ContainerState::Running,
                exit_code: 0,
            },
        );
        inner.counters.creates += 1;
        inner.counters.starts += 1;
        debug!(self.log, "created"; "container" => &name);
        Ok(())
    }

    async fn down(&self, id: &ContainerId) -> Result<(), BackendError> {
        let mut inner = self.inner.lock().await;
        if let Some(container) = inner.containers.get_mut(&id.to_string()) {
            if container.state.is_up() {
                container.state = ContainerState::Exited;
                container.exit_code = 0;
                inner.counters.stops += 1;
                debug!(self.log, "stopped"; "container" => %id);
            }
        }
        Ok(())
    }

    async fn clean(&self, id: &ContainerId) -> Result<(), BackendError> {
        let mut inner = self.inner.lock().await;
        if inner.containers.remove(&id.to_string()).is_some() {
            inner.counters.removes += 1;
            debug!(self.log, "removed"; "container" => %id);
        }
        Ok(())
    }

    async fn panic_kill(&self) -> Result<(), BackendError> {
        let mut inner = self.inner.lock().await;
        let mut killed = 0;
        for container in inner.containers.values_mut() {
            if container.state.is_up() {
                container.state = ContainerState::Exited;
                container.exit_code = 137;
                killed += 1;
            }
        }
        inner.counters.kills += killed;
        info!(self.log, "panic kill"; "killed" => killed);
        Ok(())
    }
}

/// In-memory [`MetricsReader`] with hand-inserted aggregates.
#[derive(Default)]
pub struct SimMetrics {
    inner: Mutex<SimMetricsInner>,
}

#[derive(Default)]
struct SimMetricsInner {
    stats: Vec<SeriesStats>,
    queries: usize,
}

impl SimMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, series: &str, instance: &str, field: &str, mean: f64) {
        let key = SeriesKey {
            series: series.to_string(),
            hostname: None,
            instance: Some(instance.to_string()),
        };
        self.inner.lock().await.stats.push(SeriesStats {
            key,
            field: field.to_string(),
            mean,
            min: mean,
            max: mean,
            last: mean,
        });
    }

    pub async fn queries(&self) -> usize {
        self.inner.lock().await.queries
    }
}

#[async_trait]
impl MetricsReader for SimMetrics {
    async fn get_stats(
        &self,
        key: &SeriesKey,
        field: &str,
        _window: Duration,
    ) -> Result<Vec<SeriesStats>, MetricsError> {
        let mut inner = self.inner.lock().await;
        inner.queries += 1;
        Ok(inner
            .stats
            .iter()
            .filter(|stat| {
                stat.key.series == key.series
                    && stat.field == field
                    && key
                        .instance
                        .as_ref()
                        .map_or(true, |i| stat.key.instance.as_ref() == Some(i))
                    && key
                        .hostname
                        .as_ref()
                        .map_or(true, |h| stat.key.hostname.as_ref() == Some(h))
            })
            .cloned()
            .collect())
    }
}
