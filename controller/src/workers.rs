// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Tracked worker instances.
//!
//! A worker is a traffic-generator container plus, once running, a
//! config-store registration it owns. Its status combines container state,
//! registration liveness, and the declared rate/stats columns; the `wait`
//! state marks a container that is up but has not (or no longer) got a
//! live registration.

use crate::backend::ContainerConfig;
use crate::cache::{Sampled, StatusCache};
use crate::fleet::WorkerConfig;
use crate::manager::ManagerOptions;
use crate::stats_url::StatsUrl;
use close_common::{ContainerId, IdError, InstanceClass};
use close_config_store::sub::SubHandle;
use close_config_store::ConfigStore;
use serde::Serialize;
use std::sync::Arc;

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Serialize, strum::Display,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum WorkerState {
    Up,
    Down,
    Error,
    /// Container running, registration not (yet) live.
    Wait,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct WorkerStatus {
    /// Declared worker name.
    pub config: String,
    pub instance: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container: Option<String>,
    pub container_status: String,
    /// Seconds of registration liveness remaining.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config_ttl: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate: Option<Sampled<u64>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate_stats: Option<Sampled<f64>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_stats: Option<Sampled<f64>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub state: WorkerState,
}

/// One tracked worker instance.
pub(crate) struct Worker {
    pub config: Arc<WorkerConfig>,
    pub name: String,
    pub instance: String,
    pub id: ContainerId,
    /// Read/push access to the instance's config record, keyed by the
    /// declaration's worker type rather than its name.
    pub sub: SubHandle,
    /// Reconciliation mark; instances left unmarked get swept.
    pub up: bool,
}

impl Worker {
    pub(crate) fn new(
        name: &str,
        config: Arc<WorkerConfig>,
        instance: String,
        store: Arc<dyn ConfigStore>,
    ) -> Result<Self, IdError> {
        let id =
            ContainerId::new(InstanceClass::Worker, name, instance.as_str())?;
        let record_id = close_common::ConfigId::new(
            config.module(name),
            instance.as_str(),
        )?;
        Ok(Self {
            config,
            name: name.to_string(),
            instance,
            id,
            sub: SubHandle::new(store, record_id),
            up: false,
        })
    }

    /// Adopt a new generation of the declaration. If its worker type
    /// changed, the record handle is rebound to the new identity; the
    /// container's `CLOSE_INSTANCE` env then no longer matches, which
    /// forces replacement on the same pass.
    pub(crate) fn redeclare(
        &mut self,
        config: Arc<WorkerConfig>,
        store: &Arc<dyn ConfigStore>,
    ) -> Result<(), IdError> {
        let record_id = close_common::ConfigId::new(
            config.module(&self.name),
            self.instance.as_str(),
        )?;
        if self.sub.id() != &record_id {
            self.sub = SubHandle::new(Arc::clone(store), record_id);
        }
        self.config = config;
        Ok(())
    }

    pub(crate) fn container_config(
        &self,
        options: &ManagerOptions,
    ) -> Result<ContainerConfig, IdError> {
        let declared = &*self.config;
        let mut config = ContainerConfig {
            image: declared.image.clone(),
            command: declared.command.clone(),
            privileged: declared.privileged,
            ..Default::default()
        };
        config.env.add("CLOSE_INSTANCE", self.sub.id().to_string());

        if let Some(url) = &options.config_url {
            config.add_flag("config-url", url);
        }
        if let Some(url) = &options.metrics_url {
            config.add_flag("metrics-url", url);
        }
        if let Some(flag) = &declared.id_flag {
            config.add_flag(flag, &self.instance);
        }
        config.args.extend(declared.args.iter().cloned());

        if let Some(client) = &self.config.client {
            let client_id = ContainerId::new(
                InstanceClass::Client,
                client.as_str(),
                self.instance.as_str(),
            )?;
            config.set_network_container(&client_id);
        }
        Ok(config)
    }

    pub(crate) async fn status(
        &self,
        cache: &mut StatusCache<'_>,
    ) -> WorkerStatus {
        let mut status = WorkerStatus {
            config: self.name.clone(),
            instance: self.instance.clone(),
            container: None,
            container_status: String::new(),
            config_ttl: None,
            rate: None,
            rate_stats: None,
            latency_stats: None,
            error: None,
            state: WorkerState::Down,
        };

        match cache.container_status(&self.id).await {
            Err(error) => {
                status.error = Some(error.to_string());
                status.state = WorkerState::Error;
                return status;
            }
            Ok(None) => return status,
            Ok(Some(container)) => {
                status.container = Some(container.container_id.clone());
                status.container_status = container.status.clone();
                if container.is_error() {
                    status.state = WorkerState::Error;
                } else if !container.is_up() {
                    return status;
                } else {
                    match cache.config_ttl(self.sub.id()).await {
                        Ok(Some(ttl)) => {
                            status.config_ttl = Some(ttl.as_secs_f64());
                            status.state = WorkerState::Up;
                        }
                        Ok(None) => status.state = WorkerState::Wait,
                        Err(error) => {
                            status.error = Some(error.to_string());
                            status.state = WorkerState::Error;
                        }
                    }
                }
            }
        }

        if let Some(field) = &self.config.rate_config {
            status.rate = match cache.rate(self.sub.id(), field).await {
                Ok(None) => None,
                Ok(Some(rate)) => Some(Sampled::Value(rate)),
                Err(error) => Some(Sampled::error(error)),
            };
        }
        if let Some(url) = &self.config.rate_stats {
            status.rate_stats = self.stats_column(cache, url).await;
        }
        if let Some(url) = &self.config.latency_stats {
            status.latency_stats = self.stats_column(cache, url).await;
        }
        status
    }

    // Declared references were validated at load; a parse failure here
    // means the declaration changed underneath us and taints one column.
    async fn stats_column(
        &self,
        cache: &mut StatusCache<'_>,
        url: &str,
    ) -> Option<Sampled<f64>> {
        let url: StatsUrl = match url.parse() {
            Ok(url) => url,
            Err(error) => return Some(Sampled::error(error)),
        };
        match cache.resolve_stats(&url, self.sub.id()).await {
            Ok(None) => None,
            Ok(Some(value)) => Some(Sampled::Value(value)),
            Err(error) => Some(Sampled::error(error)),
        }
    }
}
