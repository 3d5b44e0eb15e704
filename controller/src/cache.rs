// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per-request status cache.
//!
//! Assembling a status listing touches three backends per instance; done
//! naively that is O(instances) round trips to each. A [`StatusCache`]
//! lives for exactly one status request and batches the lookups:
//!
//! * in eager mode, the first container lookup lists the instance's whole
//!   class and memoizes every result, so a fleet listing costs one
//!   enumeration per class;
//! * metrics lookups always fetch the unscoped series group and memoize
//!   per instance;
//! * a filter or series group that has been listed once is never fetched
//!   again, even when the sought entry was absent (negative caching).
//!
//! The cache is never shared across requests; staleness is bounded by the
//! request that created it.

use crate::backend::{
    BackendError, ContainerBackend, ContainerFilter, ContainerStatus,
};
use crate::metrics::{MetricsError, MetricsReader, SeriesKey};
use crate::stats_url::{InstanceScope, StatsUrl};
use close_common::{ConfigId, ContainerId};
use close_config_store::{ConfigMap, ConfigStore, StoreError};
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

/// Aggregation window for status-column stats queries.
pub const STATS_WINDOW: Duration = Duration::from_secs(10);

// Field queried when a stats reference names none.
const DEFAULT_STATS_FIELD: &str = "value";

#[derive(Debug, thiserror::Error)]
pub enum StatusError {
    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Metrics(#[from] MetricsError),

    #[error("config field {field:?} of {id}: {reason}")]
    BadField { id: ConfigId, field: String, reason: String },
}

/// A status column that degrades per-entry: a failed lookup taints the
/// one value, not the whole listing.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Sampled<T> {
    Value(T),
    Error { error: String },
}

impl<T> Sampled<T> {
    pub fn error(error: impl std::fmt::Display) -> Self {
        Sampled::Error { error: error.to_string() }
    }
}

impl<T> From<Result<T, StatusError>> for Sampled<T> {
    fn from(result: Result<T, StatusError>) -> Self {
        match result {
            Ok(value) => Sampled::Value(value),
            Err(error) => Sampled::error(error),
        }
    }
}

/// Memoizing view over the three status backends, scoped to one request.
pub struct StatusCache<'a> {
    backend: &'a dyn ContainerBackend,
    store: &'a dyn ConfigStore,
    metrics: &'a dyn MetricsReader,
    eager: bool,

    containers: BTreeMap<ContainerId, ContainerStatus>,
    listed: BTreeSet<String>,
    configs: BTreeMap<ConfigId, Option<ConfigMap>>,
    ttls: BTreeMap<ConfigId, Option<Duration>>,
    // (series, field, instance) -> mean
    series: BTreeMap<(String, String, String), f64>,
    series_listed: BTreeSet<(String, String)>,
}

impl<'a> StatusCache<'a> {
    pub fn new(
        backend: &'a dyn ContainerBackend,
        store: &'a dyn ConfigStore,
        metrics: &'a dyn MetricsReader,
        eager: bool,
    ) -> Self {
        Self {
            backend,
            store,
            metrics,
            eager,
            containers: BTreeMap::new(),
            listed: BTreeSet::new(),
            configs: BTreeMap::new(),
            ttls: BTreeMap::new(),
            series: BTreeMap::new(),
            series_listed: BTreeSet::new(),
        }
    }

    /// Container status by identity; `None` if no such container exists.
    pub async fn container_status(
        &mut self,
        id: &ContainerId,
    ) -> Result<Option<ContainerStatus>, BackendError> {
        if let Some(status) = self.containers.get(id) {
            return Ok(Some(status.clone()));
        }

        let filter = if self.eager {
            ContainerFilter::class(id.class)
        } else {
            ContainerFilter::exact(id)
        };
        if self.listed.contains(&filter.cache_key()) {
            return Ok(None);
        }

        for status in self.backend.list(&filter).await? {
            self.containers.insert(status.id.clone(), status);
        }
        self.listed.insert(filter.cache_key());
        Ok(self.containers.get(id).cloned())
    }

    /// Config record by identity; `None` if absent or expired.
    pub async fn config(
        &mut self,
        id: &ConfigId,
    ) -> Result<Option<ConfigMap>, StoreError> {
        if let Some(record) = self.configs.get(id) {
            return Ok(record.clone());
        }
        let record = self.store.get_record(id).await?;
        self.configs.insert(id.clone(), record.clone());
        Ok(record)
    }

    /// Remaining registration liveness; `None` if lapsed or absent.
    pub async fn config_ttl(
        &mut self,
        id: &ConfigId,
    ) -> Result<Option<Duration>, StoreError> {
        if let Some(ttl) = self.ttls.get(id) {
            return Ok(*ttl);
        }
        let ttl = self.store.ttl_remaining(id).await?;
        self.ttls.insert(id.clone(), ttl);
        Ok(ttl)
    }

    /// Mean of one series field for one instance tag over the stats
    /// window. The first lookup of a (series, field) group fetches every
    /// instance's aggregate in one query.
    pub async fn series_mean(
        &mut self,
        series: &str,
        field: &str,
        instance: &str,
    ) -> Result<Option<f64>, MetricsError> {
        let entry =
            (series.to_string(), field.to_string(), instance.to_string());
        if let Some(mean) = self.series.get(&entry) {
            return Ok(Some(*mean));
        }

        let group = (series.to_string(), field.to_string());
        if self.series_listed.contains(&group) {
            return Ok(None);
        }

        let stats = self
            .metrics
            .get_stats(&SeriesKey::new(series), field, STATS_WINDOW)
            .await?;
        for stat in stats {
            let instance = stat.key.instance.unwrap_or_default();
            self.series.insert(
                (series.to_string(), field.to_string(), instance),
                stat.mean,
            );
        }
        self.series_listed.insert(group);
        Ok(self.series.get(&entry).copied())
    }

    /// Resolve a declared stats reference for the instance `own`.
    pub async fn resolve_stats(
        &mut self,
        url: &StatsUrl,
        own: &ConfigId,
    ) -> Result<Option<f64>, StatusError> {
        let field = url.field.as_deref().unwrap_or(DEFAULT_STATS_FIELD);
        let instance = match &url.scope {
            // An unscoped reference reads the untagged series.
            InstanceScope::None => String::new(),
            InstanceScope::Literal(value) => value.clone(),
            InstanceScope::Own => own.to_string(),
            InstanceScope::ConfigField(name) => {
                match self.config(own).await?.and_then(|mut record| {
                    record.remove(name.as_str())
                }) {
                    Some(Value::String(value)) => value,
                    Some(other) => {
                        return Err(StatusError::BadField {
                            id: own.clone(),
                            field: name.clone(),
                            reason: format!("expected string, got {other}"),
                        })
                    }
                    None => return Ok(None),
                }
            }
        };
        Ok(self.series_mean(&url.series, field, &instance).await?)
    }

    /// Decode the instance's declared rate field. `None` if the record is
    /// gone; a non-integer or negative value is an error, never a zero.
    pub async fn rate(
        &mut self,
        id: &ConfigId,
        field: &str,
    ) -> Result<Option<u64>, StatusError> {
        let Some(record) = self.config(id).await? else {
            return Ok(None);
        };
        match record.get(field) {
            Some(Value::Number(n)) => match n.as_u64() {
                Some(rate) => Ok(Some(rate)),
                None => Err(StatusError::BadField {
                    id: id.clone(),
                    field: field.to_string(),
                    reason: format!("expected non-negative integer, got {n}"),
                }),
            },
            Some(other) => Err(StatusError::BadField {
                id: id.clone(),
                field: field.to_string(),
                reason: format!("expected non-negative integer, got {other}"),
            }),
            None => Err(StatusError::BadField {
                id: id.clone(),
                field: field.to_string(),
                reason: "missing".to_string(),
            }),
        }
    }
}
