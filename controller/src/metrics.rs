// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Read-only view of the metrics database.
//!
//! Workers push their own samples directly; the controller only reads
//! recent aggregates to decorate status listings. Series are identified by
//! measurement name plus optional `hostname` and `instance` tags.

use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
    #[error("metrics backend: {0}")]
    Backend(String),
}

/// Identity of one time series: measurement plus tag scoping. `None` tags
/// match every value of that tag.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SeriesKey {
    pub series: String,
    pub hostname: Option<String>,
    pub instance: Option<String>,
}

impl SeriesKey {
    pub fn new(series: impl Into<String>) -> Self {
        Self { series: series.into(), ..Self::default() }
    }
}

/// Aggregates of one field over the queried window, one entry per distinct
/// tag combination.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SeriesStats {
    pub key: SeriesKey,
    pub field: String,
    pub mean: f64,
    pub min: f64,
    pub max: f64,
    pub last: f64,
}

/// Aggregate queries against the metrics database.
#[async_trait]
pub trait MetricsReader: Send + Sync + 'static {
    /// Aggregate `field` of every series matching `key` over the trailing
    /// `window`. One result per distinct tag combination; series with no
    /// samples in the window are omitted.
    async fn get_stats(
        &self,
        key: &SeriesKey,
        field: &str,
        window: Duration,
    ) -> Result<Vec<SeriesStats>, MetricsError>;
}
