// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Fleet declarations.
//!
//! A fleet is declared in TOML as two tables keyed by declared name:
//! `[clients.NAME]` and `[workers.NAME]`. Unknown keys are load errors, as
//! are invalid names and malformed stats references; a declaration either
//! loads whole or not at all.

use crate::stats_url::{StatsUrl, StatsUrlError};
use close_common::{ContainerId, IdError, InstanceClass};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, thiserror::Error)]
pub enum FleetError {
    #[error("parse fleet declaration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("encode fleet declaration: {0}")]
    Encode(#[from] toml::ser::Error),

    #[error("read fleet declaration: {0}")]
    Io(#[from] std::io::Error),

    #[error("{class} {name:?}: {source}")]
    InvalidName {
        class: InstanceClass,
        name: String,
        #[source]
        source: IdError,
    },

    #[error("worker {name:?} {key}: {source}")]
    InvalidStatsUrl {
        name: String,
        key: &'static str,
        #[source]
        source: StatsUrlError,
    },

    #[error("worker {worker:?} references unknown client {client:?}")]
    UnknownClient { worker: String, client: String },
}

/// One declared client type: the networking environment a set of workers
/// runs in.
#[derive(
    Clone, Debug, Default, PartialEq, Serialize, Deserialize,
)]
#[serde(deny_unknown_fields, default)]
pub struct ClientConfig {
    /// Number of instances to keep up, named `1..=count`.
    pub count: u32,
    pub image: String,
    pub privileged: bool,
    /// Bind-mount destination inside the container. No mount if unset.
    pub volume: Option<String>,
    /// Host path the volume binds from.
    pub volume_path: Option<String>,
    /// Per-instance suffix appended to `volume_path`; `{}` is replaced
    /// with the instance name.
    pub volume_fmt_id: Option<String>,
    pub volume_readonly: bool,
}

/// One declared worker type: a set of traffic-generator instances.
#[derive(
    Clone, Debug, Default, PartialEq, Serialize, Deserialize,
)]
#[serde(deny_unknown_fields, default)]
pub struct WorkerConfig {
    /// Number of instances to keep up, named `1..=count`.
    pub count: u32,
    /// Worker implementation tag, used as the config-record module.
    /// Defaults to the declared name.
    #[serde(rename = "type", skip_serializing_if = "String::is_empty")]
    pub worker_type: String,
    pub image: String,
    pub privileged: bool,
    /// Container command; empty inherits the image entrypoint.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub command: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    /// Flag name given the instance identity, e.g. `id` for `-id=1`.
    pub id_flag: Option<String>,
    /// Declared client whose same-numbered instance's network namespace
    /// each worker joins.
    pub client: Option<String>,
    /// Config field holding the worker's target rate.
    pub rate_config: Option<String>,
    /// Stats reference for the achieved-rate status column.
    pub rate_stats: Option<String>,
    /// Stats reference for the latency status column.
    pub latency_stats: Option<String>,
}

impl WorkerConfig {
    /// The config-record module for instances of this declaration.
    pub fn module<'a>(&'a self, name: &'a str) -> &'a str {
        if self.worker_type.is_empty() {
            name
        } else {
            &self.worker_type
        }
    }
}

/// A complete fleet declaration.
#[derive(
    Clone, Debug, Default, PartialEq, Serialize, Deserialize,
)]
#[serde(deny_unknown_fields, default)]
pub struct FleetConfig {
    pub clients: BTreeMap<String, ClientConfig>,
    pub workers: BTreeMap<String, WorkerConfig>,
}

impl FleetConfig {
    pub fn from_toml(input: &str) -> Result<Self, FleetError> {
        let fleet: FleetConfig = toml::from_str(input)?;
        fleet.validate()?;
        Ok(fleet)
    }

    pub fn from_file(path: &std::path::Path) -> Result<Self, FleetError> {
        Self::from_toml(&std::fs::read_to_string(path)?)
    }

    pub fn to_toml(&self) -> Result<String, FleetError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Reject declarations the engine could only trip over later: names
    /// that cannot form container identities, stats references that do not
    /// parse, and dangling client references.
    pub fn validate(&self) -> Result<(), FleetError> {
        let check_name = |class, name: &String| {
            ContainerId::new(class, name.as_str(), "1")
                .map(drop)
                .map_err(|source| FleetError::InvalidName {
                    class,
                    name: name.clone(),
                    source,
                })
        };
        let check_url = |name: &String, key, url: &Option<String>| {
            match url.as_deref().map(str::parse::<StatsUrl>) {
                None | Some(Ok(_)) => Ok(()),
                Some(Err(source)) => Err(FleetError::InvalidStatsUrl {
                    name: name.clone(),
                    key,
                    source,
                }),
            }
        };

        for name in self.clients.keys() {
            check_name(InstanceClass::Client, name)?;
        }
        for (name, config) in &self.workers {
            check_name(InstanceClass::Worker, name)?;
            check_name(InstanceClass::Worker, &config.module(name).to_string())?;
            check_url(name, "rate_stats", &config.rate_stats)?;
            check_url(name, "latency_stats", &config.latency_stats)?;
            if let Some(client) = &config.client {
                if !self.clients.contains_key(client) {
                    return Err(FleetError::UnknownClient {
                        worker: name.clone(),
                        client: client.clone(),
                    });
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const FLEET: &str = r#"
        [clients.netem]
        count = 2
        image = "close:latest"
        privileged = true

        [workers.http]
        count = 2
        image = "close:latest"
        command = "worker"
        client = "netem"
        rate_config = "rate"
        rate_stats = "http_get/rate?instance=$"
    "#;

    #[test]
    fn parses_a_declaration() {
        let fleet = FleetConfig::from_toml(FLEET).unwrap();
        assert_eq!(fleet.clients["netem"].count, 2);
        let http = &fleet.workers["http"];
        assert_eq!(http.module("http"), "http");
        assert_eq!(http.client.as_deref(), Some("netem"));
    }

    #[test]
    fn unknown_keys_are_fatal() {
        let err = FleetConfig::from_toml(
            "[workers.http]\ncount = 1\nimagee = \"oops\"\n",
        )
        .unwrap_err();
        assert!(matches!(err, FleetError::Parse(_)));
    }

    #[test]
    fn dangling_client_reference_is_fatal() {
        let err = FleetConfig::from_toml(
            "[workers.http]\ncount = 1\nclient = \"nope\"\n",
        )
        .unwrap_err();
        assert!(matches!(err, FleetError::UnknownClient { .. }));
    }

    #[test]
    fn invalid_names_are_fatal() {
        let err = FleetConfig::from_toml("[workers.\"a-b\"]\ncount = 1\n")
            .unwrap_err();
        assert!(matches!(err, FleetError::InvalidName { .. }));

        let err = FleetConfig::from_toml(
            "[workers.http]\ncount = 1\nrate_stats = \"a/b/c\"\n",
        )
        .unwrap_err();
        assert!(matches!(err, FleetError::InvalidStatsUrl { .. }));
    }

    #[test]
    fn type_tag_overrides_module() {
        let fleet = FleetConfig::from_toml(
            "[workers.http_v2]\ncount = 1\ntype = \"http\"\n",
        )
        .unwrap();
        assert_eq!(fleet.workers["http_v2"].module("http_v2"), "http");
    }

    #[test]
    fn declaration_round_trips() {
        let fleet = FleetConfig::from_toml(FLEET).unwrap();
        let dumped = fleet.to_toml().unwrap();
        assert_eq!(FleetConfig::from_toml(&dumped).unwrap(), fleet);
    }
}
