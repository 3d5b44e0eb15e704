// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Instance identities.
//!
//! Two identity forms exist, and they round-trip into each other:
//!
//! * [`ConfigId`] names one config-store record as `module/instance`.
//! * [`ContainerId`] names one backend container as the triple
//!   `(class, module, instance)`, rendered as the container name
//!   `close-{class}-{module}-{instance}` plus a label map.
//!
//! Identity components are validated at construction and never silently
//! repaired.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Label carried by every container managed by this platform; its value is
/// the instance class.
pub const MANAGEMENT_LABEL: &str = "close";
/// Label carrying the module (declared type) name.
pub const TYPE_LABEL: &str = "close.type";
/// Label carrying the instance name.
pub const INSTANCE_LABEL: &str = "close.instance";

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum IdError {
    #[error("invalid module name: {0:?}")]
    InvalidModule(String),

    #[error("invalid instance name: {0:?}")]
    InvalidInstance(String),

    #[error("malformed id: {0:?}")]
    Malformed(String),

    #[error("unknown class: {0:?}")]
    UnknownClass(String),

    #[error("missing container label: {0:?}")]
    MissingLabel(&'static str),

    #[error("container name {name:?} does not match labels ({labels})")]
    NameMismatch { name: String, labels: ContainerId },
}

fn valid_module(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn valid_instance(s: &str) -> bool {
    !s.is_empty()
        && s.chars().all(|c| {
            c.is_ascii_alphanumeric() || c == '_' || c == ':' || c == '-'
        })
}

/// Identity of one config-store record: `module/instance`.
///
/// `module` is restricted to `[A-Za-z0-9_]`, `instance` to `[A-Za-z0-9_:-]`.
#[derive(
    Clone,
    Debug,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
)]
#[serde(try_from = "String", into = "String")]
pub struct ConfigId {
    module: String,
    instance: String,
}

impl ConfigId {
    pub fn new(
        module: impl Into<String>,
        instance: impl Into<String>,
    ) -> Result<Self, IdError> {
        let module = module.into();
        let instance = instance.into();
        if !valid_module(&module) {
            return Err(IdError::InvalidModule(module));
        }
        if !valid_instance(&instance) {
            return Err(IdError::InvalidInstance(instance));
        }
        Ok(Self { module, instance })
    }

    pub fn module(&self) -> &str {
        &self.module
    }

    pub fn instance(&self) -> &str {
        &self.instance
    }
}

impl fmt::Display for ConfigId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.module, self.instance)
    }
}

impl FromStr for ConfigId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('/') {
            Some((module, instance)) => Self::new(module, instance),
            None => Err(IdError::Malformed(s.to_string())),
        }
    }
}

impl TryFrom<String> for ConfigId {
    type Error = IdError;

    fn try_from(s: String) -> Result<Self, IdError> {
        s.parse()
    }
}

impl From<ConfigId> for String {
    fn from(id: ConfigId) -> String {
        id.to_string()
    }
}

/// Class of a managed container.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum InstanceClass {
    /// A networking environment for workers to run in.
    Client,
    /// A traffic generator.
    Worker,
}

impl InstanceClass {
    pub fn label(&self) -> &'static str {
        match self {
            InstanceClass::Client => "client",
            InstanceClass::Worker => "worker",
        }
    }
}

impl fmt::Display for InstanceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for InstanceClass {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "client" => Ok(InstanceClass::Client),
            "worker" => Ok(InstanceClass::Worker),
            other => Err(IdError::UnknownClass(other.to_string())),
        }
    }
}

/// Identity of one backend container.
///
/// The string form is the container name; the label map is written to the
/// backend on creation and decoded back on enumeration. Decoding fails hard
/// if the name and labels disagree.
#[derive(
    Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct ContainerId {
    pub class: InstanceClass,
    pub module: String,
    pub instance: String,
}

impl ContainerId {
    pub fn new(
        class: InstanceClass,
        module: impl Into<String>,
        instance: impl Into<String>,
    ) -> Result<Self, IdError> {
        // Same character sets as the config-store identity.
        let id = ConfigId::new(module, instance)?;
        Ok(Self { class, module: id.module, instance: id.instance })
    }

    /// The config-store identity derived from this container identity.
    pub fn config_id(&self) -> ConfigId {
        ConfigId {
            module: self.module.clone(),
            instance: self.instance.clone(),
        }
    }

    pub fn labels(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            (MANAGEMENT_LABEL.to_string(), self.class.label().to_string()),
            (TYPE_LABEL.to_string(), self.module.clone()),
            (INSTANCE_LABEL.to_string(), self.instance.clone()),
        ])
    }

    /// Decode an identity from a container name and label map.
    ///
    /// The name may carry a `/node/name` path prefix (clustered backends
    /// prepend the node); only the last path component is compared.
    pub fn from_labels(
        name: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<Self, IdError> {
        let get = |key: &'static str| {
            labels
                .get(key)
                .filter(|v| !v.is_empty())
                .ok_or(IdError::MissingLabel(key))
        };

        let class = get(MANAGEMENT_LABEL)?.parse::<InstanceClass>()?;
        let id = ContainerId::new(class, get(TYPE_LABEL)?, get(INSTANCE_LABEL)?)?;

        let name = name.rsplit('/').next().unwrap_or(name);
        if name != id.to_string() {
            return Err(IdError::NameMismatch {
                name: name.to_string(),
                labels: id,
            });
        }

        Ok(id)
    }
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "close-{}-{}-{}", self.class, self.module, self.instance)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn config_id_round_trip() {
        let id = ConfigId::new("udp_send", "1").unwrap();
        assert_eq!(id.to_string(), "udp_send/1");
        assert_eq!(id.to_string().parse::<ConfigId>().unwrap(), id);

        let id = ConfigId::new("dns", "client-2:a").unwrap();
        assert_eq!(id.to_string().parse::<ConfigId>().unwrap(), id);
    }

    #[test]
    fn config_id_rejects_bad_chars() {
        assert_eq!(
            ConfigId::new("udp/send", "1"),
            Err(IdError::InvalidModule("udp/send".to_string()))
        );
        assert_eq!(
            ConfigId::new("udp", "a/b"),
            Err(IdError::InvalidInstance("a/b".to_string()))
        );
        assert_eq!(
            ConfigId::new("", "1"),
            Err(IdError::InvalidModule("".to_string()))
        );
        assert!("udp-send".parse::<ConfigId>().is_err());
    }

    #[test]
    fn container_name() {
        let id =
            ContainerId::new(InstanceClass::Worker, "http", "3").unwrap();
        assert_eq!(id.to_string(), "close-worker-http-3");
        assert_eq!(id.config_id().to_string(), "http/3");
    }

    #[test]
    fn labels_round_trip() {
        let id =
            ContainerId::new(InstanceClass::Client, "netem", "2").unwrap();
        let decoded =
            ContainerId::from_labels(&id.to_string(), &id.labels()).unwrap();
        assert_eq!(decoded, id);

        // node-prefixed names decode too
        let decoded = ContainerId::from_labels(
            &format!("/node1/{}", id),
            &id.labels(),
        )
        .unwrap();
        assert_eq!(decoded, id);
    }

    #[test]
    fn labels_mismatch_is_fatal() {
        let id =
            ContainerId::new(InstanceClass::Client, "netem", "2").unwrap();
        let err =
            ContainerId::from_labels("close-client-netem-3", &id.labels())
                .unwrap_err();
        assert!(matches!(err, IdError::NameMismatch { .. }));
    }

    #[test]
    fn labels_missing_or_unknown() {
        let id =
            ContainerId::new(InstanceClass::Client, "netem", "2").unwrap();
        let mut labels = id.labels();
        labels.remove(INSTANCE_LABEL);
        assert_eq!(
            ContainerId::from_labels(&id.to_string(), &labels),
            Err(IdError::MissingLabel(INSTANCE_LABEL))
        );

        let mut labels = id.labels();
        labels.insert(MANAGEMENT_LABEL.to_string(), "proxy".to_string());
        assert_eq!(
            ContainerId::from_labels(&id.to_string(), &labels),
            Err(IdError::UnknownClass("proxy".to_string()))
        );
    }
}
