// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Container backend interface.
//!
//! The reconciliation engine drives the fleet through [`ContainerBackend`];
//! the sim implementation lives in [`crate::sim`], a real one wraps a
//! container engine API. Containers are identified by
//! [`ContainerId`](close_common::ContainerId) name and labels, and the
//! engine decides create-vs-reuse with [`ContainerConfig::satisfied_by`].

use async_trait::async_trait;
use close_common::{ContainerId, Env, IdError, InstanceClass};
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("container {id}: {reason}")]
    Failed { id: ContainerId, reason: String },

    #[error("container backend: {0}")]
    Backend(String),

    #[error(transparent)]
    Id(#[from] IdError),
}

/// A bind mount, exact-match in [`ContainerConfig::satisfied_by`].
#[derive(
    Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize,
)]
pub struct Mount {
    pub source: String,
    pub destination: String,
    pub read_only: bool,
}

/// Desired (or inspected) configuration of one container.
///
/// An empty `command` or `network_mode` means "inherit the image /
/// backend default" on the desired side, and equality treats it as
/// don't-care; see [`ContainerConfig::satisfied_by`].
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ContainerConfig {
    pub image: String,
    pub command: String,
    pub args: Vec<String>,
    pub env: Env,
    pub privileged: bool,
    pub mounts: Vec<Mount>,
    pub network_mode: String,
}

impl ContainerConfig {
    /// Append a `-{name}={value}` flag to the argument list.
    pub fn add_flag(&mut self, name: &str, value: impl std::fmt::Display) {
        self.args.push(format!("-{name}={value}"));
    }

    pub fn add_mount(
        &mut self,
        source: impl Into<String>,
        destination: impl Into<String>,
        read_only: bool,
    ) {
        self.mounts.push(Mount {
            source: source.into(),
            destination: destination.into(),
            read_only,
        });
    }

    /// Join the network namespace of another managed container.
    pub fn set_network_container(&mut self, id: &ContainerId) {
        self.network_mode = format!("container:{id}");
    }

    /// Whether a running container with config `actual` satisfies this
    /// desired config, so it can be reused instead of replaced.
    ///
    /// Deliberately asymmetric:
    ///
    /// * empty desired `command` inherits the image entrypoint, and then
    ///   the actual command and args are not compared;
    /// * with a desired command set, command and args must match exactly;
    /// * desired env must be a subset of actual env (images inject their
    ///   own variables);
    /// * mounts and privileged must match exactly;
    /// * empty desired `network_mode` accepts whatever the backend chose.
    pub fn satisfied_by(&self, actual: &ContainerConfig) -> bool {
        if self.image != actual.image {
            return false;
        }
        if !self.command.is_empty()
            && (actual.command != self.command || actual.args != self.args)
        {
            return false;
        }
        if !self.env.is_subset(&actual.env) {
            return false;
        }
        if self.privileged != actual.privileged {
            return false;
        }
        if self.mounts != actual.mounts {
            return false;
        }
        if !self.network_mode.is_empty()
            && actual.network_mode != self.network_mode
        {
            return false;
        }
        true
    }
}

/// Coarse container run state, as reported by the backend.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum::Display,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ContainerState {
    Created,
    Running,
    Paused,
    Restarting,
    Exited,
    Dead,
}

impl ContainerState {
    pub fn is_up(&self) -> bool {
        matches!(
            self,
            ContainerState::Running
                | ContainerState::Paused
                | ContainerState::Restarting
        )
    }
}

/// One enumerated container.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ContainerStatus {
    pub id: ContainerId,
    /// Backend-assigned container id (not the name).
    pub container_id: String,
    /// Node hosting the container, for clustered backends.
    pub node: Option<String>,
    /// Human-readable status line from the backend.
    pub status: String,
    pub state: ContainerState,
    pub exit_code: i32,
}

impl ContainerStatus {
    pub fn is_up(&self) -> bool {
        self.state.is_up()
    }

    /// An exited container that did not exit cleanly.
    pub fn is_error(&self) -> bool {
        self.state == ContainerState::Exited && self.exit_code != 0
    }
}

/// Status plus inspected config.
#[derive(Clone, Debug, PartialEq)]
pub struct Container {
    pub status: ContainerStatus,
    pub config: ContainerConfig,
}

/// Enumeration filter over the managed-container namespace. Empty fields
/// match everything.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ContainerFilter {
    pub class: Option<InstanceClass>,
    pub module: Option<String>,
    pub instance: Option<String>,
}

impl ContainerFilter {
    pub fn class(class: InstanceClass) -> Self {
        Self { class: Some(class), ..Self::default() }
    }

    pub fn exact(id: &ContainerId) -> Self {
        Self {
            class: Some(id.class),
            module: Some(id.module.clone()),
            instance: Some(id.instance.clone()),
        }
    }

    pub fn matches(&self, id: &ContainerId) -> bool {
        self.class.map_or(true, |class| class == id.class)
            && self.module.as_deref().map_or(true, |m| m == id.module)
            && self.instance.as_deref().map_or(true, |i| i == id.instance)
    }

    /// Canonical key for memoizing which filters have been listed.
    pub fn cache_key(&self) -> String {
        format!(
            "{}/{}/{}",
            self.class.map(|c| c.label()).unwrap_or(""),
            self.module.as_deref().unwrap_or(""),
            self.instance.as_deref().unwrap_or(""),
        )
    }
}

/// Operations the reconciliation engine needs from a container engine.
///
/// All operations are scoped to containers carrying the management label.
/// Enumeration skips containers whose class label is unknown (logged by
/// the implementation), but fails hard on a name/label identity mismatch:
/// that is corruption, not foreign traffic.
#[async_trait]
pub trait ContainerBackend: Send + Sync + 'static {
    /// Enumerate managed containers matching the filter, in any state.
    async fn list(
        &self,
        filter: &ContainerFilter,
    ) -> Result<Vec<ContainerStatus>, BackendError>;

    /// Inspect one container by identity.
    async fn get(
        &self,
        id: &ContainerId,
    ) -> Result<Option<Container>, BackendError>;

    /// Bring the container up: reuse it if its inspected config satisfies
    /// `config`, replace it otherwise, and ensure it is started.
    async fn up(
        &self,
        id: &ContainerId,
        config: ContainerConfig,
    ) -> Result<(), BackendError>;

    /// Stop the container. A no-op if it is absent or already stopped.
    async fn down(&self, id: &ContainerId) -> Result<(), BackendError>;

    /// Remove the (stopped) container. A no-op if it is absent.
    async fn clean(&self, id: &ContainerId) -> Result<(), BackendError>;

    /// Kill every managed container, regardless of bookkeeping. The big
    /// red button for a fleet gone rogue.
    async fn panic_kill(&self) -> Result<(), BackendError>;
}
