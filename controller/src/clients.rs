// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Tracked client instances.
//!
//! A client is a networking environment (typically privileged, running a
//! VPN or netem setup) whose namespace same-numbered workers join. Clients
//! have no config-store record; their status is container state alone.

use crate::backend::ContainerConfig;
use crate::cache::StatusCache;
use crate::fleet::ClientConfig;
use close_common::{ContainerId, IdError, InstanceClass};
use serde::Serialize;
use std::sync::Arc;

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Serialize, strum::Display,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ClientState {
    Up,
    Down,
    Error,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ClientStatus {
    /// Declared client name.
    pub config: String,
    pub instance: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container: Option<String>,
    pub container_status: String,
    pub state: ClientState,
}

/// One tracked client instance.
pub(crate) struct Client {
    pub config: Arc<ClientConfig>,
    pub name: String,
    pub instance: String,
    pub id: ContainerId,
    /// Reconciliation mark; instances left unmarked get swept.
    pub up: bool,
}

impl Client {
    pub(crate) fn new(
        name: &str,
        config: Arc<ClientConfig>,
        instance: String,
    ) -> Result<Self, IdError> {
        let id =
            ContainerId::new(InstanceClass::Client, name, instance.as_str())?;
        Ok(Self { config, name: name.to_string(), instance, id, up: false })
    }

    pub(crate) fn container_config(&self) -> ContainerConfig {
        let mut config = ContainerConfig {
            image: self.config.image.clone(),
            privileged: self.config.privileged,
            ..Default::default()
        };
        config
            .env
            .add("CLOSE_INSTANCE", format!("{}:{}", self.name, self.instance));
        if let Some(volume) = &self.config.volume {
            let mut source =
                self.config.volume_path.clone().unwrap_or_default();
            if let Some(fmt) = &self.config.volume_fmt_id {
                source.push_str(&fmt.replace("{}", &self.instance));
            }
            config.add_mount(
                source,
                volume.clone(),
                self.config.volume_readonly,
            );
        }
        config
    }

    pub(crate) async fn status(
        &self,
        cache: &mut StatusCache<'_>,
    ) -> ClientStatus {
        let mut status = ClientStatus {
            config: self.name.clone(),
            instance: self.instance.clone(),
            container: None,
            container_status: String::new(),
            state: ClientState::Down,
        };

        match cache.container_status(&self.id).await {
            Err(error) => {
                status.container_status = format!("error: {error}");
                status.state = ClientState::Error;
            }
            Ok(None) => {}
            Ok(Some(container)) => {
                status.state = if container.is_error() {
                    ClientState::Error
                } else if container.is_up() {
                    ClientState::Up
                } else {
                    ClientState::Down
                };
                status.container = Some(container.container_id);
                status.container_status = container.status;
            }
        }
        status
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn container_config_mounts_the_volume() {
        let config = Arc::new(ClientConfig {
            count: 2,
            image: "close:latest".to_string(),
            privileged: true,
            volume: Some("/vpn".to_string()),
            volume_path: Some("/srv/vpn".to_string()),
            volume_fmt_id: Some("/peer{}".to_string()),
            volume_readonly: true,
        });
        let client = Client::new("vpn", config, "2".to_string()).unwrap();
        assert_eq!(client.id.to_string(), "close-client-vpn-2");

        let container = client.container_config();
        assert!(container.privileged);
        assert_eq!(container.mounts.len(), 1);
        assert_eq!(container.mounts[0].source, "/srv/vpn/peer2");
        assert_eq!(container.mounts[0].destination, "/vpn");
        assert!(container.mounts[0].read_only);
    }

    #[test]
    fn container_config_without_volume() {
        let config = Arc::new(ClientConfig {
            count: 1,
            image: "close:latest".to_string(),
            ..Default::default()
        });
        let client = Client::new("plain", config, "1".to_string()).unwrap();
        assert!(client.container_config().mounts.is_empty());
    }
}
