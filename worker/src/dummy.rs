// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The trivial worker: no traffic, just a rate knob.
//!
//! Exists to exercise registration and push/apply end to end, both in
//! tests and as a deployable no-op generator.

use crate::{ConfigCapable, StopCapable, Worker};
use close_common::ConfigId;
use close_config_store::{ConfigMap, PushError};
use serde_json::Value;

pub struct DummyWorker {
    id: ConfigId,
    rate: u64,
    stopped: bool,
}

impl DummyWorker {
    pub fn new(id: ConfigId) -> Self {
        Self { id, rate: 0, stopped: false }
    }

    pub fn rate(&self) -> u64 {
        self.rate
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }
}

impl Worker for DummyWorker {
    fn config_capability(&mut self) -> Option<&mut dyn ConfigCapable> {
        Some(self)
    }

    fn stop_capability(&mut self) -> Option<&mut dyn StopCapable> {
        Some(self)
    }
}

impl ConfigCapable for DummyWorker {
    fn config(&self) -> ConfigMap {
        let mut map = ConfigMap::new();
        map.insert("type".to_string(), self.id.module().into());
        map.insert("instance".to_string(), self.id.instance().into());
        map.insert("rate".to_string(), self.rate.into());
        map
    }

    fn apply(&mut self, patch: &ConfigMap) -> Result<(), PushError> {
        for (field, value) in patch {
            match field.as_str() {
                // identity fields were vetted by the harness
                "type" | "instance" => {}
                "rate" => match value {
                    Value::Number(n) if n.as_u64().is_some() => {
                        self.rate = n.as_u64().unwrap_or(0);
                    }
                    other => {
                        return Err(PushError::InvalidValue {
                            field: field.clone(),
                            reason: format!(
                                "expected non-negative integer, got {other}"
                            ),
                        });
                    }
                },
                _ => {
                    return Err(PushError::InvalidValue {
                        field: field.clone(),
                        reason: "unknown field".to_string(),
                    });
                }
            }
        }
        Ok(())
    }
}

impl StopCapable for DummyWorker {
    fn stop(&mut self) {
        self.stopped = true;
    }
}
