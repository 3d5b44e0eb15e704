// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The close configuration store.
//!
//! Running worker instances register their configuration here as flat
//! records with a liveness TTL; the control plane reads them back and
//! pushes partial updates that the owning worker applies live. See
//! [`store::ConfigStore`] for the storage surface, [`sub`] for the
//! registration/keepalive protocol, and [`push`] for the one-shot
//! request/reply used to apply updates.

use std::time::Duration;

pub mod push;
pub mod store;
pub mod sub;

pub use push::{push_and_wait, ConfigPush, PushError};
pub use store::{ConfigStore, MemoryStore, StoreError};
pub use sub::{Registration, SubError, SubHandle};

/// A flat, string-keyed configuration record. No nested structures.
pub type ConfigMap = serde_json::Map<String, serde_json::Value>;

/// Liveness window for a registered config record.
pub const REGISTRATION_TTL: Duration = Duration::from_secs(10);

/// Keepalive refresh period; must stay at or below half the TTL so a
/// record is always refreshed before it lapses.
pub const KEEPALIVE_PERIOD: Duration = Duration::from_secs(5);
