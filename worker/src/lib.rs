// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Worker-side runtime for close traffic generators.
//!
//! A traffic generator implements [`Worker`] plus whichever optional
//! capabilities it supports. Capabilities are declared explicitly (a
//! `config_capability()` returning `Some`) and the harness checks for each
//! one before using it; a worker without a capability gets well-defined
//! no-op behavior instead of implicit interface magic.
//!
//! [`harness::WorkerRuntime`] ties a worker to its config-store
//! registration: it owns the worker on a single task, applies pushed
//! patches one at a time, and tears the registration down on shutdown.

use close_config_store::{ConfigMap, PushError};

pub mod dummy;
pub mod harness;

pub use dummy::DummyWorker;
pub use harness::{apply_loop, HarnessError, WorkerRuntime};

/// Record fields fixed at registration time; a patch may repeat them with
/// the same value, but never change them.
pub const IMMUTABLE_FIELDS: &[&str] = &["type", "instance"];

/// A pluggable traffic generator.
///
/// The trait itself is deliberately small; optional behavior hangs off the
/// capability accessors, which default to "not supported".
pub trait Worker: Send + 'static {
    /// Live configuration support: expose the materialized config and
    /// apply partial updates. Workers without this capability reject
    /// every push as unsupported.
    fn config_capability(&mut self) -> Option<&mut dyn ConfigCapable> {
        None
    }

    /// Graceful-stop support, invoked when the harness shuts down.
    fn stop_capability(&mut self) -> Option<&mut dyn StopCapable> {
        None
    }
}

pub trait ConfigCapable {
    /// The full materialized config record, including identity fields.
    fn config(&self) -> ConfigMap;

    /// Apply a partial update. Identity-field immutability is enforced by
    /// the harness before this is called.
    fn apply(&mut self, patch: &ConfigMap) -> Result<(), PushError>;
}

pub trait StopCapable {
    fn stop(&mut self);
}
