// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Shared types for the close load-testing platform.
//!
//! Everything here is consumed by both the control plane
//! (`close-controller`) and the worker runtime (`close-worker`): validated
//! instance identities and the sorted environment list used for container
//! config comparison.

pub mod env;
pub mod id;

pub use env::Env;
pub use id::{ConfigId, ContainerId, IdError, InstanceClass};
