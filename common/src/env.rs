// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Sorted container environment lists.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A container environment: `NAME=value` strings, kept sorted.
///
/// Sorting makes the subset comparison a single merge walk, which is what
/// container config comparison needs: a desired environment matches a
/// running container if the running container carries at least those
/// variables (images inject extras of their own).
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Env(Vec<String>);

impl Env {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, name: &str, value: impl fmt::Display) {
        self.0.push(format!("{}={}", name, value));
        self.0.sort();
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    /// Returns true if every entry of `self` appears in `other`.
    pub fn is_subset(&self, other: &Env) -> bool {
        if self.0.len() > other.0.len() {
            return false;
        }
        let mut i = 0;
        for entry in &other.0 {
            match self.0.get(i) {
                None => return true,
                Some(want) if want == entry => i += 1,
                Some(want) if want < entry => return false,
                Some(_) => continue,
            }
        }
        i == self.0.len()
    }
}

impl FromIterator<String> for Env {
    fn from_iter<T: IntoIterator<Item = String>>(iter: T) -> Self {
        let mut values: Vec<String> = iter.into_iter().collect();
        values.sort();
        Self(values)
    }
}

impl<const N: usize> From<[&str; N]> for Env {
    fn from(values: [&str; N]) -> Self {
        values.iter().map(|s| s.to_string()).collect()
    }
}
