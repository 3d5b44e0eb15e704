// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The stats-reference mini-language used in fleet declarations.
//!
//! A reference has the shape `series[/field][?instance=SCOPE]`:
//!
//! * `series` names the measurement, `field` the aggregated field
//!   (defaulting to the reader's choice when omitted);
//! * `?instance=$` scopes the query to the instance being listed;
//! * `?instance=$name` scopes it to the value of config field `name` of
//!   the instance's own record;
//! * `?instance=foo` scopes it to the literal tag value `foo`;
//! * no query leaves the series unscoped.
//!
//! References are validated when the fleet declaration is loaded, so a
//! typo is a load error rather than a permanently-degraded status column.

use std::fmt;
use std::str::FromStr;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum StatsUrlError {
    #[error("empty stats reference")]
    Empty,

    #[error("bad stats path {0:?}: expected series[/field]")]
    BadPath(String),

    #[error("bad stats query {0:?}: expected instance=SCOPE")]
    BadQuery(String),
}

/// Instance scoping of a stats reference.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum InstanceScope {
    /// No instance filter; the query sees every instance's series.
    #[default]
    None,
    /// A literal instance tag value.
    Literal(String),
    /// The identity of the instance whose status is being assembled.
    Own,
    /// The value of the named field in the instance's own config record.
    ConfigField(String),
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StatsUrl {
    pub series: String,
    pub field: Option<String>,
    pub scope: InstanceScope,
}

fn valid_component(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

impl FromStr for StatsUrl {
    type Err = StatsUrlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(StatsUrlError::Empty);
        }

        let (path, query) = match s.split_once('?') {
            Some((path, query)) => (path, Some(query)),
            None => (s, None),
        };

        let (series, field) = match path.split_once('/') {
            Some((series, field)) => (series, Some(field)),
            None => (path, None),
        };
        if !valid_component(series)
            || field.is_some_and(|f| !valid_component(f))
        {
            return Err(StatsUrlError::BadPath(path.to_string()));
        }

        let scope = match query {
            None => InstanceScope::None,
            Some(query) => match query.split_once('=') {
                Some(("instance", value)) if !value.is_empty() => {
                    match value.strip_prefix('$') {
                        None => InstanceScope::Literal(value.to_string()),
                        Some("") => InstanceScope::Own,
                        Some(field) => {
                            InstanceScope::ConfigField(field.to_string())
                        }
                    }
                }
                _ => return Err(StatsUrlError::BadQuery(query.to_string())),
            },
        };

        Ok(StatsUrl {
            series: series.to_string(),
            field: field.map(str::to_string),
            scope,
        })
    }
}

impl fmt::Display for StatsUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.series)?;
        if let Some(field) = &self.field {
            write!(f, "/{field}")?;
        }
        match &self.scope {
            InstanceScope::None => Ok(()),
            InstanceScope::Literal(value) => write!(f, "?instance={value}"),
            InstanceScope::Own => f.write_str("?instance=$"),
            InstanceScope::ConfigField(field) => {
                write!(f, "?instance=${field}")
            }
        }
    }
}
