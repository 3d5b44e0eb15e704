// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Storage surface for the configuration registry.
//!
//! The surface is Redis-shaped: record read/write, per-key expiry, a
//! module-level sorted index scored by expiry time, a module set, and
//! key-based publish/subscribe. Any store providing these operations can
//! back the registry; [`MemoryStore`] is the in-process implementation
//! used by tests and single-node deployments.

use crate::{ConfigMap, REGISTRATION_TTL};
use async_trait::async_trait;
use close_common::ConfigId;
use slog::{o, Logger};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store backend: {0}")]
    Backend(String),

    #[error("invalid record {id}: {reason}")]
    InvalidRecord { id: ConfigId, reason: String },
}

/// Storage operations used by the configuration registry.
///
/// Record keys live under `prefix/module/instance`. Errors are returned to
/// the caller as-is; implementations must not retry internally.
///
/// Expiry deadlines and index scores are monotonic instants; networked
/// implementations translate them to their own absolute-time expiry
/// primitives.
#[async_trait]
pub trait ConfigStore: Send + Sync + 'static {
    /// Key prefix for all records held by this store connection.
    fn prefix(&self) -> &str;

    /// Write (replace) a record.
    async fn put_record(
        &self,
        id: &ConfigId,
        record: &ConfigMap,
    ) -> Result<(), StoreError>;

    /// Fetch a record. Expired records read as absent.
    async fn get_record(
        &self,
        id: &ConfigId,
    ) -> Result<Option<ConfigMap>, StoreError>;

    async fn delete_record(&self, id: &ConfigId) -> Result<(), StoreError>;

    /// Set the record's expiry deadline. A no-op if the record is absent.
    async fn expire_at(
        &self,
        id: &ConfigId,
        deadline: Instant,
    ) -> Result<(), StoreError>;

    /// Remaining time before the record expires. `None` if the record is
    /// absent, already expired, or has never been given an expiry.
    async fn ttl_remaining(
        &self,
        id: &ConfigId,
    ) -> Result<Option<Duration>, StoreError>;

    /// Add (or re-score) the record in its module's sorted index.
    async fn index_add(
        &self,
        id: &ConfigId,
        expires: Instant,
    ) -> Result<(), StoreError>;

    async fn index_remove(&self, id: &ConfigId) -> Result<(), StoreError>;

    /// Enumerate the module's index members whose expiry score is no older
    /// than one TTL in the past. A member lapses out of this listing only
    /// after its owner has stopped refreshing for a while; readers use
    /// [`ConfigStore::ttl_remaining`] to tell live from lapsed.
    async fn live_instances(
        &self,
        module: &str,
    ) -> Result<Vec<ConfigId>, StoreError>;

    /// Add the module to the top-level module set.
    async fn register_module(&self, module: &str) -> Result<(), StoreError>;

    /// List all modules ever registered.
    async fn modules(&self) -> Result<Vec<String>, StoreError>;

    /// Publish a payload to the record's notification channel, returning
    /// the number of live subscribers it reached.
    async fn publish(
        &self,
        id: &ConfigId,
        payload: Vec<u8>,
    ) -> Result<usize, StoreError>;

    /// Subscribe to the record's notification channel. The stream ends
    /// when the receiver is dropped or the store connection goes away.
    async fn subscribe(
        &self,
        id: &ConfigId,
    ) -> Result<mpsc::Receiver<Vec<u8>>, StoreError>;
}

// Per-subscriber buffer. A slow subscriber drops notifications rather than
// blocking publishers, matching pub/sub semantics.
const SUBSCRIBER_BUFFER: usize = 16;

struct Record {
    fields: ConfigMap,
    expires_at: Option<Instant>,
}

impl Record {
    fn expired(&self, now: Instant) -> bool {
        matches!(self.expires_at, Some(deadline) if deadline <= now)
    }
}

#[derive(Default)]
struct Inner {
    records: BTreeMap<ConfigId, Record>,
    // module -> member -> expiry score
    index: BTreeMap<String, BTreeMap<ConfigId, Instant>>,
    modules: BTreeSet<String>,
    subscribers: HashMap<ConfigId, Vec<mpsc::Sender<Vec<u8>>>>,
}

/// In-process [`ConfigStore`].
pub struct MemoryStore {
    prefix: String,
    log: Logger,
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new(prefix: &str, log: &Logger) -> Self {
        Self {
            prefix: prefix.trim_end_matches('/').to_string(),
            log: log.new(o!("component" => "MemoryStore")),
            inner: Mutex::new(Inner::default()),
        }
    }
}

#[async_trait]
impl ConfigStore for MemoryStore {
    fn prefix(&self) -> &str {
        &self.prefix
    }

    async fn put_record(
        &self,
        id: &ConfigId,
        record: &ConfigMap,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        // Replacing a record preserves its expiry, like a plain value
        // overwrite; expiry is managed separately by the keepalive.
        let expires_at = inner
            .records
            .get(id)
            .and_then(|existing| existing.expires_at);
        inner.records.insert(
            id.clone(),
            Record { fields: record.clone(), expires_at },
        );
        Ok(())
    }

    async fn get_record(
        &self,
        id: &ConfigId,
    ) -> Result<Option<ConfigMap>, StoreError> {
        let now = Instant::now();
        let inner = self.inner.lock().await;
        Ok(inner
            .records
            .get(id)
            .filter(|record| !record.expired(now))
            .map(|record| record.fields.clone()))
    }

    async fn delete_record(&self, id: &ConfigId) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner.records.remove(id);
        Ok(())
    }

    async fn expire_at(
        &self,
        id: &ConfigId,
        deadline: Instant,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        if let Some(record) = inner.records.get_mut(id) {
            record.expires_at = Some(deadline);
        }
        Ok(())
    }

    async fn ttl_remaining(
        &self,
        id: &ConfigId,
    ) -> Result<Option<Duration>, StoreError> {
        let now = Instant::now();
        let inner = self.inner.lock().await;
        Ok(inner.records.get(id).and_then(|record| {
            record
                .expires_at
                .filter(|deadline| *deadline > now)
                .map(|deadline| deadline - now)
        }))
    }

    async fn index_add(
        &self,
        id: &ConfigId,
        expires: Instant,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner
            .index
            .entry(id.module().to_string())
            .or_default()
            .insert(id.clone(), expires);
        Ok(())
    }

    async fn index_remove(&self, id: &ConfigId) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        if let Some(members) = inner.index.get_mut(id.module()) {
            members.remove(id);
        }
        Ok(())
    }

    async fn live_instances(
        &self,
        module: &str,
    ) -> Result<Vec<ConfigId>, StoreError> {
        let cutoff = Instant::now().checked_sub(REGISTRATION_TTL);
        let inner = self.inner.lock().await;
        Ok(inner
            .index
            .get(module)
            .map(|members| {
                members
                    .iter()
                    .filter(|(_, score)| match cutoff {
                        Some(cutoff) => **score >= cutoff,
                        None => true,
                    })
                    .map(|(id, _)| id.clone())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn register_module(&self, module: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner.modules.insert(module.to_string());
        Ok(())
    }

    async fn modules(&self) -> Result<Vec<String>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.modules.iter().cloned().collect())
    }

    async fn publish(
        &self,
        id: &ConfigId,
        payload: Vec<u8>,
    ) -> Result<usize, StoreError> {
        let mut inner = self.inner.lock().await;
        let Some(senders) = inner.subscribers.get_mut(id) else {
            return Ok(0);
        };

        let mut delivered = 0;
        senders.retain(|tx| match tx.try_send(payload.clone()) {
            Ok(()) => {
                delivered += 1;
                true
            }
            // Keep slow subscribers subscribed; the notification is lost.
            Err(mpsc::error::TrySendError::Full(_)) => {
                delivered += 1;
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
        if senders.is_empty() {
            inner.subscribers.remove(id);
        }

        slog::debug!(self.log, "publish";
            "id" => %id, "delivered" => delivered);
        Ok(delivered)
    }

    async fn subscribe(
        &self,
        id: &ConfigId,
    ) -> Result<mpsc::Receiver<Vec<u8>>, StoreError> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        let mut inner = self.inner.lock().await;
        inner.subscribers.entry(id.clone()).or_default().push(tx);
        Ok(rx)
    }
}
