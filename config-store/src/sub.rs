// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per-record registration and access.
//!
//! A worker process owns a [`Registration`] for its record: the initial
//! write, the keepalive task refreshing expiry and index score every
//! [`KEEPALIVE_PERIOD`], and the reader task turning published patches into
//! [`ConfigPush`]es for the worker's event loop. Everything else (the
//! control plane, status queries) goes through the read-side [`SubHandle`].
//!
//! A crashed owner simply stops refreshing; its record expires on its own.

use crate::push::ConfigPush;
use crate::store::{ConfigStore, StoreError};
use crate::{ConfigMap, KEEPALIVE_PERIOD, REGISTRATION_TTL};
use close_common::ConfigId;
use slog::{debug, info, o, warn, Logger};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

#[derive(Debug, thiserror::Error)]
pub enum SubError {
    /// The record does not exist (or has expired and reads as absent).
    #[error("no config record: {0}")]
    NoRecord(ConfigId),

    /// The record's liveness has lapsed. Not a store failure: readers
    /// surface this as a distinct "waiting" state.
    #[error("config record expired: {0}")]
    Expired(ConfigId),

    #[error("push to {0}: no live subscriber")]
    NoSubscribers(ConfigId),

    #[error("invalid patch for {id}: {source}")]
    InvalidPatch {
        id: ConfigId,
        #[source]
        source: serde_json::Error,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Read/push access to one record, without ownership of its liveness.
#[derive(Clone)]
pub struct SubHandle {
    store: Arc<dyn ConfigStore>,
    id: ConfigId,
}

impl SubHandle {
    pub fn new(store: Arc<dyn ConfigStore>, id: ConfigId) -> Self {
        Self { store, id }
    }

    pub fn id(&self) -> &ConfigId {
        &self.id
    }

    /// Remaining liveness of the record. [`SubError::Expired`] if the
    /// record has lapsed or never existed.
    pub async fn check(&self) -> Result<Duration, SubError> {
        match self.store.ttl_remaining(&self.id).await? {
            Some(remaining) => Ok(remaining),
            None => Err(SubError::Expired(self.id.clone())),
        }
    }

    /// Fetch the full record.
    pub async fn get(&self) -> Result<ConfigMap, SubError> {
        match self.store.get_record(&self.id).await? {
            Some(record) => Ok(record),
            None => Err(SubError::NoRecord(self.id.clone())),
        }
    }

    /// Publish a partial update for the owning worker to apply. Fails if
    /// no live registration is subscribed.
    pub async fn push(&self, patch: &ConfigMap) -> Result<(), SubError> {
        let payload = serde_json::to_vec(patch).map_err(|source| {
            SubError::InvalidPatch { id: self.id.clone(), source }
        })?;
        match self.store.publish(&self.id, payload).await? {
            0 => Err(SubError::NoSubscribers(self.id.clone())),
            _ => Ok(()),
        }
    }
}

/// An owned, liveness-maintained registration of one record.
pub struct Registration {
    id: ConfigId,
    store: Arc<dyn ConfigStore>,
    stop_tx: watch::Sender<bool>,
    keepalive: JoinHandle<()>,
    reader: JoinHandle<()>,
    log: Logger,
}

impl Registration {
    /// Register `id` in the store.
    ///
    /// If a record already exists it is adopted as-is, otherwise `initial`
    /// is written. Returns the registration and the stream of apply
    /// requests for the owning event loop; after an accepted apply the
    /// new materialized config is written back to the store.
    pub async fn start(
        store: Arc<dyn ConfigStore>,
        id: ConfigId,
        initial: ConfigMap,
        log: &Logger,
    ) -> Result<(Self, mpsc::Receiver<ConfigPush>), SubError> {
        let log = log.new(o!(
            "component" => "config-registration",
            "id" => id.to_string(),
        ));

        // Sync the record: adopt an existing one, else write ours.
        match store.get_record(&id).await? {
            Some(existing) => {
                debug!(log, "adopting existing record";
                    "record" => ?existing);
            }
            None => store.put_record(&id, &initial).await?,
        }

        store.register_module(id.module()).await?;

        let subscription = store.subscribe(&id).await?;
        let (stop_tx, stop_rx) = watch::channel(false);
        let (push_tx, push_rx) = mpsc::channel(1);

        let keepalive = tokio::spawn(keepalive_loop(
            Arc::clone(&store),
            id.clone(),
            stop_rx.clone(),
            log.clone(),
        ));
        let reader = tokio::spawn(read_loop(
            Arc::clone(&store),
            id.clone(),
            subscription,
            push_tx,
            stop_rx,
            log.clone(),
        ));

        info!(log, "registered");
        Ok((Self { id, store, stop_tx, keepalive, reader, log }, push_rx))
    }

    pub fn id(&self) -> &ConfigId {
        &self.id
    }

    /// Read/push handle for this registration's record.
    pub fn handle(&self) -> SubHandle {
        SubHandle::new(Arc::clone(&self.store), self.id.clone())
    }

    /// Stop the keepalive, unindex the record, and delete it.
    pub async fn stop(self) -> Result<(), SubError> {
        self.stop_tx.send_replace(true);
        // The keepalive removes the index entry on its way out.
        let _ = self.keepalive.await;
        let _ = self.reader.await;

        self.store.delete_record(&self.id).await?;
        info!(self.log, "unregistered");
        Ok(())
    }
}

// Sole writer of the record's liveness: refresh expiry and index score now
// and then every KEEPALIVE_PERIOD, until stopped.
async fn keepalive_loop(
    store: Arc<dyn ConfigStore>,
    id: ConfigId,
    mut stop_rx: watch::Receiver<bool>,
    log: Logger,
) {
    let mut interval = tokio::time::interval(KEEPALIVE_PERIOD);
    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = stop_rx.changed() => break,
        }

        let expires = Instant::now() + REGISTRATION_TTL;
        if let Err(error) = store.expire_at(&id, expires).await {
            warn!(log, "keepalive refresh failed"; "error" => %error);
        } else if let Err(error) = store.index_add(&id, expires).await {
            warn!(log, "keepalive index update failed"; "error" => %error);
        }
    }

    if let Err(error) = store.index_remove(&id).await {
        warn!(log, "unregister index removal failed"; "error" => %error);
    }
}

// Turn each published patch into a ConfigPush for the owning event loop,
// and write the applied config back to the store. Awaiting the reply
// before reading the next notification gives at-most-one-concurrent-apply.
async fn read_loop(
    store: Arc<dyn ConfigStore>,
    id: ConfigId,
    mut subscription: mpsc::Receiver<Vec<u8>>,
    push_tx: mpsc::Sender<ConfigPush>,
    mut stop_rx: watch::Receiver<bool>,
    log: Logger,
) {
    loop {
        let payload = tokio::select! {
            payload = subscription.recv() => match payload {
                Some(payload) => payload,
                None => {
                    warn!(log, "subscription closed");
                    break;
                }
            },
            _ = stop_rx.changed() => break,
        };

        let patch: ConfigMap = match serde_json::from_slice(&payload) {
            Ok(patch) => patch,
            Err(error) => {
                warn!(log, "discarding unparseable patch"; "error" => %error);
                continue;
            }
        };

        let (push, reply_rx) = ConfigPush::new(patch);
        if push_tx.send(push).await.is_err() {
            warn!(log, "apply loop is gone");
            break;
        }

        match reply_rx.await {
            Ok(Ok(config)) => {
                debug!(log, "patch applied"; "config" => ?config);
                if let Err(error) = store.put_record(&id, &config).await {
                    warn!(log, "failed to store applied config";
                        "error" => %error);
                }
            }
            Ok(Err(error)) => {
                info!(log, "patch rejected"; "error" => %error);
            }
            Err(_) => {
                warn!(log, "apply loop dropped the push");
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::store::MemoryStore;
    use serde_json::json;

    fn log() -> Logger {
        Logger::root(slog::Discard, o!())
    }

    fn store() -> Arc<dyn ConfigStore> {
        Arc::new(MemoryStore::new("close/config", &log()))
    }

    fn initial() -> ConfigMap {
        let mut map = ConfigMap::new();
        map.insert("rate".to_string(), json!(10));
        map
    }

    #[tokio::test(start_paused = true)]
    async fn registration_keeps_record_alive() {
        let store = store();
        let id: ConfigId = "udp/1".parse().unwrap();

        let (registration, _pushes) = Registration::start(
            Arc::clone(&store),
            id.clone(),
            initial(),
            &log(),
        )
        .await
        .unwrap();
        let handle = registration.handle();

        // Well past the TTL, the record is still registered and live.
        for _ in 0..10 {
            tokio::time::advance(KEEPALIVE_PERIOD).await;
            tokio::task::yield_now().await;
        }
        let ttl = handle.check().await.unwrap();
        assert!(ttl <= REGISTRATION_TTL);
        assert_eq!(
            store.live_instances("udp").await.unwrap(),
            vec![id.clone()]
        );
        assert_eq!(store.modules().await.unwrap(), vec!["udp".to_string()]);

        registration.stop().await.unwrap();
        assert!(matches!(
            handle.check().await.unwrap_err(),
            SubError::Expired(_)
        ));
        assert!(matches!(
            handle.get().await.unwrap_err(),
            SubError::NoRecord(_)
        ));
        assert_eq!(store.live_instances("udp").await.unwrap(), vec![]);
    }

    #[tokio::test(start_paused = true)]
    async fn stopped_registration_expires_within_ttl() {
        let store = store();
        let id: ConfigId = "udp/1".parse().unwrap();

        let (registration, pushes) = Registration::start(
            Arc::clone(&store),
            id.clone(),
            initial(),
            &log(),
        )
        .await
        .unwrap();
        let handle = registration.handle();

        // Let the first keepalive refresh land.
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;

        // Simulate a crashed owner: stop refreshing without cleanup.
        registration.keepalive.abort();
        registration.reader.abort();
        drop(pushes);

        // Just before the TTL, the record still checks out.
        tokio::time::advance(REGISTRATION_TTL - Duration::from_millis(1))
            .await;
        assert!(handle.check().await.is_ok());

        // At the TTL boundary it reads as expired.
        tokio::time::advance(Duration::from_millis(1)).await;
        assert!(matches!(
            handle.check().await.unwrap_err(),
            SubError::Expired(_)
        ));
        assert!(matches!(
            handle.get().await.unwrap_err(),
            SubError::NoRecord(_)
        ));
    }

    #[tokio::test]
    async fn adopts_existing_record() {
        let store = store();
        let id: ConfigId = "udp/1".parse().unwrap();

        let mut existing = ConfigMap::new();
        existing.insert("rate".to_string(), json!(77));
        store.put_record(&id, &existing).await.unwrap();

        let (registration, _pushes) =
            Registration::start(Arc::clone(&store), id, initial(), &log())
                .await
                .unwrap();

        let record = registration.handle().get().await.unwrap();
        assert_eq!(record.get("rate"), Some(&json!(77)));
        registration.stop().await.unwrap();
    }

    #[tokio::test]
    async fn push_reaches_apply_loop_and_stores_result() {
        let store = store();
        let id: ConfigId = "udp/1".parse().unwrap();

        let (registration, mut pushes) = Registration::start(
            Arc::clone(&store),
            id.clone(),
            initial(),
            &log(),
        )
        .await
        .unwrap();
        let handle = registration.handle();

        // a minimal apply loop
        let apply = tokio::spawn(async move {
            while let Some(push) = pushes.recv().await {
                let mut config = initial();
                for (key, value) in push.patch() {
                    config.insert(key.clone(), value.clone());
                }
                push.accept(config);
            }
        });

        let mut patch = ConfigMap::new();
        patch.insert("rate".to_string(), json!(500));
        handle.push(&patch).await.unwrap();

        // wait for the applied config to land in the store
        let mut record = handle.get().await.unwrap();
        for _ in 0..100 {
            if record.get("rate") == Some(&json!(500)) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
            record = handle.get().await.unwrap();
        }
        assert_eq!(record.get("rate"), Some(&json!(500)));

        registration.stop().await.unwrap();
        apply.await.unwrap();

        // with the registration gone, pushes have nobody listening
        assert!(matches!(
            handle.push(&patch).await.unwrap_err(),
            SubError::NoSubscribers(_)
        ));
    }
}
