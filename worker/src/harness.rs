// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Ties a worker to its config-store registration.

use crate::{Worker, IMMUTABLE_FIELDS};
use close_common::ConfigId;
use close_config_store::sub::{Registration, SubError, SubHandle};
use close_config_store::{ConfigMap, ConfigPush, ConfigStore, PushError};
use slog::{info, o, Logger};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

#[derive(Debug, thiserror::Error)]
pub enum HarnessError {
    #[error(transparent)]
    Sub(#[from] SubError),

    #[error("apply loop panicked")]
    ApplyLoopPanicked,
}

/// Drive a worker's config apply loop until its push channel closes.
///
/// Exactly one reply is sent per push: a rejection for workers without
/// config support or for patches violating identity immutability, the
/// worker's answer otherwise. Returns the worker when the loop ends, after
/// invoking its stop capability if it has one.
pub async fn apply_loop<W: Worker>(
    mut worker: W,
    mut pushes: mpsc::Receiver<ConfigPush>,
    log: Logger,
) -> W {
    while let Some(push) = pushes.recv().await {
        let Some(cap) = worker.config_capability() else {
            push.reject(PushError::Unsupported);
            continue;
        };

        match immutable_violation(&cap.config(), push.patch()) {
            Some(field) => push.reject(PushError::ImmutableField(field)),
            None => match cap.apply(push.patch()) {
                Ok(()) => push.accept(cap.config()),
                Err(error) => push.reject(error),
            },
        }
    }

    info!(log, "apply loop done");
    if let Some(stop) = worker.stop_capability() {
        stop.stop();
    }
    worker
}

// The first immutable field the patch would change, if any.
fn immutable_violation(
    config: &ConfigMap,
    patch: &ConfigMap,
) -> Option<String> {
    for field in IMMUTABLE_FIELDS {
        if let Some(patched) = patch.get(*field) {
            if config.get(*field) != Some(patched) {
                return Some(field.to_string());
            }
        }
    }
    None
}

/// A registered, running worker.
pub struct WorkerRuntime<W> {
    registration: Registration,
    apply_task: JoinHandle<W>,
}

impl<W: Worker> WorkerRuntime<W> {
    /// Register the worker's config under `id` and start its apply loop.
    pub async fn start(
        store: Arc<dyn ConfigStore>,
        id: ConfigId,
        mut worker: W,
        log: &Logger,
    ) -> Result<Self, HarnessError> {
        let initial = match worker.config_capability() {
            Some(cap) => cap.config(),
            // No config support: register bare identity so the instance
            // still shows up in listings.
            None => {
                let mut map = ConfigMap::new();
                map.insert("type".to_string(), id.module().into());
                map.insert("instance".to_string(), id.instance().into());
                map
            }
        };

        let (registration, pushes) =
            Registration::start(store, id.clone(), initial, log).await?;

        let log = log.new(o!("component" => "worker", "id" => id.to_string()));
        let apply_task = tokio::spawn(apply_loop(worker, pushes, log));

        Ok(Self { registration, apply_task })
    }

    pub fn id(&self) -> &ConfigId {
        self.registration.id()
    }

    pub fn handle(&self) -> SubHandle {
        self.registration.handle()
    }

    /// Unregister and stop: the record is deleted from the store, the
    /// apply loop drains, and the worker is handed back.
    pub async fn shutdown(self) -> Result<W, HarnessError> {
        self.registration.stop().await?;
        self.apply_task.await.map_err(|_| HarnessError::ApplyLoopPanicked)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::DummyWorker;
    use close_config_store::{push_and_wait, MemoryStore};
    use serde_json::json;

    fn log() -> Logger {
        Logger::root(slog::Discard, o!())
    }

    fn store() -> Arc<dyn ConfigStore> {
        Arc::new(MemoryStore::new("close/config", &log()))
    }

    fn patch(key: &str, value: serde_json::Value) -> ConfigMap {
        let mut map = ConfigMap::new();
        map.insert(key.to_string(), value);
        map
    }

    #[tokio::test]
    async fn apply_loop_rejects_immutable_field_change() {
        let id: ConfigId = "dummy/1".parse().unwrap();
        let (tx, rx) = mpsc::channel(1);
        let task =
            tokio::spawn(apply_loop(DummyWorker::new(id.clone()), rx, log()));

        // changing the identity is always an error reply
        let err = push_and_wait(&tx, patch("instance", json!("2")))
            .await
            .unwrap_err();
        assert_eq!(err, PushError::ImmutableField("instance".to_string()));

        // restating the identity unchanged is fine
        let applied = push_and_wait(&tx, patch("instance", json!("1")))
            .await
            .unwrap();
        assert_eq!(applied.get("instance"), Some(&json!("1")));

        drop(tx);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn apply_loop_applies_valid_patch() {
        let id: ConfigId = "dummy/1".parse().unwrap();
        let (tx, rx) = mpsc::channel(1);
        let task = tokio::spawn(apply_loop(DummyWorker::new(id), rx, log()));

        let applied =
            push_and_wait(&tx, patch("rate", json!(250))).await.unwrap();
        assert_eq!(applied.get("rate"), Some(&json!(250)));
        assert_eq!(applied.get("type"), Some(&json!("dummy")));

        // bad value type is a rejection, not a panic or a silent zero
        let err =
            push_and_wait(&tx, patch("rate", json!(-1))).await.unwrap_err();
        assert!(matches!(err, PushError::InvalidValue { .. }));

        drop(tx);
        let worker = task.await.unwrap();
        assert_eq!(worker.rate(), 250);
    }

    #[tokio::test]
    async fn runtime_registers_and_shuts_down() {
        let store = store();
        let id: ConfigId = "dummy/1".parse().unwrap();

        let runtime = WorkerRuntime::start(
            Arc::clone(&store),
            id.clone(),
            DummyWorker::new(id.clone()),
            &log(),
        )
        .await
        .unwrap();

        let handle = runtime.handle();
        let record = handle.get().await.unwrap();
        assert_eq!(record.get("type"), Some(&json!("dummy")));
        assert_eq!(record.get("instance"), Some(&json!("1")));

        // end-to-end: push through the store's pub/sub
        handle.push(&patch("rate", json!(42))).await.unwrap();
        let mut record = handle.get().await.unwrap();
        for _ in 0..100 {
            if record.get("rate") == Some(&json!(42)) {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            record = handle.get().await.unwrap();
        }
        assert_eq!(record.get("rate"), Some(&json!(42)));

        let worker = runtime.shutdown().await.unwrap();
        assert!(worker.is_stopped());
        assert!(store.get_record(&id).await.unwrap().is_none());
    }
}
