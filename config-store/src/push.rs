// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The push/apply request/reply protocol.
//!
//! A configuration update travels to the owning worker's event loop as a
//! [`ConfigPush`]: an opaque patch plus a private one-shot reply channel.
//! The event loop is the only writer of the reply, and replying consumes
//! the push, so each push gets exactly one reply; dropping a push without
//! replying closes the channel, which the waiting caller observes as
//! [`PushError::NoReply`]. Mutation thus happens on the owning task, one
//! push at a time, without any locking.

use crate::ConfigMap;
use tokio::sync::{mpsc, oneshot};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PushError {
    #[error("field {0:?} is immutable")]
    ImmutableField(String),

    #[error("invalid value for {field:?}: {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("worker does not accept config pushes")]
    Unsupported,

    #[error("worker is gone")]
    WorkerGone,

    #[error("worker dropped the push without replying")]
    NoReply,
}

/// One configuration update in flight to a worker's event loop.
pub struct ConfigPush {
    patch: ConfigMap,
    reply: oneshot::Sender<Result<ConfigMap, PushError>>,
}

impl ConfigPush {
    pub fn new(
        patch: ConfigMap,
    ) -> (Self, oneshot::Receiver<Result<ConfigMap, PushError>>) {
        let (reply, rx) = oneshot::channel();
        (Self { patch, reply }, rx)
    }

    pub fn patch(&self) -> &ConfigMap {
        &self.patch
    }

    /// Reply with the new materialized config.
    pub fn accept(self, config: ConfigMap) {
        // The caller may have given up waiting; that's their business.
        let _ = self.reply.send(Ok(config));
    }

    /// Reply with a rejection.
    pub fn reject(self, error: PushError) {
        let _ = self.reply.send(Err(error));
    }
}

/// Submit a patch onto a worker's push channel and wait for the single
/// reply. Returns the worker's new materialized config on success.
pub async fn push_and_wait(
    tx: &mpsc::Sender<ConfigPush>,
    patch: ConfigMap,
) -> Result<ConfigMap, PushError> {
    let (push, rx) = ConfigPush::new(patch);
    tx.send(push).await.map_err(|_| PushError::WorkerGone)?;
    rx.await.map_err(|_| PushError::NoReply)?
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    fn patch(rate: u64) -> ConfigMap {
        let mut map = ConfigMap::new();
        map.insert("rate".to_string(), json!(rate));
        map
    }

    #[tokio::test]
    async fn exactly_one_reply() {
        let (tx, mut rx) = mpsc::channel(1);

        let apply = tokio::spawn(async move {
            let push: ConfigPush = rx.recv().await.unwrap();
            let config = push.patch().clone();
            push.accept(config);
            // channel is closed now; a second reply is unrepresentable
            assert!(rx.recv().await.is_none());
        });

        let applied = push_and_wait(&tx, patch(100)).await.unwrap();
        assert_eq!(applied, patch(100));

        drop(tx);
        apply.await.unwrap();
    }

    #[tokio::test]
    async fn dropped_push_is_an_error() {
        let (tx, mut rx) = mpsc::channel(1);

        tokio::spawn(async move {
            let push = rx.recv().await.unwrap();
            drop(push);
        });

        assert_eq!(
            push_and_wait(&tx, patch(1)).await.unwrap_err(),
            PushError::NoReply
        );
    }

    #[tokio::test]
    async fn closed_worker_is_an_error() {
        let (tx, rx) = mpsc::channel::<ConfigPush>(1);
        drop(rx);
        assert_eq!(
            push_and_wait(&tx, patch(1)).await.unwrap_err(),
            PushError::WorkerGone
        );
    }
}
