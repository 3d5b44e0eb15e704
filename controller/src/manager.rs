// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The fleet manager.
//!
//! [`Manager`] is a cheaply-cloneable handle; all state lives in a
//! [`ManagerRunner`] task that owns the tracked instance maps and services
//! one request at a time, so every operation sees (and leaves) a
//! consistent view of the fleet. Requests carry a oneshot for the reply.
//!
//! Reconciliation is mark-and-sweep: a pass marks every declared instance
//! while bringing it up, then sweeps tracked-but-unmarked instances. Per
//! instance failures are collected, never short-circuited, so one bad
//! instance cannot keep the rest of the fleet from converging; the next
//! pass retries whatever failed.

use crate::backend::{BackendError, ContainerBackend, ContainerFilter};
use crate::cache::StatusCache;
use crate::clients::{Client, ClientStatus};
use crate::fleet::{ClientConfig, FleetConfig, FleetError, WorkerConfig};
use crate::metrics::MetricsReader;
use crate::workers::{Worker, WorkerStatus};
use close_common::{ConfigId, ContainerId, IdError, InstanceClass};
use close_config_store::sub::{SubError, SubHandle};
use close_config_store::{ConfigMap, ConfigStore, StoreError};
use slog::{debug, info, o, warn, Logger};
use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

// Outstanding requests the handle side may queue.
const QUEUE_SIZE: usize = 16;

#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error("manager is shut down")]
    ManagerClosed,

    #[error("manager dropped the request")]
    RequestDropped,

    #[error(transparent)]
    Fleet(#[from] FleetError),

    #[error(transparent)]
    Id(#[from] IdError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("{op} {id}: {source}")]
    Backend {
        op: &'static str,
        id: String,
        #[source]
        source: BackendError,
    },

    #[error("config {op} {id}: {source}")]
    Config {
        op: &'static str,
        id: ConfigId,
        #[source]
        source: SubError,
    },

    #[error("unknown instance: {0}")]
    UnknownInstance(String),
}

/// Collected per-instance failures of one reconciliation pass. The pass
/// itself ran to completion; everything not listed here converged.
#[derive(Debug)]
pub struct ReconcileErrors(pub Vec<ManagerError>);

impl fmt::Display for ReconcileErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} instances failed: ", self.0.len())?;
        for (i, error) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{error}")?;
        }
        Ok(())
    }
}

impl std::error::Error for ReconcileErrors {}

/// External endpoints handed to worker containers as flags.
#[derive(Clone, Debug, Default)]
pub struct ManagerOptions {
    /// Config store endpoint, passed as `-config-url`.
    pub config_url: Option<String>,
    /// Metrics endpoint, passed as `-metrics-url`.
    pub metrics_url: Option<String>,
}

#[derive(strum::Display)]
enum ManagerRequest {
    LoadFleet {
        fleet: FleetConfig,
        tx: oneshot::Sender<Result<(), ManagerError>>,
    },
    DumpFleet {
        tx: oneshot::Sender<Result<String, ManagerError>>,
    },
    Start {
        tx: oneshot::Sender<Vec<ManagerError>>,
    },
    Stop {
        tx: oneshot::Sender<Vec<ManagerError>>,
    },
    Clean {
        tx: oneshot::Sender<Vec<ManagerError>>,
    },
    Discover {
        tx: oneshot::Sender<Result<(), ManagerError>>,
    },
    PanicKill {
        tx: oneshot::Sender<Result<(), ManagerError>>,
    },
    ConfigList {
        tx: oneshot::Sender<Result<BTreeMap<String, ConfigMap>, ManagerError>>,
    },
    ConfigGet {
        id: ConfigId,
        tx: oneshot::Sender<Result<ConfigMap, ManagerError>>,
    },
    ConfigPush {
        id: ConfigId,
        patch: ConfigMap,
        tx: oneshot::Sender<Result<(), ManagerError>>,
    },
    ListClients {
        tx: oneshot::Sender<Vec<ClientStatus>>,
    },
    ListWorkers {
        tx: oneshot::Sender<Vec<WorkerStatus>>,
    },
    GetWorker {
        name: String,
        instance: String,
        tx: oneshot::Sender<Result<WorkerStatus, ManagerError>>,
    },
}

/// Handle to the fleet manager task.
#[derive(Clone)]
pub struct Manager {
    tx: mpsc::Sender<ManagerRequest>,
}

impl Manager {
    pub fn new(
        backend: Arc<dyn ContainerBackend>,
        store: Arc<dyn ConfigStore>,
        metrics: Arc<dyn MetricsReader>,
        options: ManagerOptions,
        log: &Logger,
    ) -> Manager {
        let (tx, rx) = mpsc::channel(QUEUE_SIZE);
        let runner = ManagerRunner {
            log: log.new(o!("component" => "Manager")),
            rx,
            backend,
            store,
            metrics,
            options,
            fleet: FleetConfig::default(),
            clients: BTreeMap::new(),
            workers: BTreeMap::new(),
        };
        tokio::spawn(runner.run());
        Manager { tx }
    }

    async fn request<T>(
        &self,
        request: ManagerRequest,
        rx: oneshot::Receiver<T>,
    ) -> Result<T, ManagerError> {
        self.tx
            .send(request)
            .await
            .map_err(|_| ManagerError::ManagerClosed)?;
        rx.await.map_err(|_| ManagerError::RequestDropped)
    }

    async fn reconcile_request(
        &self,
        request: ManagerRequest,
        rx: oneshot::Receiver<Vec<ManagerError>>,
    ) -> Result<(), ReconcileErrors> {
        match self.request(request, rx).await {
            Ok(errors) if errors.is_empty() => Ok(()),
            Ok(errors) => Err(ReconcileErrors(errors)),
            Err(error) => Err(ReconcileErrors(vec![error])),
        }
    }

    /// Replace the fleet declaration. Takes effect on the next pass;
    /// nothing is reconciled here.
    pub async fn load_fleet(
        &self,
        fleet: FleetConfig,
    ) -> Result<(), ManagerError> {
        let (tx, rx) = oneshot::channel();
        self.request(ManagerRequest::LoadFleet { fleet, tx }, rx).await?
    }

    /// The current declaration, rendered back to TOML.
    pub async fn dump_fleet(&self) -> Result<String, ManagerError> {
        let (tx, rx) = oneshot::channel();
        self.request(ManagerRequest::DumpFleet { tx }, rx).await?
    }

    /// Run a reconciliation pass: every declared instance up, every
    /// tracked-but-undeclared instance torn down.
    pub async fn start(&self) -> Result<(), ReconcileErrors> {
        let (tx, rx) = oneshot::channel();
        self.reconcile_request(ManagerRequest::Start { tx }, rx).await
    }

    /// Stop all tracked containers, workers before their clients.
    /// Instances stay tracked; [`Manager::start`] brings them back.
    pub async fn stop(&self) -> Result<(), ReconcileErrors> {
        let (tx, rx) = oneshot::channel();
        self.reconcile_request(ManagerRequest::Stop { tx }, rx).await
    }

    /// Remove stopped managed containers and drop their bookkeeping.
    pub async fn clean(&self) -> Result<(), ReconcileErrors> {
        let (tx, rx) = oneshot::channel();
        self.reconcile_request(ManagerRequest::Clean { tx }, rx).await
    }

    /// Adopt already-running containers matching the declaration, e.g.
    /// after a controller restart.
    pub async fn discover(&self) -> Result<(), ManagerError> {
        let (tx, rx) = oneshot::channel();
        self.request(ManagerRequest::Discover { tx }, rx).await?
    }

    /// Kill every managed container, tracked or not.
    pub async fn panic(&self) -> Result<(), ManagerError> {
        let (tx, rx) = oneshot::channel();
        self.request(ManagerRequest::PanicKill { tx }, rx).await?
    }

    /// All live config records, keyed by record identity.
    pub async fn config_list(
        &self,
    ) -> Result<BTreeMap<String, ConfigMap>, ManagerError> {
        let (tx, rx) = oneshot::channel();
        self.request(ManagerRequest::ConfigList { tx }, rx).await?
    }

    pub async fn config_get(
        &self,
        id: ConfigId,
    ) -> Result<ConfigMap, ManagerError> {
        let (tx, rx) = oneshot::channel();
        self.request(ManagerRequest::ConfigGet { id, tx }, rx).await?
    }

    /// Push a partial config update to the record's owning worker.
    pub async fn config_push(
        &self,
        id: ConfigId,
        patch: ConfigMap,
    ) -> Result<(), ManagerError> {
        let (tx, rx) = oneshot::channel();
        self.request(ManagerRequest::ConfigPush { id, patch, tx }, rx).await?
    }

    pub async fn list_clients(
        &self,
    ) -> Result<Vec<ClientStatus>, ManagerError> {
        let (tx, rx) = oneshot::channel();
        self.request(ManagerRequest::ListClients { tx }, rx).await
    }

    pub async fn list_workers(
        &self,
    ) -> Result<Vec<WorkerStatus>, ManagerError> {
        let (tx, rx) = oneshot::channel();
        self.request(ManagerRequest::ListWorkers { tx }, rx).await
    }

    pub async fn get_worker(
        &self,
        name: &str,
        instance: &str,
    ) -> Result<WorkerStatus, ManagerError> {
        let (tx, rx) = oneshot::channel();
        self.request(
            ManagerRequest::GetWorker {
                name: name.to_string(),
                instance: instance.to_string(),
                tx,
            },
            rx,
        )
        .await?
    }
}

struct ManagerRunner {
    log: Logger,
    rx: mpsc::Receiver<ManagerRequest>,
    backend: Arc<dyn ContainerBackend>,
    store: Arc<dyn ConfigStore>,
    metrics: Arc<dyn MetricsReader>,
    options: ManagerOptions,
    fleet: FleetConfig,
    clients: BTreeMap<ContainerId, Client>,
    workers: BTreeMap<ContainerId, Worker>,
}

impl ManagerRunner {
    async fn run(mut self) {
        use ManagerRequest::*;
        while let Some(request) = self.rx.recv().await {
            debug!(self.log, "manager request"; "request" => %request);
            match request {
                LoadFleet { fleet, tx } => {
                    let _ = tx.send(self.load_fleet(fleet));
                }
                DumpFleet { tx } => {
                    let _ =
                        tx.send(self.fleet.to_toml().map_err(Into::into));
                }
                Start { tx } => {
                    let _ = tx.send(self.start().await);
                }
                Stop { tx } => {
                    let _ = tx.send(self.stop().await);
                }
                Clean { tx } => {
                    let _ = tx.send(self.clean().await);
                }
                Discover { tx } => {
                    let _ = tx.send(self.discover().await);
                }
                PanicKill { tx } => {
                    let _ = tx.send(self.panic_kill().await);
                }
                ConfigList { tx } => {
                    let _ = tx.send(self.config_list().await);
                }
                ConfigGet { id, tx } => {
                    let _ = tx.send(self.config_get(id).await);
                }
                ConfigPush { id, patch, tx } => {
                    let _ = tx.send(self.config_push(id, patch).await);
                }
                ListClients { tx } => {
                    let _ = tx.send(self.list_clients().await);
                }
                ListWorkers { tx } => {
                    let _ = tx.send(self.list_workers().await);
                }
                GetWorker { name, instance, tx } => {
                    let _ = tx.send(self.get_worker(&name, &instance).await);
                }
            }
        }
        debug!(self.log, "manager handle dropped, stopping");
    }

    fn load_fleet(&mut self, fleet: FleetConfig) -> Result<(), ManagerError> {
        fleet.validate()?;
        info!(self.log, "fleet declaration loaded";
            "clients" => fleet.clients.len(),
            "workers" => fleet.workers.len());
        self.fleet = fleet;
        Ok(())
    }

    async fn start(&mut self) -> Vec<ManagerError> {
        let mut errors = Vec::new();
        info!(self.log, "reconciling fleet");

        // Clients come up before the workers that join their namespaces;
        // teardown goes the other way.
        for client in self.clients.values_mut() {
            client.up = false;
        }
        for worker in self.workers.values_mut() {
            worker.up = false;
        }

        for (name, config) in self.fleet.clients.clone() {
            let config = Arc::new(config);
            for index in 1..=config.count {
                if let Err(error) =
                    self.client_up(&name, &config, index.to_string()).await
                {
                    warn!(self.log, "client up failed";
                        "client" => &name, "instance" => index,
                        "error" => %error);
                    errors.push(error);
                }
            }
        }
        for (name, config) in self.fleet.workers.clone() {
            let config = Arc::new(config);
            for index in 1..=config.count {
                if let Err(error) =
                    self.worker_up(&name, &config, index.to_string()).await
                {
                    warn!(self.log, "worker up failed";
                        "worker" => &name, "instance" => index,
                        "error" => %error);
                    errors.push(error);
                }
            }
        }

        errors.extend(self.sweep_workers().await);
        errors.extend(self.sweep_clients().await);

        info!(self.log, "reconcile pass complete";
            "clients" => self.clients.len(),
            "workers" => self.workers.len(),
            "errors" => errors.len());
        errors
    }

    async fn client_up(
        &mut self,
        name: &str,
        config: &Arc<ClientConfig>,
        instance: String,
    ) -> Result<(), ManagerError> {
        let id = ContainerId::new(
            InstanceClass::Client,
            name,
            instance.as_str(),
        )?;
        let container = match self.clients.entry(id.clone()) {
            Entry::Vacant(entry) => entry
                .insert(Client::new(name, Arc::clone(config), instance)?)
                .container_config(),
            Entry::Occupied(entry) => {
                let client = entry.into_mut();
                client.config = Arc::clone(config);
                client.container_config()
            }
        };

        self.backend.up(&id, container).await.map_err(|source| {
            ManagerError::Backend { op: "up", id: id.to_string(), source }
        })?;
        if let Some(client) = self.clients.get_mut(&id) {
            client.up = true;
        }
        Ok(())
    }

    async fn worker_up(
        &mut self,
        name: &str,
        config: &Arc<WorkerConfig>,
        instance: String,
    ) -> Result<(), ManagerError> {
        let id = ContainerId::new(
            InstanceClass::Worker,
            name,
            instance.as_str(),
        )?;
        let container = match self.workers.entry(id.clone()) {
            Entry::Vacant(entry) => entry
                .insert(Worker::new(
                    name,
                    Arc::clone(config),
                    instance,
                    Arc::clone(&self.store),
                )?)
                .container_config(&self.options)?,
            Entry::Occupied(entry) => {
                let worker = entry.into_mut();
                worker.redeclare(Arc::clone(config), &self.store)?;
                worker.container_config(&self.options)?
            }
        };

        self.backend.up(&id, container).await.map_err(|source| {
            ManagerError::Backend { op: "up", id: id.to_string(), source }
        })?;
        if let Some(worker) = self.workers.get_mut(&id) {
            worker.up = true;
        }
        Ok(())
    }

    // Tear down tracked-but-unmarked instances. Bookkeeping is dropped
    // only once the container is actually down, so a failed teardown is
    // retried by the next pass.
    async fn sweep_workers(&mut self) -> Vec<ManagerError> {
        let unmarked: Vec<ContainerId> = self
            .workers
            .values()
            .filter(|worker| !worker.up)
            .map(|worker| worker.id.clone())
            .collect();
        self.sweep(unmarked).await
    }

    async fn sweep_clients(&mut self) -> Vec<ManagerError> {
        let unmarked: Vec<ContainerId> = self
            .clients
            .values()
            .filter(|client| !client.up)
            .map(|client| client.id.clone())
            .collect();
        self.sweep(unmarked).await
    }

    async fn sweep(&mut self, unmarked: Vec<ContainerId>) -> Vec<ManagerError> {
        let mut errors = Vec::new();
        for id in unmarked {
            debug!(self.log, "sweeping undeclared instance";
                "container" => %id);
            match self.backend.down(&id).await {
                Ok(()) => {
                    self.clients.remove(&id);
                    self.workers.remove(&id);
                }
                Err(source) => errors.push(ManagerError::Backend {
                    op: "down",
                    id: id.to_string(),
                    source,
                }),
            }
        }
        errors
    }

    async fn stop(&mut self) -> Vec<ManagerError> {
        info!(self.log, "stopping fleet");
        let mut errors = Vec::new();
        let ids: Vec<ContainerId> = self
            .workers
            .keys()
            .chain(self.clients.keys())
            .cloned()
            .collect();
        for id in ids {
            if let Err(source) = self.backend.down(&id).await {
                errors.push(ManagerError::Backend {
                    op: "down",
                    id: id.to_string(),
                    source,
                });
            }
        }
        for client in self.clients.values_mut() {
            client.up = false;
        }
        for worker in self.workers.values_mut() {
            worker.up = false;
        }
        errors
    }

    async fn clean(&mut self) -> Vec<ManagerError> {
        let listing =
            match self.backend.list(&ContainerFilter::default()).await {
                Ok(listing) => listing,
                Err(source) => {
                    return vec![ManagerError::Backend {
                        op: "list",
                        id: "*".to_string(),
                        source,
                    }]
                }
            };

        let mut errors = Vec::new();
        let mut removed = 0;
        for status in listing {
            if status.is_up() {
                continue;
            }
            match self.backend.clean(&status.id).await {
                Ok(()) => {
                    self.clients.remove(&status.id);
                    self.workers.remove(&status.id);
                    removed += 1;
                }
                Err(source) => errors.push(ManagerError::Backend {
                    op: "clean",
                    id: status.id.to_string(),
                    source,
                }),
            }
        }
        info!(self.log, "cleaned stopped containers"; "removed" => removed);
        errors
    }

    async fn discover(&mut self) -> Result<(), ManagerError> {
        let listing = self
            .backend
            .list(&ContainerFilter::default())
            .await
            .map_err(|source| ManagerError::Backend {
                op: "list",
                id: "*".to_string(),
                source,
            })?;

        let mut adopted = 0;
        for status in listing {
            let id = status.id;
            match id.class {
                InstanceClass::Client => {
                    let Some(config) = self.fleet.clients.get(&id.module)
                    else {
                        warn!(self.log, "ignoring undeclared client container";
                            "container" => %id);
                        continue;
                    };
                    if let Entry::Vacant(entry) =
                        self.clients.entry(id.clone())
                    {
                        entry.insert(Client::new(
                            &id.module,
                            Arc::new(config.clone()),
                            id.instance.clone(),
                        )?);
                        adopted += 1;
                    }
                }
                InstanceClass::Worker => {
                    let Some(config) = self.fleet.workers.get(&id.module)
                    else {
                        warn!(self.log, "ignoring undeclared worker container";
                            "container" => %id);
                        continue;
                    };
                    if let Entry::Vacant(entry) =
                        self.workers.entry(id.clone())
                    {
                        entry.insert(Worker::new(
                            &id.module,
                            Arc::new(config.clone()),
                            id.instance.clone(),
                            Arc::clone(&self.store),
                        )?);
                        adopted += 1;
                    }
                }
            }
        }
        info!(self.log, "discovery complete"; "adopted" => adopted);
        Ok(())
    }

    async fn panic_kill(&mut self) -> Result<(), ManagerError> {
        warn!(self.log, "panic: killing all managed containers");
        self.backend.panic_kill().await.map_err(|source| {
            ManagerError::Backend {
                op: "panic",
                id: "*".to_string(),
                source,
            }
        })?;
        self.clients.clear();
        self.workers.clear();
        Ok(())
    }

    async fn config_list(
        &self,
    ) -> Result<BTreeMap<String, ConfigMap>, ManagerError> {
        let mut records = BTreeMap::new();
        for module in self.store.modules().await? {
            for id in self.store.live_instances(&module).await? {
                match self.store.get_record(&id).await {
                    Ok(Some(record)) => {
                        records.insert(id.to_string(), record);
                    }
                    // lapsed between the index scan and the read
                    Ok(None) => {}
                    Err(error) => {
                        warn!(self.log, "skipping unreadable record";
                            "id" => %id, "error" => %error);
                    }
                }
            }
        }
        Ok(records)
    }

    async fn config_get(
        &self,
        id: ConfigId,
    ) -> Result<ConfigMap, ManagerError> {
        SubHandle::new(Arc::clone(&self.store), id.clone())
            .get()
            .await
            .map_err(|source| ManagerError::Config { op: "get", id, source })
    }

    async fn config_push(
        &self,
        id: ConfigId,
        patch: ConfigMap,
    ) -> Result<(), ManagerError> {
        info!(self.log, "pushing config"; "id" => %id);
        SubHandle::new(Arc::clone(&self.store), id.clone())
            .push(&patch)
            .await
            .map_err(|source| ManagerError::Config { op: "push", id, source })
    }

    async fn list_clients(&self) -> Vec<ClientStatus> {
        let mut cache = StatusCache::new(
            &*self.backend,
            &*self.store,
            &*self.metrics,
            true,
        );
        let mut statuses = Vec::with_capacity(self.clients.len());
        for client in self.clients.values() {
            statuses.push(client.status(&mut cache).await);
        }
        statuses
    }

    async fn list_workers(&self) -> Vec<WorkerStatus> {
        let mut cache = StatusCache::new(
            &*self.backend,
            &*self.store,
            &*self.metrics,
            true,
        );
        let mut statuses = Vec::with_capacity(self.workers.len());
        for worker in self.workers.values() {
            statuses.push(worker.status(&mut cache).await);
        }
        statuses
    }

    async fn get_worker(
        &self,
        name: &str,
        instance: &str,
    ) -> Result<WorkerStatus, ManagerError> {
        let id = ContainerId::new(InstanceClass::Worker, name, instance)?;
        let Some(worker) = self.workers.get(&id) else {
            return Err(ManagerError::UnknownInstance(id.to_string()));
        };
        // A single lookup has no batching to gain from an eager cache.
        let mut cache = StatusCache::new(
            &*self.backend,
            &*self.store,
            &*self.metrics,
            false,
        );
        Ok(worker.status(&mut cache).await)
    }
}
