// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! End-to-end reconciliation against the sim backend.

use close_common::{ConfigId, ContainerId, InstanceClass};
use close_config_store::{ConfigMap, ConfigStore, MemoryStore};
use close_controller::{
    ContainerBackend, ContainerConfig, FleetConfig, Manager, ManagerError,
    ManagerOptions, MetricsReader, SimBackend, SimMetrics, WorkerState,
};
use close_worker::{DummyWorker, WorkerRuntime};
use serde_json::json;
use slog::{o, Drain, Logger};
use std::sync::Arc;
use std::time::Duration;

fn logger() -> Logger {
    let decorator =
        slog_term::PlainSyncDecorator::new(slog_term::TestStdoutWriter);
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    Logger::root(drain, o!())
}

struct Harness {
    backend: Arc<SimBackend>,
    store: Arc<MemoryStore>,
    manager: Manager,
    log: Logger,
}

fn harness() -> Harness {
    let log = logger();
    let backend = Arc::new(SimBackend::new(&log));
    let store = Arc::new(MemoryStore::new("close/config", &log));
    let metrics = Arc::new(SimMetrics::new());
    let manager = Manager::new(
        Arc::clone(&backend) as Arc<dyn ContainerBackend>,
        Arc::clone(&store) as Arc<dyn ConfigStore>,
        metrics as Arc<dyn MetricsReader>,
        ManagerOptions::default(),
        &log,
    );
    Harness { backend, store, manager, log }
}

fn fleet(toml_src: &str) -> FleetConfig {
    FleetConfig::from_toml(toml_src).unwrap()
}

const HTTP_X3: &str = r#"
    [workers.http]
    count = 3
    image = "close:latest"
    command = "worker"
    rate_config = "rate"
"#;

const HTTP_X2: &str = r#"
    [workers.http]
    count = 2
    image = "close:latest"
    command = "worker"
    rate_config = "rate"
"#;

fn wid(instance: &str) -> ContainerId {
    ContainerId::new(InstanceClass::Worker, "http", instance).unwrap()
}

#[tokio::test]
async fn scale_down_sweeps_only_the_extra_instance() {
    let h = harness();
    h.manager.load_fleet(fleet(HTTP_X3)).await.unwrap();
    h.manager.start().await.unwrap();
    assert_eq!(
        h.backend.container_names().await,
        vec![
            "close-worker-http-1".to_string(),
            "close-worker-http-2".to_string(),
            "close-worker-http-3".to_string(),
        ]
    );

    h.backend.reset_counters().await;
    h.manager.load_fleet(fleet(HTTP_X2)).await.unwrap();
    h.manager.start().await.unwrap();

    // instance 3 was stopped, 1 and 2 were left alone
    let counters = h.backend.counters().await;
    assert_eq!(counters.creates, 0);
    assert_eq!(counters.starts, 0);
    assert_eq!(counters.stops, 1);
    let statuses = h.manager.list_workers().await.unwrap();
    assert_eq!(statuses.len(), 2);

    // the stopped container is gone after a clean
    assert_eq!(h.backend.container_names().await.len(), 3);
    h.manager.clean().await.unwrap();
    assert_eq!(h.backend.container_names().await.len(), 2);
    assert_eq!(h.backend.counters().await.removes, 1);
}

#[tokio::test]
async fn second_pass_is_idempotent() {
    let h = harness();
    h.manager.load_fleet(fleet(HTTP_X3)).await.unwrap();
    h.manager.start().await.unwrap();

    h.backend.reset_counters().await;
    h.manager.start().await.unwrap();
    let counters = h.backend.counters().await;
    assert_eq!(counters.creates, 0);
    assert_eq!(counters.starts, 0);
    assert_eq!(counters.stops, 0);
    assert_eq!(counters.removes, 0);
}

#[tokio::test]
async fn removing_a_declaration_tears_its_instances_down() {
    let h = harness();
    h.manager.load_fleet(fleet(HTTP_X3)).await.unwrap();
    h.manager.start().await.unwrap();

    h.manager.load_fleet(FleetConfig::default()).await.unwrap();
    h.manager.start().await.unwrap();
    assert_eq!(h.backend.counters().await.stops, 3);
    assert!(h.manager.list_workers().await.unwrap().is_empty());
}

#[tokio::test]
async fn workers_join_their_client_namespace() {
    let h = harness();
    let declaration = r#"
        [clients.netem]
        count = 2
        image = "close:latest"
        privileged = true

        [workers.http]
        count = 2
        image = "close:latest"
        command = "worker"
        client = "netem"
    "#;
    h.manager.load_fleet(fleet(declaration)).await.unwrap();
    h.manager.start().await.unwrap();

    let container = h.backend.get(&wid("2")).await.unwrap().unwrap();
    assert_eq!(
        container.config.network_mode,
        "container:close-client-netem-2"
    );
    assert_eq!(h.manager.list_clients().await.unwrap().len(), 2);
}

#[tokio::test]
async fn failures_are_collected_not_fatal() {
    let h = harness();
    h.manager.load_fleet(fleet(HTTP_X3)).await.unwrap();

    h.backend.fail_next_up(&wid("2")).await;
    let errors = h.manager.start().await.unwrap_err();
    assert_eq!(errors.0.len(), 1);
    assert!(errors.to_string().contains("close-worker-http-2"));

    // the pass kept going past the failure
    assert_eq!(
        h.backend.container_names().await,
        vec![
            "close-worker-http-1".to_string(),
            "close-worker-http-3".to_string(),
        ]
    );

    // and the next pass converges
    h.manager.start().await.unwrap();
    assert_eq!(h.backend.container_names().await.len(), 3);
}

#[tokio::test]
async fn discover_adopts_matching_containers() {
    let h = harness();
    h.manager.load_fleet(fleet(HTTP_X2)).await.unwrap();
    h.manager.start().await.unwrap();

    // a foreign managed container that matches no declaration
    let rogue =
        ContainerId::new(InstanceClass::Worker, "rogue", "1").unwrap();
    h.backend.up(&rogue, ContainerConfig::default()).await.unwrap();

    // a fresh manager over the same backend knows nothing...
    let metrics = Arc::new(SimMetrics::new());
    let manager = Manager::new(
        Arc::clone(&h.backend) as Arc<dyn ContainerBackend>,
        Arc::clone(&h.store) as Arc<dyn ConfigStore>,
        metrics as Arc<dyn MetricsReader>,
        ManagerOptions::default(),
        &h.log,
    );
    assert!(manager.list_workers().await.unwrap().is_empty());

    // ...until it discovers, adopting declared instances only
    manager.load_fleet(fleet(HTTP_X2)).await.unwrap();
    manager.discover().await.unwrap();
    assert_eq!(manager.list_workers().await.unwrap().len(), 2);

    // adopted containers are reused, not replaced
    h.backend.reset_counters().await;
    manager.start().await.unwrap();
    assert_eq!(h.backend.counters().await.creates, 0);
}

#[tokio::test]
async fn type_tag_change_rebinds_the_record() {
    let h = harness();
    h.manager
        .load_fleet(fleet(
            "[workers.http]\ncount = 1\ntype = \"a\"\nimage = \"close:latest\"\n",
        ))
        .await
        .unwrap();
    h.manager.start().await.unwrap();

    h.backend.reset_counters().await;
    h.manager
        .load_fleet(fleet(
            "[workers.http]\ncount = 1\ntype = \"b\"\nimage = \"close:latest\"\n",
        ))
        .await
        .unwrap();
    h.manager.start().await.unwrap();

    // the identity env changed, so the container was replaced
    let counters = h.backend.counters().await;
    assert_eq!(counters.creates, 1);
    assert_eq!(counters.removes, 1);
    let container = h.backend.get(&wid("1")).await.unwrap().unwrap();
    assert!(container
        .config
        .env
        .iter()
        .any(|entry| entry == "CLOSE_INSTANCE=b/1"));

    // and the instance now reads the new record, not the old one
    let id: ConfigId = "b/1".parse().unwrap();
    let runtime = WorkerRuntime::start(
        Arc::clone(&h.store) as Arc<dyn ConfigStore>,
        id.clone(),
        DummyWorker::new(id),
        &h.log,
    )
    .await
    .unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    let status = h.manager.get_worker("http", "1").await.unwrap();
    assert_eq!(status.state, WorkerState::Up);
    runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn image_change_replaces_containers() {
    let h = harness();
    h.manager.load_fleet(fleet(HTTP_X2)).await.unwrap();
    h.manager.start().await.unwrap();

    h.backend.reset_counters().await;
    let upgraded = HTTP_X2.replace("close:latest", "close:v2");
    h.manager.load_fleet(fleet(&upgraded)).await.unwrap();
    h.manager.start().await.unwrap();

    // one replace per instance, nothing swept
    let counters = h.backend.counters().await;
    assert_eq!(counters.creates, 2);
    assert_eq!(counters.removes, 2);
    assert_eq!(counters.stops, 0);
    for status in h.manager.list_workers().await.unwrap() {
        assert_ne!(status.state, WorkerState::Down);
    }
}

#[tokio::test]
async fn stop_keeps_bookkeeping_for_restart() {
    let h = harness();
    h.manager.load_fleet(fleet(HTTP_X2)).await.unwrap();
    h.manager.start().await.unwrap();

    h.manager.stop().await.unwrap();
    let statuses = h.manager.list_workers().await.unwrap();
    assert_eq!(statuses.len(), 2);
    assert!(statuses
        .iter()
        .all(|status| status.state == WorkerState::Down));

    // restart is a plain start of the existing containers
    h.backend.reset_counters().await;
    h.manager.start().await.unwrap();
    let counters = h.backend.counters().await;
    assert_eq!(counters.creates, 0);
    assert_eq!(counters.starts, 2);
}

#[tokio::test]
async fn panic_kills_everything() {
    let h = harness();
    h.manager.load_fleet(fleet(HTTP_X3)).await.unwrap();
    h.manager.start().await.unwrap();

    h.manager.panic().await.unwrap();
    assert_eq!(h.backend.counters().await.kills, 3);
    assert!(h.manager.list_workers().await.unwrap().is_empty());
}

#[tokio::test]
async fn status_listing_batches_backend_calls() {
    let h = harness();
    let declaration = r#"
        [clients.netem]
        count = 2
        image = "close:latest"

        [workers.http]
        count = 3
        image = "close:latest"
    "#;
    h.manager.load_fleet(fleet(declaration)).await.unwrap();
    h.manager.start().await.unwrap();

    // one enumeration per class, no matter how many instances
    h.backend.reset_counters().await;
    h.manager.list_workers().await.unwrap();
    assert_eq!(h.backend.counters().await.lists, 1);
    h.manager.list_clients().await.unwrap();
    assert_eq!(h.backend.counters().await.lists, 2);
}

#[tokio::test]
async fn worker_status_tracks_registration_liveness() {
    let h = harness();
    h.manager.load_fleet(fleet(HTTP_X2)).await.unwrap();
    h.manager.start().await.unwrap();

    // containers run but nothing has registered yet
    let status = h.manager.get_worker("http", "1").await.unwrap();
    assert_eq!(status.state, WorkerState::Wait);
    assert!(status.container.is_some());

    // a live registration moves the instance to up
    let id: ConfigId = "http/1".parse().unwrap();
    let runtime = WorkerRuntime::start(
        Arc::clone(&h.store) as Arc<dyn ConfigStore>,
        id.clone(),
        DummyWorker::new(id.clone()),
        &h.log,
    )
    .await
    .unwrap();
    // let the registration's first keepalive refresh land
    tokio::time::sleep(Duration::from_millis(20)).await;
    let status = h.manager.get_worker("http", "1").await.unwrap();
    assert_eq!(status.state, WorkerState::Up);
    assert!(status.config_ttl.is_some());
    assert!(status.rate.is_some());

    runtime.shutdown().await.unwrap();

    // a dead container is an error regardless of the record
    h.backend.exit(&wid("1"), 1).await;
    let status = h.manager.get_worker("http", "1").await.unwrap();
    assert_eq!(status.state, WorkerState::Error);

    let err = h.manager.get_worker("http", "9").await.unwrap_err();
    assert!(matches!(err, ManagerError::UnknownInstance(_)));
}

#[tokio::test]
async fn config_operations_reach_the_worker() {
    let h = harness();
    let id: ConfigId = "http/1".parse().unwrap();
    let runtime = WorkerRuntime::start(
        Arc::clone(&h.store) as Arc<dyn ConfigStore>,
        id.clone(),
        DummyWorker::new(id.clone()),
        &h.log,
    )
    .await
    .unwrap();
    // listing goes through the index, which the keepalive populates
    tokio::time::sleep(Duration::from_millis(20)).await;

    let records = h.manager.config_list().await.unwrap();
    assert!(records.contains_key("http/1"));

    let mut patch = ConfigMap::new();
    patch.insert("rate".to_string(), json!(42));
    h.manager.config_push(id.clone(), patch.clone()).await.unwrap();

    // the applied config lands back in the store
    let mut record = h.manager.config_get(id.clone()).await.unwrap();
    for _ in 0..100 {
        if record.get("rate") == Some(&json!(42)) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        record = h.manager.config_get(id.clone()).await.unwrap();
    }
    assert_eq!(record.get("rate"), Some(&json!(42)));

    runtime.shutdown().await.unwrap();

    // with the owner gone there is nobody to push to
    let err = h.manager.config_push(id, patch).await.unwrap_err();
    assert!(matches!(err, ManagerError::Config { op: "push", .. }));
}
