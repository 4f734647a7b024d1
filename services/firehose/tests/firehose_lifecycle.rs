//! End-to-end lifecycle over in-memory KV, a scripted orchestrator and a
//! recording sink.

use std::sync::Arc;
use std::time::Duration;

use firehose_events::Allocation;
use firehose_service::consul::{InMemoryKv, KvStore};
use firehose_service::coordinator::{Firehose, FirehoseSettings, SESSION_NAME};
use firehose_service::leader::ElectionConfig;
use firehose_service::nomad::MockOrchestrator;
use firehose_service::sink::{MemoryBackend, SinkOptions};
use firehose_service::watcher::WatcherConfig;
use serde_json::json;
use tokio::sync::watch;

const LOCK_KEY: &str = "service/nomad-helper/firehose.lock";
const CHECKPOINT_KEY: &str = "service/nomad-helper/firehose.value";

fn settings() -> FirehoseSettings {
    FirehoseSettings {
        election: ElectionConfig {
            key: LOCK_KEY.to_string(),
            session_name: SESSION_NAME.to_string(),
            holder: "firehose-test".to_string(),
            session_ttl: Duration::from_secs(15),
            lock_retry: Duration::from_millis(10),
        },
        checkpoint_key: CHECKPOINT_KEY.to_string(),
        checkpoint_interval: Duration::from_millis(50),
        retry_backoff: Duration::from_millis(10),
        watcher: WatcherConfig {
            poll_wait: Duration::from_secs(1),
            retry_backoff: Duration::from_millis(10),
        },
        sink: SinkOptions {
            workers: 3,
            capacity: 16,
            drain_poll_interval: Duration::from_millis(5),
        },
        node_cache: None,
    }
}

fn allocation(id: &str, times: &[i64]) -> Allocation {
    let events: Vec<_> = times
        .iter()
        .map(|t| json!({"Type": "Task Started", "Time": t, "Message": "started"}))
        .collect();

    serde_json::from_value(json!({
        "ID": id,
        "EvalID": "eval-1",
        "Name": "api.web[0]",
        "JobID": "api",
        "TaskGroup": "web",
        "DesiredStatus": "run",
        "ClientStatus": "running",
        "TaskStates": {
            "server": {"State": "running", "Failed": false, "Events": events}
        }
    }))
    .unwrap()
}

/// Run one firehose process until it has handled every scripted listing,
/// then shut it down.
async fn run_process(
    kv: &Arc<InMemoryKv>,
    orchestrator: &Arc<MockOrchestrator>,
    backend: &Arc<MemoryBackend>,
    listings: usize,
) {
    let firehose = Firehose::new(settings(), kv.clone(), orchestrator.clone(), backend.clone());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(firehose.run(shutdown_rx));

    let start = std::time::Instant::now();
    while orchestrator.polls() <= listings {
        if start.elapsed() > Duration::from_secs(5) {
            panic!("watcher did not process {listings} listings in time");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    shutdown_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("firehose should stop")
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn cold_start_publishes_everything_and_checkpoints() {
    let kv = Arc::new(InMemoryKv::new());
    let orchestrator = Arc::new(MockOrchestrator::new());
    let backend = Arc::new(MemoryBackend::new());
    orchestrator.push_listing(10, vec![allocation("alloc-1", &[100, 200])]);

    run_process(&kv, &orchestrator, &backend, 1).await;

    let mut times: Vec<i64> = backend
        .json_payloads()
        .iter()
        .map(|p| p["TaskEvent"]["Time"].as_i64().unwrap())
        .collect();
    times.sort_unstable();
    assert_eq!(times, vec![100, 200]);

    let first = &backend.json_payloads()[0];
    assert_eq!(first["AllocationID"], "alloc-1");
    assert_eq!(first["JobID"], "api");
    assert_eq!(first["GroupName"], "web");
    assert_eq!(first["TaskName"], "server");

    assert_eq!(kv.value_of(CHECKPOINT_KEY).as_deref(), Some("200"));
    assert_eq!(kv.holder_of(LOCK_KEY), None);
    assert!(backend.is_closed());
}

#[tokio::test]
async fn restart_from_checkpoint_replays_nothing() {
    let kv = Arc::new(InMemoryKv::new());
    let backend = Arc::new(MemoryBackend::new());

    let first = Arc::new(MockOrchestrator::new());
    first.push_listing(10, vec![allocation("alloc-1", &[100, 200])]);
    run_process(&kv, &first, &backend, 1).await;
    assert_eq!(backend.payloads().len(), 2);

    let restarted_backend = Arc::new(MemoryBackend::new());
    let second = Arc::new(MockOrchestrator::new());
    second.push_listing(10, vec![allocation("alloc-1", &[100, 200])]);
    run_process(&kv, &second, &restarted_backend, 1).await;

    assert!(restarted_backend.payloads().is_empty());
    assert_eq!(kv.value_of(CHECKPOINT_KEY).as_deref(), Some("200"));
}

#[tokio::test]
async fn restart_publishes_only_newer_events() {
    let kv = Arc::new(InMemoryKv::new());
    kv.put(CHECKPOINT_KEY, b"150").await.unwrap();

    let orchestrator = Arc::new(MockOrchestrator::new());
    let backend = Arc::new(MemoryBackend::new());
    orchestrator.push_listing(
        3,
        vec![
            allocation("alloc-1", &[100, 150, 175]),
            allocation("alloc-2", &[120, 300]),
        ],
    );

    run_process(&kv, &orchestrator, &backend, 1).await;

    let mut times: Vec<i64> = backend
        .json_payloads()
        .iter()
        .map(|p| p["TaskEvent"]["Time"].as_i64().unwrap())
        .collect();
    times.sort_unstable();
    assert_eq!(times, vec![175, 300]);
    assert_eq!(kv.value_of(CHECKPOINT_KEY).as_deref(), Some("300"));
}
