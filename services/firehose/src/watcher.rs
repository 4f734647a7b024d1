//! Allocation watcher.
//!
//! Long-polls the orchestrator's allocation listing and turns every task
//! event newer than the high-water mark into an [`AllocationEvent`] on the
//! sink. The diff is additive over event timestamps: there is no snapshot of
//! the previous listing, so allocations that vanish between polls are simply
//! never looked at again.
//!
//! ```text
//! Idle -> Polling -> Diffing -> Publishing -> Idle
//!            \           \           \
//!             +-----------+-----------+--> Stopped (shutdown)
//! ```

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use firehose_events::{Allocation, AllocationEvent};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::cursor::SharedCursor;
use crate::nomad::{NodeResolver, Orchestrator};
use crate::sink::{Sink, SinkError};

/// Watcher timing.
#[derive(Debug, Clone)]
pub struct WatcherConfig {
    /// Server-side long-poll wait.
    pub poll_wait: Duration,

    /// Sleep after a failed poll.
    pub retry_backoff: Duration,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            poll_wait: Duration::from_secs(300),
            retry_backoff: Duration::from_secs(10),
        }
    }
}

/// Build the events of one listing that are newer than `last_change_time`.
///
/// Returns the events and the new high-water mark, which is never below
/// `last_change_time`. Events of a task come out in time order; identical
/// (allocation, task, time) triples are emitted once.
pub fn collect_new_events(
    allocations: &[Allocation],
    last_change_time: i64,
) -> (Vec<AllocationEvent>, i64) {
    let mut high_water = last_change_time;
    let mut seen = HashSet::new();
    let mut events = Vec::new();

    for allocation in allocations {
        for (task_name, state) in &allocation.task_states {
            let mut task_events: Vec<_> = state
                .events
                .iter()
                .filter(|e| e.time > last_change_time)
                .collect();
            task_events.sort_by_key(|e| e.time);

            for task_event in task_events {
                let event = AllocationEvent::new(allocation, task_name, state, task_event);
                if !seen.insert(event.identity()) {
                    continue;
                }
                high_water = high_water.max(event.time());
                events.push(event);
            }
        }
    }

    (events, high_water)
}

/// The poll/diff/publish loop.
pub struct Watcher {
    orchestrator: Arc<dyn Orchestrator>,
    sink: Arc<Sink>,
    cursor: Arc<SharedCursor>,
    config: WatcherConfig,
    nodes: Option<NodeResolver>,
}

impl Watcher {
    pub fn new(
        orchestrator: Arc<dyn Orchestrator>,
        sink: Arc<Sink>,
        cursor: Arc<SharedCursor>,
        config: WatcherConfig,
    ) -> Self {
        Self {
            orchestrator,
            sink,
            cursor,
            config,
            nodes: None,
        }
    }

    /// Attach node datacenter and class to published events.
    pub fn with_node_resolver(mut self, nodes: NodeResolver) -> Self {
        self.nodes = Some(nodes);
        self
    }

    /// Run until shutdown is signalled.
    ///
    /// Returns an error only when the sink stops accepting events.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), SinkError> {
        let start = self.cursor.snapshot();
        info!(
            poll_index = start.poll_index,
            last_change_time = start.last_change_time,
            "Starting allocation watcher"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            let since = self.cursor.poll_index();
            debug!(since_index = since, "Polling allocations");

            let listing = tokio::select! {
                listing = self.orchestrator.list_allocations(since, self.config.poll_wait) => listing,
                _ = shutdown.wait_for(|stop| *stop) => break,
            };

            let listing = match listing {
                Ok(listing) => listing,
                Err(e) => {
                    warn!(
                        error = %e,
                        backoff_secs = self.config.retry_backoff.as_secs(),
                        "Failed to list allocations; retrying"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(self.config.retry_backoff) => continue,
                        _ = shutdown.wait_for(|stop| *stop) => break,
                    }
                }
            };

            if listing.index <= since {
                debug!(index = listing.index, since_index = since, "No new allocation state");
                continue;
            }

            let (events, high_water) =
                collect_new_events(&listing.allocations, self.cursor.last_change_time());
            let count = events.len();

            for event in events {
                let event = self.enrich(event).await;
                let payload = match event.to_payload() {
                    Ok(payload) => payload,
                    Err(e) => {
                        error!(
                            allocation_id = %event.allocation_id,
                            task = %event.task_name,
                            error = %e,
                            "Failed to encode event; skipping"
                        );
                        continue;
                    }
                };

                info!(
                    job_id = %event.job_id,
                    group = %event.group_name,
                    task = %event.task_name,
                    event_type = %event.task_event.event_type,
                    message = %event.task_event.summary(),
                    "Publishing allocation event"
                );

                tokio::select! {
                    result = self.sink.put(Bytes::from(payload)) => result?,
                    _ = shutdown.wait_for(|stop| *stop) => {
                        info!(index = listing.index, "Shutdown during publish; cycle not committed");
                        return Ok(());
                    }
                }
            }

            self.cursor.advance(listing.index, high_water);
            info!(
                poll_index = listing.index,
                last_change_time = high_water,
                allocations = listing.allocations.len(),
                events = count,
                "Processed allocation listing"
            );
        }

        info!("Allocation watcher stopped");
        Ok(())
    }

    async fn enrich(&self, event: AllocationEvent) -> AllocationEvent {
        let Some(nodes) = &self.nodes else {
            return event;
        };
        match nodes.resolve(&event.node_id).await {
            Some(node) => event.with_node(&node),
            None => event,
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::cursor::WatchCursor;
    use crate::nomad::{MockOrchestrator, NodeCache};
    use crate::sink::{MemoryBackend, SinkOptions};

    fn allocation(id: &str, task: &str, times: &[i64]) -> Allocation {
        let events: Vec<_> = times
            .iter()
            .map(|t| json!({"Type": "Started", "Time": t, "DisplayMessage": format!("at {t}")}))
            .collect();

        serde_json::from_value(json!({
            "ID": id,
            "Name": format!("web.app[{id}]"),
            "JobID": "web",
            "TaskGroup": "app",
            "NodeID": "node-1",
            "DesiredStatus": "run",
            "ClientStatus": "running",
            "TaskStates": {
                task: {"State": "running", "Failed": false, "Events": events},
            },
        }))
        .unwrap()
    }

    struct Harness {
        orchestrator: Arc<MockOrchestrator>,
        backend: Arc<MemoryBackend>,
        sink: Arc<Sink>,
        cursor: Arc<SharedCursor>,
    }

    impl Harness {
        fn new(start: WatchCursor) -> Self {
            let backend = Arc::new(MemoryBackend::new());
            let sink = Arc::new(Sink::new(
                backend.clone(),
                SinkOptions {
                    workers: 2,
                    capacity: 16,
                    drain_poll_interval: Duration::from_millis(5),
                },
            ));
            Self {
                orchestrator: Arc::new(MockOrchestrator::new()),
                backend,
                sink,
                cursor: Arc::new(SharedCursor::new(start)),
            }
        }

        fn watcher(&self) -> Watcher {
            Watcher::new(
                self.orchestrator.clone(),
                self.sink.clone(),
                self.cursor.clone(),
                WatcherConfig {
                    poll_wait: Duration::from_secs(1),
                    retry_backoff: Duration::from_millis(5),
                },
            )
        }

        async fn wait_for_index(&self, index: u64) {
            for _ in 0..400 {
                if self.cursor.poll_index() >= index {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            panic!("cursor never reached index {index}");
        }

        fn published_times(&self) -> Vec<i64> {
            let mut times: Vec<i64> = self
                .backend
                .json_payloads()
                .iter()
                .map(|p| p["TaskEvent"]["Time"].as_i64().unwrap())
                .collect();
            times.sort_unstable();
            times
        }
    }

    #[test]
    fn test_collect_filters_strictly_newer() {
        let allocs = vec![
            allocation("a1", "web", &[300, 100, 200]),
            allocation("a2", "sidecar", &[200, 250]),
        ];

        let (events, high_water) = collect_new_events(&allocs, 200);
        let times: Vec<_> = events.iter().map(AllocationEvent::time).collect();
        assert_eq!(times, vec![300, 250]);
        assert_eq!(high_water, 300);
    }

    #[test]
    fn test_collect_orders_within_task_and_dedupes() {
        let allocs = vec![allocation("a1", "web", &[30, 10, 20, 20])];

        let (events, high_water) = collect_new_events(&allocs, 0);
        let times: Vec<_> = events.iter().map(AllocationEvent::time).collect();
        assert_eq!(times, vec![10, 20, 30]);
        assert_eq!(high_water, 30);
    }

    #[test]
    fn test_collect_without_new_events_keeps_mark() {
        let allocs = vec![allocation("a1", "web", &[100, 200])];

        let (events, high_water) = collect_new_events(&allocs, 200);
        assert!(events.is_empty());
        assert_eq!(high_water, 200);
    }

    #[tokio::test]
    async fn test_publishes_new_events_and_advances_cursor() {
        let h = Harness::new(WatchCursor::default());
        h.sink.start().unwrap();
        h.orchestrator
            .push_listing(5, vec![allocation("a1", "web", &[100, 200])]);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let watcher = h.watcher();
        let handle = tokio::spawn(async move { watcher.run(shutdown_rx).await });

        h.wait_for_index(5).await;
        shutdown_tx.send(true).unwrap();
        handle.await.unwrap().unwrap();
        h.sink.stop().await.unwrap();

        assert_eq!(h.published_times(), vec![100, 200]);
        assert_eq!(
            h.cursor.snapshot(),
            WatchCursor {
                poll_index: 5,
                last_change_time: 200
            }
        );
    }

    #[tokio::test]
    async fn test_unchanged_index_and_errors_have_no_side_effects() {
        let h = Harness::new(WatchCursor::default());
        h.sink.start().unwrap();
        h.orchestrator
            .push_listing(5, vec![allocation("a1", "web", &[100])]);
        // Same index again: must be ignored even though it carries a new event.
        h.orchestrator
            .push_listing(5, vec![allocation("a1", "web", &[100, 150])]);
        h.orchestrator.push_error("connection refused");
        h.orchestrator
            .push_listing(7, vec![allocation("a1", "web", &[100, 150, 300])]);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let watcher = h.watcher();
        let handle = tokio::spawn(async move { watcher.run(shutdown_rx).await });

        h.wait_for_index(7).await;
        shutdown_tx.send(true).unwrap();
        handle.await.unwrap().unwrap();
        h.sink.stop().await.unwrap();

        assert_eq!(h.published_times(), vec![100, 150, 300]);
        assert_eq!(h.orchestrator.list_calls(), 4);
        assert_eq!(h.orchestrator.pending(), 0);
        assert_eq!(h.cursor.last_change_time(), 300);
    }

    #[tokio::test]
    async fn test_restart_at_mark_emits_nothing() {
        let h = Harness::new(WatchCursor {
            poll_index: 0,
            last_change_time: 200,
        });
        h.sink.start().unwrap();
        h.orchestrator.push_listing(
            3,
            vec![
                allocation("a1", "web", &[100, 200]),
                allocation("a2", "web", &[50]),
            ],
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let watcher = h.watcher();
        let handle = tokio::spawn(async move { watcher.run(shutdown_rx).await });

        h.wait_for_index(3).await;
        shutdown_tx.send(true).unwrap();
        handle.await.unwrap().unwrap();
        h.sink.stop().await.unwrap();

        assert!(h.backend.payloads().is_empty());
        assert_eq!(h.cursor.last_change_time(), 200);
    }

    #[tokio::test]
    async fn test_shutdown_mid_publish_does_not_advance() {
        let h = Harness::new(WatchCursor::default());
        // Workers never start, so the queue fills and `put` blocks.
        let sink = Arc::new(Sink::new(
            h.backend.clone(),
            SinkOptions {
                workers: 1,
                capacity: 1,
                drain_poll_interval: Duration::from_millis(5),
            },
        ));
        h.orchestrator
            .push_listing(4, vec![allocation("a1", "web", &[10, 20, 30])]);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let watcher = Watcher::new(
            h.orchestrator.clone(),
            sink.clone(),
            h.cursor.clone(),
            WatcherConfig::default(),
        );
        let handle = tokio::spawn(async move { watcher.run(shutdown_rx).await });

        for _ in 0..400 {
            if sink.queue_len() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(sink.queue_len(), 1);

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap().unwrap();

        assert_eq!(h.cursor.snapshot(), WatchCursor::default());
        sink.stop().await.unwrap();
        assert_eq!(h.backend.payloads().len(), 1);
    }

    #[tokio::test]
    async fn test_enriches_events_with_node() {
        let h = Harness::new(WatchCursor::default());
        h.sink.start().unwrap();
        h.orchestrator.insert_node(
            serde_json::from_value(json!({
                "ID": "node-1",
                "Name": "worker-1",
                "Datacenter": "dc1",
                "NodeClass": "batch",
                "Status": "ready",
            }))
            .unwrap(),
        );
        h.orchestrator
            .push_listing(2, vec![allocation("a1", "web", &[10, 20])]);

        let resolver = NodeResolver::new(
            h.orchestrator.clone(),
            NodeCache::new(16, Duration::from_secs(60)),
        );
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let watcher = h.watcher().with_node_resolver(resolver);
        let handle = tokio::spawn(async move { watcher.run(shutdown_rx).await });

        h.wait_for_index(2).await;
        shutdown_tx.send(true).unwrap();
        handle.await.unwrap().unwrap();
        h.sink.stop().await.unwrap();

        let payloads = h.backend.json_payloads();
        assert_eq!(payloads.len(), 2);
        assert!(payloads
            .iter()
            .all(|p| p["Datacenter"] == "dc1" && p["NodeClass"] == "batch"));
        assert_eq!(h.orchestrator.node_calls(), 1);
    }
}
