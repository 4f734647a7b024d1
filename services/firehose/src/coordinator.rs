//! Lifecycle coordinator.
//!
//! Runs the firehose as the single active instance:
//!
//! 1. acquire the leader lock
//! 2. restore the checkpoint
//! 3. start the sink workers and the checkpoint persister
//! 4. run the watcher until shutdown
//! 5. drain the sink, persist a final checkpoint, release the lock

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::checkpoint::{run_persister, CheckpointError, CheckpointStore};
use crate::config::Config;
use crate::consul::KvStore;
use crate::cursor::{SharedCursor, WatchCursor};
use crate::leader::{ElectionConfig, LeaderElector, LeadershipLock, LockError, DEFAULT_LOCK_RETRY};
use crate::nomad::{NodeCache, NodeResolver, Orchestrator};
use crate::sink::{Sink, SinkBackend, SinkOptions};
use crate::watcher::{Watcher, WatcherConfig};

/// Name of the leadership session.
pub const SESSION_NAME: &str = "nomad-helper-firehose";

/// Node cache bounds, when enrichment is enabled.
#[derive(Debug, Clone, Copy)]
pub struct NodeCacheSettings {
    pub max_entries: usize,
    pub ttl: Duration,
}

/// Everything the coordinator needs besides its clients.
#[derive(Debug, Clone)]
pub struct FirehoseSettings {
    pub election: ElectionConfig,
    pub checkpoint_key: String,
    pub checkpoint_interval: Duration,
    pub retry_backoff: Duration,
    pub watcher: WatcherConfig,
    pub sink: SinkOptions,
    pub node_cache: Option<NodeCacheSettings>,
}

impl FirehoseSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            election: ElectionConfig {
                key: config.lock_key.clone(),
                session_name: SESSION_NAME.to_string(),
                holder: config.instance_name.clone(),
                session_ttl: config.session_ttl,
                lock_retry: DEFAULT_LOCK_RETRY,
            },
            checkpoint_key: config.checkpoint_key.clone(),
            checkpoint_interval: config.checkpoint_interval,
            retry_backoff: config.retry_backoff,
            watcher: WatcherConfig {
                poll_wait: config.poll_wait,
                retry_backoff: config.retry_backoff,
            },
            sink: SinkOptions {
                workers: config.sink_workers,
                capacity: config.sink_queue_capacity,
                ..SinkOptions::default()
            },
            node_cache: config.enrich_nodes.then_some(NodeCacheSettings {
                max_entries: config.node_cache_size,
                ttl: config.node_cache_ttl,
            }),
        }
    }
}

/// The assembled firehose.
pub struct Firehose {
    settings: FirehoseSettings,
    kv: Arc<dyn KvStore>,
    orchestrator: Arc<dyn Orchestrator>,
    backend: Arc<dyn SinkBackend>,
}

impl Firehose {
    pub fn new(
        settings: FirehoseSettings,
        kv: Arc<dyn KvStore>,
        orchestrator: Arc<dyn Orchestrator>,
        backend: Arc<dyn SinkBackend>,
    ) -> Self {
        Self {
            settings,
            kv,
            orchestrator,
            backend,
        }
    }

    /// Run until `shutdown` flips to `true` or the watcher fails.
    ///
    /// Shutdown before the lock is acquired is a clean exit.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let elector = LeaderElector::new(Arc::clone(&self.kv), self.settings.election.clone());
        let lock = match elector.acquire(&mut shutdown).await {
            Ok(lock) => lock,
            Err(LockError::Cancelled) => {
                info!("Shutdown before leadership was acquired");
                self.close_backend().await;
                return Ok(());
            }
            Err(e) => {
                self.close_backend().await;
                return Err(e).context("Failed to acquire leadership");
            }
        };

        let store = Arc::new(CheckpointStore::new(
            Arc::clone(&self.kv),
            self.settings.checkpoint_key.clone(),
            lock.session_id(),
        ));

        let last_change_time = match store
            .restore_with_retry(self.settings.retry_backoff, &mut shutdown)
            .await
        {
            Ok(Some(t)) => {
                info!(last_change_time = t, "Restored checkpoint");
                t
            }
            Ok(None) => {
                info!("No checkpoint found; replaying currently visible events");
                0
            }
            Err(CheckpointError::Cancelled) => {
                info!("Shutdown while restoring checkpoint");
                self.abandon(&lock).await;
                return Ok(());
            }
            Err(e) => {
                self.abandon(&lock).await;
                return Err(e).context("Failed to restore checkpoint");
            }
        };

        let cursor = Arc::new(SharedCursor::new(WatchCursor {
            poll_index: 0,
            last_change_time,
        }));

        let sink = Arc::new(Sink::new(Arc::clone(&self.backend), self.settings.sink.clone()));
        if let Err(e) = sink.start() {
            self.abandon(&lock).await;
            return Err(e).context("Failed to start sink workers");
        }

        // Internal stop: set by the external signal or by the watcher exiting.
        let (stop_tx, stop_rx) = watch::channel(false);
        let stop_tx = Arc::new(stop_tx);
        let forwarder = tokio::spawn({
            let stop_tx = Arc::clone(&stop_tx);
            let mut shutdown = shutdown.clone();
            async move {
                let _ = shutdown.wait_for(|stop| *stop).await;
                stop_tx.send_replace(true);
            }
        });

        let persister = tokio::spawn(run_persister(
            Arc::clone(&store),
            Arc::clone(&cursor),
            self.settings.checkpoint_interval,
            stop_rx.clone(),
        ));

        let mut watcher = Watcher::new(
            Arc::clone(&self.orchestrator),
            Arc::clone(&sink),
            Arc::clone(&cursor),
            self.settings.watcher.clone(),
        );
        if let Some(cache) = self.settings.node_cache {
            watcher = watcher.with_node_resolver(NodeResolver::new(
                Arc::clone(&self.orchestrator),
                NodeCache::new(cache.max_entries, cache.ttl),
            ));
        }

        let watched = watcher.run(stop_rx).await;
        if let Err(e) = &watched {
            error!(error = %e, "Allocation watcher failed");
        }

        info!("Shutting down firehose");
        stop_tx.send_replace(true);
        forwarder.abort();
        if let Err(e) = persister.await {
            warn!(error = %e, "Checkpoint persister ended abnormally");
        }

        if let Err(e) = sink.stop().await {
            error!(error = %e, "Failed to stop sink cleanly");
        }

        shutdown_checkpoint(&store, &cursor, &lock).await;

        info!(
            last_change_time = cursor.last_change_time(),
            "Firehose shutdown complete"
        );
        watched.context("Allocation watcher stopped")
    }

    async fn close_backend(&self) {
        if let Err(e) = self.backend.close().await {
            warn!(error = %e, "Failed to close sink backend");
        }
    }

    /// Undo a partial startup: close the backend and give up leadership.
    async fn abandon(&self, lock: &LeadershipLock) {
        self.close_backend().await;
        lock.release().await;
    }
}

async fn shutdown_checkpoint(store: &CheckpointStore, cursor: &SharedCursor, lock: &LeadershipLock) {
    let last_change_time = cursor.last_change_time();
    match store.persist(last_change_time).await {
        Ok(()) => info!(last_change_time, "Final checkpoint persisted"),
        Err(e) => error!(error = %e, last_change_time, "Failed to persist final checkpoint"),
    }

    if let Err(e) = store.release().await {
        warn!(error = %e, "Failed to release checkpoint key");
    }
    lock.release().await;
}
