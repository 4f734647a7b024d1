//! Event sink: a bounded queue drained by a fixed pool of writer workers.
//!
//! The watcher hands serialized events to [`Sink::put`], which applies
//! backpressure once the queue is full. Workers pull from the shared queue
//! and write each payload to a [`SinkBackend`]. A failed write is logged and
//! dropped; the worker moves on to the next payload.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::SinkConfig;

mod amqp;
mod kinesis;
mod memory;
mod stdout;

pub use amqp::AmqpBackend;
pub use kinesis::KinesisBackend;
pub use memory::MemoryBackend;
pub use stdout::ConsoleBackend;

/// Errors from the sink and its backends.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("sink is stopped")]
    Closed,

    #[error("sink workers already started")]
    AlreadyStarted,

    #[error("failed to connect {backend} sink: {message}")]
    Connect {
        backend: &'static str,
        message: String,
    },

    #[error("{backend} write failed: {message}")]
    Write {
        backend: &'static str,
        message: String,
    },
}

/// Write capability of a concrete transport.
#[async_trait]
pub trait SinkBackend: Send + Sync {
    /// Label used in logs.
    fn name(&self) -> &'static str;

    /// Write one serialized event.
    async fn write(&self, payload: &[u8]) -> Result<(), SinkError>;

    /// Release transport resources. Called once, after the queue is drained.
    async fn close(&self) -> Result<(), SinkError> {
        Ok(())
    }
}

/// Sizing of the queue and worker pool.
#[derive(Debug, Clone)]
pub struct SinkOptions {
    pub workers: usize,
    pub capacity: usize,

    /// How often `stop` checks whether the queue has drained.
    pub drain_poll_interval: Duration,
}

impl Default for SinkOptions {
    fn default() -> Self {
        Self {
            workers: 3,
            capacity: 1000,
            drain_poll_interval: Duration::from_secs(1),
        }
    }
}

/// Bounded multi-worker publisher.
pub struct Sink {
    backend: Arc<dyn SinkBackend>,
    options: SinkOptions,
    tx: Mutex<Option<mpsc::Sender<Bytes>>>,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<Bytes>>>,
    queued: Arc<AtomicUsize>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
}

impl Sink {
    pub fn new(backend: Arc<dyn SinkBackend>, options: SinkOptions) -> Self {
        let options = SinkOptions {
            workers: options.workers.max(1),
            capacity: options.capacity.max(1),
            ..options
        };
        let (tx, rx) = mpsc::channel(options.capacity);

        Self {
            backend,
            options,
            tx: Mutex::new(Some(tx)),
            rx: Arc::new(tokio::sync::Mutex::new(rx)),
            queued: Arc::new(AtomicUsize::new(0)),
            workers: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
        }
    }

    /// Spawn the writer workers.
    pub fn start(&self) -> Result<(), SinkError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(SinkError::AlreadyStarted);
        }

        info!(
            backend = self.backend.name(),
            workers = self.options.workers,
            capacity = self.options.capacity,
            "Starting sink workers"
        );

        let mut workers = self.workers.lock().map_err(|_| SinkError::Closed)?;
        for worker_id in 0..self.options.workers {
            workers.push(tokio::spawn(run_worker(
                worker_id,
                Arc::clone(&self.backend),
                Arc::clone(&self.rx),
                Arc::clone(&self.queued),
            )));
        }

        Ok(())
    }

    /// Enqueue one payload, waiting while the queue is full.
    pub async fn put(&self, payload: Bytes) -> Result<(), SinkError> {
        let tx = self
            .tx
            .lock()
            .ok()
            .and_then(|tx| tx.clone())
            .ok_or(SinkError::Closed)?;

        let permit = tx.reserve().await.map_err(|_| SinkError::Closed)?;
        self.queued.fetch_add(1, Ordering::SeqCst);
        permit.send(payload);
        Ok(())
    }

    /// Payloads waiting for a worker.
    pub fn queue_len(&self) -> usize {
        self.queued.load(Ordering::SeqCst)
    }

    /// Refuse further puts, wait for the queue to drain, then close the
    /// backend.
    ///
    /// This waits as long as the backend takes; wrap it in a timeout if a
    /// hard deadline is needed.
    pub async fn stop(&self) -> Result<(), SinkError> {
        let tx = self.tx.lock().ok().and_then(|mut tx| tx.take());
        drop(tx);

        if !self.started.load(Ordering::SeqCst) {
            debug!("Sink stopped before start; starting workers to drain");
            // A concurrent start is harmless here.
            let _ = self.start();
        }

        info!(
            backend = self.backend.name(),
            queued = self.queue_len(),
            "Stopping sink"
        );

        loop {
            let remaining = self.queue_len();
            if remaining == 0 {
                break;
            }
            info!(remaining, "Waiting for sink queue to drain");
            tokio::time::sleep(self.options.drain_poll_interval).await;
        }

        let workers = self
            .workers
            .lock()
            .map(|mut w| std::mem::take(&mut *w))
            .unwrap_or_default();
        for worker in workers {
            if let Err(e) = worker.await {
                warn!(error = %e, "Sink worker ended abnormally");
            }
        }

        self.backend.close().await?;
        info!(backend = self.backend.name(), "Sink stopped");
        Ok(())
    }
}

async fn run_worker(
    worker_id: usize,
    backend: Arc<dyn SinkBackend>,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<Bytes>>>,
    queued: Arc<AtomicUsize>,
) {
    debug!(worker_id, "Sink worker started");

    loop {
        let next = rx.lock().await.recv().await;
        let Some(payload) = next else {
            break;
        };
        queued.fetch_sub(1, Ordering::SeqCst);

        if let Err(e) = backend.write(&payload).await {
            error!(worker_id, backend = backend.name(), error = %e, "Failed to write event");
        }
    }

    debug!(worker_id, "Sink worker exiting");
}

/// Build the backend selected by configuration.
pub async fn connect(config: &SinkConfig) -> Result<Arc<dyn SinkBackend>, SinkError> {
    let backend: Arc<dyn SinkBackend> = match config {
        SinkConfig::Kinesis {
            stream_name,
            partition_key,
        } => Arc::new(KinesisBackend::connect(stream_name, partition_key).await),
        SinkConfig::Amqp {
            connection,
            exchange,
            routing_key,
        } => Arc::new(AmqpBackend::connect(connection, exchange, routing_key).await?),
        SinkConfig::Stdout => Arc::new(ConsoleBackend::stdout()),
    };

    info!(backend = backend.name(), "Sink backend ready");
    Ok(backend)
}
