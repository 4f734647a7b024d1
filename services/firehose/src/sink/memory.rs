//! In-memory sink backend for tests.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::watch;

use super::{SinkBackend, SinkError};

/// Records every payload it is asked to write.
///
/// Writes can be made to fail, or to block until unblocked, to exercise
/// worker error handling and backpressure.
pub struct MemoryBackend {
    payloads: Mutex<Vec<Vec<u8>>>,
    attempts: AtomicUsize,
    failing: AtomicBool,
    closed: AtomicBool,
    blocked: watch::Sender<bool>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        let (blocked, _) = watch::channel(false);
        Self {
            payloads: Mutex::new(Vec::new()),
            attempts: AtomicUsize::new(0),
            failing: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            blocked,
        }
    }

    /// Successfully written payloads, in write order.
    pub fn payloads(&self) -> Vec<Vec<u8>> {
        self.payloads
            .lock()
            .map(|p| p.clone())
            .unwrap_or_default()
    }

    /// Successfully written payloads parsed as JSON.
    pub fn json_payloads(&self) -> Vec<serde_json::Value> {
        self.payloads()
            .iter()
            .filter_map(|p| serde_json::from_slice(p).ok())
            .collect()
    }

    /// Number of write calls, failed ones included.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Hold every write until called again with `false`.
    pub fn set_blocked(&self, blocked: bool) {
        self.blocked.send_replace(blocked);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SinkBackend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn write(&self, payload: &[u8]) -> Result<(), SinkError> {
        let mut blocked = self.blocked.subscribe();
        // The sender lives in `self`, so this only errors if we are dropped.
        let _ = blocked.wait_for(|b| !*b).await;

        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(SinkError::Write {
                backend: "memory",
                message: "injected failure".to_string(),
            });
        }

        if let Ok(mut payloads) = self.payloads.lock() {
            payloads.push(payload.to_vec());
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), SinkError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
