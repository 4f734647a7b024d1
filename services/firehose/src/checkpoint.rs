//! Checkpoint store for the watcher's high-water mark.
//!
//! The mark lives in a single KV key as a decimal string. Writes go through
//! the leadership session, so once that session is gone the store refuses
//! them instead of letting a deposed leader move the checkpoint.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::consul::{KvError, KvStore};
use crate::cursor::SharedCursor;

/// Errors from checkpoint operations.
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error(transparent)]
    Kv(#[from] KvError),

    #[error("checkpoint at {key} is not a timestamp: {value:?}")]
    Corrupt { key: String, value: String },

    #[error("checkpoint write to {key} was rejected; the key is held by another session")]
    Rejected { key: String },

    #[error("checkpoint restore cancelled by shutdown")]
    Cancelled,
}

/// Persists and restores the high-water mark.
pub struct CheckpointStore {
    kv: Arc<dyn KvStore>,
    key: String,
    session_id: String,
}

impl CheckpointStore {
    pub fn new(
        kv: Arc<dyn KvStore>,
        key: impl Into<String>,
        session_id: impl Into<String>,
    ) -> Self {
        Self {
            kv,
            key: key.into(),
            session_id: session_id.into(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Read the persisted mark. `None` means cold start.
    pub async fn restore(&self) -> Result<Option<i64>, CheckpointError> {
        let Some(entry) = self.kv.get(&self.key).await? else {
            return Ok(None);
        };

        let raw = String::from_utf8_lossy(&entry.value);
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Ok(None);
        }

        trimmed
            .parse::<i64>()
            .map(Some)
            .map_err(|_| CheckpointError::Corrupt {
                key: self.key.clone(),
                value: trimmed.to_string(),
            })
    }

    /// Restore, retrying transport failures every `backoff` until it
    /// succeeds or shutdown is signalled.
    pub async fn restore_with_retry(
        &self,
        backoff: Duration,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<Option<i64>, CheckpointError> {
        loop {
            match self.restore().await {
                Err(CheckpointError::Kv(e)) => {
                    warn!(key = %self.key, error = %e, "Failed to read checkpoint; retrying");
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        _ = stopped(shutdown) => return Err(CheckpointError::Cancelled),
                    }
                }
                other => return other,
            }
        }
    }

    /// Write the mark under the leadership session.
    pub async fn persist(&self, last_change_time: i64) -> Result<(), CheckpointError> {
        let value = last_change_time.to_string();
        debug!(key = %self.key, last_change_time, "Writing checkpoint");

        if !self
            .kv
            .acquire(&self.key, value.as_bytes(), &self.session_id)
            .await?
        {
            return Err(CheckpointError::Rejected {
                key: self.key.clone(),
            });
        }

        Ok(())
    }

    /// Give up the session's hold on the checkpoint key, keeping its value.
    pub async fn release(&self) -> Result<(), CheckpointError> {
        self.kv.release(&self.key, &self.session_id).await?;
        Ok(())
    }
}

/// Resolves once shutdown is signalled or its sender is gone.
///
/// Yields `()` so no `watch::Ref` outlives the wait in a `select!`.
async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

/// Periodically persist the cursor's high-water mark until shutdown.
///
/// Failed writes are logged and retried on the next tick. A mark is written
/// once and then only when it moves.
pub async fn run_persister(
    store: Arc<CheckpointStore>,
    cursor: Arc<SharedCursor>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(
        key = %store.key(),
        interval_secs = interval.as_secs(),
        "Starting checkpoint persister"
    );

    let mut persisted: Option<i64> = None;
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let current = cursor.last_change_time();
                if persisted == Some(current) {
                    continue;
                }

                match store.persist(current).await {
                    Ok(()) => {
                        info!(last_change_time = current, "Checkpoint persisted");
                        persisted = Some(current);
                    }
                    Err(e) => {
                        error!(error = %e, last_change_time = current, "Failed to persist checkpoint");
                    }
                }
            }
            _ = stopped(&mut shutdown) => {
                info!("Checkpoint persister shutting down");
                break;
            }
        }
    }
}
