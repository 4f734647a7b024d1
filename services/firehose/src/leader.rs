//! Leader election over a session-bound KV lock.
//!
//! Only the process holding the lock runs the firehose. The lock is tied to a
//! TTL session that is renewed in the background; if the holder dies, the
//! session expires and the KV store frees the lock for the next contender.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::consul::{KvError, KvStore};

/// How long to back off when the lock looks free but cannot be taken yet
/// (the KV store's lock-delay after a session invalidation).
pub const DEFAULT_LOCK_RETRY: Duration = Duration::from_secs(5);

/// Server-side wait for blocking reads of a held lock.
const LOCK_WAIT: Duration = Duration::from_secs(300);

/// Errors from leader election.
#[derive(Debug, Error)]
pub enum LockError {
    #[error("failed to create leadership session: {0}")]
    Session(#[source] KvError),

    #[error("failed to acquire lock {key}: {source}")]
    Acquire {
        key: String,
        #[source]
        source: KvError,
    },

    #[error("lock acquisition cancelled by shutdown")]
    Cancelled,
}

/// Settings for [`LeaderElector`].
#[derive(Debug, Clone)]
pub struct ElectionConfig {
    /// Key of the lock.
    pub key: String,

    /// Name given to the session.
    pub session_name: String,

    /// Value stored in the lock key while held.
    pub holder: String,

    /// Session TTL; the session is renewed every half TTL.
    pub session_ttl: Duration,

    /// Back-off when the lock is free but refused.
    pub lock_retry: Duration,
}

/// Acquires the cluster-wide firehose lock.
pub struct LeaderElector {
    kv: Arc<dyn KvStore>,
    config: ElectionConfig,
}

impl LeaderElector {
    pub fn new(kv: Arc<dyn KvStore>, config: ElectionConfig) -> Self {
        Self { kv, config }
    }

    /// Block until the lock is held, or until shutdown is signalled.
    pub async fn acquire(
        &self,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<LeadershipLock, LockError> {
        info!(key = %self.config.key, "Trying to acquire leader lock");

        let session_id = self
            .kv
            .create_session(&self.config.session_name, self.config.session_ttl)
            .await
            .map_err(LockError::Session)?;

        let renewal = spawn_renewal(
            Arc::clone(&self.kv),
            session_id.clone(),
            self.config.session_ttl / 2,
        );

        match self.wait_for_lock(&session_id, shutdown).await {
            Ok(()) => {
                info!(key = %self.config.key, session_id = %session_id, "Lock acquired");
                Ok(LeadershipLock {
                    kv: Arc::clone(&self.kv),
                    key: self.config.key.clone(),
                    session_id,
                    renewal: Mutex::new(Some(renewal)),
                    released: AtomicBool::new(false),
                })
            }
            Err(e) => {
                renewal.abort();
                if let Err(destroy_err) = self.kv.destroy_session(&session_id).await {
                    warn!(session_id = %session_id, error = %destroy_err, "Failed to destroy session");
                }
                Err(e)
            }
        }
    }

    async fn wait_for_lock(
        &self,
        session_id: &str,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<(), LockError> {
        let key = &self.config.key;
        let acquire_err = |source| LockError::Acquire {
            key: key.clone(),
            source,
        };
        let mut index = 0;

        loop {
            let read = tokio::select! {
                read = self.kv.get_blocking(key, index, LOCK_WAIT) => read.map_err(acquire_err)?,
                _ = shutdown.wait_for(|stop| *stop) => return Err(LockError::Cancelled),
            };
            index = read.index;

            if let Some(holder) = read.entry.as_ref().and_then(|e| e.session.as_deref()) {
                if holder != session_id {
                    debug!(key = %key, holder, "Lock held by another session; waiting");
                    continue;
                }
            }

            let acquired = self
                .kv
                .acquire(key, self.config.holder.as_bytes(), session_id)
                .await
                .map_err(acquire_err)?;
            if acquired {
                return Ok(());
            }

            debug!(key = %key, "Lock refused while free; backing off");
            tokio::select! {
                _ = tokio::time::sleep(self.config.lock_retry) => {}
                _ = shutdown.wait_for(|stop| *stop) => return Err(LockError::Cancelled),
            }
        }
    }
}

fn spawn_renewal(kv: Arc<dyn KvStore>, session_id: String, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every.max(Duration::from_millis(100)));
        ticker.tick().await;

        loop {
            ticker.tick().await;
            match kv.renew_session(&session_id).await {
                Ok(true) => debug!(session_id = %session_id, "Session renewed"),
                Ok(false) => {
                    error!(session_id = %session_id, "Leadership session no longer exists");
                    break;
                }
                Err(e) => warn!(session_id = %session_id, error = %e, "Failed to renew session"),
            }
        }
    })
}

/// A held leadership lock.
///
/// Dropping the lock without calling [`LeadershipLock::release`] stops
/// nothing; the session expires on its own once renewal stops with the
/// process.
pub struct LeadershipLock {
    kv: Arc<dyn KvStore>,
    key: String,
    session_id: String,
    renewal: Mutex<Option<JoinHandle<()>>>,
    released: AtomicBool,
}

impl LeadershipLock {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }

    /// Release the lock and destroy the session. Calling it again is a no-op.
    pub async fn release(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Some(renewal) = self.renewal.lock().ok().and_then(|mut r| r.take()) {
            renewal.abort();
        }

        match self.kv.release(&self.key, &self.session_id).await {
            Ok(true) => info!(key = %self.key, "Lock released"),
            Ok(false) => warn!(key = %self.key, "Lock was no longer held at release"),
            Err(e) => warn!(key = %self.key, error = %e, "Failed to release lock"),
        }

        if let Err(e) = self.kv.destroy_session(&self.session_id).await {
            warn!(session_id = %self.session_id, error = %e, "Failed to destroy session");
        }
    }
}
