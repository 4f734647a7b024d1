//! Distributed KV store access.
//!
//! The leader elector and the checkpoint store only need a handful of KV
//! primitives: plain and blocking reads, session-bound acquire/release, and
//! session lifecycle. [`ConsulClient`] implements them over the Consul HTTP
//! API; [`InMemoryKv`] implements the same semantics in process.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

mod client;
mod memory;

pub use client::ConsulClient;
pub use memory::InMemoryKv;

/// Errors from KV operations.
#[derive(Debug, Error)]
pub enum KvError {
    #[error("KV transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("KV request failed ({status}): {body}")]
    Status { status: u16, body: String },

    #[error("invalid KV response: {0}")]
    InvalidResponse(String),

    #[error("invalid KV token format")]
    InvalidToken,

    #[error("session {0} is not valid")]
    InvalidSession(String),
}

/// One stored key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvEntry {
    pub key: String,
    pub value: Vec<u8>,
    /// Session currently holding the key, if locked.
    pub session: Option<String>,
    pub modify_index: u64,
}

/// Result of a blocking read.
#[derive(Debug, Clone)]
pub struct KvRead {
    pub entry: Option<KvEntry>,
    /// Index to pass to the next blocking read.
    pub index: u64,
}

/// KV store with sessions and session-bound locks.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Read a key. Absence is `Ok(None)`.
    async fn get(&self, key: &str) -> Result<Option<KvEntry>, KvError>;

    /// Read a key, blocking up to `wait` until its index moves past `index`.
    async fn get_blocking(&self, key: &str, index: u64, wait: Duration)
        -> Result<KvRead, KvError>;

    /// Unconditional write.
    async fn put(&self, key: &str, value: &[u8]) -> Result<(), KvError>;

    /// Write and lock the key under `session`. Returns false when another
    /// session holds the key.
    async fn acquire(&self, key: &str, value: &[u8], session: &str) -> Result<bool, KvError>;

    /// Unlock a key held by `session`.
    async fn release(&self, key: &str, session: &str) -> Result<bool, KvError>;

    /// Create a session whose locks are released on invalidation.
    async fn create_session(&self, name: &str, ttl: Duration) -> Result<String, KvError>;

    /// Renew a session. Returns false when the session no longer exists.
    async fn renew_session(&self, session: &str) -> Result<bool, KvError>;

    /// Destroy a session, releasing every key it holds.
    async fn destroy_session(&self, session: &str) -> Result<(), KvError>;
}
