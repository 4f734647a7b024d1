//! In-process KV store with sessions and blocking reads.
//!
//! Mirrors the KV semantics the firehose relies on: a global modify index,
//! session-bound locks released on session destruction, and blocking reads
//! that return once the index moves or the wait elapses.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::debug;

use super::{KvEntry, KvError, KvRead, KvStore};

#[derive(Default)]
struct State {
    entries: HashMap<String, KvEntry>,
    sessions: HashSet<String>,
    next_session: u64,
    index: u64,
    fail_reads: bool,
    fail_writes: bool,
}

/// KV store held in memory.
pub struct InMemoryKv {
    state: Mutex<State>,
    index_tx: watch::Sender<u64>,
}

impl Default for InMemoryKv {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryKv {
    pub fn new() -> Self {
        let (index_tx, _) = watch::channel(0);
        Self {
            state: Mutex::new(State::default()),
            index_tx,
        }
    }

    /// Make reads fail with a transport-style error.
    pub fn set_fail_reads(&self, fail: bool) {
        if let Ok(mut state) = self.state.lock() {
            state.fail_reads = fail;
        }
    }

    /// Make writes fail with a transport-style error.
    pub fn set_fail_writes(&self, fail: bool) {
        if let Ok(mut state) = self.state.lock() {
            state.fail_writes = fail;
        }
    }

    /// Drop a session as if its TTL had expired.
    pub fn expire_session(&self, session: &str) {
        self.with_state(|state| {
            Self::invalidate(state, session);
            Ok(())
        })
        .ok();
    }

    /// Current value of a key as a string, for assertions.
    pub fn value_of(&self, key: &str) -> Option<String> {
        let state = self.state.lock().ok()?;
        let entry = state.entries.get(key)?;
        Some(String::from_utf8_lossy(&entry.value).into_owned())
    }

    /// Session currently holding a key.
    pub fn holder_of(&self, key: &str) -> Option<String> {
        let state = self.state.lock().ok()?;
        state.entries.get(key)?.session.clone()
    }

    fn with_state<T>(
        &self,
        f: impl FnOnce(&mut State) -> Result<T, KvError>,
    ) -> Result<T, KvError> {
        let (result, index) = {
            let mut state = self
                .state
                .lock()
                .map_err(|_| KvError::InvalidResponse("state poisoned".into()))?;
            let result = f(&mut state);
            (result, state.index)
        };
        self.index_tx.send_replace(index);
        result
    }

    fn invalidate(state: &mut State, session: &str) {
        if !state.sessions.remove(session) {
            return;
        }
        state.index += 1;
        let index = state.index;
        for entry in state.entries.values_mut() {
            if entry.session.as_deref() == Some(session) {
                entry.session = None;
                entry.modify_index = index;
            }
        }
    }

    fn write(state: &mut State, key: &str, value: &[u8], session: Option<String>) {
        state.index += 1;
        let index = state.index;
        let entry = state.entries.entry(key.to_string()).or_insert_with(|| KvEntry {
            key: key.to_string(),
            value: Vec::new(),
            session: None,
            modify_index: index,
        });
        entry.value = value.to_vec();
        entry.session = session;
        entry.modify_index = index;
    }

    fn read(&self, key: &str) -> Result<KvRead, KvError> {
        let state = self
            .state
            .lock()
            .map_err(|_| KvError::InvalidResponse("state poisoned".into()))?;
        if state.fail_reads {
            return Err(unavailable());
        }
        Ok(KvRead {
            entry: state.entries.get(key).cloned(),
            index: state.index,
        })
    }
}

fn unavailable() -> KvError {
    KvError::Status {
        status: 503,
        body: "kv store unavailable".to_string(),
    }
}

#[async_trait]
impl KvStore for InMemoryKv {
    async fn get(&self, key: &str) -> Result<Option<KvEntry>, KvError> {
        Ok(self.read(key)?.entry)
    }

    async fn get_blocking(
        &self,
        key: &str,
        index: u64,
        wait: Duration,
    ) -> Result<KvRead, KvError> {
        let mut index_rx = self.index_tx.subscribe();
        let deadline = tokio::time::Instant::now() + wait;

        loop {
            let read = self.read(key)?;
            if index == 0 || read.index > index {
                return Ok(read);
            }

            match tokio::time::timeout_at(deadline, index_rx.changed()).await {
                Ok(Ok(())) => continue,
                _ => return self.read(key),
            }
        }
    }

    async fn put(&self, key: &str, value: &[u8]) -> Result<(), KvError> {
        self.with_state(|state| {
            if state.fail_writes {
                return Err(unavailable());
            }
            let session = state.entries.get(key).and_then(|e| e.session.clone());
            Self::write(state, key, value, session);
            Ok(())
        })
    }

    async fn acquire(&self, key: &str, value: &[u8], session: &str) -> Result<bool, KvError> {
        self.with_state(|state| {
            if state.fail_writes {
                return Err(unavailable());
            }
            if !state.sessions.contains(session) {
                return Err(KvError::InvalidSession(session.to_string()));
            }
            let holder = state.entries.get(key).and_then(|e| e.session.clone());
            match holder {
                Some(holder) if holder != session => Ok(false),
                _ => {
                    Self::write(state, key, value, Some(session.to_string()));
                    Ok(true)
                }
            }
        })
    }

    async fn release(&self, key: &str, session: &str) -> Result<bool, KvError> {
        self.with_state(|state| {
            if state.fail_writes {
                return Err(unavailable());
            }
            state.index += 1;
            let index = state.index;
            match state.entries.get_mut(key) {
                Some(entry) if entry.session.as_deref() == Some(session) => {
                    entry.session = None;
                    entry.modify_index = index;
                    Ok(true)
                }
                _ => Ok(false),
            }
        })
    }

    async fn create_session(&self, name: &str, ttl: Duration) -> Result<String, KvError> {
        self.with_state(|state| {
            if state.fail_writes {
                return Err(unavailable());
            }
            state.next_session += 1;
            let id = format!("session-{}", state.next_session);
            state.sessions.insert(id.clone());
            debug!(
                session_id = %id,
                session_name = name,
                ttl_secs = ttl.as_secs(),
                "[MEMORY] Created session"
            );
            Ok(id)
        })
    }

    async fn renew_session(&self, session: &str) -> Result<bool, KvError> {
        let state = self
            .state
            .lock()
            .map_err(|_| KvError::InvalidResponse("state poisoned".into()))?;
        Ok(state.sessions.contains(session))
    }

    async fn destroy_session(&self, session: &str) -> Result<(), KvError> {
        self.with_state(|state| {
            Self::invalidate(state, session);
            Ok(())
        })
    }
}
