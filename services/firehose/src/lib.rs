//! Allocation Event Firehose
//!
//! Watches the orchestrator's allocation state and publishes every task state
//! transition, exactly once per process lifetime, to a configurable sink.
//! One instance in the cluster is active at a time; progress survives
//! restarts through a checkpoint in the KV store.
//!
//! ## Architecture
//!
//! ```text
//! Firehose (coordinator)
//! ├── LeaderElector        (session-bound KV lock, renewed every TTL/2)
//! ├── CheckpointStore      (high-water mark, persisted periodically)
//! ├── Watcher              (long-poll -> diff -> publish)
//! └── Sink                 (bounded queue + N writer workers -> backend)
//! ```
//!
//! ## Modules
//!
//! - `nomad`: orchestrator client, scripted mock, node cache
//! - `consul`: KV client with sessions, in-memory KV
//! - `sink`: queue/worker pool and the stream, broker and console backends

pub mod checkpoint;
pub mod config;
pub mod consul;
pub mod coordinator;
pub mod cursor;
pub mod leader;
pub mod nomad;
pub mod sink;
pub mod watcher;

pub use config::Config;
pub use coordinator::{Firehose, FirehoseSettings};
