//! Orchestrator access.
//!
//! The watcher only needs two queries from the orchestrator: a long-poll
//! allocation listing keyed by the orchestrator's change index, and a node
//! lookup for optional enrichment. Both sit behind the [`Orchestrator`] trait
//! so the watcher can be driven by [`MockOrchestrator`] in tests.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use firehose_events::{Allocation, Node};

mod client;
mod mock;
mod node_cache;

pub use client::NomadClient;
pub use mock::MockOrchestrator;
pub use node_cache::{NodeCache, NodeResolver};

/// Result of one allocation listing.
#[derive(Debug, Clone, Default)]
pub struct AllocationListing {
    /// The orchestrator's change index for this snapshot.
    pub index: u64,

    /// Every allocation currently visible.
    pub allocations: Vec<Allocation>,
}

/// Orchestrator query interface.
#[async_trait]
pub trait Orchestrator: Send + Sync {
    /// List all allocations, blocking server-side for up to `wait` until the
    /// change index moves past `since_index`. Stale reads are acceptable.
    async fn list_allocations(&self, since_index: u64, wait: Duration)
        -> Result<AllocationListing>;

    /// Read one node record.
    async fn node(&self, node_id: &str) -> Result<Node>;
}
