//! Scripted orchestrator for tests and local development.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use firehose_events::{Allocation, Node};
use tokio::sync::Notify;
use tracing::debug;

use super::{AllocationListing, Orchestrator};

/// Orchestrator that replays queued listings.
///
/// Each `list_allocations` call pops the next scripted response. With the
/// script exhausted the call blocks like a long-poll with no changes until
/// another response is pushed.
#[derive(Default)]
pub struct MockOrchestrator {
    responses: Mutex<VecDeque<Result<AllocationListing>>>,
    nodes: Mutex<HashMap<String, Node>>,
    pushed: Notify,
    polls: AtomicUsize,
    list_calls: AtomicUsize,
    node_calls: AtomicUsize,
}

impl MockOrchestrator {
    /// Create a mock with an empty script.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a listing at the given change index.
    pub fn push_listing(&self, index: u64, allocations: Vec<Allocation>) {
        self.push(Ok(AllocationListing { index, allocations }));
    }

    /// Queue a transport failure.
    pub fn push_error(&self, message: &str) {
        self.push(Err(anyhow::anyhow!(message.to_string())));
    }

    /// Register a node record for lookups.
    pub fn insert_node(&self, node: Node) {
        if let Ok(mut nodes) = self.nodes.lock() {
            nodes.insert(node.id.clone(), node);
        }
    }

    /// Number of listing calls made, including one still waiting.
    pub fn polls(&self) -> usize {
        self.polls.load(Ordering::SeqCst)
    }

    /// Number of listing calls that returned a response.
    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    /// Number of node lookups served.
    pub fn node_calls(&self) -> usize {
        self.node_calls.load(Ordering::SeqCst)
    }

    /// Responses still queued.
    pub fn pending(&self) -> usize {
        self.responses.lock().map(|r| r.len()).unwrap_or(0)
    }

    fn push(&self, response: Result<AllocationListing>) {
        if let Ok(mut responses) = self.responses.lock() {
            responses.push_back(response);
        }
        self.pushed.notify_one();
    }

    fn pop(&self) -> Option<Result<AllocationListing>> {
        self.responses.lock().ok()?.pop_front()
    }
}

#[async_trait]
impl Orchestrator for MockOrchestrator {
    async fn list_allocations(
        &self,
        since_index: u64,
        _wait: Duration,
    ) -> Result<AllocationListing> {
        self.polls.fetch_add(1, Ordering::SeqCst);
        loop {
            if let Some(response) = self.pop() {
                self.list_calls.fetch_add(1, Ordering::SeqCst);
                debug!(since_index, "[MOCK] Serving allocation listing");
                return response;
            }
            self.pushed.notified().await;
        }
    }

    async fn node(&self, node_id: &str) -> Result<Node> {
        self.node_calls.fetch_add(1, Ordering::SeqCst);
        self.nodes
            .lock()
            .map_err(|_| anyhow::anyhow!("node table poisoned"))?
            .get(node_id)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("node {node_id} not found"))
    }
}
