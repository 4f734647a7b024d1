//! Bounded, expiring node cache.
//!
//! Node records change rarely, while every published event of a node would
//! otherwise need a lookup. The cache is an explicit object owned by the
//! resolver; there is no process-wide cache.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use firehose_events::Node;
use tracing::{debug, warn};

use super::Orchestrator;

/// Entries dropped per prune once expired entries alone do not free space.
const PRUNE_BATCH: usize = 10;

struct CachedNode {
    node: Node,
    inserted_at: Instant,
}

/// Node records bounded by entry count and age.
pub struct NodeCache {
    entries: Mutex<HashMap<String, CachedNode>>,
    max_entries: usize,
    ttl: Duration,
}

impl NodeCache {
    pub fn new(max_entries: usize, ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            max_entries: max_entries.max(1),
            ttl,
        }
    }

    /// Fresh cached record, if any.
    pub fn get(&self, node_id: &str) -> Option<Node> {
        let mut entries = self.entries.lock().ok()?;
        match entries.get(node_id) {
            Some(cached) if cached.inserted_at.elapsed() < self.ttl => Some(cached.node.clone()),
            Some(_) => {
                entries.remove(node_id);
                None
            }
            None => None,
        }
    }

    pub fn insert(&self, node: Node) {
        let Ok(mut entries) = self.entries.lock() else {
            return;
        };

        if !entries.contains_key(&node.id) && entries.len() >= self.max_entries {
            let ttl = self.ttl;
            entries.retain(|_, cached| cached.inserted_at.elapsed() < ttl);

            if entries.len() >= self.max_entries {
                let mut oldest: Vec<(String, Instant)> = entries
                    .iter()
                    .map(|(id, cached)| (id.clone(), cached.inserted_at))
                    .collect();
                oldest.sort_by_key(|(_, inserted_at)| *inserted_at);
                let excess = entries.len() + 1 - self.max_entries;
                for (id, _) in oldest.into_iter().take(excess.max(PRUNE_BATCH)) {
                    entries.remove(&id);
                }
            }
        }

        entries.insert(
            node.id.clone(),
            CachedNode {
                node,
                inserted_at: Instant::now(),
            },
        );
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Resolves node records through the cache, falling back to the orchestrator.
pub struct NodeResolver {
    orchestrator: Arc<dyn Orchestrator>,
    cache: NodeCache,
}

impl NodeResolver {
    pub fn new(orchestrator: Arc<dyn Orchestrator>, cache: NodeCache) -> Self {
        Self {
            orchestrator,
            cache,
        }
    }

    /// Look up a node. Failures are logged and yield `None`.
    pub async fn resolve(&self, node_id: &str) -> Option<Node> {
        if node_id.is_empty() {
            return None;
        }

        if let Some(node) = self.cache.get(node_id) {
            return Some(node);
        }

        match self.orchestrator.node(node_id).await {
            Ok(node) => {
                debug!(node_id, datacenter = %node.datacenter, "Cached node record");
                self.cache.insert(node.clone());
                Some(node)
            }
            Err(e) => {
                warn!(node_id, error = %e, "Failed to resolve node; publishing without placement");
                None
            }
        }
    }

    pub fn cache(&self) -> &NodeCache {
        &self.cache
    }
}
