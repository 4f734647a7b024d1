//! Outbound allocation event record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::allocation::{Allocation, Node, TaskEvent, TaskState};
use crate::error::EventError;

/// One published record per (allocation, task, task event).
///
/// Built once from the allocation listing and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AllocationEvent {
    pub name: String,

    #[serde(rename = "AllocationID")]
    pub allocation_id: String,

    pub desired_status: String,
    pub desired_description: String,
    pub client_status: String,
    pub client_description: String,

    #[serde(rename = "JobID")]
    pub job_id: String,

    pub group_name: String,
    pub task_name: String,

    #[serde(rename = "EvalID")]
    pub eval_id: String,

    pub task_state: String,
    pub task_failed: bool,
    pub task_started_at: Option<DateTime<Utc>>,
    pub task_finished_at: Option<DateTime<Utc>>,

    /// The orchestrator's event, including fields this crate does not model.
    pub task_event: TaskEvent,

    #[serde(rename = "NodeID", default, skip_serializing_if = "String::is_empty")]
    pub node_id: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub node_name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub datacenter: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_class: Option<String>,
}

/// Identity of an emitted event. No two records in one process lifetime
/// share an identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EventIdentity {
    pub allocation_id: String,
    pub task_name: String,
    pub time: i64,
}

impl AllocationEvent {
    /// Build the record for one task event of an allocation.
    pub fn new(
        allocation: &Allocation,
        task_name: &str,
        state: &TaskState,
        event: &TaskEvent,
    ) -> Self {
        Self {
            name: allocation.name.clone(),
            allocation_id: allocation.id.clone(),
            desired_status: allocation.desired_status.clone(),
            desired_description: allocation.desired_description.clone(),
            client_status: allocation.client_status.clone(),
            client_description: allocation.client_description.clone(),
            job_id: allocation.job_id.clone(),
            group_name: allocation.task_group.clone(),
            task_name: task_name.to_string(),
            eval_id: allocation.eval_id.clone(),
            task_state: state.state.clone(),
            task_failed: state.failed,
            task_started_at: state.started_at,
            task_finished_at: state.finished_at,
            task_event: event.clone(),
            node_id: allocation.node_id.clone(),
            node_name: allocation.node_name.clone(),
            datacenter: None,
            node_class: None,
        }
    }

    /// Attach node placement details.
    pub fn with_node(mut self, node: &Node) -> Self {
        if !node.datacenter.is_empty() {
            self.datacenter = Some(node.datacenter.clone());
        }
        if !node.node_class.is_empty() {
            self.node_class = Some(node.node_class.clone());
        }
        self
    }

    /// Timestamp of the underlying task event, in epoch nanoseconds.
    pub fn time(&self) -> i64 {
        self.task_event.time
    }

    pub fn identity(&self) -> EventIdentity {
        EventIdentity {
            allocation_id: self.allocation_id.clone(),
            task_name: self.task_name.clone(),
            time: self.task_event.time,
        }
    }

    /// Encode the record as the JSON payload handed to sinks.
    pub fn to_payload(&self) -> Result<Vec<u8>, EventError> {
        Ok(serde_json::to_vec(self)?)
    }
}
