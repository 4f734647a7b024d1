//! Orchestrator allocation model.
//!
//! These types mirror the subset of the Nomad allocation list stub and node
//! records the firehose consumes. Unknown task event fields are preserved so
//! the outbound record can carry the raw event untouched.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::EventError;

/// One allocation as returned by the allocation list endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Allocation {
    #[serde(rename = "ID")]
    pub id: String,

    #[serde(rename = "EvalID", default)]
    pub eval_id: String,

    #[serde(default)]
    pub name: String,

    #[serde(rename = "NodeID", default)]
    pub node_id: String,

    #[serde(default)]
    pub node_name: String,

    #[serde(rename = "JobID", default)]
    pub job_id: String,

    #[serde(default)]
    pub task_group: String,

    #[serde(default)]
    pub desired_status: String,

    #[serde(default)]
    pub desired_description: String,

    #[serde(default)]
    pub client_status: String,

    #[serde(default)]
    pub client_description: String,

    /// Task states keyed by task name. Pending allocations report `null`.
    #[serde(default, deserialize_with = "null_as_default")]
    pub task_states: BTreeMap<String, TaskState>,

    #[serde(default)]
    pub modify_index: u64,
}

/// Lifecycle state of a single task within an allocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TaskState {
    /// `pending`, `running` or `dead`.
    #[serde(default)]
    pub state: String,

    #[serde(default)]
    pub failed: bool,

    #[serde(default)]
    pub restarts: u64,

    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,

    /// Events in the order the orchestrator recorded them.
    #[serde(default, deserialize_with = "null_as_default")]
    pub events: Vec<TaskEvent>,
}

/// A timestamped task state transition.
///
/// `time` is in epoch nanoseconds. Fields not modelled here are kept in
/// `extra` and re-emitted on serialization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TaskEvent {
    #[serde(rename = "Type", default)]
    pub event_type: String,

    pub time: i64,

    #[serde(default)]
    pub message: String,

    #[serde(default)]
    pub display_message: String,

    #[serde(default)]
    pub driver_message: String,

    #[serde(default, deserialize_with = "null_as_default")]
    pub details: BTreeMap<String, String>,

    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl TaskEvent {
    /// Best human-readable description of the event.
    pub fn summary(&self) -> &str {
        [&self.driver_message, &self.display_message, &self.message]
            .into_iter()
            .find(|s| !s.is_empty())
            .map(String::as_str)
            .unwrap_or(self.event_type.as_str())
    }
}

/// Node record, as returned by the node read endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Node {
    #[serde(rename = "ID")]
    pub id: String,

    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub datacenter: String,

    #[serde(default)]
    pub node_class: String,

    #[serde(default)]
    pub status: String,
}

/// Decode an allocation list response body.
pub fn parse_allocations(body: &[u8]) -> Result<Vec<Allocation>, EventError> {
    serde_json::from_slice(body).map_err(|e| EventError::InvalidPayload(e.to_string()))
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;

    const LISTING: &str = r#"[
        {
            "ID": "a1",
            "EvalID": "e1",
            "Name": "web.api[0]",
            "NodeID": "n1",
            "NodeName": "worker-1",
            "JobID": "web",
            "TaskGroup": "api",
            "DesiredStatus": "run",
            "DesiredDescription": "",
            "ClientStatus": "running",
            "ClientDescription": "Tasks are running",
            "CreateIndex": 10,
            "ModifyIndex": 12,
            "TaskStates": {
                "server": {
                    "State": "running",
                    "Failed": false,
                    "Restarts": 1,
                    "StartedAt": "2024-05-01T10:00:00Z",
                    "FinishedAt": "0001-01-01T00:00:00Z",
                    "Events": [
                        {"Type": "Received", "Time": 100, "DisplayMessage": "Task received by client", "Details": {}},
                        {"Type": "Started", "Time": 200, "DriverMessage": "", "ExitCode": 0, "Details": null}
                    ]
                }
            }
        },
        {
            "ID": "a2",
            "JobID": "batch",
            "TaskGroup": "work",
            "TaskStates": null
        }
    ]"#;

    #[test]
    fn test_parse_allocation_listing() {
        let allocations = parse_allocations(LISTING.as_bytes()).unwrap();
        assert_eq!(allocations.len(), 2);

        let first = &allocations[0];
        assert_eq!(first.id, "a1");
        assert_eq!(first.eval_id, "e1");
        assert_eq!(first.node_name, "worker-1");
        assert_eq!(first.modify_index, 12);

        let server = &first.task_states["server"];
        assert_eq!(server.state, "running");
        assert_eq!(server.restarts, 1);
        assert_eq!(server.events.len(), 2);
        assert_eq!(server.events[0].event_type, "Received");
        assert_eq!(server.events[1].time, 200);
        assert!(server.events[1].details.is_empty());

        assert!(allocations[1].task_states.is_empty());
    }

    #[test]
    fn test_task_event_keeps_unknown_fields() {
        let allocations = parse_allocations(LISTING.as_bytes()).unwrap();
        let event = &allocations[0].task_states["server"].events[1];
        assert_eq!(event.extra.get("ExitCode"), Some(&serde_json::json!(0)));

        let json = serde_json::to_value(event).unwrap();
        assert_eq!(json["ExitCode"], 0);
        assert_eq!(json["Type"], "Started");
        assert_eq!(json["Time"], 200);
    }

    #[test]
    fn test_task_event_summary_prefers_driver_message() {
        let mut event = TaskEvent {
            event_type: "Terminated".to_string(),
            time: 1,
            message: String::new(),
            display_message: "Exit Code: 1".to_string(),
            driver_message: String::new(),
            details: BTreeMap::new(),
            extra: serde_json::Map::new(),
        };
        assert_eq!(event.summary(), "Exit Code: 1");

        event.driver_message = "container exited".to_string();
        assert_eq!(event.summary(), "container exited");

        event.driver_message.clear();
        event.display_message.clear();
        assert_eq!(event.summary(), "Terminated");
    }

    #[test]
    fn test_parse_rejects_garbage() {
        let err = parse_allocations(b"{not json").unwrap_err();
        assert!(matches!(err, EventError::InvalidPayload(_)));
    }
}
