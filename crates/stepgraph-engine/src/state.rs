use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Point-in-time view of a process instance, returned by
/// [`crate::ProcessHandle::get_state`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessStateSnapshot {
    pub name: String,
    pub run_id: String,
    pub steps: Vec<StepSnapshot>,
    pub edges: Vec<EdgeSnapshot>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepSnapshot {
    pub id: String,
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<Value>,
    /// Join buffers awaiting more sources: group id -> parameter -> value.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub pending_edges: BTreeMap<String, BTreeMap<String, Value>>,
    /// State of the nested process, for process nodes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process: Option<Box<ProcessStateSnapshot>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeSnapshot {
    pub source: String,
    pub event_id: String,
    pub target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub join_group: Option<String>,
}

impl ProcessStateSnapshot {
    pub fn step(&self, id: &str) -> Option<&StepSnapshot> {
        self.steps.iter().find(|s| s.id == id)
    }

    /// State of step `id`, if it has any.
    pub fn step_state(&self, id: &str) -> Option<&Value> {
        self.step(id).and_then(|s| s.state.as_ref())
    }
}
