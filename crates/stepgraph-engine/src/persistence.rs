//! Snapshots of step state and join buffers in a [`StorageConnector`].
//!
//! Two documents per node and run:
//! - `{run_id}.{step_id}.StepState`: `{kind, state, child_run_id, updated_at}`
//! - `{run_id}.{step_id}.StepEdgesData`: `{group_id: {parameter: value}}`

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use stepgraph_core::error::{ProcessError, Result};
use stepgraph_core::traits::StorageConnector;
use stepgraph_core::types::RunId;

use crate::router::JoinBuffers;

pub const STEP_STATE_SUFFIX: &str = "StepState";
pub const STEP_EDGES_SUFFIX: &str = "StepEdgesData";

pub fn step_state_key(run_id: &RunId, step_id: &str) -> String {
    format!("{}.{}.{}", run_id, step_id, STEP_STATE_SUFFIX)
}

pub fn step_edges_key(run_id: &RunId, step_id: &str) -> String {
    format!("{}.{}.{}", run_id, step_id, STEP_EDGES_SUFFIX)
}

/// Persisted state of one node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepStateDocument {
    pub kind: String,
    #[serde(default)]
    pub state: Option<Value>,
    #[serde(default)]
    pub child_run_id: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// Reads and writes instance state through an optional connector.
#[derive(Clone)]
pub struct PersistenceManager {
    storage: Option<Arc<dyn StorageConnector>>,
}

impl PersistenceManager {
    pub fn new(storage: Option<Arc<dyn StorageConnector>>) -> Self {
        Self { storage }
    }

    /// A manager that never touches storage.
    pub fn disabled() -> Self {
        Self { storage: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.storage.is_some()
    }

    pub async fn save_step_state(
        &self,
        run_id: &RunId,
        step_id: &str,
        kind: &str,
        state: Option<Value>,
        child_run_id: Option<&RunId>,
    ) -> Result<()> {
        let Some(storage) = &self.storage else {
            return Ok(());
        };
        let doc = StepStateDocument {
            kind: kind.to_string(),
            state,
            child_run_id: child_run_id.map(|r| r.0.clone()),
            updated_at: Utc::now(),
        };
        let key = step_state_key(run_id, step_id);
        let blob = serde_json::to_value(&doc)?;
        storage.put(&key, blob).await.map_err(persistence_error)?;
        debug!(key = %key, "Saved step state");
        Ok(())
    }

    pub async fn load_step_state(&self, run_id: &RunId, step_id: &str) -> Result<Option<StepStateDocument>> {
        let Some(storage) = &self.storage else {
            return Ok(None);
        };
        let key = step_state_key(run_id, step_id);
        let Some(blob) = storage.get(&key).await.map_err(persistence_error)? else {
            return Ok(None);
        };
        serde_json::from_value(blob)
            .map(Some)
            .map_err(|e| ProcessError::Persistence(format!("malformed document '{}': {}", key, e)))
    }

    /// Write the full join buffer set of a node, empty groups included.
    pub async fn save_join_buffers(&self, run_id: &RunId, step_id: &str, buffers: &JoinBuffers) -> Result<()> {
        let Some(storage) = &self.storage else {
            return Ok(());
        };
        let sorted: BTreeMap<&String, &BTreeMap<String, Value>> = buffers.iter().collect();
        let key = step_edges_key(run_id, step_id);
        let blob = serde_json::to_value(sorted)?;
        storage.put(&key, blob).await.map_err(persistence_error)?;
        debug!(key = %key, groups = buffers.len(), "Saved join buffers");
        Ok(())
    }

    pub async fn load_join_buffers(&self, run_id: &RunId, step_id: &str) -> Result<JoinBuffers> {
        let Some(storage) = &self.storage else {
            return Ok(JoinBuffers::new());
        };
        let key = step_edges_key(run_id, step_id);
        match storage.get(&key).await.map_err(persistence_error)? {
            None | Some(Value::Null) => Ok(JoinBuffers::new()),
            Some(blob) => serde_json::from_value(blob)
                .map_err(|e| ProcessError::Persistence(format!("malformed document '{}': {}", key, e))),
        }
    }
}

fn persistence_error(e: ProcessError) -> ProcessError {
    match e {
        ProcessError::Persistence(_) => e,
        other => {
            warn!(error = %other, "Storage connector failed");
            ProcessError::Persistence(other.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    use futures::future::BoxFuture;
    use serde_json::json;

    #[derive(Default)]
    struct MapStore {
        docs: Mutex<HashMap<String, Value>>,
    }

    impl StorageConnector for MapStore {
        fn get(&self, key: &str) -> BoxFuture<'_, Result<Option<Value>>> {
            let value = self.docs.lock().unwrap().get(key).cloned();
            Box::pin(async move { Ok(value) })
        }

        fn put(&self, key: &str, blob: Value) -> BoxFuture<'_, Result<()>> {
            self.docs.lock().unwrap().insert(key.to_string(), blob);
            Box::pin(async { Ok(()) })
        }
    }

    struct BrokenStore;

    impl StorageConnector for BrokenStore {
        fn get(&self, _key: &str) -> BoxFuture<'_, Result<Option<Value>>> {
            Box::pin(async { Err(ProcessError::Database("disk gone".into())) })
        }

        fn put(&self, _key: &str, _blob: Value) -> BoxFuture<'_, Result<()>> {
            Box::pin(async { Err(ProcessError::Database("disk gone".into())) })
        }
    }

    #[test]
    fn keys_follow_layout() {
        let run = RunId::from_string("run-7");
        assert_eq!(step_state_key(&run, "Sum"), "run-7.Sum.StepState");
        assert_eq!(step_edges_key(&run, "Sum"), "run-7.Sum.StepEdgesData");
    }

    #[tokio::test]
    async fn step_state_round_trip() {
        let store = Arc::new(MapStore::default());
        let manager = PersistenceManager::new(Some(store.clone()));
        let run = RunId::from_string("r");
        let child = RunId::from_string("child");

        manager
            .save_step_state(&run, "Counter", "step", Some(json!({"count": 3})), Some(&child))
            .await
            .unwrap();
        let doc = manager.load_step_state(&run, "Counter").await.unwrap().unwrap();
        assert_eq!(doc.kind, "step");
        assert_eq!(doc.state, Some(json!({"count": 3})));
        assert_eq!(doc.child_run_id.as_deref(), Some("child"));
        assert!(manager.load_step_state(&run, "Other").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn join_buffers_round_trip() {
        let store = Arc::new(MapStore::default());
        let manager = PersistenceManager::new(Some(store.clone()));
        let run = RunId::from_string("r");

        let mut buffers = JoinBuffers::new();
        buffers.entry("g".into()).or_default().insert("a".into(), json!(1));
        manager.save_join_buffers(&run, "Sum", &buffers).await.unwrap();

        let raw = store.docs.lock().unwrap()["r.Sum.StepEdgesData"].clone();
        assert_eq!(raw, json!({"g": {"a": 1}}));

        let loaded = manager.load_join_buffers(&run, "Sum").await.unwrap();
        assert_eq!(loaded, buffers);
    }

    #[tokio::test]
    async fn connector_errors_become_persistence_errors() {
        let manager = PersistenceManager::new(Some(Arc::new(BrokenStore)));
        let run = RunId::new();
        let err = manager
            .save_step_state(&run, "S", "step", None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ProcessError::Persistence(_)));
        let err = manager.load_join_buffers(&run, "S").await.unwrap_err();
        assert!(matches!(err, ProcessError::Persistence(_)));
    }

    #[tokio::test]
    async fn disabled_manager_is_a_no_op() {
        let manager = PersistenceManager::disabled();
        let run = RunId::new();
        manager.save_step_state(&run, "S", "step", None, None).await.unwrap();
        assert!(manager.load_step_state(&run, "S").await.unwrap().is_none());
        assert!(manager.load_join_buffers(&run, "S").await.unwrap().is_empty());
    }
}
