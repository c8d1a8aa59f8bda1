use std::collections::HashMap;
use std::sync::Mutex;

use futures::future::BoxFuture;
use serde_json::Value;

use stepgraph_core::error::{ProcessError, Result};
use stepgraph_core::traits::StorageConnector;

/// Process-local storage. Everything is lost when the value is dropped.
#[derive(Default)]
pub struct InMemoryStorage {
    docs: Mutex<HashMap<String, Value>>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// All stored keys, sorted.
    pub fn keys(&self) -> Vec<String> {
        let docs = self.docs.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut keys: Vec<String> = docs.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.docs
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl StorageConnector for InMemoryStorage {
    fn get(&self, key: &str) -> BoxFuture<'_, Result<Option<Value>>> {
        let result = self
            .docs
            .lock()
            .map(|docs| docs.get(key).cloned())
            .map_err(|e| ProcessError::Database(e.to_string()));
        Box::pin(async move { result })
    }

    fn put(&self, key: &str, blob: Value) -> BoxFuture<'_, Result<()>> {
        let result = self
            .docs
            .lock()
            .map(|mut docs| {
                docs.insert(key.to_string(), blob);
            })
            .map_err(|e| ProcessError::Database(e.to_string()));
        Box::pin(async move { result })
    }

    fn name(&self) -> &str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn put_then_get() {
        let store = InMemoryStorage::new();
        assert!(store.get("run.Sum.StepState").await.unwrap().is_none());

        store.put("run.Sum.StepState", json!({"n": 1})).await.unwrap();
        store.put("run.Sum.StepState", json!({"n": 2})).await.unwrap();

        assert_eq!(store.get("run.Sum.StepState").await.unwrap(), Some(json!({"n": 2})));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn keys_are_sorted() {
        let store = InMemoryStorage::new();
        store.put("b", json!(1)).await.unwrap();
        store.put("a", json!(2)).await.unwrap();
        assert_eq!(store.keys(), vec!["a", "b"]);
    }
}
