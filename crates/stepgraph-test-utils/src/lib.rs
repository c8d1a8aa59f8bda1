//! Mocks and fixtures shared by the stepgraph test suites.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use stepgraph_core::config::EngineConfig;
use stepgraph_core::context::{FunctionInput, StepContext};
use stepgraph_core::error::{ProcessError, Result};
use stepgraph_core::traits::StorageConnector;
use stepgraph_core::types::{ProcessEvent, RunId};

// ---------------------------------------------------------------------------
// Storage mocks
// ---------------------------------------------------------------------------

/// In-memory storage that remembers every write, in order.
#[derive(Default)]
pub struct RecordingStorage {
    docs: Mutex<HashMap<String, Value>>,
    puts: Mutex<Vec<String>>,
}

impl RecordingStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keys written so far, one entry per `put`.
    pub fn puts(&self) -> Vec<String> {
        self.puts.lock().unwrap().clone()
    }

    /// Number of writes to keys ending in `suffix`.
    pub fn put_count(&self, suffix: &str) -> usize {
        self.puts.lock().unwrap().iter().filter(|k| k.ends_with(suffix)).count()
    }

    pub fn document(&self, key: &str) -> Option<Value> {
        self.docs.lock().unwrap().get(key).cloned()
    }

    /// Seed a document without recording a write.
    pub fn insert(&self, key: impl Into<String>, blob: Value) {
        self.docs.lock().unwrap().insert(key.into(), blob);
    }
}

impl StorageConnector for RecordingStorage {
    fn get(&self, key: &str) -> BoxFuture<'_, Result<Option<Value>>> {
        let value = self.docs.lock().unwrap().get(key).cloned();
        Box::pin(async move { Ok(value) })
    }

    fn put(&self, key: &str, blob: Value) -> BoxFuture<'_, Result<()>> {
        self.puts.lock().unwrap().push(key.to_string());
        self.docs.lock().unwrap().insert(key.to_string(), blob);
        Box::pin(async { Ok(()) })
    }

    fn name(&self) -> &str {
        "recording"
    }
}

/// Storage whose writes start failing after a number of successful puts.
pub struct FailingStorage {
    healthy_puts: usize,
    puts: AtomicUsize,
    docs: Mutex<HashMap<String, Value>>,
}

impl FailingStorage {
    /// Every write fails.
    pub fn new() -> Self {
        Self::after(0)
    }

    /// The first `n` writes succeed, every later one fails.
    pub fn after(n: usize) -> Self {
        Self {
            healthy_puts: n,
            puts: AtomicUsize::new(0),
            docs: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for FailingStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl StorageConnector for FailingStorage {
    fn get(&self, key: &str) -> BoxFuture<'_, Result<Option<Value>>> {
        let value = self.docs.lock().unwrap().get(key).cloned();
        Box::pin(async move { Ok(value) })
    }

    fn put(&self, key: &str, blob: Value) -> BoxFuture<'_, Result<()>> {
        let seen = self.puts.fetch_add(1, Ordering::SeqCst);
        if seen < self.healthy_puts {
            self.docs.lock().unwrap().insert(key.to_string(), blob);
            return Box::pin(async { Ok(()) });
        }
        let key = key.to_string();
        Box::pin(async move { Err(ProcessError::Database(format!("write to '{}' refused", key))) })
    }

    fn name(&self) -> &str {
        "failing"
    }
}

// ---------------------------------------------------------------------------
// Counters
// ---------------------------------------------------------------------------

/// Shared invocation counter for step closures.
#[derive(Clone, Default)]
pub struct CallCounter(Arc<AtomicUsize>);

impl CallCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one call and return the new total.
    pub fn hit(&self) -> usize {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn count(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

/// Engine settings for tests: small budgets so runaway graphs fail fast.
pub fn test_engine_config() -> EngineConfig {
    EngineConfig {
        max_activations: 200,
        max_map_concurrency: 4,
        persist: true,
    }
}

/// Build a [`FunctionInput`] from a JSON object literal.
pub fn input(args: Value) -> FunctionInput {
    match args {
        Value::Object(map) => FunctionInput::new(map),
        other => panic!("function input must be an object, got {other}"),
    }
}

/// A standalone step context and the receiving end of its event channel.
pub struct TestContext {
    pub ctx: StepContext,
    pub events: mpsc::UnboundedReceiver<ProcessEvent>,
    pub state: Arc<Mutex<Option<Value>>>,
}

impl TestContext {
    pub fn new(step_id: &str, function: &str) -> Self {
        Self::with_state(step_id, function, None)
    }

    pub fn with_state(step_id: &str, function: &str, state: Option<Value>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let state = Arc::new(Mutex::new(state));
        let ctx = StepContext::new(
            step_id,
            RunId::from_string("test-run"),
            function,
            state.clone(),
            tx,
            CancellationToken::new(),
        );
        Self {
            ctx,
            events: rx,
            state,
        }
    }

    /// Events emitted through the context so far.
    pub fn drain(&mut self) -> Vec<ProcessEvent> {
        let mut out = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            out.push(event);
        }
        out
    }

    pub fn state(&self) -> Option<Value> {
        self.state.lock().unwrap().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use stepgraph_core::types::Visibility;

    #[tokio::test]
    async fn failing_storage_fails_after_budget() {
        let store = FailingStorage::after(1);
        store.put("a", json!(1)).await.unwrap();
        assert!(matches!(store.put("b", json!(2)).await, Err(ProcessError::Database(_))));
        assert_eq!(store.get("a").await.unwrap(), Some(json!(1)));
    }

    #[tokio::test]
    async fn recording_storage_counts_writes() {
        let store = RecordingStorage::new();
        store.put("r.A.StepState", json!(null)).await.unwrap();
        store.put("r.A.StepState", json!(null)).await.unwrap();
        store.put("r.B.StepEdgesData", json!({})).await.unwrap();
        assert_eq!(store.put_count("StepState"), 2);
        assert_eq!(store.puts().len(), 3);
    }

    #[test]
    fn test_context_captures_emits() {
        let mut t = TestContext::new("Greeter", "greet");
        t.ctx.emit_event("Hello", json!("world"), Visibility::Public);
        let events = t.drain();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].source.as_deref(), Some("Greeter"));
    }
}
