use std::sync::{Arc, Mutex, MutexGuard};

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{ProcessError, Result};
use crate::types::{ProcessEvent, RunId, Visibility};

/// Named arguments handed to a step function.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FunctionInput {
    args: Map<String, Value>,
}

impl FunctionInput {
    pub fn new(args: Map<String, Value>) -> Self {
        Self { args }
    }

    /// Deserialize the argument bound to `name`.
    pub fn arg<T: DeserializeOwned>(&self, name: &str) -> Result<T> {
        let value = self
            .args
            .get(name)
            .ok_or_else(|| ProcessError::InvalidInput(format!("missing argument '{}'", name)))?;
        serde_json::from_value(value.clone())
            .map_err(|e| ProcessError::InvalidInput(format!("argument '{}': {}", name, e)))
    }

    /// Deserialize all arguments as one object.
    pub fn value<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(Value::Object(self.args.clone()))
            .map_err(|e| ProcessError::InvalidInput(e.to_string()))
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.args.get(name)
    }

    pub fn args(&self) -> &Map<String, Value> {
        &self.args
    }

    pub fn into_args(self) -> Map<String, Value> {
        self.args
    }
}

/// Handle a step function uses to talk back to its process instance.
///
/// Events emitted here are queued and only dispatched after the function
/// returns successfully; a failing body's emissions are dropped.
#[derive(Clone)]
pub struct StepContext {
    step_id: String,
    run_id: RunId,
    function: String,
    state: Arc<Mutex<Option<Value>>>,
    emitter: mpsc::UnboundedSender<ProcessEvent>,
    cancel: CancellationToken,
}

impl StepContext {
    pub fn new(
        step_id: impl Into<String>,
        run_id: RunId,
        function: impl Into<String>,
        state: Arc<Mutex<Option<Value>>>,
        emitter: mpsc::UnboundedSender<ProcessEvent>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            step_id: step_id.into(),
            run_id,
            function: function.into(),
            state,
            emitter,
            cancel,
        }
    }

    pub fn step_id(&self) -> &str {
        &self.step_id
    }

    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    pub fn function(&self) -> &str {
        &self.function
    }

    /// Token cancelled when the run is cancelled.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Raise an event from this step.
    pub fn emit_event(&self, id: impl Into<String>, data: Value, visibility: Visibility) {
        let event = ProcessEvent::new(id, data)
            .with_visibility(visibility)
            .with_source(self.step_id.clone());
        // The receiver lives as long as the activation; a closed channel means
        // the activation was abandoned.
        let _ = self.emitter.send(event);
    }

    /// Current step state, or `None` if the step has none yet.
    pub fn state<T: DeserializeOwned>(&self) -> Result<Option<T>> {
        let guard = self.lock();
        match guard.as_ref() {
            Some(Value::Null) | None => Ok(None),
            Some(value) => serde_json::from_value(value.clone())
                .map(Some)
                .map_err(|e| ProcessError::InvalidState(e.to_string())),
        }
    }

    pub fn set_state<T: Serialize>(&self, state: &T) -> Result<()> {
        let value =
            serde_json::to_value(state).map_err(|e| ProcessError::InvalidState(e.to_string()))?;
        *self.lock() = Some(value);
        Ok(())
    }

    /// Read-modify-write the step state, starting from `T::default()` when
    /// the step has none.
    pub fn update_state<T, R>(&self, f: impl FnOnce(&mut T) -> R) -> Result<R>
    where
        T: DeserializeOwned + Serialize + Default,
    {
        let mut guard = self.lock();
        let mut state: T = match guard.as_ref() {
            Some(Value::Null) | None => T::default(),
            Some(value) => serde_json::from_value(value.clone())
                .map_err(|e| ProcessError::InvalidState(e.to_string()))?,
        };
        let out = f(&mut state);
        *guard = Some(
            serde_json::to_value(&state).map_err(|e| ProcessError::InvalidState(e.to_string()))?,
        );
        Ok(out)
    }

    fn lock(&self) -> MutexGuard<'_, Option<Value>> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl std::fmt::Debug for StepContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepContext")
            .field("step_id", &self.step_id)
            .field("run_id", &self.run_id)
            .field("function", &self.function)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    fn context() -> (StepContext, mpsc::UnboundedReceiver<ProcessEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let ctx = StepContext::new(
            "Counter",
            RunId::from_string("run"),
            "count",
            Arc::new(Mutex::new(None)),
            tx,
            CancellationToken::new(),
        );
        (ctx, rx)
    }

    #[test]
    fn arg_reports_missing_and_mistyped() {
        let mut args = Map::new();
        args.insert("x".into(), json!("not a number"));
        let input = FunctionInput::new(args);
        assert!(matches!(input.arg::<i64>("y"), Err(ProcessError::InvalidInput(_))));
        assert!(matches!(input.arg::<i64>("x"), Err(ProcessError::InvalidInput(_))));
        assert_eq!(input.arg::<String>("x").unwrap(), "not a number");
    }

    #[test]
    fn value_reads_all_arguments() {
        #[derive(Deserialize)]
        struct Pair {
            a: i64,
            b: i64,
        }
        let mut args = Map::new();
        args.insert("a".into(), json!(2));
        args.insert("b".into(), json!(5));
        let pair: Pair = FunctionInput::new(args).value().unwrap();
        assert_eq!(pair.a + pair.b, 7);
    }

    #[test]
    fn update_state_starts_from_default() {
        let (ctx, _rx) = context();
        assert_eq!(ctx.state::<u32>().unwrap(), None);
        let n = ctx.update_state(|count: &mut u32| {
            *count += 1;
            *count
        });
        assert_eq!(n.unwrap(), 1);
        ctx.update_state(|count: &mut u32| *count += 1).unwrap();
        assert_eq!(ctx.state::<u32>().unwrap(), Some(2));
    }

    #[test]
    fn emitted_events_carry_source() {
        let (ctx, mut rx) = context();
        ctx.emit_event("Tick", json!(1), Visibility::Public);
        let event = rx.try_recv().unwrap();
        assert_eq!(event.id, "Tick");
        assert_eq!(event.source.as_deref(), Some("Counter"));
        assert!(event.is_public());
    }
}
