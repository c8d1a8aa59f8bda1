use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use futures::FutureExt;
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use stepgraph_core::context::{FunctionInput, StepContext};
use stepgraph_core::error::{ProcessError, Result};
use stepgraph_core::types::{function_result_event, ProcessEvent, RunId};

use crate::template::StepDefinition;

/// Result of one successful function invocation.
#[derive(Debug, Clone)]
pub struct StepOutcome {
    /// Events raised through the context, in emission order, followed by the
    /// `"{function}.OnResult"` event carrying the return value.
    pub events: Vec<ProcessEvent>,
    pub elapsed_ms: u64,
}

/// Invokes step functions.
pub struct StepExecutor;

impl StepExecutor {
    /// Run `step.function` with `args` and collect what it raised.
    ///
    /// The body is raced against `cancel`; a cancelled body is dropped and
    /// `Cancelled` returned. A panicking body fails like one returning an
    /// error. Events emitted by a failing body are discarded.
    pub async fn invoke(
        step: &StepDefinition,
        function: &str,
        args: Map<String, Value>,
        run_id: &RunId,
        state: Arc<Mutex<Option<Value>>>,
        cancel: &CancellationToken,
    ) -> Result<StepOutcome> {
        let entry = step.functions.get(function).ok_or_else(|| {
            ProcessError::Topology(format!("step '{}' has no function '{}'", step.id, function))
        })?;

        let (tx, mut rx) = mpsc::unbounded_channel();
        let ctx = StepContext::new(
            step.id.clone(),
            run_id.clone(),
            function,
            state,
            tx,
            cancel.child_token(),
        );

        let start = Instant::now();
        let input = FunctionInput::new(args);
        let body = AssertUnwindSafe(async move { entry.callable.call(input, ctx).await }).catch_unwind();
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ProcessError::Cancelled),
            result = body => result.unwrap_or_else(|panic| {
                Err(ProcessError::failed(format!("step panicked: {}", panic_message(panic.as_ref()))))
            }),
        };
        let elapsed_ms = start.elapsed().as_millis() as u64;

        let value = result?;

        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events.push(ProcessEvent::new(function_result_event(function), value).with_source(step.id.clone()));

        debug!(
            step = %step.id,
            function,
            emitted = events.len() - 1,
            elapsed_ms,
            "Step function returned"
        );

        Ok(StepOutcome { events, elapsed_ms })
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "unknown panic"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::time::Duration;

    use serde_json::json;
    use stepgraph_core::types::Visibility;

    use crate::template::FunctionEntry;

    fn step_with<F, Fut>(name: &str, f: F) -> StepDefinition
    where
        F: Fn(FunctionInput, StepContext) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Value>> + Send + 'static,
    {
        let mut functions = BTreeMap::new();
        functions.insert(
            name.to_string(),
            FunctionEntry {
                name: name.to_string(),
                parameters: vec!["x".into()],
                callable: Arc::new(f),
            },
        );
        StepDefinition {
            id: "S".into(),
            functions,
            initial_state: None,
        }
    }

    fn args(x: Value) -> Map<String, Value> {
        let mut args = Map::new();
        args.insert("x".into(), x);
        args
    }

    #[tokio::test]
    async fn result_event_follows_emitted_events() {
        let step = step_with("double", |input: FunctionInput, ctx: StepContext| async move {
            let x: i64 = input.arg("x")?;
            ctx.emit_event("Seen", json!(x), Visibility::Internal);
            Ok(json!(x * 2))
        });
        let outcome = StepExecutor::invoke(
            &step,
            "double",
            args(json!(4)),
            &RunId::from_string("r"),
            Arc::new(Mutex::new(None)),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        let ids: Vec<_> = outcome.events.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["Seen", "double.OnResult"]);
        assert_eq!(outcome.events[1].data, json!(8));
        assert_eq!(outcome.events[1].source.as_deref(), Some("S"));
    }

    #[tokio::test]
    async fn failing_body_discards_emissions() {
        let step = step_with("fail", |_input: FunctionInput, ctx: StepContext| async move {
            ctx.emit_event("Lost", Value::Null, Visibility::Public);
            Err::<Value, _>(ProcessError::failed("nope"))
        });
        let err = StepExecutor::invoke(
            &step,
            "fail",
            Map::new(),
            &RunId::new(),
            Arc::new(Mutex::new(None)),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ProcessError::Failed(_)));
    }

    #[tokio::test]
    async fn panicking_body_fails_like_an_error() {
        let step = step_with("crash", |input: FunctionInput, _ctx: StepContext| async move {
            let x: i64 = input.arg("x")?;
            if x > 0 {
                panic!("bad input {}", x);
            }
            Ok(Value::Null)
        });
        let err = StepExecutor::invoke(
            &step,
            "crash",
            args(json!(3)),
            &RunId::new(),
            Arc::new(Mutex::new(None)),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
        match err {
            ProcessError::Failed(message) => assert_eq!(message, "step panicked: bad input 3"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn cancellation_interrupts_body() {
        let step = step_with("slow", |_input: FunctionInput, _ctx: StepContext| async move {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(Value::Null)
        });
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });
        let err = StepExecutor::invoke(
            &step,
            "slow",
            Map::new(),
            &RunId::new(),
            Arc::new(Mutex::new(None)),
            &cancel,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ProcessError::Cancelled));
    }
}
