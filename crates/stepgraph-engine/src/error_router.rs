use tracing::{info, warn};

use stepgraph_core::error::{ProcessError, Result};
use stepgraph_core::types::{function_error_event, ErrorRecord, ProcessEvent, GLOBAL_ERROR_EVENT};

use crate::template::{ProcessTemplate, Source};

/// Where a step failure goes.
#[derive(Debug)]
pub enum ErrorRoute {
    /// Raise this event from the failing node (`"{function}.OnError"`).
    Function(ProcessEvent),
    /// Raise this event from the global error source.
    Global(ProcessEvent),
    /// Nobody handles it; abort the run.
    Fatal(ProcessError),
}

/// Picks the handler for a failed activation.
pub struct ErrorRouter;

impl ErrorRouter {
    /// Route a failure of `function` on node `node`.
    ///
    /// A function-level handler always wins. The global handler is skipped
    /// when the failing activation was itself started by the global handler.
    pub fn route(
        template: &ProcessTemplate,
        node: usize,
        function: &str,
        record: ErrorRecord,
        from_global: bool,
    ) -> Result<ErrorRoute> {
        let event_id = function_error_event(function);
        if template.has_route(Source::Node(node), &event_id) {
            info!(
                step = %record.step_id,
                function,
                error = %record.message,
                "Routing failure to function handler"
            );
            let data = serde_json::to_value(&record)?;
            return Ok(ErrorRoute::Function(
                ProcessEvent::new(event_id, data).with_source(record.step_id),
            ));
        }

        if !from_global && template.has_route(Source::GlobalError, GLOBAL_ERROR_EVENT) {
            info!(
                step = %record.step_id,
                function,
                error = %record.message,
                "Routing failure to global handler"
            );
            let data = serde_json::to_value(&record)?;
            return Ok(ErrorRoute::Global(
                ProcessEvent::new(GLOBAL_ERROR_EVENT, data).with_source(record.step_id),
            ));
        }

        warn!(
            process = %template.name,
            step = %record.step_id,
            function,
            error = %record.message,
            "Unhandled step failure"
        );
        Ok(ErrorRoute::Fatal(record.into_error()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};
    use stepgraph_core::context::{FunctionInput, StepContext};
    use stepgraph_core::types::RunId;

    use crate::builder::{ProcessBuilder, StepBuilder, Target};

    async fn boom(_input: FunctionInput, _ctx: StepContext) -> Result<Value> {
        Err(ProcessError::failed("boom"))
    }

    fn record() -> ErrorRecord {
        ErrorRecord::new(&RunId::from_string("r"), "Risky", "run", &ProcessError::failed("boom"))
    }

    fn template(function_handler: bool, global_handler: bool) -> std::sync::Arc<ProcessTemplate> {
        let mut process = ProcessBuilder::new("P");
        let risky = process.add_step(StepBuilder::new("Risky").function("run", &[], boom));
        let sink = process.add_step(StepBuilder::new("Sink").function("take", &["error"], boom));
        process
            .on_input_event("Start")
            .send_event_to(Target::function(risky, "run"));
        if function_handler {
            process
                .on_function_error(risky, "run")
                .send_event_to(Target::function(sink, "take"));
        }
        if global_handler {
            process.on_error().send_event_to(Target::emit_public("Failed"));
        }
        process.build().unwrap()
    }

    #[test]
    fn function_handler_wins_over_global() {
        let route = ErrorRouter::route(&template(true, true), 0, "run", record(), false).unwrap();
        match route {
            ErrorRoute::Function(event) => {
                assert_eq!(event.id, "run.OnError");
                assert_eq!(event.data["message"], json!("boom"));
            }
            other => panic!("expected function route, got {other:?}"),
        }
    }

    #[test]
    fn falls_back_to_global_then_fatal() {
        let route = ErrorRouter::route(&template(false, true), 0, "run", record(), false).unwrap();
        assert!(matches!(route, ErrorRoute::Global(ref e) if e.id == GLOBAL_ERROR_EVENT));

        let route = ErrorRouter::route(&template(false, false), 0, "run", record(), false).unwrap();
        assert!(matches!(route, ErrorRoute::Fatal(ProcessError::StepExecution { .. })));
    }

    #[test]
    fn global_handler_failures_are_not_rerouted_to_global() {
        let route = ErrorRouter::route(&template(false, true), 0, "run", record(), true).unwrap();
        assert!(matches!(route, ErrorRoute::Fatal(_)));
    }
}
