//! Fan-out of a collection into parallel element runs, re-aggregated by
//! element index.

use std::sync::Arc;

use serde_json::{Map, Value};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use stepgraph_core::error::{ProcessError, Result};
use stepgraph_core::types::{ProcessEvent, RunId};

use crate::instance::ProcessInstance;
use crate::router::{bind_arguments, Delivery};
use crate::runtime::Engine;
use crate::template::{InputMapping, MapTemplate};

/// Aggregated result of one map activation.
#[derive(Debug)]
pub(crate) struct MapOutcome {
    /// One event per exported id, carrying a list ordered by element index.
    pub events: Vec<ProcessEvent>,
    pub elements: usize,
}

pub(crate) struct MapOperator;

impl MapOperator {
    /// Run `map.operation` once per element of the collection in `input`.
    ///
    /// Elements run concurrently, at most `max_map_concurrency` at a time.
    /// Nothing is forwarded until every element has finished. The first
    /// element failure aborts the others and fails the whole map.
    #[allow(clippy::too_many_arguments)]
    pub async fn run(
        engine: &Engine,
        map: &MapTemplate,
        scope: &RunId,
        map_id: &str,
        entry: &str,
        mapping: &InputMapping,
        input: Delivery,
        cancel: &CancellationToken,
    ) -> Result<MapOutcome> {
        let elements = element_payloads(map, entry, mapping, input)
            .map_err(|e| map_failure(map_id, entry, None, e))?;
        let count = elements.len();
        debug!(map = map_id, elements = count, "Fanning out map");

        let semaphore = Arc::new(Semaphore::new(engine.config.max_map_concurrency.max(1)));
        let mut set = JoinSet::new();
        for (index, payload) in elements.into_iter().enumerate() {
            let operation = map.operation.clone();
            let engine = engine.clone();
            let run_id = RunId::element(scope, index);
            let token = cancel.child_token();
            let semaphore = semaphore.clone();
            let event = ProcessEvent::new(entry, payload);

            set.spawn(async move {
                let result = async {
                    let _permit = semaphore
                        .acquire_owned()
                        .await
                        .map_err(|_| ProcessError::Cancelled)?;
                    let mut instance = ProcessInstance::load(operation, run_id, engine, false).await?;
                    instance.run(event, &token).await
                }
                .await;
                (index, result)
            });
        }

        let mut results: Vec<Option<Vec<ProcessEvent>>> = vec![None; count];
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    set.abort_all();
                    debug!(map = map_id, "Map cancelled, aborted outstanding elements");
                    return Err(ProcessError::Cancelled);
                }
                next = set.join_next() => next,
            };
            let Some(joined) = next else {
                break;
            };
            match joined {
                Ok((index, Ok(outputs))) => results[index] = Some(outputs),
                Ok((index, Err(e))) => {
                    set.abort_all();
                    if matches!(e, ProcessError::Cancelled) || !e.is_recoverable() {
                        return Err(e);
                    }
                    warn!(map = map_id, element = index, error = %e, "Map element failed");
                    return Err(map_failure(map_id, entry, Some(index), e));
                }
                Err(join_error) => {
                    set.abort_all();
                    return Err(map_failure(
                        map_id,
                        entry,
                        None,
                        ProcessError::failed(format!("element task failed: {}", join_error)),
                    ));
                }
            }
        }

        let events = map
            .exported
            .iter()
            .map(|event_id| {
                let values: Vec<Value> = results
                    .iter()
                    .flatten()
                    .flat_map(|outputs| outputs.iter().filter(|e| e.id == *event_id))
                    .map(|e| e.data.clone())
                    .collect();
                ProcessEvent::new(event_id.clone(), Value::Array(values)).with_source(map_id)
            })
            .collect();

        Ok(MapOutcome {
            events,
            elements: count,
        })
    }
}

fn map_failure(map_id: &str, entry: &str, element: Option<usize>, error: ProcessError) -> ProcessError {
    let message = match element {
        Some(index) => format!("element {}: {}", index, error),
        None => error.to_string(),
    };
    ProcessError::StepExecution {
        step: map_id.to_string(),
        function: entry.to_string(),
        message,
    }
}

/// Split the map input into one start payload per element.
fn element_payloads(map: &MapTemplate, entry: &str, mapping: &InputMapping, input: Delivery) -> Result<Vec<Value>> {
    let base = match &map.step {
        Some(step) => {
            let parameters = step
                .functions
                .get(entry)
                .map(|f| f.parameters.clone())
                .unwrap_or_default();
            Value::Object(bind_arguments(mapping, &parameters, input)?)
        }
        None => input.into_value(),
    };

    match base {
        Value::Array(items) => Ok(items),
        Value::Object(args) => {
            let field = collection_field(&args, map.collection_parameter.as_deref())?;
            let Some(Value::Array(items)) = args.get(&field) else {
                return Err(ProcessError::InvalidInput(format!(
                    "map collection '{}' is not a list",
                    field
                )));
            };
            Ok(items
                .iter()
                .map(|item| {
                    let mut element: Map<String, Value> = args.clone();
                    element.insert(field.clone(), item.clone());
                    Value::Object(element)
                })
                .collect())
        }
        other => Err(ProcessError::InvalidInput(format!(
            "map input must be a list, got {}",
            other
        ))),
    }
}

fn collection_field(args: &Map<String, Value>, named: Option<&str>) -> Result<String> {
    if let Some(name) = named {
        return Ok(name.to_string());
    }
    let mut arrays = args.iter().filter(|(_, v)| v.is_array()).map(|(k, _)| k);
    match (arrays.next(), arrays.next()) {
        (Some(only), None) => Ok(only.clone()),
        (None, _) => Err(ProcessError::InvalidInput(
            "map input has no list-valued argument".into(),
        )),
        (Some(_), Some(_)) => Err(ProcessError::InvalidInput(
            "map input has several list-valued arguments; name the collection".into(),
        )),
    }
}
