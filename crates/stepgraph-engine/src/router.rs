//! Event routing along edges, join accumulation and argument binding.

use std::collections::{BTreeMap, HashMap};

use serde_json::{Map, Value};

use stepgraph_core::error::{ProcessError, Result};
use stepgraph_core::types::ProcessEvent;

use crate::template::{EdgeTemplate, InputMapping, ResolvedTarget, Source};

/// Pending join values of one node: group id -> parameter -> value.
pub type JoinBuffers = HashMap<String, BTreeMap<String, Value>>;

/// What a firing edge hands its target.
#[derive(Debug, Clone, PartialEq)]
pub enum Delivery {
    /// The raw payload of a single-source edge.
    Payload(Value),
    /// Named values collected by a join.
    Args(Map<String, Value>),
}

impl Delivery {
    /// The delivery as one JSON value (join arguments become an object).
    pub fn into_value(self) -> Value {
        match self {
            Self::Payload(v) => v,
            Self::Args(args) => Value::Object(args),
        }
    }
}

/// A target ready to be invoked.
#[derive(Debug, Clone)]
pub struct Activation {
    pub target: ResolvedTarget,
    pub mapping: InputMapping,
    pub input: Delivery,
    /// Raised by the global error handler route.
    pub from_global: bool,
}

/// Result of feeding one event into one edge.
#[derive(Debug)]
pub enum RouteOutcome {
    Fire(Activation),
    /// The value was stored in join `group` and the edge awaits more sources.
    Buffered { group: String },
}

/// Feeds events into edges.
pub struct EdgeRouter;

impl EdgeRouter {
    /// Deliver `event` from `source` along `edge`.
    ///
    /// For join edges the value overwrites whatever the same source delivered
    /// earlier in this generation; once every parameter is present the edge
    /// fires and the group is cleared.
    pub fn accept(
        edge: &EdgeTemplate,
        source: Source,
        event: &ProcessEvent,
        buffers: &mut JoinBuffers,
        from_global: bool,
    ) -> Result<RouteOutcome> {
        let Some(join) = &edge.join else {
            return Ok(RouteOutcome::Fire(Activation {
                target: edge.target.clone(),
                mapping: edge.mapping.clone(),
                input: Delivery::Payload(event.data.clone()),
                from_global,
            }));
        };

        let parameter = join
            .by_source
            .get(&(source, event.id.clone()))
            .ok_or_else(|| {
                ProcessError::InvalidState(format!(
                    "event '{}' is not a source of join '{}'",
                    event.id, join.group_id
                ))
            })?;

        let buffer = buffers.entry(join.group_id.clone()).or_default();
        buffer.insert(parameter.clone(), event.data.clone());

        if !join.parameters.iter().all(|p| buffer.contains_key(p)) {
            return Ok(RouteOutcome::Buffered {
                group: join.group_id.clone(),
            });
        }

        let args: Map<String, Value> = buffers
            .remove(&join.group_id)
            .unwrap_or_default()
            .into_iter()
            .collect();
        Ok(RouteOutcome::Fire(Activation {
            target: edge.target.clone(),
            mapping: InputMapping::Auto,
            input: Delivery::Args(args),
            from_global,
        }))
    }
}

/// Turn a delivery into the named arguments of a function with `parameters`.
pub fn bind_arguments(mapping: &InputMapping, parameters: &[String], input: Delivery) -> Result<Map<String, Value>> {
    let payload = match input {
        Delivery::Args(args) => return Ok(args),
        Delivery::Payload(payload) => payload,
    };

    match mapping {
        InputMapping::Parameter(name) => {
            let mut args = Map::new();
            args.insert(name.clone(), payload);
            Ok(args)
        }
        InputMapping::Spread => spread(payload),
        InputMapping::Auto => match parameters {
            [] => Ok(Map::new()),
            [only] => {
                let mut args = Map::new();
                args.insert(only.clone(), payload);
                Ok(args)
            }
            _ => spread(payload),
        },
    }
}

fn spread(payload: Value) -> Result<Map<String, Value>> {
    match payload {
        Value::Object(args) => Ok(args),
        Value::Null => Ok(Map::new()),
        other => Err(ProcessError::InvalidInput(format!(
            "expected an object of named arguments, got {}",
            other
        ))),
    }
}
