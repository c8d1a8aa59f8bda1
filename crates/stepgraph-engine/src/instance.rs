//! A live process instance and its dispatch loop.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use futures::future::BoxFuture;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use stepgraph_core::error::{ProcessError, Result};
use stepgraph_core::types::{ErrorRecord, ProcessEvent, RunId, RuntimeEvent, Visibility};

use crate::error_router::{ErrorRoute, ErrorRouter};
use crate::executor::StepExecutor;
use crate::map::MapOperator;
use crate::router::{bind_arguments, Activation, Delivery, EdgeRouter, JoinBuffers, RouteOutcome};
use crate::runtime::Engine;
use crate::state::{EdgeSnapshot, ProcessStateSnapshot, StepSnapshot};
use crate::template::{InputMapping, MapTemplate, NodeKind, ProcessTemplate, ResolvedTarget, Source, StepDefinition};

enum NodeRuntime {
    Step { state: Arc<Mutex<Option<Value>>> },
    Process { child: Box<ProcessInstance> },
    Map,
}

/// An event waiting in the dispatch queue.
struct Queued {
    source: Source,
    event: ProcessEvent,
}

impl Queued {
    fn from_node(node: usize, event: ProcessEvent) -> Self {
        Self {
            source: Source::Node(node),
            event,
        }
    }
}

/// Runtime state of one process template under one run id.
pub(crate) struct ProcessInstance {
    template: Arc<ProcessTemplate>,
    run_id: RunId,
    nodes: Vec<NodeRuntime>,
    joins: Vec<JoinBuffers>,
    engine: Engine,
    activations: usize,
}

fn read_state(state: &Mutex<Option<Value>>) -> Option<Value> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).clone()
}

impl ProcessInstance {
    /// Instantiate `template` under `run_id`.
    ///
    /// With `restore`, step states, nested run ids and join buffers persisted
    /// under `run_id` are loaded first. A restored join buffer naming a group
    /// or parameter the template does not know is rejected.
    pub fn load(
        template: Arc<ProcessTemplate>,
        run_id: RunId,
        engine: Engine,
        restore: bool,
    ) -> BoxFuture<'static, Result<Self>> {
        Box::pin(async move {
            let mut nodes = Vec::with_capacity(template.nodes.len());
            let mut joins = Vec::with_capacity(template.nodes.len());

            for (index, node) in template.nodes.iter().enumerate() {
                let doc = if restore {
                    engine.persistence.load_step_state(&run_id, &node.id).await?
                } else {
                    None
                };

                let runtime = match &node.kind {
                    NodeKind::Step(def) => {
                        let state = doc
                            .and_then(|d| d.state)
                            .filter(|s| !s.is_null())
                            .or_else(|| def.initial_state.clone());
                        NodeRuntime::Step {
                            state: Arc::new(Mutex::new(state)),
                        }
                    }
                    NodeKind::Process(child) => {
                        let restored = doc.and_then(|d| d.child_run_id).map(RunId);
                        let child_restore = restored.is_some();
                        let child_run = restored.unwrap_or_default();
                        let child =
                            ProcessInstance::load(child.clone(), child_run, engine.clone(), child_restore).await?;
                        NodeRuntime::Process {
                            child: Box::new(child),
                        }
                    }
                    NodeKind::Map(_) => NodeRuntime::Map,
                };
                nodes.push(runtime);

                // Every node's buffers are read back, so leftovers for a node
                // that no longer takes joins are reported instead of lost.
                let buffers = if restore {
                    let buffers = engine.persistence.load_join_buffers(&run_id, &node.id).await?;
                    validate_buffers(&template, index, &buffers)?;
                    buffers
                } else {
                    JoinBuffers::new()
                };
                joins.push(buffers);
            }

            if restore {
                debug!(run_id = %run_id, process = %template.name, "Restored process instance");
            }

            Ok(Self {
                template,
                run_id,
                nodes,
                joins,
                engine,
                activations: 0,
            })
        })
    }

    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    pub fn template(&self) -> &Arc<ProcessTemplate> {
        &self.template
    }

    /// Activations performed by the last `run`.
    pub fn activations(&self) -> usize {
        self.activations
    }

    /// Drive the instance from `trigger` until its queue drains.
    ///
    /// Returns the events raised out of the process, in order.
    pub fn run<'a>(
        &'a mut self,
        trigger: ProcessEvent,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<Vec<ProcessEvent>>> {
        Box::pin(async move {
            if !self.template.accepts_input(&trigger.id) {
                return Err(ProcessError::InvalidInput(format!(
                    "process '{}' has no handler for event '{}'",
                    self.template.name, trigger.id
                )));
            }

            let template = self.template.clone();
            let max_activations = self.engine.config.max_activations;
            let mut queue = VecDeque::new();
            let mut outputs = Vec::new();
            self.activations = 0;

            queue.push_back(Queued {
                source: Source::Input,
                event: trigger,
            });

            while let Some(item) = queue.pop_front() {
                if cancel.is_cancelled() {
                    return Err(ProcessError::Cancelled);
                }

                // A public event re-raised under its own id leaves the process once.
                if item.event.is_public()
                    && matches!(item.source, Source::Node(_))
                    && !template.forwards(item.source, &item.event.id)
                {
                    outputs.push(item.event.clone());
                }

                let from_global = item.source == Source::GlobalError;
                for &edge_index in template.routes_for(item.source, &item.event.id) {
                    let edge = &template.edges[edge_index];
                    let outcome = match edge.target.node() {
                        Some(node) => {
                            let outcome =
                                EdgeRouter::accept(edge, item.source, &item.event, &mut self.joins[node], from_global)?;
                            if edge.join.is_some() {
                                self.persist_joins(node).await?;
                            }
                            outcome
                        }
                        None => EdgeRouter::accept(edge, item.source, &item.event, &mut JoinBuffers::new(), from_global)?,
                    };

                    let activation = match outcome {
                        RouteOutcome::Buffered { group } => {
                            debug!(run_id = %self.run_id, group = %group, event = %item.event.id, "Join buffered");
                            continue;
                        }
                        RouteOutcome::Fire(activation) => activation,
                    };

                    if let (Some(join), Some(node)) = (&edge.join, edge.target.node()) {
                        self.engine.publish(RuntimeEvent::JoinFired {
                            run_id: self.run_id.clone(),
                            step_id: template.nodes[node].id.clone(),
                            group: join.group_id.clone(),
                        });
                    }

                    self.activations += 1;
                    if self.activations > max_activations {
                        return Err(ProcessError::MaxActivationsExceeded(max_activations));
                    }

                    queue.extend(self.activate(activation, &mut outputs, cancel).await?);
                }
            }

            Ok(outputs)
        })
    }

    async fn activate(
        &mut self,
        activation: Activation,
        outputs: &mut Vec<ProcessEvent>,
        cancel: &CancellationToken,
    ) -> Result<Vec<Queued>> {
        let template = self.template.clone();
        let Activation {
            target,
            mapping,
            input,
            from_global,
        } = activation;

        match target {
            ResolvedTarget::Emit {
                event_id,
                visibility,
            } => {
                let event = ProcessEvent::new(event_id, input.into_value()).with_visibility(visibility);
                match visibility {
                    Visibility::Public => {
                        outputs.push(event);
                        Ok(Vec::new())
                    }
                    Visibility::Internal => Ok(vec![Queued {
                        source: Source::Input,
                        event,
                    }]),
                }
            }
            ResolvedTarget::Function { node, function } => match &template.nodes[node].kind {
                NodeKind::Step(def) => {
                    self.activate_step(node, def, &function, &mapping, input, from_global, cancel)
                        .await
                }
                NodeKind::Map(map) => {
                    self.activate_map(node, map, &function, &mapping, input, from_global, cancel)
                        .await
                }
                NodeKind::Process(_) => Err(ProcessError::Topology(format!(
                    "process '{}' has no function '{}'",
                    template.nodes[node].id, function
                ))),
            },
            ResolvedTarget::ProcessInput { node, event_id } => match &template.nodes[node].kind {
                NodeKind::Process(_) => self.activate_process(node, &event_id, input, from_global, cancel).await,
                NodeKind::Map(map) => {
                    self.activate_map(node, map, &event_id, &mapping, input, from_global, cancel)
                        .await
                }
                NodeKind::Step(_) => Err(ProcessError::Topology(format!(
                    "step '{}' takes no input events",
                    template.nodes[node].id
                ))),
            },
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn activate_step(
        &mut self,
        node: usize,
        def: &StepDefinition,
        function: &str,
        mapping: &InputMapping,
        input: Delivery,
        from_global: bool,
        cancel: &CancellationToken,
    ) -> Result<Vec<Queued>> {
        let NodeRuntime::Step { state } = &self.nodes[node] else {
            return Err(ProcessError::InvalidState(format!("node '{}' is not a step", def.id)));
        };
        let state = state.clone();
        let parameters = def
            .functions
            .get(function)
            .map(|f| f.parameters.clone())
            .unwrap_or_default();

        self.engine.publish(RuntimeEvent::StepActivated {
            run_id: self.run_id.clone(),
            step_id: def.id.clone(),
            entry: function.to_string(),
        });
        debug!(run_id = %self.run_id, step = %def.id, function, "Activating step");

        let result = match bind_arguments(mapping, &parameters, input) {
            Ok(args) => StepExecutor::invoke(def, function, args, &self.run_id, state, cancel).await,
            Err(e) => Err(e),
        };

        if matches!(result, Err(ProcessError::Cancelled)) {
            return Err(ProcessError::Cancelled);
        }
        self.persist_node(node).await?;

        match result {
            Ok(outcome) => {
                self.engine.publish(RuntimeEvent::StepCompleted {
                    run_id: self.run_id.clone(),
                    step_id: def.id.clone(),
                    entry: function.to_string(),
                    emitted: outcome.events.len(),
                    elapsed_ms: outcome.elapsed_ms,
                });
                Ok(outcome
                    .events
                    .into_iter()
                    .map(|event| Queued::from_node(node, event))
                    .collect())
            }
            Err(e) => self.fail(node, function, e, from_global),
        }
    }

    async fn activate_process(
        &mut self,
        node: usize,
        event_id: &str,
        input: Delivery,
        from_global: bool,
        cancel: &CancellationToken,
    ) -> Result<Vec<Queued>> {
        let step_id = self.template.nodes[node].id.clone();
        self.engine.publish(RuntimeEvent::StepActivated {
            run_id: self.run_id.clone(),
            step_id: step_id.clone(),
            entry: event_id.to_string(),
        });
        debug!(run_id = %self.run_id, step = %step_id, event = event_id, "Activating nested process");

        let NodeRuntime::Process { child } = &mut self.nodes[node] else {
            return Err(ProcessError::InvalidState(format!("node '{}' is not a process", step_id)));
        };
        let started = Instant::now();
        let result = child
            .run(ProcessEvent::new(event_id, input.into_value()), cancel)
            .await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        if matches!(result, Err(ProcessError::Cancelled)) {
            return Err(ProcessError::Cancelled);
        }
        self.persist_node(node).await?;

        match result {
            Ok(events) => {
                self.engine.publish(RuntimeEvent::StepCompleted {
                    run_id: self.run_id.clone(),
                    step_id: step_id.clone(),
                    entry: event_id.to_string(),
                    emitted: events.len(),
                    elapsed_ms,
                });
                Ok(events
                    .into_iter()
                    .map(|event| {
                        let event = event
                            .with_visibility(Visibility::Internal)
                            .with_source(step_id.clone());
                        Queued::from_node(node, event)
                    })
                    .collect())
            }
            Err(e) if e.is_recoverable() => self.fail(node, event_id, e, from_global),
            Err(e) => Err(e),
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn activate_map(
        &mut self,
        node: usize,
        map: &MapTemplate,
        entry: &str,
        mapping: &InputMapping,
        input: Delivery,
        from_global: bool,
        cancel: &CancellationToken,
    ) -> Result<Vec<Queued>> {
        let step_id = self.template.nodes[node].id.clone();
        self.engine.publish(RuntimeEvent::StepActivated {
            run_id: self.run_id.clone(),
            step_id: step_id.clone(),
            entry: entry.to_string(),
        });

        let scope = RunId(format!("{}.{}", self.run_id, step_id));
        let result = MapOperator::run(&self.engine, map, &scope, &step_id, entry, mapping, input, cancel).await;

        if matches!(result, Err(ProcessError::Cancelled)) {
            return Err(ProcessError::Cancelled);
        }
        self.persist_node(node).await?;

        match result {
            Ok(outcome) => {
                info!(
                    run_id = %self.run_id,
                    step = %step_id,
                    elements = outcome.elements,
                    "Map completed"
                );
                self.engine.publish(RuntimeEvent::MapCompleted {
                    run_id: self.run_id.clone(),
                    step_id: step_id.clone(),
                    elements: outcome.elements,
                });
                Ok(outcome
                    .events
                    .into_iter()
                    .map(|event| Queued::from_node(node, event))
                    .collect())
            }
            Err(e) if e.is_recoverable() => self.fail(node, entry, e, from_global),
            Err(e) => Err(e),
        }
    }

    fn fail(&self, node: usize, function: &str, error: ProcessError, from_global: bool) -> Result<Vec<Queued>> {
        let step_id = &self.template.nodes[node].id;
        let record = ErrorRecord::new(&self.run_id, step_id.clone(), function, &error);
        self.engine.publish(RuntimeEvent::StepFailed {
            run_id: self.run_id.clone(),
            record: record.clone(),
        });

        match ErrorRouter::route(&self.template, node, function, record, from_global)? {
            ErrorRoute::Function(event) => {
                self.engine.publish(RuntimeEvent::ErrorRouted {
                    run_id: self.run_id.clone(),
                    step_id: step_id.clone(),
                    function: function.to_string(),
                    global: false,
                });
                Ok(vec![Queued::from_node(node, event)])
            }
            ErrorRoute::Global(event) => {
                self.engine.publish(RuntimeEvent::ErrorRouted {
                    run_id: self.run_id.clone(),
                    step_id: step_id.clone(),
                    function: function.to_string(),
                    global: true,
                });
                Ok(vec![Queued {
                    source: Source::GlobalError,
                    event,
                }])
            }
            ErrorRoute::Fatal(e) => Err(e),
        }
    }

    async fn persist_node(&self, index: usize) -> Result<()> {
        if !self.engine.persistence.is_enabled() {
            return Ok(());
        }
        let node = &self.template.nodes[index];
        let (state, child_run_id) = match &self.nodes[index] {
            NodeRuntime::Step { state } => (read_state(state), None),
            NodeRuntime::Process { child } => (None, Some(&child.run_id)),
            NodeRuntime::Map => (None, None),
        };
        self.engine
            .persistence
            .save_step_state(&self.run_id, &node.id, node.kind.name(), state, child_run_id)
            .await
    }

    async fn persist_joins(&self, index: usize) -> Result<()> {
        let node = &self.template.nodes[index];
        self.engine
            .persistence
            .save_join_buffers(&self.run_id, &node.id, &self.joins[index])
            .await
    }

    pub fn snapshot(&self) -> ProcessStateSnapshot {
        let template = &self.template;
        let steps = template
            .nodes
            .iter()
            .zip(&self.nodes)
            .zip(&self.joins)
            .map(|((node, runtime), joins)| {
                let pending_edges: BTreeMap<_, _> = joins
                    .iter()
                    .map(|(group, params)| (group.clone(), params.clone()))
                    .collect();
                let (state, process) = match runtime {
                    NodeRuntime::Step { state } => (read_state(state), None),
                    NodeRuntime::Process { child } => (None, Some(Box::new(child.snapshot()))),
                    NodeRuntime::Map => (None, None),
                };
                StepSnapshot {
                    id: node.id.clone(),
                    kind: node.kind.name().to_string(),
                    state,
                    pending_edges,
                    process,
                }
            })
            .collect();

        let edges = template
            .edges
            .iter()
            .map(|edge| EdgeSnapshot {
                source: template.source_name(edge.source),
                event_id: edge.event_id.clone(),
                target: match &edge.target {
                    ResolvedTarget::Function { node, function } => {
                        format!("{}.{}", template.nodes[*node].id, function)
                    }
                    ResolvedTarget::ProcessInput { node, event_id } => {
                        format!("{}.{}", template.nodes[*node].id, event_id)
                    }
                    ResolvedTarget::Emit { event_id, .. } => format!("emit:{}", event_id),
                },
                join_group: edge.join.as_ref().map(|j| j.group_id.clone()),
            })
            .collect();

        ProcessStateSnapshot {
            name: template.name.clone(),
            run_id: self.run_id.0.clone(),
            steps,
            edges,
        }
    }
}

fn validate_buffers(template: &ProcessTemplate, index: usize, buffers: &JoinBuffers) -> Result<()> {
    let step = &template.nodes[index].id;
    for (group, params) in buffers {
        if params.is_empty() {
            continue;
        }
        let join = template.joins_into(index).find(|j| j.group_id == *group);
        let unknown = match join {
            None => params.keys().next().cloned(),
            Some(join) => params.keys().find(|p| !join.parameters.contains(p)).cloned(),
        };
        if let Some(parameter) = unknown {
            return Err(ProcessError::JoinStateCorruption {
                step: step.clone(),
                group: group.clone(),
                parameter,
            });
        }
    }
    Ok(())
}
