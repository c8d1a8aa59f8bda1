//! Declarative construction of process templates.
//!
//! A [`ProcessBuilder`] collects steps, nested processes, maps and edges, and
//! `build()` validates the whole graph and compiles it into an immutable
//! [`ProcessTemplate`]. Every topology mistake is reported here, never while
//! the process runs.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde_json::Value;

use stepgraph_core::context::{FunctionInput, StepContext};
use stepgraph_core::error::{ProcessError, Result};
use stepgraph_core::types::{function_error_event, function_result_event, Visibility, GLOBAL_ERROR_EVENT};

use crate::template::*;

static NEXT_SCOPE: AtomicU64 = AtomicU64::new(1);

/// Handle to a node added to a [`ProcessBuilder`].
///
/// Only valid inside the builder that returned it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StepRef {
    scope: u64,
    index: usize,
}

/// Declares one step type: its functions and initial state.
pub struct StepBuilder {
    id: String,
    functions: Vec<FunctionEntry>,
    initial_state: Option<Value>,
}

impl StepBuilder {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            functions: Vec::new(),
            initial_state: None,
        }
    }

    /// Register a callable under `name` with the given parameter names.
    pub fn function<F, Fut>(mut self, name: impl Into<String>, parameters: &[&str], f: F) -> Self
    where
        F: Fn(FunctionInput, StepContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        self.functions.push(FunctionEntry {
            name: name.into(),
            parameters: parameters.iter().map(|p| p.to_string()).collect(),
            callable: Arc::new(f),
        });
        self
    }

    /// State the step starts with when nothing is persisted for it.
    pub fn with_state(mut self, initial: Value) -> Self {
        self.initial_state = Some(initial);
        self
    }

    fn build(self) -> Result<StepDefinition> {
        if self.functions.is_empty() {
            return Err(ProcessError::Topology(format!(
                "step '{}' declares no functions",
                self.id
            )));
        }
        let mut functions = BTreeMap::new();
        for f in self.functions {
            let mut seen = HashSet::new();
            if let Some(dup) = f.parameters.iter().find(|p| !seen.insert(p.as_str())) {
                return Err(ProcessError::Topology(format!(
                    "function '{}.{}' declares parameter '{}' twice",
                    self.id, f.name, dup
                )));
            }
            if functions.contains_key(&f.name) {
                return Err(ProcessError::Topology(format!(
                    "step '{}' declares function '{}' twice",
                    self.id, f.name
                )));
            }
            functions.insert(f.name.clone(), f);
        }
        Ok(StepDefinition {
            id: self.id,
            functions,
            initial_state: self.initial_state,
        })
    }
}

/// Operation a map runs once per element.
pub enum MapOperation {
    Step(StepBuilder),
    Process(ProcessBuilder),
}

impl From<StepBuilder> for MapOperation {
    fn from(step: StepBuilder) -> Self {
        Self::Step(step)
    }
}

impl From<ProcessBuilder> for MapOperation {
    fn from(process: ProcessBuilder) -> Self {
        Self::Process(process)
    }
}

enum PendingNode {
    Step(StepBuilder),
    Process(ProcessBuilder),
    Map {
        id: String,
        operation: MapOperation,
        collection_parameter: Option<String>,
    },
}

impl PendingNode {
    fn id(&self) -> &str {
        match self {
            Self::Step(s) => &s.id,
            Self::Process(p) => &p.name,
            Self::Map { id, .. } => id,
        }
    }
}

/// Where an edge sends the event.
#[derive(Debug, Clone)]
pub struct Target(TargetKind);

#[derive(Debug, Clone)]
enum TargetKind {
    Function {
        step: StepRef,
        function: String,
        parameter: Option<String>,
    },
    ProcessInput {
        step: StepRef,
        event_id: String,
    },
    Emit {
        event_id: String,
        visibility: Visibility,
    },
}

impl Target {
    /// Invoke `function` on `step`, binding the payload automatically.
    pub fn function(step: StepRef, function: impl Into<String>) -> Self {
        Self(TargetKind::Function {
            step,
            function: function.into(),
            parameter: None,
        })
    }

    /// Invoke `function` on `step`, binding the payload to `parameter`.
    pub fn parameter(step: StepRef, function: impl Into<String>, parameter: impl Into<String>) -> Self {
        Self(TargetKind::Function {
            step,
            function: function.into(),
            parameter: Some(parameter.into()),
        })
    }

    /// Trigger input event `event_id` of a nested process (or map over one).
    pub fn process_input(step: StepRef, event_id: impl Into<String>) -> Self {
        Self(TargetKind::ProcessInput {
            step,
            event_id: event_id.into(),
        })
    }

    /// Re-raise as input event `event_id` of the enclosing process.
    pub fn emit(event_id: impl Into<String>) -> Self {
        Self(TargetKind::Emit {
            event_id: event_id.into(),
            visibility: Visibility::Internal,
        })
    }

    /// Raise `event_id` out of the enclosing process, to its parent or caller.
    pub fn emit_public(event_id: impl Into<String>) -> Self {
        Self(TargetKind::Emit {
            event_id: event_id.into(),
            visibility: Visibility::Public,
        })
    }

    fn step(&self) -> Option<StepRef> {
        match &self.0 {
            TargetKind::Function { step, .. } | TargetKind::ProcessInput { step, .. } => Some(*step),
            TargetKind::Emit { .. } => None,
        }
    }
}

/// One contributor to a join.
#[derive(Debug, Clone)]
pub struct JoinSource {
    step: StepRef,
    event_id: String,
    parameter: String,
    function: Option<String>,
}

impl JoinSource {
    /// Event `event_id` raised by `step` fills `parameter`.
    pub fn new(step: StepRef, event_id: impl Into<String>, parameter: impl Into<String>) -> Self {
        Self {
            step,
            event_id: event_id.into(),
            parameter: parameter.into(),
            function: None,
        }
    }

    /// The return value of `step.function` fills `parameter`.
    pub fn function_result(step: StepRef, function: impl Into<String>, parameter: impl Into<String>) -> Self {
        let function = function.into();
        Self {
            step,
            event_id: function_result_event(&function),
            parameter: parameter.into(),
            function: Some(function),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum SourceRef {
    Input,
    Node(StepRef),
    GlobalError,
}

#[derive(Debug, Clone)]
enum Trigger {
    Single { source: SourceRef, event_id: String },
    Join(Vec<JoinSource>),
}

struct PendingEdge {
    trigger: Trigger,
    target: Target,
    group_id: Option<String>,
}

/// Adds edges for one trigger. Each `send_event_to` adds one edge.
pub struct EdgeBuilder<'a> {
    builder: &'a mut ProcessBuilder,
    trigger: Trigger,
    group_id: Option<String>,
}

impl EdgeBuilder<'_> {
    pub fn send_event_to(self, target: Target) -> Self {
        self.builder.edges.push(PendingEdge {
            trigger: self.trigger.clone(),
            target,
            group_id: self.group_id.clone(),
        });
        self
    }

    /// Explicit join buffer key for the edges added after this call.
    pub fn with_group_id(mut self, group_id: impl Into<String>) -> Self {
        self.group_id = Some(group_id.into());
        self
    }
}

/// Builds a [`ProcessTemplate`].
pub struct ProcessBuilder {
    name: String,
    scope: u64,
    nodes: Vec<PendingNode>,
    edges: Vec<PendingEdge>,
    /// (node, entry) pairs edges were declared against.
    entries: Vec<(StepRef, String)>,
}

impl ProcessBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            scope: NEXT_SCOPE.fetch_add(1, Ordering::Relaxed),
            nodes: Vec::new(),
            edges: Vec::new(),
            entries: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn push(&mut self, node: PendingNode) -> StepRef {
        self.nodes.push(node);
        StepRef {
            scope: self.scope,
            index: self.nodes.len() - 1,
        }
    }

    pub fn add_step(&mut self, step: StepBuilder) -> StepRef {
        self.push(PendingNode::Step(step))
    }

    /// Nest a whole process as a node; its id is the nested process name.
    pub fn add_process(&mut self, process: ProcessBuilder) -> StepRef {
        self.push(PendingNode::Process(process))
    }

    /// Map `operation` over the single array-valued argument of the edge
    /// that triggers it.
    pub fn add_map(&mut self, id: impl Into<String>, operation: impl Into<MapOperation>) -> StepRef {
        self.push(PendingNode::Map {
            id: id.into(),
            operation: operation.into(),
            collection_parameter: None,
        })
    }

    /// Map `operation` over argument `parameter`; other arguments are passed
    /// unchanged to every element.
    pub fn add_map_over(
        &mut self,
        id: impl Into<String>,
        operation: impl Into<MapOperation>,
        parameter: impl Into<String>,
    ) -> StepRef {
        self.push(PendingNode::Map {
            id: id.into(),
            operation: operation.into(),
            collection_parameter: Some(parameter.into()),
        })
    }

    fn edge(&mut self, trigger: Trigger) -> EdgeBuilder<'_> {
        EdgeBuilder {
            builder: self,
            trigger,
            group_id: None,
        }
    }

    /// Handle input event `event_id` of this process.
    pub fn on_input_event(&mut self, event_id: impl Into<String>) -> EdgeBuilder<'_> {
        self.edge(Trigger::Single {
            source: SourceRef::Input,
            event_id: event_id.into(),
        })
    }

    /// Handle event `event_id` raised by `step`.
    pub fn on_event(&mut self, step: StepRef, event_id: impl Into<String>) -> EdgeBuilder<'_> {
        self.edge(Trigger::Single {
            source: SourceRef::Node(step),
            event_id: event_id.into(),
        })
    }

    /// Handle the return value of `step.function`.
    pub fn on_function_result(&mut self, step: StepRef, function: impl Into<String>) -> EdgeBuilder<'_> {
        let function = function.into();
        let event_id = function_result_event(&function);
        self.entries.push((step, function));
        self.edge(Trigger::Single {
            source: SourceRef::Node(step),
            event_id,
        })
    }

    /// Fire once every source has delivered a value.
    pub fn on_all_of(&mut self, sources: Vec<JoinSource>) -> EdgeBuilder<'_> {
        for source in &sources {
            if let Some(function) = &source.function {
                self.entries.push((source.step, function.clone()));
            }
        }
        self.edge(Trigger::Join(sources))
    }

    /// Handle failures of `step.function`. Takes precedence over [`Self::on_error`].
    pub fn on_function_error(&mut self, step: StepRef, function: impl Into<String>) -> EdgeBuilder<'_> {
        let function = function.into();
        let event_id = function_error_event(&function);
        self.entries.push((step, function));
        self.edge(Trigger::Single {
            source: SourceRef::Node(step),
            event_id,
        })
    }

    /// Handle failures no function-level handler claims.
    pub fn on_error(&mut self) -> EdgeBuilder<'_> {
        self.edge(Trigger::Single {
            source: SourceRef::GlobalError,
            event_id: GLOBAL_ERROR_EVENT.to_string(),
        })
    }

    /// Validate the graph and compile it.
    pub fn build(self) -> Result<Arc<ProcessTemplate>> {
        self.compile().map(Arc::new)
    }

    fn resolve(&self, step: StepRef, context: &str) -> Result<usize> {
        if step.scope != self.scope || step.index >= self.nodes.len() {
            return Err(ProcessError::Topology(format!(
                "{} in process '{}' refers to a node outside its boundary",
                context, self.name
            )));
        }
        Ok(step.index)
    }

    fn resolve_source(&self, source: SourceRef) -> Result<Source> {
        Ok(match source {
            SourceRef::Input => Source::Input,
            SourceRef::GlobalError => Source::GlobalError,
            SourceRef::Node(step) => Source::Node(self.resolve(step, "edge source")?),
        })
    }

    fn compile(self) -> Result<ProcessTemplate> {
        let mut ids = HashSet::new();
        for node in &self.nodes {
            if !ids.insert(node.id()) {
                return Err(ProcessError::Topology(format!(
                    "duplicate step id '{}' in process '{}'",
                    node.id(),
                    self.name
                )));
            }
        }

        // Resolve every reference first so out-of-scope handles fail before
        // anything else is compiled.
        let mut resolved_edges = Vec::with_capacity(self.edges.len());
        for edge in &self.edges {
            let sources: Vec<(Source, String, Option<String>)> = match &edge.trigger {
                Trigger::Single { source, event_id } => {
                    vec![(self.resolve_source(*source)?, event_id.clone(), None)]
                }
                Trigger::Join(sources) => sources
                    .iter()
                    .map(|s| {
                        Ok((
                            Source::Node(self.resolve(s.step, "join source")?),
                            s.event_id.clone(),
                            Some(s.parameter.clone()),
                        ))
                    })
                    .collect::<Result<_>>()?,
            };
            let target_node = match edge.target.step() {
                Some(step) => Some(self.resolve(step, "edge target")?),
                None => None,
            };
            resolved_edges.push((sources, target_node));
        }
        let mut entries = Vec::with_capacity(self.entries.len());
        for (step, entry) in &self.entries {
            entries.push((self.resolve(*step, "handler")?, entry.clone()));
        }

        // Event ids the parent routes out of each node, used as map exports.
        let mut routed_out: HashMap<usize, BTreeSet<String>> = HashMap::new();
        for (sources, _) in &resolved_edges {
            for (source, event_id, _) in sources {
                if let Source::Node(index) = source {
                    routed_out.entry(*index).or_default().insert(event_id.clone());
                }
            }
        }

        let name = self.name;
        let mut nodes = Vec::with_capacity(self.nodes.len());
        for (index, node) in self.nodes.into_iter().enumerate() {
            let compiled = match node {
                PendingNode::Step(step) => {
                    let def = step.build()?;
                    NodeTemplate {
                        id: def.id.clone(),
                        kind: NodeKind::Step(Arc::new(def)),
                    }
                }
                PendingNode::Process(process) => {
                    let id = process.name.clone();
                    NodeTemplate {
                        id,
                        kind: NodeKind::Process(process.build()?),
                    }
                }
                PendingNode::Map {
                    id,
                    operation,
                    collection_parameter,
                } => {
                    let routed = routed_out.remove(&index).unwrap_or_default();
                    let map = compile_map(&id, operation, collection_parameter, routed)?;
                    NodeTemplate {
                        id,
                        kind: NodeKind::Map(map),
                    }
                }
            };
            nodes.push(compiled);
        }

        for (index, entry) in &entries {
            let node = &nodes[*index];
            let known = node.function_parameters(entry).is_some()
                || node.input_process().is_some_and(|p| p.accepts_input(entry));
            if !known {
                return Err(ProcessError::Topology(format!(
                    "{} '{}' has no function or input event '{}'",
                    node.kind.name(),
                    node.id,
                    entry
                )));
            }
        }

        let mut edges = Vec::with_capacity(self.edges.len());
        for (edge, (sources, target_node)) in self.edges.into_iter().zip(resolved_edges) {
            let target = resolve_target(&nodes, &edge.target, target_node)?;
            let is_join = matches!(edge.trigger, Trigger::Join(_));

            let mapping = match &edge.target.0 {
                TargetKind::Function {
                    parameter: Some(p), ..
                } => {
                    if is_join {
                        return Err(ProcessError::Topology(format!(
                            "join into '{}' cannot bind a single parameter",
                            target.entry()
                        )));
                    }
                    InputMapping::Parameter(p.clone())
                }
                _ => InputMapping::Auto,
            };

            if !is_join {
                if let Some((source, event_id, _)) = sources.into_iter().next() {
                    edges.push(EdgeTemplate {
                        source,
                        event_id,
                        target,
                        mapping,
                        join: None,
                    });
                }
                continue;
            }

            let order: Vec<(Source, String)> =
                sources.iter().map(|(s, e, _)| (*s, e.clone())).collect();
            let join = Arc::new(compile_join(&name, &nodes, &target, sources, edge.group_id)?);
            for (source, event_id) in order {
                edges.push(EdgeTemplate {
                    source,
                    event_id,
                    target: target.clone(),
                    mapping: InputMapping::Auto,
                    join: Some(join.clone()),
                });
            }
        }

        let mut routes: HashMap<(Source, String), Vec<usize>> = HashMap::new();
        for (i, edge) in edges.iter().enumerate() {
            routes
                .entry((edge.source, edge.event_id.clone()))
                .or_default()
                .push(i);
        }

        Ok(ProcessTemplate {
            name,
            nodes,
            edges,
            routes,
        })
    }
}

fn resolve_target(nodes: &[NodeTemplate], target: &Target, node: Option<usize>) -> Result<ResolvedTarget> {
    match (&target.0, node) {
        (
            TargetKind::Function {
                function, parameter, ..
            },
            Some(index),
        ) => {
            let n = &nodes[index];
            let params = n.function_parameters(function).ok_or_else(|| {
                ProcessError::Topology(format!(
                    "{} '{}' has no function '{}'",
                    n.kind.name(),
                    n.id,
                    function
                ))
            })?;
            if let Some(p) = parameter {
                if !params.contains(p) {
                    return Err(ProcessError::Topology(format!(
                        "function '{}.{}' has no parameter '{}'",
                        n.id, function, p
                    )));
                }
            }
            Ok(ResolvedTarget::Function {
                node: index,
                function: function.clone(),
            })
        }
        (TargetKind::ProcessInput { event_id, .. }, Some(index)) => {
            let n = &nodes[index];
            let process = n.input_process().ok_or_else(|| {
                ProcessError::Topology(format!(
                    "{} '{}' is not a process and takes no input events",
                    n.kind.name(),
                    n.id
                ))
            })?;
            if !process.accepts_input(event_id) {
                return Err(ProcessError::Topology(format!(
                    "process '{}' has no input event '{}'",
                    n.id, event_id
                )));
            }
            Ok(ResolvedTarget::ProcessInput {
                node: index,
                event_id: event_id.clone(),
            })
        }
        (
            TargetKind::Emit {
                event_id,
                visibility,
            },
            _,
        ) => Ok(ResolvedTarget::Emit {
            event_id: event_id.clone(),
            visibility: *visibility,
        }),
        _ => Err(ProcessError::Topology("edge target has no node".into())),
    }
}

fn compile_join(
    process: &str,
    nodes: &[NodeTemplate],
    target: &ResolvedTarget,
    sources: Vec<(Source, String, Option<String>)>,
    group_id: Option<String>,
) -> Result<JoinTemplate> {
    if sources.is_empty() {
        return Err(ProcessError::Topology(format!(
            "join into '{}' in process '{}' has no sources",
            target.entry(),
            process
        )));
    }
    let node = match target {
        ResolvedTarget::Emit { event_id, .. } => {
            return Err(ProcessError::Topology(format!(
                "join cannot target emitted event '{}'",
                event_id
            )))
        }
        ResolvedTarget::Function { node, .. } | ResolvedTarget::ProcessInput { node, .. } => &nodes[*node],
    };
    let signature = match target {
        ResolvedTarget::Function { function, .. } => node.function_parameters(function),
        _ => None,
    };

    let mut by_source = HashMap::new();
    let mut parameters = BTreeSet::new();
    let mut parts = Vec::with_capacity(sources.len());
    for (source, event_id, parameter) in sources {
        let parameter = parameter.unwrap_or_default();
        if !parameters.insert(parameter.clone()) {
            return Err(ProcessError::Topology(format!(
                "join into '{}.{}' binds parameter '{}' twice",
                node.id,
                target.entry(),
                parameter
            )));
        }
        if let Some(signature) = signature {
            if !signature.contains(&parameter) {
                return Err(ProcessError::Topology(format!(
                    "function '{}.{}' has no parameter '{}'",
                    node.id,
                    target.entry(),
                    parameter
                )));
            }
        }
        let source_name = match source {
            Source::Node(i) => nodes[i].id.clone(),
            Source::Input => "$input".to_string(),
            Source::GlobalError => "$error".to_string(),
        };
        parts.push(format!("{}<-{}.{}", parameter, source_name, event_id));
        if by_source.insert((source, event_id.clone()), parameter).is_some() {
            return Err(ProcessError::Topology(format!(
                "join into '{}.{}' lists source '{}.{}' twice",
                node.id,
                target.entry(),
                source_name,
                event_id
            )));
        }
    }
    parts.sort();

    Ok(JoinTemplate {
        group_id: group_id.unwrap_or_else(|| format!("{}({})", target.entry(), parts.join(","))),
        parameters: parameters.into_iter().collect(),
        by_source,
    })
}

fn compile_map(
    id: &str,
    operation: MapOperation,
    collection_parameter: Option<String>,
    routed: BTreeSet<String>,
) -> Result<MapTemplate> {
    match operation {
        MapOperation::Step(step) => {
            let def = Arc::new(step.build()?);
            if let Some(p) = &collection_parameter {
                if !def.functions.values().any(|f| f.parameters.contains(p)) {
                    return Err(ProcessError::Topology(format!(
                        "map '{}' collects over '{}', which no function of '{}' declares",
                        id, p, def.id
                    )));
                }
            }
            // Failures of the operation surface as the map's own failure.
            let exported: Vec<String> = routed
                .into_iter()
                .filter(|e| !def.functions.keys().any(|f| *e == function_error_event(f)))
                .collect();
            Ok(MapTemplate {
                operation: Arc::new(wrap_step(def.clone(), &exported)),
                step: Some(def),
                collection_parameter,
                exported,
            })
        }
        MapOperation::Process(process) => {
            let operation = process.build()?;
            let inputs = operation.input_events();
            let exported: Vec<String> = routed
                .into_iter()
                .filter(|e| !inputs.iter().any(|i| *e == function_error_event(i)))
                .collect();
            Ok(MapTemplate {
                operation,
                step: None,
                collection_parameter,
                exported,
            })
        }
    }
}

/// Single-step process running `step` once per element: every function is
/// an input event of the same name, and every exported id is raised out.
fn wrap_step(step: Arc<StepDefinition>, exported: &[String]) -> ProcessTemplate {
    let mut edges = Vec::new();
    for name in step.functions.keys() {
        edges.push(EdgeTemplate {
            source: Source::Input,
            event_id: name.clone(),
            target: ResolvedTarget::Function {
                node: 0,
                function: name.clone(),
            },
            mapping: InputMapping::Spread,
            join: None,
        });
    }
    for event_id in exported {
        edges.push(EdgeTemplate {
            source: Source::Node(0),
            event_id: event_id.clone(),
            target: ResolvedTarget::Emit {
                event_id: event_id.clone(),
                visibility: Visibility::Public,
            },
            mapping: InputMapping::Auto,
            join: None,
        });
    }
    let mut routes: HashMap<(Source, String), Vec<usize>> = HashMap::new();
    for (i, edge) in edges.iter().enumerate() {
        routes
            .entry((edge.source, edge.event_id.clone()))
            .or_default()
            .push(i);
    }
    ProcessTemplate {
        name: step.id.clone(),
        nodes: vec![NodeTemplate {
            id: step.id.clone(),
            kind: NodeKind::Step(step),
        }],
        edges,
        routes,
    }
}
