//! Immutable, index-addressed process templates produced by
//! [`crate::builder::ProcessBuilder::build`].

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde_json::Value;

use stepgraph_core::traits::StepFunction;
use stepgraph_core::types::Visibility;

/// One callable registered on a step.
#[derive(Clone)]
pub struct FunctionEntry {
    pub name: String,
    /// Declared parameter names, in signature order.
    pub parameters: Vec<String>,
    pub(crate) callable: Arc<dyn StepFunction>,
}

impl std::fmt::Debug for FunctionEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunctionEntry")
            .field("name", &self.name)
            .field("parameters", &self.parameters)
            .finish()
    }
}

/// A step type: its id, function table and initial state.
#[derive(Debug, Clone)]
pub struct StepDefinition {
    pub id: String,
    pub functions: BTreeMap<String, FunctionEntry>,
    pub initial_state: Option<Value>,
}

/// Where an event comes from, as seen by the routing table.
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq)]
pub enum Source {
    /// The triggering surface of the process (start, resume, parent, `emit`).
    Input,
    /// A node of this process, by index.
    Node(usize),
    /// The global error handler.
    GlobalError,
}

/// Edge target, resolved to node indexes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedTarget {
    Function { node: usize, function: String },
    ProcessInput { node: usize, event_id: String },
    Emit { event_id: String, visibility: Visibility },
}

impl ResolvedTarget {
    pub fn node(&self) -> Option<usize> {
        match self {
            Self::Function { node, .. } | Self::ProcessInput { node, .. } => Some(*node),
            Self::Emit { .. } => None,
        }
    }

    /// Entry name on the target node: a function name or an input event id.
    pub fn entry(&self) -> &str {
        match self {
            Self::Function { function, .. } => function,
            Self::ProcessInput { event_id, .. } | Self::Emit { event_id, .. } => event_id,
        }
    }
}

/// How a single payload is turned into named arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputMapping {
    /// Bind to the sole parameter, or spread an object over several.
    Auto,
    /// Bind the whole payload to one parameter.
    Parameter(String),
    /// Spread an object payload over the parameters.
    Spread,
}

/// Requirement that several sources deliver before an edge fires.
#[derive(Debug, Clone)]
pub struct JoinTemplate {
    /// Stable key of the join buffer in persisted state.
    pub group_id: String,
    /// Parameter names the buffer must hold before firing, sorted.
    pub parameters: Vec<String>,
    /// Which parameter each (source, event id) fills.
    pub by_source: HashMap<(Source, String), String>,
}

#[derive(Debug, Clone)]
pub struct EdgeTemplate {
    pub source: Source,
    pub event_id: String,
    pub target: ResolvedTarget,
    pub mapping: InputMapping,
    pub join: Option<Arc<JoinTemplate>>,
}

/// Fan-out operator over a collection.
#[derive(Debug, Clone)]
pub struct MapTemplate {
    /// Process run once per element. Step operations are wrapped into a
    /// single-step process at build time.
    pub operation: Arc<ProcessTemplate>,
    /// Function table when the operation is a step.
    pub step: Option<Arc<StepDefinition>>,
    /// Parameter (or payload field) holding the collection.
    pub collection_parameter: Option<String>,
    /// Event ids forwarded to the parent, aggregated by element index.
    pub exported: Vec<String>,
}

#[derive(Debug, Clone)]
pub enum NodeKind {
    Step(Arc<StepDefinition>),
    Process(Arc<ProcessTemplate>),
    Map(MapTemplate),
}

impl NodeKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Step(_) => "step",
            Self::Process(_) => "process",
            Self::Map(_) => "map",
        }
    }
}

#[derive(Debug, Clone)]
pub struct NodeTemplate {
    pub id: String,
    pub kind: NodeKind,
}

impl NodeTemplate {
    /// Parameter list of `function` when this node is (or maps over) a step.
    pub fn function_parameters(&self, function: &str) -> Option<&[String]> {
        let step = match &self.kind {
            NodeKind::Step(step) => step,
            NodeKind::Map(map) => map.step.as_ref()?,
            NodeKind::Process(_) => return None,
        };
        step.functions.get(function).map(|f| f.parameters.as_slice())
    }

    /// Process this node hands `process_input` events to, if any.
    pub fn input_process(&self) -> Option<&Arc<ProcessTemplate>> {
        match &self.kind {
            NodeKind::Process(process) => Some(process),
            NodeKind::Map(map) if map.step.is_none() => Some(&map.operation),
            _ => None,
        }
    }
}

/// A compiled process graph.
#[derive(Debug, Clone)]
pub struct ProcessTemplate {
    pub name: String,
    pub nodes: Vec<NodeTemplate>,
    pub edges: Vec<EdgeTemplate>,
    pub(crate) routes: HashMap<(Source, String), Vec<usize>>,
}

impl ProcessTemplate {
    /// Edge indexes listening for `event_id` from `source`.
    pub fn routes_for(&self, source: Source, event_id: &str) -> &[usize] {
        self.routes
            .get(&(source, event_id.to_string()))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn has_route(&self, source: Source, event_id: &str) -> bool {
        !self.routes_for(source, event_id).is_empty()
    }

    /// Whether an edge raises `event_id` out of the process under the same id.
    pub fn forwards(&self, source: Source, event_id: &str) -> bool {
        self.routes_for(source, event_id).iter().any(|&i| {
            matches!(
                &self.edges[i].target,
                ResolvedTarget::Emit { event_id: id, visibility: Visibility::Public } if id == event_id
            )
        })
    }

    /// Whether the process declares a handler for input event `event_id`.
    pub fn accepts_input(&self, event_id: &str) -> bool {
        self.has_route(Source::Input, event_id)
    }

    /// Input event ids the process declares, sorted.
    pub fn input_events(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self
            .routes
            .keys()
            .filter(|(source, _)| *source == Source::Input)
            .map(|(_, id)| id.as_str())
            .collect();
        ids.sort_unstable();
        ids
    }

    pub fn node_index(&self, id: &str) -> Option<usize> {
        self.nodes.iter().position(|n| n.id == id)
    }

    /// Join edges whose target is node `index`.
    pub fn joins_into(&self, index: usize) -> impl Iterator<Item = &Arc<JoinTemplate>> + '_ {
        self.edges
            .iter()
            .filter(move |e| e.target.node() == Some(index))
            .filter_map(|e| e.join.as_ref())
    }

    /// Human-readable name of an edge source.
    pub fn source_name(&self, source: Source) -> String {
        match source {
            Source::Input => "$input".to_string(),
            Source::GlobalError => "$error".to_string(),
            Source::Node(i) => self
                .nodes
                .get(i)
                .map(|n| n.id.clone())
                .unwrap_or_else(|| format!("#{}", i)),
        }
    }
}
