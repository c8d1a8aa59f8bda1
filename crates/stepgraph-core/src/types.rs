use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Event id raised by the global error handler route.
pub const GLOBAL_ERROR_EVENT: &str = "Process.OnError";

/// Event id raised when `function` returns.
pub fn function_result_event(function: &str) -> String {
    format!("{}.OnResult", function)
}

/// Event id raised when `function` fails and a function-level handler exists.
pub fn function_error_event(function: &str) -> String {
    format!("{}.OnError", function)
}

/// Identifier of one execution lineage of a process template.
///
/// Forms the prefix of every persistence key written for the instance.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct RunId(pub String);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_string(s: &str) -> Self {
        Self(s.to_string())
    }

    /// Run id of the `index`-th element activation of a map under `parent`.
    pub fn element(parent: &RunId, index: usize) -> Self {
        Self(format!("{}.{}", parent.0, index))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Who can observe an event.
///
/// Internal events are routed only inside the process that raised them.
/// Public events are also forwarded to the enclosing process (or to the
/// caller, at top level).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    #[default]
    Internal,
    Public,
}

/// An event flowing through a process instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessEvent {
    pub id: String,
    #[serde(default)]
    pub data: serde_json::Value,
    #[serde(default)]
    pub visibility: Visibility,
    /// Id of the step that raised the event, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

impl ProcessEvent {
    pub fn new(id: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            data,
            visibility: Visibility::Internal,
            source: None,
        }
    }

    /// An event with no payload.
    pub fn signal(id: impl Into<String>) -> Self {
        Self::new(id, serde_json::Value::Null)
    }

    pub fn public(id: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            visibility: Visibility::Public,
            ..Self::new(id, data)
        }
    }

    pub fn with_visibility(mut self, visibility: Visibility) -> Self {
        self.visibility = visibility;
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn is_public(&self) -> bool {
        self.visibility == Visibility::Public
    }
}

/// Opaque description of a step failure, handed to error handlers as the
/// payload of the error event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub run_id: String,
    pub step_id: String,
    pub function: String,
    pub kind: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl ErrorRecord {
    pub fn new(
        run_id: &RunId,
        step_id: impl Into<String>,
        function: impl Into<String>,
        error: &crate::error::ProcessError,
    ) -> Self {
        Self {
            run_id: run_id.0.clone(),
            step_id: step_id.into(),
            function: function.into(),
            kind: error.kind().to_string(),
            message: error.to_string(),
            timestamp: Utc::now(),
        }
    }

    /// The fatal error reported when nobody handles this failure.
    pub fn into_error(self) -> crate::error::ProcessError {
        crate::error::ProcessError::StepExecution {
            step: self.step_id,
            function: self.function,
            message: self.message,
        }
    }
}

/// Lifecycle events broadcast on the [`crate::EventBus`] while a process runs.
#[derive(Debug, Clone)]
pub enum RuntimeEvent {
    RunStarted {
        run_id: RunId,
        process: String,
        trigger: String,
    },
    StepActivated {
        run_id: RunId,
        step_id: String,
        entry: String,
    },
    StepCompleted {
        run_id: RunId,
        step_id: String,
        entry: String,
        emitted: usize,
        elapsed_ms: u64,
    },
    StepFailed {
        run_id: RunId,
        record: ErrorRecord,
    },
    JoinFired {
        run_id: RunId,
        step_id: String,
        group: String,
    },
    MapCompleted {
        run_id: RunId,
        step_id: String,
        elements: usize,
    },
    ErrorRouted {
        run_id: RunId,
        step_id: String,
        function: String,
        global: bool,
    },
    RunComplete {
        run_id: RunId,
        activations: usize,
        elapsed_ms: u64,
    },
    RunError {
        run_id: RunId,
        error: String,
    },
}

impl RuntimeEvent {
    /// Run id the event belongs to.
    pub fn run_id(&self) -> &RunId {
        match self {
            Self::RunStarted { run_id, .. }
            | Self::StepActivated { run_id, .. }
            | Self::StepCompleted { run_id, .. }
            | Self::StepFailed { run_id, .. }
            | Self::JoinFired { run_id, .. }
            | Self::MapCompleted { run_id, .. }
            | Self::ErrorRouted { run_id, .. }
            | Self::RunComplete { run_id, .. }
            | Self::RunError { run_id, .. } => run_id,
        }
    }
}
