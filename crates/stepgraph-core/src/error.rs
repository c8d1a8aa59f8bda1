use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProcessError {
    // Step errors (recoverable through error handlers)
    #[error("Step {step}.{function} failed: {message}")]
    StepExecution {
        step: String,
        function: String,
        message: String,
    },

    #[error("{0}")]
    Failed(String),

    #[error("Invalid step input: {0}")]
    InvalidInput(String),

    // Topology errors (build time)
    #[error("Invalid topology: {0}")]
    Topology(String),

    // Persistence errors
    #[error("Persistence failed: {0}")]
    Persistence(String),

    #[error("Join state corrupted on {step} ({group}): unknown parameter '{parameter}'")]
    JoinStateCorruption {
        step: String,
        group: String,
        parameter: String,
    },

    #[error("Invalid step state: {0}")]
    InvalidState(String),

    // Runtime errors
    #[error("Process cancelled")]
    Cancelled,

    #[error("Process exceeded max activations ({0})")]
    MaxActivationsExceeded(usize),

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // Storage errors
    #[error("Database error: {0}")]
    Database(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ProcessError {
    /// Shorthand for a step body failing with a plain message.
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }

    /// Whether the error may be handed to a function-level or global handler.
    ///
    /// Only failures raised while executing a step body are recoverable; every
    /// other kind aborts the current call.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::StepExecution { .. })
    }

    /// Short, stable name of the error kind, recorded in error records.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::StepExecution { .. } => "step_execution",
            Self::Failed(_) => "failed",
            Self::InvalidInput(_) => "invalid_input",
            Self::Topology(_) => "topology",
            Self::Persistence(_) => "persistence",
            Self::JoinStateCorruption { .. } => "join_state_corruption",
            Self::InvalidState(_) => "invalid_state",
            Self::Cancelled => "cancelled",
            Self::MaxActivationsExceeded(_) => "max_activations_exceeded",
            Self::Config(_) | Self::ConfigNotFound(_) => "config",
            Self::Database(_) => "database",
            Self::Io(_) => "io",
            Self::Json(_) => "json",
        }
    }
}

pub type Result<T> = std::result::Result<T, ProcessError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_step_execution_is_recoverable() {
        let step = ProcessError::StepExecution {
            step: "Compute".into(),
            function: "square".into(),
            message: "boom".into(),
        };
        assert!(step.is_recoverable());
        assert!(!ProcessError::Topology("x".into()).is_recoverable());
        assert!(!ProcessError::Persistence("x".into()).is_recoverable());
        assert!(!ProcessError::Cancelled.is_recoverable());
    }

    #[test]
    fn display_includes_context() {
        let err = ProcessError::JoinStateCorruption {
            step: "Sum".into(),
            group: "total".into(),
            parameter: "stale".into(),
        };
        let text = err.to_string();
        assert!(text.contains("Sum"));
        assert!(text.contains("stale"));
        assert_eq!(err.kind(), "join_state_corruption");
    }
}
