pub mod config;
pub mod context;
pub mod error;
pub mod event;
pub mod traits;
pub mod types;

pub use config::{AppConfig, EngineConfig, LogConfig, StorageBackend, StorageConfig};
pub use context::{FunctionInput, StepContext};
pub use error::{ProcessError, Result};
pub use event::EventBus;
pub use traits::{StepFunction, StorageConnector};
pub use types::*;
