//! Process engine: steps wired by event-triggered edges into a per-instance
//! state machine.
//!
//! A process is assembled with a [`ProcessBuilder`], compiled once into an
//! immutable [`ProcessTemplate`], and run by a [`ProcessRuntime`]. Each run
//! drains an event queue: every event is matched against the edges listening
//! for it, join edges buffer values until all of their sources have
//! delivered, and every firing edge invokes a step function, a nested
//! process, a map, or raises an event out of the process.
//!
//! Step state and pending joins are persisted through a
//! [`stepgraph_core::StorageConnector`] after every activation, so a run can
//! be resumed under the same run id.

pub mod builder;
pub mod error_router;
pub mod executor;
mod instance;
mod map;
pub mod persistence;
pub mod router;
pub mod run_log;
pub mod runtime;
pub mod state;
pub mod template;

pub use builder::{EdgeBuilder, JoinSource, MapOperation, ProcessBuilder, StepBuilder, StepRef, Target};
pub use persistence::{step_edges_key, step_state_key, PersistenceManager, StepStateDocument};
pub use run_log::RunLogger;
pub use runtime::{ProcessHandle, ProcessRuntime, StartOptions};
pub use state::{EdgeSnapshot, ProcessStateSnapshot, StepSnapshot};
pub use template::ProcessTemplate;
