use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use stepgraph_core::config::EngineConfig;
use stepgraph_core::error::{ProcessError, Result};
use stepgraph_core::event::EventBus;
use stepgraph_core::traits::StorageConnector;
use stepgraph_core::types::{ProcessEvent, RunId, RuntimeEvent};

use crate::instance::ProcessInstance;
use crate::persistence::PersistenceManager;
use crate::state::ProcessStateSnapshot;
use crate::template::ProcessTemplate;

/// Settings and collaborators shared by every instance a runtime drives.
#[derive(Clone)]
pub(crate) struct Engine {
    pub config: EngineConfig,
    pub persistence: PersistenceManager,
    pub event_bus: Option<Arc<EventBus>>,
}

impl Engine {
    pub fn publish(&self, event: RuntimeEvent) {
        if let Some(bus) = &self.event_bus {
            bus.publish(event);
        }
    }
}

/// Options for [`ProcessRuntime::start_with`].
#[derive(Debug, Clone, Default)]
pub struct StartOptions {
    /// Run id to use. Persisted state under this id is restored first.
    pub run_id: Option<RunId>,
    /// Caller-owned token; cancelling it cancels the run.
    pub cancel: Option<CancellationToken>,
}

/// Starts process instances from templates.
pub struct ProcessRuntime {
    config: EngineConfig,
    storage: Option<Arc<dyn StorageConnector>>,
    event_bus: Option<Arc<EventBus>>,
}

impl ProcessRuntime {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            storage: None,
            event_bus: None,
        }
    }

    /// Persist step state and join buffers through `storage`.
    pub fn with_storage(mut self, storage: Arc<dyn StorageConnector>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Publish lifecycle events on `bus`.
    pub fn with_event_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.event_bus = Some(bus);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn engine(&self) -> Engine {
        let persistence = match (&self.storage, self.config.persist) {
            (Some(storage), true) => PersistenceManager::new(Some(storage.clone())),
            _ => PersistenceManager::disabled(),
        };
        Engine {
            config: self.config.clone(),
            persistence,
            event_bus: self.event_bus.clone(),
        }
    }

    /// Start a fresh instance of `template` and run it until `event` has been
    /// fully processed.
    pub async fn start(&self, template: &Arc<ProcessTemplate>, event: ProcessEvent) -> Result<ProcessHandle> {
        self.start_with(template, event, StartOptions::default()).await
    }

    /// Re-trigger the instance persisted under `run_id`.
    pub async fn resume(
        &self,
        template: &Arc<ProcessTemplate>,
        run_id: RunId,
        event: ProcessEvent,
    ) -> Result<ProcessHandle> {
        let options = StartOptions {
            run_id: Some(run_id),
            cancel: None,
        };
        self.start_with(template, event, options).await
    }

    /// Restore the instance persisted under `run_id` without triggering it.
    pub async fn attach(&self, template: &Arc<ProcessTemplate>, run_id: RunId) -> Result<ProcessHandle> {
        let engine = self.engine();
        let instance = ProcessInstance::load(template.clone(), run_id, engine.clone(), true).await?;
        Ok(ProcessHandle {
            instance,
            cancel: CancellationToken::new(),
            external: Vec::new(),
            engine,
        })
    }

    pub async fn start_with(
        &self,
        template: &Arc<ProcessTemplate>,
        event: ProcessEvent,
        options: StartOptions,
    ) -> Result<ProcessHandle> {
        let engine = self.engine();
        let (run_id, restore) = match options.run_id {
            Some(run_id) => (run_id, true),
            None => (RunId::new(), false),
        };
        let cancel = options
            .cancel
            .map(|token| token.child_token())
            .unwrap_or_default();

        info!(
            run_id = %run_id,
            process = %template.name,
            restore,
            "Starting process instance"
        );

        let instance = match ProcessInstance::load(template.clone(), run_id.clone(), engine.clone(), restore).await {
            Ok(instance) => instance,
            Err(e) => {
                error!(run_id = %run_id, error = %e, "Failed to load process instance");
                engine.publish(RuntimeEvent::RunError {
                    run_id,
                    error: e.to_string(),
                });
                return Err(e);
            }
        };

        let mut handle = ProcessHandle {
            instance,
            cancel,
            external: Vec::new(),
            engine,
        };
        handle.dispatch(event).await?;
        Ok(handle)
    }
}

/// A started process instance.
///
/// Dropping the handle cancels anything still running under it.
pub struct ProcessHandle {
    instance: ProcessInstance,
    cancel: CancellationToken,
    external: Vec<ProcessEvent>,
    engine: Engine,
}

impl ProcessHandle {
    pub fn run_id(&self) -> &RunId {
        self.instance.run_id()
    }

    /// Current step states, pending joins and nested process states.
    pub fn get_state(&self) -> ProcessStateSnapshot {
        self.instance.snapshot()
    }

    /// Events raised out of the process so far, in order.
    pub fn external_events(&self) -> &[ProcessEvent] {
        &self.external
    }

    /// Data of the last external event with id `event_id`.
    pub fn last_event(&self, event_id: &str) -> Option<&serde_json::Value> {
        self.external
            .iter()
            .rev()
            .find(|e| e.id == event_id)
            .map(|e| &e.data)
    }

    /// Re-trigger this instance with another input event.
    ///
    /// Returns the events raised out of the process by this trigger.
    pub async fn send_event(&mut self, event: ProcessEvent) -> Result<Vec<ProcessEvent>> {
        if self.cancel.is_cancelled() {
            return Err(ProcessError::Cancelled);
        }
        self.dispatch(event).await
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Cancel and release the instance.
    pub fn close(self) {
        drop(self);
    }

    async fn dispatch(&mut self, event: ProcessEvent) -> Result<Vec<ProcessEvent>> {
        let run_id = self.instance.run_id().clone();
        let started = Instant::now();
        self.engine.publish(RuntimeEvent::RunStarted {
            run_id: run_id.clone(),
            process: self.instance.template().name.clone(),
            trigger: event.id.clone(),
        });

        match self.instance.run(event, &self.cancel).await {
            Ok(outputs) => {
                let elapsed_ms = started.elapsed().as_millis() as u64;
                let activations = self.instance.activations();
                info!(
                    run_id = %run_id,
                    activations,
                    elapsed_ms,
                    external = outputs.len(),
                    "Process instance idle"
                );
                self.engine.publish(RuntimeEvent::RunComplete {
                    run_id,
                    activations,
                    elapsed_ms,
                });
                self.external.extend(outputs.iter().cloned());
                Ok(outputs)
            }
            Err(e) => {
                error!(run_id = %run_id, error = %e, "Process instance failed");
                self.engine.publish(RuntimeEvent::RunError {
                    run_id,
                    error: e.to_string(),
                });
                Err(e)
            }
        }
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
