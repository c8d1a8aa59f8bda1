use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use stepgraph_core::config::EngineConfig;
use stepgraph_core::error::{ProcessError, Result};
use stepgraph_core::traits::StorageConnector;
use stepgraph_core::types::{ProcessEvent, RunId};
use stepgraph_core::{FunctionInput, StepContext};
use stepgraph_engine::{
    step_edges_key, step_state_key, JoinSource, ProcessBuilder, ProcessRuntime, ProcessTemplate, StepBuilder, Target,
};
use stepgraph_store::{InMemoryStorage, SqliteStorage};
use stepgraph_test_utils::{input, test_engine_config, FailingStorage, RecordingStorage, TestContext};

#[derive(Debug, Default, Serialize, Deserialize)]
struct Tally {
    count: u64,
}

async fn bump(_input: FunctionInput, ctx: StepContext) -> Result<Value> {
    let count = ctx.update_state(|tally: &mut Tally| {
        tally.count += 1;
        tally.count
    })?;
    Ok(json!(count))
}

async fn passthrough(input: FunctionInput, _ctx: StepContext) -> Result<Value> {
    Ok(input.get("v").cloned().unwrap_or(Value::Null))
}

async fn add(input: FunctionInput, _ctx: StepContext) -> Result<Value> {
    let a: i64 = input.arg("a")?;
    let b: i64 = input.arg("b")?;
    Ok(json!(a + b))
}

fn counter_process() -> Arc<ProcessTemplate> {
    let mut process = ProcessBuilder::new("Counting");
    let counter = process.add_step(
        StepBuilder::new("Counter")
            .with_state(json!({"count": 0}))
            .function("bump", &[], bump),
    );
    process.on_input_event("Bump").send_event_to(Target::function(counter, "bump"));
    process
        .on_function_result(counter, "bump")
        .send_event_to(Target::emit_public("Count"));
    process.build().unwrap()
}

fn join_process() -> Arc<ProcessTemplate> {
    let mut process = ProcessBuilder::new("Joined");
    let a = process.add_step(StepBuilder::new("A").function("run", &["v"], passthrough));
    let b = process.add_step(StepBuilder::new("B").function("run", &["v"], passthrough));
    let sum = process.add_step(StepBuilder::new("Sum").function("add", &["a", "b"], add));
    process.on_input_event("A").send_event_to(Target::function(a, "run"));
    process.on_input_event("B").send_event_to(Target::function(b, "run"));
    process
        .on_all_of(vec![
            JoinSource::function_result(a, "run", "a"),
            JoinSource::function_result(b, "run", "b"),
        ])
        .send_event_to(Target::function(sum, "add"));
    process
        .on_function_result(sum, "add")
        .send_event_to(Target::emit_public("Sum"));
    process.build().unwrap()
}

fn runtime(storage: Arc<dyn StorageConnector>) -> ProcessRuntime {
    ProcessRuntime::new(test_engine_config()).with_storage(storage)
}

#[tokio::test]
async fn resumed_join_matches_uninterrupted_run() {
    let template = join_process();

    let mut straight = ProcessRuntime::new(test_engine_config())
        .start(&template, ProcessEvent::new("A", json!(4)))
        .await
        .unwrap();
    let expected = straight.send_event(ProcessEvent::new("B", json!(6))).await.unwrap();

    let storage: Arc<dyn StorageConnector> = Arc::new(InMemoryStorage::new());
    let first = runtime(storage.clone())
        .start(&template, ProcessEvent::new("A", json!(4)))
        .await
        .unwrap();
    let run_id = first.run_id().clone();
    first.close();

    let resumed = runtime(storage)
        .resume(&template, run_id.clone(), ProcessEvent::new("B", json!(6)))
        .await
        .unwrap();
    assert_eq!(resumed.run_id(), &run_id);
    assert_eq!(resumed.last_event("Sum"), Some(&expected[0].data));
    assert_eq!(resumed.last_event("Sum"), Some(&json!(10)));
}

#[tokio::test]
async fn step_state_survives_resume() {
    let template = counter_process();
    let storage: Arc<dyn StorageConnector> = Arc::new(InMemoryStorage::new());

    let first = runtime(storage.clone())
        .start(&template, ProcessEvent::signal("Bump"))
        .await
        .unwrap();
    assert_eq!(first.last_event("Count"), Some(&json!(1)));
    let run_id = first.run_id().clone();
    drop(first);

    let second = runtime(storage.clone())
        .resume(&template, run_id.clone(), ProcessEvent::signal("Bump"))
        .await
        .unwrap();
    assert_eq!(second.last_event("Count"), Some(&json!(2)));
    assert_eq!(second.get_state().step_state("Counter"), Some(&json!({"count": 2})));
    drop(second);

    // Attaching restores without triggering anything.
    let attached = runtime(storage).attach(&template, run_id).await.unwrap();
    assert_eq!(attached.get_state().step_state("Counter"), Some(&json!({"count": 2})));
    assert!(attached.external_events().is_empty());
}

#[tokio::test]
async fn fresh_run_ignores_other_runs_state() {
    let template = counter_process();
    let storage: Arc<dyn StorageConnector> = Arc::new(InMemoryStorage::new());

    runtime(storage.clone())
        .start(&template, ProcessEvent::signal("Bump"))
        .await
        .unwrap();
    let other = runtime(storage)
        .start(&template, ProcessEvent::signal("Bump"))
        .await
        .unwrap();
    assert_eq!(other.last_event("Count"), Some(&json!(1)));
}

#[tokio::test]
async fn documents_follow_key_layout() {
    let storage = Arc::new(RecordingStorage::new());
    let template = join_process();
    let handle = runtime(storage.clone())
        .start(&template, ProcessEvent::new("A", json!(1)))
        .await
        .unwrap();
    let run_id = handle.run_id().clone();

    let doc = storage.document(&step_state_key(&run_id, "A")).unwrap();
    assert_eq!(doc["kind"], "step");
    assert!(doc["updated_at"].is_string());

    let edges = storage.document(&step_edges_key(&run_id, "Sum")).unwrap();
    let group = edges.as_object().unwrap().values().next().unwrap();
    assert_eq!(group["a"], 1);
    assert_eq!(storage.put_count("StepEdgesData"), 1);
}

#[tokio::test]
async fn map_elements_persist_under_element_run_ids() {
    let storage = Arc::new(RecordingStorage::new());
    let mut process = ProcessBuilder::new("Mapped");
    let counters = process.add_map(
        "Counters",
        StepBuilder::new("Counter").function("bump", &["x"], bump),
    );
    process
        .on_input_event("Go")
        .send_event_to(Target::function(counters, "bump"));
    let template = process.build().unwrap();

    let handle = runtime(storage.clone())
        .start(&template, ProcessEvent::new("Go", json!([10, 20])))
        .await
        .unwrap();
    let run_id = handle.run_id();

    let map_doc = storage.document(&step_state_key(run_id, "Counters")).unwrap();
    assert_eq!(map_doc["kind"], "map");
    for index in 0..2 {
        let element = RunId::element(&RunId(format!("{}.Counters", run_id)), index);
        let doc = storage.document(&step_state_key(&element, "Counter")).unwrap();
        assert_eq!(doc["state"], json!({"count": 1}));
    }
}

#[tokio::test]
async fn nested_process_resumes_its_own_run() {
    let mut inner = ProcessBuilder::new("Inner");
    let counter = inner.add_step(StepBuilder::new("Counter").function("bump", &[], bump));
    inner.on_input_event("Bump").send_event_to(Target::function(counter, "bump"));

    let mut outer = ProcessBuilder::new("Outer");
    let nested = outer.add_process(inner);
    outer
        .on_input_event("Go")
        .send_event_to(Target::process_input(nested, "Bump"));
    let template = outer.build().unwrap();

    let storage: Arc<dyn StorageConnector> = Arc::new(InMemoryStorage::new());
    let first = runtime(storage.clone())
        .start(&template, ProcessEvent::signal("Go"))
        .await
        .unwrap();
    let run_id = first.run_id().clone();
    let child_run = first.get_state().step("Inner").unwrap().process.as_ref().unwrap().run_id.clone();
    drop(first);

    let second = runtime(storage)
        .resume(&template, run_id, ProcessEvent::signal("Go"))
        .await
        .unwrap();
    let state = second.get_state();
    let child = state.step("Inner").unwrap().process.as_ref().unwrap();
    assert_eq!(child.run_id, child_run);
    assert_eq!(child.step_state("Counter"), Some(&json!({"count": 2})));
}

#[tokio::test]
async fn failed_activation_still_persists_state() {
    let mut process = ProcessBuilder::new("Flaky");
    let step = process.add_step(StepBuilder::new("Flaky").function(
        "attempt",
        &[],
        |_input: FunctionInput, ctx: StepContext| async move {
            ctx.update_state(|tally: &mut Tally| tally.count += 1)?;
            Err::<Value, _>(ProcessError::failed("not yet"))
        },
    ));
    let sink = process.add_step(StepBuilder::new("Sink").function("swallow", &["error"], passthrough));
    process.on_input_event("Try").send_event_to(Target::function(step, "attempt"));
    process
        .on_function_error(step, "attempt")
        .send_event_to(Target::function(sink, "swallow"));
    let template = process.build().unwrap();

    let storage = Arc::new(RecordingStorage::new());
    let handle = runtime(storage.clone())
        .start(&template, ProcessEvent::signal("Try"))
        .await
        .unwrap();
    let doc = storage.document(&step_state_key(handle.run_id(), "Flaky")).unwrap();
    assert_eq!(doc["state"], json!({"count": 1}));
}

#[tokio::test]
async fn storage_failure_surfaces_as_persistence_error() {
    let template = counter_process();
    let err = runtime(Arc::new(FailingStorage::new()))
        .start(&template, ProcessEvent::signal("Bump"))
        .await
        .err()
        .unwrap();
    assert!(matches!(err, ProcessError::Persistence(_)), "got {err}");
}

#[tokio::test]
async fn corrupt_join_buffer_is_rejected_on_resume() {
    let template = join_process();
    let storage = Arc::new(InMemoryStorage::new());
    let run_id = RunId::from_string("corrupt-run");
    storage
        .put(&step_edges_key(&run_id, "Sum"), json!({"ghost": {"stale": 1}}))
        .await
        .unwrap();

    let err = runtime(storage)
        .resume(&template, run_id, ProcessEvent::new("A", json!(1)))
        .await
        .err()
        .unwrap();
    match err {
        ProcessError::JoinStateCorruption { step, parameter, .. } => {
            assert_eq!(step, "Sum");
            assert_eq!(parameter, "stale");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn leftover_buffer_on_unjoined_step_is_rejected_on_resume() {
    let template = counter_process();
    let storage = Arc::new(RecordingStorage::new());
    let run_id = RunId::from_string("stale-run");
    storage.insert(
        step_edges_key(&run_id, "Counter"),
        json!({"bump(x<-Old.run.OnResult)": {"stale": 1}}),
    );

    let err = runtime(storage.clone())
        .resume(&template, run_id, ProcessEvent::signal("Bump"))
        .await
        .err()
        .unwrap();
    match err {
        ProcessError::JoinStateCorruption { step, parameter, .. } => {
            assert_eq!(step, "Counter");
            assert_eq!(parameter, "stale");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(storage.puts().is_empty());
}

#[tokio::test]
async fn counter_step_updates_context_state() {
    let mut t = TestContext::with_state("Counter", "bump", Some(json!({"count": 4})));
    let out = bump(input(json!({})), t.ctx.clone()).await.unwrap();
    assert_eq!(out, json!(5));
    assert_eq!(t.state(), Some(json!({"count": 5})));
    assert!(t.drain().is_empty());
}

#[tokio::test]
async fn nested_join_keeps_collecting_after_resume() {
    let mut inner = ProcessBuilder::new("Pair");
    let a = inner.add_step(StepBuilder::new("A").function("run", &["v"], passthrough));
    let b = inner.add_step(StepBuilder::new("B").function("run", &["v"], passthrough));
    let sum = inner.add_step(StepBuilder::new("Sum").function("add", &["a", "b"], add));
    inner.on_input_event("A").send_event_to(Target::function(a, "run"));
    inner.on_input_event("B").send_event_to(Target::function(b, "run"));
    inner
        .on_all_of(vec![
            JoinSource::function_result(a, "run", "a"),
            JoinSource::function_result(b, "run", "b"),
        ])
        .send_event_to(Target::function(sum, "add"));
    inner
        .on_function_result(sum, "add")
        .send_event_to(Target::emit_public("Sum"));

    let mut outer = ProcessBuilder::new("Outer");
    let pair = outer.add_process(inner);
    outer
        .on_input_event("Left")
        .send_event_to(Target::process_input(pair, "A"));
    outer
        .on_input_event("Right")
        .send_event_to(Target::process_input(pair, "B"));
    outer
        .on_event(pair, "Sum")
        .send_event_to(Target::emit_public("Total"));
    let template = outer.build().unwrap();

    let storage: Arc<dyn StorageConnector> = Arc::new(InMemoryStorage::new());
    let first = runtime(storage.clone())
        .start(&template, ProcessEvent::new("Left", json!(20)))
        .await
        .unwrap();
    assert!(first.last_event("Total").is_none());
    let run_id = first.run_id().clone();
    drop(first);

    let resumed = runtime(storage)
        .resume(&template, run_id, ProcessEvent::new("Right", json!(22)))
        .await
        .unwrap();
    assert_eq!(resumed.last_event("Total"), Some(&json!(42)));
    let state = resumed.get_state();
    let child = state.step("Pair").unwrap().process.as_ref().unwrap();
    assert!(child.step("Sum").unwrap().pending_edges.is_empty());
}

#[tokio::test]
async fn disabled_persistence_writes_nothing() {
    let storage = Arc::new(RecordingStorage::new());
    let config = EngineConfig {
        persist: false,
        ..test_engine_config()
    };
    ProcessRuntime::new(config)
        .with_storage(storage.clone())
        .start(&counter_process(), ProcessEvent::signal("Bump"))
        .await
        .unwrap();
    assert!(storage.puts().is_empty());
}

#[tokio::test]
async fn sqlite_backed_resume() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.db");
    let template = counter_process();

    let run_id = {
        let storage = Arc::new(SqliteStorage::open(&path).unwrap());
        let handle = runtime(storage)
            .start(&template, ProcessEvent::signal("Bump"))
            .await
            .unwrap();
        handle.run_id().clone()
    };

    let storage = Arc::new(SqliteStorage::open(&path).unwrap());
    let keys = storage.keys_with_prefix(&format!("{}.", run_id)).unwrap();
    assert_eq!(keys, vec![step_state_key(&run_id, "Counter")]);

    let handle = runtime(storage)
        .resume(&template, run_id, ProcessEvent::signal("Bump"))
        .await
        .unwrap();
    assert_eq!(handle.last_event("Count"), Some(&json!(2)));
}
