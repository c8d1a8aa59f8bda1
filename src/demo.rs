//! The built-in sum-of-squares process run by `stepgraph run`.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use stepgraph_core::error::Result;
use stepgraph_core::{FunctionInput, StepContext};
use stepgraph_engine::{ProcessBuilder, ProcessTemplate, StepBuilder, Target};

pub const START_EVENT: &str = "Start";
pub const DONE_EVENT: &str = "Done";

/// Running totals kept by the `Sum` step across runs of one instance.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Tally {
    pub runs: u64,
    pub last_total: i64,
    pub grand_total: i64,
}

async fn generate(input: FunctionInput, _ctx: StepContext) -> Result<Value> {
    let values: Vec<i64> = input.arg("values")?;
    Ok(json!(values))
}

async fn square(input: FunctionInput, _ctx: StepContext) -> Result<Value> {
    let x: i64 = input.arg("x")?;
    Ok(json!(x * x))
}

async fn total(input: FunctionInput, ctx: StepContext) -> Result<Value> {
    let squares: Vec<i64> = input.arg("squares")?;
    let sum: i64 = squares.iter().sum();
    ctx.update_state(|tally: &mut Tally| {
        tally.runs += 1;
        tally.last_total = sum;
        tally.grand_total += sum;
    })?;
    Ok(json!(sum))
}

/// `Start(values) -> Generate -> map(Compute.square) -> Sum -> Done`.
pub fn sum_of_squares() -> Result<Arc<ProcessTemplate>> {
    let mut process = ProcessBuilder::new("SumOfSquares");
    let gen = process.add_step(StepBuilder::new("Generate").function("generate", &["values"], generate));
    let squares = process.add_map(
        "Squares",
        StepBuilder::new("Compute").function("square", &["x"], square),
    );
    let sum = process.add_step(
        StepBuilder::new("Sum")
            .with_state(json!(Tally::default()))
            .function("total", &["squares"], total),
    );

    process
        .on_input_event(START_EVENT)
        .send_event_to(Target::function(gen, "generate"));
    process
        .on_function_result(gen, "generate")
        .send_event_to(Target::function(squares, "square"));
    process
        .on_function_result(squares, "square")
        .send_event_to(Target::function(sum, "total"));
    process
        .on_function_result(sum, "total")
        .send_event_to(Target::emit_public(DONE_EVENT));
    process.build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use stepgraph_core::config::EngineConfig;
    use stepgraph_core::types::ProcessEvent;
    use stepgraph_engine::ProcessRuntime;

    #[tokio::test]
    async fn demo_sums_squares_and_keeps_a_tally() {
        let template = sum_of_squares().unwrap();
        let mut handle = ProcessRuntime::new(EngineConfig::default())
            .start(&template, ProcessEvent::new(START_EVENT, json!([1, 2, 3])))
            .await
            .unwrap();
        assert_eq!(handle.last_event(DONE_EVENT), Some(&json!(14)));

        handle
            .send_event(ProcessEvent::new(START_EVENT, json!([4])))
            .await
            .unwrap();
        let tally = handle.get_state().step_state("Sum").cloned().unwrap();
        assert_eq!(tally["runs"], 2);
        assert_eq!(tally["grand_total"], 30);
    }
}
