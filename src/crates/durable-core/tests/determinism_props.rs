//! Property tests: fan-out ordering and replay determinism

use chrono::Utc;
use durable_checkpoint::{ExecutionRecord, HistoryStore, InMemoryHistoryStore};
use durable_core::{
    workflow_fn, DurableError, ExecutionDriver, ManualClock, MapConfig, StepRecord,
};
use proptest::prelude::*;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone)]
enum Op {
    Step(u8),
    Wait(u64),
    Fail,
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => any::<u8>().prop_map(Op::Step),
        2 => (1u64..3600).prop_map(Op::Wait),
        1 => Just(Op::Fail),
    ]
}

/// Interprets `program`; with `replaying` every operation body errors out
fn interpreter(program: Vec<Op>, replaying: bool) -> impl durable_core::Workflow {
    workflow_fn("program", move |ctx, _| {
        let program = program.clone();
        async move {
            let mut values = Vec::new();
            for (i, op) in program.into_iter().enumerate() {
                let name = format!("op-{}", i);
                match op {
                    Op::Step(v) => {
                        let value: u8 = ctx
                            .step(&name, || async move {
                                if replaying {
                                    Err(DurableError::failed("replayed step ran"))
                                } else {
                                    Ok(v)
                                }
                            })
                            .await?;
                        values.push(json!(value));
                    }
                    Op::Wait(secs) => ctx.wait_named(&name, Duration::from_secs(secs)).await?,
                    Op::Fail => {
                        let caught = ctx
                            .step::<u8, _, _>(&name, || async { Err(DurableError::operation("Boom", "planned")) })
                            .await;
                        match caught {
                            Err(err) if err.is_suspended() => return Err(err),
                            Err(err) => values.push(json!(err.kind())),
                            Ok(v) => values.push(json!(v)),
                        }
                    }
                }
            }
            Ok(Value::Array(values))
        }
    })
}

fn summary(history: &[StepRecord]) -> Vec<(String, String, String)> {
    history
        .iter()
        .map(|r| (r.namespace.to_string(), r.name.clone(), format!("{:?}", r.status)))
        .collect()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Branch results come back in input order whatever order branches finish in
    #[test]
    fn prop_fan_out_preserves_input_order(
        delays in proptest::collection::vec(0u64..50, 1..8),
        limit in 1usize..4,
    ) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .start_paused(true)
            .build()
            .unwrap();
        runtime.block_on(async {
            let items: Vec<(usize, u64)> = delays.iter().copied().enumerate().collect();
            let driver = ExecutionDriver::new(workflow_fn("ordered", move |ctx, _| {
                let items = items.clone();
                async move {
                    let out: Vec<usize> = ctx
                        .map_with_config(
                            "items",
                            items,
                            MapConfig::new().with_max_concurrency(limit),
                            |branch, (index, delay): (usize, u64), _| async move {
                                tokio::time::sleep(Duration::from_millis(delay)).await;
                                branch.step("id", || async move { Ok(index) }).await
                            },
                        )
                        .await?;
                    Ok(json!(out))
                }
            }))
            .with_clock(Arc::new(ManualClock::new()));

            let outcome = driver.start("order", Value::Null).await.unwrap();
            let expected: Vec<usize> = (0..delays.len()).collect();
            prop_assert_eq!(outcome.completed().cloned(), Some(json!(expected)));
            Ok::<(), TestCaseError>(())
        })?;
    }

    /// Replaying a finished history with failing operation bodies yields the same
    /// result and leaves the history untouched
    #[test]
    fn prop_replay_is_deterministic(program in proptest::collection::vec(op_strategy(), 1..12)) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .unwrap();
        runtime.block_on(async {
            let clock = ManualClock::new();
            let driver = ExecutionDriver::new(interpreter(program.clone(), false))
                .with_clock(Arc::new(clock.clone()));
            let outcome = driver.run_to_completion("p", Value::Null).await.unwrap();
            prop_assert!(outcome.is_completed());
            let original = driver.history("p").await.unwrap();

            let store = InMemoryHistoryStore::new();
            store
                .create_execution(ExecutionRecord::new("p", Value::Null, Utc::now()))
                .await
                .unwrap();
            for record in original.iter().cloned() {
                store.append(record).await.unwrap();
            }

            let replayer = ExecutionDriver::new(interpreter(program.clone(), true))
                .with_history_store(Arc::new(store.clone()))
                .with_clock(Arc::new(clock));
            let replayed = replayer.start("p", Value::Null).await.unwrap();

            prop_assert_eq!(replayed, outcome);
            let after = store.history("p").await.unwrap();
            prop_assert_eq!(summary(&after), summary(&original));
            Ok::<(), TestCaseError>(())
        })?;
    }
}
