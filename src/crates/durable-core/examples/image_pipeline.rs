//! Image pipeline - a durable workflow with every primitive
//!
//! An uploaded image set goes through:
//!
//! 1. `validate`         step
//! 2. `thumbnails`       map over images (bounded concurrency)
//! 3. `recognize`        invoke of a registered function
//! 4. `price`            step (placeholder pricing)
//! 5. `catalog`          child context storing the result
//! 6. `index-ready`      condition wait polling a fake search index
//! 7. `approval`         callback wait, signalled from a separate task
//!
//! Run with:
//!
//! ```bash
//! RUST_LOG=durable_core=debug cargo run -p durable-core --example image_pipeline
//! ```

use anyhow::Context as _;
use durable_core::{
    init_tracing, workflow_fn, CallbackOutcome, ConditionConfig, DurableContext, DurableError,
    EngineConfig, ExecutionDriver, ExecutionOutcome, LocalInvoker, MapConfig, RecordingSubmitter,
    RetryPolicy, StepConfig, WaitDecision,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Thumbnail {
    source: String,
    width: u32,
}

fn parse_images(input: &Value) -> durable_core::Result<Vec<String>> {
    let images: Vec<String> = serde_json::from_value(input["images"].clone())?;
    if images.is_empty() {
        return Err(DurableError::operation("EmptyUpload", "no images"));
    }
    Ok(images)
}

async fn pipeline(ctx: DurableContext, input: Value) -> durable_core::Result<Value> {
    let images: Vec<String> = ctx
        .step("validate", || {
            let input = input.clone();
            async move { parse_images(&input) }
        })
        .await?;

    let thumbnails: Vec<Thumbnail> = ctx
        .map_with_config(
            "thumbnails",
            images.clone(),
            MapConfig::new().with_max_concurrency(2),
            |branch, source: String, _| async move {
                branch
                    .step("scale", || {
                        let source = source.clone();
                        async move { Ok(Thumbnail { source, width: 128 }) }
                    })
                    .await
            },
        )
        .await?;

    let labels: Vec<String> = ctx
        .invoke_with_config(
            "recognize",
            "recognize",
            json!({ "images": images }),
            StepConfig::new().with_retry(RetryPolicy::new(2).with_error_kinds(["Throttled"])),
        )
        .await?;

    let price: f64 = ctx
        .step("price", || {
            let count = thumbnails.len();
            async move { Ok(count as f64 * 4.99) }
        })
        .await?;

    let listing_id: String = ctx
        .run_in_child_context("catalog", |catalog| async move {
            let id: String = catalog
                .step("allocate-id", || async { Ok(uuid::Uuid::new_v4().to_string()) })
                .await?;
            let _: bool = catalog.step("store", || async { Ok(true) }).await?;
            Ok(id)
        })
        .await?;

    let polls: u32 = ctx
        .wait_for_condition(
            "index-ready",
            ConditionConfig::new(0u32).with_timeout(Duration::from_secs(600)),
            |polls, _| async move { Ok(polls + 1) },
            |polls, _| {
                if *polls >= 3 {
                    WaitDecision::Done
                } else {
                    WaitDecision::continue_after(Duration::from_millis(200))
                }
            },
        )
        .await?;

    let approval: CallbackOutcome<Value> = ctx
        .wait_for_callback("approval", Some(Duration::from_secs(3600)))
        .await?;

    Ok(json!({
        "listing": listing_id,
        "thumbnails": thumbnails.len(),
        "labels": labels,
        "price": price,
        "indexPolls": polls,
        "approval": approval.received(),
    }))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = EngineConfig::load(None).context("loading engine config")?;
    init_tracing(&config.logging).context("initialising tracing")?;

    let invoker = LocalInvoker::new().with_function("recognize", |payload| async move {
        let count = payload["images"].as_array().map(Vec::len).unwrap_or(0);
        Ok(json!((0..count).map(|i| format!("label-{}", i)).collect::<Vec<_>>()))
    });
    let submitter = RecordingSubmitter::new();

    let driver = Arc::new(
        ExecutionDriver::new(workflow_fn("image-pipeline", pipeline))
            .with_config(config)
            .with_invoker(Arc::new(invoker))
            .with_submitter(Arc::new(submitter.clone())),
    );

    let approver = {
        let driver = Arc::clone(&driver);
        let submitter = submitter.clone();
        tokio::spawn(async move {
            loop {
                if let Some(request) = submitter.find("approval") {
                    return driver
                        .signal(&request.callback_id, json!({ "approvedBy": "reviewer" }))
                        .await;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
    };

    let input = json!({ "images": ["a.png", "b.png", "c.png"] });
    let outcome = driver.run_to_completion("upload-1", input).await?;
    let signal = approver.await??;
    println!("approval signal accepted: {}", signal.accepted());

    match outcome {
        ExecutionOutcome::Completed(value) => {
            println!("completed: {}", serde_json::to_string_pretty(&value)?);
        }
        ExecutionOutcome::Failed { error, history } => {
            println!("failed: {} after {} steps", error, history.len());
        }
        ExecutionOutcome::Suspended(suspension) => {
            println!("still waiting: {:?}", suspension);
        }
    }

    for record in driver.history("upload-1").await? {
        println!(
            "[{:>2}] {:<24} {:<22} {:?}",
            record.sequence,
            record.namespace.to_string(),
            record.name,
            record.status
        );
    }
    Ok(())
}
