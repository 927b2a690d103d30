// Copyright (c) 2025 Flowrun Team
// SPDX-License-Identifier: Apache-2.0

//! Builds a small workflow programmatically and runs it.

use flowrun_core::{RunnerOptions, WorkflowRunner};
use flowrun_sdk::{StepBuilder, WorkflowBuilder};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let workflow = WorkflowBuilder::new("sdk-demo")
        .description("Three steps with a fan-out in the middle")
        .default_max_concurrency(2)
        .step(StepBuilder::script("fetch", "echo").arg("fetched"))
        .step(
            StepBuilder::script("left", "echo")
                .arg("left saw: {{trim(steps.fetch.stdout)}}")
                .depends_on("fetch"),
        )
        .step(
            StepBuilder::script("right", "echo")
                .arg("right saw: {{trim(steps.fetch.stdout)}}")
                .depends_on("fetch"),
        )
        .step(
            StepBuilder::script("join", "echo")
                .arg("done")
                .depends_on("left")
                .depends_on("right"),
        )
        .build()?;

    let runner = WorkflowRunner::new(RunnerOptions {
        enable_metrics: true,
        ..Default::default()
    });
    let result = runner.execute(workflow).await?;

    print!("{}", runner.generate_summary(&result));
    Ok(())
}
