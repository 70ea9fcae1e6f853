//! Embeds a slow tool workflow inside an agent workflow and cancels the
//! whole run from outside with a timeout.

use hataori::prelude::*;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let tool = Workflow::builder("slow_tool")
        .add_step(
            "call",
            step_fn(|state, ctx| async move {
                let attempt = state.get::<u32>("attempt").unwrap_or(0);
                println!(
                    "tool attempt {attempt} (trace {}, parent run {:?})",
                    ctx.trace().id,
                    ctx.trace().parent_run_id
                );
                tokio::select! {
                    _ = ctx.signal().aborted() => println!("tool call cancelled"),
                    _ = tokio::time::sleep(Duration::from_millis(200)) => {}
                }
                Ok(StepOutput::repeat().set("attempt", attempt + 1))
            }),
        )
        .max_steps(50)
        .build()?;

    let agent = Workflow::builder("agent")
        .add_step(
            "think",
            step_fn(|_, _| async { Ok(StepOutput::proceed().set("thought", "use the tool")) }),
        )
        .add_step(
            "act",
            Arc::new(tool).as_step(
                SubWorkflowOptions::new()
                    .input(|_| WorkflowState::new())
                    .output(|_, result| {
                        let mut update = hataori::StateUpdate::new();
                        if let Some(attempts) = result.get_value("attempt") {
                            update.insert("tool_attempts".to_string(), attempts.clone());
                        }
                        update
                    }),
            ),
        )
        .build()?;

    let token = CancellationToken::new();
    let timer = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(500)).await;
        timer.cancel();
    });

    let run = agent
        .run_with(WorkflowState::new(), RunOptions::new().signal(token))
        .await?;

    println!("status: {:?}", run.status());
    println!("history: {:?}", run.step_names());
    if let Some(error) = run.error() {
        println!("error: {error}");
    }

    Ok(())
}
