//! A research agent expressed as a workflow: plan, gather sources in a
//! loop, then summarize. An observer prints every step as it completes.

use async_trait::async_trait;
use hataori::prelude::*;
use hataori::StepEvent;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Source {
    title: String,
    relevance: f64,
}

#[derive(Debug)]
struct PlanStep;

#[async_trait]
impl StepHandler for PlanStep {
    async fn execute(
        &self,
        state: WorkflowState,
        _ctx: RunContext,
    ) -> Result<StepOutput, BoxError> {
        let topic = state.get::<String>("topic").unwrap_or_default();
        let queries: Vec<String> = ["overview", "history", "open problems"]
            .iter()
            .map(|aspect| format!("{topic} {aspect}"))
            .collect();
        Ok(StepOutput::next("gather").set("queries", serde_json::to_value(queries)?))
    }
}

#[derive(Debug)]
struct GatherStep;

#[async_trait]
impl StepHandler for GatherStep {
    async fn execute(
        &self,
        state: WorkflowState,
        ctx: RunContext,
    ) -> Result<StepOutput, BoxError> {
        let queries = state.get::<Vec<String>>("queries").unwrap_or_default();
        let mut sources = state.get::<Vec<Source>>("sources").unwrap_or_default();

        let Some(query) = queries.get(sources.len()) else {
            return Ok(StepOutput::next("summarize"));
        };
        ctx.emitter()
            .emit("search", query.clone())
            .await?;
        sources.push(Source {
            title: format!("Notes on {query}"),
            relevance: 1.0 / (sources.len() as f64 + 1.0),
        });

        let next = if sources.len() < queries.len() {
            Directive::Repeat
        } else {
            Directive::parse("summarize")
        };
        Ok(StepOutput::next(next).set("sources", serde_json::to_value(sources)?))
    }
}

#[derive(Debug)]
struct SummarizeStep;

#[async_trait]
impl StepHandler for SummarizeStep {
    async fn execute(
        &self,
        state: WorkflowState,
        _ctx: RunContext,
    ) -> Result<StepOutput, BoxError> {
        let sources = state.get::<Vec<Source>>("sources").unwrap_or_default();
        let titles: Vec<&str> = sources.iter().map(|s| s.title.as_str()).collect();
        Ok(StepOutput::done().set("summary", titles.join("; ")))
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let workflow = Workflow::builder("research")
        .schema(
            ObjectSchema::new()
                .field("topic", FieldKind::String)
                .optional("queries", FieldKind::Array)
                .optional("sources", FieldKind::Array)
                .optional("summary", FieldKind::String),
        )
        .add_step("plan", PlanStep)
        .add_step("gather", GatherStep)
        .add_step("summarize", SummarizeStep)
        .build()?;

    workflow.emitter().on(
        "success",
        |event| {
            if let Some(step) = event.payload::<StepEvent>() {
                println!("step '{}' done (next: {:?})", step.step, step.next);
            }
            async { Ok(()) }
        },
        ListenerOptions::new().match_nested(true),
    )?;
    workflow.emitter().on(
        "search",
        |event| {
            if let Some(query) = event.payload::<String>() {
                println!("searching: {query}");
            }
            async { Ok(()) }
        },
        ListenerOptions::new().blocking().match_nested(true),
    )?;

    let mut initial = WorkflowState::new();
    initial.insert("topic", "rust async runtimes");

    let run = workflow.run(initial).await?;
    println!("steps: {:?}", run.step_names());
    match run.into_result() {
        Ok(state) => println!("summary: {}", state.get::<String>("summary").unwrap_or_default()),
        Err(error) => eprintln!("Workflow failed: {error}"),
    }

    Ok(())
}
