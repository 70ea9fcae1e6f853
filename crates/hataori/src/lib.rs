//! Execution substrate for LLM-driven agents.
//!
//! - [`Emitter`]: hierarchical event bus used for observability and control
//! - [`RunContext`]: one cancellable, traceable invocation of an owner
//! - [`Workflow`]: step-graph engine with branching, loops and nesting
//!
//! # Example
//!
//! ```rust
//! use hataori::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), WorkflowError> {
//!     let workflow = Workflow::builder("hops")
//!         .schema(ObjectSchema::new().with_default("hops", FieldKind::Integer, 0))
//!         .add_step(
//!             "a",
//!             step_fn(|state, _ctx| async move {
//!                 let hops = state.get::<i64>("hops").unwrap_or(0);
//!                 Ok(StepOutput::next("b").set("hops", hops + 1))
//!             }),
//!         )
//!         .add_step("b", step_fn(|_, _| async { Ok(StepOutput::done()) }))
//!         .build()?;
//!
//!     let run = workflow.run(WorkflowState::new()).await?;
//!     assert_eq!(run.step_names(), vec!["a", "b"]);
//!
//!     let state = run.into_result()?;
//!     assert_eq!(state.get::<i64>("hops"), Some(1));
//!     Ok(())
//! }
//! ```

mod config;
mod emitter;
mod history;
mod nested;
mod run;
mod signal;
mod workflow;

// Re-export core types
pub use hataori_core::*;

pub use config::{WorkflowConfig, DEFAULT_MAX_STEPS};
pub use emitter::{
    Emitter, EmitterOptions, EmitterSnapshot, Event, ListenerFuture, ListenerId, ListenerOptions,
    PipeHandle,
};
pub use history::{RunStatus, StepOutcome, StepRecord, WorkflowRun, WorkflowRunSnapshot};
pub use nested::{SubWorkflow, SubWorkflowOptions};
pub use run::{
    Middleware, Run, RunContext, RunContextSnapshot, RunEvent, RunOptions, RunOwner,
    RunSettlement, RunState,
};
pub use signal::AbortSignal;
pub use workflow::{step_fn, StepEvent, StepHandler, Workflow, WorkflowBuilder};

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::{
        step_fn, BoxError, Directive, Emitter, EmitterOptions, Event, FieldKind, ListenerOptions,
        Matcher, ObjectSchema, RunContext, RunOptions, RunStatus, Schema, StepHandler, StepName,
        StepOutput, SubWorkflowOptions, Workflow, WorkflowBuilder, WorkflowConfig, WorkflowError,
        WorkflowRun, WorkflowState,
    };
}
