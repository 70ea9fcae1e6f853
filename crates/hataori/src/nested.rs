//! Running a workflow as a step of another workflow.

use crate::run::{RunContext, RunOptions};
use crate::workflow::{StepHandler, Workflow};
use async_trait::async_trait;
use hataori_core::{BoxError, Directive, StateUpdate, StepOutput, WorkflowState};
use std::fmt;
use std::sync::Arc;

type InputFn = Arc<dyn Fn(&WorkflowState) -> WorkflowState + Send + Sync>;
type OutputFn = Arc<dyn Fn(&WorkflowState, &WorkflowState) -> StateUpdate + Send + Sync>;

/// How a sub-workflow is wired into its parent.
///
/// By default the sub-workflow starts from an empty state, its result
/// leaves the parent state untouched and the parent run ends afterwards.
#[derive(Clone)]
pub struct SubWorkflowOptions {
    input: Option<InputFn>,
    output: Option<OutputFn>,
    next: Directive,
}

impl Default for SubWorkflowOptions {
    fn default() -> Self {
        Self {
            input: None,
            output: None,
            next: Directive::End,
        }
    }
}

impl fmt::Debug for SubWorkflowOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubWorkflowOptions")
            .field("input", &self.input.is_some())
            .field("output", &self.output.is_some())
            .field("next", &self.next)
            .finish()
    }
}

impl SubWorkflowOptions {
    /// Default wiring.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds the sub-workflow's initial state from the parent state.
    pub fn input<F>(mut self, input: F) -> Self
    where
        F: Fn(&WorkflowState) -> WorkflowState + Send + Sync + 'static,
    {
        self.input = Some(Arc::new(input));
        self
    }

    /// Maps `(parent state, sub-workflow result)` to an update of the parent.
    pub fn output<F>(mut self, output: F) -> Self
    where
        F: Fn(&WorkflowState, &WorkflowState) -> StateUpdate + Send + Sync + 'static,
    {
        self.output = Some(Arc::new(output));
        self
    }

    /// Directive returned to the parent after the sub-workflow succeeds.
    pub fn next(mut self, next: impl Into<Directive>) -> Self {
        self.next = next.into();
        self
    }
}

/// A [`StepHandler`] that runs a whole workflow as one step.
///
/// The sub-workflow runs nested in the parent run: it shares the parent's
/// trace id, records the parent run as `parent_run_id` and is aborted with
/// it. A failed or aborted sub-run fails the step.
#[derive(Debug, Clone)]
pub struct SubWorkflow {
    workflow: Arc<Workflow>,
    options: SubWorkflowOptions,
}

impl SubWorkflow {
    /// The embedded workflow.
    pub fn workflow(&self) -> &Arc<Workflow> {
        &self.workflow
    }
}

impl Workflow {
    /// Wraps this workflow as a step of another workflow.
    pub fn as_step(self: &Arc<Self>, options: SubWorkflowOptions) -> SubWorkflow {
        SubWorkflow {
            workflow: Arc::clone(self),
            options,
        }
    }
}

#[async_trait]
impl StepHandler for SubWorkflow {
    async fn execute(
        &self,
        state: WorkflowState,
        ctx: RunContext,
    ) -> Result<StepOutput, BoxError> {
        let input = match &self.options.input {
            Some(input) => input(&state),
            None => WorkflowState::new(),
        };
        let run = self
            .workflow
            .run_with(input, RunOptions::nested(&ctx))
            .await?;
        let result = run.into_result()?;

        Ok(StepOutput {
            update: self.options.output.as_ref().map(|output| output(&state, &result)),
            next: Some(self.options.next.clone()),
        })
    }
}
