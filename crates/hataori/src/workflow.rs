//! Workflow engine for executing steps.

use crate::config::WorkflowConfig;
use crate::emitter::{Emitter, EmitterOptions};
use crate::history::{StepOutcome, WorkflowRun};
use crate::run::{RunContext, RunOptions, RunOwner, RunState};
use async_trait::async_trait;
use hataori_core::{
    AnySchema, BoxError, Directive, Schema, StepName, StepOutput, WorkflowError, WorkflowState,
};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Executes one step.
///
/// Handlers receive a copy of the current state and the run context. The
/// returned update is merged by the engine; handlers never mutate the
/// workflow state directly.
#[async_trait]
pub trait StepHandler: Send + Sync {
    /// Runs the step.
    async fn execute(&self, state: WorkflowState, ctx: RunContext)
        -> Result<StepOutput, BoxError>;
}

#[async_trait]
impl<F, Fut> StepHandler for F
where
    F: Fn(WorkflowState, RunContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<StepOutput, BoxError>> + Send + 'static,
{
    async fn execute(
        &self,
        state: WorkflowState,
        ctx: RunContext,
    ) -> Result<StepOutput, BoxError> {
        self(state, ctx).await
    }
}

/// Wraps a closure as a [`StepHandler`], fixing its argument and error
/// types for inference.
///
/// ```
/// use hataori::{step_fn, StepOutput};
///
/// let handler = step_fn(|state, _ctx| async move {
///     let hops = state.get::<i64>("hops").unwrap_or(0);
///     Ok(StepOutput::next("b").set("hops", hops + 1))
/// });
/// # let _ = handler;
/// ```
pub fn step_fn<F, Fut>(f: F) -> F
where
    F: Fn(WorkflowState, RunContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<StepOutput, BoxError>> + Send + 'static,
{
    f
}

/// Payload of the per-step `start`, `success` and `error` events.
#[derive(Debug, Clone)]
pub struct StepEvent {
    /// Workflow name.
    pub workflow: String,
    /// Run id.
    pub run_id: String,
    /// Step being executed.
    pub step: StepName,
    /// State before the step (`start`, `error`) or after it (`success`).
    pub state: WorkflowState,
    /// Directive returned by the handler, on `success`.
    pub next: Option<Directive>,
    /// Error message, on `error`.
    pub error: Option<String>,
}

struct StepEntry {
    name: StepName,
    handler: Arc<dyn StepHandler>,
    schema: Option<Arc<dyn Schema>>,
}

/// A named graph of steps sharing one validated state.
///
/// Steps run one at a time. Each returns a [`StepOutput`] whose update is
/// shallow-merged into the state and whose directive picks the next step;
/// without a directive the next declared step runs, and the run ends after
/// the last one.
///
/// A workflow owns an emitter with namespace `["workflow", name]`. Every run
/// gets a child of it, on which `start`, `success` and `error` are emitted
/// for each step with a [`StepEvent`] payload.
pub struct Workflow {
    name: String,
    schema: Arc<dyn Schema>,
    steps: Vec<StepEntry>,
    start_step: Option<StepName>,
    config: WorkflowConfig,
    emitter: Emitter,
    run_state: RunState,
}

impl fmt::Debug for Workflow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Workflow")
            .field("name", &self.name)
            .field("steps", &self.step_names().collect::<Vec<_>>())
            .field("start_step", &self.start_step)
            .field("config", &self.config)
            .finish()
    }
}

impl Workflow {
    /// Creates an empty workflow whose emitter hangs off the root emitter.
    pub fn new(name: impl Into<String>) -> Result<Self, WorkflowError> {
        Self::with_parent(name, &Emitter::root())
    }

    /// Creates an empty workflow whose emitter is a child of `parent`.
    pub fn with_parent(name: impl Into<String>, parent: &Emitter) -> Result<Self, WorkflowError> {
        let name = name.into();
        let emitter = parent.child(
            EmitterOptions::new()
                .namespace(["workflow", name.as_str()])
                .creator(format!("workflow:{name}")),
        )?;
        Ok(Self {
            name,
            schema: Arc::new(AnySchema),
            steps: Vec::new(),
            start_step: None,
            config: WorkflowConfig::default(),
            emitter,
            run_state: RunState::new(),
        })
    }

    /// Creates a new workflow builder.
    pub fn builder(name: impl Into<String>) -> WorkflowBuilder {
        WorkflowBuilder::new(name)
    }

    /// Returns the workflow name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the workflow emitter.
    pub fn emitter(&self) -> &Emitter {
        &self.emitter
    }

    /// Returns the configuration.
    pub fn config(&self) -> &WorkflowConfig {
        &self.config
    }

    /// Returns the name of the start step.
    pub fn start_step(&self) -> Option<&StepName> {
        self.start_step.as_ref()
    }

    /// Returns the step names in declaration order.
    pub fn step_names(&self) -> impl Iterator<Item = &StepName> {
        self.steps.iter().map(|entry| &entry.name)
    }

    /// Returns `true` if a step with the given name exists.
    pub fn has_step(&self, name: &str) -> bool {
        self.position(name).is_some()
    }

    /// Returns the number of registered steps.
    pub fn step_count(&self) -> usize {
        self.steps.len()
    }

    /// Returns `true` while a run is active.
    pub fn is_running(&self) -> bool {
        self.run_state.is_running()
    }

    /// Replaces the state schema.
    pub fn set_schema(&mut self, schema: impl Schema + 'static) -> &mut Self {
        self.schema = Arc::new(schema);
        self
    }

    /// Replaces the configuration.
    pub fn set_config(&mut self, config: WorkflowConfig) -> &mut Self {
        self.config = config;
        self
    }

    /// Adds a step. The first step added to an empty workflow becomes the
    /// start step.
    pub fn add_step(
        &mut self,
        name: impl Into<StepName>,
        handler: impl StepHandler + 'static,
    ) -> Result<&mut Self, WorkflowError> {
        self.insert(name.into(), Arc::new(handler), None)
    }

    /// Adds a step whose input state must also satisfy `schema`.
    ///
    /// A mismatch fails the run with [`WorkflowError::Validation`] before the
    /// handler is invoked.
    pub fn add_strict_step(
        &mut self,
        name: impl Into<StepName>,
        schema: impl Schema + 'static,
        handler: impl StepHandler + 'static,
    ) -> Result<&mut Self, WorkflowError> {
        self.insert(name.into(), Arc::new(handler), Some(Arc::new(schema)))
    }

    fn insert(
        &mut self,
        name: StepName,
        handler: Arc<dyn StepHandler>,
        schema: Option<Arc<dyn Schema>>,
    ) -> Result<&mut Self, WorkflowError> {
        name.validate()?;
        if self.has_step(name.as_str()) {
            return Err(WorkflowError::Configuration(format!(
                "Step '{name}' is already defined in workflow '{}'",
                self.name
            )));
        }
        if self.steps.is_empty() && self.start_step.is_none() {
            self.start_step = Some(name.clone());
        }
        self.steps.push(StepEntry {
            name,
            handler,
            schema,
        });
        Ok(self)
    }

    /// Sets the entry step.
    pub fn set_start(&mut self, name: impl Into<StepName>) -> Result<&mut Self, WorkflowError> {
        let name = name.into();
        if !self.has_step(name.as_str()) {
            return Err(WorkflowError::UnknownStep(name));
        }
        self.start_step = Some(name);
        Ok(self)
    }

    /// Removes a step. Removing the start step leaves the workflow without
    /// one until [`set_start`](Self::set_start) is called.
    pub fn del_step(&mut self, name: &str) -> Result<&mut Self, WorkflowError> {
        let index = self
            .position(name)
            .ok_or_else(|| WorkflowError::UnknownStep(StepName::new(name)))?;
        self.steps.remove(index);
        if self.start_step.as_ref().is_some_and(|s| s.as_str() == name) {
            self.start_step = None;
        }
        Ok(self)
    }

    /// Aborts the active run, if any, and every later one.
    pub fn dispose(&self) {
        self.run_state.dispose();
        self.emitter.destroy();
    }

    /// Runs the workflow from its start step.
    pub async fn run(&self, initial: WorkflowState) -> Result<WorkflowRun, WorkflowError> {
        self.run_with(initial, RunOptions::new()).await
    }

    /// Runs the workflow with explicit run options.
    ///
    /// Returns `Err` only when the run cannot start: an invalid
    /// configuration, a missing or unknown start step, or an active run. Every other failure, including
    /// an abort, settles the returned [`WorkflowRun`].
    pub async fn run_with(
        &self,
        initial: WorkflowState,
        options: RunOptions,
    ) -> Result<WorkflowRun, WorkflowError> {
        self.config.validate()?;
        let start = self.resolve_start()?;
        let mut outcome = WorkflowRun::new(String::new(), self.name.as_str());

        let slot = &mut outcome;
        let run = RunContext::enter(self, options, move |ctx| {
            self.drive(ctx, start, initial, slot)
        })?;
        match run.await {
            Ok(()) => outcome.succeed(),
            Err(error) => {
                warn!("Workflow '{}' stopped: {}", self.name, error);
                outcome.fail(error)
            }
        }
        Ok(outcome)
    }

    fn resolve_start(&self) -> Result<StepName, WorkflowError> {
        let start = self
            .start_step
            .clone()
            .ok_or(WorkflowError::MissingStartStep)?;
        if !self.has_step(start.as_str()) {
            return Err(WorkflowError::UnknownStep(start));
        }
        Ok(start)
    }

    async fn drive(
        &self,
        ctx: RunContext,
        start: StepName,
        initial: WorkflowState,
        run: &mut WorkflowRun,
    ) -> Result<(), WorkflowError> {
        run.bind(ctx.id());
        let state = self
            .schema
            .parse(initial)
            .map_err(|source| WorkflowError::Validation {
                step_name: None,
                source,
            })?;
        run.start(state);
        debug!("Workflow '{}' started run '{}'", self.name, ctx.id());

        let mut current = start;
        loop {
            ctx.check_aborted()?;
            if run.steps_executed() >= self.config.max_steps {
                let error = WorkflowError::MaxStepsExceeded {
                    limit: self.config.max_steps,
                };
                return Err(self.step_failed(&ctx, &current, run.state(), error).await);
            }
            let entry = self
                .entry(current.as_str())
                .ok_or_else(|| WorkflowError::UnknownStep(current.clone()))?;

            self.notify(&ctx, "start", self.step_event(&ctx, &current, run.state()))
                .await;

            if let Some(schema) = &entry.schema {
                if let Err(source) = schema.parse(run.state().clone()) {
                    let error = WorkflowError::Validation {
                        step_name: Some(current.clone()),
                        source,
                    };
                    return Err(self.reject(&ctx, run, &current, error).await);
                }
            }

            run.count_step();
            let output = match entry.handler.execute(run.state().clone(), ctx.clone()).await {
                Ok(output) => output,
                Err(_) if ctx.is_aborted() => return Err(abort(&ctx, run, &current)),
                Err(source) => {
                    let error = WorkflowError::StepHandler {
                        step_name: current.clone(),
                        source,
                    };
                    return Err(self.reject(&ctx, run, &current, error).await);
                }
            };
            if ctx.is_aborted() {
                return Err(abort(&ctx, run, &current));
            }

            let mut next_state = run.state().clone();
            if let Some(update) = output.update {
                next_state.merge(update);
            }
            let next_state = match self.schema.parse(next_state) {
                Ok(state) => state,
                Err(source) => {
                    let error = WorkflowError::Validation {
                        step_name: Some(current.clone()),
                        source,
                    };
                    return Err(self.reject(&ctx, run, &current, error).await);
                }
            };
            run.set_state(next_state);
            run.record(
                current.clone(),
                run.state().clone(),
                StepOutcome::Completed {
                    next: output.next.clone(),
                },
            );

            let next = match self.resolve(&current, output.next.clone(), run) {
                Ok(next) => next,
                Err(error) => return Err(self.step_failed(&ctx, &current, run.state(), error).await),
            };

            let mut event = self.step_event(&ctx, &current, run.state());
            event.next = output.next;
            self.notify(&ctx, "success", event).await;
            info!("Step '{}' completed successfully", current);

            match next {
                Some(step) => current = step,
                None => return Ok(()),
            }
        }
    }

    fn resolve(
        &self,
        current: &StepName,
        directive: Option<Directive>,
        run: &WorkflowRun,
    ) -> Result<Option<StepName>, WorkflowError> {
        match directive {
            None => Ok(self
                .position(current.as_str())
                .and_then(|index| self.steps.get(index + 1))
                .map(|entry| entry.name.clone())),
            Some(Directive::End) => Ok(None),
            Some(Directive::Repeat) => Ok(Some(current.clone())),
            Some(Directive::Prev) => run.previous_step().cloned().map(Some).ok_or_else(|| {
                WorkflowError::NoPreviousStep {
                    step_name: current.clone(),
                }
            }),
            Some(Directive::Step(name)) if self.has_step(name.as_str()) => Ok(Some(name)),
            Some(Directive::Step(name)) => Err(WorkflowError::UnknownStep(name)),
        }
    }

    /// Records a failed step with the last valid state and reports it.
    async fn reject(
        &self,
        ctx: &RunContext,
        run: &mut WorkflowRun,
        step: &StepName,
        error: WorkflowError,
    ) -> WorkflowError {
        run.record(
            step.clone(),
            run.state().clone(),
            StepOutcome::Failed {
                error: error.to_string(),
            },
        );
        self.step_failed(ctx, step, run.state(), error).await
    }

    async fn step_failed(
        &self,
        ctx: &RunContext,
        step: &StepName,
        state: &WorkflowState,
        error: WorkflowError,
    ) -> WorkflowError {
        warn!("Step '{}' failed: {}", step, error);
        let mut event = self.step_event(ctx, step, state);
        event.error = Some(error.to_string());
        self.notify(ctx, "error", event).await;
        error
    }

    fn step_event(&self, ctx: &RunContext, step: &StepName, state: &WorkflowState) -> StepEvent {
        StepEvent {
            workflow: self.name.clone(),
            run_id: ctx.id().to_string(),
            step: step.clone(),
            state: state.clone(),
            next: None,
            error: None,
        }
    }

    async fn notify(&self, ctx: &RunContext, name: &str, event: StepEvent) {
        if let Err(err) = ctx.emitter().emit(name, event).await {
            warn!("Workflow '{}' observer failed on '{}': {}", self.name, name, err);
        }
    }

    fn entry(&self, name: &str) -> Option<&StepEntry> {
        self.steps.iter().find(|entry| entry.name.as_str() == name)
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.steps.iter().position(|entry| entry.name.as_str() == name)
    }
}

fn abort(ctx: &RunContext, run: &mut WorkflowRun, step: &StepName) -> WorkflowError {
    run.record(step.clone(), run.state().clone(), StepOutcome::Aborted);
    warn!("Step '{}' aborted", step);
    WorkflowError::Aborted {
        run_id: ctx.id().to_string(),
    }
}

impl RunOwner for Workflow {
    fn label(&self) -> String {
        self.name.clone()
    }

    fn emitter(&self) -> &Emitter {
        &self.emitter
    }

    fn run_state(&self) -> &RunState {
        &self.run_state
    }
}

/// Builder for constructing [`Workflow`] instances.
///
/// The first failing call is kept and returned from [`build`](Self::build).
pub struct WorkflowBuilder {
    workflow: Result<Workflow, WorkflowError>,
    start_step: Option<StepName>,
}

impl fmt::Debug for WorkflowBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkflowBuilder")
            .field("workflow", &self.workflow)
            .field("start_step", &self.start_step)
            .finish()
    }
}

impl WorkflowBuilder {
    /// Creates a new builder for a workflow named `name`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            workflow: Workflow::new(name),
            start_step: None,
        }
    }

    /// Creates a builder whose workflow emitter is a child of `parent`.
    pub fn with_parent(name: impl Into<String>, parent: &Emitter) -> Self {
        Self {
            workflow: Workflow::with_parent(name, parent),
            start_step: None,
        }
    }

    fn apply<F>(mut self, f: F) -> Self
    where
        F: FnOnce(&mut Workflow) -> Result<(), WorkflowError>,
    {
        if let Ok(workflow) = &mut self.workflow {
            if let Err(error) = f(workflow) {
                self.workflow = Err(error);
            }
        }
        self
    }

    /// Sets the state schema.
    pub fn schema(self, schema: impl Schema + 'static) -> Self {
        self.apply(|w| {
            w.set_schema(schema);
            Ok(())
        })
    }

    /// Sets the configuration.
    pub fn config(self, config: WorkflowConfig) -> Self {
        self.apply(|w| {
            w.set_config(config);
            Ok(())
        })
    }

    /// Sets the step-execution cap.
    pub fn max_steps(self, max_steps: usize) -> Self {
        self.apply(|w| {
            w.config.max_steps = max_steps;
            Ok(())
        })
    }

    /// Adds a step with an explicit name.
    pub fn add_step(
        self,
        name: impl Into<StepName>,
        handler: impl StepHandler + 'static,
    ) -> Self {
        self.apply(|w| w.add_step(name, handler).map(|_| ()))
    }

    /// Adds a strict step.
    pub fn add_strict_step(
        self,
        name: impl Into<StepName>,
        schema: impl Schema + 'static,
        handler: impl StepHandler + 'static,
    ) -> Self {
        self.apply(|w| w.add_strict_step(name, schema, handler).map(|_| ()))
    }

    /// Sets the start step by name.
    pub fn start_with(mut self, step_name: impl Into<StepName>) -> Self {
        self.start_step = Some(step_name.into());
        self
    }

    /// Builds the workflow.
    pub fn build(self) -> Result<Workflow, WorkflowError> {
        let mut workflow = self.workflow?;
        workflow.config.validate()?;
        if let Some(start) = self.start_step {
            workflow.set_start(start)?;
        }
        if workflow.steps.is_empty() {
            return Err(WorkflowError::Configuration(
                "Workflow must have at least one step".to_string(),
            ));
        }
        Ok(workflow)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::RunStatus;
    use hataori_core::{FieldKind, ObjectSchema};

    async fn succeed(_state: WorkflowState, _ctx: RunContext) -> Result<StepOutput, BoxError> {
        Ok(StepOutput::done().set("success", true))
    }

    async fn fail(_state: WorkflowState, _ctx: RunContext) -> Result<StepOutput, BoxError> {
        Err("Intentional failure".into())
    }

    #[tokio::test]
    async fn test_workflow_success() {
        let workflow = Workflow::builder("simple")
            .add_step("success", succeed)
            .build()
            .expect("valid workflow");

        let run = workflow.run(WorkflowState::new()).await.expect("run starts");
        assert_eq!(run.status(), RunStatus::Succeeded);
        assert_eq!(run.state().get::<bool>("success"), Some(true));
        assert!(!workflow.is_running());
    }

    #[tokio::test]
    async fn test_workflow_failure() {
        let workflow = Workflow::builder("failing")
            .add_step("failure", fail)
            .build()
            .expect("valid workflow");

        let run = workflow.run(WorkflowState::new()).await.expect("run starts");
        assert_eq!(run.status(), RunStatus::Failed);
        assert_eq!(
            run.error().map(ToString::to_string).as_deref(),
            Some("Step failed: failure, details: Intentional failure")
        );
        assert!(!workflow.is_running());
    }

    #[tokio::test]
    async fn test_workflow_builder_validation() {
        let result = Workflow::builder("empty").build();
        assert!(matches!(result, Err(WorkflowError::Configuration(_))));

        let result = Workflow::builder("flow")
            .add_step("step", succeed)
            .start_with("missing")
            .build();
        assert!(matches!(result, Err(WorkflowError::UnknownStep(_))));

        let result = Workflow::builder("flow").add_step("END", succeed).build();
        assert!(matches!(result, Err(WorkflowError::Configuration(_))));

        let result = Workflow::builder("flow")
            .add_step("bad-name", succeed)
            .build();
        assert!(matches!(result, Err(WorkflowError::InvalidStepName(_))));

        let result = Workflow::builder("flow")
            .add_step("step", succeed)
            .add_step("step", succeed)
            .build();
        assert!(matches!(result, Err(WorkflowError::Configuration(_))));
    }

    #[tokio::test]
    async fn test_zero_max_steps_never_starts() {
        let result = Workflow::builder("capped")
            .add_step("step", succeed)
            .max_steps(0)
            .build();
        assert!(matches!(result, Err(WorkflowError::Configuration(_))));

        let mut workflow = Workflow::builder("capped")
            .add_step("step", succeed)
            .build()
            .expect("valid workflow");
        workflow.set_config(WorkflowConfig::new().max_steps(0));
        let result = workflow.run(WorkflowState::new()).await;
        assert!(matches!(result, Err(WorkflowError::Configuration(_))));
        assert!(!workflow.is_running());
    }

    #[tokio::test]
    async fn test_declaration_order_without_directive() {
        let workflow = Workflow::builder("ordered")
            .add_step(
                "first",
                step_fn(|_, _| async { Ok(StepOutput::proceed().set("first", 1)) }),
            )
            .add_step(
                "second",
                step_fn(|_, _| async { Ok(StepOutput::proceed().set("second", 2)) }),
            )
            .build()
            .expect("valid workflow");

        let run = workflow.run(WorkflowState::new()).await.expect("run starts");
        assert!(run.is_success());
        assert_eq!(run.step_names(), vec!["first", "second"]);
        assert_eq!(run.steps_executed(), 2);
    }

    #[tokio::test]
    async fn test_unknown_directive_fails_run() {
        let workflow = Workflow::builder("lost")
            .add_step("only", step_fn(|_, _| async { Ok(StepOutput::next("nowhere")) }))
            .build()
            .expect("valid workflow");

        let run = workflow.run(WorkflowState::new()).await.expect("run starts");
        assert_eq!(run.status(), RunStatus::Failed);
        assert!(matches!(run.error(), Some(WorkflowError::UnknownStep(name)) if name.as_str() == "nowhere"));
    }

    #[tokio::test]
    async fn test_invalid_initial_state() {
        let workflow = Workflow::builder("typed")
            .schema(ObjectSchema::new().field("query", FieldKind::String))
            .add_step("answer", succeed)
            .build()
            .expect("valid workflow");

        let run = workflow.run(WorkflowState::new()).await.expect("run starts");
        assert_eq!(run.status(), RunStatus::Failed);
        assert!(run.history().is_empty());
        assert!(matches!(
            run.error(),
            Some(WorkflowError::Validation { step_name: None, .. })
        ));
    }

    #[tokio::test]
    async fn test_invalid_update_keeps_last_valid_state() {
        let workflow = Workflow::builder("typed")
            .schema(ObjectSchema::new().with_default("count", FieldKind::Integer, 0))
            .add_step(
                "corrupt",
                step_fn(|_, _| async { Ok(StepOutput::done().set("count", "many")) }),
            )
            .build()
            .expect("valid workflow");

        let run = workflow.run(WorkflowState::new()).await.expect("run starts");
        assert_eq!(run.status(), RunStatus::Failed);
        assert_eq!(run.state().get::<i64>("count"), Some(0));
    }

    #[tokio::test]
    async fn test_mutation_api() {
        let mut workflow = Workflow::new("mutable").expect("valid name");
        workflow
            .add_step("a", succeed)
            .and_then(|w| w.add_step("b", succeed))
            .expect("steps added");
        assert_eq!(workflow.start_step().map(StepName::as_str), Some("a"));

        workflow.set_start("b").expect("known step");
        assert_eq!(workflow.start_step().map(StepName::as_str), Some("b"));
        assert!(matches!(
            workflow.set_start("c"),
            Err(WorkflowError::UnknownStep(_))
        ));

        workflow.del_step("a").expect("known step");
        assert_eq!(workflow.step_count(), 1);
        assert!(matches!(
            workflow.del_step("a"),
            Err(WorkflowError::UnknownStep(_))
        ));
    }
}
