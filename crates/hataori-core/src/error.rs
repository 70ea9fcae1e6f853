//! Error types for the event bus, run contexts and workflow execution.

use crate::step::StepName;
use thiserror::Error;

/// Boxed error returned by step handlers and event listeners.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors raised by an event emitter.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum EmitterError {
    /// A namespace segment or event name is empty or contains characters
    /// outside `[A-Za-z0-9_]`.
    #[error("Invalid identifier '{0}': expected [A-Za-z0-9_]+")]
    InvalidName(String),

    /// Piping would forward events back into their origin.
    #[error("Cannot pipe '{from}' into '{to}': the pipe would create a cycle")]
    PipeCycle {
        /// Namespace path of the source emitter.
        from: String,
        /// Namespace path of the target emitter.
        to: String,
    },

    /// The emitter was destroyed and accepts no further listeners or events.
    #[error("Emitter '{0}' has been destroyed")]
    Destroyed(String),

    /// A blocking listener failed while handling an event.
    #[error("Listener for '{path}' failed: {source}")]
    Listener {
        /// Full path of the event being handled.
        path: String,
        /// The listener's error.
        source: BoxError,
    },
}

/// Errors raised when entering or settling a run.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum RunError {
    /// The owner already has an active run.
    #[error("'{owner}' is already running")]
    AlreadyRunning {
        /// Label of the owner.
        owner: String,
    },

    /// The run's signal was aborted.
    #[error("Run '{run_id}' was aborted")]
    Aborted {
        /// Id of the aborted run.
        run_id: String,
    },

    /// The run emitter could not be created.
    #[error(transparent)]
    Emitter(#[from] EmitterError),
}

/// Errors raised by a [`Schema`](crate::Schema) collaborator.
#[derive(Error, Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum SchemaError {
    /// The value is not a JSON object.
    #[error("Expected an object, found {0}")]
    NotAnObject(String),

    /// A required field is absent and has no default.
    #[error("Missing required field '{0}'")]
    MissingField(String),

    /// A field holds a value of the wrong kind.
    #[error("Field '{field}' expected {expected}, found {found}")]
    TypeMismatch {
        /// Field name.
        field: String,
        /// Expected kind.
        expected: String,
        /// Kind actually found.
        found: String,
    },

    /// A strict schema met a field it does not declare.
    #[error("Unknown field '{0}'")]
    UnknownField(String),

    /// Validator-specific failure.
    #[error("{0}")]
    Custom(String),
}

/// Errors raised while encoding or decoding snapshots.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum SnapshotError {
    /// No codec is registered for the tag.
    #[error("No snapshot codec registered for '{0}'")]
    UnknownTag(String),

    /// The value handed to a codec is not the type registered for the tag.
    #[error("Value does not match the type registered for '{0}'")]
    TypeMismatch(String),

    /// The snapshot could not be restored.
    #[error("Invalid snapshot: {0}")]
    Invalid(String),

    /// JSON conversion failed.
    #[error(transparent)]
    Serde(#[from] serde_json::Error),
}

/// Errors that can occur during workflow construction and execution.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum WorkflowError {
    /// The workflow state failed schema validation.
    #[error("Invalid workflow state{}: {source}", at_step(.step_name))]
    Validation {
        /// The step about to run (strict steps) or just run, if any.
        step_name: Option<StepName>,
        /// The validator's error.
        source: SchemaError,
    },

    /// A run was attempted while another one is active.
    #[error("Workflow '{workflow}' is already running")]
    AlreadyRunning {
        /// Name of the workflow.
        workflow: String,
    },

    /// The run was cancelled through its signal.
    #[error("Run '{run_id}' was aborted")]
    Aborted {
        /// Id of the aborted run.
        run_id: String,
    },

    /// A step handler returned an error.
    #[error("Step failed: {step_name}, details: {source}")]
    StepHandler {
        /// The name of the step that failed.
        step_name: StepName,
        /// The handler's error.
        source: BoxError,
    },

    /// The step-count guard tripped.
    #[error("Maximum number of steps exceeded ({limit})")]
    MaxStepsExceeded {
        /// Configured limit.
        limit: usize,
    },

    /// A directive or operation referenced a step that does not exist.
    #[error("Step not found: {0}")]
    UnknownStep(StepName),

    /// `PREV` was requested from the first step executed in the run.
    #[error("Step '{step_name}' requested PREV but no step ran before it")]
    NoPreviousStep {
        /// The step that returned `PREV`.
        step_name: StepName,
    },

    /// No start step is designated.
    #[error("No start step is designated")]
    MissingStartStep,

    /// The workflow configuration is invalid.
    #[error("Invalid workflow configuration: {0}")]
    Configuration(String),

    /// A step or workflow name is malformed or reserved.
    #[error("Invalid step name '{0}'")]
    InvalidStepName(String),

    /// A failure recovered from a snapshot; only its message survives.
    #[error("{0}")]
    Restored(String),

    /// The workflow emitter failed.
    #[error(transparent)]
    Emitter(#[from] EmitterError),
}

impl WorkflowError {
    /// Returns `true` if this error reports a cancelled run.
    pub fn is_aborted(&self) -> bool {
        matches!(self, WorkflowError::Aborted { .. })
    }
}

impl From<RunError> for WorkflowError {
    fn from(error: RunError) -> Self {
        match error {
            RunError::AlreadyRunning { owner } => WorkflowError::AlreadyRunning { workflow: owner },
            RunError::Aborted { run_id } => WorkflowError::Aborted { run_id },
            RunError::Emitter(err) => WorkflowError::Emitter(err),
        }
    }
}

fn at_step(step_name: &Option<StepName>) -> String {
    match step_name {
        Some(name) => format!(" at step '{name}'"),
        None => String::new(),
    }
}
