//! Run outcomes and step history.

use chrono::{DateTime, Utc};
use hataori_core::{Directive, Snapshot, SnapshotError, StepName, WorkflowError, WorkflowState};
use serde::{Deserialize, Serialize};

/// Lifecycle of a workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RunStatus {
    /// Created, loop not entered.
    Pending,
    /// Executing steps.
    Running,
    /// Reached `END`.
    Succeeded,
    /// Stopped on an error.
    Failed,
    /// Stopped because the run's signal was aborted.
    Aborted,
}

impl RunStatus {
    /// Returns `true` for the three terminal states.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunStatus::Succeeded | RunStatus::Failed | RunStatus::Aborted
        )
    }
}

/// How a single step execution ended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StepOutcome {
    /// The handler returned; `next` is the directive it gave, if any.
    Completed {
        /// Directive returned by the handler.
        next: Option<Directive>,
    },
    /// The step failed before completing.
    Failed {
        /// Error message.
        error: String,
    },
    /// The run was aborted while the step was executing.
    Aborted,
}

/// One entry in a run's history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    /// Step that ran.
    pub name: StepName,
    /// State after the step, or the state it was rejected with.
    pub state: WorkflowState,
    /// How the step ended.
    pub outcome: StepOutcome,
}

/// The result of one workflow run.
///
/// Only the engine loop writes to it; callers read the outcome through the
/// getters or [`into_result`](Self::into_result).
#[derive(Debug)]
pub struct WorkflowRun {
    run_id: String,
    workflow: String,
    status: RunStatus,
    state: WorkflowState,
    history: Vec<StepRecord>,
    steps_executed: usize,
    error: Option<WorkflowError>,
    started_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
}

impl WorkflowRun {
    pub(crate) fn new(run_id: impl Into<String>, workflow: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            workflow: workflow.into(),
            status: RunStatus::Pending,
            state: WorkflowState::new(),
            history: Vec::new(),
            steps_executed: 0,
            error: None,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    /// Id of the run context the workflow executed in.
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Name of the workflow.
    pub fn workflow(&self) -> &str {
        &self.workflow
    }

    /// Current status.
    pub fn status(&self) -> RunStatus {
        self.status
    }

    /// Last valid state.
    pub fn state(&self) -> &WorkflowState {
        &self.state
    }

    /// Executed steps in order.
    pub fn history(&self) -> &[StepRecord] {
        &self.history
    }

    /// Names of the executed steps in order.
    pub fn step_names(&self) -> Vec<&str> {
        self.history.iter().map(|r| r.name.as_str()).collect()
    }

    /// Number of handler invocations.
    pub fn steps_executed(&self) -> usize {
        self.steps_executed
    }

    /// Error that ended the run, if any.
    pub fn error(&self) -> Option<&WorkflowError> {
        self.error.as_ref()
    }

    /// When the run started.
    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// When the run settled.
    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.finished_at
    }

    /// Returns `true` if the run reached `END`.
    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Succeeded
    }

    /// Converts the outcome into the final state or the error that ended it.
    pub fn into_result(self) -> Result<WorkflowState, WorkflowError> {
        match self.error {
            Some(error) => Err(error),
            None => Ok(self.state),
        }
    }

    pub(crate) fn bind(&mut self, run_id: &str) {
        self.run_id = run_id.to_string();
    }

    pub(crate) fn start(&mut self, state: WorkflowState) {
        self.state = state;
        self.status = RunStatus::Running;
    }

    pub(crate) fn set_state(&mut self, state: WorkflowState) {
        self.state = state;
    }

    pub(crate) fn count_step(&mut self) {
        self.steps_executed += 1;
    }

    pub(crate) fn record(&mut self, name: StepName, state: WorkflowState, outcome: StepOutcome) {
        self.history.push(StepRecord {
            name,
            state,
            outcome,
        });
    }

    /// Name of the step executed before the most recent one.
    pub(crate) fn previous_step(&self) -> Option<&StepName> {
        self.history
            .len()
            .checked_sub(2)
            .and_then(|index| self.history.get(index))
            .map(|record| &record.name)
    }

    pub(crate) fn succeed(&mut self) {
        self.settle(RunStatus::Succeeded, None);
    }

    pub(crate) fn fail(&mut self, error: WorkflowError) {
        let status = if error.is_aborted() {
            RunStatus::Aborted
        } else {
            RunStatus::Failed
        };
        self.settle(status, Some(error));
    }

    fn settle(&mut self, status: RunStatus, error: Option<WorkflowError>) {
        self.status = status;
        self.error = error;
        self.finished_at = Some(Utc::now());
    }
}

/// Serializable form of a [`WorkflowRun`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowRunSnapshot {
    /// Run id.
    pub run_id: String,
    /// Workflow name.
    pub workflow: String,
    /// Status when captured.
    pub status: RunStatus,
    /// Last valid state.
    pub state: WorkflowState,
    /// Executed steps.
    pub history: Vec<StepRecord>,
    /// Handler invocations.
    pub steps_executed: usize,
    /// Error message, if the run failed.
    pub error: Option<String>,
    /// Start time.
    pub started_at: DateTime<Utc>,
    /// Settlement time.
    pub finished_at: Option<DateTime<Utc>>,
}

impl Snapshot for WorkflowRun {
    type Data = WorkflowRunSnapshot;

    fn create_snapshot(&self) -> WorkflowRunSnapshot {
        WorkflowRunSnapshot {
            run_id: self.run_id.clone(),
            workflow: self.workflow.clone(),
            status: self.status,
            state: self.state.clone(),
            history: self.history.clone(),
            steps_executed: self.steps_executed,
            error: self.error.as_ref().map(ToString::to_string),
            started_at: self.started_at,
            finished_at: self.finished_at,
        }
    }

    /// Restores a run; a failure comes back as [`WorkflowError::Restored`]
    /// carrying the original message, an abort as [`WorkflowError::Aborted`].
    fn load_snapshot(data: WorkflowRunSnapshot) -> Result<Self, SnapshotError> {
        let error = match (data.status, data.error) {
            (RunStatus::Aborted, _) => Some(WorkflowError::Aborted {
                run_id: data.run_id.clone(),
            }),
            (RunStatus::Failed, Some(message)) => Some(WorkflowError::Restored(message)),
            (RunStatus::Failed, None) => {
                return Err(SnapshotError::Invalid(
                    "failed run without an error".to_string(),
                ))
            }
            (_, _) => None,
        };
        Ok(Self {
            run_id: data.run_id,
            workflow: data.workflow,
            status: data.status,
            state: data.state,
            history: data.history,
            steps_executed: data.steps_executed,
            error,
            started_at: data.started_at,
            finished_at: data.finished_at,
        })
    }
}
