//! Step names, transition directives and step output.

use crate::error::WorkflowError;
use crate::event::is_valid_identifier;
use crate::state::StateUpdate;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Names a step handler may not use; they are taken by directives.
pub const RESERVED_STEP_NAMES: [&str; 4] = ["SELF", "PREV", "END", "START"];

/// Type-safe step name wrapper.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StepName(String);

impl StepName {
    /// Creates a new StepName.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Returns the step name as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns `true` if the name is one of [`RESERVED_STEP_NAMES`].
    pub fn is_reserved(&self) -> bool {
        RESERVED_STEP_NAMES.contains(&self.0.as_str())
    }

    /// Checks that the name can be registered as a user step.
    pub fn validate(&self) -> Result<(), WorkflowError> {
        if self.is_reserved() {
            return Err(WorkflowError::Configuration(format!(
                "'{}' is a reserved step name",
                self.0
            )));
        }
        if !is_valid_identifier(&self.0) {
            return Err(WorkflowError::InvalidStepName(self.0.clone()));
        }
        Ok(())
    }
}

impl fmt::Display for StepName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for StepName {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for StepName {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl AsRef<str> for StepName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl std::borrow::Borrow<str> for StepName {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Where a workflow goes after a step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Directive {
    /// Continue with the named step.
    Step(StepName),
    /// Run the same step again (`SELF`).
    Repeat,
    /// Run the step executed immediately before the current one (`PREV`).
    Prev,
    /// Finish the run successfully (`END`).
    End,
}

impl Directive {
    /// Parses a directive, mapping `SELF`, `PREV` and `END` to their variants.
    pub fn parse(value: &str) -> Self {
        match value {
            "SELF" => Directive::Repeat,
            "PREV" => Directive::Prev,
            "END" => Directive::End,
            name => Directive::Step(StepName::new(name)),
        }
    }
}

impl fmt::Display for Directive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Directive::Step(name) => write!(f, "{name}"),
            Directive::Repeat => write!(f, "SELF"),
            Directive::Prev => write!(f, "PREV"),
            Directive::End => write!(f, "END"),
        }
    }
}

impl From<&str> for Directive {
    fn from(s: &str) -> Self {
        Self::parse(s)
    }
}

impl From<String> for Directive {
    fn from(s: String) -> Self {
        Self::parse(&s)
    }
}

impl From<StepName> for Directive {
    fn from(name: StepName) -> Self {
        Self::parse(name.as_str())
    }
}

/// Output from a step handler.
///
/// `update` is shallow-merged into the workflow state; `next` selects the
/// following step. Without a directive the engine moves to the next step in
/// declaration order.
///
/// # Examples
///
/// ```
/// use hataori_core::{Directive, StepOutput};
///
/// let output = StepOutput::next("review").set("attempts", 2);
/// assert_eq!(output.next, Some(Directive::parse("review")));
/// assert_eq!(output.update.map(|u| u["attempts"].clone()), Some(2.into()));
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepOutput {
    /// Top-level fields overriding the current state.
    pub update: Option<StateUpdate>,
    /// Transition directive.
    pub next: Option<Directive>,
}

impl StepOutput {
    /// Creates an output with no update that follows declaration order.
    pub fn proceed() -> Self {
        Self::default()
    }

    /// Continues with the given step or directive.
    pub fn next(directive: impl Into<Directive>) -> Self {
        Self {
            update: None,
            next: Some(directive.into()),
        }
    }

    /// Finishes the run.
    pub fn done() -> Self {
        Self::next(Directive::End)
    }

    /// Runs the current step again.
    pub fn repeat() -> Self {
        Self::next(Directive::Repeat)
    }

    /// Runs the previously executed step again.
    pub fn prev() -> Self {
        Self::next(Directive::Prev)
    }

    /// Replaces the state update.
    pub fn with_update(mut self, update: StateUpdate) -> Self {
        self.update = Some(update);
        self
    }

    /// Adds one top-level field to the state update.
    pub fn set(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.update
            .get_or_insert_with(StateUpdate::new)
            .insert(key.into(), value.into());
        self
    }
}
