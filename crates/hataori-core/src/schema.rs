//! Schema validation seam for workflow state.
//!
//! The engine never validates state itself; it calls a [`Schema`] at run
//! start, after every merged update and before strict steps. [`ObjectSchema`]
//! is a small field-level validator for workflows that do not bring their
//! own.

use crate::error::SchemaError;
use crate::state::{kind_of, WorkflowState};
use serde_json::Value;
use std::fmt;

/// Parses a state value, applying defaults and rejecting mismatches.
pub trait Schema: Send + Sync {
    /// Returns the validated state, with defaults filled in.
    fn parse(&self, state: WorkflowState) -> Result<WorkflowState, SchemaError>;
}

impl<F> Schema for F
where
    F: Fn(WorkflowState) -> Result<WorkflowState, SchemaError> + Send + Sync,
{
    fn parse(&self, state: WorkflowState) -> Result<WorkflowState, SchemaError> {
        self(state)
    }
}

/// Accepts every state unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct AnySchema;

impl Schema for AnySchema {
    fn parse(&self, state: WorkflowState) -> Result<WorkflowState, SchemaError> {
        Ok(state)
    }
}

/// The JSON kind a field must hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    /// Any value.
    Any,
    /// A string.
    String,
    /// Any number.
    Number,
    /// A whole number.
    Integer,
    /// A boolean.
    Bool,
    /// An array.
    Array,
    /// An object.
    Object,
}

impl FieldKind {
    fn accepts(self, value: &Value) -> bool {
        match self {
            FieldKind::Any => true,
            FieldKind::String => value.is_string(),
            FieldKind::Number => value.is_number(),
            FieldKind::Integer => value.is_i64() || value.is_u64(),
            FieldKind::Bool => value.is_boolean(),
            FieldKind::Array => value.is_array(),
            FieldKind::Object => value.is_object(),
        }
    }
}

impl fmt::Display for FieldKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FieldKind::Any => "any",
            FieldKind::String => "string",
            FieldKind::Number => "number",
            FieldKind::Integer => "integer",
            FieldKind::Bool => "bool",
            FieldKind::Array => "array",
            FieldKind::Object => "object",
        };
        write!(f, "{name}")
    }
}

#[derive(Debug, Clone)]
struct FieldSpec {
    name: String,
    kind: FieldKind,
    required: bool,
    default: Option<Value>,
}

/// Field-level object validator.
///
/// # Examples
///
/// ```
/// use hataori_core::{FieldKind, ObjectSchema, Schema, WorkflowState};
///
/// let schema = ObjectSchema::new()
///     .with_default("hops", FieldKind::Integer, 0)
///     .optional("note", FieldKind::String);
///
/// let state = schema.parse(WorkflowState::new())?;
/// assert_eq!(state.get::<u32>("hops"), Some(0));
/// # Ok::<(), hataori_core::SchemaError>(())
/// ```
#[derive(Debug, Clone, Default)]
pub struct ObjectSchema {
    fields: Vec<FieldSpec>,
    strict: bool,
}

impl ObjectSchema {
    /// Creates a schema with no fields that allows unknown keys.
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares a required field.
    pub fn field(self, name: impl Into<String>, kind: FieldKind) -> Self {
        self.push(name, kind, true, None)
    }

    /// Declares an optional field.
    pub fn optional(self, name: impl Into<String>, kind: FieldKind) -> Self {
        self.push(name, kind, false, None)
    }

    /// Declares a field filled with `default` when absent.
    pub fn with_default(
        self,
        name: impl Into<String>,
        kind: FieldKind,
        default: impl Into<Value>,
    ) -> Self {
        self.push(name, kind, true, Some(default.into()))
    }

    /// Rejects keys the schema does not declare.
    pub fn strict(mut self) -> Self {
        self.strict = true;
        self
    }

    fn push(
        mut self,
        name: impl Into<String>,
        kind: FieldKind,
        required: bool,
        default: Option<Value>,
    ) -> Self {
        let name = name.into();
        self.fields.retain(|f| f.name != name);
        self.fields.push(FieldSpec {
            name,
            kind,
            required,
            default,
        });
        self
    }
}

impl Schema for ObjectSchema {
    fn parse(&self, mut state: WorkflowState) -> Result<WorkflowState, SchemaError> {
        for field in &self.fields {
            match state.get_value(&field.name) {
                Some(value) if field.kind.accepts(value) => {}
                Some(Value::Null) if !field.required => {}
                Some(value) => {
                    return Err(SchemaError::TypeMismatch {
                        field: field.name.clone(),
                        expected: field.kind.to_string(),
                        found: kind_of(value).to_string(),
                    });
                }
                None => match &field.default {
                    Some(default) => state.insert(field.name.clone(), default.clone()),
                    None if field.required => {
                        return Err(SchemaError::MissingField(field.name.clone()));
                    }
                    None => {}
                },
            }
        }

        if self.strict {
            if let Some(unknown) = state
                .keys()
                .find(|key| !self.fields.iter().any(|f| &f.name == *key))
            {
                return Err(SchemaError::UnknownField(unknown.clone()));
            }
        }

        Ok(state)
    }
}
