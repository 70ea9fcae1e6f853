//! Workflow state: a JSON object owned by the running workflow.

use crate::error::SchemaError;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Top-level fields returned by a step, merged into the state.
pub type StateUpdate = Map<String, Value>;

/// Application-defined workflow state.
///
/// Stores any JSON value under a string key, retrieved by deserializing into
/// the requested type.
///
/// # Examples
///
/// ```
/// use hataori_core::WorkflowState;
///
/// let mut state = WorkflowState::new();
///
/// state.insert("user_id", 123u64);
/// state.insert("name", "Alice");
/// state.insert("active", true);
///
/// assert_eq!(state.get::<u64>("user_id"), Some(123));
/// assert_eq!(state.get::<String>("name"), Some("Alice".to_string()));
/// assert_eq!(state.get::<bool>("active"), Some(true));
///
/// // Wrong type returns None
/// assert_eq!(state.get::<String>("user_id"), None);
/// ```
#[derive(Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkflowState(Map<String, Value>);

impl fmt::Debug for WorkflowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.0.iter()).finish()
    }
}

impl WorkflowState {
    /// Creates a new empty state.
    pub fn new() -> Self {
        Self(Map::new())
    }

    /// Inserts a value with the given key.
    ///
    /// If the key already exists, the previous value is replaced.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(key.into(), value.into());
    }

    /// Returns the value for the given key converted to `T`.
    ///
    /// Returns `None` if the key doesn't exist or the value doesn't fit `T`.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.0
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    /// Returns the raw JSON value for the given key.
    pub fn get_value(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Removes a value by key and returns it.
    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.0.remove(key)
    }

    /// Returns `true` if the state contains a value for the given key.
    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    /// Returns an iterator over all keys in the state.
    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.0.keys()
    }

    /// Returns the number of top-level fields.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns `true` if the state has no fields.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Overrides top-level fields with the ones in `update`.
    ///
    /// Nested objects are replaced, never merged.
    pub fn merge(&mut self, update: StateUpdate) {
        for (key, value) in update {
            self.0.insert(key, value);
        }
    }

    /// Returns the underlying JSON object.
    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    /// Returns the state as a JSON value.
    pub fn to_value(&self) -> Value {
        Value::Object(self.0.clone())
    }

    /// Converts the state into a JSON value.
    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }
}

impl From<Map<String, Value>> for WorkflowState {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

impl TryFrom<Value> for WorkflowState {
    type Error = SchemaError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::Object(map) => Ok(Self(map)),
            Value::Null => Ok(Self::new()),
            other => Err(SchemaError::NotAnObject(kind_of(&other).to_string())),
        }
    }
}

/// Short JSON type name used in error messages.
pub(crate) fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(n) if n.is_i64() || n.is_u64() => "integer",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
