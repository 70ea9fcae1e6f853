//! Event metadata, trace lineage and listener matchers.

use crate::error::EmitterError;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

/// Returns `true` if `value` is a non-empty `[A-Za-z0-9_]+` identifier.
pub fn is_valid_identifier(value: &str) -> bool {
    !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Fails with [`EmitterError::InvalidName`] unless `value` is an identifier.
pub fn validate_identifier(value: &str) -> Result<(), EmitterError> {
    if is_valid_identifier(value) {
        Ok(())
    } else {
        Err(EmitterError::InvalidName(value.to_string()))
    }
}

/// Joins namespace segments and an event name into a dotted path.
pub fn build_path(namespace: &[String], name: &str) -> String {
    if namespace.is_empty() {
        return name.to_string();
    }
    let mut path = namespace.join(".");
    path.push('.');
    path.push_str(name);
    path
}

/// Identity of an emitter instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EmitterId(Uuid);

impl EmitterId {
    /// Creates a fresh random id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for EmitterId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EmitterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Correlates events with the run, and parent run, that produced them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceInfo {
    /// Shared by every run in one lineage.
    pub id: String,
    /// The run that emitted the event.
    pub run_id: String,
    /// The run that spawned `run_id`, if nested.
    pub parent_run_id: Option<String>,
}

/// The emitter an event was emitted on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventSource {
    /// Emitter identity.
    pub id: EmitterId,
    /// Emitter namespace.
    pub namespace: Vec<String>,
}

/// Immutable metadata of one emitted event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventMeta {
    id: Uuid,
    group_id: Option<String>,
    name: String,
    path: String,
    created_at: DateTime<Utc>,
    source: EventSource,
    creator: Option<String>,
    context: Value,
    trace: Option<TraceInfo>,
}

impl EventMeta {
    /// Creates metadata for `name` emitted on `source`.
    ///
    /// Fails if the name or any namespace segment is not an identifier.
    pub fn new(name: impl Into<String>, source: EventSource) -> Result<Self, EmitterError> {
        let name = name.into();
        validate_identifier(&name)?;
        for segment in &source.namespace {
            validate_identifier(segment)?;
        }
        Ok(Self {
            id: Uuid::new_v4(),
            group_id: None,
            path: build_path(&source.namespace, &name),
            name,
            created_at: Utc::now(),
            source,
            creator: None,
            context: Value::Null,
            trace: None,
        })
    }

    /// Sets the group id.
    pub fn with_group_id(mut self, group_id: Option<String>) -> Self {
        self.group_id = group_id;
        self
    }

    /// Sets the creator label.
    pub fn with_creator(mut self, creator: Option<String>) -> Self {
        self.creator = creator;
        self
    }

    /// Sets the attached context.
    pub fn with_context(mut self, context: Value) -> Self {
        self.context = context;
        self
    }

    /// Sets the trace lineage.
    pub fn with_trace(mut self, trace: Option<TraceInfo>) -> Self {
        self.trace = trace;
        self
    }

    /// Unique event id.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Group id, set for events emitted inside a run.
    pub fn group_id(&self) -> Option<&str> {
        self.group_id.as_deref()
    }

    /// Event name without namespace.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Namespace and name joined with `.`.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Emission time.
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// The emitter the event was emitted on.
    pub fn source(&self) -> &EventSource {
        &self.source
    }

    /// Label of the object owning the source emitter.
    pub fn creator(&self) -> Option<&str> {
        self.creator.as_deref()
    }

    /// Context attached by the emitter chain.
    pub fn context(&self) -> &Value {
        &self.context
    }

    /// Trace lineage, set for events emitted inside a run.
    pub fn trace(&self) -> Option<&TraceInfo> {
        self.trace.as_ref()
    }
}

/// Predicate over event metadata.
pub type EventPredicate = Arc<dyn Fn(&EventMeta) -> bool + Send + Sync>;

/// Selects the events a listener receives.
#[derive(Clone)]
pub enum Matcher {
    /// Events whose name equals the given name.
    Exact(String),
    /// Every event emitted directly on the emitter (`*`).
    AllDirect,
    /// Every event on the emitter and its descendants (`*.*`).
    AllNested,
    /// Events whose full path matches the expression.
    Pattern(Regex),
    /// Events accepted by the predicate.
    Predicate(EventPredicate),
}

impl Matcher {
    /// Matches events named `name`.
    pub fn exact(name: impl Into<String>) -> Result<Self, EmitterError> {
        let name = name.into();
        validate_identifier(&name)?;
        Ok(Matcher::Exact(name))
    }

    /// Matches paths against a regular expression.
    pub fn pattern(expr: &str) -> Result<Self, regex::Error> {
        Regex::new(expr).map(Matcher::Pattern)
    }

    /// Matches events accepted by `predicate`.
    pub fn predicate<F>(predicate: F) -> Self
    where
        F: Fn(&EventMeta) -> bool + Send + Sync + 'static,
    {
        Matcher::Predicate(Arc::new(predicate))
    }

    /// Parses the string forms: `*`, `*.*`, a full dotted path, or a name.
    pub fn parse(value: &str) -> Result<Self, EmitterError> {
        match value {
            "*" => Ok(Matcher::AllDirect),
            "*.*" => Ok(Matcher::AllNested),
            path if path.contains('.') => {
                for segment in path.split('.') {
                    validate_identifier(segment)?;
                }
                Regex::new(&format!("^{}$", regex::escape(path)))
                    .map(Matcher::Pattern)
                    .map_err(|_| EmitterError::InvalidName(path.to_string()))
            }
            name => Self::exact(name),
        }
    }

    /// Whether listeners with this matcher see descendants' events unless
    /// told otherwise.
    pub fn default_match_nested(&self) -> bool {
        matches!(self, Matcher::AllNested | Matcher::Pattern(_))
    }

    /// Tests the matcher against event metadata, ignoring nesting.
    pub fn matches(&self, meta: &EventMeta) -> bool {
        match self {
            Matcher::Exact(name) => meta.name() == name,
            Matcher::AllDirect | Matcher::AllNested => true,
            Matcher::Pattern(regex) => regex.is_match(meta.path()),
            Matcher::Predicate(predicate) => predicate(meta),
        }
    }
}

impl fmt::Debug for Matcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Matcher::Exact(name) => f.debug_tuple("Exact").field(name).finish(),
            Matcher::AllDirect => write!(f, "AllDirect"),
            Matcher::AllNested => write!(f, "AllNested"),
            Matcher::Pattern(regex) => f.debug_tuple("Pattern").field(&regex.as_str()).finish(),
            Matcher::Predicate(_) => write!(f, "Predicate(..)"),
        }
    }
}
