//! Core types for the hataori run substrate.
//!
//! This crate holds the data model shared by the event bus, run contexts and
//! workflow engine, without any async runtime dependency. Validator and
//! serializer collaborators depend on this crate only.
//!
//! # Core Types
//!
//! - [`EventMeta`] / [`TraceInfo`] - Metadata attached to every emitted event
//! - [`Matcher`] - Listener selection (exact name, `*`, `*.*`, pattern, predicate)
//! - [`StepName`] / [`Directive`] / [`StepOutput`] - Step identity and transitions
//! - [`WorkflowState`] - JSON state owned by a running workflow
//! - [`Schema`] - Validation seam, with [`ObjectSchema`] as a bundled validator
//! - [`SnapshotRegistry`] - Explicit tag-to-codec registry for persistence
//! - [`HandleTable`] - Generational slot map for owner-managed resources

mod error;
mod event;
mod handle;
mod schema;
mod snapshot;
mod state;
mod step;

pub use error::{BoxError, EmitterError, RunError, SchemaError, SnapshotError, WorkflowError};
pub use event::{
    build_path, is_valid_identifier, validate_identifier, EmitterId, EventMeta, EventPredicate,
    EventSource, Matcher, TraceInfo,
};
pub use handle::{Handle, HandleTable};
pub use schema::{AnySchema, FieldKind, ObjectSchema, Schema};
pub use snapshot::{Snapshot, SnapshotRegistry, TaggedSnapshot};
pub use state::{StateUpdate, WorkflowState};
pub use step::{Directive, StepName, StepOutput, RESERVED_STEP_NAMES};
