//! Descriptor model shared by the Quarry engine and command line.
//!
//! A workflow document is an ordered list of single-key task objects
//! (`{"<kind>": {options}}`) plus an optional log sink. The types here turn
//! that loosely shaped document into [`Workflow`] and [`TaskDescriptor`]
//! values, and provide the typed option structs each task kind accepts.

pub mod destination;
pub mod error;
pub mod options;
pub mod schema;
pub mod workflow;

pub use destination::{Destination, LogSink, TableRef, WriteDisposition};
pub use error::ConfigError;
pub use options::{
    ApiOptions, DatasetOptions, Kwargs, QueryOptions, QuerySource, QueryTarget, RemoteParameterSource, ReportOptions, ReportSpec,
    TaskOptions, ViewTarget,
};
pub use schema::{FieldMode, FieldSchema, FieldType, TableSchema};
pub use workflow::{AuthKind, TaskDescriptor, TaskKind, Workflow, WorkflowDocument};

/// A single result record: column name to JSON value, in column order.
pub type Row = serde_json::Map<String, serde_json::Value>;
