//! # Quarry Engine
//!
//! The Quarry engine loads declarative workflows, resolves their parameters
//! and runs each task in order against a warehouse and remote APIs.
//!
//! ## Key Features
//!
//! - **Workflow Loading**: JSON or YAML documents with `{log?, tasks}` at the top level
//! - **Parameter Resolution**: `{name}` placeholders bound from literal kwargs or warehouse queries
//! - **Pagination**: cursor driven iteration with record limits
//! - **Materialization**: append, replace and merge writes with schema inference and coercion
//! - **Execution Log**: one entry per task, appended to a log table when the run stops
//!
//! ## Usage
//!
//! ```rust
//! use quarry_engine::load_workflow_file;
//!
//! let temp_dir = tempfile::tempdir()?;
//! let workflow_path = temp_dir.path().join("workflow.yaml");
//! std::fs::write(&workflow_path, r#"
//! tasks:
//!   - dataset:
//!       dataset: Reports
//! "#)?;
//!
//! let workflow = load_workflow_file(&workflow_path)?;
//! assert_eq!(workflow.tasks.len(), 1);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! ## Architecture
//!
//! - **`resolve`** / **`templates`**: placeholder binding and rendering
//! - **`registry`** / **`handlers`**: one handler per task kind
//! - **`paginate`**: pages and row batches
//! - **`materialize`** / **`schema`**: writes, staging and coercion
//! - **`warehouse`** / **`remote`** / **`credentials`**: collaborator seams
//! - **`runner`** / **`log`**: the run state machine and its execution log

use std::path::Path;

use anyhow::{Context, Result};
use quarry_types::{Workflow, WorkflowDocument};

pub mod credentials;
pub mod error;
pub mod handlers;
pub mod log;
pub mod materialize;
pub mod paginate;
pub mod registry;
pub mod remote;
pub mod resolve;
pub mod runner;
pub mod schema;
pub mod templates;
pub mod warehouse;

pub use credentials::{Credential, CredentialProvider, StaticCredentials};
pub use error::{EngineError, EngineResult};
pub use log::{ExecutionLog, LogEntry, Outcome};
pub use materialize::{MaterializeReport, MaterializeTarget, materialize};
pub use paginate::{Cursor, Page, PageSource, Paginator, RowBatches, VecBatches};
pub use registry::{HandlerRegistry, Services, TaskContext, TaskHandler, TaskOutcome};
pub use remote::{ApiCall, ApiPageSource, RemoteApi, ScriptedApi};
pub use resolve::{ResolvedTask, check_placeholders, resolve_task};
pub use runner::{RunOptions, RunReport, RunState, WorkflowRunner};
pub use warehouse::{FileWarehouse, MemoryWarehouse, QueryRequest, QueryResult, Warehouse, WarehouseError};

/// Loads a workflow file, choosing the format from its extension.
///
/// `.json` files are parsed as JSON; anything else as YAML, which also
/// accepts plain JSON.
///
/// # Errors
///
/// Fails when the file cannot be read, is not valid JSON/YAML, or does not
/// describe a workflow (unknown kinds and malformed task entries included).
pub fn load_workflow_file(file_path: impl AsRef<Path>) -> Result<Workflow> {
    let file_path = file_path.as_ref();
    let content = std::fs::read_to_string(file_path).with_context(|| format!("Failed to read workflow file: {}", file_path.display()))?;

    let is_json = file_path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
    let document: WorkflowDocument = if is_json {
        serde_json::from_str(&content).with_context(|| format!("Invalid JSON workflow: {}", file_path.display()))?
    } else {
        serde_yaml::from_str(&content).with_context(|| format!("Invalid YAML workflow: {}", file_path.display()))?
    };

    Workflow::from_document(document).with_context(|| format!("Invalid workflow: {}", file_path.display()))
}
