//! Columnar warehouse boundary.
//!
//! The engine only needs table level operations plus query execution. The
//! one atomicity guarantee it relies on is [`Warehouse::commit_staged`]:
//! the target either ends up with the committed result or is unchanged.

use async_trait::async_trait;
use quarry_types::{Row, TableRef, TableSchema, WriteDisposition};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::credentials::Credential;

pub mod file;
pub mod memory;

pub use file::FileWarehouse;
pub use memory::{MemoryWarehouse, WarehouseOperation};

#[derive(Debug, Error)]
pub enum WarehouseError {
    #[error("table {0} not found")]
    TableNotFound(TableRef),

    #[error("unsupported query: {0}")]
    UnsupportedQuery(String),

    #[error("{0}")]
    Backend(String),

    #[error("warehouse I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("warehouse snapshot error: {0}")]
    Snapshot(#[from] serde_json::Error),
}

pub type WarehouseResult<T> = Result<T, WarehouseError>;

/// SQL text plus the dialect flag and the dataset unqualified names resolve against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryRequest {
    pub sql: String,
    pub legacy: bool,
    pub default_dataset: Option<String>,
}

impl QueryRequest {
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            legacy: false,
            default_dataset: None,
        }
    }

    pub fn legacy(mut self, legacy: bool) -> Self {
        self.legacy = legacy;
        self
    }

    pub fn in_dataset(mut self, dataset: impl Into<String>) -> Self {
        self.default_dataset = Some(dataset.into());
        self
    }
}

/// Rows returned by a query or table read. `schema` may be empty when the
/// backend does not report one.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    #[serde(default)]
    pub schema: TableSchema,
    #[serde(default)]
    pub rows: Vec<Row>,
}

impl QueryResult {
    pub fn new(schema: TableSchema, rows: Vec<Row>) -> Self {
        Self { schema, rows }
    }
}

/// Read access granted on a dataset.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessEntry {
    User(String),
    Group(String),
}

#[async_trait]
pub trait Warehouse: Send + Sync {
    async fn run_query(&self, credential: &Credential, query: &QueryRequest) -> WarehouseResult<QueryResult>;

    async fn read_table(&self, credential: &Credential, table: &TableRef) -> WarehouseResult<QueryResult>;

    /// Create the dataset if it does not exist.
    async fn create_dataset(&self, credential: &Credential, dataset: &str) -> WarehouseResult<()>;

    /// Delete the dataset and everything in it. Missing datasets are not an error.
    async fn delete_dataset(&self, credential: &Credential, dataset: &str) -> WarehouseResult<()>;

    async fn grant_access(&self, credential: &Credential, dataset: &str, entries: &[AccessEntry]) -> WarehouseResult<()>;

    /// Write `rows` with `disposition`, creating the table from `schema` when needed.
    async fn write_table(
        &self,
        credential: &Credential,
        table: &TableRef,
        schema: &TableSchema,
        rows: &[Row],
        disposition: &WriteDisposition,
    ) -> WarehouseResult<usize>;

    /// Apply the contents of `staging` to `target` with `disposition` as one
    /// all-or-nothing operation. Returns the number of staged rows applied.
    async fn commit_staged(
        &self,
        credential: &Credential,
        staging: &TableRef,
        target: &TableRef,
        schema: &TableSchema,
        disposition: &WriteDisposition,
    ) -> WarehouseResult<usize>;

    /// Drop a table. Missing tables are not an error.
    async fn drop_table(&self, credential: &Credential, table: &TableRef) -> WarehouseResult<()>;

    async fn create_view(&self, credential: &Credential, view: &TableRef, query: &QueryRequest, replace: bool) -> WarehouseResult<()>;
}
