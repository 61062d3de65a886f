//! Engine error type.
//!
//! Configuration problems are reported before any collaborator is called;
//! everything else aborts the current task and the rest of the workflow.

use quarry_types::{ConfigError, TableRef};
use thiserror::Error;

use crate::warehouse::WarehouseError;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("remote parameter query failed: {0}")]
    RemoteQuery(#[source] WarehouseError),

    #[error("remote call {call} failed: {message}")]
    RemoteApi { call: String, message: String },

    #[error(transparent)]
    Warehouse(#[from] WarehouseError),

    #[error("schema mismatch writing {table}: {message}")]
    SchemaMismatch { table: TableRef, message: String },

    #[error("merge into {table} was not applied: {source}")]
    MergeConsistency {
        table: TableRef,
        #[source]
        source: WarehouseError,
    },

    #[error("credential unavailable: {0}")]
    Credential(String),
}

impl EngineError {
    pub fn remote_api(call: impl ToString, error: &anyhow::Error) -> Self {
        Self::RemoteApi {
            call: call.to_string(),
            message: format!("{error:#}"),
        }
    }

    pub fn schema_mismatch(table: &TableRef, message: impl Into<String>) -> Self {
        Self::SchemaMismatch {
            table: table.clone(),
            message: message.into(),
        }
    }

    pub fn is_config(&self) -> bool {
        matches!(self, Self::Config(_))
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
