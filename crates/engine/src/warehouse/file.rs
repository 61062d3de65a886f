use std::path::{Path, PathBuf};

use async_trait::async_trait;
use quarry_types::{Row, TableRef, TableSchema, WriteDisposition};
use tracing::{debug, warn};

use super::{
    AccessEntry, QueryRequest, QueryResult, Warehouse, WarehouseResult,
    memory::{MemoryWarehouse, WarehouseState},
};
use crate::credentials::Credential;

/// [`MemoryWarehouse`] persisted to a JSON snapshot after every change.
///
/// A change whose snapshot cannot be written is rolled back in memory, so
/// the process never runs ahead of the file.
///
/// Lets workflows run locally without a cloud backend. Queries are answered
/// only from the `queries` section of the snapshot.
pub struct FileWarehouse {
    path: PathBuf,
    memory: MemoryWarehouse,
}

impl FileWarehouse {
    /// Open `path`, starting empty when the file does not exist yet.
    pub async fn open(path: impl AsRef<Path>) -> WarehouseResult<Self> {
        let path = path.as_ref().to_path_buf();
        let state = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice::<WarehouseState>(&bytes)?,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => WarehouseState::default(),
            Err(error) => return Err(error.into()),
        };
        debug!(path = %path.display(), datasets = state.datasets.len(), "opened warehouse snapshot");
        Ok(Self {
            path,
            memory: MemoryWarehouse::from_state(state),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn memory(&self) -> &MemoryWarehouse {
        &self.memory
    }

    /// Persist the current state, or restore `before` when that fails.
    async fn persist_or_restore(&self, before: WarehouseState) -> WarehouseResult<()> {
        if let Err(error) = self.persist().await {
            warn!(path = %self.path.display(), error = %error, "snapshot not written; change rolled back");
            self.memory.restore(before).await;
            return Err(error);
        }
        Ok(())
    }

    async fn persist(&self) -> WarehouseResult<()> {
        let state = self.memory.snapshot().await;
        let bytes = serde_json::to_vec_pretty(&state)?;
        if let Some(parent) = self.path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let staging = self.path.with_extension("tmp");
        tokio::fs::write(&staging, bytes).await?;
        tokio::fs::rename(&staging, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl Warehouse for FileWarehouse {
    async fn run_query(&self, credential: &Credential, query: &QueryRequest) -> WarehouseResult<QueryResult> {
        self.memory.run_query(credential, query).await
    }

    async fn read_table(&self, credential: &Credential, table: &TableRef) -> WarehouseResult<QueryResult> {
        self.memory.read_table(credential, table).await
    }

    async fn create_dataset(&self, credential: &Credential, dataset: &str) -> WarehouseResult<()> {
        let before = self.memory.snapshot().await;
        self.memory.create_dataset(credential, dataset).await?;
        self.persist_or_restore(before).await
    }

    async fn delete_dataset(&self, credential: &Credential, dataset: &str) -> WarehouseResult<()> {
        let before = self.memory.snapshot().await;
        self.memory.delete_dataset(credential, dataset).await?;
        self.persist_or_restore(before).await
    }

    async fn grant_access(&self, credential: &Credential, dataset: &str, entries: &[AccessEntry]) -> WarehouseResult<()> {
        let before = self.memory.snapshot().await;
        self.memory.grant_access(credential, dataset, entries).await?;
        self.persist_or_restore(before).await
    }

    async fn write_table(
        &self,
        credential: &Credential,
        table: &TableRef,
        schema: &TableSchema,
        rows: &[Row],
        disposition: &WriteDisposition,
    ) -> WarehouseResult<usize> {
        let before = self.memory.snapshot().await;
        let written = self.memory.write_table(credential, table, schema, rows, disposition).await?;
        self.persist_or_restore(before).await?;
        Ok(written)
    }

    async fn commit_staged(
        &self,
        credential: &Credential,
        staging: &TableRef,
        target: &TableRef,
        schema: &TableSchema,
        disposition: &WriteDisposition,
    ) -> WarehouseResult<usize> {
        let before = self.memory.snapshot().await;
        let applied = self.memory.commit_staged(credential, staging, target, schema, disposition).await?;
        self.persist_or_restore(before).await?;
        Ok(applied)
    }

    async fn drop_table(&self, credential: &Credential, table: &TableRef) -> WarehouseResult<()> {
        let before = self.memory.snapshot().await;
        self.memory.drop_table(credential, table).await?;
        self.persist_or_restore(before).await
    }

    async fn create_view(&self, credential: &Credential, view: &TableRef, query: &QueryRequest, replace: bool) -> WarehouseResult<()> {
        let before = self.memory.snapshot().await;
        self.memory.create_view(credential, view, query, replace).await?;
        self.persist_or_restore(before).await
    }
}
