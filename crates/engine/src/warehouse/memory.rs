use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use quarry_types::{Row, TableRef, TableSchema, WriteDisposition};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;

use super::{AccessEntry, QueryRequest, QueryResult, Warehouse, WarehouseError, WarehouseResult};
use crate::credentials::Credential;

/// Collaborator operations, for call accounting and failure injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WarehouseOperation {
    RunQuery,
    ReadTable,
    CreateDataset,
    DeleteDataset,
    GrantAccess,
    WriteTable,
    CommitStaged,
    DropTable,
    CreateView,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoredTable {
    pub schema: TableSchema,
    pub rows: Vec<Row>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DatasetState {
    #[serde(default)]
    pub tables: BTreeMap<String, StoredTable>,
    #[serde(default)]
    pub views: BTreeMap<String, String>,
    #[serde(default)]
    pub access: Vec<AccessEntry>,
}

/// Everything the memory warehouse holds. Serializable so it can be
/// snapshotted to disk.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WarehouseState {
    #[serde(default)]
    pub datasets: BTreeMap<String, DatasetState>,
    /// Canned results keyed by whitespace-normalized SQL.
    #[serde(default)]
    pub queries: BTreeMap<String, QueryResult>,
}

#[derive(Default)]
struct Inner {
    state: WarehouseState,
    calls: Vec<WarehouseOperation>,
    failures: HashMap<WarehouseOperation, String>,
}

impl Inner {
    fn enter(&mut self, operation: WarehouseOperation) -> WarehouseResult<()> {
        self.calls.push(operation);
        match self.failures.get(&operation) {
            Some(message) => Err(WarehouseError::Backend(message.clone())),
            None => Ok(()),
        }
    }

    fn table(&self, table: &TableRef) -> Option<&StoredTable> {
        self.state.datasets.get(&table.dataset)?.tables.get(&table.table)
    }
}

/// Warehouse kept entirely in memory.
///
/// It cannot evaluate SQL: queries are answered from results registered with
/// [`MemoryWarehouse::with_query`]. Writes implement the full disposition
/// contract and `commit_staged` is applied under a single lock.
#[derive(Default)]
pub struct MemoryWarehouse {
    inner: Mutex<Inner>,
}

impl MemoryWarehouse {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_state(state: WarehouseState) -> Self {
        Self {
            inner: Mutex::new(Inner {
                state,
                ..Inner::default()
            }),
        }
    }

    pub fn with_query(mut self, sql: &str, result: QueryResult) -> Self {
        self.inner.get_mut().state.queries.insert(normalize_sql(sql), result);
        self
    }

    pub fn with_table(mut self, table: &TableRef, schema: TableSchema, rows: Vec<Row>) -> Self {
        self.inner
            .get_mut()
            .state
            .datasets
            .entry(table.dataset.clone())
            .or_default()
            .tables
            .insert(table.table.clone(), StoredTable { schema, rows });
        self
    }

    /// Make every later `operation` fail with `message`.
    pub fn failing_on(mut self, operation: WarehouseOperation, message: impl Into<String>) -> Self {
        self.inner.get_mut().failures.insert(operation, message.into());
        self
    }

    pub async fn fail_on(&self, operation: WarehouseOperation, message: impl Into<String>) {
        self.inner.lock().await.failures.insert(operation, message.into());
    }

    pub async fn clear_failures(&self) {
        self.inner.lock().await.failures.clear();
    }

    pub async fn register_query(&self, sql: &str, result: QueryResult) {
        self.inner.lock().await.state.queries.insert(normalize_sql(sql), result);
    }

    pub async fn calls(&self) -> Vec<WarehouseOperation> {
        self.inner.lock().await.calls.clone()
    }

    pub async fn call_count(&self) -> usize {
        self.inner.lock().await.calls.len()
    }

    pub async fn table(&self, table: &TableRef) -> Option<StoredTable> {
        self.inner.lock().await.table(table).cloned()
    }

    pub async fn rows(&self, table: &TableRef) -> Vec<Row> {
        self.table(table).await.map(|stored| stored.rows).unwrap_or_default()
    }

    pub async fn has_dataset(&self, dataset: &str) -> bool {
        self.inner.lock().await.state.datasets.contains_key(dataset)
    }

    pub async fn dataset(&self, dataset: &str) -> Option<DatasetState> {
        self.inner.lock().await.state.datasets.get(dataset).cloned()
    }

    pub async fn snapshot(&self) -> WarehouseState {
        self.inner.lock().await.state.clone()
    }

    /// Put back a state taken with [`snapshot`](Self::snapshot). Recorded
    /// calls and scripted failures are kept.
    pub async fn restore(&self, state: WarehouseState) {
        self.inner.lock().await.state = state;
    }
}

fn normalize_sql(sql: &str) -> String {
    sql.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Apply `rows` to `existing` under `disposition`.
///
/// A merge replaces a matched row whole: columns the incoming row does not
/// carry are dropped from it and read back as null, instead of keeping the
/// stored value. Coerced rows always
/// carry every schema column, so this only shows for columns the target has
/// and the write schema lacks.
fn apply_rows(existing: Option<StoredTable>, schema: &TableSchema, rows: &[Row], disposition: &WriteDisposition) -> StoredTable {
    match disposition {
        WriteDisposition::Replace => StoredTable {
            schema: schema.clone(),
            rows: rows.to_vec(),
        },
        WriteDisposition::Append => {
            let mut table = existing.unwrap_or_else(|| empty_table(schema));
            table.schema.extend_missing(schema.fields());
            table.rows.extend(rows.iter().cloned());
            table
        }
        WriteDisposition::Merge { keys } => {
            let mut table = existing.unwrap_or_else(|| empty_table(schema));
            table.schema.extend_missing(schema.fields());
            for row in rows {
                let incoming = key_of(row, keys);
                match table.rows.iter().position(|current| key_of(current, keys) == incoming) {
                    Some(position) => table.rows[position] = row.clone(),
                    None => table.rows.push(row.clone()),
                }
            }
            table
        }
    }
}

fn empty_table(schema: &TableSchema) -> StoredTable {
    StoredTable {
        schema: schema.clone(),
        rows: Vec::new(),
    }
}

fn key_of(row: &Row, keys: &[String]) -> Vec<Value> {
    keys.iter().map(|key| row.get(key).cloned().unwrap_or(Value::Null)).collect()
}

#[async_trait]
impl Warehouse for MemoryWarehouse {
    async fn run_query(&self, _credential: &Credential, query: &QueryRequest) -> WarehouseResult<QueryResult> {
        let mut inner = self.inner.lock().await;
        inner.enter(WarehouseOperation::RunQuery)?;
        let key = normalize_sql(&query.sql);
        inner
            .state
            .queries
            .get(&key)
            .cloned()
            .ok_or(WarehouseError::UnsupportedQuery(key))
    }

    async fn read_table(&self, _credential: &Credential, table: &TableRef) -> WarehouseResult<QueryResult> {
        let mut inner = self.inner.lock().await;
        inner.enter(WarehouseOperation::ReadTable)?;
        let stored = inner.table(table).ok_or_else(|| WarehouseError::TableNotFound(table.clone()))?;
        Ok(QueryResult::new(stored.schema.clone(), stored.rows.clone()))
    }

    async fn create_dataset(&self, _credential: &Credential, dataset: &str) -> WarehouseResult<()> {
        let mut inner = self.inner.lock().await;
        inner.enter(WarehouseOperation::CreateDataset)?;
        inner.state.datasets.entry(dataset.to_string()).or_default();
        Ok(())
    }

    async fn delete_dataset(&self, _credential: &Credential, dataset: &str) -> WarehouseResult<()> {
        let mut inner = self.inner.lock().await;
        inner.enter(WarehouseOperation::DeleteDataset)?;
        inner.state.datasets.remove(dataset);
        Ok(())
    }

    async fn grant_access(&self, _credential: &Credential, dataset: &str, entries: &[AccessEntry]) -> WarehouseResult<()> {
        let mut inner = self.inner.lock().await;
        inner.enter(WarehouseOperation::GrantAccess)?;
        let state = inner
            .state
            .datasets
            .get_mut(dataset)
            .ok_or_else(|| WarehouseError::Backend(format!("dataset {dataset} not found")))?;
        for entry in entries {
            if !state.access.contains(entry) {
                state.access.push(entry.clone());
            }
        }
        Ok(())
    }

    async fn write_table(
        &self,
        _credential: &Credential,
        table: &TableRef,
        schema: &TableSchema,
        rows: &[Row],
        disposition: &WriteDisposition,
    ) -> WarehouseResult<usize> {
        let mut inner = self.inner.lock().await;
        inner.enter(WarehouseOperation::WriteTable)?;
        let dataset = inner.state.datasets.entry(table.dataset.clone()).or_default();
        let existing = dataset.tables.remove(&table.table);
        dataset
            .tables
            .insert(table.table.clone(), apply_rows(existing, schema, rows, disposition));
        Ok(rows.len())
    }

    async fn commit_staged(
        &self,
        _credential: &Credential,
        staging: &TableRef,
        target: &TableRef,
        schema: &TableSchema,
        disposition: &WriteDisposition,
    ) -> WarehouseResult<usize> {
        let mut inner = self.inner.lock().await;
        inner.enter(WarehouseOperation::CommitStaged)?;
        let staged = inner
            .table(staging)
            .cloned()
            .ok_or_else(|| WarehouseError::TableNotFound(staging.clone()))?;
        let dataset = inner.state.datasets.entry(target.dataset.clone()).or_default();
        let existing = dataset.tables.get(&target.table).cloned();
        dataset
            .tables
            .insert(target.table.clone(), apply_rows(existing, schema, &staged.rows, disposition));
        Ok(staged.rows.len())
    }

    async fn drop_table(&self, _credential: &Credential, table: &TableRef) -> WarehouseResult<()> {
        let mut inner = self.inner.lock().await;
        inner.enter(WarehouseOperation::DropTable)?;
        if let Some(dataset) = inner.state.datasets.get_mut(&table.dataset) {
            dataset.tables.remove(&table.table);
        }
        Ok(())
    }

    async fn create_view(&self, _credential: &Credential, view: &TableRef, query: &QueryRequest, replace: bool) -> WarehouseResult<()> {
        let mut inner = self.inner.lock().await;
        inner.enter(WarehouseOperation::CreateView)?;
        let dataset = inner.state.datasets.entry(view.dataset.clone()).or_default();
        if !replace && dataset.views.contains_key(&view.table) {
            return Err(WarehouseError::Backend(format!("view {view} already exists")));
        }
        dataset.views.insert(view.table.clone(), query.sql.clone());
        Ok(())
    }
}
