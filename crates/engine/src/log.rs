//! Execution log: one entry per task that ran, appended to the log table
//! once the workflow stops.

use chrono::{DateTime, SecondsFormat, Utc};
use quarry_types::{FieldMode, FieldSchema, FieldType, LogSink, Row, TableSchema, TaskKind, WriteDisposition};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::{
    credentials::Credential,
    warehouse::{Warehouse, WarehouseResult},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Success,
    Failure,
}

impl Outcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::Failure => "failure",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LogEntry {
    pub sequence: usize,
    pub kind: TaskKind,
    pub description: Option<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub outcome: Outcome,
    pub error: Option<String>,
    pub rows_written: usize,
    /// Values dropped, nulled or filled in to fit the table schema.
    pub warnings: usize,
    /// Bindings the task was resolved with.
    pub parameters: Row,
}

impl LogEntry {
    fn to_row(&self) -> Row {
        let mut row = Row::new();
        row.insert("sequence".into(), Value::from(self.sequence));
        row.insert("kind".into(), Value::from(self.kind.as_str()));
        row.insert("description".into(), self.description.clone().map_or(Value::Null, Value::String));
        row.insert("started_at".into(), Value::String(self.started_at.to_rfc3339_opts(SecondsFormat::Micros, true)));
        row.insert("ended_at".into(), Value::String(self.ended_at.to_rfc3339_opts(SecondsFormat::Micros, true)));
        row.insert("outcome".into(), Value::from(self.outcome.as_str()));
        row.insert("error".into(), self.error.clone().map_or(Value::Null, Value::String));
        row.insert("rows_written".into(), Value::from(self.rows_written));
        row.insert("warnings".into(), Value::from(self.warnings));
        row.insert(
            "parameters".into(),
            Value::String(Value::Object(self.parameters.clone()).to_string()),
        );
        row
    }
}

/// Entries buffered in task order.
#[derive(Debug, Clone, Default)]
pub struct ExecutionLog {
    entries: Vec<LogEntry>,
}

impl ExecutionLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, entry: LogEntry) {
        debug!(task = entry.sequence, outcome = entry.outcome.as_str(), "log entry recorded");
        self.entries.push(entry);
    }

    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Columns of the log table.
    pub fn schema() -> TableSchema {
        TableSchema::new(vec![
            FieldSchema::new("sequence", FieldType::Integer).with_mode(FieldMode::Required),
            FieldSchema::new("kind", FieldType::String).with_mode(FieldMode::Required),
            FieldSchema::new("description", FieldType::String),
            FieldSchema::new("started_at", FieldType::Timestamp).with_mode(FieldMode::Required),
            FieldSchema::new("ended_at", FieldType::Timestamp).with_mode(FieldMode::Required),
            FieldSchema::new("outcome", FieldType::String).with_mode(FieldMode::Required),
            FieldSchema::new("error", FieldType::String),
            FieldSchema::new("rows_written", FieldType::Integer),
            FieldSchema::new("warnings", FieldType::Integer),
            FieldSchema::new("parameters", FieldType::String),
        ])
    }

    pub fn to_rows(&self) -> Vec<Row> {
        self.entries.iter().map(LogEntry::to_row).collect()
    }

    /// Append every buffered entry to `sink`. An empty log writes nothing.
    pub async fn flush(&self, sink: &LogSink, warehouse: &dyn Warehouse, credential: &Credential) -> WarehouseResult<usize> {
        if self.entries.is_empty() {
            return Ok(0);
        }
        let table = sink.table_ref();
        let written = warehouse
            .write_table(credential, &table, &Self::schema(), &self.to_rows(), &WriteDisposition::Append)
            .await?;
        info!(table = %table, entries = written, "execution log flushed");
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Duration;
    use quarry_types::{AuthKind, TableRef};
    use serde_json::json;

    use super::*;
    use crate::warehouse::{MemoryWarehouse, WarehouseOperation};

    fn entry(sequence: usize, outcome: Outcome) -> LogEntry {
        let started_at = Utc::now();
        LogEntry {
            sequence,
            kind: TaskKind::Dataset,
            description: Some(format!("task {sequence}")),
            started_at,
            ended_at: started_at + Duration::milliseconds(5),
            outcome,
            error: (outcome == Outcome::Failure).then(|| "boom".to_string()),
            rows_written: 0,
            warnings: 0,
            parameters: json!({"advertisers": ["1", "2"]}).as_object().cloned().unwrap_or_default(),
        }
    }

    #[test]
    fn rows_follow_the_log_schema() {
        let mut log = ExecutionLog::new();
        log.record(entry(1, Outcome::Success));
        let rows = log.to_rows();
        let columns: Vec<_> = rows[0].keys().map(String::as_str).collect();
        let schema = ExecutionLog::schema();
        let expected: Vec<_> = schema.column_names().collect();
        assert_eq!(columns, expected);
        assert_eq!(rows[0]["outcome"], json!("success"));
        assert_eq!(rows[0]["parameters"], json!(r#"{"advertisers":["1","2"]}"#));
    }

    #[tokio::test]
    async fn flush_appends_entries() {
        let sink = LogSink {
            dataset: "Ops".into(),
            table: "Log".into(),
            auth: None,
        };
        let existing = vec![json!({"sequence": 0}).as_object().cloned().unwrap_or_default()];
        let warehouse = Arc::new(MemoryWarehouse::new().with_table(&TableRef::new("Ops", "Log"), ExecutionLog::schema(), existing));
        let mut log = ExecutionLog::new();
        log.record(entry(1, Outcome::Success));
        log.record(entry(2, Outcome::Failure));

        let written = log
            .flush(&sink, warehouse.as_ref(), &Credential::new(AuthKind::Service, "t"))
            .await
            .expect("flushed");

        assert_eq!(written, 2);
        let rows = warehouse.rows(&TableRef::new("Ops", "Log")).await;
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[2]["error"], json!("boom"));
    }

    #[tokio::test]
    async fn empty_log_does_not_touch_the_warehouse() {
        let warehouse = MemoryWarehouse::new();
        let sink = LogSink {
            dataset: "Ops".into(),
            table: "Log".into(),
            auth: None,
        };
        ExecutionLog::new()
            .flush(&sink, &warehouse, &Credential::new(AuthKind::Service, "t"))
            .await
            .expect("noop");
        assert!(!warehouse.calls().await.contains(&WarehouseOperation::WriteTable));
    }
}
