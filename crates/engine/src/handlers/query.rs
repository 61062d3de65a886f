use async_trait::async_trait;
use quarry_types::{ConfigError, Destination, QueryOptions, QuerySource, QueryTarget, Row, TableRef, TaskKind, TaskOptions};
use serde_json::Value;
use tracing::info;

use crate::{
    error::EngineResult,
    materialize::{MaterializeTarget, materialize},
    paginate::VecBatches,
    registry::{TaskContext, TaskHandler, TaskOutcome, options_mismatch},
    warehouse::QueryRequest,
};

/// Warehouse statements: run a query, or copy a query or literal values into
/// a table, or define a view.
pub struct QueryHandler;

#[async_trait]
impl TaskHandler for QueryHandler {
    fn kind(&self) -> TaskKind {
        TaskKind::Query
    }

    fn validate(&self, options: &TaskOptions) -> Result<(), ConfigError> {
        let TaskOptions::Query(options) = options else {
            return Err(options_mismatch(self.kind(), options));
        };
        options.validate()?;
        if let (Some(QuerySource { values: Some(values), .. }), Some(QueryTarget::Table(destination))) = (&options.from, &options.to) {
            values_to_rows(values, destination)?;
        }
        Ok(())
    }

    async fn run(&self, options: &TaskOptions, context: &TaskContext) -> EngineResult<TaskOutcome> {
        let TaskOptions::Query(options) = options else {
            return Err(options_mismatch(self.kind(), options).into());
        };
        match options {
            QueryOptions { run: Some(source), .. } => {
                let request = request_for(source)?;
                context.warehouse().run_query(&context.credential, &request).await?;
                info!(task = context.sequence, "query executed");
                Ok(TaskOutcome::default())
            }
            QueryOptions {
                from: Some(source),
                to: Some(QueryTarget::View(view)),
                ..
            } => {
                let request = request_for(source)?;
                let credential = context.credential_for(view.auth).await?;
                let target = TableRef::new(view.dataset.clone(), view.view.clone());
                context.warehouse().create_view(&credential, &target, &request, view.replace).await?;
                info!(task = context.sequence, view = %target, "view created");
                Ok(TaskOutcome::default())
            }
            QueryOptions {
                from: Some(source),
                to: Some(QueryTarget::Table(destination)),
                ..
            } => copy_into_table(source, destination, context).await,
            _ => Err(ConfigError::Malformed("query task needs exactly one of run or from/to".into()).into()),
        }
    }
}

async fn copy_into_table(source: &QuerySource, destination: &Destination, context: &TaskContext) -> EngineResult<TaskOutcome> {
    let (rows, reported_schema) = match &source.values {
        Some(values) => (values_to_rows(values, destination)?, None),
        None => {
            let request = request_for(source)?;
            let result = context.warehouse().run_query(&context.credential, &request).await?;
            let reported = (!result.schema.is_empty()).then_some(result.schema);
            (result.rows, reported)
        }
    };

    let credential = context.credential_for(destination.auth).await?;
    let target = MaterializeTarget {
        warehouse: context.warehouse(),
        credential: &credential,
        table: destination.table_ref(),
        disposition: destination.write_disposition()?,
    };
    let schema = destination.schema.clone().or(reported_schema);
    let report = materialize(&mut VecBatches::new(rows), schema, &target).await?;
    info!(task = context.sequence, table = %target.table, rows = report.rows_written, "query results written");
    Ok(TaskOutcome {
        rows_written: report.rows_written,
        warnings: report.warnings,
    })
}

fn request_for(source: &QuerySource) -> Result<QueryRequest, ConfigError> {
    let sql = source
        .query
        .clone()
        .ok_or_else(|| ConfigError::Malformed("query text is required".into()))?;
    Ok(QueryRequest::new(sql).legacy(source.legacy))
}

/// Literal values as rows: objects are used as-is, lists are matched
/// positionally to the destination schema.
fn values_to_rows(values: &[Value], destination: &Destination) -> Result<Vec<Row>, ConfigError> {
    values
        .iter()
        .enumerate()
        .map(|(index, value)| match value {
            Value::Object(row) => Ok(row.clone()),
            Value::Array(items) => {
                let schema = destination
                    .schema
                    .as_ref()
                    .ok_or_else(|| ConfigError::Malformed("list values need a destination schema".into()))?;
                if items.len() > schema.len() {
                    return Err(ConfigError::Malformed(format!(
                        "values[{index}] has {} items but the schema has {} columns",
                        items.len(),
                        schema.len()
                    )));
                }
                Ok(schema.column_names().map(str::to_string).zip(items.iter().cloned()).collect())
            }
            _ => Err(ConfigError::Malformed(format!("values[{index}] must be an object or a list"))),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use quarry_types::{FieldSchema, FieldType, TableSchema, TaskDescriptor};
    use serde_json::json;

    use super::*;
    use crate::{
        handlers::test_support::{context, rows},
        remote::ScriptedApi,
        warehouse::{MemoryWarehouse, QueryResult, WarehouseOperation},
    };

    fn options(value: Value) -> TaskOptions {
        TaskDescriptor::from_entry(1, &json!({ "query": value }))
            .and_then(|task| task.typed_options())
            .expect("options")
    }

    #[tokio::test]
    async fn run_executes_without_writing() {
        let warehouse = Arc::new(MemoryWarehouse::new().with_query("DELETE FROM Ops.Runs WHERE TRUE", QueryResult::default()));
        let outcome = QueryHandler
            .run(
                &options(json!({"run": {"query": "DELETE FROM Ops.Runs WHERE TRUE"}})),
                &context(warehouse.clone(), Arc::new(ScriptedApi::new()), vec![]),
            )
            .await
            .expect("runs");
        assert_eq!(outcome.rows_written, 0);
        assert_eq!(warehouse.calls().await, vec![WarehouseOperation::RunQuery]);
    }

    #[tokio::test]
    async fn query_results_replace_target() {
        let sql = "SELECT id, name FROM Source";
        let warehouse = Arc::new(
            MemoryWarehouse::new()
                .with_query(
                    sql,
                    QueryResult::new(
                        TableSchema::new(vec![
                            FieldSchema::new("id", FieldType::Integer),
                            FieldSchema::new("name", FieldType::String),
                        ]),
                        rows(json!([{"id": 1, "name": "a"}, {"id": 2, "name": "b"}])),
                    ),
                )
                .with_table(&TableRef::new("Out", "Copy"), TableSchema::default(), rows(json!([{"id": 99}]))),
        );
        let outcome = QueryHandler
            .run(
                &options(json!({"from": {"query": sql}, "to": {"dataset": "Out", "table": "Copy"}})),
                &context(warehouse.clone(), Arc::new(ScriptedApi::new()), vec![]),
            )
            .await
            .expect("runs");

        assert_eq!(outcome.rows_written, 2);
        let stored = warehouse.table(&TableRef::new("Out", "Copy")).await.expect("table");
        assert_eq!(stored.rows, rows(json!([{"id": 1, "name": "a"}, {"id": 2, "name": "b"}])));
        assert_eq!(stored.schema.len(), 2);
    }

    #[tokio::test]
    async fn list_values_follow_schema_order() {
        let warehouse = Arc::new(MemoryWarehouse::new());
        let opts = options(json!({
            "from": {"values": [[1, "a"], {"id": 2, "name": "b"}]},
            "to": {"dataset": "Out", "table": "Values", "schema": [
                {"name": "id", "type": "INTEGER"},
                {"name": "name", "type": "STRING"}
            ]}
        }));
        assert!(QueryHandler.validate(&opts).is_ok());
        QueryHandler
            .run(&opts, &context(warehouse.clone(), Arc::new(ScriptedApi::new()), vec![]))
            .await
            .expect("runs");
        assert_eq!(
            warehouse.rows(&TableRef::new("Out", "Values")).await,
            rows(json!([{"id": 1, "name": "a"}, {"id": 2, "name": "b"}]))
        );
    }

    #[test]
    fn list_values_without_schema_are_rejected() {
        let opts = options(json!({"from": {"values": [[1]]}, "to": {"dataset": "Out", "table": "Values"}}));
        assert!(QueryHandler.validate(&opts).is_err());
    }

    #[tokio::test]
    async fn creates_view() {
        let warehouse = Arc::new(MemoryWarehouse::new());
        QueryHandler
            .run(
                &options(json!({"from": {"query": "SELECT 1 AS one"}, "to": {"dataset": "Out", "view": "One"}})),
                &context(warehouse.clone(), Arc::new(ScriptedApi::new()), vec![]),
            )
            .await
            .expect("runs");
        let dataset = warehouse.dataset("Out").await.expect("dataset");
        assert_eq!(dataset.views.get("One").map(String::as_str), Some("SELECT 1 AS one"));
    }
}
