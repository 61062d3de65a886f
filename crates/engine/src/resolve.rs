//! Parameter resolution: binds literal kwargs and remote query results to
//! `{name}` placeholders and produces the concrete options for a task.

use std::collections::HashSet;

use quarry_types::{ConfigError, Kwargs, RemoteParameterSource, Row, TableRef, TaskDescriptor, TaskKind, TaskOptions};
use serde_json::Value;
use tracing::debug;

use crate::{
    error::{EngineError, EngineResult},
    registry::TaskContext,
    templates::{Bindings, PlaceholderRef, collect_placeholders, extract_placeholders, render_row, render_text, render_value},
    warehouse::{QueryRequest, QueryResult},
};

/// Options of a task after every placeholder was substituted.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedTask {
    pub options: TaskOptions,
    /// Keyword argument sets for `api` calls: literal ones first, then remote rows.
    pub kwargs: Vec<Row>,
    /// Every binding used, for the execution log.
    pub parameters: Row,
}

/// Check that every placeholder in `task` has exactly one binding, without
/// running any query.
pub fn check_placeholders(task: &TaskDescriptor) -> Result<(), ConfigError> {
    check_task_placeholders(task).map_err(|error| error.in_task(task.sequence))
}

fn check_task_placeholders(task: &TaskDescriptor) -> Result<(), ConfigError> {
    let literal: HashSet<&str> = literal_bindings(task)
        .map(|row| row.keys().map(String::as_str).collect())
        .unwrap_or_default();
    let mut remote: HashSet<&str> = HashSet::new();

    for (index, source) in task.kwargs_remote.iter().enumerate() {
        source.validate()?;
        if !source.declares_parameters() && task.kind != TaskKind::Api {
            return Err(ConfigError::Malformed(format!(
                "kwargs_remote[{index}] declares no parameters; only api tasks accept row-per-call sources"
            )));
        }
        if let Some(query) = &source.query
            && let Some(name) = extract_placeholders(query).into_iter().find(|name| !literal.contains(name.as_str()))
        {
            return Err(ConfigError::UnresolvedParameter {
                name,
                location: format!("kwargs_remote[{index}].query"),
            });
        }
        for name in source.parameters.keys() {
            if literal.contains(name.as_str()) || !remote.insert(name.as_str()) {
                return Err(ConfigError::AmbiguousBinding { name: name.clone() });
            }
        }
    }

    // Literal kwargs may only reference remote parameters.
    if let Some(kwargs) = &task.kwargs {
        let mut found = Vec::new();
        for (index, set) in kwargs.sets().iter().enumerate() {
            collect_placeholders(&Value::Object(set.clone()), &kwargs_location(kwargs, index), &mut found);
        }
        require_bound(found, |name| remote.contains(name))?;
    }

    let bound = |name: &str| literal.contains(name) || remote.contains(name);
    for (key, value) in &task.options {
        let mut found = Vec::new();
        match scoped_block(task, key, value) {
            Some((block, parameters)) => {
                if let Some(name) = parameters.keys().find(|name| bound(name.as_str())) {
                    return Err(ConfigError::AmbiguousBinding { name: name.clone() });
                }
                for (field, item) in block.iter().filter(|(field, _)| field.as_str() != BLOCK_PARAMETERS) {
                    collect_placeholders(item, &format!("{key}.{field}"), &mut found);
                }
                require_bound(found, |name| bound(name) || parameters.contains_key(name))?;
            }
            None => {
                collect_placeholders(value, key, &mut found);
                require_bound(found, bound)?;
            }
        }
    }
    Ok(())
}

fn require_bound(found: Vec<PlaceholderRef>, is_bound: impl Fn(&str) -> bool) -> Result<(), ConfigError> {
    match found.into_iter().find(|placeholder| !is_bound(placeholder.name.as_str())) {
        Some(PlaceholderRef { location, name }) => Err(ConfigError::UnresolvedParameter { name, location }),
        None => Ok(()),
    }
}

fn literal_bindings(task: &TaskDescriptor) -> Option<&Row> {
    task.kwargs.as_ref().and_then(Kwargs::as_bindings)
}

fn kwargs_location(kwargs: &Kwargs, index: usize) -> String {
    match kwargs {
        Kwargs::One(_) => "kwargs".to_string(),
        Kwargs::Many(_) => format!("kwargs[{index}]"),
    }
}

/// Query blocks that may carry their own `parameters`.
const SCOPED_BLOCKS: &[&str] = &["run", "from"];
const BLOCK_PARAMETERS: &str = "parameters";

/// The block under `key` and its own parameters, when it declares any.
fn scoped_block<'a>(task: &TaskDescriptor, key: &str, value: &'a Value) -> Option<(&'a Row, &'a Row)> {
    if task.kind != TaskKind::Query || !SCOPED_BLOCKS.contains(&key) {
        return None;
    }
    let block = value.as_object()?;
    let parameters = block.get(BLOCK_PARAMETERS)?.as_object()?;
    Some((block, parameters))
}

/// Render the option bag. A scoped block sees the task bindings plus its own
/// parameters, which are kept as written.
fn render_options(task: &TaskDescriptor, bindings: &Bindings) -> Result<Row, ConfigError> {
    let mut rendered = Row::new();
    for (key, value) in &task.options {
        let value = match scoped_block(task, key, value) {
            Some((block, parameters)) => {
                let mut scoped = bindings.clone();
                for (name, bound) in parameters {
                    scoped.bind(name.clone(), bound.clone())?;
                }
                let mut out = Row::new();
                for (field, item) in block {
                    let item = if field == BLOCK_PARAMETERS {
                        item.clone()
                    } else {
                        render_value(item, &scoped, &format!("{key}.{field}"))?
                    };
                    out.insert(field.clone(), item);
                }
                Value::Object(out)
            }
            None => render_value(value, bindings, key)?,
        };
        rendered.insert(key.clone(), value);
    }
    Ok(rendered)
}

/// Resolve `task` for execution.
///
/// Each remote source is queried exactly once. Sources declaring parameters
/// bind one name per declared column; sources without parameters contribute
/// their rows as keyword argument sets. Literal kwargs are rendered with the
/// remote bindings before they bind anything themselves.
pub async fn resolve_task(task: &TaskDescriptor, context: &TaskContext) -> EngineResult<ResolvedTask> {
    let in_task = |error: ConfigError| EngineError::Config(error.in_task(task.sequence));

    let literal = literal_bindings(task).map(Bindings::from_row).unwrap_or_default();
    let mut remote = Bindings::new();
    let mut remote_rows = Vec::new();

    for (index, source) in task.kwargs_remote.iter().enumerate() {
        let result = fetch_source(source, index, &literal, context).await?;
        debug!(
            task = task.sequence,
            source = index,
            rows = result.rows.len(),
            "evaluated remote parameter source"
        );
        if source.declares_parameters() {
            for (name, default) in &source.parameters {
                remote.bind(name.clone(), flatten_column(&result.rows, name, default)).map_err(in_task)?;
            }
        } else {
            remote_rows.extend(result.rows);
        }
    }

    let mut kwargs = Vec::new();
    if let Some(literal_kwargs) = &task.kwargs {
        for (index, set) in literal_kwargs.sets().iter().enumerate() {
            kwargs.push(render_row(set, &remote, &kwargs_location(literal_kwargs, index)).map_err(in_task)?);
        }
    }
    let mut bindings = match (&task.kwargs, kwargs.first()) {
        (Some(Kwargs::One(_)), Some(set)) => Bindings::from_row(set),
        _ => Bindings::new(),
    };
    for (name, value) in remote.to_row() {
        bindings.bind(name, value).map_err(in_task)?;
    }
    kwargs.extend(remote_rows);

    let rendered = render_options(task, &bindings).map_err(in_task)?;
    let options = TaskOptions::parse(task.kind, &rendered)
        .map_err(|error| EngineError::Config(ConfigError::invalid_options(task.sequence, task.kind, error.to_string())))?;

    Ok(ResolvedTask {
        options,
        kwargs,
        parameters: bindings.to_row(),
    })
}

async fn fetch_source(
    source: &RemoteParameterSource,
    index: usize,
    literal: &Bindings,
    context: &TaskContext,
) -> EngineResult<QueryResult> {
    let credential = context.credential_for(source.auth).await?;
    let warehouse = context.warehouse();
    let result = match (&source.query, &source.table) {
        (Some(query), _) => {
            let sql = render_text(query, literal, &format!("kwargs_remote[{index}].query"))
                .map_err(|error| EngineError::Config(error.in_task(context.sequence)))?;
            let request = QueryRequest::new(sql).legacy(source.legacy).in_dataset(source.dataset.clone());
            warehouse.run_query(&credential, &request).await
        }
        (None, Some(table)) => warehouse.read_table(&credential, &TableRef::new(source.dataset.clone(), table.clone())).await,
        (None, None) => {
            return Err(EngineError::Config(
                ConfigError::Malformed(format!("kwargs_remote[{index}] has neither query nor table")).in_task(context.sequence),
            ));
        }
    };
    result.map_err(EngineError::RemoteQuery)
}

/// Value bound for one declared column.
///
/// A list default collects the column across all rows (nulls skipped); any
/// other default takes the first row's value. No rows yields the default.
pub fn flatten_column(rows: &[Row], column: &str, default: &Value) -> Value {
    if rows.is_empty() {
        return default.clone();
    }
    if default.is_array() {
        return Value::Array(
            rows.iter()
                .filter_map(|row| row.get(column))
                .filter(|value| !value.is_null())
                .cloned()
                .collect(),
        );
    }
    rows[0].get(column).cloned().unwrap_or_else(|| default.clone())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use quarry_types::{AuthKind, FieldSchema, FieldType, QueryOptions, TableSchema};
    use serde_json::json;

    use super::*;
    use crate::{
        credentials::{Credential, StaticCredentials},
        registry::Services,
        remote::ScriptedApi,
        warehouse::{MemoryWarehouse, WarehouseOperation},
    };

    fn task(entry: Value) -> TaskDescriptor {
        TaskDescriptor::from_entry(1, &entry).expect("descriptor")
    }

    fn rows(value: Value) -> Vec<Row> {
        value
            .as_array()
            .map(|items| items.iter().filter_map(|item| item.as_object().cloned()).collect())
            .unwrap_or_default()
    }

    fn context(warehouse: Arc<MemoryWarehouse>) -> TaskContext {
        TaskContext {
            sequence: 1,
            credential: Credential::new(AuthKind::Service, "t"),
            auth_override: None,
            kwargs: Vec::new(),
            services: Services::new(
                warehouse,
                Arc::new(ScriptedApi::new()),
                Arc::new(StaticCredentials::new().with_token(AuthKind::Service, "t")),
            ),
        }
    }

    fn advertiser_task() -> TaskDescriptor {
        task(json!({"query": {
            "kwargs_remote": {"bigquery": {
                "dataset": "Setup",
                "query": "SELECT advertiser FROM Advertisers",
                "parameters": {"advertisers": []}
            }},
            "run": {"query": "SELECT * FROM Lines WHERE advertiser IN UNNEST({advertisers})"}
        }}))
    }

    fn advertiser_rows() -> QueryResult {
        QueryResult::new(
            TableSchema::new(vec![FieldSchema::new("advertiser", FieldType::String)]),
            rows(json!([{"advertiser": "1"}, {"advertiser": "2"}, {"advertiser": "3"}])),
        )
    }

    fn run_query(resolved: &ResolvedTask) -> String {
        match &resolved.options {
            TaskOptions::Query(QueryOptions { run: Some(source), .. }) => source.query.clone().unwrap_or_default(),
            other => panic!("unexpected options {other:?}"),
        }
    }

    #[tokio::test]
    async fn remote_list_binding_expands_into_unnest() {
        let warehouse = Arc::new(MemoryWarehouse::new().with_query("SELECT advertiser FROM Advertisers", advertiser_rows()));
        let resolved = resolve_task(&advertiser_task(), &context(warehouse.clone())).await.expect("resolves");

        assert_eq!(run_query(&resolved), r#"SELECT * FROM Lines WHERE advertiser IN UNNEST(["1","2","3"])"#);
        assert_eq!(resolved.parameters.get("advertisers"), Some(&json!(["1", "2", "3"])));
        assert_eq!(warehouse.calls().await, vec![WarehouseOperation::RunQuery]);
    }

    #[tokio::test]
    async fn zero_rows_use_declared_default() {
        let warehouse = Arc::new(MemoryWarehouse::new().with_query("SELECT advertiser FROM Advertisers", QueryResult::default()));
        let resolved = resolve_task(&advertiser_task(), &context(warehouse)).await.expect("resolves");
        assert_eq!(run_query(&resolved), "SELECT * FROM Lines WHERE advertiser IN UNNEST([])");
    }

    #[tokio::test]
    async fn resolution_is_idempotent() {
        let warehouse = Arc::new(MemoryWarehouse::new().with_query("SELECT advertiser FROM Advertisers", advertiser_rows()));
        let context = context(warehouse);
        let first = resolve_task(&advertiser_task(), &context).await.expect("first");
        let second = resolve_task(&advertiser_task(), &context).await.expect("second");
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn remote_failure_is_a_remote_query_error() {
        let warehouse = Arc::new(MemoryWarehouse::new().failing_on(WarehouseOperation::RunQuery, "denied"));
        let err = resolve_task(&advertiser_task(), &context(warehouse)).await.expect_err("fails");
        assert!(matches!(err, EngineError::RemoteQuery(_)));
    }

    #[tokio::test]
    async fn literal_bindings_feed_source_queries() {
        let warehouse = Arc::new(MemoryWarehouse::new().with_query(
            "SELECT id FROM Partners WHERE region = 'EU'",
            QueryResult::new(TableSchema::default(), rows(json!([{"id": 9}]))),
        ));
        let descriptor = task(json!({"query": {
            "kwargs": {"region": "EU"},
            "kwargs_remote": {"dataset": "Setup", "query": "SELECT id FROM Partners WHERE region = '{region}'", "parameters": {"id": 0}},
            "run": {"query": "CALL refresh({id}, '{region}')"}
        }}));
        let resolved = resolve_task(&descriptor, &context(warehouse)).await.expect("resolves");
        assert_eq!(run_query(&resolved), "CALL refresh(9, 'EU')");
    }

    #[tokio::test]
    async fn block_parameters_bind_only_inside_their_block() {
        let descriptor = task(json!({"query": {
            "kwargs": {"region": "EU"},
            "run": {"query": "CALL refresh({days}, '{region}')", "parameters": {"days": 5}}
        }}));
        check_placeholders(&descriptor).expect("bound");
        let resolved = resolve_task(&descriptor, &context(Arc::new(MemoryWarehouse::new()))).await.expect("resolves");
        assert_eq!(run_query(&resolved), "CALL refresh(5, 'EU')");
        assert_eq!(resolved.parameters.get("days"), None);
    }

    #[test]
    fn block_parameter_shadowing_a_task_binding_is_ambiguous() {
        let descriptor = task(json!({"query": {
            "kwargs": {"days": 7},
            "run": {"query": "CALL refresh({days})", "parameters": {"days": 5}}
        }}));
        assert!(matches!(
            check_placeholders(&descriptor),
            Err(ConfigError::Task { source, .. }) if matches!(*source, ConfigError::AmbiguousBinding { ref name } if name == "days")
        ));
    }

    #[test]
    fn block_parameters_do_not_leak_into_other_blocks() {
        let descriptor = task(json!({"query": {
            "from": {"query": "SELECT {n}", "parameters": {"n": 1}},
            "to": {"dataset": "D", "table": "T_{n}"}
        }}));
        let err = check_placeholders(&descriptor).expect_err("unbound outside its block");
        assert!(err.to_string().contains("to.table"), "{err}");
    }

    #[tokio::test]
    async fn kwargs_are_rendered_with_remote_parameters() {
        let warehouse = Arc::new(MemoryWarehouse::new().with_query(
            "SELECT partner FROM Partners",
            QueryResult::new(TableSchema::default(), rows(json!([{"partner": "7"}]))),
        ));
        let descriptor = task(json!({"api": {
            "api": "displayvideo", "version": "v2", "function": "partners.get",
            "kwargs": {"partnerId": "{partner}"},
            "kwargs_remote": {"dataset": "Setup", "query": "SELECT partner FROM Partners", "parameters": {"partner": ""}}
        }}));
        check_placeholders(&descriptor).expect("bound");
        let resolved = resolve_task(&descriptor, &context(warehouse)).await.expect("resolves");
        assert_eq!(resolved.kwargs, rows(json!([{"partnerId": "7"}])));
    }

    #[test]
    fn kwargs_cannot_reference_their_own_names() {
        let descriptor = task(json!({"api": {
            "api": "svc", "version": "v1", "function": "items.list",
            "kwargs": {"a": "x", "b": "{a}"}
        }}));
        let err = check_placeholders(&descriptor).expect_err("self reference");
        assert!(matches!(
            err,
            ConfigError::Task { source, .. } if *source == ConfigError::UnresolvedParameter { name: "a".into(), location: "kwargs.b".into() }
        ));
    }

    #[tokio::test]
    async fn parameterless_source_rows_become_kwargs() {
        let warehouse = Arc::new(MemoryWarehouse::new().with_table(
            &TableRef::new("Setup", "Profiles"),
            TableSchema::default(),
            rows(json!([{"profileId": 1}, {"profileId": 2}])),
        ));
        let descriptor = task(json!({"api": {
            "api": "dfareporting", "version": "v4", "function": "reports.list",
            "kwargs_remote": {"warehouse": {"dataset": "Setup", "table": "Profiles"}}
        }}));
        let resolved = resolve_task(&descriptor, &context(warehouse)).await.expect("resolves");
        assert_eq!(resolved.kwargs, rows(json!([{"profileId": 1}, {"profileId": 2}])));
    }

    #[test]
    fn static_check_finds_unbound_placeholder() {
        let descriptor = task(json!({"query": {"run": {"query": "SELECT {missing}"}}}));
        let err = check_placeholders(&descriptor).expect_err("unbound");
        assert_eq!(
            err,
            ConfigError::Task {
                sequence: 1,
                source: Box::new(ConfigError::UnresolvedParameter {
                    name: "missing".into(),
                    location: "run.query".into()
                })
            }
        );
    }

    #[test]
    fn static_check_finds_double_binding() {
        let descriptor = task(json!({"query": {
            "kwargs": {"ids": [1]},
            "kwargs_remote": {"dataset": "d", "query": "SELECT 1", "parameters": {"ids": []}},
            "run": {"query": "SELECT {ids}"}
        }}));
        assert!(matches!(
            check_placeholders(&descriptor),
            Err(ConfigError::Task { source, .. }) if matches!(*source, ConfigError::AmbiguousBinding { .. })
        ));
    }

    #[test]
    fn parameterless_source_only_for_api() {
        let descriptor = task(json!({"query": {
            "kwargs_remote": {"dataset": "d", "table": "t"},
            "run": {"query": "SELECT 1"}
        }}));
        assert!(check_placeholders(&descriptor).is_err());
    }

    #[test]
    fn flatten_scalar_and_list() {
        let data = rows(json!([{"a": 1, "b": null}, {"a": 2, "b": "x"}]));
        assert_eq!(flatten_column(&data, "a", &json!(0)), json!(1));
        assert_eq!(flatten_column(&data, "b", &json!([])), json!(["x"]));
        assert_eq!(flatten_column(&data, "c", &json!("dflt")), json!("dflt"));
        assert_eq!(flatten_column(&[], "a", &json!(5)), json!(5));
    }
}
