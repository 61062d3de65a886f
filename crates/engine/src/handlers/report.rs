use async_trait::async_trait;
use quarry_types::{ConfigError, ReportSpec, Row, TaskKind, TaskOptions};
use serde_json::Value;
use tracing::{debug, info};

use crate::{
    error::{EngineError, EngineResult},
    materialize::{MaterializeTarget, materialize},
    paginate::Paginator,
    registry::{TaskContext, TaskHandler, TaskOutcome, options_mismatch},
    remote::{ApiCall, ApiPageSource, call_once},
};

/// Reporting connector: deletes, creates and runs a report, then downloads
/// its rows into the results table.
///
/// Calls are `<resource>.list|delete|create|run|rows`, each carrying the
/// report's extra `arguments`.
pub struct ReportHandler;

#[async_trait]
impl TaskHandler for ReportHandler {
    fn kind(&self) -> TaskKind {
        TaskKind::Report
    }

    fn validate(&self, options: &TaskOptions) -> Result<(), ConfigError> {
        match options {
            TaskOptions::Report(options) => options.validate(),
            other => Err(options_mismatch(self.kind(), other)),
        }
    }

    async fn run(&self, options: &TaskOptions, context: &TaskContext) -> EngineResult<TaskOutcome> {
        let TaskOptions::Report(options) = options else {
            return Err(options_mismatch(self.kind(), options).into());
        };
        let report = ReportCalls::new(&options.report);
        let mut report_ids: Vec<String> = match &options.report.report_id {
            Some(id) => vec![id.clone()],
            None => report.find_by_name(context).await?,
        };

        if options.delete {
            for id in report_ids.drain(..) {
                call_once(context.services.remote.as_ref(), &context.credential, &report.call("delete", Some(&id), None)).await?;
                info!(task = context.sequence, report = %id, "deleted report");
            }
        }

        if options.should_create() {
            let page = call_once(
                context.services.remote.as_ref(),
                &context.credential,
                &report.call("create", None, options.report.body.clone()),
            )
            .await?;
            let id = page
                .rows
                .first()
                .and_then(|row| row.get("id"))
                .and_then(id_text)
                .ok_or_else(|| report.failure("create", "response carried no report id"))?;
            info!(task = context.sequence, report = %id, "created report");
            report_ids = vec![id];
        }

        let needs_report = options.run || options.results.is_some();
        let id = match (needs_report, report_ids.first()) {
            (false, _) => return Ok(TaskOutcome::default()),
            (true, Some(id)) => id.clone(),
            (true, None) => return Err(report.failure("list", "no matching report")),
        };

        if options.run {
            call_once(context.services.remote.as_ref(), &context.credential, &report.call("run", Some(&id), None)).await?;
            info!(task = context.sequence, report = %id, "ran report");
        }

        let Some(results) = &options.results else {
            return Ok(TaskOutcome::default());
        };
        let source = ApiPageSource::new(
            context.services.remote.clone(),
            context.credential.clone(),
            report.call("rows", Some(&id), None),
        );
        let mut rows = Paginator::new(source, options.limit);
        let credential = context.credential_for(results.auth).await?;
        let target = MaterializeTarget {
            warehouse: context.warehouse(),
            credential: &credential,
            table: results.table_ref(),
            disposition: results.write_disposition()?,
        };
        let written = materialize(&mut rows, results.schema.clone(), &target).await?;
        info!(
            task = context.sequence,
            report = %id,
            rows = written.rows_written,
            table = %target.table,
            "report downloaded"
        );
        Ok(TaskOutcome {
            rows_written: written.rows_written,
            warnings: written.warnings,
        })
    }
}

struct ReportCalls<'a> {
    report: &'a ReportSpec,
}

impl<'a> ReportCalls<'a> {
    fn new(report: &'a ReportSpec) -> Self {
        Self { report }
    }

    fn call(&self, action: &str, report_id: Option<&str>, body: Option<Value>) -> ApiCall {
        let mut kwargs: Row = self.report.arguments.clone();
        if let Some(id) = report_id {
            kwargs.insert("reportId".into(), Value::String(id.to_string()));
        }
        if let Some(body) = body {
            kwargs.insert("body".into(), body);
        }
        ApiCall::new(
            self.report.api.clone(),
            self.report.version.clone(),
            format!("{}.{action}", self.report.resource),
            kwargs,
        )
    }

    fn failure(&self, action: &str, message: &str) -> EngineError {
        EngineError::RemoteApi {
            call: self.call(action, None, None).to_string(),
            message: message.to_string(),
        }
    }

    /// Ids of every report whose `name` matches, across all list pages.
    async fn find_by_name(&self, context: &TaskContext) -> EngineResult<Vec<String>> {
        let Some(name) = &self.report.name else {
            return Ok(Vec::new());
        };
        let source = ApiPageSource::new(context.services.remote.clone(), context.credential.clone(), self.call("list", None, None));
        let mut pages = Paginator::new(source, None);
        let mut ids = Vec::new();
        while let Some(rows) = pages.next_page().await? {
            ids.extend(
                rows.iter()
                    .filter(|row| row.get("name").and_then(Value::as_str) == Some(name.as_str()))
                    .filter_map(|row| row.get("id").and_then(id_text)),
            );
        }
        debug!(report = %name, matches = ids.len(), "looked up report by name");
        Ok(ids)
    }
}

fn id_text(value: &Value) -> Option<String> {
    match value {
        Value::String(text) => Some(text.clone()),
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use quarry_types::{TableRef, TaskDescriptor};
    use serde_json::json;

    use super::*;
    use crate::{
        handlers::test_support::{context, rows},
        remote::ScriptedApi,
        warehouse::MemoryWarehouse,
    };

    fn options(value: Value) -> TaskOptions {
        TaskDescriptor::from_entry(1, &json!({ "cm_report": value }))
            .and_then(|task| task.typed_options())
            .expect("options")
    }

    fn functions(api: &ScriptedApi) -> Vec<String> {
        api.calls().into_iter().map(|(call, _)| call.function).collect()
    }

    #[tokio::test]
    async fn recreates_runs_and_downloads_by_name() {
        let remote = Arc::new(
            ScriptedApi::new()
                .with_pages("reports.list", vec![rows(json!([{"id": 10, "name": "Weekly"}, {"id": 11, "name": "Other"}]))])
                .with_pages("reports.delete", vec![vec![]])
                .with_pages("reports.create", vec![rows(json!([{"id": "20", "name": "Weekly"}]))])
                .with_pages("reports.run", vec![vec![]])
                .with_pages(
                    "reports.rows",
                    vec![rows(json!([{"day": "2024-01-01", "clicks": 3}])), rows(json!([{"day": "2024-01-02", "clicks": 5}]))],
                ),
        );
        let warehouse = Arc::new(MemoryWarehouse::new());
        let opts = options(json!({
            "report": {
                "api": "dfareporting", "version": "v4", "name": "Weekly",
                "body": {"name": "Weekly", "type": "STANDARD"},
                "arguments": {"profileId": "7"}
            },
            "delete": true,
            "run": true,
            "out": {"bigquery": {"dataset": "CM", "table": "Weekly"}}
        }));

        let outcome = ReportHandler
            .run(&opts, &context(warehouse.clone(), remote.clone(), vec![]))
            .await
            .expect("runs");

        assert_eq!(outcome.rows_written, 2);
        assert_eq!(
            functions(&remote),
            vec!["reports.list", "reports.delete", "reports.create", "reports.run", "reports.rows", "reports.rows"]
        );
        let calls = remote.calls();
        assert_eq!(calls[1].0.kwargs.get("reportId"), Some(&json!("10")));
        assert_eq!(calls[3].0.kwargs.get("reportId"), Some(&json!("20")));
        assert!(calls.iter().all(|(call, _)| call.kwargs.get("profileId") == Some(&json!("7"))));
        assert_eq!(warehouse.rows(&TableRef::new("CM", "Weekly")).await.len(), 2);
    }

    #[tokio::test]
    async fn missing_report_fails() {
        let remote = Arc::new(ScriptedApi::new().with_pages("reports.list", vec![vec![]]));
        let opts = options(json!({"report": {"api": "dfareporting", "version": "v4", "name": "Nope"}, "run": true}));
        let err = ReportHandler
            .run(&opts, &context(Arc::new(MemoryWarehouse::new()), remote, vec![]))
            .await
            .expect_err("missing");
        assert!(matches!(err, EngineError::RemoteApi { .. }));
    }

    #[tokio::test]
    async fn known_id_skips_lookup() {
        let remote = Arc::new(ScriptedApi::new().with_pages("queries.run", vec![vec![]]));
        let opts = options(json!({
            "report": {"api": "doubleclickbidmanager", "version": "v2", "resource": "queries", "report_id": "5"},
            "run": true
        }));
        ReportHandler
            .run(&opts, &context(Arc::new(MemoryWarehouse::new()), remote.clone(), vec![]))
            .await
            .expect("runs");
        assert_eq!(functions(&remote), vec!["queries.run"]);
    }
}
