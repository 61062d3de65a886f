use std::{collections::VecDeque, sync::Arc};

use async_trait::async_trait;
use quarry_types::{ApiOptions, ConfigError, FieldSchema, Row, TaskKind, TaskOptions};
use serde_json::Value;
use tracing::{debug, info};

use crate::{
    credentials::Credential,
    error::EngineResult,
    materialize::{MaterializeTarget, materialize, schema_with_extra},
    paginate::{Paginator, RowBatches},
    registry::{TaskContext, TaskHandler, TaskOutcome, options_mismatch},
    remote::{ApiCall, ApiPageSource, RemoteApi},
};

/// Generic remote call: one call per kwargs set, optionally paged, with rows
/// streamed into the results table.
pub struct ApiHandler;

#[async_trait]
impl TaskHandler for ApiHandler {
    fn kind(&self) -> TaskKind {
        TaskKind::Api
    }

    fn validate(&self, options: &TaskOptions) -> Result<(), ConfigError> {
        match options {
            TaskOptions::Api(options) => options.validate(),
            other => Err(options_mismatch(self.kind(), other)),
        }
    }

    async fn run(&self, options: &TaskOptions, context: &TaskContext) -> EngineResult<TaskOutcome> {
        let TaskOptions::Api(options) = options else {
            return Err(options_mismatch(self.kind(), options).into());
        };
        let mut batches = ApiBatches::new(
            context.services.remote.clone(),
            context.credential.clone(),
            options,
            context.kwargs.clone(),
        );

        let Some(results) = &options.results else {
            let mut rows = 0;
            while let Some(batch) = batches.next_batch().await? {
                rows += batch.len();
            }
            info!(task = context.sequence, calls = batches.calls, rows, "api calls finished without results table");
            return Ok(TaskOutcome::default());
        };

        let credential = context.credential_for(results.auth).await?;
        let target = MaterializeTarget {
            warehouse: context.warehouse(),
            credential: &credential,
            table: results.table_ref(),
            disposition: results.write_disposition()?,
        };
        let report = materialize(&mut batches, schema_with_extra(results.schema.as_ref(), &options.append), &target).await?;
        info!(
            task = context.sequence,
            calls = batches.calls,
            rows = report.rows_written,
            table = %target.table,
            "api results written"
        );
        Ok(TaskOutcome {
            rows_written: report.rows_written,
            warnings: report.warnings,
        })
    }
}

/// Rows of every call, in kwargs order, with `append` columns copied in.
struct ApiBatches {
    remote: Arc<dyn RemoteApi>,
    credential: Credential,
    api: String,
    version: String,
    function: String,
    key: Option<String>,
    headers: Vec<(String, String)>,
    iterate: bool,
    limit: Option<usize>,
    append: Vec<FieldSchema>,
    pending: VecDeque<Row>,
    current: Option<(Paginator<ApiPageSource>, Row)>,
    calls: usize,
}

impl ApiBatches {
    fn new(remote: Arc<dyn RemoteApi>, credential: Credential, options: &ApiOptions, kwargs: Vec<Row>) -> Self {
        let mut pending: VecDeque<Row> = kwargs.into();
        if pending.is_empty() {
            pending.push_back(Row::new());
        }
        Self {
            remote,
            credential,
            api: options.api.clone(),
            version: options.version.clone(),
            function: options.function.clone(),
            key: options.key.clone(),
            headers: options.headers.iter().map(|(name, value)| (name.clone(), value.clone())).collect(),
            iterate: options.iterate,
            limit: options.limit,
            append: options.append.clone(),
            pending,
            current: None,
            calls: 0,
        }
    }

    fn start_call(&mut self, kwargs: Row) -> (Paginator<ApiPageSource>, Row) {
        let appended: Row = self
            .append
            .iter()
            .map(|field| (field.name.clone(), kwargs.get(&field.name).cloned().unwrap_or(Value::Null)))
            .collect();
        let call = ApiCall::new(self.api.clone(), self.version.clone(), self.function.clone(), kwargs)
            .with_key(self.key.clone())
            .with_headers(self.headers.clone());
        debug!(call = %call, "starting api call");
        self.calls += 1;
        let paginator = Paginator::new(ApiPageSource::new(self.remote.clone(), self.credential.clone(), call), self.limit);
        let paginator = if self.iterate { paginator } else { paginator.first_page_only() };
        (paginator, appended)
    }
}

#[async_trait]
impl RowBatches for ApiBatches {
    async fn next_batch(&mut self) -> EngineResult<Option<Vec<Row>>> {
        loop {
            if self.current.is_none() {
                let Some(kwargs) = self.pending.pop_front() else {
                    return Ok(None);
                };
                self.current = Some(self.start_call(kwargs));
            }
            let Some((paginator, appended)) = self.current.as_mut() else {
                continue;
            };
            match paginator.next_page().await? {
                Some(mut rows) => {
                    for row in &mut rows {
                        for (name, value) in appended.iter() {
                            row.insert(name.clone(), value.clone());
                        }
                    }
                    return Ok(Some(rows));
                }
                None => self.current = None,
            }
        }
    }
}
