//! Workflow runner.
//!
//! A run moves `Pending → Running(1) → … → Completed`, or stops at
//! `Failed(i)` on the first task error. Every descriptor is validated while
//! still `Pending`, so configuration errors surface before any collaborator
//! is called. The execution log is flushed once the run stops.

use chrono::Utc;
use quarry_types::{AuthKind, ConfigError, Row, TaskDescriptor, Workflow};
use serde_json::Value;
use tracing::{error, info, warn};

use crate::{
    error::{EngineError, EngineResult},
    log::{ExecutionLog, LogEntry, Outcome},
    registry::{HandlerRegistry, Services, TaskContext, TaskOutcome},
    resolve::{check_placeholders, resolve_task},
    templates::collect_placeholders,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Pending,
    /// Executing the task with this 1-based sequence.
    Running(usize),
    Failed(usize),
    Completed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunOptions {
    /// Run only this 1-based task; the others are skipped and not logged.
    pub only_task: Option<usize>,
    /// Use this credential kind for every task, source and destination.
    pub auth_override: Option<AuthKind>,
}

#[derive(Debug)]
pub struct RunReport {
    pub state: RunState,
    pub log: ExecutionLog,
    /// Configuration error, or the error of the failed task.
    pub error: Option<EngineError>,
    /// Set when the log could not be written to its sink.
    pub log_error: Option<EngineError>,
}

impl RunReport {
    /// 0 when completed, 2 for configuration errors found before running,
    /// 1 for any other failure including a failed log flush.
    pub fn exit_code(&self) -> i32 {
        match (&self.state, &self.error) {
            (RunState::Pending, Some(error)) if error.is_config() => 2,
            (RunState::Completed, None) if self.log_error.is_none() => 0,
            _ => 1,
        }
    }

    pub fn is_success(&self) -> bool {
        self.exit_code() == 0
    }
}

pub struct WorkflowRunner {
    registry: HandlerRegistry,
    services: Services,
    options: RunOptions,
    state: RunState,
}

impl WorkflowRunner {
    pub fn new(registry: HandlerRegistry, services: Services) -> Self {
        Self {
            registry,
            services,
            options: RunOptions::default(),
            state: RunState::Pending,
        }
    }

    pub fn with_options(mut self, options: RunOptions) -> Self {
        self.options = options;
        self
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    /// Static checks of every task: handler, placeholders and options. No I/O.
    pub fn validate(&self, workflow: &Workflow) -> Result<(), ConfigError> {
        if let Some(only) = self.options.only_task
            && workflow.task(only).is_none()
        {
            return Err(ConfigError::Malformed(format!(
                "task #{only} does not exist; the workflow has {} tasks",
                workflow.tasks.len()
            )));
        }
        for task in &workflow.tasks {
            let handler = self.registry.dispatch(task)?;
            check_placeholders(task)?;
            // Templated options are checked for shape once rendered.
            if !has_placeholders(task) {
                let options = task.typed_options()?;
                handler.validate(&options).map_err(|error| error.in_task(task.sequence))?;
            }
        }
        Ok(())
    }

    pub async fn run(&mut self, workflow: &Workflow) -> RunReport {
        let mut log = ExecutionLog::new();
        if let Err(error) = self.validate(workflow) {
            error!(error = %error, "workflow rejected");
            return RunReport {
                state: self.state,
                log,
                error: Some(error.into()),
                log_error: None,
            };
        }

        let mut failure = None;
        let only_task = self.options.only_task;
        for task in workflow.tasks.iter().filter(|task| only_task.is_none_or(|only| only == task.sequence)) {
            self.state = RunState::Running(task.sequence);
            let (entry, result) = self.run_task(task).await;
            log.record(entry);
            if let Err(error) = result {
                self.state = RunState::Failed(task.sequence);
                failure = Some(error);
                break;
            }
        }
        if failure.is_none() {
            self.state = RunState::Completed;
        }

        let log_error = self.flush_log(workflow, &log).await.err();
        info!(state = ?self.state, tasks = log.len(), "workflow finished");
        RunReport {
            state: self.state,
            log,
            error: failure,
            log_error,
        }
    }

    async fn run_task(&self, task: &TaskDescriptor) -> (LogEntry, EngineResult<TaskOutcome>) {
        let started_at = Utc::now();
        info!(task = task.sequence, kind = %task.kind, description = %task.label(), "task started");

        let mut parameters = Row::new();
        let result = self.execute(task, &mut parameters).await;
        let ended_at = Utc::now();

        let (outcome, error, rows_written, warnings) = match &result {
            Ok(done) => {
                if done.warnings > 0 {
                    warn!(task = task.sequence, warnings = done.warnings, "values were coerced to fit the schema");
                }
                info!(task = task.sequence, rows = done.rows_written, "task finished");
                (Outcome::Success, None, done.rows_written, done.warnings)
            }
            Err(err) => {
                error!(task = task.sequence, description = %task.label(), error = %err, "task failed");
                (Outcome::Failure, Some(err.to_string()), 0, 0)
            }
        };
        let entry = LogEntry {
            sequence: task.sequence,
            kind: task.kind,
            description: task.description.clone(),
            started_at,
            ended_at,
            outcome,
            error,
            rows_written,
            warnings,
            parameters,
        };
        (entry, result)
    }

    async fn execute(&self, task: &TaskDescriptor, parameters: &mut Row) -> EngineResult<TaskOutcome> {
        let handler = self.registry.dispatch(task)?;
        let kind = self.options.auth_override.unwrap_or(task.auth);
        let credential = self.services.credentials.credential(kind).await?;
        let mut context = TaskContext {
            sequence: task.sequence,
            credential,
            auth_override: self.options.auth_override,
            kwargs: Vec::new(),
            services: self.services.clone(),
        };

        let resolved = resolve_task(task, &context).await?;
        *parameters = resolved.parameters;
        context.kwargs = resolved.kwargs;
        handler.validate(&resolved.options).map_err(|error| error.in_task(task.sequence))?;
        handler.run(&resolved.options, &context).await
    }

    async fn flush_log(&self, workflow: &Workflow, log: &ExecutionLog) -> EngineResult<()> {
        let Some(sink) = &workflow.log else {
            return Ok(());
        };
        let kind = self.options.auth_override.or(sink.auth).unwrap_or_default();
        let credential = self.services.credentials.credential(kind).await?;
        log.flush(sink, self.services.warehouse.as_ref(), &credential)
            .await
            .map_err(|error| {
                error!(table = %sink.table_ref(), error = %error, "execution log was not written");
                EngineError::from(error)
            })?;
        Ok(())
    }
}

fn has_placeholders(task: &TaskDescriptor) -> bool {
    let mut found = Vec::new();
    collect_placeholders(&Value::Object(task.options.clone()), "", &mut found);
    !found.is_empty()
}
