//! Workflow documents and the task descriptors built from them.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    Row,
    destination::{LogSink, warehouse_block, warehouse_blocks},
    error::ConfigError,
    options::{Kwargs, RemoteParameterSource, TaskOptions},
};

/// Which configured credential a task (or source, or destination) uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthKind {
    User,
    #[default]
    Service,
}

impl fmt::Display for AuthKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::User => f.write_str("user"),
            Self::Service => f.write_str("service"),
        }
    }
}

impl FromStr for AuthKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Self::User),
            "service" => Ok(Self::Service),
            other => Err(format!("unknown auth kind '{other}'; expected 'user' or 'service'")),
        }
    }
}

/// Closed set of task kinds understood by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Dataset,
    #[serde(alias = "google_api")]
    Api,
    #[serde(alias = "bigquery")]
    Query,
    #[serde(alias = "cm_report", alias = "dv_report")]
    Report,
}

impl TaskKind {
    pub const ALL: [TaskKind; 4] = [Self::Dataset, Self::Api, Self::Query, Self::Report];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Dataset => "dataset",
            Self::Api => "api",
            Self::Query => "query",
            Self::Report => "report",
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "dataset" => Ok(Self::Dataset),
            "api" | "google_api" => Ok(Self::Api),
            "query" | "bigquery" => Ok(Self::Query),
            "report" | "cm_report" | "dv_report" => Ok(Self::Report),
            other => Err(format!("unknown task kind '{other}'")),
        }
    }
}

/// Workflow document as authored: `{log?, tasks: [{"<kind>": {...}}]}`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkflowDocument {
    #[serde(default, deserialize_with = "warehouse_block", skip_serializing_if = "Option::is_none")]
    pub log: Option<LogSink>,
    #[serde(default)]
    pub tasks: Vec<Value>,
}

/// One task in execution order.
///
/// `options` keeps the kind-specific bag as raw JSON so templates can be
/// expanded before it is interpreted; the uniform fields shared by every
/// kind are lifted out.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskDescriptor {
    /// 1-based position in the workflow.
    pub sequence: usize,
    pub kind: TaskKind,
    pub description: Option<String>,
    pub auth: AuthKind,
    pub kwargs: Option<Kwargs>,
    pub kwargs_remote: Vec<RemoteParameterSource>,
    pub options: Row,
}

#[derive(Deserialize)]
struct TaskEnvelope {
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    auth: Option<AuthKind>,
    #[serde(default)]
    kwargs: Option<Kwargs>,
    #[serde(default, deserialize_with = "warehouse_blocks")]
    kwargs_remote: Vec<RemoteParameterSource>,
    #[serde(flatten)]
    options: Row,
}

impl TaskDescriptor {
    /// Build a descriptor from one `{"<kind>": {options}}` entry.
    pub fn from_entry(sequence: usize, entry: &Value) -> Result<Self, ConfigError> {
        let Value::Object(object) = entry else {
            return Err(ConfigError::Malformed(format!("task #{sequence} must be an object")));
        };
        let mut keys = object.iter();
        let (Some((name, body)), None) = (keys.next(), keys.next()) else {
            return Err(ConfigError::Malformed(format!(
                "task #{sequence} must have exactly one key naming its kind, found {}",
                object.len()
            )));
        };
        let kind = TaskKind::from_str(name).map_err(|_| ConfigError::UnknownTaskKind {
            sequence,
            kind: name.clone(),
        })?;
        if !body.is_object() {
            return Err(ConfigError::invalid_options(sequence, kind, "options must be an object"));
        }
        let envelope: TaskEnvelope =
            serde_json::from_value(body.clone()).map_err(|err| ConfigError::invalid_options(sequence, kind, err.to_string()))?;

        Ok(Self {
            sequence,
            kind,
            description: envelope.description,
            auth: envelope.auth.unwrap_or_default(),
            kwargs: envelope.kwargs,
            kwargs_remote: envelope.kwargs_remote,
            options: envelope.options,
        })
    }

    /// Label used in logs: the description, or the kind when there is none.
    pub fn label(&self) -> String {
        self.description.clone().unwrap_or_else(|| self.kind.to_string())
    }

    /// Interpret the raw option bag for this task's kind.
    pub fn typed_options(&self) -> Result<TaskOptions, ConfigError> {
        TaskOptions::parse(self.kind, &self.options).map_err(|err| ConfigError::invalid_options(self.sequence, self.kind, err.to_string()))
    }
}

/// Validated shape of a workflow: ordered descriptors plus the log sink.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Workflow {
    pub log: Option<LogSink>,
    pub tasks: Vec<TaskDescriptor>,
}

impl Workflow {
    pub fn from_document(document: WorkflowDocument) -> Result<Self, ConfigError> {
        let tasks = document
            .tasks
            .iter()
            .enumerate()
            .map(|(index, entry)| TaskDescriptor::from_entry(index + 1, entry))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { log: document.log, tasks })
    }

    pub fn from_value(value: Value) -> Result<Self, ConfigError> {
        let document: WorkflowDocument = serde_json::from_value(value).map_err(|err| ConfigError::Malformed(err.to_string()))?;
        Self::from_document(document)
    }

    pub fn task(&self, sequence: usize) -> Option<&TaskDescriptor> {
        self.tasks.iter().find(|task| task.sequence == sequence)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn minimal_dataset_workflow() {
        let workflow = Workflow::from_value(json!({"tasks": [{"dataset": {"dataset": "Test"}}]})).expect("loads");
        assert!(workflow.log.is_none());
        assert_eq!(workflow.tasks.len(), 1);
        let task = &workflow.tasks[0];
        assert_eq!(task.sequence, 1);
        assert_eq!(task.kind, TaskKind::Dataset);
        assert_eq!(task.auth, AuthKind::Service);
        assert_eq!(task.label(), "dataset");
        assert!(matches!(task.typed_options(), Ok(TaskOptions::Dataset(_))));
    }

    #[test]
    fn aliases_and_envelope_fields() {
        let workflow = Workflow::from_value(json!({
            "log": {"bigquery": {"dataset": "Logs", "table": "Runs"}},
            "tasks": [
                {"google_api": {
                    "description": "List advertisers",
                    "auth": "user",
                    "api": "displayvideo", "version": "v2", "function": "advertisers.list",
                    "kwargs": {"partnerId": "{partner}"},
                    "kwargs_remote": {"bigquery": {"dataset": "Setup", "query": "SELECT 1", "parameters": {"partner": "0"}}}
                }}
            ]
        }))
        .expect("loads");

        assert_eq!(workflow.log.as_ref().map(|sink| sink.table.as_str()), Some("Runs"));
        let task = &workflow.tasks[0];
        assert_eq!(task.kind, TaskKind::Api);
        assert_eq!(task.auth, AuthKind::User);
        assert_eq!(task.description.as_deref(), Some("List advertisers"));
        assert_eq!(task.kwargs_remote.len(), 1);
        assert!(task.kwargs.is_some());
        assert!(!task.options.contains_key("kwargs"));
        assert!(!task.options.contains_key("description"));
        assert!(task.options.contains_key("function"));
    }

    #[test]
    fn unknown_kind_names_sequence() {
        let err = Workflow::from_value(json!({"tasks": [{"dataset": {"dataset": "a"}}, {"spreadsheet": {}}]})).expect_err("rejected");
        assert_eq!(
            err,
            ConfigError::UnknownTaskKind {
                sequence: 2,
                kind: "spreadsheet".into()
            }
        );
    }

    #[test]
    fn task_with_two_keys_is_malformed() {
        let err = Workflow::from_value(json!({"tasks": [{"dataset": {}, "query": {}}]})).expect_err("rejected");
        assert!(matches!(err, ConfigError::Malformed(_)));
    }

    #[test]
    fn unknown_top_level_key_is_malformed() {
        let err = Workflow::from_value(json!({"tasks": [], "schedule": []})).expect_err("rejected");
        assert!(matches!(err, ConfigError::Malformed(_)));
    }

    #[test]
    fn yaml_documents_load() {
        let yaml = r#"
tasks:
  - bigquery:
      run:
        query: DELETE FROM `Ops.Runs` WHERE TRUE
"#;
        let value: Value = serde_yaml::from_str(yaml).expect("yaml parses");
        let workflow = Workflow::from_value(value).expect("loads");
        assert_eq!(workflow.tasks[0].kind, TaskKind::Query);
        assert!(workflow.task(1).is_some());
        assert!(workflow.task(2).is_none());
    }
}
