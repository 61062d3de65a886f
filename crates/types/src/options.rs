//! Typed option bags, one per task kind.
//!
//! Descriptors carry options as raw JSON so templates can be expanded before
//! the bag is interpreted. [`TaskOptions::parse`] turns a (resolved) bag into
//! the struct for its kind; unknown fields are rejected everywhere.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    Row,
    destination::{Destination, warehouse_block},
    error::ConfigError,
    schema::FieldSchema,
    workflow::{AuthKind, TaskKind},
};

/// Literal keyword arguments: one object, or a list meaning one call per entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Kwargs {
    One(Row),
    Many(Vec<Row>),
}

impl Kwargs {
    /// The object form doubles as a set of literal template bindings.
    pub fn as_bindings(&self) -> Option<&Row> {
        match self {
            Self::One(row) => Some(row),
            Self::Many(_) => None,
        }
    }

    pub fn sets(&self) -> Vec<Row> {
        match self {
            Self::One(row) => vec![row.clone()],
            Self::Many(rows) => rows.clone(),
        }
    }
}

/// Warehouse query (or table) whose result feeds a task's parameters.
///
/// With `parameters` declared, each named column becomes a template binding;
/// the declared value is used when the source returns no rows. Without
/// `parameters`, an `api` task treats each row as the kwargs of one call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RemoteParameterSource {
    pub dataset: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table: Option<String>,
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub parameters: IndexMap<String, Value>,
    #[serde(default)]
    pub legacy: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<AuthKind>,
}

impl RemoteParameterSource {
    pub fn declares_parameters(&self) -> bool {
        !self.parameters.is_empty()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        match (&self.query, &self.table) {
            (Some(_), None) | (None, Some(_)) => Ok(()),
            _ => Err(ConfigError::Malformed(format!(
                "remote source in dataset '{}' needs exactly one of query or table",
                self.dataset
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DatasetOptions {
    pub dataset: String,
    #[serde(default)]
    pub delete: bool,
    #[serde(default)]
    pub clear: bool,
    #[serde(default)]
    pub emails: Vec<String>,
    #[serde(default)]
    pub groups: Vec<String>,
}

impl DatasetOptions {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.dataset.trim().is_empty() {
            return Err(ConfigError::Malformed("dataset name is empty".into()));
        }
        if self.delete && (!self.emails.is_empty() || !self.groups.is_empty()) {
            return Err(ConfigError::Malformed("cannot grant access on a dataset being deleted".into()));
        }
        Ok(())
    }
}

/// Generic REST call: `{api, version, function}` plus iteration and results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ApiOptions {
    pub api: String,
    pub version: String,
    pub function: String,
    #[serde(default)]
    pub iterate: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
    /// API key sent as the `key` query parameter, in place of the client's.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    /// Extra request headers for every call of the task.
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub headers: IndexMap<String, String>,
    /// Kwargs copied into every returned row, with their column types.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub append: Vec<FieldSchema>,
    #[serde(default, alias = "destination", deserialize_with = "warehouse_block", skip_serializing_if = "Option::is_none")]
    pub results: Option<Destination>,
}

impl ApiOptions {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.api.is_empty() || self.version.is_empty() || self.function.is_empty() {
            return Err(ConfigError::Malformed("api, version and function are required".into()));
        }
        if self.limit == Some(0) {
            return Err(ConfigError::Malformed("limit must be positive".into()));
        }
        if self.key.as_deref().is_some_and(str::is_empty) {
            return Err(ConfigError::Malformed("key must not be empty".into()));
        }
        if let Some(name) = self.headers.keys().find(|name| !is_header_name(name)) {
            return Err(ConfigError::Malformed(format!("'{name}' is not a valid header name")));
        }
        if !self.append.is_empty() && self.results.is_none() {
            return Err(ConfigError::Malformed("append has no effect without results".into()));
        }
        if let Some(results) = &self.results {
            results.validate()?;
        }
        Ok(())
    }
}

fn is_header_name(name: &str) -> bool {
    !name.is_empty() && name.bytes().all(|byte| byte.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&byte))
}

/// Query text or literal rows feeding a `query` task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QuerySource {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub values: Option<Vec<Value>>,
    #[serde(default)]
    pub legacy: bool,
    /// Literal bindings visible only to this block's placeholders.
    #[serde(default, skip_serializing_if = "Row::is_empty")]
    pub parameters: Row,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ViewTarget {
    pub dataset: String,
    pub view: String,
    #[serde(default = "default_true")]
    pub replace: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<AuthKind>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum QueryTarget {
    View(ViewTarget),
    Table(Destination),
}

/// Warehouse work: `run` a statement, or copy `from` a query or literal
/// values `to` a table or view.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QueryOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run: Option<QuerySource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<QuerySource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<QueryTarget>,
}

impl QueryOptions {
    pub fn validate(&self) -> Result<(), ConfigError> {
        match (&self.run, &self.from, &self.to) {
            (Some(run), None, None) => {
                if run.query.is_none() || run.values.is_some() {
                    return Err(ConfigError::Malformed("run requires a query and nothing else".into()));
                }
                Ok(())
            }
            (None, Some(source), Some(target)) => {
                match (&source.query, &source.values) {
                    (Some(_), None) | (None, Some(_)) => {}
                    _ => return Err(ConfigError::Malformed("from needs exactly one of query or values".into())),
                }
                match target {
                    QueryTarget::View(_) if source.values.is_some() => {
                        Err(ConfigError::Malformed("a view can only be created from a query".into()))
                    }
                    QueryTarget::View(_) => Ok(()),
                    QueryTarget::Table(destination) => destination.validate(),
                }
            }
            (None, Some(_), None) => Err(ConfigError::Malformed("from requires a to target".into())),
            _ => Err(ConfigError::Malformed("query task needs exactly one of run or from/to".into())),
        }
    }
}

/// Reporting connector target report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReportSpec {
    pub api: String,
    pub version: String,
    #[serde(default = "default_report_resource")]
    pub resource: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub report_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
    /// Extra arguments sent with every report call (account or profile ids).
    #[serde(default, skip_serializing_if = "Row::is_empty")]
    pub arguments: Row,
}

fn default_report_resource() -> String {
    "reports".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReportOptions {
    pub report: ReportSpec,
    #[serde(default)]
    pub delete: bool,
    /// Defaults to creating whenever a body is supplied.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub create: Option<bool>,
    #[serde(default)]
    pub run: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
    #[serde(default, alias = "out", deserialize_with = "warehouse_block", skip_serializing_if = "Option::is_none")]
    pub results: Option<Destination>,
}

impl ReportOptions {
    pub fn should_create(&self) -> bool {
        self.create.unwrap_or(self.report.body.is_some())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.report.report_id.is_none() && self.report.name.is_none() {
            return Err(ConfigError::Malformed("report needs a report_id or a name".into()));
        }
        if self.should_create() && self.report.body.is_none() {
            return Err(ConfigError::Malformed("creating a report requires a body".into()));
        }
        if self.limit == Some(0) {
            return Err(ConfigError::Malformed("limit must be positive".into()));
        }
        if let Some(results) = &self.results {
            results.validate()?;
        }
        Ok(())
    }
}

/// Options of one task, interpreted for its kind.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOptions {
    Dataset(DatasetOptions),
    Api(ApiOptions),
    Query(QueryOptions),
    Report(ReportOptions),
}

impl TaskOptions {
    /// Interpret a raw option bag for `kind`. Structural errors only; call
    /// [`TaskOptions::validate`] for cross-field rules.
    pub fn parse(kind: TaskKind, options: &Row) -> Result<Self, serde_json::Error> {
        let value = Value::Object(options.clone());
        Ok(match kind {
            TaskKind::Dataset => Self::Dataset(serde_json::from_value(value)?),
            TaskKind::Api => Self::Api(serde_json::from_value(value)?),
            TaskKind::Query => Self::Query(serde_json::from_value(value)?),
            TaskKind::Report => Self::Report(serde_json::from_value(value)?),
        })
    }

    pub fn kind(&self) -> TaskKind {
        match self {
            Self::Dataset(_) => TaskKind::Dataset,
            Self::Api(_) => TaskKind::Api,
            Self::Query(_) => TaskKind::Query,
            Self::Report(_) => TaskKind::Report,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        match self {
            Self::Dataset(options) => options.validate(),
            Self::Api(options) => options.validate(),
            Self::Query(options) => options.validate(),
            Self::Report(options) => options.validate(),
        }
    }

    /// Result destination, when the task writes rows to a table.
    pub fn destination(&self) -> Option<&Destination> {
        match self {
            Self::Api(options) => options.results.as_ref(),
            Self::Report(options) => options.results.as_ref(),
            Self::Query(QueryOptions {
                to: Some(QueryTarget::Table(destination)),
                ..
            }) => Some(destination),
            _ => None,
        }
    }
}
