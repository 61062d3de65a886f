//! Warehouse targets: where task results and the execution log are written.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};

use crate::{error::ConfigError, schema::TableSchema, workflow::AuthKind};

/// Fully qualified table name within the configured project.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TableRef {
    pub dataset: String,
    pub table: String,
}

impl TableRef {
    pub fn new(dataset: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            dataset: dataset.into(),
            table: table.into(),
        }
    }

    /// Staging table used by replace and merge writes.
    pub fn staging(&self) -> Self {
        Self::new(self.dataset.clone(), format!("{}_STAGE", self.table))
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.dataset, self.table)
    }
}

/// How rows land in the target table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteDisposition {
    /// Add rows, never removing existing ones.
    Append,
    /// Truncate the target and write exactly the new rows.
    Replace,
    /// Upsert on `keys`; rows with other keys are left untouched.
    Merge { keys: Vec<String> },
}

impl fmt::Display for WriteDisposition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Append => f.write_str("append"),
            Self::Replace => f.write_str("replace"),
            Self::Merge { keys } => write!(f, "merge on [{}]", keys.join(", ")),
        }
    }
}

/// Result target of a task: `{dataset, table, schema?, disposition flags}`.
///
/// In descriptors this appears either bare or wrapped as
/// `{"warehouse": {...}}` (`bigquery` is accepted as the older spelling).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Destination {
    pub dataset: String,
    pub table: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<AuthKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<TableSchema>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disposition: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merge: Option<Vec<String>>,
    #[serde(default)]
    pub replace: bool,
    #[serde(default)]
    pub append: bool,
}

impl Destination {
    pub fn new(dataset: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            dataset: dataset.into(),
            table: table.into(),
            auth: None,
            schema: None,
            disposition: None,
            merge: None,
            replace: false,
            append: false,
        }
    }

    pub fn table_ref(&self) -> TableRef {
        TableRef::new(self.dataset.clone(), self.table.clone())
    }

    /// Pick the write disposition from the destination's flags.
    ///
    /// Every flag that is set must agree; nothing set means [`WriteDisposition::Replace`].
    pub fn write_disposition(&self) -> Result<WriteDisposition, ConfigError> {
        let mut selected: Vec<WriteDisposition> = Vec::new();

        if let Some(keys) = &self.merge {
            if keys.is_empty() {
                return Err(ConfigError::InvalidDisposition("merge requires at least one key column".into()));
            }
            selected.push(WriteDisposition::Merge { keys: keys.clone() });
        }
        if self.replace {
            selected.push(WriteDisposition::Replace);
        }
        if self.append {
            selected.push(WriteDisposition::Append);
        }
        if let Some(name) = &self.disposition {
            let parsed = match name.to_ascii_lowercase().as_str() {
                "write_append" | "append" => WriteDisposition::Append,
                "write_truncate" | "replace" | "truncate" => WriteDisposition::Replace,
                "merge" => match &self.merge {
                    Some(keys) => WriteDisposition::Merge { keys: keys.clone() },
                    None => return Err(ConfigError::InvalidDisposition("merge disposition without key columns".into())),
                },
                other => return Err(ConfigError::InvalidDisposition(format!("unknown disposition '{other}'"))),
            };
            selected.push(parsed);
        }

        let Some(first) = selected.first().cloned() else {
            return Ok(WriteDisposition::Replace);
        };
        if let Some(conflict) = selected.iter().find(|candidate| **candidate != first) {
            return Err(ConfigError::InvalidDisposition(format!("conflicting selections: {first} and {conflict}")));
        }
        Ok(first)
    }

    /// Static checks: disposition flags agree and merge keys exist in a declared schema.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.dataset.trim().is_empty() || self.table.trim().is_empty() {
            return Err(ConfigError::Malformed("destination requires a dataset and a table".into()));
        }
        if let (WriteDisposition::Merge { keys }, Some(schema)) = (self.write_disposition()?, &self.schema)
            && let Some(missing) = keys.iter().find(|key| !schema.contains(key))
        {
            return Err(ConfigError::InvalidDisposition(format!("merge key '{missing}' is not a column of the schema")));
        }
        Ok(())
    }
}

/// Table receiving the execution log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LogSink {
    pub dataset: String,
    pub table: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<AuthKind>,
}

impl LogSink {
    pub fn table_ref(&self) -> TableRef {
        TableRef::new(self.dataset.clone(), self.table.clone())
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum WarehouseBlock<T> {
    Wrapped {
        #[serde(alias = "bigquery")]
        warehouse: T,
    },
    Direct(T),
}

impl<T> WarehouseBlock<T> {
    fn into_inner(self) -> T {
        match self {
            Self::Wrapped { warehouse } => warehouse,
            Self::Direct(inner) => inner,
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany<T> {
    One(WarehouseBlock<T>),
    Many(Vec<WarehouseBlock<T>>),
}

/// Accept `T` either bare or wrapped in `{"warehouse": T}` / `{"bigquery": T}`.
pub(crate) fn warehouse_block<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Ok(Option::<WarehouseBlock<T>>::deserialize(deserializer)?.map(WarehouseBlock::into_inner))
}

/// Like [`warehouse_block`] but also accepts a list of blocks.
pub(crate) fn warehouse_blocks<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Ok(match Option::<OneOrMany<T>>::deserialize(deserializer)? {
        None => Vec::new(),
        Some(OneOrMany::One(block)) => vec![block.into_inner()],
        Some(OneOrMany::Many(blocks)) => blocks.into_iter().map(WarehouseBlock::into_inner).collect(),
    })
}
