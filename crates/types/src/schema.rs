//! Column schema for warehouse tables.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Column value type. Names follow the warehouse's upper-case spelling; the
/// standard SQL aliases are accepted on input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FieldType {
    String,
    #[serde(alias = "INT64")]
    Integer,
    #[serde(alias = "FLOAT64")]
    Float,
    Numeric,
    #[serde(alias = "BOOL")]
    Boolean,
    Timestamp,
    Date,
    Datetime,
    #[serde(alias = "STRUCT")]
    Record,
    Json,
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::String => "STRING",
            Self::Integer => "INTEGER",
            Self::Float => "FLOAT",
            Self::Numeric => "NUMERIC",
            Self::Boolean => "BOOLEAN",
            Self::Timestamp => "TIMESTAMP",
            Self::Date => "DATE",
            Self::Datetime => "DATETIME",
            Self::Record => "RECORD",
            Self::Json => "JSON",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FieldMode {
    #[default]
    Nullable,
    Required,
    Repeated,
}

/// One column. `fields` is only meaningful for `RECORD` columns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FieldSchema {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    #[serde(default)]
    pub mode: FieldMode,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<FieldSchema>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl FieldSchema {
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            mode: FieldMode::Nullable,
            fields: Vec::new(),
            description: None,
        }
    }

    pub fn with_mode(mut self, mode: FieldMode) -> Self {
        self.mode = mode;
        self
    }
}

/// Ordered list of columns.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TableSchema(pub Vec<FieldSchema>);

impl TableSchema {
    pub fn new(fields: Vec<FieldSchema>) -> Self {
        Self(fields)
    }

    pub fn fields(&self) -> &[FieldSchema] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn field(&self, name: &str) -> Option<&FieldSchema> {
        self.0.iter().find(|field| field.name == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.field(name).is_some()
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(|field| field.name.as_str())
    }

    /// Add columns not already present, keeping existing order.
    pub fn extend_missing(&mut self, extra: &[FieldSchema]) {
        for field in extra {
            if !self.contains(&field.name) {
                self.0.push(field.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_warehouse_schema_json() {
        let schema: TableSchema = serde_json::from_str(
            r#"[
                {"name": "id", "type": "INT64", "mode": "REQUIRED"},
                {"name": "tags", "type": "STRING", "mode": "REPEATED"},
                {"name": "owner", "type": "RECORD", "fields": [{"name": "email", "type": "STRING"}]}
            ]"#,
        )
        .expect("schema parses");

        assert_eq!(schema.len(), 3);
        assert_eq!(schema.fields()[0].field_type, FieldType::Integer);
        assert_eq!(schema.fields()[0].mode, FieldMode::Required);
        assert_eq!(schema.field("owner").map(|f| f.fields.len()), Some(1));
        assert_eq!(schema.column_names().collect::<Vec<_>>(), vec!["id", "tags", "owner"]);
    }

    #[test]
    fn extend_missing_keeps_order_and_skips_duplicates() {
        let mut schema = TableSchema::new(vec![FieldSchema::new("a", FieldType::String)]);
        schema.extend_missing(&[FieldSchema::new("a", FieldType::Integer), FieldSchema::new("b", FieldType::Integer)]);
        assert_eq!(schema.column_names().collect::<Vec<_>>(), vec!["a", "b"]);
        assert_eq!(schema.fields()[0].field_type, FieldType::String);
    }
}
