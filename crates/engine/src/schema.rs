//! Schema inference from sample rows and row coercion against a fixed schema.

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use indexmap::IndexMap;
use quarry_types::{FieldMode, FieldSchema, FieldType, Row, TableSchema};
use serde_json::{Number, Value};

/// Intermediate type lattice used while scanning values.
#[derive(Debug, Clone, PartialEq)]
enum Inferred {
    Unknown,
    Scalar(FieldType),
    Record(IndexMap<String, Inferred>),
    Repeated(Box<Inferred>),
    Conflict,
}

impl Inferred {
    fn of(value: &Value) -> Self {
        match value {
            Value::Null => Self::Unknown,
            Value::Bool(_) => Self::Scalar(FieldType::Boolean),
            Value::Number(number) if number.is_f64() => Self::Scalar(FieldType::Float),
            Value::Number(_) => Self::Scalar(FieldType::Integer),
            Value::String(_) => Self::Scalar(FieldType::String),
            Value::Object(map) => Self::Record(map.iter().map(|(key, item)| (key.clone(), Self::of(item))).collect()),
            Value::Array(items) => {
                let element = items.iter().fold(Self::Unknown, |acc, item| match item {
                    // Nested lists have no column representation.
                    Value::Array(_) => acc.merge(Self::Scalar(FieldType::Json)),
                    other => acc.merge(Self::of(other)),
                });
                Self::Repeated(Box::new(element))
            }
        }
    }

    fn merge(self, other: Self) -> Self {
        match (self, other) {
            (Self::Unknown, other) | (other, Self::Unknown) => other,
            (Self::Conflict, _) | (_, Self::Conflict) => Self::Conflict,
            (Self::Scalar(a), Self::Scalar(b)) if a == b => Self::Scalar(a),
            (Self::Scalar(FieldType::Integer), Self::Scalar(FieldType::Float))
            | (Self::Scalar(FieldType::Float), Self::Scalar(FieldType::Integer)) => Self::Scalar(FieldType::Float),
            (Self::Record(mut left), Self::Record(right)) => {
                for (key, item) in right {
                    let merged = match left.shift_remove(&key) {
                        Some(existing) => existing.merge(item),
                        None => item,
                    };
                    left.insert(key, merged);
                }
                Self::Record(left)
            }
            (Self::Repeated(left), Self::Repeated(right)) => Self::Repeated(Box::new(left.merge(*right))),
            _ => Self::Conflict,
        }
    }

    fn into_field(self, name: &str) -> FieldSchema {
        match self {
            Self::Unknown | Self::Conflict => FieldSchema::new(name, FieldType::String),
            Self::Scalar(field_type) => FieldSchema::new(name, field_type),
            Self::Record(fields) => record_field(name, fields),
            Self::Repeated(element) => {
                let field = match *element {
                    // A list of records keeps its sub-fields; everything else is a scalar list.
                    Self::Record(fields) => record_field(name, fields),
                    Self::Scalar(field_type) => FieldSchema::new(name, field_type),
                    _ => FieldSchema::new(name, FieldType::String),
                };
                field.with_mode(FieldMode::Repeated)
            }
        }
    }
}

fn record_field(name: &str, fields: IndexMap<String, Inferred>) -> FieldSchema {
    if fields.is_empty() {
        return FieldSchema::new(name, FieldType::Json);
    }
    let mut field = FieldSchema::new(name, FieldType::Record);
    field.fields = fields.into_iter().map(|(key, item)| item.into_field(&key)).collect();
    field
}

/// Infer a schema from `rows`.
///
/// Columns appear in first-seen order. Null-only columns become nullable
/// STRING; integer and float mix to FLOAT; any other disagreement becomes
/// STRING.
pub fn infer_schema(rows: &[Row]) -> TableSchema {
    let mut columns: IndexMap<String, Inferred> = IndexMap::new();
    for row in rows {
        for (name, value) in row {
            let current = columns.shift_remove(name).unwrap_or(Inferred::Unknown);
            columns.insert(name.clone(), current.merge(Inferred::of(value)));
        }
    }
    TableSchema::new(columns.into_iter().map(|(name, inferred)| inferred.into_field(&name)).collect())
}

/// Fits rows to a schema, counting every lossy adjustment.
#[derive(Debug)]
pub struct Coercer<'a> {
    schema: &'a TableSchema,
    warnings: usize,
    dropped_fields: IndexMap<String, usize>,
}

impl<'a> Coercer<'a> {
    pub fn new(schema: &'a TableSchema) -> Self {
        Self {
            schema,
            warnings: 0,
            dropped_fields: IndexMap::new(),
        }
    }

    pub fn warnings(&self) -> usize {
        self.warnings
    }

    /// Extra columns seen so far with how often each was dropped.
    pub fn dropped_fields(&self) -> &IndexMap<String, usize> {
        &self.dropped_fields
    }

    /// Missing columns become null, unknown columns are dropped, and values
    /// that cannot be converted become null.
    pub fn coerce_row(&mut self, mut row: Row) -> Row {
        let mut out = Row::new();
        for field in self.schema.fields() {
            let value = row.remove(&field.name).unwrap_or(Value::Null);
            out.insert(field.name.clone(), self.coerce_field(field, value));
        }
        for extra in row.keys() {
            self.warnings += 1;
            *self.dropped_fields.entry(extra.clone()).or_default() += 1;
        }
        out
    }

    fn coerce_field(&mut self, field: &FieldSchema, value: Value) -> Value {
        if value.is_null() {
            return Value::Null;
        }
        if field.mode != FieldMode::Repeated {
            return self.coerce_single(field, value);
        }
        match value {
            Value::Array(items) => Value::Array(
                items
                    .into_iter()
                    .map(|item| self.coerce_single(field, item))
                    .filter(|item| !item.is_null())
                    .collect(),
            ),
            single => {
                let item = self.coerce_single(field, single);
                if item.is_null() { Value::Null } else { Value::Array(vec![item]) }
            }
        }
    }

    fn coerce_single(&mut self, field: &FieldSchema, value: Value) -> Value {
        if value.is_null() {
            return Value::Null;
        }
        let converted = match field.field_type {
            FieldType::Json => Some(value),
            FieldType::String => Some(match value {
                Value::String(text) => Value::String(text),
                Value::Bool(flag) => Value::String(flag.to_string()),
                Value::Number(number) => Value::String(number.to_string()),
                other => Value::String(other.to_string()),
            }),
            FieldType::Integer => to_integer(&value),
            FieldType::Float | FieldType::Numeric => to_float(&value),
            FieldType::Boolean => to_boolean(&value),
            FieldType::Timestamp => to_temporal(&value, is_timestamp),
            FieldType::Datetime => to_temporal(&value, is_datetime),
            FieldType::Date => to_temporal(&value, is_date),
            FieldType::Record => match value {
                Value::Object(map) if field.fields.is_empty() => Some(Value::Object(map)),
                Value::Object(map) => {
                    let nested = TableSchema::new(field.fields.clone());
                    let mut inner = Coercer::new(&nested);
                    let row = inner.coerce_row(map);
                    self.warnings += inner.warnings;
                    Some(Value::Object(row))
                }
                _ => None,
            },
        };
        converted.unwrap_or_else(|| {
            self.warnings += 1;
            Value::Null
        })
    }
}

fn to_integer(value: &Value) -> Option<Value> {
    match value {
        Value::Number(number) if number.is_i64() || number.is_u64() => Some(Value::Number(number.clone())),
        Value::Number(number) => number
            .as_f64()
            .filter(|float| float.fract() == 0.0 && float.abs() < i64::MAX as f64)
            .map(|float| Value::from(float as i64)),
        Value::String(text) => text.trim().parse::<i64>().ok().map(Value::from),
        _ => None,
    }
}

fn to_float(value: &Value) -> Option<Value> {
    let float = match value {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse::<f64>().ok(),
        _ => None,
    }?;
    Number::from_f64(float).map(Value::Number)
}

fn to_boolean(value: &Value) -> Option<Value> {
    match value {
        Value::Bool(flag) => Some(Value::Bool(*flag)),
        Value::String(text) if text.eq_ignore_ascii_case("true") => Some(Value::Bool(true)),
        Value::String(text) if text.eq_ignore_ascii_case("false") => Some(Value::Bool(false)),
        _ => None,
    }
}

fn to_temporal(value: &Value, accepts: fn(&str) -> bool) -> Option<Value> {
    match value {
        Value::String(text) if accepts(text.trim()) => Some(Value::String(text.trim().to_string())),
        _ => None,
    }
}

fn is_date(text: &str) -> bool {
    NaiveDate::parse_from_str(text, "%Y-%m-%d").is_ok()
}

fn is_datetime(text: &str) -> bool {
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .any(|format| NaiveDateTime::parse_from_str(text, format).is_ok())
}

fn is_timestamp(text: &str) -> bool {
    DateTime::parse_from_rfc3339(text).is_ok()
        || DateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f %z").is_ok()
        || is_datetime(text)
        || is_date(text)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn rows(value: Value) -> Vec<Row> {
        value
            .as_array()
            .map(|items| items.iter().filter_map(|item| item.as_object().cloned()).collect())
            .unwrap_or_default()
    }

    fn field_type(schema: &TableSchema, name: &str) -> (FieldType, FieldMode) {
        let field = schema.field(name).expect("column present");
        (field.field_type, field.mode)
    }

    #[test]
    fn infers_scalar_types_in_first_seen_order() {
        let schema = infer_schema(&rows(json!([
            {"id": 1, "name": "a", "active": true, "score": 1},
            {"id": 2, "name": "b", "active": false, "score": 2.5, "late": null}
        ])));
        assert_eq!(schema.column_names().collect::<Vec<_>>(), vec!["id", "name", "active", "score", "late"]);
        assert_eq!(field_type(&schema, "id"), (FieldType::Integer, FieldMode::Nullable));
        assert_eq!(field_type(&schema, "active"), (FieldType::Boolean, FieldMode::Nullable));
        assert_eq!(field_type(&schema, "score"), (FieldType::Float, FieldMode::Nullable));
        assert_eq!(field_type(&schema, "late"), (FieldType::String, FieldMode::Nullable));
    }

    #[test]
    fn conflicts_become_string() {
        let schema = infer_schema(&rows(json!([{"v": 1}, {"v": "x"}, {"w": true}, {"w": {"a": 1}}])));
        assert_eq!(field_type(&schema, "v").0, FieldType::String);
        assert_eq!(field_type(&schema, "w").0, FieldType::String);
    }

    #[test]
    fn records_and_repeated() {
        let schema = infer_schema(&rows(json!([
            {"owner": {"email": "a@x"}, "tags": ["x", "y"], "items": [{"sku": "1"}]},
            {"owner": {"email": "b@x", "age": 3}, "tags": [], "items": [{"qty": 2}]}
        ])));
        let owner = schema.field("owner").expect("owner");
        assert_eq!(owner.field_type, FieldType::Record);
        assert_eq!(owner.fields.iter().map(|f| f.name.as_str()).collect::<Vec<_>>(), vec!["email", "age"]);
        assert_eq!(field_type(&schema, "tags"), (FieldType::String, FieldMode::Repeated));
        let items = schema.field("items").expect("items");
        assert_eq!((items.field_type, items.mode), (FieldType::Record, FieldMode::Repeated));
        assert_eq!(items.fields.len(), 2);
    }

    #[test]
    fn coercion_fills_drops_and_nulls_with_warnings() {
        let schema = TableSchema::new(vec![
            FieldSchema::new("id", FieldType::Integer),
            FieldSchema::new("ok", FieldType::Boolean),
            FieldSchema::new("day", FieldType::Date),
            FieldSchema::new("note", FieldType::String),
        ]);
        let mut coercer = Coercer::new(&schema);

        let row = coercer.coerce_row(rows(json!([{"id": "42", "ok": "TRUE", "day": "2024-02-30", "extra": 1}])).remove(0));
        assert_eq!(Value::Object(row), json!({"id": 42, "ok": true, "day": null, "note": null}));
        assert_eq!(coercer.warnings(), 2);
        assert_eq!(coercer.dropped_fields().get("extra"), Some(&1));

        let row = coercer.coerce_row(rows(json!([{"id": 1.5, "ok": false, "day": "2024-02-28", "note": 7}])).remove(0));
        assert_eq!(Value::Object(row), json!({"id": null, "ok": false, "day": "2024-02-28", "note": "7"}));
        assert_eq!(coercer.warnings(), 3);
    }

    #[test]
    fn repeated_columns_wrap_scalars() {
        let schema = TableSchema::new(vec![FieldSchema::new("ids", FieldType::Integer).with_mode(FieldMode::Repeated)]);
        let mut coercer = Coercer::new(&schema);
        let row = coercer.coerce_row(rows(json!([{"ids": 3}])).remove(0));
        assert_eq!(row["ids"], json!([3]));
        let row = coercer.coerce_row(rows(json!([{"ids": ["1", "x", 2]}])).remove(0));
        assert_eq!(row["ids"], json!([1, 2]));
        assert_eq!(coercer.warnings(), 1);
    }

    #[test]
    fn timestamps_accept_common_forms() {
        assert!(is_timestamp("2024-01-01T10:00:00Z"));
        assert!(is_timestamp("2024-01-01 10:00:00"));
        assert!(is_timestamp("2024-01-01"));
        assert!(!is_timestamp("yesterday"));
    }
}
