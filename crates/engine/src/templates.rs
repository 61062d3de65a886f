//! `{name}` placeholder parsing and substitution.
//!
//! A placeholder is an identifier in single braces. `{{` and `}}` render as
//! literal braces; any other brace (for example JSON text inside a string)
//! passes through untouched. Substitution is purely textual: the bound value
//! is rendered with [`substitution_text`] and spliced into the string.

use indexmap::IndexMap;
use once_cell::sync::Lazy;
use quarry_types::{ConfigError, Row};
use regex::{Captures, Regex};
use serde_json::Value;

static PLACEHOLDER_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{\{|\}\}|\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("placeholder regex should compile"));

/// Placeholder found while walking an option bag.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct PlaceholderRef {
    /// Dotted path of the string that contains it, e.g. `from.query` or `report.arguments.profileId`.
    pub location: String,
    pub name: String,
}

/// Name to value map used for substitution. A name can be bound once.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Bindings {
    values: IndexMap<String, Value>,
}

impl Bindings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_row(row: &Row) -> Self {
        Self {
            values: row.iter().map(|(name, value)| (name.clone(), value.clone())).collect(),
        }
    }

    pub fn bind(&mut self, name: impl Into<String>, value: Value) -> Result<(), ConfigError> {
        let name = name.into();
        if self.values.contains_key(&name) {
            return Err(ConfigError::AmbiguousBinding { name });
        }
        self.values.insert(name, value);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn to_row(&self) -> Row {
        self.values.iter().map(|(name, value)| (name.clone(), value.clone())).collect()
    }
}

/// Placeholder names in `text`, in order of appearance (duplicates kept).
pub fn extract_placeholders(text: &str) -> Vec<String> {
    PLACEHOLDER_REGEX
        .captures_iter(text)
        .filter_map(|captures| captures.get(1).map(|name| name.as_str().to_string()))
        .collect()
}

/// Text spliced in for a bound value.
///
/// Strings go in as-is, numbers and booleans by their display form, null as
/// `NULL`, and lists or objects as compact JSON, so a list of ids renders as
/// `["1","2","3"]`.
pub fn substitution_text(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        Value::Null => "NULL".to_string(),
        Value::Bool(flag) => flag.to_string(),
        Value::Number(number) => number.to_string(),
        Value::Array(_) | Value::Object(_) => value.to_string(),
    }
}

/// Substitute every placeholder in `text`.
pub fn render_text(text: &str, bindings: &Bindings, location: &str) -> Result<String, ConfigError> {
    let mut missing: Option<String> = None;
    let rendered = PLACEHOLDER_REGEX.replace_all(text, |captures: &Captures<'_>| match captures.get(1) {
        None if &captures[0] == "{{" => "{".to_string(),
        None => "}".to_string(),
        Some(name) => match bindings.get(name.as_str()) {
            Some(value) => substitution_text(value),
            None => {
                missing.get_or_insert_with(|| name.as_str().to_string());
                String::new()
            }
        },
    });
    match missing {
        Some(name) => Err(ConfigError::UnresolvedParameter {
            name,
            location: location.to_string(),
        }),
        None => Ok(rendered.into_owned()),
    }
}

/// Substitute placeholders in every string leaf of `value`. Object keys are
/// left alone.
pub fn render_value(value: &Value, bindings: &Bindings, location: &str) -> Result<Value, ConfigError> {
    Ok(match value {
        Value::String(text) => Value::String(render_text(text, bindings, location)?),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .enumerate()
                .map(|(index, item)| render_value(item, bindings, &format!("{location}[{index}]")))
                .collect::<Result<_, _>>()?,
        ),
        Value::Object(map) => Value::Object(render_row(map, bindings, location)?),
        other => other.clone(),
    })
}

pub fn render_row(row: &Row, bindings: &Bindings, location: &str) -> Result<Row, ConfigError> {
    row.iter()
        .map(|(key, item)| Ok((key.clone(), render_value(item, bindings, &join_location(location, key))?)))
        .collect()
}

/// Walk `value` and record every placeholder with the path of its string.
pub fn collect_placeholders(value: &Value, location: &str, found: &mut Vec<PlaceholderRef>) {
    match value {
        Value::String(text) => found.extend(extract_placeholders(text).into_iter().map(|name| PlaceholderRef {
            location: location.to_string(),
            name,
        })),
        Value::Array(items) => {
            for (index, item) in items.iter().enumerate() {
                collect_placeholders(item, &format!("{location}[{index}]"), found);
            }
        }
        Value::Object(map) => {
            for (key, item) in map {
                collect_placeholders(item, &join_location(location, key), found);
            }
        }
        _ => {}
    }
}

fn join_location(prefix: &str, key: &str) -> String {
    if prefix.is_empty() { key.to_string() } else { format!("{prefix}.{key}") }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn bindings(value: Value) -> Bindings {
        match value {
            Value::Object(map) => Bindings::from_row(&map),
            _ => Bindings::new(),
        }
    }

    #[test]
    fn list_binding_renders_as_json_text() {
        let rendered = render_text(
            "SELECT * FROM t WHERE id IN UNNEST({advertisers})",
            &bindings(json!({"advertisers": ["1", "2", "3"]})),
            "query",
        )
        .expect("renders");
        assert_eq!(rendered, r#"SELECT * FROM t WHERE id IN UNNEST(["1","2","3"])"#);
    }

    #[test]
    fn scalars_and_null() {
        let values = bindings(json!({"n": 5, "f": 1.5, "b": true, "s": "x", "z": null}));
        assert_eq!(render_text("{n}/{f}/{b}/{s}/{z}", &values, "t").expect("renders"), "5/1.5/true/x/NULL");
    }

    #[test]
    fn escapes_and_non_identifier_braces() {
        let values = bindings(json!({"id": 7}));
        assert_eq!(render_text("{{id}} = {id}", &values, "t").expect("renders"), "{id} = 7");
        assert_eq!(render_text(r#"{"a": 1}"#, &values, "t").expect("renders"), r#"{"a": 1}"#);
        assert!(extract_placeholders("{{id}} {1x} { id }").is_empty());
    }

    #[test]
    fn missing_binding_reports_name_and_location() {
        let err = render_text("x = {missing}", &Bindings::new(), "run.query").expect_err("unresolved");
        assert_eq!(
            err,
            ConfigError::UnresolvedParameter {
                name: "missing".into(),
                location: "run.query".into()
            }
        );
    }

    #[test]
    fn render_value_walks_nested_strings() {
        let values = bindings(json!({"day": "2024-01-01"}));
        let rendered = render_value(&json!({"body": {"dates": ["{day}", 3]}, "{day}": "k"}), &values, "").expect("renders");
        assert_eq!(rendered, json!({"body": {"dates": ["2024-01-01", 3]}, "{day}": "k"}));
    }

    #[test]
    fn collect_records_paths() {
        let mut found = Vec::new();
        collect_placeholders(&json!({"from": {"query": "{a} {b}"}, "list": ["{c}"]}), "", &mut found);
        let names: Vec<_> = found.iter().map(|r| (r.location.as_str(), r.name.as_str())).collect();
        assert_eq!(names, vec![("from.query", "a"), ("from.query", "b"), ("list[0]", "c")]);
    }

    #[test]
    fn duplicate_binding_is_ambiguous() {
        let mut values = Bindings::new();
        values.bind("x", json!(1)).expect("first bind");
        assert_eq!(values.bind("x", json!(2)), Err(ConfigError::AmbiguousBinding { name: "x".into() }));
    }

    #[test]
    fn rendering_is_idempotent() {
        let values = bindings(json!({"ids": [1, 2]}));
        let first = render_text("IN UNNEST({ids})", &values, "t").expect("renders");
        let second = render_text("IN UNNEST({ids})", &values, "t").expect("renders");
        assert_eq!(first, second);
    }
}
