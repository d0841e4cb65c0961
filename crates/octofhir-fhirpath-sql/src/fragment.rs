//! SQL fragments emitted by the translator.
//!
//! A fragment is either a value expression evaluated once per row of its
//! source stage ([`FragmentShape::Column`]) or a complete `SELECT`
//! ([`FragmentShape::Query`]). The shape is decided by the translator when
//! the fragment is created; nothing downstream inspects SQL text to guess it.

use indexmap::{IndexMap, IndexSet};
use serde_json::Value;

use crate::error::ValidationError;
use crate::types::FhirPathType;

/// Well-known metadata keys.
pub mod meta {
    /// Name of the CTE the fragment becomes.
    pub const RESULT_ALIAS: &str = "result_alias";
    /// Qualified column holding the JSON being flattened.
    pub const ARRAY_COLUMN: &str = "array_column";
    /// JSON path below `array_column` that holds the array.
    pub const ARRAY_PATH: &str = "array_path";
    /// Set when the stage carries a per-resource `id` column.
    pub const KEY_COLUMN: &str = "key_column";
    /// Set when the stage's `value` column holds JSON.
    pub const JSON_VALUE: &str = "json_value";
    /// Set when the stage carries a `pos` column numbering items in
    /// collection order.
    pub const POSITION_COLUMN: &str = "position_column";
}

/// Alias of the element row exposed by unnest laterals.
pub(crate) const ELEMENT_ALIAS: &str = "elem";

/// How the CTEBuilder turns a fragment into a CTE body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FragmentShape {
    /// A value expression over the source stage, wrapped in a `SELECT`.
    #[default]
    Column,
    /// A complete `SELECT`, used verbatim.
    Query,
}

/// One translated sub-expression.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SqlFragment {
    pub expression: String,
    pub source_table: Option<String>,
    pub dependencies: IndexSet<String>,
    pub requires_unnest: bool,
    pub is_collection: bool,
    pub data_type: Option<FhirPathType>,
    pub shape: FragmentShape,
    pub metadata: IndexMap<String, Value>,
}

impl SqlFragment {
    /// A value expression evaluated per row of `source`.
    pub fn column(expression: impl Into<String>, source: Option<&str>) -> Self {
        let mut fragment = Self {
            expression: expression.into(),
            source_table: source.map(str::to_string),
            ..Self::default()
        };
        if let Some(source) = source {
            fragment.dependencies.insert(source.to_string());
        }
        fragment
    }

    /// A complete `SELECT` statement.
    pub fn query(sql: impl Into<String>) -> Self {
        Self {
            expression: sql.into(),
            shape: FragmentShape::Query,
            ..Self::default()
        }
    }

    /// Array navigation: one output row per element of the array found at
    /// `path` below `column`.
    pub fn unnest(column: impl Into<String>, source: &str, path: Vec<String>) -> Self {
        let column = column.into();
        let mut fragment = Self::column(column.clone(), Some(source)).ordered(true);
        fragment.requires_unnest = true;
        fragment.is_collection = true;
        fragment
            .metadata
            .insert(meta::ARRAY_COLUMN.to_string(), Value::String(column));
        fragment.metadata.insert(
            meta::ARRAY_PATH.to_string(),
            Value::Array(path.into_iter().map(Value::String).collect()),
        );
        fragment
    }

    pub fn with_dependency(mut self, name: impl Into<String>) -> Self {
        self.dependencies.insert(name.into());
        self
    }

    pub fn with_dependencies<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies.extend(names.into_iter().map(Into::into));
        self
    }

    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.metadata
            .insert(meta::RESULT_ALIAS.to_string(), Value::String(alias.into()));
        self
    }

    pub fn with_data_type(mut self, data_type: Option<FhirPathType>) -> Self {
        self.data_type = data_type;
        self
    }

    pub fn with_collection(mut self, is_collection: bool) -> Self {
        self.is_collection = is_collection;
        self
    }

    /// Mark the stage as carrying the per-resource `id` column.
    pub fn keyed(mut self, keyed: bool) -> Self {
        if keyed {
            self.metadata
                .insert(meta::KEY_COLUMN.to_string(), Value::String("id".into()));
        } else {
            self.metadata.shift_remove(meta::KEY_COLUMN);
        }
        self
    }

    /// Mark the stage's `value` column as JSON.
    pub fn json_value(mut self, json: bool) -> Self {
        self.metadata
            .insert(meta::JSON_VALUE.to_string(), Value::Bool(json));
        self
    }

    /// Mark the stage as carrying the `pos` column.
    pub fn ordered(mut self, ordered: bool) -> Self {
        if ordered {
            self.metadata
                .insert(meta::POSITION_COLUMN.to_string(), Value::String("pos".into()));
        } else {
            self.metadata.shift_remove(meta::POSITION_COLUMN);
        }
        self
    }

    pub fn result_alias(&self) -> Option<&str> {
        self.metadata.get(meta::RESULT_ALIAS).and_then(Value::as_str)
    }

    pub fn is_keyed(&self) -> bool {
        self.metadata.contains_key(meta::KEY_COLUMN)
    }

    pub fn is_ordered(&self) -> bool {
        self.metadata.contains_key(meta::POSITION_COLUMN)
    }

    /// Path recorded for an unnest fragment.
    pub fn array_path(&self) -> Vec<String> {
        self.metadata
            .get(meta::ARRAY_PATH)
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Reject fragments whose expression is blank.
    pub fn validate(&self, index: usize) -> Result<(), ValidationError> {
        if self.expression.trim().is_empty() {
            return Err(ValidationError::EmptyFragment { index });
        }
        Ok(())
    }
}

/// `SELECT [src.id,] expr AS value [, src.pos] FROM src`.
///
/// `ordered` carries the source's `pos` column along.
pub(crate) fn select_value(source: Option<&str>, keyed: bool, ordered: bool, expr: &str) -> String {
    let Some(source) = source else {
        return format!("SELECT {expr} AS value");
    };
    let id = if keyed { format!("{source}.id, ") } else { String::new() };
    let pos = if ordered { format!(", {source}.pos") } else { String::new() };
    format!("SELECT {id}{expr} AS value{pos} FROM {source}")
}

/// `SELECT [src.id,] alias.value AS value, <rank> AS pos FROM src <lateral>`.
///
/// Items are numbered per resource by the source position, then by the
/// element ordinal the lateral exposes as `alias.ord`.
pub(crate) fn select_unnest(
    source: &str,
    keyed: bool,
    source_ordered: bool,
    lateral: &str,
    alias: &str,
) -> String {
    let (id, partition) = if keyed {
        (format!("{source}.id, "), format!("PARTITION BY {source}.id "))
    } else {
        (String::new(), String::new())
    };
    let order = if source_ordered {
        format!("{source}.pos, {alias}.ord")
    } else {
        format!("{alias}.ord")
    };
    format!(
        "SELECT {id}{alias}.value AS value, ROW_NUMBER() OVER ({partition}ORDER BY {order}) AS pos \
         FROM {source} {lateral}"
    )
}
