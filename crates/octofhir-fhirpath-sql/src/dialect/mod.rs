//! SQL dialects.
//!
//! A dialect only knows how to spell things. Every method is a syntax
//! template over already-rendered SQL strings; deciding *what* to compute
//! (which type is known, when a division yields empty, how duplicates are
//! treated) belongs to the translator. Both reference dialects accept and
//! reject exactly the same inputs.

mod duckdb;
mod postgres;

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

pub use duckdb::DuckDbDialect;
pub use postgres::PostgresDialect;

use crate::error::DialectError;
use crate::types::FhirPathType;

/// Regex patterns applied to the textual form of JSON values by type checks.
pub(crate) const INTEGER_PATTERN: &str = "^-?[0-9]+$";
pub(crate) const DATE_PATTERN: &str = "^[0-9]{4}(-[0-9]{2}(-[0-9]{2})?)?$";
pub(crate) const DATETIME_PATTERN: &str =
    "^[0-9]{4}-[0-9]{2}-[0-9]{2}T[0-9]{2}(:[0-9]{2}(:[0-9]{2}(\\.[0-9]+)?)?)?(Z|[+-][0-9]{2}:[0-9]{2})?$";
pub(crate) const TIME_PATTERN: &str = "^[0-9]{2}(:[0-9]{2}(:[0-9]{2}(\\.[0-9]+)?)?)?$";

/// Which reference dialect to generate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DialectKind {
    #[default]
    Postgres,
    #[serde(alias = "duck_db")]
    DuckDb,
}

impl DialectKind {
    /// Instantiate the dialect.
    pub fn create(self) -> Arc<dyn Dialect> {
        match self {
            Self::Postgres => Arc::new(PostgresDialect),
            Self::DuckDb => Arc::new(DuckDbDialect),
        }
    }
}

impl fmt::Display for DialectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Postgres => f.write_str("postgres"),
            Self::DuckDb => f.write_str("duckdb"),
        }
    }
}

/// String functions with a fixed argument layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StringFunction {
    /// `(s)`
    Length,
    /// `(s, start)`, start is 1-based
    SubstringFrom,
    /// `(s, start, length)`, start is 1-based
    Substring,
    Upper,
    Lower,
    /// `(s, needle)`, result is 0-based, -1 when absent
    IndexOf,
    StartsWith,
    EndsWith,
    Contains,
    /// `(s, pattern, substitution)`
    Replace,
    /// `(s, regex)`
    Matches,
    /// `(s, regex, substitution)`
    ReplaceMatches,
    Trim,
    /// `(a, b)`
    Concat,
}

impl StringFunction {
    pub fn arity(self) -> usize {
        match self {
            Self::Length | Self::Upper | Self::Lower | Self::Trim => 1,
            Self::SubstringFrom
            | Self::IndexOf
            | Self::StartsWith
            | Self::EndsWith
            | Self::Contains
            | Self::Matches
            | Self::Concat => 2,
            Self::Substring | Self::Replace | Self::ReplaceMatches => 3,
        }
    }
}

/// Math functions with a fixed argument layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MathFunction {
    Abs,
    Ceiling,
    Floor,
    Sqrt,
    Ln,
    Exp,
    Truncate,
    /// `(x, base)`
    Log,
    /// `(x, exponent)`
    Power,
    /// `(x, precision)`
    Round,
}

impl MathFunction {
    pub fn arity(self) -> usize {
        match self {
            Self::Log | Self::Power | Self::Round => 2,
            _ => 1,
        }
    }
}

/// One step of a JSON navigation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathStep {
    pub name: String,
    /// The element repeats, so its value is a JSON array to flatten.
    pub repeating: bool,
}

impl PathStep {
    pub fn new(name: impl Into<String>, repeating: bool) -> Self {
        Self {
            name: name.into(),
            repeating,
        }
    }
}

/// A JSON navigation that may pass through arrays.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct JsonPath {
    /// The base value is itself an array of items.
    pub from_collection: bool,
    pub steps: Vec<PathStep>,
}

impl JsonPath {
    /// Whether navigating this path yields a JSON array of items.
    pub fn is_collection(&self) -> bool {
        self.from_collection || self.steps.iter().any(|s| s.repeating)
    }

    /// Render as a SQL/JSON path (`$[*].name[*].given`).
    pub fn render(&self) -> Result<String, DialectError> {
        let mut out = String::from("$");
        if self.from_collection {
            out.push_str("[*]");
        }
        for step in &self.steps {
            validate_path_segment(&step.name)?;
            out.push('.');
            out.push_str(&step.name);
            if step.repeating {
                out.push_str("[*]");
            }
        }
        Ok(out)
    }
}

/// Syntax generation for one target database.
///
/// Arguments are SQL text; results are SQL text. Implementations never
/// inspect FHIRPath semantics.
pub trait Dialect: Send + Sync + fmt::Debug {
    fn kind(&self) -> DialectKind;

    /// Quote a table or column identifier.
    fn quote_identifier(&self, name: &str) -> Result<String, DialectError> {
        validate_identifier(name)?;
        Ok(format!("\"{name}\""))
    }

    /// Render a string literal.
    fn string_literal(&self, value: &str) -> String {
        format!("'{}'", value.replace('\'', "''"))
    }

    /// Render a JSON document literal.
    fn json_literal(&self, json: &str) -> String;

    /// SQL type a canonical FHIRPath type is stored as.
    fn sql_type(&self, ty: FhirPathType) -> &'static str;

    // JSON navigation

    /// JSON value at `path` below `expr` (no array flattening).
    fn json_extract(&self, expr: &str, path: &[String]) -> Result<String, DialectError>;

    /// JSON array of every value reached by `path`, flattening arrays.
    fn json_path_query(&self, expr: &str, path: &JsonPath) -> Result<String, DialectError>;

    /// Text of a scalar JSON value.
    fn json_to_text(&self, expr: &str) -> String;

    /// Convert a SQL scalar to JSON.
    fn to_json(&self, expr: &str) -> String;

    /// Normalize a JSON value to an array: NULL to `[]`, scalar `x` to `[x]`.
    fn wrap_json_array(&self, expr: &str) -> String;

    fn json_array_length(&self, array: &str) -> String;

    /// Element at `index`; negative indexes count from the end.
    fn json_array_element(&self, array: &str, index: i64) -> String;

    /// FROM-clause item yielding one row per element, exposed as `alias.value`
    /// with its 1-based position as `alias.ord`.
    fn json_array_elements(&self, array: &str, alias: &str) -> String;

    /// Aggregate rows into a JSON array.
    fn json_aggregate(&self, expr: &str, distinct: bool) -> String;

    /// Whether a JSON array contains a JSON element.
    fn json_array_contains(&self, array: &str, element: &str) -> String;

    /// LATERAL join flattening the array at `path` below `column`; elements
    /// are exposed as `alias.value` and their 1-based position as `alias.ord`.
    fn unnest_json_array(
        &self,
        column: &str,
        path: &[String],
        alias: &str,
    ) -> Result<String, DialectError>;

    // Types

    /// Boolean test of a JSON value against a canonical type. NULL input yields FALSE.
    fn generate_type_check(&self, expr: &str, ty: FhirPathType) -> String;

    /// Cast a SQL text/scalar expression to a canonical type.
    fn generate_type_cast(&self, expr: &str, ty: FhirPathType) -> String;

    /// Keep the elements of a JSON array that match a canonical type.
    fn generate_collection_type_filter(&self, array: &str, ty: FhirPathType) -> String;

    /// Literal for an empty JSON collection.
    fn empty_collection(&self) -> String;

    /// Boolean test that a JSON array has no elements.
    fn generate_empty_check(&self, array: &str) -> String;

    // Set operations over JSON arrays

    /// Elements of both arrays, duplicates removed.
    fn generate_array_union(&self, left: &str, right: &str) -> String;

    /// Elements present in both arrays, duplicates removed.
    fn generate_array_intersect(&self, left: &str, right: &str) -> String;

    /// Elements of `left` not present in `right`, duplicates kept.
    fn generate_array_exclude(&self, left: &str, right: &str) -> String;

    /// Concatenation of both arrays, duplicates kept.
    fn generate_array_combine(&self, left: &str, right: &str) -> String;

    fn generate_array_distinct(&self, array: &str) -> String;

    // Arithmetic

    /// Truncating division. Callers guard against zero and NULL.
    fn generate_integer_division(&self, left: &str, right: &str) -> String;

    /// Exact division. Callers guard against zero and NULL.
    fn generate_decimal_division(&self, left: &str, right: &str) -> String;

    /// Remainder. Callers guard against zero and NULL.
    fn generate_modulo(&self, left: &str, right: &str) -> String;

    // Functions

    fn string_function(&self, func: StringFunction, args: &[&str]) -> Result<String, DialectError>;

    fn math_function(&self, func: MathFunction, args: &[&str]) -> Result<String, DialectError>;

    /// Aggregate text rows joined by a separator.
    fn string_aggregate(&self, expr: &str, separator: &str) -> String;
}

/// Validate an identifier (table or column name).
///
/// Only allows alphanumeric characters and underscores, not starting with a digit.
pub(crate) fn validate_identifier(name: &str) -> Result<(), DialectError> {
    if name.is_empty() {
        return Err(DialectError::InvalidIdentifier(
            "Empty identifier".to_string(),
        ));
    }

    let starts_ok = name
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    if !starts_ok || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(DialectError::InvalidIdentifier(name.to_string()));
    }

    Ok(())
}

/// Validate a JSON member name. FHIR element names are plain identifiers.
pub(crate) fn validate_path_segment(segment: &str) -> Result<(), DialectError> {
    validate_identifier(segment).map_err(|_| DialectError::InvalidPathSegment(segment.to_string()))
}

pub(crate) fn check_args(function: &str, expected: usize, args: &[&str]) -> Result<(), DialectError> {
    if args.len() != expected {
        return Err(DialectError::ArgumentCount {
            function: function.to_string(),
            expected,
            actual: args.len(),
        });
    }
    Ok(())
}
