//! Compiler configuration.
//!
//! ```toml
//! dialect = "duckdb"
//! resource_table = "resources"
//! resource_type = "Patient"
//! max_repeat_depth = 5
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::dialect::{DialectKind, validate_identifier};
use crate::error::ConfigError;

/// FHIR elements whose JSON value is an array.
const DEFAULT_ARRAY_FIELDS: &[&str] = &[
    "address",
    "answer",
    "basedOn",
    "bodySite",
    "category",
    "coding",
    "communication",
    "component",
    "contact",
    "contained",
    "derivedFrom",
    "diagnosis",
    "dosageInstruction",
    "entry",
    "extension",
    "generalPractitioner",
    "given",
    "hasMember",
    "identifier",
    "interpretation",
    "item",
    "line",
    "link",
    "modifierExtension",
    "name",
    "note",
    "parameter",
    "part",
    "participant",
    "partOf",
    "performer",
    "photo",
    "prefix",
    "profile",
    "qualification",
    "reasonCode",
    "reasonReference",
    "referenceRange",
    "security",
    "suffix",
    "tag",
    "telecom",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompilerConfig {
    /// Target dialect.
    pub dialect: DialectKind,

    /// Table holding one FHIR resource per row.
    pub resource_table: String,

    /// Key column of `resource_table`.
    pub id_column: String,

    /// JSON column of `resource_table`.
    pub resource_column: String,

    /// Fixed `resourceType` filter applied to the root stage when the
    /// expression does not start with a type name.
    pub resource_type: Option<String>,

    /// Prefix of generated CTE names.
    pub cte_prefix: String,

    /// Recursion bound for `repeat()`.
    pub max_repeat_depth: usize,

    /// Element names whose values repeat.
    pub array_fields: Vec<String>,
}

impl Default for CompilerConfig {
    fn default() -> Self {
        Self {
            dialect: DialectKind::Postgres,
            resource_table: "fhir_resources".to_string(),
            id_column: "id".to_string(),
            resource_column: "resource".to_string(),
            resource_type: None,
            cte_prefix: "cte".to_string(),
            max_repeat_depth: 10,
            array_fields: DEFAULT_ARRAY_FIELDS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl CompilerConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(toml_str: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(toml_str)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (key, value) in [
            ("resource_table", &self.resource_table),
            ("id_column", &self.id_column),
            ("resource_column", &self.resource_column),
        ] {
            validate_identifier(value)
                .map_err(|e| ConfigError::validation(format!("{key}: {e}")))?;
        }

        if !self
            .cte_prefix
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_alphabetic())
        {
            return Err(ConfigError::validation(
                "cte_prefix must start with a letter",
            ));
        }
        validate_identifier(&self.cte_prefix)
            .map_err(|e| ConfigError::validation(format!("cte_prefix: {e}")))?;

        if let Some(resource_type) = &self.resource_type {
            validate_identifier(resource_type)
                .map_err(|e| ConfigError::validation(format!("resource_type: {e}")))?;
        }

        if self.max_repeat_depth == 0 {
            return Err(ConfigError::validation("max_repeat_depth must be > 0"));
        }

        Ok(())
    }

    pub fn is_array_field(&self, name: &str) -> bool {
        self.array_fields.iter().any(|f| f == name)
    }
}
