//! Common Table Expressions and their assembly into one statement.

mod assembler;
mod builder;

pub use assembler::CteAssembler;
pub use builder::CteBuilder;

use indexmap::IndexMap;
use serde_json::Value;

use crate::error::ValidationError;
use crate::fragment::SqlFragment;

/// A named, orderable SQL building block.
#[derive(Debug, Clone, PartialEq)]
pub struct Cte {
    pub name: String,
    pub query: String,
    pub depends_on: Vec<String>,
    pub requires_unnest: bool,
    pub metadata: IndexMap<String, Value>,
    pub source_fragment: Option<Box<SqlFragment>>,
}

impl Cte {
    /// Create a CTE with no dependencies.
    ///
    /// The name must be a plain identifier; a trailing `;` on the query is
    /// stripped so the body can be embedded in a `WITH` clause.
    pub fn new(name: impl Into<String>, query: impl Into<String>) -> Result<Self, ValidationError> {
        let name = name.into();
        let query = normalize_query(&query.into());
        let cte = Self {
            name,
            query,
            depends_on: Vec::new(),
            requires_unnest: false,
            metadata: IndexMap::new(),
            source_fragment: None,
        };
        cte.validate()?;
        Ok(cte)
    }

    pub fn with_dependencies<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for name in names {
            self.add_dependency(name);
        }
        self
    }

    /// Add a dependency unless it is already listed.
    pub fn add_dependency(&mut self, name: impl Into<String>) {
        let name = name.into();
        if !self.depends_on.contains(&name) {
            self.depends_on.push(name);
        }
    }

    /// Check the name and query rules.
    pub fn validate(&self) -> Result<(), ValidationError> {
        validate_cte_name(&self.name)?;
        if self.query.trim().is_empty() {
            return Err(ValidationError::EmptyQuery {
                cte: self.name.clone(),
            });
        }
        Ok(())
    }
}

fn normalize_query(query: &str) -> String {
    query.trim().trim_end_matches(';').trim_end().to_string()
}

fn validate_cte_name(name: &str) -> Result<(), ValidationError> {
    let invalid = |reason: &str| ValidationError::InvalidCteName {
        name: name.to_string(),
        reason: reason.to_string(),
    };

    let Some(first) = name.chars().next() else {
        return Err(invalid("name is empty"));
    };
    if !first.is_ascii_alphabetic() {
        return Err(invalid("must start with a letter"));
    }
    if !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(invalid("only letters, digits and underscores are allowed"));
    }
    Ok(())
}
