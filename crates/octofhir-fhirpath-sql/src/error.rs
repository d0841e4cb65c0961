//! Error taxonomy for the FHIRPath to SQL pipeline.
//!
//! Each pipeline stage owns one error enum so callers can branch on the
//! kind of failure without matching on message text.

use std::fmt;

use thiserror::Error;

/// Expected argument count of a FHIRPath function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Arity {
    pub min: usize,
    pub max: usize,
}

impl Arity {
    pub const fn exactly(n: usize) -> Self {
        Self { min: n, max: n }
    }

    pub const fn range(min: usize, max: usize) -> Self {
        Self { min, max }
    }

    /// Check whether `count` explicit arguments satisfy this arity.
    pub fn accepts(&self, count: usize) -> bool {
        (self.min..=self.max).contains(&count)
    }
}

impl fmt::Display for Arity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.min == self.max {
            write!(f, "exactly {}", self.min)
        } else {
            write!(f, "{} to {}", self.min, self.max)
        }
    }
}

/// Errors raised while translating a FHIRPath AST into SQL fragments.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum TranslationError {
    #[error("Unknown type '{type_name}' in {context}; valid canonical types: {}", valid.join(", "))]
    UnknownType {
        type_name: String,
        context: String,
        valid: Vec<String>,
    },

    #[error("Unknown function '{name}()'")]
    UnknownFunction { name: String },

    #[error("Function '{function}()' expects {expected} argument(s), got {actual}")]
    InvalidArity {
        function: String,
        expected: Arity,
        actual: usize,
    },

    #[error("Variable '{name}' is not bound in this scope")]
    UnboundVariable { name: String },

    #[error("Invalid argument to '{function}()': {message}")]
    InvalidArgument { function: String, message: String },

    #[error("Invalid navigation: {message}")]
    InvalidNavigation { message: String },

    #[error("Unsupported construct '{construct}': {reason}")]
    Unsupported { construct: String, reason: String },

    #[error("Operand '{operand}' of '{operator}' can hold several items; a single item is required")]
    NotSingleton { operator: String, operand: String },
}

impl TranslationError {
    pub fn unknown_function(name: impl Into<String>) -> Self {
        Self::UnknownFunction { name: name.into() }
    }

    pub fn invalid_argument(function: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            function: function.into(),
            message: message.into(),
        }
    }

    pub fn unsupported(construct: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Unsupported {
            construct: construct.into(),
            reason: reason.into(),
        }
    }

    pub fn not_singleton(operator: impl Into<String>, operand: impl Into<String>) -> Self {
        Self::NotSingleton {
            operator: operator.into(),
            operand: operand.into(),
        }
    }

    pub fn navigation(message: impl Into<String>) -> Self {
        Self::InvalidNavigation {
            message: message.into(),
        }
    }
}

/// Errors raised while ordering and rendering a CTE collection.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum AssemblyError {
    #[error("Cannot assemble a query from an empty CTE list")]
    EmptyCteList,

    #[error("CTE '{cte}' depends on '{missing}', which is not defined")]
    MissingDependency { cte: String, missing: String },

    #[error("Circular dependency detected: {}", cycle.join(" → "))]
    CircularDependency { cycle: Vec<String> },

    #[error("CTE '{name}' is defined more than once")]
    DuplicateCte { name: String },
}

/// Errors raised for malformed CTEs or fragments.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ValidationError {
    #[error("Invalid CTE name '{name}': {reason}")]
    InvalidCteName { name: String, reason: String },

    #[error("CTE '{cte}' has an empty query")]
    EmptyQuery { cte: String },

    #[error("Fragment at position {index} has an empty expression")]
    EmptyFragment { index: usize },
}

/// Errors raised by a dialect receiving malformed syntax input.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum DialectError {
    #[error("Invalid identifier: {0}")]
    InvalidIdentifier(String),

    #[error("Invalid JSON path segment: {0}")]
    InvalidPathSegment(String),

    #[error("{function} expects {expected} argument(s), got {actual}")]
    ArgumentCount {
        function: String,
        expected: usize,
        actual: usize,
    },
}

/// Errors raised while loading or validating compiler configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Validation error: {0}")]
    Validation(String),
}

impl ConfigError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arity_accepts() {
        assert!(Arity::exactly(1).accepts(1));
        assert!(!Arity::exactly(1).accepts(0));
        assert!(Arity::range(0, 1).accepts(0));
        assert!(!Arity::range(0, 1).accepts(2));
        assert!(Arity::range(2, 3).accepts(3));
    }

    #[test]
    fn test_arity_display() {
        assert_eq!(Arity::exactly(2).to_string(), "exactly 2");
        assert_eq!(Arity::range(1, 2).to_string(), "1 to 2");
    }

    #[test]
    fn test_cycle_message_lists_path() {
        let err = AssemblyError::CircularDependency {
            cycle: vec!["cte_1".into(), "cte_3".into(), "cte_2".into(), "cte_1".into()],
        };
        assert_eq!(
            err.to_string(),
            "Circular dependency detected: cte_1 → cte_3 → cte_2 → cte_1"
        );
    }

    #[test]
    fn test_arity_error_names_function() {
        let err = TranslationError::InvalidArity {
            function: "substring".into(),
            expected: Arity::range(1, 2),
            actual: 3,
        };
        assert_eq!(
            err.to_string(),
            "Function 'substring()' expects 1 to 2 argument(s), got 3"
        );
    }
}
