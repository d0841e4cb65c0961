//! FHIRPath to SQL compiler for OctoFHIR.
//!
//! This crate compiles parsed FHIRPath expressions into one SQL statement
//! that evaluates the expression for every resource in a table, on
//! PostgreSQL or DuckDB.
//!
//! # Pipeline
//!
//! - [`Translator`] walks the [`ExpressionNode`] tree and emits
//!   [`SqlFragment`]s, one per pipeline stage
//! - [`CteBuilder`] wraps the fragments into a chain of [`Cte`]s
//! - [`CteAssembler`] orders the CTEs by dependency and renders
//!   `WITH ... SELECT * FROM <last>;`
//!
//! Database specifics live behind the [`Dialect`] trait. Type names used by
//! `is`, `as` and `ofType` are canonicalized by the [`TypeRegistry`].
//!
//! # Example
//!
//! ```
//! use octofhir_fhirpath_sql::{CompilerConfig, ExpressionNode, SqlCompiler};
//!
//! let compiler = SqlCompiler::new(CompilerConfig::default())?;
//! let expr = ExpressionNode::identifier("Patient")
//!     .path("name")
//!     .path("given");
//! let compiled = compiler.compile(&expr)?;
//! assert!(compiled.sql.starts_with("WITH "));
//! # Ok::<(), octofhir_fhirpath_sql::Error>(())
//! ```

pub mod ast;
pub mod compiler;
pub mod config;
pub mod cte;
pub mod dialect;
pub mod error;
pub mod fragment;
mod runner;
pub mod translator;
pub mod types;

pub use ast::{
    BinaryOperator, ExpressionNode, FunctionCallData, LiteralValue, TypeOperationData,
    TypeOperator, UnaryOperator,
};
pub use compiler::{CompiledQuery, SqlCompiler};
pub use config::CompilerConfig;
pub use cte::{Cte, CteAssembler, CteBuilder};
pub use dialect::{Dialect, DialectKind, DuckDbDialect, PostgresDialect};
pub use error::{
    Arity, AssemblyError, ConfigError, DialectError, TranslationError, ValidationError,
};
pub use fragment::{FragmentShape, SqlFragment};
pub use runner::{QueryResult, QueryRunner, ResultRow};
pub use translator::{Translation, Translator};
pub use types::{FhirPathType, TypeRegistry};

use thiserror::Error;

/// Errors that can occur while compiling or running a FHIRPath expression.
#[derive(Debug, Error)]
pub enum Error {
    /// The expression cannot be translated.
    #[error("Translation error: {0}")]
    Translation(#[from] TranslationError),

    /// The CTEs cannot be ordered into one statement.
    #[error("Assembly error: {0}")]
    Assembly(#[from] AssemblyError),

    /// A CTE or fragment is malformed.
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    /// A dialect rejected its input.
    #[error("Dialect error: {0}")]
    Dialect(#[from] DialectError),

    /// The compiler configuration is invalid.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// An error occurred while executing SQL.
    #[error("SQL execution error: {0}")]
    Sql(#[from] sqlx_core::error::Error),
}

/// Category of an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Translation,
    Assembly,
    Validation,
    Dialect,
    Config,
    Sql,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Translation(_) => ErrorKind::Translation,
            Self::Assembly(_) => ErrorKind::Assembly,
            Self::Validation(_) => ErrorKind::Validation,
            Self::Dialect(_) => ErrorKind::Dialect,
            Self::Config(_) => ErrorKind::Config,
            Self::Sql(_) => ErrorKind::Sql,
        }
    }
}

/// Result type alias using the crate's Error type.
pub type Result<T> = std::result::Result<T, Error>;
