//! Facade running the whole pipeline.

use std::sync::Arc;

use indexmap::IndexMap;
use tracing::debug;

use crate::Result;
use crate::ast::{ExpressionNode, LiteralValue};
use crate::config::CompilerConfig;
use crate::cte::{Cte, CteAssembler, CteBuilder};
use crate::dialect::{Dialect, DialectKind};
use crate::translator::{Translation, Translator};
use crate::types::{FhirPathType, TypeRegistry};

/// A compiled expression.
#[derive(Debug, Clone)]
pub struct CompiledQuery {
    /// The executable statement.
    pub sql: String,
    /// CTEs in emission order.
    pub ctes: Vec<Cte>,
    pub result_type: Option<FhirPathType>,
    /// Result rows carry an `id` column.
    pub keyed: bool,
    /// The `value` column holds JSON.
    pub json: bool,
    pub requires_unnest: bool,
}

/// Compiles FHIRPath expressions for one dialect.
///
/// Holds only immutable state; each call builds its own translator and CTE
/// builder, so one compiler can be shared across threads.
#[derive(Debug, Clone)]
pub struct SqlCompiler {
    dialect: Arc<dyn Dialect>,
    registry: Arc<TypeRegistry>,
    config: Arc<CompilerConfig>,
    variables: Arc<IndexMap<String, LiteralValue>>,
}

impl SqlCompiler {
    pub fn new(config: CompilerConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            dialect: config.dialect.create(),
            registry: Arc::new(TypeRegistry::new()),
            config: Arc::new(config),
            variables: Arc::new(IndexMap::new()),
        })
    }

    /// Compiler with default settings for a dialect.
    pub fn for_dialect(kind: DialectKind) -> Self {
        let config = CompilerConfig {
            dialect: kind,
            ..CompilerConfig::default()
        };
        Self {
            dialect: kind.create(),
            registry: Arc::new(TypeRegistry::new()),
            config: Arc::new(config),
            variables: Arc::new(IndexMap::new()),
        }
    }

    /// Use a custom dialect implementation. The config follows its kind.
    pub fn with_dialect(mut self, dialect: Arc<dyn Dialect>) -> Self {
        Arc::make_mut(&mut self.config).dialect = dialect.kind();
        self.dialect = dialect;
        self
    }

    /// Use a registry with additional type aliases.
    pub fn with_registry(mut self, registry: TypeRegistry) -> Self {
        self.registry = Arc::new(registry);
        self
    }

    /// Bind `%name` to a literal.
    pub fn with_variable(mut self, name: impl Into<String>, value: LiteralValue) -> Self {
        Arc::make_mut(&mut self.variables).insert(name.into(), value);
        self
    }

    pub fn dialect(&self) -> &Arc<dyn Dialect> {
        &self.dialect
    }

    pub fn config(&self) -> &CompilerConfig {
        &self.config
    }

    /// Translate an expression into fragments without assembling them.
    pub fn translate(&self, expr: &ExpressionNode) -> Result<Translation> {
        Translator::new(
            self.dialect.clone(),
            self.registry.clone(),
            self.config.clone(),
            self.variables.clone(),
        )
        .translate(expr)
    }

    /// Translate, build the CTE chain and assemble the statement.
    pub fn compile(&self, expr: &ExpressionNode) -> Result<CompiledQuery> {
        let translation = self.translate(expr)?;
        let mut builder = CteBuilder::with_prefix(self.dialect.clone(), self.config.cte_prefix.clone());
        let (ctes, requires_unnest) = builder.build_cte_chain(&translation.fragments)?;
        let sql = CteAssembler::new().assemble_query(&ctes)?;

        debug!(
            dialect = %self.dialect.kind(),
            ctes = ctes.len(),
            result_type = ?translation.result.data_type,
            "compiled expression"
        );
        Ok(CompiledQuery {
            sql,
            ctes,
            result_type: translation.result.data_type,
            keyed: translation.result.keyed,
            json: translation.result.json,
            requires_unnest,
        })
    }
}
