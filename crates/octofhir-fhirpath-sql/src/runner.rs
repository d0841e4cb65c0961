//! Query execution against PostgreSQL.
//!
//! The runner compiles an expression with a PostgreSQL [`SqlCompiler`],
//! executes the statement and returns one JSON value per result row.

use indexmap::IndexMap;
use serde::Serialize;
use serde_json::Value;
use sqlx_core::row::Row;
use sqlx_postgres::{PgPool, PgRow};

use crate::ast::ExpressionNode;
use crate::compiler::{CompiledQuery, SqlCompiler};
use crate::dialect::DialectKind;
use crate::types::FhirPathType;
use crate::{Error, Result};

/// Executes compiled FHIRPath expressions against a PostgreSQL database.
pub struct QueryRunner {
    pool: PgPool,
    compiler: SqlCompiler,
}

impl QueryRunner {
    /// Create a runner with a default PostgreSQL compiler.
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            compiler: SqlCompiler::for_dialect(DialectKind::Postgres),
        }
    }

    /// Create a runner with a custom compiler.
    pub fn with_compiler(pool: PgPool, compiler: SqlCompiler) -> Self {
        Self { pool, compiler }
    }

    /// Compile and execute an expression.
    ///
    /// # Errors
    ///
    /// Returns an error if compilation fails or the query fails to execute.
    pub async fn run(&self, expr: &ExpressionNode) -> Result<QueryResult> {
        let compiled = self.compiler.compile(expr)?;
        self.run_compiled(&compiled).await
    }

    /// Execute an already compiled query.
    pub async fn run_compiled(&self, compiled: &CompiledQuery) -> Result<QueryResult> {
        let sql = json_projection(compiled);

        tracing::debug!(sql = %sql, "Executing FHIRPath query");

        let rows = sqlx_core::query::query(&sql)
            .fetch_all(&self.pool)
            .await
            .map_err(Error::Sql)?;

        let rows = rows
            .iter()
            .map(extract_row)
            .collect::<Result<Vec<_>>>()?;

        Ok(QueryResult {
            result_type: compiled.result_type,
            row_count: rows.len(),
            rows,
        })
    }

    /// Compile an expression and return only the SQL.
    pub fn explain(&self, expr: &ExpressionNode) -> Result<String> {
        Ok(self.compiler.compile(expr)?.sql)
    }

    /// Get a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

/// Wrap a compiled statement so every row comes back as `(TEXT, JSONB)`.
fn json_projection(compiled: &CompiledQuery) -> String {
    let statement = compiled.sql.trim_end().trim_end_matches(';');
    let id = if compiled.keyed {
        "CAST(r.id AS TEXT)"
    } else {
        "CAST(NULL AS TEXT)"
    };
    format!("SELECT {id} AS id, to_jsonb(r.value) AS value FROM ({statement}) AS r WHERE r.value IS NOT NULL")
}

fn extract_row(row: &PgRow) -> Result<ResultRow> {
    Ok(ResultRow {
        id: row.try_get::<Option<String>, _>("id")?,
        value: row
            .try_get::<Option<Value>, _>("value")?
            .unwrap_or(Value::Null),
    })
}

/// One item of the result collection.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResultRow {
    /// Resource the item belongs to; `None` for constant expressions.
    pub id: Option<String>,
    pub value: Value,
}

/// Items returned by a query.
#[derive(Debug, Clone)]
pub struct QueryResult {
    pub rows: Vec<ResultRow>,
    pub result_type: Option<FhirPathType>,
    pub row_count: usize,
}

impl QueryResult {
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// All item values, in row order.
    pub fn values(&self) -> Vec<&Value> {
        self.rows.iter().map(|r| &r.value).collect()
    }

    /// Items grouped by resource id, in order of first appearance.
    pub fn by_resource(&self) -> IndexMap<String, Vec<Value>> {
        let mut grouped: IndexMap<String, Vec<Value>> = IndexMap::new();
        for row in &self.rows {
            if let Some(id) = &row.id {
                grouped.entry(id.clone()).or_default().push(row.value.clone());
            }
        }
        grouped
    }
}
