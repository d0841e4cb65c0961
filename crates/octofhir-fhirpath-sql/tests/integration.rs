//! Integration tests for the FHIRPath to SQL compiler.
//!
//! These tests drive the public pipeline from AST to assembled statement, in
//! both dialects.

use octofhir_fhirpath_sql::{
    AssemblyError, BinaryOperator, CompilerConfig, Cte, CteAssembler, DialectKind, Error,
    ErrorKind, ExpressionNode, FhirPathType, QueryRunner, SqlCompiler, TranslationError,
};
use serde_json::{Value, json};
use sqlx_core::row::Row;
use sqlx_postgres::{PgPool, PgPoolOptions};
use std::io::Write;

/// Helper to compile an expression with the default PostgreSQL settings.
fn compile_sql(expr: &ExpressionNode) -> String {
    SqlCompiler::for_dialect(DialectKind::Postgres)
        .compile(expr)
        .expect("Failed to compile expression")
        .sql
}

/// Helper to parse an AST handed over as JSON.
fn parse_ast(value: serde_json::Value) -> ExpressionNode {
    serde_json::from_value(value).expect("Failed to parse AST")
}

fn bin(op: BinaryOperator, left: ExpressionNode, right: ExpressionNode) -> ExpressionNode {
    ExpressionNode::binary(op, left, right)
}

// =============================================================================
// Arithmetic
// =============================================================================

#[test]
fn test_integer_division_statement() {
    let sql = compile_sql(&bin(
        BinaryOperator::IntegerDivide,
        ExpressionNode::integer(5),
        ExpressionNode::integer(2),
    ));
    assert_eq!(
        sql,
        "WITH cte_1 AS (\n  SELECT CAST((CASE WHEN 5 IS NULL OR 2 IS NULL OR 2 = 0 THEN NULL \
         ELSE DIV(5, 2) END) AS BIGINT) AS value\n)\nSELECT * FROM cte_1;"
    );
}

#[test]
fn test_modulo_by_zero_is_guarded_in_both_dialects() {
    let expr = bin(
        BinaryOperator::Modulo,
        ExpressionNode::integer(5),
        ExpressionNode::integer(0),
    );
    let pg = compile_sql(&expr);
    assert!(pg.contains("WHEN 5 IS NULL OR 0 IS NULL OR 0 = 0 THEN NULL ELSE MOD(5, 0) END"));

    let duck = SqlCompiler::for_dialect(DialectKind::DuckDb)
        .compile(&expr)
        .unwrap()
        .sql;
    assert!(duck.contains("WHEN 5 IS NULL OR 0 IS NULL OR 0 = 0 THEN NULL ELSE (5 % 0) END"));
}

#[test]
fn test_decimal_promotion() {
    let compiled = SqlCompiler::for_dialect(DialectKind::Postgres)
        .compile(&bin(
            BinaryOperator::Multiply,
            ExpressionNode::integer(2),
            ExpressionNode::decimal("1.5".parse().unwrap()),
        ))
        .unwrap();
    assert_eq!(compiled.result_type, Some(FhirPathType::Decimal));
    assert!(compiled.sql.contains("(CAST(2 AS NUMERIC) * 1.5)"));
}

// =============================================================================
// Collections
// =============================================================================

#[test]
fn test_union_of_three_literals_uses_two_set_operations() {
    let expr = bin(
        BinaryOperator::Union,
        bin(
            BinaryOperator::Union,
            ExpressionNode::integer(1),
            ExpressionNode::integer(2),
        ),
        ExpressionNode::integer(3),
    );
    let compiled = SqlCompiler::for_dialect(DialectKind::Postgres)
        .compile(&expr)
        .unwrap();
    assert_eq!(compiled.sql.matches("UNION ALL").count(), 2);
    assert_eq!(compiled.ctes.len(), 1);
    assert!(!compiled.keyed);
}

#[test]
fn test_where_flattens_with_lateral_join() {
    let expr = ExpressionNode::identifier("Patient")
        .path("name")
        .method(
            "where",
            vec![bin(
                BinaryOperator::Equal,
                ExpressionNode::identifier("use"),
                ExpressionNode::string("official"),
            )],
        )
        .path("given");
    let compiled = SqlCompiler::for_dialect(DialectKind::Postgres)
        .compile(&expr)
        .unwrap();

    assert!(compiled.requires_unnest);
    assert!(compiled.sql.contains("CROSS JOIN LATERAL jsonb_array_elements("));
    assert!(compiled.sql.contains("= 'official'), FALSE)"));
    assert!(compiled.keyed);
}

#[test]
fn test_count_keeps_resources_without_items() {
    let sql = compile_sql(
        &ExpressionNode::identifier("Patient")
            .path("telecom")
            .method("count", vec![]),
    );
    assert!(sql.contains("LEFT JOIN cte_2 ON cte_2.id = cte_1.id GROUP BY cte_1.id"));
}

#[test]
fn test_chained_aggregate_after_projection() {
    let expr = ExpressionNode::identifier("Patient")
        .path("name")
        .method("select", vec![ExpressionNode::identifier("given")])
        .method("distinct", vec![])
        .method("count", vec![]);
    let compiled = SqlCompiler::for_dialect(DialectKind::Postgres)
        .compile(&expr)
        .unwrap();
    assert!(compiled.sql.contains("SELECT DISTINCT"));
    assert!(compiled.sql.contains("COUNT("));
    assert_eq!(compiled.result_type, Some(FhirPathType::Integer));
}

// =============================================================================
// Errors
// =============================================================================

#[test]
fn test_unknown_type_names_literal_and_valid_types() {
    let err = SqlCompiler::for_dialect(DialectKind::Postgres)
        .compile(&ExpressionNode::identifier("Observation").path("value").is_type("Frobnicate"))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Translation);
    let message = err.to_string();
    assert!(message.contains("'Frobnicate'"));
    assert!(message.contains("dateTime"));
}

#[test]
fn test_arity_and_unknown_function_errors() {
    let compiler = SqlCompiler::for_dialect(DialectKind::DuckDb);

    let err = compiler
        .compile(&ExpressionNode::identifier("Patient").method("first", vec![ExpressionNode::integer(1)]))
        .unwrap_err();
    assert!(matches!(
        err,
        Error::Translation(TranslationError::InvalidArity { ref function, actual: 1, .. }) if function == "first"
    ));

    let err = compiler
        .compile(&ExpressionNode::identifier("Patient").method("frobnicate", vec![]))
        .unwrap_err();
    assert_eq!(err.to_string(), "Translation error: Unknown function 'frobnicate()'");
}

#[test]
fn test_method_receiver_is_not_an_argument() {
    let expr = ExpressionNode::string("hello").method("indexOf", vec![ExpressionNode::string("l")]);
    let compiled = SqlCompiler::for_dialect(DialectKind::Postgres)
        .compile(&expr)
        .unwrap();
    assert_eq!(compiled.result_type, Some(FhirPathType::Integer));
}

#[test]
fn test_unbound_index_outside_lambda() {
    let err = SqlCompiler::for_dialect(DialectKind::Postgres)
        .compile(&ExpressionNode::variable("$index"))
        .unwrap_err();
    assert!(matches!(
        err,
        Error::Translation(TranslationError::UnboundVariable { .. })
    ));
}

#[test]
fn test_lambda_scope_does_not_leak_into_continuation() {
    // `$this` inside where() is the name; after it, identifiers navigate the
    // filtered names again rather than a stale binding.
    let expr = ExpressionNode::identifier("Patient")
        .path("name")
        .method(
            "where",
            vec![ExpressionNode::identifier("family").method("exists", vec![])],
        )
        .path("family");
    let compiled = SqlCompiler::for_dialect(DialectKind::Postgres)
        .compile(&expr)
        .unwrap();
    let last = compiled.ctes.last().unwrap();
    assert!(last.query.contains("jsonb_extract_path(cte_3.value, 'family')"));
}

// =============================================================================
// Assembly
// =============================================================================

#[test]
fn test_assembly_orders_out_of_order_ctes() {
    let ctes = vec![
        Cte::new("c", "SELECT * FROM b").unwrap().with_dependencies(["b"]),
        Cte::new("a", "SELECT 1 AS value").unwrap(),
        Cte::new("b", "SELECT * FROM a").unwrap().with_dependencies(["a"]),
    ];
    let sql = CteAssembler::new().assemble_query(&ctes).unwrap();
    let a = sql.find("a AS (").unwrap();
    let b = sql.find("b AS (").unwrap();
    let c = sql.find("c AS (").unwrap();
    assert!(a < b && b < c);
    assert!(sql.ends_with("SELECT * FROM c;"));
}

#[test]
fn test_assembly_reports_cycle_path() {
    let ctes = vec![
        Cte::new("x", "SELECT * FROM y").unwrap().with_dependencies(["y"]),
        Cte::new("y", "SELECT * FROM x").unwrap().with_dependencies(["x"]),
    ];
    let err = CteAssembler::new().assemble_query(&ctes).unwrap_err();
    match err {
        Error::Assembly(AssemblyError::CircularDependency { cycle }) => {
            assert_eq!(cycle.first(), cycle.last());
            assert!(cycle.contains(&"x".to_string()));
            assert!(cycle.contains(&"y".to_string()));
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[test]
fn test_every_cte_references_only_earlier_ctes() {
    let expr = ExpressionNode::identifier("Patient")
        .path("name")
        .path("given")
        .method("union", vec![ExpressionNode::identifier("Patient").path("name").path("family")]);
    let compiled = SqlCompiler::for_dialect(DialectKind::Postgres)
        .compile(&expr)
        .unwrap();

    for (i, cte) in compiled.ctes.iter().enumerate() {
        for dependency in &cte.depends_on {
            let position = compiled.ctes.iter().position(|c| &c.name == dependency).unwrap();
            assert!(position < i, "{} depends on later {}", cte.name, dependency);
        }
    }
}

// =============================================================================
// Dialect parity and inputs
// =============================================================================

#[test]
fn test_dialects_produce_the_same_stages() {
    let expressions = vec![
        ExpressionNode::identifier("Patient").path("name").path("given"),
        ExpressionNode::identifier("Patient").path("name").method("first", vec![]),
        ExpressionNode::identifier("Observation")
            .path("value")
            .method("ofType", vec![ExpressionNode::identifier("Quantity")]),
        ExpressionNode::identifier("Patient")
            .path("telecom")
            .method("where", vec![ExpressionNode::identifier("system").method("exists", vec![])])
            .method("count", vec![]),
    ];

    for expr in &expressions {
        let pg = SqlCompiler::for_dialect(DialectKind::Postgres).compile(expr).unwrap();
        let duck = SqlCompiler::for_dialect(DialectKind::DuckDb).compile(expr).unwrap();
        let names = |ctes: &[Cte]| ctes.iter().map(|c| c.name.clone()).collect::<Vec<_>>();
        assert_eq!(names(&pg.ctes), names(&duck.ctes));
        assert_eq!(pg.result_type, duck.result_type);
        assert_eq!(pg.keyed, duck.keyed);
    }
}

#[test]
fn test_ast_from_json() {
    let expr = parse_ast(json!({
        "functionCall": {
            "target": {
                "path": {"base": {"identifier": "Patient"}, "name": "name"}
            },
            "name": "count"
        }
    }));
    let compiled = SqlCompiler::for_dialect(DialectKind::Postgres)
        .compile(&expr)
        .unwrap();
    assert_eq!(compiled.result_type, Some(FhirPathType::Integer));
}

#[test]
fn test_config_from_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(
        file,
        "dialect = \"duckdb\"\nresource_table = \"resources\"\nresource_type = \"Patient\""
    )
    .unwrap();

    let config = CompilerConfig::from_file(file.path()).unwrap();
    let compiled = SqlCompiler::new(config)
        .unwrap()
        .compile(&ExpressionNode::identifier("gender"))
        .unwrap();
    assert!(compiled.sql.contains("FROM \"resources\" WHERE"));
    assert!(compiled.sql.contains("= 'Patient'"));
}

#[test]
fn test_duckdb_statements_are_well_formed() {
    let expressions = vec![
        ExpressionNode::identifier("Patient").path("name").path("given").method("first", vec![]),
        ExpressionNode::identifier("Patient").path("telecom").path("rank").method("max", vec![]),
        ExpressionNode::identifier("Patient")
            .path("name")
            .method(
                "where",
                vec![bin(
                    BinaryOperator::In,
                    ExpressionNode::string("Ann"),
                    ExpressionNode::identifier("given"),
                )],
            )
            .path("family"),
        bin(
            BinaryOperator::Union,
            ExpressionNode::identifier("Patient").path("gender"),
            ExpressionNode::string("unknown"),
        ),
        bin(
            BinaryOperator::Concatenate,
            ExpressionNode::string("a"),
            ExpressionNode::empty(),
        ),
    ];

    for expr in &expressions {
        let sql = SqlCompiler::for_dialect(DialectKind::DuckDb)
            .compile(expr)
            .unwrap()
            .sql;
        assert!(sql.starts_with("WITH ") && sql.ends_with(';'), "{sql}");
        assert!(parentheses_balance(&sql), "{sql}");
        for postgres_only in ["jsonb", "#>>", "WITH ORDINALITY", "@>"] {
            assert!(!sql.contains(postgres_only), "{postgres_only} in {sql}");
        }
    }
}

/// Parentheses outside string literals and quoted identifiers pair up.
fn parentheses_balance(sql: &str) -> bool {
    let mut depth = 0i64;
    let mut quote: Option<char> = None;
    for c in sql.chars() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '\'' | '"') => quote = Some(c),
            (None, '(') => depth += 1,
            (None, ')') => {
                depth -= 1;
                if depth < 0 {
                    return false;
                }
            }
            _ => {}
        }
    }
    depth == 0 && quote.is_none()
}

// =============================================================================
// Execution (PostgreSQL)
// =============================================================================

/// Pool with a temporary `fhir_resources` table holding two patients.
async fn seeded_pool() -> PgPool {
    let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
    // One connection, so the temporary table stays visible.
    let pool = PgPoolOptions::new()
        .max_connections(1)
        .connect(&url)
        .await
        .expect("Failed to connect");

    sqlx_core::query::query(
        "CREATE TEMPORARY TABLE fhir_resources (id TEXT PRIMARY KEY, resource JSONB NOT NULL)",
    )
    .execute(&pool)
    .await
    .unwrap();
    sqlx_core::query::query(
        r#"INSERT INTO fhir_resources VALUES
           ('p1', '{"resourceType": "Patient", "gender": "female",
                    "name": [{"family": "Doe", "given": ["Ann", "Bo"]}],
                    "telecom": [{"system": "phone", "rank": 9}, {"system": "email", "rank": 10}]}'),
           ('p2', '{"resourceType": "Patient"}')"#,
    )
    .execute(&pool)
    .await
    .unwrap();
    pool
}

async fn values(runner: &QueryRunner, expr: &ExpressionNode) -> Vec<Value> {
    runner
        .run(expr)
        .await
        .expect("Failed to run expression")
        .rows
        .into_iter()
        .map(|row| row.value)
        .collect()
}

async fn values_of(runner: &QueryRunner, expr: &ExpressionNode, id: &str) -> Option<Vec<Value>> {
    let result = runner.run(expr).await.expect("Failed to run expression");
    result.by_resource().get(id).cloned()
}

fn sorted(mut values: Vec<Value>) -> Vec<Value> {
    values.sort_by_key(Value::to_string);
    values
}

#[tokio::test]
#[ignore = "requires a PostgreSQL database in DATABASE_URL"]
async fn test_division_and_modulo_results() {
    let runner = QueryRunner::new(seeded_pool().await);
    let int = ExpressionNode::integer;

    assert_eq!(
        values(&runner, &bin(BinaryOperator::IntegerDivide, int(5), int(2))).await,
        vec![json!(2)]
    );

    let quotient = values(&runner, &bin(BinaryOperator::Divide, int(5), int(2))).await;
    assert_eq!(quotient.len(), 1);
    assert_eq!(quotient[0].as_f64(), Some(2.5));

    for empty in [
        bin(BinaryOperator::Divide, int(5), int(0)),
        bin(BinaryOperator::Modulo, int(10), int(0)),
        bin(BinaryOperator::Add, ExpressionNode::empty(), int(5)),
    ] {
        assert!(values(&runner, &empty).await.is_empty());
    }
}

#[tokio::test]
#[ignore = "requires a PostgreSQL database in DATABASE_URL"]
async fn test_union_keeps_duplicates_until_distinct() {
    let runner = QueryRunner::new(seeded_pool().await);
    let int = ExpressionNode::integer;
    let union = |a, b, c| {
        bin(
            BinaryOperator::Union,
            bin(BinaryOperator::Union, int(a), int(b)),
            int(c),
        )
    };

    assert_eq!(values(&runner, &union(1, 2, 3)).await.len(), 3);
    assert_eq!(
        values(&runner, &union(1, 2, 3).method("count", vec![])).await,
        vec![json!(3)]
    );
    assert_eq!(values(&runner, &union(1, 1, 2)).await.len(), 3);
    assert_eq!(
        sorted(values(&runner, &union(1, 1, 2).method("distinct", vec![])).await),
        vec![json!(1), json!(2)]
    );
}

#[tokio::test]
#[ignore = "requires a PostgreSQL database in DATABASE_URL"]
async fn test_assembled_statement_executes() {
    let pool = seeded_pool().await;
    let ctes = vec![
        Cte::new("cte_1", "SELECT 1 AS id").unwrap(),
        Cte::new("cte_2", "SELECT id FROM cte_1")
            .unwrap()
            .with_dependencies(["cte_1"]),
    ];
    let sql = CteAssembler::new().assemble_query(&ctes).unwrap();
    let rows = sqlx_core::query::query(&sql).fetch_all(&pool).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].try_get::<i32, _>("id").unwrap(), 1);
}

#[tokio::test]
#[ignore = "requires a PostgreSQL database in DATABASE_URL"]
async fn test_string_operators_results() {
    let runner = QueryRunner::new(seeded_pool().await);
    let s = ExpressionNode::string;
    let given = || ExpressionNode::identifier("Patient").path("name").path("given");

    assert_eq!(
        values(&runner, &bin(BinaryOperator::Concatenate, s("a"), ExpressionNode::empty())).await,
        vec![json!("a")]
    );
    assert_eq!(
        values(&runner, &bin(BinaryOperator::Add, s("a"), s("b"))).await,
        vec![json!("ab")]
    );
    assert_eq!(
        values(&runner, &s("abc").method("contains", vec![s("b")])).await,
        vec![json!(true)]
    );

    let contains = bin(BinaryOperator::Contains, given(), s("Ann"));
    assert_eq!(values_of(&runner, &contains, "p1").await, Some(vec![json!(true)]));
    assert_eq!(values_of(&runner, &contains, "p2").await, Some(vec![json!(false)]));

    let member = bin(BinaryOperator::In, s("Bo"), given());
    assert_eq!(values_of(&runner, &member, "p1").await, Some(vec![json!(true)]));

    let family = ExpressionNode::identifier("Patient")
        .path("name")
        .method(
            "where",
            vec![bin(BinaryOperator::In, s("Ann"), ExpressionNode::identifier("given"))],
        )
        .path("family");
    assert_eq!(values_of(&runner, &family, "p1").await, Some(vec![json!("Doe")]));
    assert_eq!(values_of(&runner, &family, "p2").await, None);

    let gender = bin(
        BinaryOperator::Union,
        ExpressionNode::identifier("Patient").path("gender"),
        s("unknown"),
    );
    let p1 = values_of(&runner, &gender, "p1").await.unwrap();
    assert_eq!(sorted(p1), vec![json!("female"), json!("unknown")]);
    assert_eq!(values_of(&runner, &gender, "p2").await, Some(vec![json!("unknown")]));
}

#[tokio::test]
#[ignore = "requires a PostgreSQL database in DATABASE_URL"]
async fn test_min_max_of_json_items() {
    let runner = QueryRunner::new(seeded_pool().await);
    let patient = || ExpressionNode::identifier("Patient");

    let given_max = patient().path("name").path("given").method("max", vec![]);
    assert_eq!(values_of(&runner, &given_max, "p1").await, Some(vec![json!("Bo")]));
    assert_eq!(values_of(&runner, &given_max, "p2").await, None);

    // 10 sorts before 9 as text.
    let rank = || patient().path("telecom").path("rank");
    assert_eq!(
        values_of(&runner, &rank().method("max", vec![]), "p1").await,
        Some(vec![json!(10)])
    );
    assert_eq!(
        values_of(&runner, &rank().method("min", vec![]), "p1").await,
        Some(vec![json!(9)])
    );
}

#[tokio::test]
#[ignore = "requires a PostgreSQL database in DATABASE_URL"]
async fn test_ranking_follows_array_order() {
    let runner = QueryRunner::new(seeded_pool().await);
    let given = || ExpressionNode::identifier("Patient").path("name").path("given");

    let first = given().method("first", vec![]);
    assert_eq!(values_of(&runner, &first, "p1").await, Some(vec![json!("Ann")]));
    let last = given().method("last", vec![]);
    assert_eq!(values_of(&runner, &last, "p1").await, Some(vec![json!("Bo")]));
    let second = given().method("skip", vec![ExpressionNode::integer(1)]);
    assert_eq!(values_of(&runner, &second, "p1").await, Some(vec![json!("Bo")]));
}
