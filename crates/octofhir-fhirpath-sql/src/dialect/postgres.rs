//! PostgreSQL JSONB dialect.

use super::{
    DATE_PATTERN, DATETIME_PATTERN, Dialect, DialectKind, INTEGER_PATTERN, JsonPath,
    MathFunction, StringFunction, TIME_PATTERN, check_args, validate_path_segment,
};
use crate::error::DialectError;
use crate::types::FhirPathType;

#[derive(Debug, Clone, Copy, Default)]
pub struct PostgresDialect;

impl PostgresDialect {
    fn text_matches(&self, expr: &str, pattern: &str) -> String {
        format!(
            "jsonb_typeof({expr}) = 'string' AND {} ~ '{pattern}'",
            self.json_to_text(expr)
        )
    }
}

impl Dialect for PostgresDialect {
    fn kind(&self) -> DialectKind {
        DialectKind::Postgres
    }

    fn json_literal(&self, json: &str) -> String {
        format!("{}::jsonb", self.string_literal(json))
    }

    fn sql_type(&self, ty: FhirPathType) -> &'static str {
        match ty {
            FhirPathType::Boolean => "BOOLEAN",
            FhirPathType::Integer => "BIGINT",
            FhirPathType::Decimal => "NUMERIC",
            FhirPathType::Quantity => "JSONB",
            // Temporal values stay ISO-8601 text so partial precision survives.
            FhirPathType::String
            | FhirPathType::Uri
            | FhirPathType::Base64Binary
            | FhirPathType::Date
            | FhirPathType::DateTime
            | FhirPathType::Time => "TEXT",
        }
    }

    fn json_extract(&self, expr: &str, path: &[String]) -> Result<String, DialectError> {
        if path.is_empty() {
            return Ok(expr.to_string());
        }
        let mut keys = Vec::with_capacity(path.len());
        for segment in path {
            validate_path_segment(segment)?;
            keys.push(format!("'{segment}'"));
        }
        Ok(format!("jsonb_extract_path({expr}, {})", keys.join(", ")))
    }

    fn json_path_query(&self, expr: &str, path: &JsonPath) -> Result<String, DialectError> {
        Ok(format!(
            "jsonb_path_query_array({expr}, '{}')",
            path.render()?
        ))
    }

    fn json_to_text(&self, expr: &str) -> String {
        format!("({expr} #>> '{{}}')")
    }

    fn to_json(&self, expr: &str) -> String {
        format!("to_jsonb({expr})")
    }

    fn wrap_json_array(&self, expr: &str) -> String {
        format!(
            "(CASE WHEN {expr} IS NULL THEN '[]'::jsonb \
             WHEN jsonb_typeof({expr}) = 'array' THEN {expr} \
             ELSE jsonb_build_array({expr}) END)"
        )
    }

    fn json_array_length(&self, array: &str) -> String {
        format!("jsonb_array_length({array})")
    }

    fn json_array_element(&self, array: &str, index: i64) -> String {
        format!("({array} -> {index})")
    }

    fn json_array_elements(&self, array: &str, alias: &str) -> String {
        format!("jsonb_array_elements({array}) WITH ORDINALITY AS {alias}(value, ord)")
    }

    fn json_aggregate(&self, expr: &str, distinct: bool) -> String {
        if distinct {
            format!("jsonb_agg(DISTINCT {expr})")
        } else {
            format!("jsonb_agg({expr})")
        }
    }

    fn json_array_contains(&self, array: &str, element: &str) -> String {
        format!("({array} @> jsonb_build_array({element}))")
    }

    fn unnest_json_array(
        &self,
        column: &str,
        path: &[String],
        alias: &str,
    ) -> Result<String, DialectError> {
        let source = self.json_extract(column, path)?;
        Ok(format!(
            "CROSS JOIN LATERAL jsonb_array_elements({}) WITH ORDINALITY AS {alias}(value, ord)",
            self.wrap_json_array(&source)
        ))
    }

    fn generate_type_check(&self, expr: &str, ty: FhirPathType) -> String {
        let text = self.json_to_text(expr);
        let body = match ty {
            FhirPathType::Boolean => format!("jsonb_typeof({expr}) = 'boolean'"),
            FhirPathType::Integer => format!(
                "jsonb_typeof({expr}) = 'number' AND {text} ~ '{INTEGER_PATTERN}'"
            ),
            FhirPathType::Decimal => format!(
                "jsonb_typeof({expr}) = 'number' AND {text} !~ '{INTEGER_PATTERN}'"
            ),
            FhirPathType::String | FhirPathType::Uri | FhirPathType::Base64Binary => {
                format!("jsonb_typeof({expr}) = 'string'")
            }
            FhirPathType::Date => self.text_matches(expr, DATE_PATTERN),
            FhirPathType::DateTime => self.text_matches(expr, DATETIME_PATTERN),
            FhirPathType::Time => self.text_matches(expr, TIME_PATTERN),
            FhirPathType::Quantity => format!(
                "jsonb_typeof({expr}) = 'object' AND ({expr} -> 'value') IS NOT NULL"
            ),
        };
        format!("COALESCE(({body}), FALSE)")
    }

    fn generate_type_cast(&self, expr: &str, ty: FhirPathType) -> String {
        format!("CAST({expr} AS {})", self.sql_type(ty))
    }

    fn generate_collection_type_filter(&self, array: &str, ty: FhirPathType) -> String {
        format!(
            "(SELECT COALESCE(jsonb_agg(f.value), '[]'::jsonb) FROM jsonb_array_elements({array}) AS f(value) WHERE {})",
            self.generate_type_check("f.value", ty)
        )
    }

    fn empty_collection(&self) -> String {
        "'[]'::jsonb".to_string()
    }

    fn generate_empty_check(&self, array: &str) -> String {
        format!("(jsonb_array_length({array}) = 0)")
    }

    fn generate_array_union(&self, left: &str, right: &str) -> String {
        format!(
            "(SELECT COALESCE(jsonb_agg(DISTINCT u.value), '[]'::jsonb) FROM \
             (SELECT jsonb_array_elements({left}) AS value UNION ALL SELECT jsonb_array_elements({right})) AS u)"
        )
    }

    fn generate_array_intersect(&self, left: &str, right: &str) -> String {
        format!(
            "(SELECT COALESCE(jsonb_agg(i.value), '[]'::jsonb) FROM \
             (SELECT jsonb_array_elements({left}) AS value INTERSECT SELECT jsonb_array_elements({right})) AS i)"
        )
    }

    fn generate_array_exclude(&self, left: &str, right: &str) -> String {
        format!(
            "(SELECT COALESCE(jsonb_agg(x.value), '[]'::jsonb) FROM jsonb_array_elements({left}) AS x(value) \
             WHERE NOT ({right} @> jsonb_build_array(x.value)))"
        )
    }

    fn generate_array_combine(&self, left: &str, right: &str) -> String {
        format!("({left} || {right})")
    }

    fn generate_array_distinct(&self, array: &str) -> String {
        format!(
            "(SELECT COALESCE(jsonb_agg(DISTINCT d.value), '[]'::jsonb) FROM jsonb_array_elements({array}) AS d(value))"
        )
    }

    fn generate_integer_division(&self, left: &str, right: &str) -> String {
        format!("DIV({left}, {right})")
    }

    fn generate_decimal_division(&self, left: &str, right: &str) -> String {
        format!("({left} / {right})")
    }

    fn generate_modulo(&self, left: &str, right: &str) -> String {
        format!("MOD({left}, {right})")
    }

    fn string_function(&self, func: StringFunction, args: &[&str]) -> Result<String, DialectError> {
        check_args(&format!("{func:?}"), func.arity(), args)?;
        let sql = match func {
            StringFunction::Length => format!("LENGTH({})", args[0]),
            StringFunction::SubstringFrom => format!("SUBSTRING({} FROM {})", args[0], args[1]),
            StringFunction::Substring => {
                format!("SUBSTRING({} FROM {} FOR {})", args[0], args[1], args[2])
            }
            StringFunction::Upper => format!("UPPER({})", args[0]),
            StringFunction::Lower => format!("LOWER({})", args[0]),
            StringFunction::IndexOf => format!("(STRPOS({}, {}) - 1)", args[0], args[1]),
            StringFunction::StartsWith => format!("STARTS_WITH({}, {})", args[0], args[1]),
            StringFunction::EndsWith => {
                format!("(RIGHT({0}, LENGTH({1})) = {1})", args[0], args[1])
            }
            StringFunction::Contains => format!("(STRPOS({}, {}) > 0)", args[0], args[1]),
            StringFunction::Replace => {
                format!("REPLACE({}, {}, {})", args[0], args[1], args[2])
            }
            StringFunction::Matches => format!("({} ~ {})", args[0], args[1]),
            StringFunction::ReplaceMatches => format!(
                "REGEXP_REPLACE({}, {}, {}, 'g')",
                args[0], args[1], args[2]
            ),
            StringFunction::Trim => format!("TRIM({})", args[0]),
            StringFunction::Concat => format!("({} || {})", args[0], args[1]),
        };
        Ok(sql)
    }

    fn math_function(&self, func: MathFunction, args: &[&str]) -> Result<String, DialectError> {
        check_args(&format!("{func:?}"), func.arity(), args)?;
        let sql = match func {
            MathFunction::Abs => format!("ABS({})", args[0]),
            MathFunction::Ceiling => format!("CEIL({})", args[0]),
            MathFunction::Floor => format!("FLOOR({})", args[0]),
            MathFunction::Sqrt => format!("SQRT({})", args[0]),
            MathFunction::Ln => format!("LN({})", args[0]),
            MathFunction::Exp => format!("EXP({})", args[0]),
            MathFunction::Truncate => format!("TRUNC({})", args[0]),
            MathFunction::Log => format!("LOG({}, {})", args[1], args[0]),
            MathFunction::Power => format!("POWER({}, {})", args[0], args[1]),
            MathFunction::Round => {
                format!("ROUND(CAST({} AS NUMERIC), {})", args[0], args[1])
            }
        };
        Ok(sql)
    }

    fn string_aggregate(&self, expr: &str, separator: &str) -> String {
        format!("STRING_AGG({expr}, {separator})")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialect::PathStep;

    #[test]
    fn test_division_and_modulo_syntax() {
        let d = PostgresDialect;
        assert_eq!(d.generate_integer_division("a", "b"), "DIV(a, b)");
        assert_eq!(d.generate_modulo("a", "b"), "MOD(a, b)");
        assert_eq!(d.generate_decimal_division("a", "b"), "(a / b)");
    }

    #[test]
    fn test_json_navigation() {
        let d = PostgresDialect;
        let path = vec!["name".to_string(), "family".to_string()];
        assert_eq!(
            d.json_extract("r.value", &path).unwrap(),
            "jsonb_extract_path(r.value, 'name', 'family')"
        );
        assert_eq!(d.json_extract("r.value", &[]).unwrap(), "r.value");

        let query = JsonPath {
            from_collection: false,
            steps: vec![PathStep::new("name", true), PathStep::new("given", true)],
        };
        assert_eq!(
            d.json_path_query("r.value", &query).unwrap(),
            "jsonb_path_query_array(r.value, '$.name[*].given[*]')"
        );
        assert_eq!(d.json_to_text("x"), "(x #>> '{}')");
    }

    #[test]
    fn test_unnest_uses_lateral_elements() {
        let sql = PostgresDialect
            .unnest_json_array("cte_1.value", &["name".to_string()], "elem")
            .unwrap();
        assert!(sql.starts_with("CROSS JOIN LATERAL jsonb_array_elements("));
        assert!(sql.ends_with("WITH ORDINALITY AS elem(value, ord)"));
        assert!(sql.contains("jsonb_extract_path(cte_1.value, 'name')"));
    }

    #[test]
    fn test_type_check_is_null_safe() {
        let check = PostgresDialect.generate_type_check("v", FhirPathType::Integer);
        assert!(check.starts_with("COALESCE(("));
        assert!(check.ends_with(", FALSE)"));
        assert!(check.contains("jsonb_typeof(v) = 'number'"));
    }

    #[test]
    fn test_string_functions() {
        let d = PostgresDialect;
        assert_eq!(
            d.string_function(StringFunction::IndexOf, &["s", "'x'"]).unwrap(),
            "(STRPOS(s, 'x') - 1)"
        );
        assert_eq!(
            d.string_function(StringFunction::Substring, &["s", "2", "3"])
                .unwrap(),
            "SUBSTRING(s FROM 2 FOR 3)"
        );
        assert!(matches!(
            d.string_function(StringFunction::Upper, &[]),
            Err(DialectError::ArgumentCount { expected: 1, actual: 0, .. })
        ));
    }

    #[test]
    fn test_literals() {
        let d = PostgresDialect;
        assert_eq!(d.string_literal("O'Brien"), "'O''Brien'");
        assert_eq!(d.json_literal("[1]"), "'[1]'::jsonb");
        assert_eq!(d.quote_identifier("resource").unwrap(), "\"resource\"");
    }
}
