//! DuckDB JSON dialect.

use super::{
    DATE_PATTERN, DATETIME_PATTERN, Dialect, DialectKind, INTEGER_PATTERN, JsonPath,
    MathFunction, StringFunction, TIME_PATTERN, check_args, validate_path_segment,
};
use crate::error::DialectError;
use crate::types::FhirPathType;

#[derive(Debug, Clone, Copy, Default)]
pub struct DuckDbDialect;

impl DuckDbDialect {
    fn text_matches(&self, expr: &str, pattern: &str) -> String {
        format!(
            "json_type({expr}) = 'VARCHAR' AND regexp_matches({}, '{pattern}')",
            self.json_to_text(expr)
        )
    }

    /// JSON array as a DuckDB list of JSON values.
    fn as_list(&self, array: &str) -> String {
        format!("json_extract({array}, '$[*]')")
    }
}

impl Dialect for DuckDbDialect {
    fn kind(&self) -> DialectKind {
        DialectKind::DuckDb
    }

    fn json_literal(&self, json: &str) -> String {
        format!("{}::JSON", self.string_literal(json))
    }

    fn sql_type(&self, ty: FhirPathType) -> &'static str {
        match ty {
            FhirPathType::Boolean => "BOOLEAN",
            FhirPathType::Integer => "BIGINT",
            FhirPathType::Decimal => "DOUBLE",
            FhirPathType::Quantity => "JSON",
            FhirPathType::String
            | FhirPathType::Uri
            | FhirPathType::Base64Binary
            | FhirPathType::Date
            | FhirPathType::DateTime
            | FhirPathType::Time => "VARCHAR",
        }
    }

    fn json_extract(&self, expr: &str, path: &[String]) -> Result<String, DialectError> {
        if path.is_empty() {
            return Ok(expr.to_string());
        }
        for segment in path {
            validate_path_segment(segment)?;
        }
        Ok(format!("json_extract({expr}, '$.{}')", path.join(".")))
    }

    fn json_path_query(&self, expr: &str, path: &JsonPath) -> Result<String, DialectError> {
        Ok(format!("to_json(json_extract({expr}, '{}'))", path.render()?))
    }

    fn json_to_text(&self, expr: &str) -> String {
        format!("json_extract_string({expr}, '$')")
    }

    fn to_json(&self, expr: &str) -> String {
        format!("to_json({expr})")
    }

    fn wrap_json_array(&self, expr: &str) -> String {
        format!(
            "(CASE WHEN {expr} IS NULL THEN '[]'::JSON \
             WHEN json_type({expr}) = 'ARRAY' THEN {expr} \
             ELSE to_json([{expr}]) END)"
        )
    }

    fn json_array_length(&self, array: &str) -> String {
        format!("json_array_length({array})")
    }

    fn json_array_element(&self, array: &str, index: i64) -> String {
        if index < 0 {
            format!("json_extract({array}, '$[#{index}]')")
        } else {
            format!("json_extract({array}, '$[{index}]')")
        }
    }

    fn json_array_elements(&self, array: &str, alias: &str) -> String {
        let list = self.as_list(array);
        format!("(SELECT unnest({list}) AS value, generate_subscripts({list}, 1) AS ord) AS {alias}")
    }

    fn json_aggregate(&self, expr: &str, distinct: bool) -> String {
        if distinct {
            format!("to_json(list(DISTINCT {expr}))")
        } else {
            format!("to_json(list({expr}))")
        }
    }

    fn json_array_contains(&self, array: &str, element: &str) -> String {
        format!("list_contains({}, {element})", self.as_list(array))
    }

    fn unnest_json_array(
        &self,
        column: &str,
        path: &[String],
        alias: &str,
    ) -> Result<String, DialectError> {
        let source = self.json_extract(column, path)?;
        let list = self.as_list(&self.wrap_json_array(&source));
        Ok(format!(
            "CROSS JOIN LATERAL (SELECT unnest({list}) AS value, generate_subscripts({list}, 1) AS ord) AS {alias}"
        ))
    }

    fn generate_type_check(&self, expr: &str, ty: FhirPathType) -> String {
        let body = match ty {
            FhirPathType::Boolean => format!("json_type({expr}) = 'BOOLEAN'"),
            FhirPathType::Integer => format!(
                "json_type({expr}) IN ('BIGINT', 'UBIGINT') AND regexp_matches({}, '{INTEGER_PATTERN}')",
                self.json_to_text(expr)
            ),
            FhirPathType::Decimal => format!("json_type({expr}) = 'DOUBLE'"),
            FhirPathType::String | FhirPathType::Uri | FhirPathType::Base64Binary => {
                format!("json_type({expr}) = 'VARCHAR'")
            }
            FhirPathType::Date => self.text_matches(expr, DATE_PATTERN),
            FhirPathType::DateTime => self.text_matches(expr, DATETIME_PATTERN),
            FhirPathType::Time => self.text_matches(expr, TIME_PATTERN),
            FhirPathType::Quantity => format!(
                "json_type({expr}) = 'OBJECT' AND json_extract({expr}, '$.value') IS NOT NULL"
            ),
        };
        format!("COALESCE(({body}), FALSE)")
    }

    fn generate_type_cast(&self, expr: &str, ty: FhirPathType) -> String {
        format!("CAST({expr} AS {})", self.sql_type(ty))
    }

    fn generate_collection_type_filter(&self, array: &str, ty: FhirPathType) -> String {
        format!(
            "to_json(list_filter({}, f -> {}))",
            self.as_list(array),
            self.generate_type_check("f", ty)
        )
    }

    fn empty_collection(&self) -> String {
        "'[]'::JSON".to_string()
    }

    fn generate_empty_check(&self, array: &str) -> String {
        format!("(json_array_length({array}) = 0)")
    }

    fn generate_array_union(&self, left: &str, right: &str) -> String {
        format!(
            "to_json(list_distinct(list_concat({}, {})))",
            self.as_list(left),
            self.as_list(right)
        )
    }

    fn generate_array_intersect(&self, left: &str, right: &str) -> String {
        format!(
            "to_json(list_distinct(list_intersect({}, {})))",
            self.as_list(left),
            self.as_list(right)
        )
    }

    fn generate_array_exclude(&self, left: &str, right: &str) -> String {
        format!(
            "to_json(list_filter({}, x -> NOT list_contains({}, x)))",
            self.as_list(left),
            self.as_list(right)
        )
    }

    fn generate_array_combine(&self, left: &str, right: &str) -> String {
        format!(
            "to_json(list_concat({}, {}))",
            self.as_list(left),
            self.as_list(right)
        )
    }

    fn generate_array_distinct(&self, array: &str) -> String {
        format!("to_json(list_distinct({}))", self.as_list(array))
    }

    fn generate_integer_division(&self, left: &str, right: &str) -> String {
        format!("TRUNC({left} / {right})")
    }

    fn generate_decimal_division(&self, left: &str, right: &str) -> String {
        format!("({left} / {right})")
    }

    fn generate_modulo(&self, left: &str, right: &str) -> String {
        format!("({left} % {right})")
    }

    fn string_function(&self, func: StringFunction, args: &[&str]) -> Result<String, DialectError> {
        check_args(&format!("{func:?}"), func.arity(), args)?;
        let sql = match func {
            StringFunction::Length => format!("LENGTH({})", args[0]),
            StringFunction::SubstringFrom => format!("SUBSTRING({}, {})", args[0], args[1]),
            StringFunction::Substring => {
                format!("SUBSTRING({}, {}, {})", args[0], args[1], args[2])
            }
            StringFunction::Upper => format!("UPPER({})", args[0]),
            StringFunction::Lower => format!("LOWER({})", args[0]),
            StringFunction::IndexOf => format!("(INSTR({}, {}) - 1)", args[0], args[1]),
            StringFunction::StartsWith => format!("STARTS_WITH({}, {})", args[0], args[1]),
            StringFunction::EndsWith => format!("ENDS_WITH({}, {})", args[0], args[1]),
            StringFunction::Contains => format!("CONTAINS({}, {})", args[0], args[1]),
            StringFunction::Replace => {
                format!("REPLACE({}, {}, {})", args[0], args[1], args[2])
            }
            StringFunction::Matches => format!("REGEXP_MATCHES({}, {})", args[0], args[1]),
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
            MathFunction::Log => format!("(LN({}) / LN({}))", args[0], args[1]),
            MathFunction::Power => format!("POW({}, {})", args[0], args[1]),
            MathFunction::Round => format!("ROUND({}, {})", args[0], args[1]),
        };
        Ok(sql)
    }

    fn string_aggregate(&self, expr: &str, separator: &str) -> String {
        format!("STRING_AGG({expr}, {separator})")
    }
}
