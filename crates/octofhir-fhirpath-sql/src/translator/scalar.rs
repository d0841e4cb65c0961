//! Value coercions and per-item string, math and conversion functions.

use super::{Operand, Translator, Value, joined, type_label};
use crate::Result;
use crate::ast::ExpressionNode;
use crate::dialect::{INTEGER_PATTERN, JsonPath, MathFunction, StringFunction};
use crate::error::TranslationError;
use crate::types::FhirPathType;

const DECIMAL_PATTERN: &str = "^-?[0-9]+(\\.[0-9]+)?$";

fn step_names(path: &JsonPath) -> Vec<String> {
    path.steps.iter().map(|s| s.name.clone()).collect()
}

/// One operand carrying the row source and references of all of them.
pub(super) fn merged(operands: &[Operand]) -> Operand {
    operands
        .iter()
        .skip(1)
        .fold(operands.first().cloned().unwrap_or_else(Operand::empty), |acc, op| {
            joined(&acc, op)
        })
}

impl Translator {
    /// Scalar SQL of a single-item operand.
    pub(super) fn scalar_sql(&self, operand: &Operand) -> Result<String> {
        self.require_singleton("value", operand)?;
        match &operand.value {
            Value::Json { base, path } => Ok(self.dialect.json_extract(base, &step_names(path))?),
            Value::Sql { sql, .. } => Ok(sql.clone()),
            Value::Empty => Ok("NULL".to_string()),
        }
    }

    /// Rejects operands that can hold more than one item.
    pub(super) fn require_singleton(&self, operator: &str, operand: &Operand) -> Result<()> {
        if !operand.is_collection() {
            return Ok(());
        }
        let label = match &operand.value {
            Value::Json { path, .. } if !path.steps.is_empty() => step_names(path).join("."),
            _ => "collection".to_string(),
        };
        Err(TranslationError::not_singleton(operator, label).into())
    }

    /// Scalar SQL as JSON.
    pub(super) fn json_value_sql(&self, operand: &Operand) -> Result<String> {
        let sql = self.scalar_sql(operand)?;
        if operand.is_json() || operand.is_empty() {
            Ok(sql)
        } else {
            Ok(self.typed_json(&sql, operand.data_type()))
        }
    }

    /// JSON of a computed value. Literals carry no SQL type until cast.
    pub(super) fn typed_json(&self, sql: &str, data_type: Option<FhirPathType>) -> String {
        match data_type {
            Some(ty) => self
                .dialect
                .to_json(&self.dialect.generate_type_cast(sql, ty)),
            None => self.dialect.to_json(sql),
        }
    }

    pub(super) fn text_sql(&self, operand: &Operand) -> Result<String> {
        let sql = self.scalar_sql(operand)?;
        if operand.is_empty() {
            return Ok(sql);
        }
        if operand.is_json() {
            return Ok(self.dialect.json_to_text(&sql));
        }
        Ok(match operand.data_type() {
            Some(ty) if !ty.is_textual() => self.dialect.generate_type_cast(&sql, FhirPathType::String),
            _ => sql,
        })
    }

    /// Numeric type an operand computes with. JSON numbers are decimals.
    pub(super) fn numeric_type(&self, operand: &Operand) -> Option<FhirPathType> {
        if operand.is_json() {
            return Some(FhirPathType::Decimal);
        }
        operand.data_type().filter(FhirPathType::is_numeric)
    }

    pub(super) fn numeric_sql(
        &self,
        operand: &Operand,
        target: FhirPathType,
        function: &str,
    ) -> Result<String> {
        let sql = self.scalar_sql(operand)?;
        if operand.is_empty() {
            return Ok(sql);
        }
        if operand.is_json() {
            return Ok(self
                .dialect
                .generate_type_cast(&self.dialect.json_to_text(&sql), target));
        }
        match operand.data_type() {
            Some(ty) if ty == target => Ok(sql),
            Some(ty) if ty.is_numeric() => Ok(self.dialect.generate_type_cast(&sql, target)),
            _ => Err(TranslationError::invalid_argument(
                function,
                format!("expected a number, got {}", type_label(operand)),
            )
            .into()),
        }
    }

    pub(super) fn boolean_sql(&self, operand: &Operand, function: &str) -> Result<String> {
        if operand.is_empty() {
            return Ok(self
                .dialect
                .generate_type_cast("NULL", FhirPathType::Boolean));
        }
        let sql = self.scalar_sql(operand)?;
        if operand.is_json() {
            return Ok(self
                .dialect
                .generate_type_cast(&self.dialect.json_to_text(&sql), FhirPathType::Boolean));
        }
        match operand.data_type() {
            Some(FhirPathType::Boolean) => Ok(sql),
            _ => Err(TranslationError::invalid_argument(
                function,
                format!("expected a boolean, got {}", type_label(operand)),
            )
            .into()),
        }
    }

    /// The operand as a JSON array of its items.
    pub(super) fn array_sql(&self, operand: &Operand) -> Result<String> {
        let d = &self.dialect;
        match &operand.value {
            Value::Json { base, path } if path.is_collection() => Ok(format!(
                "COALESCE({}, {})",
                d.json_path_query(base, path)?,
                d.empty_collection()
            )),
            Value::Json { base, path } => {
                Ok(d.wrap_json_array(&d.json_extract(base, &step_names(path))?))
            }
            Value::Sql {
                sql,
                collection: true,
                ..
            } => Ok(sql.clone()),
            Value::Sql { sql, json: true, .. } => Ok(d.wrap_json_array(sql)),
            Value::Sql { sql, data_type, .. } => {
                Ok(d.wrap_json_array(&self.typed_json(sql, *data_type)))
            }
            Value::Empty => Ok(d.empty_collection()),
        }
    }

    pub(super) fn is_text(&self, operand: &Operand) -> bool {
        !operand.is_json() && operand.data_type().is_some_and(|t| t.is_textual())
    }

    /// Receiver plus arguments, on one row source.
    ///
    /// Returns `None` when any of them is empty.
    pub(super) fn per_item_operands(
        &mut self,
        input: Operand,
        args: &[ExpressionNode],
    ) -> Result<Option<Vec<Operand>>> {
        let mut operands = Vec::with_capacity(args.len() + 1);
        operands.push(input);
        for arg in args {
            operands.push(self.visit(arg)?);
        }
        if operands.iter().any(Operand::is_empty) {
            return Ok(None);
        }
        self.unify(operands).map(Some)
    }

    pub(super) fn string_call(
        &mut self,
        name: &str,
        input: Operand,
        args: &[ExpressionNode],
    ) -> Result<Operand> {
        let Some(operands) = self.per_item_operands(input, args)? else {
            return Ok(Operand::empty());
        };
        let out = merged(&operands);
        let s = self.text_sql(&operands[0])?;
        let d = self.dialect.clone();

        if name == "substring" {
            let start = self.numeric_sql(&operands[1], FhirPathType::Integer, name)?;
            let from = format!("({start} + 1)");
            let body = match operands.get(2) {
                Some(length) => {
                    let length = self.numeric_sql(length, FhirPathType::Integer, name)?;
                    d.string_function(StringFunction::Substring, &[&s, &from, &length])?
                }
                None => d.string_function(StringFunction::SubstringFrom, &[&s, &from])?,
            };
            let len = d.string_function(StringFunction::Length, &[&s])?;
            return Ok(out.sql(
                format!("(CASE WHEN {start} < 0 OR {start} >= {len} THEN NULL ELSE {body} END)"),
                Some(FhirPathType::String),
            ));
        }

        let mut texts = vec![s];
        for operand in &operands[1..] {
            texts.push(self.text_sql(operand)?);
        }
        let args: Vec<&str> = texts.iter().map(String::as_str).collect();

        let (func, ty) = match name {
            "length" => (StringFunction::Length, FhirPathType::Integer),
            "upper" => (StringFunction::Upper, FhirPathType::String),
            "lower" => (StringFunction::Lower, FhirPathType::String),
            "trim" => (StringFunction::Trim, FhirPathType::String),
            "indexOf" => (StringFunction::IndexOf, FhirPathType::Integer),
            "startsWith" => (StringFunction::StartsWith, FhirPathType::Boolean),
            "endsWith" => (StringFunction::EndsWith, FhirPathType::Boolean),
            "contains" => (StringFunction::Contains, FhirPathType::Boolean),
            "matches" => (StringFunction::Matches, FhirPathType::Boolean),
            "replace" => (StringFunction::Replace, FhirPathType::String),
            "replaceMatches" => (StringFunction::ReplaceMatches, FhirPathType::String),
            _ => return Err(TranslationError::unknown_function(name).into()),
        };
        Ok(out.sql(d.string_function(func, &args)?, Some(ty)))
    }

    pub(super) fn math_call(
        &mut self,
        name: &str,
        input: Operand,
        args: &[ExpressionNode],
    ) -> Result<Operand> {
        let Some(operands) = self.per_item_operands(input, args)? else {
            return Ok(Operand::empty());
        };
        let out = merged(&operands);
        let input = &operands[0];
        let ty = self.numeric_type(input).ok_or_else(|| {
            TranslationError::invalid_argument(
                name,
                format!("expected a number, got {}", type_label(input)),
            )
        })?;
        let d = self.dialect.clone();
        let x = self.numeric_sql(input, ty, name)?;
        let xd = self.numeric_sql(input, FhirPathType::Decimal, name)?;
        let arg = |i: usize, target: FhirPathType| -> Result<String> {
            match operands.get(i) {
                Some(operand) => self.numeric_sql(operand, target, name),
                None => Ok("0".to_string()),
            }
        };
        let integer = |sql: String| d.generate_type_cast(&sql, FhirPathType::Integer);

        let (sql, ty) = match name {
            "abs" => (d.math_function(MathFunction::Abs, &[&x])?, ty),
            "ceiling" => (
                integer(d.math_function(MathFunction::Ceiling, &[&x])?),
                FhirPathType::Integer,
            ),
            "floor" => (
                integer(d.math_function(MathFunction::Floor, &[&x])?),
                FhirPathType::Integer,
            ),
            "truncate" => (
                integer(d.math_function(MathFunction::Truncate, &[&x])?),
                FhirPathType::Integer,
            ),
            "round" => {
                let precision = arg(1, FhirPathType::Integer)?;
                (
                    d.math_function(MathFunction::Round, &[&xd, &precision])?,
                    FhirPathType::Decimal,
                )
            }
            "sqrt" => (
                format!(
                    "(CASE WHEN {xd} < 0 THEN NULL ELSE {} END)",
                    d.math_function(MathFunction::Sqrt, &[&xd])?
                ),
                FhirPathType::Decimal,
            ),
            "ln" => (
                format!(
                    "(CASE WHEN {xd} <= 0 THEN NULL ELSE {} END)",
                    d.math_function(MathFunction::Ln, &[&xd])?
                ),
                FhirPathType::Decimal,
            ),
            "exp" => (
                d.math_function(MathFunction::Exp, &[&xd])?,
                FhirPathType::Decimal,
            ),
            "log" => {
                let base = arg(1, FhirPathType::Decimal)?;
                (
                    format!(
                        "(CASE WHEN {xd} <= 0 OR {base} <= 0 OR {base} = 1 THEN NULL ELSE {} END)",
                        d.math_function(MathFunction::Log, &[&xd, &base])?
                    ),
                    FhirPathType::Decimal,
                )
            }
            "power" => {
                let exponent = arg(1, FhirPathType::Decimal)?;
                (
                    d.math_function(MathFunction::Power, &[&xd, &exponent])?,
                    FhirPathType::Decimal,
                )
            }
            _ => return Err(TranslationError::unknown_function(name).into()),
        };
        Ok(out.sql(sql, Some(ty)))
    }

    /// `toString()`, `toInteger()` and `toDecimal()`.
    pub(super) fn conversion(&mut self, name: &str, input: Operand) -> Result<Operand> {
        if input.is_empty() {
            return Ok(input);
        }
        let input = self.unify_one(input)?;
        let d = self.dialect.clone();
        let sql = self.scalar_sql(&input)?;
        let typed = if input.is_json() { None } else { input.data_type() };

        let (target, pattern) = match name {
            "toString" => return Ok(input.sql(self.text_sql(&input)?, Some(FhirPathType::String))),
            "toInteger" => (FhirPathType::Integer, INTEGER_PATTERN),
            "toDecimal" => (FhirPathType::Decimal, DECIMAL_PATTERN),
            _ => return Err(TranslationError::unknown_function(name).into()),
        };

        let converted = match typed {
            Some(ty) if ty == target => sql,
            Some(FhirPathType::Integer) => d.generate_type_cast(&sql, target),
            Some(FhirPathType::Boolean) => format!(
                "(CASE WHEN {sql} THEN {} WHEN NOT {sql} THEN {} END)",
                d.generate_type_cast("1", target),
                d.generate_type_cast("0", target)
            ),
            Some(FhirPathType::Decimal) => "NULL".to_string(),
            _ => {
                let text = self.text_sql(&input)?;
                let matches = d.string_function(
                    StringFunction::Matches,
                    &[&text, &d.string_literal(pattern)],
                )?;
                format!(
                    "(CASE WHEN {matches} THEN {} END)",
                    d.generate_type_cast(&text, target)
                )
            }
        };
        Ok(input.sql(converted, Some(target)))
    }
}
