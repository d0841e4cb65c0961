//! Binary operators: arithmetic, comparison, boolean logic, string
//! concatenation, membership and collection union.

use indexmap::IndexSet;

use super::scalar::merged;
use super::{Operand, Source, StageRef, StageShape, Translator, joined, type_label};
use crate::Result;
use crate::ast::{BinaryOpData, BinaryOperator, ExpressionNode};
use crate::dialect::StringFunction;
use crate::error::TranslationError;
use crate::types::FhirPathType;

impl Translator {
    pub(super) fn binary(&mut self, data: &BinaryOpData) -> Result<Operand> {
        let op = data.op;
        match op {
            BinaryOperator::Union => return self.union_operator(data),
            BinaryOperator::In => {
                let item = self.visit(&data.left)?;
                let collection = self.visit(&data.right)?;
                return self.membership(item, collection);
            }
            BinaryOperator::Contains => {
                let collection = self.visit(&data.left)?;
                let item = self.visit(&data.right)?;
                return self.membership(item, collection);
            }
            _ => {}
        }

        let left = self.visit(&data.left)?;
        let right = self.visit(&data.right)?;
        self.require_singleton(op.symbol(), &left)?;
        self.require_singleton(op.symbol(), &right)?;
        if op.is_boolean() {
            return self.boolean_operator(op, left, right);
        }
        if op == BinaryOperator::Concatenate {
            return self.concatenate(left, right);
        }
        if left.is_empty() || right.is_empty() {
            return self.empty_operand_result(op, left, right);
        }

        let (left, right) = self.unify_pair(left, right)?;
        if op.is_arithmetic() {
            self.arithmetic(op, &left, &right)
        } else {
            self.comparison(op, &left, &right)
        }
    }

    /// Result of an operator with at least one statically empty side.
    fn empty_operand_result(
        &mut self,
        op: BinaryOperator,
        left: Operand,
        right: Operand,
    ) -> Result<Operand> {
        let equivalent = match op {
            BinaryOperator::Equivalent => true,
            BinaryOperator::NotEquivalent => false,
            _ => return Ok(Operand::empty()),
        };
        let boolean = Some(FhirPathType::Boolean);
        if left.is_empty() && right.is_empty() {
            let sql = if equivalent { "TRUE" } else { "FALSE" };
            return Ok(Operand::constant(sql, boolean));
        }
        // Per row, the other side may itself be empty.
        let other = self.unify_one(if left.is_empty() { right } else { left })?;
        let sql = self.scalar_sql(&other)?;
        let test = if equivalent { "IS NULL" } else { "IS NOT NULL" };
        Ok(other.sql(format!("({sql} {test})"), boolean))
    }

    fn arithmetic(&self, op: BinaryOperator, left: &Operand, right: &Operand) -> Result<Operand> {
        let out = joined(left, right);
        let d = &self.dialect;

        if op == BinaryOperator::Add && (self.is_text(left) || self.is_text(right)) {
            let a = self.text_sql(left)?;
            let b = self.text_sql(right)?;
            return Ok(out.sql(
                d.string_function(StringFunction::Concat, &[&a, &b])?,
                Some(FhirPathType::String),
            ));
        }

        let numeric = |operand: &Operand| {
            self.numeric_type(operand).ok_or_else(|| {
                TranslationError::invalid_argument(
                    op.symbol(),
                    format!("operand of type {} is not numeric", type_label(operand)),
                )
            })
        };
        let (lt, rt) = (numeric(left)?, numeric(right)?);
        let both_integer = lt == FhirPathType::Integer && rt == FhirPathType::Integer;
        let operand_type = if both_integer {
            FhirPathType::Integer
        } else {
            FhirPathType::Decimal
        };
        let result_type = match op {
            BinaryOperator::Divide => FhirPathType::Decimal,
            BinaryOperator::IntegerDivide => FhirPathType::Integer,
            _ => operand_type,
        };
        let operand_type = if op == BinaryOperator::Divide {
            FhirPathType::Decimal
        } else {
            operand_type
        };

        let a = self.numeric_sql(left, operand_type, op.symbol())?;
        let b = self.numeric_sql(right, operand_type, op.symbol())?;
        let guarded = |expr: String| {
            format!("(CASE WHEN {a} IS NULL OR {b} IS NULL OR {b} = 0 THEN NULL ELSE {expr} END)")
        };
        let sql = match op {
            BinaryOperator::Add => format!("({a} + {b})"),
            BinaryOperator::Subtract => format!("({a} - {b})"),
            BinaryOperator::Multiply => format!("({a} * {b})"),
            BinaryOperator::Divide => guarded(d.generate_decimal_division(&a, &b)),
            BinaryOperator::IntegerDivide => d.generate_type_cast(
                &guarded(d.generate_integer_division(&a, &b)),
                FhirPathType::Integer,
            ),
            BinaryOperator::Modulo => guarded(d.generate_modulo(&a, &b)),
            _ => {
                return Err(TranslationError::unsupported(op.symbol(), "not arithmetic").into());
            }
        };
        Ok(out.sql(sql, Some(result_type)))
    }

    fn comparison(&self, op: BinaryOperator, left: &Operand, right: &Operand) -> Result<Operand> {
        let (a, b, textual) = self.comparable(left, right)?;
        let sql = match op {
            BinaryOperator::Equal => format!("({a} = {b})"),
            BinaryOperator::NotEqual => format!("({a} <> {b})"),
            BinaryOperator::LessThan => format!("({a} < {b})"),
            BinaryOperator::LessOrEqual => format!("({a} <= {b})"),
            BinaryOperator::GreaterThan => format!("({a} > {b})"),
            BinaryOperator::GreaterOrEqual => format!("({a} >= {b})"),
            BinaryOperator::Equivalent if textual => {
                format!("(LOWER({a}) IS NOT DISTINCT FROM LOWER({b}))")
            }
            BinaryOperator::Equivalent => format!("({a} IS NOT DISTINCT FROM {b})"),
            BinaryOperator::NotEquivalent if textual => {
                format!("(LOWER({a}) IS DISTINCT FROM LOWER({b}))")
            }
            BinaryOperator::NotEquivalent => format!("({a} IS DISTINCT FROM {b})"),
            _ => {
                return Err(TranslationError::unsupported(op.symbol(), "not a comparison").into());
            }
        };
        Ok(joined(left, right).sql(sql, Some(FhirPathType::Boolean)))
    }

    /// Both sides rendered in a common representation, and whether that
    /// representation is text.
    ///
    /// JSON facing a typed value is converted to that type; JSON facing JSON
    /// is compared as JSON.
    pub(super) fn comparable(
        &self,
        left: &Operand,
        right: &Operand,
    ) -> Result<(String, String, bool)> {
        match (left.is_json(), right.is_json()) {
            (true, true) => Ok((self.scalar_sql(left)?, self.scalar_sql(right)?, false)),
            (true, false) => {
                let ty = right.data_type();
                Ok((
                    self.json_as(left, ty)?,
                    self.scalar_sql(right)?,
                    ty.is_some_and(|t| t.is_textual()),
                ))
            }
            (false, true) => {
                let ty = left.data_type();
                Ok((
                    self.scalar_sql(left)?,
                    self.json_as(right, ty)?,
                    ty.is_some_and(|t| t.is_textual()),
                ))
            }
            (false, false) => {
                let (lt, rt) = (left.data_type(), right.data_type());
                let mixed_numbers = lt != rt
                    && lt.is_some_and(|t| t.is_numeric())
                    && rt.is_some_and(|t| t.is_numeric());
                if mixed_numbers {
                    return Ok((
                        self.numeric_sql(left, FhirPathType::Decimal, "comparison")?,
                        self.numeric_sql(right, FhirPathType::Decimal, "comparison")?,
                        false,
                    ));
                }
                Ok((
                    self.scalar_sql(left)?,
                    self.scalar_sql(right)?,
                    self.is_text(left) && self.is_text(right),
                ))
            }
        }
    }

    /// JSON scalar converted to the representation of `ty`.
    fn json_as(&self, operand: &Operand, ty: Option<FhirPathType>) -> Result<String> {
        let sql = self.scalar_sql(operand)?;
        let d = &self.dialect;
        Ok(match ty {
            Some(ty @ (FhirPathType::Integer | FhirPathType::Decimal)) => {
                let target = if ty == FhirPathType::Integer {
                    FhirPathType::Decimal
                } else {
                    ty
                };
                d.generate_type_cast(&d.json_to_text(&sql), target)
            }
            Some(FhirPathType::Boolean) => {
                d.generate_type_cast(&d.json_to_text(&sql), FhirPathType::Boolean)
            }
            Some(FhirPathType::Quantity) | None => sql,
            Some(_) => d.json_to_text(&sql),
        })
    }

    fn boolean_operator(
        &mut self,
        op: BinaryOperator,
        left: Operand,
        right: Operand,
    ) -> Result<Operand> {
        if left.is_empty() && right.is_empty() {
            return Ok(Operand::empty());
        }
        let (left, right) = self.unify_pair(left, right)?;
        let a = self.boolean_sql(&left, op.symbol())?;
        let b = self.boolean_sql(&right, op.symbol())?;
        let sql = match op {
            BinaryOperator::And => format!("({a} AND {b})"),
            BinaryOperator::Or => format!("({a} OR {b})"),
            BinaryOperator::Xor => format!("({a} <> {b})"),
            BinaryOperator::Implies => format!("(NOT {a} OR {b})"),
            _ => {
                return Err(TranslationError::unsupported(op.symbol(), "not a boolean operator").into());
            }
        };
        Ok(joined(&left, &right).sql(sql, Some(FhirPathType::Boolean)))
    }

    /// `&`: empty sides act as the empty string.
    fn concatenate(&mut self, left: Operand, right: Operand) -> Result<Operand> {
        let (left, right) = self.unify_pair(left, right)?;
        let text = |operand: &Operand| -> Result<String> {
            if operand.is_empty() {
                Ok("''".to_string())
            } else {
                Ok(format!("COALESCE({}, '')", self.text_sql(operand)?))
            }
        };
        let (a, b) = (text(&left)?, text(&right)?);
        let sql = self
            .dialect
            .string_function(StringFunction::Concat, &[&a, &b])?;
        Ok(joined(&left, &right).sql(sql, Some(FhirPathType::String)))
    }

    /// `item in collection` / `collection contains item`.
    pub(super) fn membership(&mut self, item: Operand, collection: Operand) -> Result<Operand> {
        if item.is_empty() {
            return Ok(Operand::empty());
        }
        if collection.is_empty() {
            return Ok(Operand::constant("FALSE", Some(FhirPathType::Boolean)));
        }
        let item = if !self.context.inline && item.is_collection() {
            self.unify_one(item)?
        } else {
            item
        };

        let same_row = match (&item.source, &collection.source) {
            (Source::Row(a), Source::Row(b)) => a.name == b.name,
            _ => true,
        };
        if self.context.inline || same_row {
            let array = self.array_sql(&collection)?;
            let element = self.json_value_sql(&item)?;
            return Ok(joined(&item, &collection).sql(
                self.dialect.json_array_contains(&array, &element),
                Some(FhirPathType::Boolean),
            ));
        }

        let stage = self.materialize(&collection)?;
        let alias = self.context.next_local("m");
        let candidate = StageRef {
            name: alias.clone(),
            ..stage.clone()
        };
        let element = Operand::from_stage(&candidate);
        let (a, b, _) = self.comparable(&element, &item)?;

        let correlation = match item.source.stage() {
            Some(row) if row.keyed && stage.keyed => format!("{alias}.id = {} AND ", row.id()),
            _ => String::new(),
        };
        let sql = format!(
            "EXISTS (SELECT 1 FROM {} AS {alias} WHERE {correlation}{a} = {b})",
            stage.name
        );
        let mut out = item.sql(sql, Some(FhirPathType::Boolean));
        out.refs.insert(stage.name.clone());
        Ok(out)
    }

    /// `a | b | c`: one stage stacking every branch, duplicates kept.
    fn union_operator(&mut self, data: &BinaryOpData) -> Result<Operand> {
        let mut nodes = Vec::new();
        flatten_union(&data.left, &mut nodes);
        flatten_union(&data.right, &mut nodes);

        let mut operands = Vec::with_capacity(nodes.len());
        for node in nodes {
            let operand = self.visit(node)?;
            if !operand.is_empty() {
                operands.push(operand);
            }
        }
        if operands.is_empty() {
            return Ok(Operand::empty());
        }

        if self.context.inline {
            let mut array = self.array_sql(&operands[0])?;
            for operand in &operands[1..] {
                array = self
                    .dialect
                    .generate_array_combine(&array, &self.array_sql(operand)?);
            }
            return Ok(merged(&operands).json_array(array));
        }

        // Each branch: the row source and the value expression over it.
        let mut branches = Vec::with_capacity(operands.len());
        for operand in &operands {
            if operand.is_collection() {
                let stage = self.materialize(operand)?;
                let branch = Operand::from_stage(&stage);
                branches.push(branch);
            } else {
                branches.push(operand.clone());
            }
        }

        let types: Vec<Option<FhirPathType>> = branches
            .iter()
            .map(|b| if b.is_json() { None } else { b.data_type() })
            .collect();
        let all_numeric = types.iter().all(|t| t.is_some_and(|t| t.is_numeric()));
        let same_type = types.windows(2).all(|w| w[0] == w[1]);
        let json = branches.iter().any(Operand::is_json) || !(same_type || all_numeric);
        let data_type = match (json, same_type) {
            (true, _) => None,
            (false, true) => types[0],
            (false, false) if types.contains(&Some(FhirPathType::Decimal)) => {
                Some(FhirPathType::Decimal)
            }
            (false, false) => Some(FhirPathType::Integer),
        };

        let root = branches
            .iter()
            .filter_map(|b| b.source.stage())
            .find(|s| s.keyed)
            .map(|s| s.root_name().to_string());

        let mut deps = IndexSet::new();
        if let Some(root) = &root {
            deps.insert(root.clone());
        }
        let mut selects = Vec::with_capacity(branches.len());
        for (i, branch) in branches.iter().enumerate() {
            deps.extend(branch.refs.iter().cloned());
            let mut value = if json {
                self.json_value_sql(branch)?
            } else {
                self.scalar_sql(branch)?
            };
            if let (false, Some(ty)) = (json, data_type)
                && branch.data_type() != Some(ty)
            {
                value = self.dialect.generate_type_cast(&value, ty);
            }
            let select = match (branch.source.stage(), &root) {
                (Some(stage), _) if stage.keyed => {
                    format!("SELECT {}.id AS id, {value} AS value FROM {}", stage.name, stage.name)
                }
                (Some(stage), Some(root)) => format!(
                    "SELECT {root}.id AS id, {value} AS value FROM {root} CROSS JOIN {}",
                    stage.name
                ),
                (Some(stage), None) => format!("SELECT {value} AS value FROM {}", stage.name),
                (None, Some(root)) => {
                    format!("SELECT {root}.id AS id, {value} AS value FROM {root}")
                }
                (None, None) => format!("SELECT {value} AS value"),
            };
            selects.push(format!("SELECT * FROM ({select}) AS u{}", i + 1));
        }

        let stage = self.emit_query(
            selects.join(" UNION ALL "),
            &deps,
            StageShape {
                keyed: root.is_some(),
                root,
                json,
                data_type,
                collection: true,
                ..StageShape::default()
            },
        );
        Ok(Operand::from_stage(&stage))
    }
}

fn flatten_union<'a>(node: &'a ExpressionNode, out: &mut Vec<&'a ExpressionNode>) {
    match node {
        ExpressionNode::BinaryOp(data) if data.op == BinaryOperator::Union => {
            flatten_union(&data.left, out);
            flatten_union(&data.right, out);
        }
        other => out.push(other),
    }
}
