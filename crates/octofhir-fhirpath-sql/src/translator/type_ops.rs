//! `is`, `as` and `ofType`.
//!
//! Type names go through the registry first; only canonical types reach the
//! dialect. A typed operand is answered statically. JSON is checked at run
//! time, and a choice element (`value`) is also looked up under its typed
//! FHIR name (`valueQuantity`).

use indexmap::IndexSet;

use super::functions::item_columns;
use super::{Operand, StageShape, Translator, Value, joined};
use crate::Result;
use crate::ast::{ExpressionNode, LiteralValue, TypeOperationData, TypeOperator};
use crate::error::TranslationError;
use crate::types::FhirPathType;

/// `value` + `Quantity` = `valueQuantity`.
fn choice_element(name: &str, ty: FhirPathType) -> String {
    let mut chars = ty.as_str().chars();
    match chars.next() {
        Some(first) => format!("{name}{}{}", first.to_ascii_uppercase(), chars.as_str()),
        None => name.to_string(),
    }
}

/// Type name written as a function argument: `Quantity`, `FHIR.string` or `'code'`.
fn type_name_arg(node: &ExpressionNode) -> Option<String> {
    match node {
        ExpressionNode::Identifier(name) => Some(name.clone()),
        ExpressionNode::Path { base, name } => match base.as_ref() {
            ExpressionNode::Identifier(ns) => Some(format!("{ns}.{name}")),
            _ => None,
        },
        ExpressionNode::Literal(LiteralValue::String(name)) => Some(name.clone()),
        _ => None,
    }
}

/// The operand with its last navigation step renamed.
fn renamed(operand: &Operand, name: String) -> Option<Operand> {
    let Value::Json { base, path } = &operand.value else {
        return None;
    };
    let mut path = path.clone();
    path.steps.last_mut()?.name = name;
    Some(operand.with_value(Value::Json {
        base: base.clone(),
        path,
    }))
}

impl Translator {
    pub(super) fn type_operation(&mut self, data: &TypeOperationData) -> Result<Operand> {
        let op = data.op.to_string();
        let ty = self.resolve_type(&data.type_name, &op)?;
        let input = self.visit(&data.expression)?;
        match data.op {
            TypeOperator::Is => self.is_type(input, ty),
            TypeOperator::As => self.as_type(input, ty),
        }
    }

    /// Function forms `is(T)` and `as(T)`.
    pub(super) fn type_function(
        &mut self,
        name: &str,
        input: Operand,
        arg: &ExpressionNode,
    ) -> Result<Operand> {
        let ty = self.type_argument(name, arg)?;
        if name == "is" {
            self.is_type(input, ty)
        } else {
            self.as_type(input, ty)
        }
    }

    pub(super) fn of_type(&mut self, input: Operand, arg: &ExpressionNode) -> Result<Operand> {
        let ty = self.type_argument("ofType", arg)?;
        if input.is_empty() {
            return Ok(input);
        }
        if let Some(actual) = input.data_type() {
            return Ok(if actual == ty { input } else { Operand::empty() });
        }
        if !input.is_json() {
            return Ok(Operand::empty());
        }

        let (plain, typed) = self.choice_parts(input, ty)?;
        if !plain.is_collection() {
            let sql = self.json_filter(&plain, typed.as_ref(), ty)?;
            return Ok(merged_pair(&plain, typed.as_ref()).json_sql(sql));
        }

        if self.context.inline {
            let array = self.array_sql(&plain)?;
            return Ok(plain.json_array(self.dialect.generate_collection_type_filter(&array, ty)));
        }

        let stage = self.materialize(&plain)?;
        let s = &stage.name;
        let sql = format!(
            "SELECT {} FROM {s} WHERE {}",
            item_columns(&stage),
            self.dialect.generate_type_check(&stage.value(), ty)
        );
        let mut deps = IndexSet::new();
        deps.insert(s.clone());
        let out = self.emit_query(
            sql,
            &deps,
            StageShape::like(&stage)
                .collection(true)
                .ordered(stage.ordered),
        );
        Ok(Operand::from_stage(&out))
    }

    fn type_argument(&self, function: &str, arg: &ExpressionNode) -> Result<FhirPathType> {
        let name = type_name_arg(arg).ok_or_else(|| {
            TranslationError::invalid_argument(function, "expected a type name")
        })?;
        self.resolve_type(&name, function)
    }

    fn resolve_type(&self, name: &str, context: &str) -> Result<FhirPathType> {
        self.registry.resolve_to_canonical(name).ok_or_else(|| {
            TranslationError::UnknownType {
                type_name: name.to_string(),
                context: context.to_string(),
                valid: self.registry.canonical_names(),
            }
            .into()
        })
    }

    fn is_type(&mut self, input: Operand, ty: FhirPathType) -> Result<Operand> {
        if input.is_empty() {
            return Ok(input);
        }
        let boolean = Some(FhirPathType::Boolean);
        if input.data_type().is_some() || !input.is_json() {
            let matched = if input.data_type() == Some(ty) { "TRUE" } else { "FALSE" };
            if input.is_constant() {
                return Ok(input.sql(matched, boolean));
            }
            let input = self.unify_one(input)?;
            let v = self.scalar_sql(&input)?;
            return Ok(input.sql(format!("(CASE WHEN {v} IS NOT NULL THEN {matched} END)"), boolean));
        }

        let (plain, typed) = self.choice_parts(input, ty)?;
        let plain = self.unify_one(plain)?;
        let v = self.scalar_sql(&plain)?;
        let check = self.dialect.generate_type_check(&v, ty);
        let sql = match &typed {
            Some(typed) => format!(
                "(CASE WHEN {} IS NOT NULL THEN TRUE WHEN {v} IS NOT NULL THEN {check} END)",
                self.scalar_sql(typed)?
            ),
            None => format!("(CASE WHEN {v} IS NOT NULL THEN {check} END)"),
        };
        Ok(merged_pair(&plain, typed.as_ref()).sql(sql, boolean))
    }

    fn as_type(&mut self, input: Operand, ty: FhirPathType) -> Result<Operand> {
        if input.is_empty() {
            return Ok(input);
        }
        if let Some(actual) = input.data_type() {
            return Ok(if actual == ty { input } else { Operand::empty() });
        }
        if !input.is_json() {
            return Ok(Operand::empty());
        }

        let (plain, typed) = self.choice_parts(input, ty)?;
        let plain = self.unify_one(plain)?;
        let json = self.json_filter(&plain, typed.as_ref(), ty)?;
        let out = merged_pair(&plain, typed.as_ref());
        if ty == FhirPathType::Quantity {
            return Ok(out.with_value(Value::Sql {
                sql: json,
                data_type: Some(ty),
                json: true,
                collection: false,
            }));
        }
        let d = &self.dialect;
        let text = d.json_to_text(&json);
        let sql = if ty.is_textual() {
            text
        } else {
            d.generate_type_cast(&text, ty)
        };
        Ok(out.sql(sql, Some(ty)))
    }

    /// The JSON item when it has type `ty`, otherwise NULL.
    fn json_filter(
        &self,
        plain: &Operand,
        typed: Option<&Operand>,
        ty: FhirPathType,
    ) -> Result<String> {
        let v = self.scalar_sql(plain)?;
        let check = self.dialect.generate_type_check(&v, ty);
        Ok(match typed {
            Some(typed) => {
                let t = self.scalar_sql(typed)?;
                format!("(CASE WHEN {t} IS NOT NULL THEN {t} WHEN {check} THEN {v} END)")
            }
            None => format!("(CASE WHEN {check} THEN {v} END)"),
        })
    }

    /// Split a navigation into the element as written and its typed choice
    /// name. Only single elements have a choice form; a collection prefix is
    /// materialized first so the last step is evaluated per item.
    fn choice_parts(
        &mut self,
        input: Operand,
        ty: FhirPathType,
    ) -> Result<(Operand, Option<Operand>)> {
        let Value::Json { base, path } = &input.value else {
            return Ok((input, None));
        };
        let Some(last) = path.steps.last().cloned() else {
            return Ok((input, None));
        };
        if last.repeating {
            return Ok((input, None));
        }

        let plain = if path.is_collection() {
            if self.context.inline {
                return Ok((input, None));
            }
            let mut prefix_path = path.clone();
            prefix_path.steps.pop();
            let prefix = input.with_value(Value::Json {
                base: base.clone(),
                path: prefix_path,
            });
            let stage = self.materialize(&prefix)?;
            Operand::from_stage(&stage)
                .step(&last.name, false)
                .ok_or_else(|| TranslationError::navigation(format!("cannot navigate to '{}'", last.name)))?
        } else {
            input
        };
        let typed = renamed(&plain, choice_element(&last.name, ty));
        Ok((plain, typed))
    }
}

fn merged_pair(plain: &Operand, typed: Option<&Operand>) -> Operand {
    match typed {
        Some(typed) => joined(plain, typed),
        None => plain.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::translate;
    use super::*;
    use crate::Error;

    fn observation_value() -> ExpressionNode {
        ExpressionNode::identifier("Observation").path("value")
    }

    fn last(expr: &ExpressionNode) -> String {
        translate(expr).unwrap().fragments.last().unwrap().expression.clone()
    }

    #[test]
    fn test_choice_element_name() {
        assert_eq!(choice_element("value", FhirPathType::Quantity), "valueQuantity");
        assert_eq!(choice_element("effective", FhirPathType::DateTime), "effectiveDateTime");
        assert_eq!(choice_element("value", FhirPathType::String), "valueString");
    }

    #[test]
    fn test_is_checks_choice_and_plain_element() {
        let sql = last(&observation_value().is_type("Quantity"));
        assert!(sql.starts_with(
            "(CASE WHEN jsonb_extract_path(cte_1.value, 'valueQuantity') IS NOT NULL THEN TRUE \
             WHEN jsonb_extract_path(cte_1.value, 'value') IS NOT NULL THEN COALESCE((jsonb_typeof("
        ));
    }

    #[test]
    fn test_as_casts_checked_value() {
        let t = translate(&observation_value().as_type("decimal")).unwrap();
        let sql = &t.fragments.last().unwrap().expression;
        assert!(sql.starts_with("CAST(((CASE WHEN jsonb_extract_path(cte_1.value, 'valueDecimal') IS NOT NULL"));
        assert!(sql.ends_with("AS NUMERIC)"));
        assert_eq!(t.result.data_type, Some(FhirPathType::Decimal));

        let t = translate(&observation_value().as_type("Quantity")).unwrap();
        assert!(t.result.json);
    }

    #[test]
    fn test_aliases_resolve_before_reaching_the_dialect() {
        let sql = last(&ExpressionNode::identifier("Patient").path("gender").is_type("code"));
        assert!(sql.contains("jsonb_typeof(jsonb_extract_path(cte_1.value, 'gender')) = 'string'"));
        assert!(sql.contains("'genderString'"));
    }

    #[test]
    fn test_unknown_type_lists_canonical_names() {
        let err = translate(&observation_value().is_type("Frobnicate")).unwrap_err();
        match err {
            Error::Translation(TranslationError::UnknownType {
                type_name,
                context,
                valid,
            }) => {
                assert_eq!(type_name, "Frobnicate");
                assert_eq!(context, "is");
                assert!(valid.contains(&"string".to_string()));
            }
            other => panic!("unexpected error: {other:?}"),
        }

        let err = translate(&observation_value().method(
            "ofType",
            vec![ExpressionNode::identifier("Frobnicate")],
        ))
        .unwrap_err();
        assert!(err.to_string().contains("'Frobnicate'"));
    }

    #[test]
    fn test_typed_operands_are_answered_statically() {
        assert_eq!(last(&ExpressionNode::integer(5).is_type("Integer")), "TRUE");
        assert_eq!(last(&ExpressionNode::integer(5).is_type("String")), "FALSE");

        let t = translate(&ExpressionNode::integer(5).as_type("string")).unwrap();
        assert_eq!(t.fragments.last().unwrap().expression, "SELECT NULL AS value WHERE 1 = 0");
    }

    #[test]
    fn test_of_type_filters_collection() {
        let expr = ExpressionNode::identifier("Patient")
            .path("name")
            .path("given")
            .method("ofType", vec![ExpressionNode::identifier("string")]);
        let sql = last(&expr);
        assert!(sql.starts_with("SELECT cte_3.id, cte_3.value, cte_3.pos FROM cte_3 WHERE COALESCE((jsonb_typeof(cte_3.value) = 'string'"));
    }

    #[test]
    fn test_of_type_with_choice_stays_per_item() {
        let expr = observation_value().method(
            "ofType",
            vec![ExpressionNode::Path {
                base: Box::new(ExpressionNode::identifier("FHIR")),
                name: "Quantity".into(),
            }],
        );
        let t = translate(&expr).unwrap();
        assert_eq!(t.fragments.len(), 2);
        assert!(t.fragments[1].expression.starts_with("(CASE WHEN jsonb_extract_path(cte_1.value, 'valueQuantity') IS NOT NULL"));
    }

    #[test]
    fn test_type_argument_must_be_a_name() {
        let err = translate(&observation_value().method("ofType", vec![ExpressionNode::integer(5)]))
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Translation(TranslationError::InvalidArgument { .. })
        ));
    }
}
