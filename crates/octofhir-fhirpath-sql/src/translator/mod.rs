//! FHIRPath AST to SQL fragment translation.
//!
//! The translator walks an [`ExpressionNode`] tree and emits an ordered list of
//! [`SqlFragment`]s, one per pipeline stage. Every stage exposes a `value`
//! column, plus an `id` column when its rows belong to individual resources.
//! A NULL `value` is a non-item, so per-resource results survive stages that
//! produce nothing for some resources.
//!
//! Sub-expressions are first turned into [`Operand`]s: SQL relative to the row
//! of one stage. Operands only become stages when rows have to change
//! (flattening an array, filtering, aggregating); scalar navigation and
//! per-item computation stay expressions.
//!
//! Lambda bodies (`where`, `select`, `all`, ...) are translated in inline mode,
//! where every result must remain an expression over the current row.

mod context;
mod functions;
mod operand;
mod operators;
mod scalar;
mod type_ops;

use std::sync::Arc;

use indexmap::{IndexMap, IndexSet};
use tracing::{debug, trace};

pub use context::{Binding, Context};
pub use functions::{FunctionSignature, lookup as lookup_function, supported_functions};
pub use operand::{Operand, Source, StageRef, Value};

use crate::Result;
use crate::ast::{ExpressionNode, LiteralValue, UnaryOperator};
use crate::config::CompilerConfig;
use crate::dialect::{Dialect, JsonPath};
use crate::error::TranslationError;
use crate::fragment::{ELEMENT_ALIAS, SqlFragment, select_unnest, select_value};
use crate::types::{FhirPathType, TypeRegistry};

const EMPTY_QUERY: &str = "SELECT NULL AS value WHERE 1 = 0";

/// Output of a translation: fragments in emission order and the stage
/// holding the result.
#[derive(Debug, Clone)]
pub struct Translation {
    pub fragments: Vec<SqlFragment>,
    pub result: StageRef,
}

/// Shape flags of a stage about to be emitted.
#[derive(Debug, Clone, Default)]
struct StageShape {
    keyed: bool,
    root: Option<String>,
    json: bool,
    data_type: Option<FhirPathType>,
    collection: bool,
    ordered: bool,
}

impl StageShape {
    /// Rows follow the rows of `source`.
    fn over(source: Option<&StageRef>) -> Self {
        match source {
            Some(stage) if stage.keyed => Self {
                keyed: true,
                root: Some(stage.root_name().to_string()),
                ..Self::default()
            },
            _ => Self::default(),
        }
    }

    fn json(mut self, json: bool) -> Self {
        self.json = json;
        self
    }

    fn typed(mut self, data_type: Option<FhirPathType>) -> Self {
        self.data_type = data_type;
        self
    }

    fn collection(mut self, collection: bool) -> Self {
        self.collection = collection;
        self
    }

    /// The query selects a `pos` column.
    fn ordered(mut self, ordered: bool) -> Self {
        self.ordered = ordered;
        self
    }

    /// Same flags as an existing stage.
    fn like(stage: &StageRef) -> Self {
        Self::over(Some(stage))
            .json(stage.json)
            .typed(stage.data_type)
    }
}

/// Translates one expression. Create a new translator per expression.
#[derive(Debug)]
pub struct Translator {
    dialect: Arc<dyn Dialect>,
    registry: Arc<TypeRegistry>,
    config: Arc<CompilerConfig>,
    variables: Arc<IndexMap<String, LiteralValue>>,
    context: Context,
    fragments: Vec<SqlFragment>,
    /// Root stages by resource type filter ("" for none).
    roots: IndexMap<String, StageRef>,
}

impl Translator {
    pub fn new(
        dialect: Arc<dyn Dialect>,
        registry: Arc<TypeRegistry>,
        config: Arc<CompilerConfig>,
        variables: Arc<IndexMap<String, LiteralValue>>,
    ) -> Self {
        let context = Context::new(config.cte_prefix.clone());
        Self {
            dialect,
            registry,
            config,
            variables,
            context,
            fragments: Vec::new(),
            roots: IndexMap::new(),
        }
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    /// Translate an expression into fragments.
    pub fn translate(mut self, expr: &ExpressionNode) -> Result<Translation> {
        let operand = self.visit(expr)?;
        let result = self.finish(operand)?;
        debug!(
            fragments = self.fragments.len(),
            result = %result.name,
            keyed = result.keyed,
            "translated expression"
        );
        Ok(Translation {
            fragments: self.fragments,
            result,
        })
    }

    fn finish(&mut self, operand: Operand) -> Result<StageRef> {
        self.context.inline = false;
        let stage = self.materialize(&operand)?;
        if self.last_stage() == Some(stage.name.as_str()) {
            return Ok(stage);
        }
        // The result must be the last CTE of the statement.
        Ok(self.emit_column(
            Some(&stage),
            stage.value(),
            &IndexSet::new(),
            StageShape::like(&stage).collection(operand.is_collection()),
        ))
    }

    pub(crate) fn visit(&mut self, node: &ExpressionNode) -> Result<Operand> {
        match node {
            ExpressionNode::Literal(literal) => self.literal(literal),
            ExpressionNode::Identifier(name) => self.identifier(name),
            ExpressionNode::Path { base, name } => {
                let base = self.visit(base)?;
                self.navigate(base, name)
            }
            ExpressionNode::Index { base, index } => self.index(base, index),
            ExpressionNode::BinaryOp(data) => self.binary(data),
            ExpressionNode::UnaryOp { op, operand } => self.unary(*op, operand),
            ExpressionNode::FunctionCall(call) => self.function(call),
            ExpressionNode::TypeOperation(data) => self.type_operation(data),
            ExpressionNode::Variable(name) => self.variable(name),
        }
    }

    fn literal(&self, literal: &LiteralValue) -> Result<Operand> {
        let d = &self.dialect;
        let operand = match literal {
            LiteralValue::Boolean(b) => Operand::constant(
                if *b { "TRUE" } else { "FALSE" },
                Some(FhirPathType::Boolean),
            ),
            LiteralValue::Integer(i) if *i < 0 => {
                Operand::constant(format!("({i})"), Some(FhirPathType::Integer))
            }
            LiteralValue::Integer(i) => Operand::constant(i.to_string(), Some(FhirPathType::Integer)),
            LiteralValue::Decimal(v) if v.is_sign_negative() => {
                Operand::constant(format!("({v})"), Some(FhirPathType::Decimal))
            }
            LiteralValue::Decimal(v) => Operand::constant(v.to_string(), Some(FhirPathType::Decimal)),
            LiteralValue::String(s) => {
                Operand::constant(d.string_literal(s), Some(FhirPathType::String))
            }
            LiteralValue::Date(s) => Operand::constant(
                d.string_literal(s.trim_start_matches('@')),
                Some(FhirPathType::Date),
            ),
            LiteralValue::DateTime(s) => Operand::constant(
                d.string_literal(s.trim_start_matches('@')),
                Some(FhirPathType::DateTime),
            ),
            LiteralValue::Time(s) => Operand::constant(
                d.string_literal(s.trim_start_matches('@').trim_start_matches('T')),
                Some(FhirPathType::Time),
            ),
            LiteralValue::Quantity { value, unit } => {
                let json = format!(
                    "{{\"value\": {value}, \"unit\": {}}}",
                    serde_json::Value::String(unit.clone())
                );
                Operand::json_constant(d.json_literal(&json), Some(FhirPathType::Quantity))
            }
            LiteralValue::Empty => Operand::empty(),
        };
        Ok(operand)
    }

    fn identifier(&mut self, name: &str) -> Result<Operand> {
        if name.starts_with(|c: char| c.is_ascii_uppercase()) {
            if self.context.inline {
                return self.root_operand();
            }
            let root = self.root_stage(Some(name))?;
            return Ok(Operand::from_stage(&root));
        }
        let focus = self.focus()?;
        self.navigate(focus, name)
    }

    fn variable(&mut self, name: &str) -> Result<Operand> {
        let unbound = || TranslationError::UnboundVariable {
            name: name.to_string(),
        };
        match name {
            "$this" => match self.context.this() {
                Some(this) => Ok(this.clone()),
                None => self.focus(),
            },
            "$index" => Ok(self.context.index().cloned().ok_or_else(unbound)?),
            "$total" => Ok(self.context.total().cloned().ok_or_else(unbound)?),
            "%resource" | "%rootResource" | "%context" => self.root_operand(),
            "%ucum" => self.literal(&LiteralValue::String("http://unitsofmeasure.org".into())),
            "%sct" => self.literal(&LiteralValue::String("http://snomed.info/sct".into())),
            "%loinc" => self.literal(&LiteralValue::String("http://loinc.org".into())),
            _ => {
                let key = name.trim_start_matches('%').trim_matches('`');
                match self.variables.get(key) {
                    Some(value) => self.literal(value),
                    None => Err(unbound().into()),
                }
            }
        }
    }

    fn unary(&mut self, op: UnaryOperator, operand: &ExpressionNode) -> Result<Operand> {
        let operand = self.visit(operand)?;
        if operand.is_empty() {
            return Ok(operand);
        }
        let operand = self.unify_one(operand)?;
        let ty = self.numeric_type(&operand).ok_or_else(|| {
            TranslationError::invalid_argument(
                "unary operator",
                format!("operand of type {} is not numeric", type_label(&operand)),
            )
        })?;
        let sql = self.numeric_sql(&operand, ty, "unary operator")?;
        Ok(match op {
            UnaryOperator::Minus => operand.sql(format!("(-{sql})"), Some(ty)),
            UnaryOperator::Plus => operand.sql(sql, Some(ty)),
        })
    }

    // Focus and roots

    /// Implicit input of identifiers.
    fn focus(&mut self) -> Result<Operand> {
        match &self.context.focus {
            Some(focus) => Ok(focus.clone()),
            None => self.root_operand(),
        }
    }

    /// The resource being evaluated, relative to the current row.
    fn root_operand(&mut self) -> Result<Operand> {
        if !self.context.inline {
            let root = self.root_stage(None)?;
            return Ok(Operand::from_stage(&root));
        }
        match self.context.row.clone() {
            Some(row) if row.keyed => {
                let root = row.root_name().to_string();
                if root == row.name {
                    return Ok(Operand::from_stage(&row));
                }
                let mut refs = IndexSet::new();
                refs.insert(root.clone());
                refs.insert(row.name.clone());
                Ok(Operand {
                    source: Source::Row(row.clone()),
                    value: Value::Json {
                        base: format!(
                            "(SELECT rr.value FROM {root} AS rr WHERE rr.id = {})",
                            row.id()
                        ),
                        path: JsonPath::default(),
                    },
                    refs,
                })
            }
            _ => Err(TranslationError::unsupported(
                "%resource",
                "no resource row is in scope here",
            )
            .into()),
        }
    }

    /// Stage selecting the resources, created on first use.
    fn root_stage(&mut self, resource_type: Option<&str>) -> Result<StageRef> {
        let resource_type = resource_type
            .map(str::to_string)
            .or_else(|| self.config.resource_type.clone());
        let key = resource_type.clone().unwrap_or_default();
        if let Some(stage) = self.roots.get(&key) {
            return Ok(stage.clone());
        }

        let d = &self.dialect;
        let resource = d.quote_identifier(&self.config.resource_column)?;
        let mut sql = format!(
            "SELECT {} AS id, {resource} AS value FROM {}",
            d.quote_identifier(&self.config.id_column)?,
            d.quote_identifier(&self.config.resource_table)?,
        );
        if let Some(resource_type) = &resource_type {
            let type_sql = d.json_to_text(&d.json_extract(&resource, &["resourceType".to_string()])?);
            sql.push_str(&format!(
                " WHERE {type_sql} = {}",
                d.string_literal(resource_type)
            ));
        }

        let stage = self.push_stage(
            SqlFragment::query(sql),
            StageShape {
                keyed: true,
                json: true,
                collection: true,
                ..StageShape::default()
            },
        );
        self.roots.insert(key, stage.clone());
        Ok(stage)
    }

    // Navigation

    fn navigate(&mut self, operand: Operand, name: &str) -> Result<Operand> {
        let repeating = self.config.is_array_field(name);
        let next = operand.step(name, repeating).ok_or_else(|| {
            TranslationError::navigation(format!(
                "cannot navigate to '{name}' on a {} value",
                type_label(&operand)
            ))
        })?;
        if let Value::Json { path, .. } = &next.value {
            self.context.current_json_path = path.steps.iter().map(|s| s.name.clone()).collect();
        }
        Ok(next)
    }

    // Stages

    /// Name of the last emitted stage.
    fn last_stage(&self) -> Option<&str> {
        self.fragments.last().and_then(SqlFragment::result_alias)
    }

    fn push_stage(&mut self, fragment: SqlFragment, shape: StageShape) -> StageRef {
        let name = self.context.next_alias();
        let fragment = fragment
            .with_alias(name.clone())
            .keyed(shape.keyed)
            .json_value(shape.json)
            .with_data_type(shape.data_type)
            .with_collection(shape.collection)
            .ordered(shape.ordered);
        trace!(cte = %name, shape = ?fragment.shape, deps = ?fragment.dependencies, "emitted fragment");
        self.fragments.push(fragment);
        self.context.current_table = Some(name.clone());

        let root = shape
            .keyed
            .then(|| shape.root.unwrap_or_else(|| name.clone()));
        StageRef {
            name,
            keyed: shape.keyed,
            json: shape.json,
            data_type: shape.data_type,
            root,
            ordered: shape.ordered,
        }
    }

    /// A complete query over existing stages.
    fn emit_query(&mut self, sql: String, deps: &IndexSet<String>, shape: StageShape) -> StageRef {
        self.push_stage(
            SqlFragment::query(sql).with_dependencies(deps.iter().cloned()),
            shape,
        )
    }

    /// One row per row of `source` holding `expr`.
    fn emit_column(
        &mut self,
        source: Option<&StageRef>,
        expr: String,
        refs: &IndexSet<String>,
        shape: StageShape,
    ) -> StageRef {
        let base = StageShape::over(source);
        let shape = StageShape {
            keyed: base.keyed,
            root: base.root,
            ordered: source.is_some_and(|s| s.ordered),
            ..shape
        };
        let fragment = match source {
            Some(stage) if self.last_stage() == Some(stage.name.as_str()) => {
                SqlFragment::column(expr, Some(&stage.name))
            }
            None if self.fragments.is_empty() => SqlFragment::column(expr, None),
            _ => SqlFragment::query(select_value(
                source.map(|s| s.name.as_str()),
                shape.keyed,
                shape.ordered,
                &expr,
            ))
            .with_dependencies(source.map(|s| s.name.clone())),
        };
        self.push_stage(fragment.with_dependencies(refs.iter().cloned()), shape)
    }

    /// One row per element of the array at `path` below `column`.
    fn emit_unnest(
        &mut self,
        source: &StageRef,
        column: String,
        path: Vec<String>,
        refs: &IndexSet<String>,
    ) -> Result<StageRef> {
        let fragment = if self.last_stage() == Some(source.name.as_str()) {
            SqlFragment::unnest(column, &source.name, path)
        } else {
            let lateral = self.dialect.unnest_json_array(&column, &path, ELEMENT_ALIAS)?;
            let mut fragment = SqlFragment::query(select_unnest(
                &source.name,
                source.keyed,
                source.ordered,
                &lateral,
                ELEMENT_ALIAS,
            ))
            .with_dependency(source.name.clone());
            fragment.requires_unnest = true;
            fragment
        };
        Ok(self.push_stage(
            fragment.with_dependencies(refs.iter().cloned()),
            StageShape::over(Some(source))
                .json(true)
                .collection(true)
                .ordered(true),
        ))
    }

    fn empty_stage(&mut self) -> StageRef {
        self.push_stage(
            SqlFragment::query(EMPTY_QUERY),
            StageShape::default().collection(true),
        )
    }

    /// Turn an operand into a stage whose rows are its items.
    fn materialize(&mut self, operand: &Operand) -> Result<StageRef> {
        if let Some(stage) = operand.as_stage() {
            return Ok(stage.clone());
        }
        if self.context.inline {
            return Err(TranslationError::unsupported(
                "collection",
                "a lambda body cannot produce an intermediate result set",
            )
            .into());
        }

        let refs = &operand.refs;
        match (&operand.source, &operand.value) {
            (_, Value::Empty) => Ok(self.empty_stage()),
            (source, Value::Json { base, path }) => {
                self.materialize_path(source.stage().cloned(), base, path, refs)
            }
            (Source::Row(stage), Value::Sql { sql, collection: true, .. }) => {
                let stage = stage.clone();
                self.emit_unnest(&stage, sql.clone(), Vec::new(), refs)
            }
            (Source::Constant, Value::Sql { sql, collection: true, .. }) => {
                let alias = self.context.next_local("e");
                let query = format!(
                    "SELECT {alias}.value AS value, {alias}.ord AS pos FROM {}",
                    self.dialect.json_array_elements(sql, &alias)
                );
                Ok(self.emit_query(
                    query,
                    refs,
                    StageShape::default().json(true).collection(true).ordered(true),
                ))
            }
            (source, Value::Sql { sql, data_type, json, .. }) => Ok(self.emit_column(
                source.stage(),
                sql.clone(),
                refs,
                StageShape::default().json(*json).typed(*data_type),
            )),
        }
    }

    fn materialize_path(
        &mut self,
        stage: Option<StageRef>,
        base: &str,
        path: &JsonPath,
        refs: &IndexSet<String>,
    ) -> Result<StageRef> {
        let (mut current, mut column) = match stage {
            Some(stage) => (stage, base.to_string()),
            None => {
                let stage = self.emit_column(
                    None,
                    base.to_string(),
                    refs,
                    StageShape::default().json(true),
                );
                let column = stage.value();
                (stage, column)
            }
        };

        if path.from_collection {
            current = self.emit_unnest(&current, column, Vec::new(), refs)?;
            column = current.value();
        }

        let mut pending: Vec<String> = Vec::new();
        for step in &path.steps {
            pending.push(step.name.clone());
            if step.repeating {
                current = self.emit_unnest(&current, column, std::mem::take(&mut pending), refs)?;
                column = current.value();
            }
        }

        if !pending.is_empty() {
            let expr = self.dialect.json_extract(&column, &pending)?;
            current = self.emit_column(Some(&current), expr, refs, StageShape::default().json(true));
        } else if column != current.value() {
            current = self.emit_column(Some(&current), column, refs, StageShape::default().json(true));
        }
        Ok(current)
    }

    /// Bring operands onto one row source.
    ///
    /// Collections become stages. When more than one stage is involved a
    /// join stage lines their rows up by resource id and the operands are
    /// rewritten to its columns. Inline operands are left alone.
    fn unify(&mut self, operands: Vec<Operand>) -> Result<Vec<Operand>> {
        if self.context.inline {
            return Ok(operands);
        }

        let mut scalars = Vec::with_capacity(operands.len());
        for operand in operands {
            if operand.is_collection() {
                let stage = self.materialize(&operand)?;
                scalars.push(Operand::from_stage(&stage));
            } else {
                scalars.push(operand);
            }
        }

        let mut stages: Vec<StageRef> = Vec::new();
        for operand in &scalars {
            if let Source::Row(stage) = &operand.source
                && !stages.iter().any(|s| s.name == stage.name)
            {
                stages.push(stage.clone());
            }
        }
        if stages.len() <= 1 {
            return Ok(scalars);
        }

        let keyed: Vec<&StageRef> = stages.iter().filter(|s| s.keyed).collect();
        let unkeyed: Vec<&StageRef> = stages.iter().filter(|s| !s.keyed).collect();
        let mut deps: IndexSet<String> = stages.iter().map(|s| s.name.clone()).collect();
        let (from, root) = match keyed.first() {
            Some(first) => {
                let root = first.root_name().to_string();
                deps.insert(root.clone());
                let mut from = root.clone();
                for stage in &keyed {
                    if stage.name != root {
                        from.push_str(&format!(
                            " LEFT JOIN {0} ON {0}.id = {root}.id",
                            stage.name
                        ));
                    }
                }
                for stage in &unkeyed {
                    from.push_str(&format!(" CROSS JOIN {}", stage.name));
                }
                (from, Some(root))
            }
            None => (
                unkeyed
                    .iter()
                    .map(|s| s.name.as_str())
                    .collect::<Vec<_>>()
                    .join(" CROSS JOIN "),
                None,
            ),
        };

        let mut columns = Vec::with_capacity(scalars.len() + 1);
        if let Some(root) = &root {
            columns.push(format!("{root}.id AS id"));
        }
        for (i, operand) in scalars.iter().enumerate() {
            deps.extend(operand.refs.iter().cloned());
            if operand.is_constant() || operand.is_empty() {
                continue;
            }
            columns.push(format!("{} AS v{i}", self.scalar_sql(operand)?));
        }

        let sql = format!("SELECT {} FROM {from}", columns.join(", "));
        let join = self.emit_query(
            sql,
            &deps,
            StageShape {
                keyed: root.is_some(),
                root,
                ..StageShape::default()
            },
        );

        let mut refs = IndexSet::new();
        refs.insert(join.name.clone());
        Ok(scalars
            .into_iter()
            .enumerate()
            .map(|(i, operand)| {
                if operand.is_constant() || operand.is_empty() {
                    return operand;
                }
                let column = format!("{}.v{i}", join.name);
                let value = if operand.is_json() {
                    Value::Json {
                        base: column,
                        path: JsonPath::default(),
                    }
                } else {
                    Value::Sql {
                        sql: column,
                        data_type: operand.data_type(),
                        json: false,
                        collection: false,
                    }
                };
                Operand {
                    source: Source::Row(join.clone()),
                    value,
                    refs: refs.clone(),
                }
            })
            .collect())
    }

    fn unify_one(&mut self, operand: Operand) -> Result<Operand> {
        let mut unified = self.unify(vec![operand])?;
        unified
            .pop()
            .ok_or_else(|| TranslationError::unsupported("operand", "nothing to unify").into())
    }

    fn unify_pair(&mut self, left: Operand, right: Operand) -> Result<(Operand, Operand)> {
        let mut unified = self.unify(vec![left, right])?;
        match (unified.pop(), unified.pop()) {
            (Some(right), Some(left)) => Ok((left, right)),
            _ => Err(TranslationError::unsupported("operands", "nothing to unify").into()),
        }
    }

    // Lambda bodies

    /// Translate `node` with `$this` bound to `item`, inline.
    ///
    /// `row` is the stage the item rows come from; correlated lookups of the
    /// resource go through it.
    fn lambda_body(
        &mut self,
        binding: Binding,
        row: Option<StageRef>,
        node: &ExpressionNode,
    ) -> Result<Operand> {
        let saved = self.context.save();
        self.context.inline = true;
        if row.is_some() {
            self.context.row = row;
        }
        self.context.bind(binding);
        let result = self.visit(node);
        self.context.restore(saved);
        result
    }
}

/// Operand combining the row source and references of two operands.
pub(crate) fn joined(left: &Operand, right: &Operand) -> Operand {
    let mut base = if matches!(left.source, Source::Row(_)) {
        left.clone()
    } else {
        right.clone()
    };
    base.absorb_refs(left);
    base.absorb_refs(right);
    base
}

/// Readable type of an operand for error messages.
pub(crate) fn type_label(operand: &Operand) -> String {
    match (&operand.value, operand.data_type()) {
        (Value::Empty, _) => "empty".to_string(),
        (_, Some(ty)) => ty.to_string(),
        _ if operand.is_json() => "JSON".to_string(),
        _ => "untyped".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialect::DialectKind;
    use crate::fragment::FragmentShape;

    pub(crate) fn translator(kind: DialectKind) -> Translator {
        let config = CompilerConfig {
            dialect: kind,
            ..CompilerConfig::default()
        };
        Translator::new(
            kind.create(),
            Arc::new(TypeRegistry::new()),
            Arc::new(config),
            Arc::new(IndexMap::new()),
        )
    }

    pub(crate) fn translate(expr: &ExpressionNode) -> Result<Translation> {
        translator(DialectKind::Postgres).translate(expr)
    }

    fn last_sql(translation: &Translation) -> &str {
        &translation.fragments.last().unwrap().expression
    }

    #[test]
    fn test_resource_type_filters_root() {
        let t = translate(&ExpressionNode::identifier("Patient")).unwrap();
        assert_eq!(t.fragments.len(), 1);
        assert_eq!(
            t.fragments[0].expression,
            "SELECT \"id\" AS id, \"resource\" AS value FROM \"fhir_resources\" \
             WHERE (jsonb_extract_path(\"resource\", 'resourceType') #>> '{}') = 'Patient'"
        );
        assert!(t.result.keyed);
        assert_eq!(t.result.root.as_deref(), Some("cte_1"));
    }

    #[test]
    fn test_scalar_navigation_is_one_column_stage() {
        let expr = ExpressionNode::identifier("Patient").path("birthDate");
        let t = translate(&expr).unwrap();
        assert_eq!(t.fragments.len(), 2);
        let last = &t.fragments[1];
        assert_eq!(last.shape, FragmentShape::Column);
        assert_eq!(last.expression, "jsonb_extract_path(cte_1.value, 'birthDate')");
        assert_eq!(last.source_table.as_deref(), Some("cte_1"));
        assert!(last.is_keyed());
    }

    #[test]
    fn test_repeating_steps_unnest() {
        let expr = ExpressionNode::identifier("Patient")
            .path("name")
            .path("given");
        let t = translate(&expr).unwrap();
        assert_eq!(t.fragments.len(), 3);
        assert!(t.fragments[1].requires_unnest);
        assert_eq!(t.fragments[1].array_path(), vec!["name".to_string()]);
        assert!(t.fragments[2].requires_unnest);
        assert_eq!(t.fragments[2].array_path(), vec!["given".to_string()]);
        assert!(t.result.json);
    }

    #[test]
    fn test_lowercase_start_navigates_from_unfiltered_root() {
        let t = translate(&ExpressionNode::identifier("gender")).unwrap();
        assert!(!t.fragments[0].expression.contains("WHERE"));
        assert_eq!(last_sql(&t), "jsonb_extract_path(cte_1.value, 'gender')");
    }

    #[test]
    fn test_constant_expression_is_unkeyed() {
        let t = translate(&ExpressionNode::integer(5)).unwrap();
        assert_eq!(t.fragments.len(), 1);
        assert!(!t.result.keyed);
        assert_eq!(t.fragments[0].expression, "5");
        assert_eq!(t.result.data_type, Some(FhirPathType::Integer));
    }

    #[test]
    fn test_empty_literal_yields_no_rows() {
        let t = translate(&ExpressionNode::empty()).unwrap();
        assert_eq!(last_sql(&t), EMPTY_QUERY);
    }

    #[test]
    fn test_navigation_on_typed_value_fails() {
        let expr = ExpressionNode::integer(5).path("value");
        assert!(matches!(
            translate(&expr),
            Err(crate::Error::Translation(TranslationError::InvalidNavigation { .. }))
        ));
    }

    #[test]
    fn test_variables() {
        let expr = ExpressionNode::variable("%ucum");
        let t = translate(&expr).unwrap();
        assert_eq!(last_sql(&t), "'http://unitsofmeasure.org'");

        let err = translate(&ExpressionNode::variable("%missing")).unwrap_err();
        assert!(matches!(
            err,
            crate::Error::Translation(TranslationError::UnboundVariable { .. })
        ));

        let err = translate(&ExpressionNode::variable("$index")).unwrap_err();
        assert!(err.to_string().contains("$index"));
    }

    #[test]
    fn test_user_variables_become_literals() {
        let mut variables = IndexMap::new();
        variables.insert("limit".to_string(), LiteralValue::Integer(3));
        let translator = Translator::new(
            DialectKind::Postgres.create(),
            Arc::new(TypeRegistry::new()),
            Arc::new(CompilerConfig::default()),
            Arc::new(variables),
        );
        let t = translator
            .translate(&ExpressionNode::variable("%limit"))
            .unwrap();
        assert_eq!(last_sql(&t), "3");
    }

    #[test]
    fn test_literals() {
        let t = translate(&ExpressionNode::Literal(LiteralValue::Date("@2020-01-01".into())))
            .unwrap();
        assert_eq!(last_sql(&t), "'2020-01-01'");

        let t = translate(&ExpressionNode::Literal(LiteralValue::Time("@T10:30:00".into())))
            .unwrap();
        assert_eq!(last_sql(&t), "'10:30:00'");

        let t = translate(&ExpressionNode::Literal(LiteralValue::Quantity {
            value: "5.5".parse().unwrap(),
            unit: "mg".into(),
        }))
        .unwrap();
        assert_eq!(last_sql(&t), "'{\"value\": 5.5, \"unit\": \"mg\"}'::jsonb");
        assert!(t.result.json);
    }

    #[test]
    fn test_unary_minus() {
        let expr = ExpressionNode::unary(UnaryOperator::Minus, ExpressionNode::integer(4));
        let t = translate(&expr).unwrap();
        assert_eq!(last_sql(&t), "(-4)");
    }

    #[test]
    fn test_result_is_last_fragment() {
        let expr = ExpressionNode::identifier("Patient").method("count", vec![]);
        let t = translate(&expr).unwrap();
        assert_eq!(
            t.fragments.last().unwrap().result_alias(),
            Some(t.result.name.as_str())
        );
    }
}
