//! Function calls: collection filters and projections, aggregates, subsetting,
//! set operations and the dispatch table for everything else.

use indexmap::IndexSet;
use tracing::trace;

use super::{Binding, Operand, StageRef, StageShape, Translator, Value, joined};
use crate::Result;
use crate::ast::{BinaryOperator, ExpressionNode, FunctionCallData};
use crate::error::{Arity, TranslationError};
use crate::types::FhirPathType;

/// Argument contract of a supported function.
#[derive(Debug, Clone, Copy)]
pub struct FunctionSignature {
    pub name: &'static str,
    pub arity: Arity,
}

const fn signature(name: &'static str, arity: Arity) -> FunctionSignature {
    FunctionSignature { name, arity }
}

const FUNCTIONS: &[FunctionSignature] = &[
    // Filtering and projection
    signature("where", Arity::exactly(1)),
    signature("select", Arity::exactly(1)),
    signature("repeat", Arity::exactly(1)),
    signature("ofType", Arity::exactly(1)),
    signature("extension", Arity::exactly(1)),
    // Existence and aggregates
    signature("exists", Arity::range(0, 1)),
    signature("empty", Arity::exactly(0)),
    signature("hasValue", Arity::exactly(0)),
    signature("all", Arity::exactly(1)),
    signature("allTrue", Arity::exactly(0)),
    signature("anyTrue", Arity::exactly(0)),
    signature("allFalse", Arity::exactly(0)),
    signature("anyFalse", Arity::exactly(0)),
    signature("count", Arity::exactly(0)),
    signature("isDistinct", Arity::exactly(0)),
    signature("sum", Arity::exactly(0)),
    signature("min", Arity::exactly(0)),
    signature("max", Arity::exactly(0)),
    signature("avg", Arity::exactly(0)),
    signature("join", Arity::range(0, 1)),
    signature("aggregate", Arity::range(1, 2)),
    // Subsetting
    signature("first", Arity::exactly(0)),
    signature("last", Arity::exactly(0)),
    signature("tail", Arity::exactly(0)),
    signature("skip", Arity::exactly(1)),
    signature("take", Arity::exactly(1)),
    signature("distinct", Arity::exactly(0)),
    // Combining
    signature("union", Arity::exactly(1)),
    signature("combine", Arity::exactly(1)),
    signature("intersect", Arity::exactly(1)),
    signature("exclude", Arity::exactly(1)),
    signature("subsetOf", Arity::exactly(1)),
    signature("supersetOf", Arity::exactly(1)),
    // Logic and types
    signature("not", Arity::exactly(0)),
    signature("iif", Arity::range(2, 3)),
    signature("is", Arity::exactly(1)),
    signature("as", Arity::exactly(1)),
    // Conversion
    signature("toString", Arity::exactly(0)),
    signature("toInteger", Arity::exactly(0)),
    signature("toDecimal", Arity::exactly(0)),
    // Strings
    signature("length", Arity::exactly(0)),
    signature("substring", Arity::range(1, 2)),
    signature("upper", Arity::exactly(0)),
    signature("lower", Arity::exactly(0)),
    signature("trim", Arity::exactly(0)),
    signature("indexOf", Arity::exactly(1)),
    signature("startsWith", Arity::exactly(1)),
    signature("endsWith", Arity::exactly(1)),
    signature("contains", Arity::exactly(1)),
    signature("matches", Arity::exactly(1)),
    signature("replace", Arity::exactly(2)),
    signature("replaceMatches", Arity::exactly(2)),
    // Math
    signature("abs", Arity::exactly(0)),
    signature("ceiling", Arity::exactly(0)),
    signature("floor", Arity::exactly(0)),
    signature("truncate", Arity::exactly(0)),
    signature("round", Arity::range(0, 1)),
    signature("sqrt", Arity::exactly(0)),
    signature("ln", Arity::exactly(0)),
    signature("exp", Arity::exactly(0)),
    signature("log", Arity::exactly(1)),
    signature("power", Arity::exactly(1)),
];

/// Look up a supported function by name.
pub fn lookup(name: &str) -> Option<&'static FunctionSignature> {
    FUNCTIONS.iter().find(|f| f.name == name)
}

/// Names of every supported function.
pub fn supported_functions() -> impl Iterator<Item = &'static str> {
    FUNCTIONS.iter().map(|f| f.name)
}

/// Position filter of the subsetting functions; counts are 1-based over `rn`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Rank {
    First,
    Last,
    Tail,
    Skip(i64),
    Take(i64),
    /// 0-based indexer.
    At(i64),
}

impl Rank {
    fn condition(self, alias: &str) -> String {
        match self {
            Self::First => format!("{alias}.rn = 1"),
            Self::Last => format!("{alias}.rn = {alias}.cnt"),
            Self::Tail => format!("{alias}.rn > 1"),
            Self::Skip(n) => format!("{alias}.rn > {n}"),
            Self::Take(n) => format!("{alias}.rn <= {n}"),
            Self::At(n) => format!("{alias}.rn = {}", n + 1),
        }
    }

    fn single(self) -> bool {
        matches!(self, Self::First | Self::Last | Self::At(_))
    }

    /// Result for a one-item input, if known statically.
    fn on_single(self) -> Option<bool> {
        match self {
            Self::First | Self::Last | Self::At(0) => Some(true),
            Self::Take(n) => Some(n >= 1),
            Self::Skip(n) => Some(n < 1),
            Self::Tail | Self::At(_) => Some(false),
        }
    }
}

/// `s.id, s.value`, or `s.value` for unkeyed stages.
fn stage_columns(stage: &StageRef) -> String {
    if stage.keyed {
        format!("{0}.id, {0}.value", stage.name)
    } else {
        stage.value()
    }
}

/// `s.id, s.value, s.pos`, leaving out the columns the stage lacks.
pub(super) fn item_columns(stage: &StageRef) -> String {
    let s = &stage.name;
    let mut columns = Vec::with_capacity(3);
    if stage.keyed {
        columns.push(format!("{s}.id"));
    }
    columns.push(format!("{s}.value"));
    if stage.ordered {
        columns.push(format!("{s}.pos"));
    }
    columns.join(", ")
}

/// Window numbering the items of each resource in collection order.
fn item_window(stage: &StageRef) -> String {
    let s = &stage.name;
    match (stage.keyed, stage.ordered) {
        (true, true) => format!("PARTITION BY {s}.id ORDER BY {s}.pos"),
        (true, false) => format!("PARTITION BY {s}.id"),
        (false, true) => format!("ORDER BY {s}.pos"),
        (false, false) => String::new(),
    }
}

fn single_ref(name: &str) -> IndexSet<String> {
    let mut refs = IndexSet::new();
    refs.insert(name.to_string());
    refs
}

impl Translator {
    pub(super) fn function(&mut self, call: &FunctionCallData) -> Result<Operand> {
        let name = call.name.as_str();
        let signature = lookup(name).ok_or_else(|| TranslationError::unknown_function(name))?;
        if !signature.arity.accepts(call.args.len()) {
            return Err(TranslationError::InvalidArity {
                function: name.to_string(),
                expected: signature.arity,
                actual: call.args.len(),
            }
            .into());
        }
        trace!(function = name, args = call.args.len(), inline = self.context.inline, "function call");

        let args = call.args.as_slice();
        if name == "extension" {
            return self.extension(call.target.as_ref(), &args[0]);
        }
        let input = match &call.target {
            Some(target) => self.visit(target)?,
            None => self.focus()?,
        };

        match name {
            "where" => self.where_function(input, &args[0]),
            "select" => self.select_function(input, &args[0]),
            "repeat" => self.repeat_function(input, &args[0]),
            "aggregate" => self.aggregate_function(input, &args[0], args.get(1)),
            "exists" => {
                let input = match args.first() {
                    Some(criteria) => self.where_function(input, criteria)?,
                    None => input,
                };
                self.aggregate_call("exists", input, None)
            }
            "all" | "join" => self.aggregate_call(name, input, args.first()),
            "count" | "empty" | "hasValue" | "allTrue" | "anyTrue" | "allFalse" | "anyFalse"
            | "sum" | "min" | "max" | "avg" | "isDistinct" => self.aggregate_call(name, input, None),
            "first" => self.ranked(input, Rank::First),
            "last" => self.ranked(input, Rank::Last),
            "tail" => self.ranked(input, Rank::Tail),
            "skip" => {
                let n = self.constant_integer(&args[0], name)?;
                self.ranked(input, Rank::Skip(n))
            }
            "take" => {
                let n = self.constant_integer(&args[0], name)?;
                self.ranked(input, Rank::Take(n))
            }
            "distinct" => self.distinct(input),
            "union" | "combine" | "intersect" | "exclude" | "subsetOf" | "supersetOf" => {
                self.set_function(name, input, &args[0])
            }
            "not" => self.not_function(input),
            "iif" => self.iif(input, args),
            "ofType" => self.of_type(input, &args[0]),
            "is" | "as" => self.type_function(name, input, &args[0]),
            "toString" | "toInteger" | "toDecimal" => self.conversion(name, input),
            "length" | "substring" | "upper" | "lower" | "trim" | "indexOf" | "startsWith"
            | "endsWith" | "contains" | "matches" | "replace" | "replaceMatches" => {
                self.string_call(name, input, args)
            }
            "abs" | "ceiling" | "floor" | "truncate" | "round" | "sqrt" | "ln" | "exp" | "log"
            | "power" => self.math_call(name, input, args),
            _ => Err(TranslationError::unknown_function(name).into()),
        }
    }

    /// `extension(url)` is `extension.where(url = <url>)`.
    fn extension(
        &mut self,
        target: Option<&ExpressionNode>,
        url: &ExpressionNode,
    ) -> Result<Operand> {
        let base = match target {
            Some(target) => target.clone().path("extension"),
            None => ExpressionNode::identifier("extension"),
        };
        let criteria = ExpressionNode::binary(
            BinaryOperator::Equal,
            ExpressionNode::identifier("url"),
            url.clone(),
        );
        self.visit(&base.method("where", vec![criteria]))
    }

    /// Integer argument that must be known at translation time.
    fn constant_integer(&mut self, node: &ExpressionNode, function: &str) -> Result<i64> {
        let operand = self.visit(node)?;
        let parsed = match (&operand.value, operand.is_constant()) {
            (
                Value::Sql {
                    sql,
                    data_type: Some(FhirPathType::Integer),
                    ..
                },
                true,
            ) => sql
                .trim_matches(|c| c == '(' || c == ')')
                .parse::<i64>()
                .ok(),
            _ => None,
        };
        parsed.ok_or_else(|| {
            TranslationError::invalid_argument(function, "expected a constant integer").into()
        })
    }

    pub(super) fn index(
        &mut self,
        base: &ExpressionNode,
        index: &ExpressionNode,
    ) -> Result<Operand> {
        let input = self.visit(base)?;
        let n = self.constant_integer(index, "[]")?;
        if n < 0 {
            return Ok(Operand::empty());
        }
        self.ranked(input, Rank::At(n))
    }

    /// Materialize a lambda input, numbering its items when the body uses
    /// `$index`.
    fn lambda_stage(
        &mut self,
        input: &Operand,
        body: &ExpressionNode,
    ) -> Result<(StageRef, Option<Operand>)> {
        let stage = self.materialize(input)?;
        if !body.references_variable("$index") {
            return Ok((stage, None));
        }
        let s = &stage.name;
        let sql = format!(
            "SELECT {}, ROW_NUMBER() OVER ({}) - 1 AS item_index \
             FROM {s} WHERE {s}.value IS NOT NULL",
            item_columns(&stage),
            item_window(&stage)
        );
        let indexed = self.emit_query(
            sql,
            &single_ref(s),
            StageShape::like(&stage)
                .collection(true)
                .ordered(stage.ordered),
        );
        let index = Operand::from_stage(&indexed).sql(
            format!("{}.item_index", indexed.name),
            Some(FhirPathType::Integer),
        );
        Ok((indexed, Some(index)))
    }

    pub(super) fn where_function(
        &mut self,
        input: Operand,
        criteria: &ExpressionNode,
    ) -> Result<Operand> {
        if input.is_empty() {
            return Ok(input);
        }

        if self.context.inline {
            let array = self.array_sql(&input)?;
            let alias = self.context.next_local("w");
            let body = self.lambda_body(Binding::this(Operand::element(&alias)), None, criteria)?;
            let cond = self.boolean_sql(&body, "where")?;
            let d = &self.dialect;
            let sql = format!(
                "(SELECT COALESCE({}, {}) FROM {} WHERE COALESCE({cond}, FALSE))",
                d.json_aggregate(&format!("{alias}.value"), false),
                d.empty_collection(),
                d.json_array_elements(&array, &alias)
            );
            return Ok(joined(&input, &body).json_array(sql));
        }

        let (stage, index) = self.lambda_stage(&input, criteria)?;
        let binding = Binding {
            this: Operand::from_stage(&stage),
            index,
            total: None,
        };
        let body = self.lambda_body(binding, Some(stage.clone()), criteria)?;
        let cond = self.boolean_sql(&body, "where")?;
        let sql = format!(
            "SELECT {} FROM {} WHERE COALESCE({cond}, FALSE)",
            item_columns(&stage),
            stage.name
        );
        let mut deps = body.refs.clone();
        deps.insert(stage.name.clone());
        let out = self.emit_query(
            sql,
            &deps,
            StageShape::like(&stage)
                .collection(true)
                .ordered(stage.ordered),
        );
        Ok(Operand::from_stage(&out))
    }

    fn select_function(&mut self, input: Operand, projection: &ExpressionNode) -> Result<Operand> {
        if input.is_empty() {
            return Ok(input);
        }

        if self.context.inline {
            let array = self.array_sql(&input)?;
            let alias = self.context.next_local("s");
            let body = self.lambda_body(Binding::this(Operand::element(&alias)), None, projection)?;
            if body.is_empty() {
                return Ok(body);
            }
            let d = self.dialect.clone();
            let items = d.json_array_elements(&array, &alias);
            let sql = if body.is_collection() {
                let p = self.context.next_local("p");
                let nested = d.json_array_elements(&self.array_sql(&body)?, &p);
                format!(
                    "(SELECT COALESCE({}, {}) FROM {items} CROSS JOIN LATERAL {nested})",
                    d.json_aggregate(&format!("{p}.value"), false),
                    d.empty_collection()
                )
            } else {
                let value = self.json_value_sql(&body)?;
                format!(
                    "(SELECT COALESCE({}, {}) FROM {items} WHERE {value} IS NOT NULL)",
                    d.json_aggregate(&value, false),
                    d.empty_collection()
                )
            };
            return Ok(joined(&input, &body).json_array(sql));
        }

        let (stage, index) = self.lambda_stage(&input, projection)?;
        let binding = Binding {
            this: Operand::from_stage(&stage),
            index,
            total: None,
        };
        let body = self.lambda_body(binding, Some(stage.clone()), projection)?;
        if body.is_empty() || !body.is_constant() {
            return Ok(body);
        }

        // One projected value per input item.
        let value = if body.is_collection() {
            self.array_sql(&body)?
        } else {
            self.scalar_sql(&body)?
        };
        let mut out = Operand::from_stage(&stage).with_value(Value::Sql {
            sql: format!("(CASE WHEN {} IS NOT NULL THEN {value} END)", stage.value()),
            data_type: body.data_type(),
            json: body.is_json(),
            collection: body.is_collection(),
        });
        out.absorb_refs(&body);
        Ok(out)
    }

    /// Transitive closure of a projection, bounded by `max_repeat_depth`.
    fn repeat_function(&mut self, input: Operand, projection: &ExpressionNode) -> Result<Operand> {
        if input.is_empty() {
            return Ok(input);
        }
        if self.context.inline {
            return Err(TranslationError::unsupported(
                "repeat",
                "cannot be nested inside another function argument",
            )
            .into());
        }

        let stage = self.materialize(&input)?;
        if !stage.json {
            return Err(TranslationError::invalid_argument(
                "repeat",
                "input items are not elements",
            )
            .into());
        }
        let walk = self.context.next_local("walk");
        let w = self.context.next_local("w");
        let e = self.context.next_local("e");
        let body = self.lambda_body(Binding::this(Operand::element(&w)), None, projection)?;
        if body.is_empty() {
            return Ok(body);
        }
        let array = self.array_sql(&body)?;
        let elements = self.dialect.json_array_elements(&array, &e);

        let s = &stage.name;
        let (columns, seed_id, step_id, out_id) = if stage.keyed {
            (
                "(id, value, depth)",
                format!("{s}.id, "),
                format!("{w}.id, "),
                format!("{walk}.id, "),
            )
        } else {
            ("(value, depth)", String::new(), String::new(), String::new())
        };
        let sql = format!(
            "WITH RECURSIVE {walk}{columns} AS (\
             SELECT {seed_id}{s}.value, 0 FROM {s} WHERE {s}.value IS NOT NULL \
             UNION ALL SELECT {step_id}{e}.value, {w}.depth + 1 FROM {walk} AS {w} \
             CROSS JOIN LATERAL {elements} WHERE {w}.depth < {max}) \
             SELECT {out_id}{walk}.value FROM {walk} WHERE {walk}.depth > 0",
            max = self.config.max_repeat_depth
        );

        let mut deps = body.refs.clone();
        deps.insert(stage.name.clone());
        let out = self.emit_query(
            sql,
            &deps,
            StageShape::over(Some(&stage)).json(true).collection(true),
        );
        Ok(Operand::from_stage(&out))
    }

    /// `aggregate(body [, init])` as a recursive fold over numbered items.
    fn aggregate_function(
        &mut self,
        input: Operand,
        body: &ExpressionNode,
        init: Option<&ExpressionNode>,
    ) -> Result<Operand> {
        if self.context.inline {
            return Err(TranslationError::unsupported(
                "aggregate",
                "cannot be nested inside another function argument",
            )
            .into());
        }

        let init = match init {
            Some(node) => {
                let operand = self.visit(node)?;
                if !operand.is_constant() {
                    return Err(TranslationError::invalid_argument(
                        "aggregate",
                        "the initial value must be a constant",
                    )
                    .into());
                }
                Some(operand)
            }
            None => None,
        };
        let stage = self.materialize(&input)?;

        let items = self.context.next_local("items");
        let fold = self.context.next_local("fold");
        let f = self.context.next_local("f");
        let i = self.context.next_local("i");
        let g = self.context.next_local("g");

        let init_json = init.as_ref().is_some_and(Operand::is_json);
        let init_type = init.as_ref().and_then(Operand::data_type);
        let total = if init_json {
            Operand::element(&f).with_value(Value::Json {
                base: format!("{f}.total"),
                path: Default::default(),
            })
        } else {
            Operand::constant(format!("{f}.total"), init_type)
        };
        // Items keep the representation of the input stage.
        let this = if stage.json {
            Operand::element(&i)
        } else {
            Operand::constant(format!("{i}.value"), stage.data_type)
        };
        let binding = Binding {
            this,
            index: Some(Operand::constant(
                format!("({i}.rn - 1)"),
                Some(FhirPathType::Integer),
            )),
            total: Some(total),
        };
        let body = self.lambda_body(binding, None, body)?;

        let json = init_json || body.is_json() || (init_type.is_none() && body.data_type().is_none());
        let data_type = if json {
            None
        } else {
            match (init_type, body.data_type()) {
                (Some(a), Some(b)) if a.is_numeric() && b.is_numeric() => {
                    if a == FhirPathType::Decimal || b == FhirPathType::Decimal {
                        Some(FhirPathType::Decimal)
                    } else {
                        Some(FhirPathType::Integer)
                    }
                }
                (Some(a), _) => Some(a),
                (None, b) => b,
            }
        };

        let d = self.dialect.clone();
        // Quantity is stored as the dialect's JSON type.
        let storage = data_type.unwrap_or(FhirPathType::Quantity);
        let (init_sql, body_sql) = if json {
            let init_sql = match &init {
                Some(op) => self.json_value_sql(op)?,
                None => d.generate_type_cast("NULL", storage),
            };
            (init_sql, self.json_value_sql(&body)?)
        } else {
            let init_sql = match &init {
                Some(op) => d.generate_type_cast(&self.scalar_sql(op)?, storage),
                None => d.generate_type_cast("NULL", storage),
            };
            (init_sql, d.generate_type_cast(&self.scalar_sql(&body)?, storage))
        };

        let s = &stage.name;
        let window = item_window(&stage);
        let mut deps = body.refs.clone();
        deps.insert(s.clone());
        let sql = if stage.keyed {
            let root = stage.root_name();
            deps.insert(root.to_string());
            format!(
                "WITH RECURSIVE {items} AS (SELECT {s}.id, {s}.value, \
                 ROW_NUMBER() OVER ({window}) AS rn FROM {s} WHERE {s}.value IS NOT NULL), \
                 {fold}(id, step, total) AS (SELECT {root}.id, 0, {init_sql} FROM {root} \
                 UNION ALL SELECT {f}.id, {f}.step + 1, {body_sql} FROM {fold} AS {f} \
                 JOIN {items} AS {i} ON {i}.id = {f}.id AND {i}.rn = {f}.step + 1) \
                 SELECT {fold}.id, {fold}.total AS value FROM {fold} WHERE {fold}.step = \
                 (SELECT MAX({g}.step) FROM {fold} AS {g} WHERE {g}.id = {fold}.id)"
            )
        } else {
            format!(
                "WITH RECURSIVE {items} AS (SELECT {s}.value, ROW_NUMBER() OVER ({window}) AS rn \
                 FROM {s} WHERE {s}.value IS NOT NULL), \
                 {fold}(step, total) AS (SELECT 0, {init_sql} \
                 UNION ALL SELECT {f}.step + 1, {body_sql} FROM {fold} AS {f} \
                 JOIN {items} AS {i} ON {i}.rn = {f}.step + 1) \
                 SELECT {fold}.total AS value FROM {fold} WHERE {fold}.step = \
                 (SELECT MAX({g}.step) FROM {fold} AS {g})"
            )
        };

        let out = self.emit_query(
            sql,
            &deps,
            StageShape::over(Some(&stage)).json(json).typed(data_type),
        );
        Ok(Operand::from_stage(&out))
    }

    /// Aggregates producing one value per resource (or one value overall).
    pub(super) fn aggregate_call(
        &mut self,
        name: &str,
        input: Operand,
        arg: Option<&ExpressionNode>,
    ) -> Result<Operand> {
        if self.context.inline {
            let array = self.array_sql(&input)?;
            let alias = self.context.next_local("a");
            let item = Operand::element(&alias);
            let (aggregate, ty, refs) = self.aggregate_expression(name, &item, arg, None)?;
            let sql = format!(
                "(SELECT {aggregate} FROM {})",
                self.dialect.json_array_elements(&array, &alias)
            );
            let mut out = match ty {
                Some(ty) => input.sql(sql, Some(ty)),
                None => input.json_sql(sql),
            };
            out.refs.extend(refs);
            return Ok(out);
        }

        let stage = self.materialize(&input)?;
        let item = Operand::from_stage(&stage);
        let (aggregate, ty, refs) = self.aggregate_expression(name, &item, arg, Some(&stage))?;

        let s = &stage.name;
        let mut deps = refs;
        deps.insert(s.clone());
        let sql = if !stage.keyed {
            format!("SELECT {aggregate} AS value FROM {s}")
        } else if stage.root_name() == stage.name {
            format!("SELECT {s}.id, {aggregate} AS value FROM {s} GROUP BY {s}.id")
        } else {
            let root = stage.root_name();
            deps.insert(root.to_string());
            format!(
                "SELECT {root}.id, {aggregate} AS value FROM {root} \
                 LEFT JOIN {s} ON {s}.id = {root}.id GROUP BY {root}.id"
            )
        };
        let out = self.emit_query(
            sql,
            &deps,
            StageShape::over(Some(&stage)).typed(ty).json(ty.is_none()),
        );
        Ok(Operand::from_stage(&out))
    }

    /// Aggregate SQL over `item`, its result type and the stages it reads.
    ///
    /// A `None` type means the aggregate yields JSON.
    fn aggregate_expression(
        &mut self,
        name: &str,
        item: &Operand,
        arg: Option<&ExpressionNode>,
        stage: Option<&StageRef>,
    ) -> Result<(String, Option<FhirPathType>, IndexSet<String>)> {
        let v = self.scalar_sql(item)?;
        let d = self.dialect.clone();
        let boolean = FhirPathType::Boolean;
        let mut refs = IndexSet::new();

        let (sql, ty) = match name {
            "count" => (format!("COUNT({v})"), FhirPathType::Integer),
            "exists" => (format!("(COUNT({v}) > 0)"), boolean),
            "empty" => (format!("(COUNT({v}) = 0)"), boolean),
            "hasValue" => (format!("(COUNT({v}) = 1)"), boolean),
            "isDistinct" => (format!("(COUNT({v}) = COUNT(DISTINCT {v}))"), boolean),
            "all" => {
                let Some(criteria) = arg else {
                    return Err(TranslationError::invalid_argument(name, "missing criteria").into());
                };
                let body = self.lambda_body(Binding::this(item.clone()), stage.cloned(), criteria)?;
                refs.extend(body.refs.iter().cloned());
                let cond = self.boolean_sql(&body, name)?;
                (
                    format!(
                        "COALESCE(BOOL_AND(CASE WHEN {v} IS NULL THEN TRUE ELSE COALESCE({cond}, FALSE) END), TRUE)"
                    ),
                    boolean,
                )
            }
            "allTrue" | "anyTrue" | "allFalse" | "anyFalse" => {
                let b = self.boolean_sql(item, name)?;
                let sql = match name {
                    "allTrue" => format!("COALESCE(BOOL_AND({b}), TRUE)"),
                    "anyTrue" => format!("COALESCE(BOOL_OR({b}), FALSE)"),
                    "allFalse" => format!("COALESCE(BOOL_AND(NOT {b}), TRUE)"),
                    _ => format!("COALESCE(BOOL_OR(NOT {b}), FALSE)"),
                };
                (sql, boolean)
            }
            "min" | "max" if item.is_json() => {
                return Ok((self.json_extremum(name, &v), None, refs));
            }
            "sum" | "min" | "max" => {
                let func = name.to_ascii_uppercase();
                if name != "sum" && self.is_text(item) {
                    (format!("{func}({v})"), item.data_type().unwrap_or(FhirPathType::String))
                } else {
                    let ty = self.numeric_type(item).ok_or_else(|| {
                        TranslationError::invalid_argument(name, "items are not numeric")
                    })?;
                    let n = self.numeric_sql(item, ty, name)?;
                    (d.generate_type_cast(&format!("{func}({n})"), ty), ty)
                }
            }
            "avg" => {
                let n = self.numeric_sql(item, FhirPathType::Decimal, name)?;
                (format!("AVG({n})"), FhirPathType::Decimal)
            }
            "join" => {
                let separator = match arg {
                    Some(node) => {
                        let operand = self.visit(node)?;
                        if !operand.is_constant() {
                            return Err(TranslationError::invalid_argument(
                                name,
                                "the separator must be a constant",
                            )
                            .into());
                        }
                        self.text_sql(&operand)?
                    }
                    None => d.string_literal(""),
                };
                let text = self.text_sql(item)?;
                (
                    format!("COALESCE({}, '')", d.string_aggregate(&text, &separator)),
                    FhirPathType::String,
                )
            }
            _ => return Err(TranslationError::unknown_function(name).into()),
        };
        Ok((sql, Some(ty), refs))
    }

    /// `min()`/`max()` over JSON items: numeric when every item is a number,
    /// text order otherwise (strings, dates and times).
    fn json_extremum(&self, name: &str, v: &str) -> String {
        let d = &self.dialect;
        let func = name.to_ascii_uppercase();
        let number = format!(
            "({} OR {})",
            d.generate_type_check(v, FhirPathType::Integer),
            d.generate_type_check(v, FhirPathType::Decimal)
        );
        let text = d.json_to_text(v);
        let numeric = d.generate_type_cast(&text, FhirPathType::Decimal);
        format!(
            "(CASE WHEN BOOL_AND(CASE WHEN {v} IS NOT NULL THEN {number} END) THEN {} ELSE {} END)",
            d.to_json(&format!("{func}(CASE WHEN {number} THEN {numeric} END)")),
            d.to_json(&format!("{func}({text})"))
        )
    }

    fn ranked(&mut self, input: Operand, rank: Rank) -> Result<Operand> {
        if input.is_empty() {
            return Ok(input);
        }
        if !input.is_collection() && (self.context.inline || input.is_constant()) {
            return Ok(match rank.on_single() {
                Some(true) => input,
                _ => Operand::empty(),
            });
        }

        if self.context.inline {
            let array = self.array_sql(&input)?;
            let d = self.dialect.clone();
            return Ok(match rank {
                Rank::First => input.json_sql(d.json_array_element(&array, 0)),
                Rank::Last => input.json_sql(d.json_array_element(&array, -1)),
                Rank::At(n) => input.json_sql(d.json_array_element(&array, n)),
                _ => {
                    let a = self.context.next_local("k");
                    let r = self.context.next_local("r");
                    input.json_array(format!(
                        "(SELECT COALESCE({}, {}) FROM (SELECT {a}.value, ROW_NUMBER() OVER (ORDER BY {a}.ord) AS rn, \
                         COUNT(*) OVER () AS cnt FROM {}) AS {r} WHERE {})",
                        d.json_aggregate(&format!("{r}.value"), false),
                        d.empty_collection(),
                        d.json_array_elements(&array, &a),
                        rank.condition(&r)
                    ))
                }
            });
        }

        let stage = self.materialize(&input)?;
        let r = self.context.next_local("r");
        let s = &stage.name;
        let outer_id = if stage.keyed { format!("{r}.id, ") } else { String::new() };
        let outer_pos = if stage.ordered { format!(", {r}.pos") } else { String::new() };
        let partition = if stage.keyed { format!("PARTITION BY {s}.id") } else { String::new() };
        let sql = format!(
            "SELECT {outer_id}{r}.value{outer_pos} FROM (SELECT {}, \
             ROW_NUMBER() OVER ({}) AS rn, COUNT(*) OVER ({partition}) AS cnt \
             FROM {s} WHERE {s}.value IS NOT NULL) AS {r} WHERE {}",
            item_columns(&stage),
            item_window(&stage),
            rank.condition(&r)
        );
        let out = self.emit_query(
            sql,
            &single_ref(s),
            StageShape::like(&stage)
                .collection(!rank.single())
                .ordered(stage.ordered),
        );
        Ok(Operand::from_stage(&out))
    }

    fn distinct(&mut self, input: Operand) -> Result<Operand> {
        if input.is_empty() {
            return Ok(input);
        }
        if self.context.inline {
            let array = self.array_sql(&input)?;
            return Ok(input.json_array(self.dialect.generate_array_distinct(&array)));
        }
        let stage = self.materialize(&input)?;
        let sql = format!(
            "SELECT DISTINCT {} FROM {s} WHERE {s}.value IS NOT NULL",
            stage_columns(&stage),
            s = stage.name
        );
        let out = self.emit_query(
            sql,
            &single_ref(&stage.name),
            StageShape::like(&stage).collection(true),
        );
        Ok(Operand::from_stage(&out))
    }

    fn not_function(&mut self, input: Operand) -> Result<Operand> {
        if input.is_empty() {
            return Ok(input);
        }
        let input = self.unify_one(input)?;
        let b = self.boolean_sql(&input, "not")?;
        Ok(input.sql(format!("(NOT {b})"), Some(FhirPathType::Boolean)))
    }

    /// `iif(criterion, true-result [, otherwise-result])`, per input item.
    fn iif(&mut self, input: Operand, args: &[ExpressionNode]) -> Result<Operand> {
        let item = if !self.context.inline && input.is_collection() {
            self.unify_one(input)?
        } else {
            input
        };
        let row = item.source.stage().cloned();
        let binding = Binding::this(item.clone());

        let criterion = self.lambda_body(binding.clone(), row.clone(), &args[0])?;
        let then = self.lambda_body(binding.clone(), row.clone(), &args[1])?;
        let otherwise = match args.get(2) {
            Some(node) => self.lambda_body(binding, row, node)?,
            None => Operand::empty(),
        };
        if then.is_empty() && otherwise.is_empty() {
            return Ok(Operand::empty());
        }

        let cond = self.boolean_sql(&criterion, "iif")?;
        let collection = then.is_collection() || otherwise.is_collection();
        let mixed = !then.is_empty() && !otherwise.is_empty() && then.data_type() != otherwise.data_type();
        let json = collection || then.is_json() || otherwise.is_json() || mixed;
        let branch = |t: &Self, operand: &Operand| -> Result<String> {
            if operand.is_empty() {
                Ok("NULL".to_string())
            } else if collection {
                t.array_sql(operand)
            } else if json {
                t.json_value_sql(operand)
            } else {
                t.scalar_sql(operand)
            }
        };
        let sql = format!(
            "(CASE WHEN COALESCE({cond}, FALSE) THEN {} ELSE {} END)",
            branch(self, &then)?,
            branch(self, &otherwise)?
        );
        let data_type = match (json, then.is_empty()) {
            (true, _) => None,
            (false, true) => otherwise.data_type(),
            (false, false) => then.data_type(),
        };

        let mut out = item.with_value(Value::Sql {
            sql,
            data_type,
            json,
            collection,
        });
        out.absorb_refs(&criterion);
        out.absorb_refs(&then);
        out.absorb_refs(&otherwise);
        Ok(out)
    }

    /// `union`, `combine`, `intersect`, `exclude`, `subsetOf` and `supersetOf`.
    ///
    /// The argument is evaluated with the focus of the call, not per item.
    fn set_function(&mut self, name: &str, input: Operand, other: &ExpressionNode) -> Result<Operand> {
        let other = self.visit(other)?;

        if self.context.inline {
            let (a, b) = (self.array_sql(&input)?, self.array_sql(&other)?);
            let d = &self.dialect;
            let out = joined(&input, &other);
            return Ok(match name {
                "union" => out.json_array(d.generate_array_union(&a, &b)),
                "combine" => out.json_array(d.generate_array_combine(&a, &b)),
                "intersect" => out.json_array(d.generate_array_intersect(&a, &b)),
                "exclude" => out.json_array(d.generate_array_exclude(&a, &b)),
                "subsetOf" => out.sql(
                    d.generate_empty_check(&d.generate_array_exclude(&a, &b)),
                    Some(FhirPathType::Boolean),
                ),
                "supersetOf" => out.sql(
                    d.generate_empty_check(&d.generate_array_exclude(&b, &a)),
                    Some(FhirPathType::Boolean),
                ),
                _ => return Err(TranslationError::unknown_function(name).into()),
            });
        }

        let left = self.materialize(&input)?;
        let right = self.materialize(&other)?;
        let (left, right) = self.align_stages(left, right)?;
        let (l, r) = (left.name.clone(), right.name.clone());
        let keyed = left.keyed;
        let (lc, rc) = (stage_columns(&left), stage_columns(&right));
        let x = self.context.next_local("x");

        let mut deps = IndexSet::new();
        deps.insert(l.clone());
        deps.insert(r.clone());
        let collection = StageShape::like(&left).collection(true);

        let (sql, shape) = match name {
            "combine" => (
                format!("SELECT {lc} FROM {l} UNION ALL SELECT {rc} FROM {r}"),
                collection,
            ),
            "union" => {
                let u = self.context.next_local("u");
                let columns = if keyed {
                    format!("{u}.id, {u}.value")
                } else {
                    format!("{u}.value")
                };
                (
                    format!(
                        "SELECT DISTINCT {columns} FROM (SELECT {lc} FROM {l} UNION ALL \
                         SELECT {rc} FROM {r}) AS {u} WHERE {u}.value IS NOT NULL"
                    ),
                    collection,
                )
            }
            "intersect" => (
                format!(
                    "SELECT {lc} FROM {l} WHERE {l}.value IS NOT NULL INTERSECT SELECT {rc} FROM {r}"
                ),
                collection,
            ),
            "exclude" => {
                let same_id = if keyed {
                    format!("{x}.id = {l}.id AND ")
                } else {
                    String::new()
                };
                (
                    format!(
                        "SELECT {lc} FROM {l} WHERE {l}.value IS NOT NULL AND NOT EXISTS \
                         (SELECT 1 FROM {r} AS {x} WHERE {same_id}{x}.value = {l}.value)"
                    ),
                    collection,
                )
            }
            "subsetOf" | "supersetOf" => {
                let (sub, sup) = if name == "subsetOf" { (&l, &r) } else { (&r, &l) };
                let y = self.context.next_local("y");
                let root = left.root_name().to_string();
                let (outer_id, inner_id) = if keyed {
                    (format!("{y}.id = {root}.id AND "), format!("{x}.id = {y}.id AND "))
                } else {
                    (String::new(), String::new())
                };
                let test = format!(
                    "NOT EXISTS (SELECT 1 FROM {sub} AS {y} WHERE {outer_id}{y}.value IS NOT NULL \
                     AND NOT EXISTS (SELECT 1 FROM {sup} AS {x} WHERE {inner_id}{x}.value = {y}.value))"
                );
                let sql = if keyed {
                    deps.insert(root.clone());
                    format!("SELECT {root}.id, {test} AS value FROM {root}")
                } else {
                    format!("SELECT {test} AS value")
                };
                (
                    sql,
                    StageShape::over(Some(&left)).typed(Some(FhirPathType::Boolean)),
                )
            }
            _ => return Err(TranslationError::unknown_function(name).into()),
        };

        let out = self.emit_query(sql, &deps, shape);
        Ok(Operand::from_stage(&out))
    }

    /// Give two stages the same key and value representation.
    fn align_stages(&mut self, left: StageRef, right: StageRef) -> Result<(StageRef, StageRef)> {
        let (mut left, mut right) = (left, right);
        if left.keyed != right.keyed {
            let root = if left.keyed {
                left.root_name().to_string()
            } else {
                right.root_name().to_string()
            };
            let lift = |t: &mut Self, stage: &StageRef| {
                let mut deps = single_ref(&root);
                deps.insert(stage.name.clone());
                t.emit_query(
                    format!(
                        "SELECT {root}.id AS id, {0}.value AS value FROM {root} CROSS JOIN {0}",
                        stage.name
                    ),
                    &deps,
                    StageShape {
                        keyed: true,
                        root: Some(root.clone()),
                        json: stage.json,
                        data_type: stage.data_type,
                        collection: true,
                        ..StageShape::default()
                    },
                )
            };
            if left.keyed {
                right = lift(self, &right);
            } else {
                left = lift(self, &left);
            }
        }

        let mismatch = left.json != right.json || (!left.json && left.data_type != right.data_type);
        if mismatch {
            if !left.json {
                left = self.json_stage(&left);
            }
            if !right.json {
                right = self.json_stage(&right);
            }
        }
        Ok((left, right))
    }

    fn json_stage(&mut self, stage: &StageRef) -> StageRef {
        let expr = self.dialect.to_json(&stage.value());
        self.emit_column(
            Some(stage),
            expr,
            &IndexSet::new(),
            StageShape::default().json(true).collection(true),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::{translate, translator};
    use super::*;
    use crate::Error;
    use crate::dialect::DialectKind;

    fn patient() -> ExpressionNode {
        ExpressionNode::identifier("Patient")
    }

    fn eq(l: ExpressionNode, r: ExpressionNode) -> ExpressionNode {
        ExpressionNode::binary(BinaryOperator::Equal, l, r)
    }

    #[test]
    fn test_function_table() {
        assert_eq!(lookup("where").map(|f| f.arity), Some(Arity::exactly(1)));
        assert!(lookup("frobnicate").is_none());
        assert!(supported_functions().any(|f| f == "aggregate"));
    }

    #[test]
    fn test_unknown_function() {
        let err = translate(&patient().method("frobnicate", vec![])).unwrap_err();
        assert!(matches!(
            err,
            Error::Translation(TranslationError::UnknownFunction { ref name }) if name == "frobnicate"
        ));
    }

    #[test]
    fn test_arity_counts_explicit_arguments_only() {
        // The receiver of `'abc'.substring(1)` is not an argument.
        let ok = ExpressionNode::string("abc").method("substring", vec![ExpressionNode::integer(1)]);
        assert!(translate(&ok).is_ok());

        let err = translate(&ExpressionNode::string("abc").method(
            "substring",
            vec![
                ExpressionNode::integer(1),
                ExpressionNode::integer(2),
                ExpressionNode::integer(3),
            ],
        ))
        .unwrap_err();
        assert!(matches!(
            err,
            Error::Translation(TranslationError::InvalidArity {
                actual: 3,
                expected: Arity { min: 1, max: 2 },
                ..
            })
        ));

        let err = translate(&patient().method("where", vec![])).unwrap_err();
        assert!(err.to_string().contains("where()"));
    }

    #[test]
    fn test_where_filters_unnested_items() {
        let expr = patient().path("name").method(
            "where",
            vec![eq(ExpressionNode::identifier("use"), ExpressionNode::string("official"))],
        );
        let t = translate(&expr).unwrap();
        assert_eq!(t.fragments.len(), 3);
        assert!(t.fragments[1].requires_unnest);
        assert_eq!(
            t.fragments[2].expression,
            "SELECT cte_2.id, cte_2.value, cte_2.pos FROM cte_2 WHERE COALESCE(\
             ((jsonb_extract_path(cte_2.value, 'use') #>> '{}') = 'official'), FALSE)"
        );
        assert!(t.result.keyed);
    }

    #[test]
    fn test_where_with_index_numbers_items() {
        let expr = patient().path("name").method(
            "where",
            vec![ExpressionNode::binary(
                BinaryOperator::LessThan,
                ExpressionNode::variable("$index"),
                ExpressionNode::integer(1),
            )],
        );
        let t = translate(&expr).unwrap();
        assert!(t.fragments[2].expression.contains("ROW_NUMBER() OVER (PARTITION BY cte_2.id ORDER BY cte_2.pos) - 1 AS item_index"));
        assert!(t.fragments[3].expression.contains("(cte_3.item_index < 1)"));
    }

    #[test]
    fn test_lambda_scope_is_restored() {
        let mut t = translator(DialectKind::Postgres);
        let expr = patient()
            .path("name")
            .method("where", vec![ExpressionNode::identifier("family").method("exists", vec![])]);
        t.visit(&expr).unwrap();
        assert_eq!(t.context().depth(), 0);
        assert!(t.context().focus.is_none());
        assert!(!t.context().inline);

        // `$this` after the lambda is a resource again.
        let this = t.visit(&ExpressionNode::variable("$this")).unwrap();
        assert!(this.as_stage().is_some_and(|s| s.root_name() == s.name));
    }

    #[test]
    fn test_count_groups_by_resource() {
        let t = translate(&patient().path("name").method("count", vec![])).unwrap();
        assert_eq!(
            t.fragments.last().unwrap().expression,
            "SELECT cte_1.id, COUNT(cte_2.value) AS value FROM cte_1 \
             LEFT JOIN cte_2 ON cte_2.id = cte_1.id GROUP BY cte_1.id"
        );
        assert_eq!(t.result.data_type, Some(FhirPathType::Integer));
    }

    #[test]
    fn test_exists_with_criteria_inside_where_stays_inline() {
        let expr = patient().method(
            "where",
            vec![ExpressionNode::identifier("telecom").method(
                "exists",
                vec![eq(ExpressionNode::identifier("system"), ExpressionNode::string("phone"))],
            )],
        );
        let t = translate(&expr).unwrap();
        assert_eq!(t.fragments.len(), 2);
        let sql = &t.fragments[1].expression;
        assert!(sql.contains("(SELECT (COUNT(a2.value) > 0) FROM jsonb_array_elements((SELECT COALESCE(jsonb_agg(w1.value)"), "{sql}");
    }

    #[test]
    fn test_first_and_skip() {
        let t = translate(&patient().path("name").method("first", vec![])).unwrap();
        let sql = &t.fragments.last().unwrap().expression;
        assert!(sql.contains("ROW_NUMBER() OVER (PARTITION BY cte_2.id ORDER BY cte_2.pos) AS rn"));
        assert!(sql.contains("COUNT(*) OVER (PARTITION BY cte_2.id) AS cnt"));
        assert!(sql.ends_with("WHERE r1.rn = 1"));

        let err = translate(&patient().path("name").method(
            "skip",
            vec![ExpressionNode::identifier("count")],
        ))
        .unwrap_err();
        assert!(matches!(
            err,
            Error::Translation(TranslationError::InvalidArgument { .. })
        ));
    }

    #[test]
    fn test_indexer_inline_uses_array_element() {
        let expr = patient().method(
            "select",
            vec![ExpressionNode::identifier("name").index(ExpressionNode::integer(1))],
        );
        let t = translate(&expr).unwrap();
        assert!(t.fragments.last().unwrap().expression.contains("-> 1)"));
    }

    #[test]
    fn test_select_is_lazy() {
        let t = translate(&patient().path("name").method(
            "select",
            vec![ExpressionNode::identifier("family")],
        ))
        .unwrap();
        assert_eq!(t.fragments.len(), 3);
        assert_eq!(
            t.fragments[2].expression,
            "jsonb_extract_path(cte_2.value, 'family')"
        );
    }

    #[test]
    fn test_repeat_is_depth_bounded() {
        let expr = ExpressionNode::identifier("Questionnaire")
            .method("repeat", vec![ExpressionNode::identifier("item")]);
        let t = translate(&expr).unwrap();
        let sql = &t.fragments.last().unwrap().expression;
        assert!(sql.starts_with("WITH RECURSIVE walk1(id, value, depth) AS ("));
        assert!(sql.contains("WHERE w2.depth < 10"));
        assert!(sql.ends_with("WHERE walk1.depth > 0"));
    }

    #[test]
    fn test_repeat_inside_lambda_is_unsupported() {
        let expr = patient().method(
            "where",
            vec![ExpressionNode::identifier("link")
                .method("repeat", vec![ExpressionNode::identifier("other")])
                .method("exists", vec![])],
        );
        assert!(matches!(
            translate(&expr),
            Err(Error::Translation(TranslationError::Unsupported { .. }))
        ));
    }

    #[test]
    fn test_aggregate_folds_recursively() {
        let expr = ExpressionNode::integer(1).method(
            "aggregate",
            vec![
                ExpressionNode::binary(
                    BinaryOperator::Add,
                    ExpressionNode::variable("$total"),
                    ExpressionNode::variable("$this"),
                ),
                ExpressionNode::integer(0),
            ],
        );
        let t = translate(&expr).unwrap();
        let sql = &t.fragments.last().unwrap().expression;
        assert!(sql.starts_with("WITH RECURSIVE items1 AS"));
        assert!(sql.contains("fold2(step, total) AS (SELECT 0, CAST(0 AS BIGINT)"));
        assert!(sql.contains("CAST((f3.total + i4.value) AS BIGINT)"));
        assert_eq!(t.result.data_type, Some(FhirPathType::Integer));
    }

    #[test]
    fn test_set_operations() {
        let given = patient().path("name").path("given");
        let family = patient().path("name").path("family");

        let t = translate(&given.clone().method("union", vec![family.clone()])).unwrap();
        let sql = &t.fragments.last().unwrap().expression;
        assert!(sql.starts_with("SELECT DISTINCT u2.id, u2.value FROM ("));

        let t = translate(&given.clone().method("exclude", vec![family.clone()])).unwrap();
        assert!(t.fragments.last().unwrap().expression.contains("NOT EXISTS (SELECT 1 FROM"));

        let t = translate(&given.method("subsetOf", vec![family])).unwrap();
        assert_eq!(t.result.data_type, Some(FhirPathType::Boolean));
        assert!(t.result.keyed);
    }

    #[test]
    fn test_set_operation_inline() {
        let expr = patient().method(
            "where",
            vec![ExpressionNode::identifier("name")
                .path("given")
                .method("subsetOf", vec![ExpressionNode::identifier("name").path("family")])],
        );
        let t = translate(&expr).unwrap();
        assert!(t.fragments[1].expression.contains("jsonb_array_length"));
    }

    #[test]
    fn test_iif() {
        let expr = ExpressionNode::function(
            "iif",
            vec![
                eq(ExpressionNode::identifier("gender"), ExpressionNode::string("male")),
                ExpressionNode::string("M"),
                ExpressionNode::string("F"),
            ],
        );
        let t = translate(&expr).unwrap();
        assert_eq!(
            t.fragments.last().unwrap().expression,
            "(CASE WHEN COALESCE(((jsonb_extract_path(cte_1.value, 'gender') #>> '{}') = 'male'), FALSE) \
             THEN 'M' ELSE 'F' END)"
        );
        assert_eq!(t.result.data_type, Some(FhirPathType::String));
    }

    #[test]
    fn test_extension_desugars_to_where() {
        let expr = patient().method("extension", vec![ExpressionNode::string("http://x")]);
        let t = translate(&expr).unwrap();
        let sql = &t.fragments.last().unwrap().expression;
        assert!(sql.contains("jsonb_extract_path(cte_2.value, 'url')"));
        assert!(sql.contains("'http://x'"));
    }

    #[test]
    fn test_join_and_all() {
        let t = translate(&patient().path("name").path("given").method(
            "join",
            vec![ExpressionNode::string(", ")],
        ))
        .unwrap();
        assert!(t.fragments.last().unwrap().expression.contains("COALESCE(STRING_AGG("));

        let t = translate(&patient().path("name").method(
            "all",
            vec![ExpressionNode::identifier("family").method("exists", vec![])],
        ))
        .unwrap();
        assert!(t.fragments.last().unwrap().expression.contains("BOOL_AND(CASE WHEN cte_2.value IS NULL THEN TRUE"));
    }

    #[test]
    fn test_max_of_json_items_picks_comparison_at_run_time() {
        let t = translate(&patient().path("name").path("given").method("max", vec![])).unwrap();
        let sql = &t.fragments.last().unwrap().expression;
        assert!(sql.contains("(CASE WHEN BOOL_AND(CASE WHEN cte_3.value IS NOT NULL THEN ("), "{sql}");
        assert!(sql.contains("THEN to_jsonb(MAX(CASE WHEN"));
        assert!(sql.contains("ELSE to_jsonb(MAX((cte_3.value #>> '{}'))) END)"));
        assert!(t.result.json);
        assert_eq!(t.result.data_type, None);

        let t = translate(&ExpressionNode::integer(3).method("min", vec![])).unwrap();
        assert_eq!(t.result.data_type, Some(FhirPathType::Integer));
        assert!(t.fragments.last().unwrap().expression.contains("CAST(MIN("));
    }

    #[test]
    fn test_ranking_follows_array_order() {
        let t = translate(&patient().path("name").path("given").method("first", vec![])).unwrap();
        let names = &t.fragments[1].metadata;
        assert!(names.contains_key(crate::fragment::meta::POSITION_COLUMN));
        assert!(t.fragments[2].is_ordered());
        let sql = &t.fragments.last().unwrap().expression;
        assert!(sql.contains("ROW_NUMBER() OVER (PARTITION BY cte_3.id ORDER BY cte_3.pos) AS rn"), "{sql}");

        let t = translate(&ExpressionNode::integer(1).method("first", vec![])).unwrap();
        assert!(!t.fragments.last().unwrap().expression.contains("ROW_NUMBER"));
    }

    #[test]
    fn test_inline_ranking_orders_by_ordinal() {
        let expr = patient().method(
            "where",
            vec![ExpressionNode::identifier("telecom").method("tail", vec![]).method("exists", vec![])],
        );
        let t = translate(&expr).unwrap();
        let sql = &t.fragments.last().unwrap().expression;
        assert!(sql.contains("ROW_NUMBER() OVER (ORDER BY k"), "{sql}");
        assert!(sql.contains("WITH ORDINALITY AS k"));
    }
}
