//! Intermediate values produced while walking the AST.
//!
//! An [`Operand`] is SQL relative to a row: either a constant, or an
//! expression over the columns of one stage (a CTE already emitted). JSON
//! navigation is kept symbolic until something needs the rows, so scalar
//! steps never cost a CTE.

use indexmap::IndexSet;

use crate::dialect::{JsonPath, PathStep};
use crate::types::FhirPathType;

/// An emitted CTE, seen from the translator.
#[derive(Debug, Clone, PartialEq)]
pub struct StageRef {
    pub name: String,
    /// Carries the per-resource `id` column.
    pub keyed: bool,
    /// `value` holds JSON.
    pub json: bool,
    pub data_type: Option<FhirPathType>,
    /// Root stage the ids come from.
    pub root: Option<String>,
    /// Carries a `pos` column numbering items in collection order.
    pub ordered: bool,
}

impl StageRef {
    pub fn value(&self) -> String {
        format!("{}.value", self.name)
    }

    pub fn id(&self) -> String {
        format!("{}.id", self.name)
    }

    /// Name of the root stage for keyed stages.
    pub fn root_name(&self) -> &str {
        self.root.as_deref().unwrap_or(&self.name)
    }
}

/// Which row an operand is evaluated against.
#[derive(Debug, Clone, PartialEq)]
pub enum Source {
    Constant,
    Row(StageRef),
}

impl Source {
    pub fn stage(&self) -> Option<&StageRef> {
        match self {
            Self::Constant => None,
            Self::Row(stage) => Some(stage),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// JSON reached from `base` by `path`.
    Json { base: String, path: JsonPath },
    /// A computed expression. `collection` values are JSON arrays.
    Sql {
        sql: String,
        data_type: Option<FhirPathType>,
        json: bool,
        collection: bool,
    },
    /// The empty collection, known statically.
    Empty,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Operand {
    pub source: Source,
    pub value: Value,
    /// Stages referenced by the SQL of `value`.
    pub refs: IndexSet<String>,
}

impl Operand {
    pub fn constant(sql: impl Into<String>, data_type: Option<FhirPathType>) -> Self {
        Self {
            source: Source::Constant,
            value: Value::Sql {
                sql: sql.into(),
                data_type,
                json: false,
                collection: false,
            },
            refs: IndexSet::new(),
        }
    }

    pub fn json_constant(sql: impl Into<String>, data_type: Option<FhirPathType>) -> Self {
        Self {
            source: Source::Constant,
            value: Value::Sql {
                sql: sql.into(),
                data_type,
                json: true,
                collection: false,
            },
            refs: IndexSet::new(),
        }
    }

    pub fn empty() -> Self {
        Self {
            source: Source::Constant,
            value: Value::Empty,
            refs: IndexSet::new(),
        }
    }

    /// The `value` column of a stage.
    pub fn from_stage(stage: &StageRef) -> Self {
        let value = if stage.json {
            Value::Json {
                base: stage.value(),
                path: JsonPath::default(),
            }
        } else {
            Value::Sql {
                sql: stage.value(),
                data_type: stage.data_type,
                json: false,
                collection: false,
            }
        };
        let mut refs = IndexSet::new();
        refs.insert(stage.name.clone());
        Self {
            source: Source::Row(stage.clone()),
            value,
            refs,
        }
    }

    /// JSON rooted at an alias that lives inside a subquery (`alias.value`).
    pub fn element(alias: &str) -> Self {
        Self {
            source: Source::Constant,
            value: Value::Json {
                base: format!("{alias}.value"),
                path: JsonPath::default(),
            },
            refs: IndexSet::new(),
        }
    }

    /// Same source and references, new value.
    pub fn with_value(&self, value: Value) -> Self {
        Self {
            source: self.source.clone(),
            value,
            refs: self.refs.clone(),
        }
    }

    pub fn sql(&self, sql: impl Into<String>, data_type: Option<FhirPathType>) -> Self {
        self.with_value(Value::Sql {
            sql: sql.into(),
            data_type,
            json: false,
            collection: false,
        })
    }

    pub fn json_sql(&self, sql: impl Into<String>) -> Self {
        self.with_value(Value::Sql {
            sql: sql.into(),
            data_type: None,
            json: true,
            collection: false,
        })
    }

    pub fn json_array(&self, sql: impl Into<String>) -> Self {
        self.with_value(Value::Sql {
            sql: sql.into(),
            data_type: None,
            json: true,
            collection: true,
        })
    }

    pub fn is_empty(&self) -> bool {
        matches!(self.value, Value::Empty)
    }

    pub fn is_collection(&self) -> bool {
        match &self.value {
            Value::Json { path, .. } => path.is_collection(),
            Value::Sql { collection, .. } => *collection,
            Value::Empty => false,
        }
    }

    pub fn is_json(&self) -> bool {
        match &self.value {
            Value::Json { .. } => true,
            Value::Sql { json, .. } => *json,
            Value::Empty => false,
        }
    }

    pub fn data_type(&self) -> Option<FhirPathType> {
        match &self.value {
            Value::Sql { data_type, .. } => *data_type,
            _ => None,
        }
    }

    pub fn is_constant(&self) -> bool {
        matches!(self.source, Source::Constant)
    }

    /// The stage this operand is exactly the `value` column of, if any.
    pub fn as_stage(&self) -> Option<&StageRef> {
        let Source::Row(stage) = &self.source else {
            return None;
        };
        let column = stage.value();
        let exact = match &self.value {
            Value::Json { base, path } => {
                *base == column && path.steps.is_empty() && !path.from_collection
            }
            Value::Sql {
                sql, collection, ..
            } => *sql == column && !collection,
            Value::Empty => false,
        };
        exact.then_some(stage)
    }

    /// One more navigation step, for JSON values.
    pub fn step(&self, name: &str, repeating: bool) -> Option<Self> {
        let value = match &self.value {
            Value::Json { base, path } => {
                let mut path = path.clone();
                path.steps.push(PathStep::new(name, repeating));
                Value::Json {
                    base: base.clone(),
                    path,
                }
            }
            Value::Sql {
                sql,
                json: true,
                collection,
                ..
            } => Value::Json {
                base: sql.clone(),
                path: JsonPath {
                    from_collection: *collection,
                    steps: vec![PathStep::new(name, repeating)],
                },
            },
            Value::Empty => Value::Empty,
            Value::Sql { .. } => return None,
        };
        Some(self.with_value(value))
    }

    /// Merge the references of another operand into this one.
    pub fn absorb_refs(&mut self, other: &Operand) {
        self.refs.extend(other.refs.iter().cloned());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stage(json: bool) -> StageRef {
        StageRef {
            name: "cte_1".into(),
            keyed: true,
            json,
            data_type: None,
            root: Some("cte_1".into()),
            ordered: false,
        }
    }

    #[test]
    fn test_stage_operand_round_trip() {
        let op = Operand::from_stage(&stage(true));
        assert_eq!(op.as_stage().map(|s| s.name.as_str()), Some("cte_1"));
        assert!(op.refs.contains("cte_1"));

        let stepped = op.step("name", true).unwrap();
        assert!(stepped.as_stage().is_none());
        assert!(stepped.is_collection());
    }

    #[test]
    fn test_typed_values_do_not_navigate() {
        let op = Operand::constant("5", Some(FhirPathType::Integer));
        assert!(op.step("value", false).is_none());
        assert!(Operand::empty().step("x", false).unwrap().is_empty());
    }

    #[test]
    fn test_json_array_step_flattens() {
        let op = Operand::constant("x", None).json_array("arr");
        let stepped = op.step("given", false).unwrap();
        match stepped.value {
            Value::Json { base, path } => {
                assert_eq!(base, "arr");
                assert!(path.from_collection);
            }
            other => panic!("unexpected value: {other:?}"),
        }
    }
}
