//! FHIRPath AST consumed by the translator.
//!
//! The parser producing these nodes lives outside this crate; the node set is
//! closed so the translator can match on it exhaustively. Nodes serialize with
//! serde so a parser in another process can hand trees over as JSON.

use std::fmt;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// A FHIRPath expression node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ExpressionNode {
    /// Literal value (`'abc'`, `5`, `true`, `@2020-01-01`, `{}`).
    Literal(LiteralValue),

    /// Identifier at the start of an expression (`Patient`, `name`).
    Identifier(String),

    /// Member navigation (`base.name`).
    Path {
        base: Box<ExpressionNode>,
        name: String,
    },

    /// Indexer (`base[index]`).
    Index {
        base: Box<ExpressionNode>,
        index: Box<ExpressionNode>,
    },

    /// Binary operator.
    BinaryOp(Box<BinaryOpData>),

    /// Unary operator.
    UnaryOp {
        op: UnaryOperator,
        operand: Box<ExpressionNode>,
    },

    /// Function call. `target` is the receiver of a method call
    /// (`'s'.indexOf('x')`) and is never counted as an argument.
    FunctionCall(Box<FunctionCallData>),

    /// `is` / `as` type operator.
    TypeOperation(Box<TypeOperationData>),

    /// `$this`, `$index`, `$total` or `%name`.
    Variable(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BinaryOpData {
    pub op: BinaryOperator,
    pub left: ExpressionNode,
    pub right: ExpressionNode,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCallData {
    pub target: Option<ExpressionNode>,
    pub name: String,
    #[serde(default)]
    pub args: Vec<ExpressionNode>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypeOperationData {
    pub op: TypeOperator,
    pub expression: ExpressionNode,
    pub type_name: String,
}

/// Literal values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LiteralValue {
    Boolean(bool),
    Integer(i64),
    Decimal(Decimal),
    String(String),
    Date(String),
    DateTime(String),
    Time(String),
    Quantity { value: Decimal, unit: String },
    /// The empty collection `{}`.
    Empty,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BinaryOperator {
    Add,
    Subtract,
    Multiply,
    Divide,
    IntegerDivide,
    Modulo,
    Concatenate,
    Equal,
    NotEqual,
    Equivalent,
    NotEquivalent,
    LessThan,
    LessOrEqual,
    GreaterThan,
    GreaterOrEqual,
    And,
    Or,
    Xor,
    Implies,
    Union,
    In,
    Contains,
}

impl BinaryOperator {
    /// FHIRPath spelling of the operator.
    pub fn symbol(self) -> &'static str {
        match self {
            Self::Add => "+",
            Self::Subtract => "-",
            Self::Multiply => "*",
            Self::Divide => "/",
            Self::IntegerDivide => "div",
            Self::Modulo => "mod",
            Self::Concatenate => "&",
            Self::Equal => "=",
            Self::NotEqual => "!=",
            Self::Equivalent => "~",
            Self::NotEquivalent => "!~",
            Self::LessThan => "<",
            Self::LessOrEqual => "<=",
            Self::GreaterThan => ">",
            Self::GreaterOrEqual => ">=",
            Self::And => "and",
            Self::Or => "or",
            Self::Xor => "xor",
            Self::Implies => "implies",
            Self::Union => "|",
            Self::In => "in",
            Self::Contains => "contains",
        }
    }

    pub fn is_arithmetic(self) -> bool {
        matches!(
            self,
            Self::Add
                | Self::Subtract
                | Self::Multiply
                | Self::Divide
                | Self::IntegerDivide
                | Self::Modulo
        )
    }

    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            Self::Equal
                | Self::NotEqual
                | Self::Equivalent
                | Self::NotEquivalent
                | Self::LessThan
                | Self::LessOrEqual
                | Self::GreaterThan
                | Self::GreaterOrEqual
        )
    }

    pub fn is_boolean(self) -> bool {
        matches!(self, Self::And | Self::Or | Self::Xor | Self::Implies)
    }
}

impl fmt::Display for BinaryOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum UnaryOperator {
    Plus,
    Minus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TypeOperator {
    Is,
    As,
}

impl fmt::Display for TypeOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Is => f.write_str("is"),
            Self::As => f.write_str("as"),
        }
    }
}

// Builders used by callers that assemble trees by hand (tests, adapters).
impl ExpressionNode {
    pub fn identifier(name: impl Into<String>) -> Self {
        Self::Identifier(name.into())
    }

    pub fn variable(name: impl Into<String>) -> Self {
        Self::Variable(name.into())
    }

    pub fn integer(value: i64) -> Self {
        Self::Literal(LiteralValue::Integer(value))
    }

    pub fn decimal(value: Decimal) -> Self {
        Self::Literal(LiteralValue::Decimal(value))
    }

    pub fn string(value: impl Into<String>) -> Self {
        Self::Literal(LiteralValue::String(value.into()))
    }

    pub fn boolean(value: bool) -> Self {
        Self::Literal(LiteralValue::Boolean(value))
    }

    pub fn empty() -> Self {
        Self::Literal(LiteralValue::Empty)
    }

    /// Member navigation on this node.
    pub fn path(self, name: impl Into<String>) -> Self {
        Self::Path {
            base: Box::new(self),
            name: name.into(),
        }
    }

    pub fn index(self, index: ExpressionNode) -> Self {
        Self::Index {
            base: Box::new(self),
            index: Box::new(index),
        }
    }

    /// Method call with this node as receiver.
    pub fn method(self, name: impl Into<String>, args: Vec<ExpressionNode>) -> Self {
        Self::FunctionCall(Box::new(FunctionCallData {
            target: Some(self),
            name: name.into(),
            args,
        }))
    }

    /// Function call without an explicit receiver.
    pub fn function(name: impl Into<String>, args: Vec<ExpressionNode>) -> Self {
        Self::FunctionCall(Box::new(FunctionCallData {
            target: None,
            name: name.into(),
            args,
        }))
    }

    pub fn binary(op: BinaryOperator, left: ExpressionNode, right: ExpressionNode) -> Self {
        Self::BinaryOp(Box::new(BinaryOpData { op, left, right }))
    }

    pub fn unary(op: UnaryOperator, operand: ExpressionNode) -> Self {
        Self::UnaryOp {
            op,
            operand: Box::new(operand),
        }
    }

    pub fn is_type(self, type_name: impl Into<String>) -> Self {
        Self::TypeOperation(Box::new(TypeOperationData {
            op: TypeOperator::Is,
            expression: self,
            type_name: type_name.into(),
        }))
    }

    pub fn as_type(self, type_name: impl Into<String>) -> Self {
        Self::TypeOperation(Box::new(TypeOperationData {
            op: TypeOperator::As,
            expression: self,
            type_name: type_name.into(),
        }))
    }

    /// Whether a variable with the given name is referenced anywhere in this tree.
    pub fn references_variable(&self, name: &str) -> bool {
        match self {
            Self::Variable(v) => v == name,
            Self::Literal(_) | Self::Identifier(_) => false,
            Self::Path { base, .. } => base.references_variable(name),
            Self::Index { base, index } => {
                base.references_variable(name) || index.references_variable(name)
            }
            Self::BinaryOp(data) => {
                data.left.references_variable(name) || data.right.references_variable(name)
            }
            Self::UnaryOp { operand, .. } => operand.references_variable(name),
            Self::FunctionCall(call) => {
                call.target
                    .as_ref()
                    .is_some_and(|t| t.references_variable(name))
                    || call.args.iter().any(|a| a.references_variable(name))
            }
            Self::TypeOperation(data) => data.expression.references_variable(name),
        }
    }
}
