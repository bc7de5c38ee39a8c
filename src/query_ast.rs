//! Query Abstract Syntax Tree (AST)
//!
//! The structured clauses shared by the textual parser, the query builder,
//! table constraints and the executor. Column references straight out of the
//! parser are unresolved (`Column` or `Path`); the builder resolves them
//! against the schema into their final shape.

use crate::types::{RowId, Value};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Comparison operators of a where/having leaf
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operator {
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    Like,
    NotLike,
    Is,
    IsNot,
}

impl Operator {
    pub fn symbol(&self) -> &'static str {
        match self {
            Operator::Eq => "=",
            Operator::NotEq => "!=",
            Operator::Lt => "<",
            Operator::LtEq => "<=",
            Operator::Gt => ">",
            Operator::GtEq => ">=",
            Operator::Like => "LIKE",
            Operator::NotLike => "NOT LIKE",
            Operator::Is => "IS",
            Operator::IsNot => "IS NOT",
        }
    }
}

/// Reference to a value reachable from a row of the queried table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColumnRef {
    /// Plain column of the queried table
    Column(String),
    /// Column of another table, reached through a foreign key
    Nested { table: String, column: String },
    /// Position/key path into a list or map column
    Path { column: String, path: Vec<String> },
}

impl ColumnRef {
    pub fn column(name: &str) -> Self {
        ColumnRef::Column(name.to_string())
    }

    pub fn nested(table: &str, column: &str) -> Self {
        ColumnRef::Nested {
            table: table.to_string(),
            column: column.to_string(),
        }
    }

    /// Unresolved reference from dotted segments
    pub fn from_segments(mut segments: Vec<String>) -> Option<Self> {
        if segments.is_empty() {
            return None;
        }
        let column = segments.remove(0);
        if segments.is_empty() {
            Some(ColumnRef::Column(column))
        } else {
            Some(ColumnRef::Path {
                column,
                path: segments,
            })
        }
    }

    /// Dotted form, also the output label of the column
    pub fn render(&self) -> String {
        match self {
            ColumnRef::Column(name) => name.clone(),
            ColumnRef::Nested { table, column } => format!("{}.{}", table, column),
            ColumnRef::Path { column, path } => format!("{}.{}", column, path.join(".")),
        }
    }

    /// The column of the queried table this reference reads, if any
    pub fn local_column(&self) -> Option<&str> {
        match self {
            ColumnRef::Column(name) | ColumnRef::Path { column: name, .. } => Some(name),
            ColumnRef::Nested { .. } => None,
        }
    }
}

/// Aggregate functions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AggregateFunction {
    Count,
    Sum,
    Avg,
    Min,
    Max,
}

impl AggregateFunction {
    pub fn name(&self) -> &'static str {
        match self {
            AggregateFunction::Count => "count",
            AggregateFunction::Sum => "sum",
            AggregateFunction::Avg => "avg",
            AggregateFunction::Min => "min",
            AggregateFunction::Max => "max",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_lowercase().as_str() {
            "count" => Some(AggregateFunction::Count),
            "sum" => Some(AggregateFunction::Sum),
            "avg" => Some(AggregateFunction::Avg),
            "min" => Some(AggregateFunction::Min),
            "max" => Some(AggregateFunction::Max),
            _ => None,
        }
    }
}

fn render_aggregate(func: AggregateFunction, column: Option<&ColumnRef>) -> String {
    match column {
        Some(c) => format!("{}({})", func.name(), c.render()),
        None => format!("{}(*)", func.name()),
    }
}

/// One entry of the output-column list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ColumnExpr {
    Star,
    Ref(ColumnRef),
    /// `None` column means `*`
    Aggregate(AggregateFunction, Option<ColumnRef>),
}

impl ColumnExpr {
    pub fn render(&self) -> String {
        match self {
            ColumnExpr::Star => "*".to_string(),
            ColumnExpr::Ref(r) => r.render(),
            ColumnExpr::Aggregate(func, column) => render_aggregate(*func, column.as_ref()),
        }
    }

    pub fn is_aggregate(&self) -> bool {
        matches!(self, ColumnExpr::Aggregate(..))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectColumn {
    pub expr: ColumnExpr,
    pub alias: Option<String>,
}

impl SelectColumn {
    pub fn new(expr: ColumnExpr) -> Self {
        SelectColumn { expr, alias: None }
    }

    pub fn aliased(expr: ColumnExpr, alias: &str) -> Self {
        SelectColumn {
            expr,
            alias: Some(alias.to_string()),
        }
    }

    /// Name of the column in a result set
    pub fn label(&self) -> String {
        match &self.alias {
            Some(alias) => alias.clone(),
            None => self.expr.render(),
        }
    }

    pub fn render(&self) -> String {
        match &self.alias {
            Some(alias) => format!("{} AS {}", self.expr.render(), alias),
            None => self.expr.render(),
        }
    }
}

/// One side of a comparison leaf
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Operand {
    Column(ColumnRef),
    Aggregate(AggregateFunction, Option<ColumnRef>),
    Literal(Value),
}

impl Operand {
    pub fn render(&self) -> String {
        match self {
            Operand::Column(c) => c.render(),
            Operand::Aggregate(func, column) => render_aggregate(*func, column.as_ref()),
            Operand::Literal(v) => v.render_literal(),
        }
    }
}

/// Where/having tree: comparison leaves joined by AND / OR
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Condition {
    Compare {
        left: Operand,
        op: Operator,
        right: Operand,
    },
    And(Box<Condition>, Box<Condition>),
    Or(Box<Condition>, Box<Condition>),
}

impl Condition {
    pub fn compare(left: Operand, op: Operator, right: Operand) -> Self {
        Condition::Compare { left, op, right }
    }

    /// `column <op> literal`
    pub fn column(column: &str, op: Operator, value: impl Into<Value>) -> Self {
        Condition::Compare {
            left: Operand::Column(ColumnRef::column(column)),
            op,
            right: Operand::Literal(value.into()),
        }
    }

    /// `column = literal`
    pub fn eq(column: &str, value: impl Into<Value>) -> Self {
        Condition::column(column, Operator::Eq, value)
    }

    pub fn and(self, other: Condition) -> Self {
        Condition::And(Box::new(self), Box::new(other))
    }

    pub fn or(self, other: Condition) -> Self {
        Condition::Or(Box::new(self), Box::new(other))
    }

    /// Top-level conjuncts (the leaves of the outermost AND chain)
    pub fn conjuncts(&self) -> Vec<&Condition> {
        match self {
            Condition::And(left, right) => {
                let mut out = left.conjuncts();
                out.extend(right.conjuncts());
                out
            }
            other => vec![other],
        }
    }

    /// Every operand of every leaf, left to right
    pub fn operands(&self) -> Vec<&Operand> {
        match self {
            Condition::Compare { left, right, .. } => vec![left, right],
            Condition::And(l, r) | Condition::Or(l, r) => {
                let mut out = l.operands();
                out.extend(r.operands());
                out
            }
        }
    }

    /// Rebuild the tree with every operand passed through `f`
    pub fn try_map_operands<F, E>(&self, f: &mut F) -> Result<Condition, E>
    where
        F: FnMut(&Operand) -> Result<Operand, E>,
    {
        Ok(match self {
            Condition::Compare { left, op, right } => Condition::Compare {
                left: f(left)?,
                op: *op,
                right: f(right)?,
            },
            Condition::And(l, r) => Condition::And(
                Box::new(l.try_map_operands(f)?),
                Box::new(r.try_map_operands(f)?),
            ),
            Condition::Or(l, r) => Condition::Or(
                Box::new(l.try_map_operands(f)?),
                Box::new(r.try_map_operands(f)?),
            ),
        })
    }

    /// Textual form; parenthesises wherever the parser would otherwise
    /// re-associate the tree.
    pub fn render(&self) -> String {
        match self {
            Condition::Compare { left, op, right } => {
                format!("{} {} {}", left.render(), op.symbol(), right.render())
            }
            Condition::And(l, r) => {
                let left = match l.as_ref() {
                    Condition::Or(..) => format!("({})", l.render()),
                    _ => l.render(),
                };
                let right = match r.as_ref() {
                    Condition::Compare { .. } => r.render(),
                    _ => format!("({})", r.render()),
                };
                format!("{} AND {}", left, right)
            }
            Condition::Or(l, r) => {
                let right = match r.as_ref() {
                    Condition::Or(..) => format!("({})", r.render()),
                    _ => r.render(),
                };
                format!("{} OR {}", l.render(), right)
            }
        }
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.render())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderBy {
    pub column: ColumnRef,
    pub direction: Direction,
}

impl OrderBy {
    pub fn render(&self) -> String {
        match self.direction {
            Direction::Asc => format!("{} ASC", self.column.render()),
            Direction::Desc => format!("{} DESC", self.column.render()),
        }
    }
}

/// `column = value` of an UPDATE or INSERT
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assignment {
    pub column: String,
    pub value: Value,
}

/// The clause set every query object carries
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct QueryParts {
    pub table: String,
    pub columns: Vec<SelectColumn>,
    pub where_clause: Option<Condition>,
    pub having: Option<Condition>,
    pub order_by: Vec<OrderBy>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
    /// Single-row selector by primary key
    pub row: Option<RowId>,
    /// Sub-queries omit the implicit primary-key companion column
    pub subquery: bool,
}

/// Top-level parsed statement
#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    Select(QueryParts),
    Count {
        parts: QueryParts,
        column: Option<ColumnRef>,
    },
    Exists(QueryParts),
    Delete(QueryParts),
    Update {
        parts: QueryParts,
        assignments: Vec<Assignment>,
    },
    Insert {
        table: String,
        assignments: Vec<Assignment>,
    },
}
