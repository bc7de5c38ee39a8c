//! Condition Evaluation
//!
//! Tree-walking interpreter for where/having trees and table constraints.
//! Operand values come from a [`ValueSource`]: a row, a joined row, or a
//! projected result row.

use crate::error::{DbError, Result};
use crate::query_ast::{AggregateFunction, ColumnRef, Condition, Operand, Operator};
use crate::types::{Row, Value};
use std::cmp::Ordering;

/// Supplies the values a condition refers to
pub trait ValueSource {
    fn value(&self, column: &ColumnRef) -> Result<Value>;

    /// Aggregate operands; only result rows carry them
    fn aggregate(&self, func: AggregateFunction, column: Option<&ColumnRef>) -> Result<Value> {
        let _ = column;
        Err(DbError::InvalidQuery(format!(
            "Aggregate {}() is not allowed here",
            func.name()
        )))
    }
}

/// Look up a cell by exact name first, then case-insensitively
pub fn cell<'a>(row: &'a Row, column: &str) -> Option<&'a Value> {
    row.get(column).or_else(|| {
        row.iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(column))
            .map(|(_, v)| v)
    })
}

/// Follow a path into a list/map value; a missing step yields null
pub fn navigate(value: &Value, path: &[String]) -> Value {
    let mut current = value;
    for segment in path {
        match current.get_path(segment) {
            Some(next) => current = next,
            None => return Value::Null,
        }
    }
    current.clone()
}

/// A single stored row; foreign-key references are not reachable from it
pub struct RowSource<'a> {
    pub row: &'a Row,
}

impl<'a> RowSource<'a> {
    pub fn new(row: &'a Row) -> Self {
        RowSource { row }
    }
}

impl ValueSource for RowSource<'_> {
    fn value(&self, column: &ColumnRef) -> Result<Value> {
        match column {
            ColumnRef::Column(name) => Ok(cell(self.row, name).cloned().unwrap_or(Value::Null)),
            ColumnRef::Path { column, path } => Ok(cell(self.row, column)
                .map(|v| navigate(v, path))
                .unwrap_or(Value::Null)),
            ColumnRef::Nested { .. } => Err(DbError::InvalidQuery(format!(
                "'{}' needs a foreign-key lookup",
                column.render()
            ))),
        }
    }
}

fn operand_value(operand: &Operand, src: &dyn ValueSource) -> Result<Value> {
    match operand {
        Operand::Literal(v) => Ok(v.clone()),
        Operand::Column(c) => src.value(c),
        Operand::Aggregate(func, column) => src.aggregate(*func, column.as_ref()),
    }
}

/// Evaluate a condition tree
pub fn evaluate(condition: &Condition, src: &dyn ValueSource) -> Result<bool> {
    match condition {
        Condition::Compare { left, op, right } => {
            let l = operand_value(left, src)?;
            let r = operand_value(right, src)?;
            Ok(compare_values(&l, *op, &r))
        }
        Condition::And(l, r) => Ok(evaluate(l, src)? && evaluate(r, src)?),
        Condition::Or(l, r) => Ok(evaluate(l, src)? || evaluate(r, src)?),
    }
}

/// Apply one comparison operator; incomparable values compare false
pub fn compare_values(left: &Value, op: Operator, right: &Value) -> bool {
    match op {
        Operator::Eq => left.loosely_equals(right),
        Operator::NotEq => !left.loosely_equals(right),
        Operator::Lt | Operator::LtEq | Operator::Gt | Operator::GtEq => {
            if left.is_null() || right.is_null() {
                return false;
            }
            match left.compare(right) {
                Some(ord) => match op {
                    Operator::Lt => ord == Ordering::Less,
                    Operator::LtEq => ord != Ordering::Greater,
                    Operator::Gt => ord == Ordering::Greater,
                    _ => ord != Ordering::Less,
                },
                None => false,
            }
        }
        Operator::Like | Operator::NotLike => {
            if left.is_null() || right.is_null() {
                return false;
            }
            let matched = like(&left.to_string(), &right.to_string());
            if op == Operator::Like {
                matched
            } else {
                !matched
            }
        }
        Operator::Is => is(left, right),
        Operator::IsNot => !is(left, right),
    }
}

fn is(left: &Value, right: &Value) -> bool {
    if right.is_null() {
        left.is_null()
    } else {
        left.loosely_equals(right)
    }
}

/// SQL LIKE: `%` matches any run, `_` one character; case-insensitive
pub fn like(value: &str, pattern: &str) -> bool {
    let text: Vec<char> = value.to_uppercase().chars().collect();
    let pat: Vec<char> = pattern.to_uppercase().chars().collect();

    // matches[j]: pattern prefix of length j matches the text prefix so far
    let mut matches = vec![false; pat.len() + 1];
    matches[0] = true;
    for j in 1..=pat.len() {
        matches[j] = matches[j - 1] && pat[j - 1] == '%';
    }

    for &ch in &text {
        let mut next = vec![false; pat.len() + 1];
        for j in 1..=pat.len() {
            next[j] = match pat[j - 1] {
                '%' => next[j - 1] || matches[j],
                '_' => matches[j - 1],
                p => matches[j - 1] && p == ch,
            };
        }
        matches = next;
    }
    matches[pat.len()]
}

/// Fold values with an aggregate function. Nulls are skipped; `count` over
/// the rows themselves is the caller's job.
pub fn aggregate(func: AggregateFunction, values: &[Value]) -> Value {
    let present: Vec<&Value> = values.iter().filter(|v| !v.is_null()).collect();
    match func {
        AggregateFunction::Count => Value::Int(present.len() as i64),
        AggregateFunction::Sum => {
            if present.is_empty() {
                return Value::Null;
            }
            // Integer sums fall back to a float total on overflow
            let exact = present.iter().try_fold(0i64, |acc, v| match v {
                Value::Int(i) => acc.checked_add(*i),
                _ => None,
            });
            match exact {
                Some(total) => Value::Int(total),
                None => Value::Float(present.iter().filter_map(|v| v.as_f64()).sum()),
            }
        }
        AggregateFunction::Avg => {
            let nums: Vec<f64> = present.iter().filter_map(|v| v.as_f64()).collect();
            if nums.is_empty() {
                Value::Null
            } else {
                Value::Float(nums.iter().sum::<f64>() / nums.len() as f64)
            }
        }
        AggregateFunction::Min | AggregateFunction::Max => {
            let want = if func == AggregateFunction::Min {
                Ordering::Less
            } else {
                Ordering::Greater
            };
            let mut best: Option<&Value> = None;
            for v in present {
                best = match best {
                    Some(b) if v.compare(b) != Some(want) => Some(b),
                    _ => Some(v),
                };
            }
            best.cloned().unwrap_or(Value::Null)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query_parser::Parser;

    fn row() -> Row {
        serde_json::from_str(
            r#"{"id": 1, "name": "Alice", "age": 30, "nick": null, "tags": ["a", "b"], "meta": {"level": 3}}"#,
        )
        .unwrap()
    }

    fn eval(text: &str) -> bool {
        let row = row();
        evaluate(&Parser::parse_condition(text).unwrap(), &RowSource::new(&row)).unwrap()
    }

    #[test]
    fn test_comparisons() {
        assert!(eval("age = 30 AND name = 'alice'"));
        assert!(eval("age >= 30 AND age < 31"));
        assert!(!eval("age > 'abc'"));
        assert!(eval("age > 10 OR name = 'nobody'"));
        assert!(eval("nick IS NULL AND name IS NOT NULL"));
        assert!(eval("missing IS NULL"));
    }

    #[test]
    fn test_paths() {
        assert!(eval("tags.1 = 'b'"));
        assert!(eval("meta.level = 3"));
        assert!(eval("tags.7 IS NULL"));
    }

    #[test]
    fn test_like() {
        assert!(like("Alice", "al%"));
        assert!(like("Alice", "_lic_"));
        assert!(!like("Alice", "_lic"));
        assert!(like("", "%"));
        assert!(eval("name NOT LIKE 'b%'"));
    }

    #[test]
    fn test_aggregate_rejected_in_row_context() {
        let row = row();
        let cond = Parser::parse_condition("count(*) > 1").unwrap();
        assert!(evaluate(&cond, &RowSource::new(&row)).is_err());
    }

    #[test]
    fn test_aggregate_functions() {
        let values = vec![Value::Int(3), Value::Null, Value::Int(1), Value::Int(5)];
        assert_eq!(aggregate(AggregateFunction::Count, &values), Value::Int(3));
        assert_eq!(aggregate(AggregateFunction::Sum, &values), Value::Int(9));
        assert_eq!(aggregate(AggregateFunction::Avg, &values), Value::Float(3.0));
        assert_eq!(aggregate(AggregateFunction::Min, &values), Value::Int(1));
        assert_eq!(aggregate(AggregateFunction::Max, &values), Value::Int(5));
        assert_eq!(aggregate(AggregateFunction::Sum, &[]), Value::Null);
    }

    #[test]
    fn test_sum_overflow_widens_to_float() {
        let values = vec![Value::Int(i64::MAX), Value::Int(1)];
        assert_eq!(
            aggregate(AggregateFunction::Sum, &values),
            Value::Float(i64::MAX as f64 + 1.0)
        );

        let values = vec![Value::Int(i64::MIN), Value::Int(-1), Value::Int(i64::MAX)];
        assert!(matches!(aggregate(AggregateFunction::Sum, &values), Value::Float(_)));

        let mixed = vec![Value::Int(2), Value::Float(0.5)];
        assert_eq!(aggregate(AggregateFunction::Sum, &mixed), Value::Float(2.5));
    }
}
