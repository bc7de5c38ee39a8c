//! Query Round-Trip Tests
//!
//! Rendering a query object and parsing the text back must reproduce the
//! same clauses.

mod common;

use common::*;
use flatbase_core::*;
use proptest::prelude::*;
use std::sync::Arc;

const COLUMNS: [&str; 4] = ["total", "status", "customer", "customers.name"];
const OPERATORS: [Operator; 10] = [
    Operator::Eq,
    Operator::NotEq,
    Operator::Lt,
    Operator::LtEq,
    Operator::Gt,
    Operator::GtEq,
    Operator::Like,
    Operator::NotLike,
    Operator::Is,
    Operator::IsNot,
];
const AGGREGATES: [AggregateFunction; 5] = [
    AggregateFunction::Count,
    AggregateFunction::Sum,
    AggregateFunction::Min,
    AggregateFunction::Max,
    AggregateFunction::Avg,
];

fn column_ref(name: &str) -> ColumnRef {
    ColumnRef::from_segments(name.split('.').map(str::to_string).collect()).unwrap()
}

fn float() -> impl Strategy<Value = f64> {
    prop_oneof![
        -1.0e6f64..1.0e6,
        prop::num::f64::NORMAL | prop::num::f64::SUBNORMAL | prop::num::f64::ZERO,
        Just(1e-5),
        Just(1e21),
        Just(-2.5e-300),
    ]
}

fn literal() -> impl Strategy<Value = Value> {
    prop_oneof![
        any::<i64>().prop_map(Value::Int),
        Just(Value::Int(i64::MIN)),
        float().prop_map(Value::Float),
        any::<bool>().prop_map(Value::Bool),
        Just(Value::Null),
        "[a-zA-Z0-9 %_'.-]{0,10}".prop_map(Value::from),
    ]
}

fn leaf() -> impl Strategy<Value = Condition> {
    (0usize..COLUMNS.len(), 0usize..OPERATORS.len(), literal()).prop_map(|(c, o, v)| {
        Condition::compare(
            Operand::Column(column_ref(COLUMNS[c])),
            OPERATORS[o],
            Operand::Literal(v),
        )
    })
}

fn where_tree() -> impl Strategy<Value = Condition> {
    leaf().prop_recursive(3, 8, 2, |inner| {
        prop_oneof![
            (inner.clone(), inner.clone()).prop_map(|(l, r)| l.and(r)),
            (inner.clone(), inner).prop_map(|(l, r)| l.or(r)),
        ]
    })
}

/// Having leaves over an aggregate of `total` or the `status` column
fn having() -> impl Strategy<Value = Condition> {
    (0usize..AGGREGATES.len(), any::<bool>(), 0usize..6, literal()).prop_map(
        |(a, on_aggregate, o, v)| {
            let left = if on_aggregate {
                let column = match AGGREGATES[a] {
                    AggregateFunction::Count => None,
                    _ => Some(ColumnRef::column("total")),
                };
                Operand::Aggregate(AGGREGATES[a], column)
            } else {
                Operand::Column(ColumnRef::column("status"))
            };
            Condition::compare(left, OPERATORS[o], Operand::Literal(v))
        },
    )
}

proptest! {
    #[test]
    fn test_select_roundtrip(
        columns in prop::sample::subsequence(COLUMNS.to_vec(), 1..=COLUMNS.len()),
        condition in prop::option::of(where_tree()),
        having in prop::option::of(having()),
        order in prop::option::of((0usize..COLUMNS.len(), any::<bool>())),
        limit in prop::option::of(1usize..500),
        offset in prop::option::of(0usize..500),
    ) {
        let schema = shop_schema();
        let mut query = SelectQuery::new(Arc::clone(&schema), "orders").unwrap();
        query.set_columns_text(&columns.join(", ")).unwrap();
        if let Some(condition) = condition {
            query.set_where(condition).unwrap();
        }
        if let Some(having) = having {
            query.set_having(having).unwrap();
        }
        if let Some((column, descending)) = order {
            let direction = if descending { Direction::Desc } else { Direction::Asc };
            query.set_order_by(&[COLUMNS[column]], &[direction]).unwrap();
        }
        if let Some(limit) = limit {
            query.set_limit(limit).unwrap();
        }
        if let Some(offset) = offset {
            query.set_offset(offset);
        }

        let text = query.to_string();
        let parsed = SelectQuery::parse(schema, &text).unwrap();
        prop_assert_eq!(parsed.parts(), query.parts(), "{}", text);
        prop_assert_eq!(parsed.to_string(), text);
    }

    #[test]
    fn test_row_selector_roundtrip(id in any::<i64>(), condition in prop::option::of(where_tree())) {
        let schema = shop_schema();
        let mut query = SelectQuery::new(Arc::clone(&schema), "orders").unwrap();
        query.set_row(RowId::from(id));
        if let Some(condition) = condition {
            query.set_where(condition).unwrap();
        }

        let text = query.to_string();
        let parsed = SelectQuery::parse(schema, &text).unwrap();
        prop_assert_eq!(parsed.parts(), query.parts(), "{}", text);
    }

    #[test]
    fn test_delete_roundtrip(condition in where_tree(), limit in prop::option::of(1usize..50)) {
        let schema = shop_schema();
        let mut query = DeleteQuery::new(Arc::clone(&schema), "orders").unwrap();
        query.set_where(condition).unwrap();
        if let Some(limit) = limit {
            query.set_limit(limit).unwrap();
        }

        let text = query.to_string();
        let parsed = DeleteQuery::parse(schema, &text).unwrap();
        prop_assert_eq!(parsed.parts(), query.parts(), "{}", text);
    }
}

#[test]
fn test_text_is_case_and_whitespace_insensitive() {
    let schema = shop_schema();
    let a = SelectQuery::parse(
        Arc::clone(&schema),
        "select   TOTAL from ORDERS where STATUS = 'paid'   order by total desc limit 3",
    )
    .unwrap();
    let b = SelectQuery::parse(schema, "SELECT total FROM orders WHERE status = 'paid' ORDER BY total DESC LIMIT 3")
        .unwrap();
    assert_eq!(a.to_string(), b.to_string());
}

#[test]
fn test_update_and_insert_reparse() {
    let schema = shop_schema();

    let mut update = UpdateQuery::new(Arc::clone(&schema), "orders").unwrap();
    update.set("status", "paid").unwrap();
    update.set("total", 12).unwrap();
    update.set_row(RowId::from(100));
    update.set_where_text("total >= 1.5e-3").unwrap();
    let again = UpdateQuery::parse(Arc::clone(&schema), &update.to_string()).unwrap();
    assert_eq!(again.assignments(), update.assignments());
    assert_eq!(again.parts(), update.parts());

    let mut insert = InsertQuery::new(Arc::clone(&schema), "customers").unwrap();
    insert.set("id", 4).unwrap();
    insert.set("name", "D'Arcy").unwrap();
    let again = InsertQuery::parse(schema, &insert.to_string()).unwrap();
    assert_eq!(again.assignments(), insert.assignments());
}

#[test]
fn test_invalid_setters() {
    let schema = shop_schema();
    let mut query = SelectQuery::new(Arc::clone(&schema), "orders").unwrap();
    assert!(query.set_columns_text("nope").unwrap_err().is_not_found());
    assert!(matches!(query.set_limit(0), Err(DbError::InvalidQuery(_))));
    assert!(matches!(
        query.set_order_by(&["total", "status"], &[Direction::Asc]),
        Err(DbError::InvalidQuery(_))
    ));
    assert!(SelectQuery::new(schema, "missing").unwrap_err().is_not_found());
}
