//! Index Persistence Tests
//!
//! Snapshot commit, rollback and rebuild as seen through the engine, plus a
//! property check that indexes always agree with a full scan.

mod common;

use common::*;
use flatbase_core::*;
use proptest::prelude::*;
use std::fs;
use std::sync::Arc;

fn ids(list: &[i64]) -> Vec<RowId> {
    list.iter().copied().map(RowId::from).collect()
}

#[test]
fn test_snapshot_is_committed_with_rows() {
    let (_dir, mut engine) = seeded_engine();
    let schema = Arc::clone(engine.schema());
    let orders = schema.get_table("orders").unwrap();
    let path = engine.config().index_path("orders");
    assert!(path.exists());

    // Opened without rows: everything must come from the snapshot
    let manager = IndexManager::open(orders, &path, &RowSet::new()).unwrap();
    assert_eq!(manager.lookup("status", &Value::from("Paid")).unwrap(), ids(&[110, 120]));
    assert!(!manager.is_dirty());
}

#[test]
fn test_corrupt_snapshot_is_rebuilt() {
    let (dir, engine) = seeded_engine();
    fs::write(engine.config().index_path("orders"), b"definitely not an index").unwrap();
    drop(engine);

    let mut reopened = Engine::new(shop_schema(), EngineConfig::new(dir.path())).unwrap();
    let indexes = reopened.indexes("orders").unwrap();
    assert_eq!(indexes.lookup("status", &Value::from("new")).unwrap(), ids(&[100, 130]));
}

#[test]
fn test_rollback_discards_uncommitted_changes() {
    let (_dir, mut engine) = seeded_engine();
    let schema = Arc::clone(engine.schema());
    let orders = schema.get_table("orders").unwrap();
    let rows = engine.rows("orders").unwrap().clone();
    let path = engine.config().index_path("orders");

    let mut manager = IndexManager::open(orders, &path, &rows).unwrap();
    let old = rows[&RowId::from(100)].clone();
    let mut new = old.clone();
    new.insert("status".to_string(), Value::from("paid"));
    manager.update_row(&RowId::from(100), Some(&old), Some(&new));
    assert!(manager.is_dirty());
    assert_eq!(manager.lookup("status", &Value::from("paid")).unwrap(), ids(&[100, 110, 120]));

    manager.rollback(&rows).unwrap();
    assert_eq!(manager.lookup("status", &Value::from("paid")).unwrap(), ids(&[110, 120]));

    // Without a snapshot the rollback rebuilds from the rows
    fs::remove_file(&path).unwrap();
    manager.update_row(&RowId::from(100), Some(&old), Some(&new));
    manager.rollback(&rows).unwrap();
    assert_eq!(manager.lookup("status", &Value::from("paid")).unwrap(), ids(&[110, 120]));
    assert_eq!(manager.lookup("status", &Value::from("new")).unwrap(), ids(&[100, 130]));
}

#[test]
fn test_engine_rollback_rereads_disk() {
    let (_dir, mut engine) = seeded_engine();
    engine.rollback("orders").unwrap();
    assert_eq!(engine.rows("orders").unwrap().len(), 5);
    assert!(engine.rollback("nowhere").unwrap_err().is_not_found());
}

/// Ids selected by `condition`, in primary-key order
fn selected(engine: &mut Engine, table: &str, condition: Condition) -> Vec<Value> {
    let mut query = SelectQuery::new(Arc::clone(engine.schema()), table).unwrap();
    query.set_columns_text("id").unwrap();
    query.set_where(condition).unwrap();
    engine.select(&query).unwrap().column("id")
}

/// `leaf OR leaf` matches the same rows as `leaf` but never uses an index
fn scanned(leaf: Condition) -> Condition {
    leaf.clone().or(leaf)
}

#[test]
fn test_coerced_literals_match_like_a_scan() {
    let (_dir, mut engine) = seeded_engine();
    engine
        .execute_sql("INSERT INTO orders (id, total, status) VALUES (7, 1, '007')")
        .unwrap();

    for literal in [Value::Int(7), Value::Float(7.0), Value::from("007"), Value::from("7")] {
        let leaf = Condition::column("status", Operator::Eq, literal.clone());
        let indexed = selected(&mut engine, "orders", leaf.clone());
        assert_eq!(indexed, selected(&mut engine, "orders", scanned(leaf)), "{literal:?}");
    }
    let leaf = Condition::column("status", Operator::Eq, 7);
    assert_eq!(selected(&mut engine, "orders", leaf), vec![Value::Int(7)]);
}

#[test]
fn test_bool_column_index_agrees_with_scan() {
    init_tracing();
    let dir = tempfile::TempDir::new().unwrap();
    let schema = Arc::new(
        Database::from_json(
            r#"{"name": "flags", "tables": [
                {"name": "switches", "primary_key": "id",
                 "columns": [{"name": "id", "type": "integer"}, {"name": "active", "type": "bool"}],
                 "indexes": [{"name": "ix_active", "columns": [{"name": "active"}]}]}]}"#,
        )
        .unwrap(),
    );
    let mut engine = Engine::new(schema, EngineConfig::new(dir.path())).unwrap();
    engine.execute_sql("INSERT INTO switches (id, active) VALUES (1, 1)").unwrap();
    engine.execute_sql("INSERT INTO switches (id, active) VALUES (2, FALSE)").unwrap();

    let literals = [
        Value::Int(1),
        Value::Int(0),
        Value::Bool(true),
        Value::Bool(false),
        Value::from("true"),
        Value::from("1"),
    ];
    for literal in literals {
        let leaf = Condition::column("active", Operator::Eq, literal.clone());
        let indexed = selected(&mut engine, "switches", leaf.clone());
        assert_eq!(indexed, selected(&mut engine, "switches", scanned(leaf)), "{literal:?}");
    }
    let leaf = Condition::column("active", Operator::Eq, 1);
    assert_eq!(selected(&mut engine, "switches", leaf), vec![Value::Int(1)]);
}

const STATUSES: [&str; 8] = ["new", "New", "PAID", "paid", "shipped", "007", "7", "true"];

/// Literals of every type, compared against the string `status` column
fn mixed_literals() -> Vec<Value> {
    let mut literals: Vec<Value> = STATUSES.iter().map(|s| Value::from(*s)).collect();
    literals.extend([
        Value::Int(7),
        Value::Int(1),
        Value::Float(7.0),
        Value::Float(-0.0),
        Value::Bool(true),
        Value::Null,
    ]);
    literals
}

#[derive(Debug, Clone)]
enum Op {
    Insert(i64, usize),
    Update(i64, usize),
    Delete(i64),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (1i64..8, 0usize..STATUSES.len()).prop_map(|(id, s)| Op::Insert(id, s)),
        (1i64..8, 0usize..STATUSES.len()).prop_map(|(id, s)| Op::Update(id, s)),
        (1i64..8).prop_map(Op::Delete),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn test_index_agrees_with_scan(ops in prop::collection::vec(op_strategy(), 1..20)) {
        let (_dir, mut engine) = shop_engine();
        let schema = Arc::clone(engine.schema());

        for op in &ops {
            let statement = match op {
                Op::Insert(id, s) => format!(
                    "INSERT INTO orders (id, total, status) VALUES ({}, 1, '{}')",
                    id, STATUSES[*s]
                ),
                Op::Update(id, s) => format!(
                    "UPDATE orders SET status = '{}' WHERE id = {}",
                    STATUSES[*s], id
                ),
                Op::Delete(id) => format!("DELETE FROM orders WHERE id = {}", id),
            };
            // Duplicate ids are expected to fail; the index must not drift
            let query = Query::parse(Arc::clone(&schema), &statement).unwrap();
            let _ = query.execute(&mut engine);
        }

        for literal in mixed_literals() {
            let leaf = Condition::column("status", Operator::Eq, literal.clone());
            let indexed = selected(&mut engine, "orders", leaf.clone());
            let full = selected(&mut engine, "orders", scanned(leaf));
            prop_assert_eq!(indexed, full, "{:?}", literal);
        }

        let rows = engine.rows("orders").unwrap().clone();
        let indexes = engine.indexes("orders").unwrap();
        for status in STATUSES {
            let mut scanned: Vec<RowId> = rows
                .iter()
                .filter(|(_, r)| r["status"].loosely_equals(&Value::from(status)))
                .map(|(id, _)| id.clone())
                .collect();
            scanned.sort();
            let indexed = indexes.lookup("status", &Value::from(status)).unwrap();
            prop_assert_eq!(indexed, scanned);
        }
    }
}
