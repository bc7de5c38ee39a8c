//! Shared fixtures for the integration tests

#![allow(dead_code)]

use flatbase_core::*;
use std::sync::{Arc, Once};
use tempfile::TempDir;

static INIT: Once = Once::new();

/// Route engine logs to the test harness output
pub fn init_tracing() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(tracing::Level::DEBUG)
            .try_init();
    });
}

pub const SHOP: &str = r#"{
    "name": "shop",
    "sequences": [{"name": "order_ids", "start": 100, "increment": 10}],
    "tables": [
        {"name": "customers", "primary_key": "id",
         "columns": [
            {"name": "id", "type": "integer"},
            {"name": "name", "type": "string", "nullable": false, "length": 20},
            {"name": "email", "type": "mail"},
            {"name": "tier", "type": "enum", "items": ["gold", "silver"], "default": "silver"}],
         "indexes": [{"name": "ux_email", "unique": true, "columns": [{"name": "email"}]}]},
        {"name": "orders", "primary_key": "id",
         "columns": [
            {"name": "id", "type": "integer", "auto": {"sequence": "order_ids"}},
            {"name": "customer", "type": "reference"},
            {"name": "total", "type": "float"},
            {"name": "status", "type": "string", "default": "new"},
            {"name": "tags", "type": "list"}],
         "indexes": [{"name": "ix_status", "columns": [{"name": "status"}]}],
         "constraints": [{"name": "positive_total", "expression": "total >= 0"}],
         "foreign_keys": [{"name": "fk_customer", "column": "customer", "target_table": "customers", "target_column": "id"}]}
    ]
}"#;

pub fn shop_schema() -> Arc<Database> {
    Arc::new(Database::from_json(SHOP).unwrap())
}

/// Engine over a fresh data directory; keep the `TempDir` alive
pub fn shop_engine() -> (TempDir, Engine) {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let config = EngineConfig::new(dir.path()).with_retries(2, 1);
    let engine = Engine::new(shop_schema(), config).unwrap();
    (dir, engine)
}

pub fn add_customer(engine: &mut Engine, id: i64, name: &str, email: &str) -> RowId {
    let mut insert = InsertQuery::new(Arc::clone(engine.schema()), "customers").unwrap();
    insert.set("id", id).unwrap();
    insert.set("name", name).unwrap();
    insert.set("email", email).unwrap();
    engine.insert(&insert).unwrap()
}

pub fn add_order(engine: &mut Engine, customer: i64, total: f64, status: &str) -> RowId {
    let mut insert = InsertQuery::new(Arc::clone(engine.schema()), "orders").unwrap();
    insert.set("customer", customer).unwrap();
    insert.set("total", total).unwrap();
    insert.set("status", status).unwrap();
    engine.insert(&insert).unwrap()
}

/// Two customers and five orders
pub fn seeded_engine() -> (TempDir, Engine) {
    let (dir, mut engine) = shop_engine();
    add_customer(&mut engine, 1, "Ada", "ada@example.org");
    add_customer(&mut engine, 2, "Brian", "brian@example.org");
    add_order(&mut engine, 1, 10.0, "new");
    add_order(&mut engine, 1, 250.0, "paid");
    add_order(&mut engine, 2, 40.0, "paid");
    add_order(&mut engine, 2, 5.5, "new");
    add_order(&mut engine, 1, 99.0, "shipped");
    (dir, engine)
}
