//! Index Benchmarks
//!
//! Point lookups through a persisted secondary index against a full scan
//! on an unindexed column, plus the cost of loading a table and building
//! its index from scratch.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use flatbase_core::*;
use serde_json::json;
use std::fs;
use std::sync::Arc;
use tempfile::TempDir;

const EVENTS: &str = r#"{
    "name": "bench",
    "tables": [
        {"name": "events", "primary_key": "id",
         "columns": [
            {"name": "id", "type": "integer"},
            {"name": "kind", "type": "string"},
            {"name": "source", "type": "string"}],
         "indexes": [{"name": "ix_kind", "columns": [{"name": "kind"}]}]}
    ]
}"#;

/// Data directory holding `rows` events; `kind` and `source` carry the
/// same values so both lookups select the same rows
fn setup(rows: usize) -> (TempDir, Arc<Database>, EngineConfig) {
    let dir = TempDir::new().unwrap();
    let schema = Arc::new(Database::from_json(EVENTS).unwrap());
    let config = EngineConfig::new(dir.path());

    let rows: Vec<_> = (0..rows)
        .map(|i| {
            let tag = format!("k{}", i % 100);
            json!({"id": i, "kind": tag, "source": tag})
        })
        .collect();
    let path = config.data_path("events");
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(&path, json!({"table": "events", "rows": rows}).to_string()).unwrap();

    (dir, schema, config)
}

fn lookup(schema: &Arc<Database>, column: &str) -> SelectQuery {
    let mut query = SelectQuery::new(Arc::clone(schema), "events").unwrap();
    query.set_columns_text("id").unwrap();
    query.set_where(Condition::eq(column, "k42")).unwrap();
    query
}

fn bench_point_lookup(c: &mut Criterion) {
    let mut group = c.benchmark_group("point_lookup");

    for size in [1_000, 10_000] {
        let (_dir, schema, config) = setup(size);
        let mut engine = Engine::new(Arc::clone(&schema), config).unwrap();
        let indexed = lookup(&schema, "kind");
        let scanned = lookup(&schema, "source");

        // Warm the table cache and the index snapshot
        assert_eq!(engine.select(&indexed).unwrap().len(), size / 100);

        group.bench_with_input(BenchmarkId::new("indexed", size), &indexed, |b, query| {
            b.iter(|| black_box(engine.select(query).unwrap()))
        });
        group.bench_with_input(BenchmarkId::new("scan", size), &scanned, |b, query| {
            b.iter(|| black_box(engine.select(query).unwrap()))
        });
    }

    group.finish();
}

fn bench_cold_load(c: &mut Criterion) {
    let (_dir, schema, config) = setup(10_000);
    let index_path = config.index_path("events");

    c.bench_function("cold_load_rebuild_index", |b| {
        b.iter(|| {
            let _ = fs::remove_file(&index_path);
            let mut engine = Engine::new(Arc::clone(&schema), config.clone()).unwrap();
            black_box(engine.indexes("events").unwrap().columns().count())
        })
    });
}

criterion_group!(benches, bench_point_lookup, bench_cold_load);
criterion_main!(benches);
