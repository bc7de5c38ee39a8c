//! Change-Log Replay
//!
//! Brings a database definition and its data files forward by replaying the
//! target definition's change-log entries newer than a given version, oldest
//! first. Each operation kind has one handler; handlers edit a working copy of
//! the definition and rewrite the affected data files.

use crate::changelog::{LogAction, LogEntry, LogOp};
use crate::config::EngineConfig;
use crate::error::{DbError, Result};
use crate::query_builder::{QueryObject, UpdateQuery};
use crate::query_executor::Engine;
use crate::schema::{Column, Database, Table};
use crate::storage::RowStore;
use crate::types::{Row, Value};
use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// State a replay handler works on
pub struct MigrationContext<'a> {
    /// Working definition, replaced step by step
    pub schema: Database,
    /// Definition the change-log belongs to; source of created tables
    pub target: &'a Database,
    pub config: &'a EngineConfig,
}

impl MigrationContext<'_> {
    /// Engine over the current working definition
    pub fn engine(&self) -> Result<Engine> {
        Engine::new(Arc::new(self.schema.clone()), self.config.clone())
    }

    /// Apply `edit` to a copy of the working definition; keep it only if it
    /// still resolves
    fn edit_schema<F>(&mut self, edit: F) -> Result<()>
    where
        F: FnOnce(&mut Database) -> Result<()>,
    {
        let mut next = self.schema.clone();
        edit(&mut next)?;
        next.resolve()?;
        self.schema = next;
        Ok(())
    }

    fn table(&self, name: &str) -> Result<Table> {
        self.schema.get_table(name).cloned()
    }

    /// Rewrite every row of `table` and drop its index snapshot
    fn rewrite_rows<F>(&self, table: &Table, mut f: F) -> Result<()>
    where
        F: FnMut(&mut Row) -> Result<()>,
    {
        let mut store = RowStore::new(table, self.config);
        if !store.exists() {
            return Ok(());
        }
        let mut rows = store.read()?;
        for row in rows.values_mut() {
            f(row)?;
        }
        store.write(&rows)?;
        self.drop_index(table)
    }

    fn drop_index(&self, table: &Table) -> Result<()> {
        let path = self.config.index_path(&table.name);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(DbError::NotWriteable {
                path,
                reason: e.to_string(),
            }),
        }
    }
}

/// Executable side of one change-log operation kind
pub trait ReplayHandler: Send + Sync {
    fn apply(&self, ctx: &mut MigrationContext<'_>, action: &LogAction) -> Result<()>;
}

fn unexpected(op: LogOp, action: &LogAction) -> DbError {
    DbError::Definition(format!(
        "{:?} handler received a {:?} entry",
        op,
        action.op()
    ))
}

/// Adds a table from the target definition and creates its empty data file
pub struct CreateHandler;

impl ReplayHandler for CreateHandler {
    fn apply(&self, ctx: &mut MigrationContext<'_>, action: &LogAction) -> Result<()> {
        let name = match action {
            LogAction::Create { table } => table,
            other => return Err(unexpected(LogOp::Create, other)),
        };
        let definition = ctx
            .target
            .tables
            .iter()
            .find(|t| t.name.eq_ignore_ascii_case(name))
            .cloned()
            .ok_or_else(|| DbError::not_found("Table", name.as_str()))?;
        ctx.edit_schema(|db| db.add_table(definition))?;

        let table = ctx.table(name)?;
        let mut store = RowStore::new(&table, ctx.config);
        if !store.exists() {
            store.write(&Default::default())?;
        }
        Ok(())
    }
}

/// Renames a table or one of its columns
pub struct RenameHandler;

impl RenameHandler {
    fn rename_table(ctx: &mut MigrationContext<'_>, from: &str, to: &str) -> Result<()> {
        let before = ctx.table(from)?;
        ctx.edit_schema(|db| {
            db.table_def_mut(from)?.name = to.to_string();
            for table in db.tables.iter_mut() {
                if table.parent.as_deref().map_or(false, |p| p.eq_ignore_ascii_case(from)) {
                    table.parent = Some(to.to_string());
                }
                for fk in table.foreign_keys.iter_mut() {
                    if fk.target_table.eq_ignore_ascii_case(from) {
                        fk.target_table = to.to_string();
                    }
                }
            }
            Ok(())
        })?;
        let after = ctx.table(to)?;

        let mut old_store = RowStore::new(&before, ctx.config);
        if old_store.exists() {
            let rows = old_store.read()?;
            RowStore::new(&after, ctx.config).write(&rows)?;
            old_store.remove()?;
        }
        ctx.drop_index(&before)
    }

    fn rename_column(ctx: &mut MigrationContext<'_>, table: &str, from: &str, to: &str) -> Result<()> {
        let current = ctx.table(table)?.get_column(from)?.name.clone();
        ctx.edit_schema(|db| {
            let def = db.table_def_mut(table)?;
            def.get_column_mut(&current)?.name = to.to_string();
            if def.primary_key.as_deref().map_or(false, |pk| pk.eq_ignore_ascii_case(&current)) {
                def.primary_key = Some(to.to_string());
            }
            for index in def.indexes.iter_mut() {
                for column in index.columns.iter_mut() {
                    if column.name.eq_ignore_ascii_case(&current) {
                        column.name = to.to_string();
                    }
                }
            }
            for fk in def.foreign_keys.iter_mut() {
                if fk.column.eq_ignore_ascii_case(&current) {
                    fk.column = to.to_string();
                }
            }
            let def_name = def.name.clone();
            for other in db.tables.iter_mut() {
                for fk in other.foreign_keys.iter_mut() {
                    if fk.target_table.eq_ignore_ascii_case(&def_name)
                        && fk.target_column.eq_ignore_ascii_case(&current)
                    {
                        fk.target_column = to.to_string();
                    }
                }
            }
            Ok(())
        })?;

        let table = ctx.table(table)?;
        ctx.rewrite_rows(&table, |row| {
            if let Some(value) = row.remove(&current) {
                row.insert(to.to_string(), value);
            }
            Ok(())
        })
    }
}

impl ReplayHandler for RenameHandler {
    fn apply(&self, ctx: &mut MigrationContext<'_>, action: &LogAction) -> Result<()> {
        match action {
            LogAction::Rename {
                table,
                column: None,
                to,
            } => Self::rename_table(ctx, table, to),
            LogAction::Rename {
                table,
                column: Some(column),
                to,
            } => Self::rename_column(ctx, table, column, to),
            other => Err(unexpected(LogOp::Rename, other)),
        }
    }
}

/// Drops a table (with its files) or one of its columns
pub struct DropHandler;

impl ReplayHandler for DropHandler {
    fn apply(&self, ctx: &mut MigrationContext<'_>, action: &LogAction) -> Result<()> {
        match action {
            LogAction::Drop { table, column: None } => {
                let before = ctx.table(table)?;
                ctx.edit_schema(|db| db.remove_table(table).map(|_| ()))?;
                RowStore::new(&before, ctx.config).remove()?;
                ctx.drop_index(&before)
            }
            LogAction::Drop {
                table,
                column: Some(column),
            } => {
                let current = ctx.table(table)?.get_column(column)?.name.clone();
                ctx.edit_schema(|db| {
                    let def = db.table_def_mut(table)?;
                    def.columns.retain(|c| !c.name.eq_ignore_ascii_case(&current));
                    for index in def.indexes.iter_mut() {
                        index.columns.retain(|c| !c.name.eq_ignore_ascii_case(&current));
                    }
                    def.indexes.retain(|i| !i.columns.is_empty());
                    def.foreign_keys.retain(|fk| !fk.column.eq_ignore_ascii_case(&current));
                    Ok(())
                })?;
                let table = ctx.table(table)?;
                ctx.rewrite_rows(&table, |row| {
                    row.remove(&current);
                    Ok(())
                })
            }
            other => Err(unexpected(LogOp::Drop, other)),
        }
    }
}

/// Sets a column on the rows matching an optional condition
pub struct UpdateHandler;

impl ReplayHandler for UpdateHandler {
    fn apply(&self, ctx: &mut MigrationContext<'_>, action: &LogAction) -> Result<()> {
        let (table, column, value, condition) = match action {
            LogAction::Update {
                table,
                column,
                value,
                condition,
            } => (table, column, value, condition),
            other => return Err(unexpected(LogOp::Update, other)),
        };
        let mut engine = ctx.engine()?;
        let mut query = UpdateQuery::new(Arc::clone(engine.schema()), table)?;
        query.set(column, value.clone())?;
        if let Some(condition) = condition {
            query.set_where_text(condition)?;
        }
        let rows = engine.update(&query)?;
        debug!(%table, %column, rows, "Replayed update");
        Ok(())
    }
}

/// Runs a statement in the query grammar
pub struct SqlHandler;

impl ReplayHandler for SqlHandler {
    fn apply(&self, ctx: &mut MigrationContext<'_>, action: &LogAction) -> Result<()> {
        match action {
            LogAction::Sql { statement } => {
                ctx.engine()?.execute_sql(statement)?;
                Ok(())
            }
            other => Err(unexpected(LogOp::Sql, other)),
        }
    }
}

/// Changes column parameters and converts stored values to match
pub struct ChangeHandler;

impl ChangeHandler {
    fn convert(table: &str, column: &Column, row: &mut Row, from: &str) -> Result<()> {
        let mut value = row.remove(from).unwrap_or(Value::Null);
        if value.is_null() {
            if let Some(default) = &column.default {
                value = default.clone();
            }
        }
        let value = column.normalize(&value).map_err(|reason| DbError::ConstraintViolation {
            table: table.to_string(),
            expression: reason,
            row: serde_json::to_string(row).unwrap_or_default(),
        })?;
        row.insert(column.name.clone(), value);
        Ok(())
    }
}

impl ReplayHandler for ChangeHandler {
    fn apply(&self, ctx: &mut MigrationContext<'_>, action: &LogAction) -> Result<()> {
        let (table, column, params) = match action {
            LogAction::Change {
                table,
                column,
                params,
            } => (table, column, params),
            other => return Err(unexpected(LogOp::Change, other)),
        };
        let current = ctx.table(table)?.get_column(column)?.name.clone();

        let mut renamed = current.clone();
        ctx.edit_schema(|db| {
            let def = db.table_def_mut(table)?;
            let target = def.get_column_mut(&current)?;
            for (field, value) in params {
                target.set(field, value)?;
            }
            renamed = target.name.clone();
            if renamed != current
                && def.primary_key.as_deref().map_or(false, |pk| pk.eq_ignore_ascii_case(&current))
            {
                def.primary_key = Some(renamed.clone());
            }
            Ok(())
        })?;

        let table = ctx.table(table)?;
        let changed = table.get_column(&renamed)?.clone();
        ctx.rewrite_rows(&table, |row| Self::convert(&table.name, &changed, row, &current))
    }
}

/// Outcome of a replay
#[derive(Debug)]
pub struct MigrationReport {
    /// The migrated definition, carrying the target's change-log
    pub schema: Database,
    /// Versions applied, oldest first
    pub applied: Vec<String>,
    /// Versions that failed but were marked `ignore_error`
    pub ignored: Vec<String>,
}

impl MigrationReport {
    /// Version the definition is at now
    pub fn version(&self) -> Option<&str> {
        self.schema.changelog.latest_version()
    }
}

/// Replays change-log entries through the handler registered for each kind
pub struct Migrator {
    handlers: HashMap<LogOp, Box<dyn ReplayHandler>>,
}

impl Default for Migrator {
    fn default() -> Self {
        let mut migrator = Migrator {
            handlers: HashMap::new(),
        };
        migrator.register(LogOp::Create, CreateHandler);
        migrator.register(LogOp::Rename, RenameHandler);
        migrator.register(LogOp::Drop, DropHandler);
        migrator.register(LogOp::Update, UpdateHandler);
        migrator.register(LogOp::Sql, SqlHandler);
        migrator.register(LogOp::Change, ChangeHandler);
        migrator
    }
}

impl Migrator {
    pub fn new() -> Self {
        Migrator::default()
    }

    /// Replace the handler for one operation kind
    pub fn register<H: ReplayHandler + 'static>(&mut self, op: LogOp, handler: H) {
        self.handlers.insert(op, Box::new(handler));
    }

    fn apply(&self, ctx: &mut MigrationContext<'_>, entry: &LogEntry) -> Result<()> {
        let op = entry.action.op();
        let handler = self
            .handlers
            .get(&op)
            .ok_or_else(|| DbError::not_found("Replay handler", format!("{:?}", op)))?;
        handler.apply(ctx, &entry.action)
    }

    /// Replay `target`'s entries newer than `since` onto `current` and its
    /// data files. Stops at the first failing entry unless it is marked
    /// `ignore_error`.
    pub fn migrate(
        &self,
        current: &Database,
        target: &Database,
        since: Option<&str>,
        config: &EngineConfig,
    ) -> Result<MigrationReport> {
        let mut entries = target.changelog.get_entries(since, config.dbms);
        entries.reverse();
        info!(
            database = %target.name,
            since = since.unwrap_or("-"),
            entries = entries.len(),
            "Replaying change-log"
        );

        let mut ctx = MigrationContext {
            schema: current.clone(),
            target,
            config,
        };
        let mut applied = Vec::new();
        let mut ignored = Vec::new();

        for entry in entries {
            match self.apply(&mut ctx, entry) {
                Ok(()) => {
                    debug!(version = %entry.version, op = ?entry.action.op(), "Applied change");
                    applied.push(entry.version.clone());
                }
                Err(e) if entry.ignore_error => {
                    warn!(version = %entry.version, error = %e, "Change failed, ignored");
                    ignored.push(entry.version.clone());
                }
                Err(e) => {
                    error!(version = %entry.version, error = %e, "Change failed");
                    return Err(e);
                }
            }
        }

        let mut schema = ctx.schema;
        schema.changelog = target.changelog.clone();
        schema.resolve()?;
        Ok(MigrationReport {
            schema,
            applied,
            ignored,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::changelog::ChangeLog;
    use crate::query_builder::{InsertQuery, SelectQuery};
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    const V1: &str = r#"{"name": "shop", "tables": [
        {"name": "users", "primary_key": "id", "columns": [
            {"name": "id", "type": "integer"},
            {"name": "mail", "type": "string"},
            {"name": "age", "type": "string"}]}
    ]}"#;

    fn seed(dir: &TempDir) -> (Database, EngineConfig) {
        let schema = Database::from_json(V1).unwrap();
        let config = EngineConfig::new(dir.path());
        let mut engine = Engine::new(Arc::new(schema.clone()), config.clone()).unwrap();
        for (id, mail, age) in [(1, "a@x.org", Value::from("31")), (2, "b@x.org", Value::Null)] {
            let mut insert = InsertQuery::new(Arc::clone(engine.schema()), "users").unwrap();
            insert.set("id", id).unwrap();
            insert.set("mail", mail).unwrap();
            insert.set("age", age).unwrap();
            engine.insert(&insert).unwrap();
        }
        (schema, config)
    }

    fn target(entries: Vec<LogEntry>) -> Database {
        let mut db = Database::from_json(
            r#"{"name": "shop", "tables": [
                {"name": "users", "primary_key": "id", "columns": [
                    {"name": "id", "type": "integer"},
                    {"name": "email", "type": "string"},
                    {"name": "age", "type": "integer", "default": 18}]},
                {"name": "posts", "primary_key": "id", "columns": [
                    {"name": "id", "type": "integer"}]}
            ]}"#,
        )
        .unwrap();
        let mut log = ChangeLog::new();
        for entry in entries {
            log.push(entry).unwrap();
        }
        db.changelog = log;
        db
    }

    #[test]
    fn test_replay_renames_changes_and_creates() {
        let dir = TempDir::new().unwrap();
        let (current, config) = seed(&dir);

        let mut params = BTreeMap::new();
        params.insert("type".to_string(), "integer".to_string());
        params.insert("default".to_string(), "18".to_string());
        let target = target(vec![
            LogEntry::new(
                "1.1",
                LogAction::Rename {
                    table: "users".to_string(),
                    column: Some("mail".to_string()),
                    to: "email".to_string(),
                },
            ),
            LogEntry::new(
                "1.2",
                LogAction::Change {
                    table: "users".to_string(),
                    column: "age".to_string(),
                    params,
                },
            ),
            LogEntry::new("1.3", LogAction::Create { table: "posts".to_string() }),
            LogEntry::new(
                "1.4",
                LogAction::Update {
                    table: "users".to_string(),
                    column: "email".to_string(),
                    value: Value::from("root@x.org"),
                    condition: Some("id = 1".to_string()),
                },
            ),
        ]);

        let report = Migrator::new().migrate(&current, &target, Some("1.0"), &config).unwrap();
        assert_eq!(report.applied, vec!["1.1", "1.2", "1.3", "1.4"]);
        assert_eq!(report.version(), Some("1.4"));
        assert!(report.schema.get_table("posts").is_ok());

        let schema = Arc::new(report.schema);
        let mut engine = Engine::new(Arc::clone(&schema), config).unwrap();
        let rows = SelectQuery::parse(Arc::clone(&schema), "SELECT email, age FROM users")
            .unwrap()
            .execute(&mut engine)
            .unwrap();
        assert_eq!(rows.column("email"), vec![Value::from("root@x.org"), Value::from("b@x.org")]);
        assert_eq!(rows.column("age"), vec![Value::Int(31), Value::Int(18)]);
        assert!(engine.rows("posts").unwrap().is_empty());
    }

    #[test]
    fn test_failing_entry_respects_ignore_error() {
        let dir = TempDir::new().unwrap();
        let (current, config) = seed(&dir);

        let broken = LogEntry::new(
            "2.0",
            LogAction::Drop {
                table: "missing".to_string(),
                column: None,
            },
        );
        let target_db = target(vec![broken.clone().ignoring_errors()]);
        let report = Migrator::new().migrate(&current, &target_db, None, &config).unwrap();
        assert!(report.applied.is_empty());
        assert_eq!(report.ignored, vec!["2.0"]);

        let target_db = target(vec![broken]);
        let err = Migrator::new().migrate(&current, &target_db, None, &config).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_drop_table_removes_files() {
        let dir = TempDir::new().unwrap();
        let (current, config) = seed(&dir);
        let target_db = target(vec![LogEntry::new(
            "3.0",
            LogAction::Drop {
                table: "users".to_string(),
                column: None,
            },
        )]);

        let report = Migrator::new().migrate(&current, &target_db, None, &config).unwrap();
        assert!(report.schema.get_table("users").is_err());
        assert!(!config.data_path("users").exists());
    }
}
