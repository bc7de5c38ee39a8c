//! Query Executor
//!
//! Runs query objects against the row store. Reads resolve candidate rows
//! through a primary-key selector, an index, or a full scan, then filter,
//! order, paginate, project and apply having. Mutations go through the
//! trigger / check / write / index-commit sequence and leave stored state
//! untouched when any step fails.

use crate::config::EngineConfig;
use crate::error::{DbError, Result};
use crate::index::IndexManager;
use crate::query_ast::*;
use crate::query_builder::{
    CountQuery, DeleteQuery, ExistsQuery, InsertQuery, Query, QueryObject, SelectQuery, UpdateQuery,
};
use crate::query_eval::{aggregate, cell, evaluate, RowSource, ValueSource};
use crate::query_path::DataPath;
use crate::schema::{AutoValue, ColumnType, Database, FireTime, Table, TriggerEvent, TIMESTAMP_FORMAT};
use crate::storage::RowStore;
use crate::triggers::{TriggerContext, TriggerRegistry};
use crate::types::{Row, RowId, RowSet, Value};
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::fs;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Rows of a select, keyed by output label
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ResultSet {
    /// Output labels in select order
    pub columns: Vec<String>,
    pub rows: Vec<Row>,
}

impl ResultSet {
    pub fn empty(columns: Vec<String>) -> Self {
        ResultSet {
            columns,
            rows: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Row> {
        self.rows.iter()
    }

    /// Values of one output column, top to bottom
    pub fn column(&self, label: &str) -> Vec<Value> {
        self.rows
            .iter()
            .map(|r| cell(r, label).cloned().unwrap_or(Value::Null))
            .collect()
    }

    /// First column of the first row
    pub fn first_value(&self) -> Option<&Value> {
        let label = self.columns.first()?;
        self.rows.first().and_then(|r| cell(r, label))
    }
}

/// What executing a query produced
#[derive(Debug, Clone, PartialEq)]
pub enum QueryOutcome {
    Rows(ResultSet),
    Count(i64),
    Exists(bool),
    Affected(usize),
    Inserted(RowId),
}

/// Loaded state of one table
#[derive(Debug)]
struct TableState {
    store: RowStore,
    rows: RowSet,
    indexes: IndexManager,
}

/// Row sets reachable while one table's state is checked out
#[derive(Clone, Copy)]
struct TableView<'a> {
    current: (&'a str, &'a RowSet),
    others: &'a HashMap<String, TableState>,
}

impl<'a> TableView<'a> {
    fn rows(&self, table: &str) -> Option<&'a RowSet> {
        if self.current.0.eq_ignore_ascii_case(table) {
            return Some(self.current.1);
        }
        self.others.get(&table.to_uppercase()).map(|s| &s.rows)
    }
}

/// Find the row of `rows` whose `column` equals `value`
fn find_row<'a>(rows: &'a RowSet, table: &Table, column: &str, value: &Value) -> Option<&'a Row> {
    if column.eq_ignore_ascii_case(table.pk()) {
        if let Some(row) = RowId::from_value(value).and_then(|id| rows.get(&id)) {
            return Some(row);
        }
    }
    rows.values()
        .find(|r| cell(r, column).map_or(false, |v| v.loosely_equals(value)))
}

/// Whether an index lookup of `value` in a `column_type` column finds
/// exactly the rows a `loosely_equals` scan finds. Holds when the literal
/// already has the stored representation of the column; literals that only
/// match through numeric or boolean coercion must be scanned.
fn keyed_exactly(column_type: ColumnType, value: &Value) -> bool {
    match value {
        Value::Bool(_) => column_type == ColumnType::Bool,
        Value::Int(_) => column_type == ColumnType::Integer,
        Value::Float(f) => column_type == ColumnType::Float && f.is_finite(),
        Value::String(s) => {
            let word = s.trim();
            !matches!(
                column_type,
                ColumnType::Bool | ColumnType::Integer | ColumnType::Float
            ) && word.parse::<f64>().is_err()
                && !word.eq_ignore_ascii_case("true")
                && !word.eq_ignore_ascii_case("false")
                && !word.starts_with(['[', '{'])
        }
        Value::Null | Value::List(_) | Value::Map(_) => false,
    }
}

/// A stored row plus the tables its foreign keys lead to
struct JoinedSource<'a> {
    schema: &'a Database,
    table: &'a Table,
    row: &'a Row,
    view: TableView<'a>,
}

impl ValueSource for JoinedSource<'_> {
    fn value(&self, column: &ColumnRef) -> Result<Value> {
        let (target_name, target_column) = match column {
            ColumnRef::Nested { table, column } => (table, column),
            other => return RowSource::new(self.row).value(other),
        };

        let fk = self.table.foreign_key_to(target_name).ok_or_else(|| {
            DbError::InvalidQuery(format!(
                "Table '{}' has no foreign key to '{}'",
                self.table.name, target_name
            ))
        })?;
        let local = match cell(self.row, &fk.column) {
            Some(v) if !v.is_null() => v,
            _ => return Ok(Value::Null),
        };
        let target = self.schema.get_table(&fk.target_table)?;
        let rows = match self.view.rows(&target.name) {
            Some(rows) => rows,
            None => return Ok(Value::Null),
        };
        Ok(find_row(rows, target, &fk.target_column, local)
            .and_then(|r| cell(r, target_column))
            .cloned()
            .unwrap_or(Value::Null))
    }
}

/// A projected result row; aggregates resolve to their output column
struct ResultSource<'a> {
    row: &'a Row,
    columns: &'a [SelectColumn],
}

impl ValueSource for ResultSource<'_> {
    fn value(&self, column: &ColumnRef) -> Result<Value> {
        let label = column.render();
        if let Some(v) = cell(self.row, &label) {
            return Ok(v.clone());
        }
        // A column selected under an alias
        Ok(self
            .columns
            .iter()
            .find(|c| matches!(&c.expr, ColumnExpr::Ref(r) if r == column))
            .and_then(|c| cell(self.row, &c.label()))
            .cloned()
            .unwrap_or(Value::Null))
    }

    fn aggregate(&self, func: AggregateFunction, column: Option<&ColumnRef>) -> Result<Value> {
        let wanted = ColumnExpr::Aggregate(func, column.cloned());
        self.columns
            .iter()
            .find(|c| c.expr == wanted)
            .and_then(|c| cell(self.row, &c.label()))
            .cloned()
            .ok_or_else(|| {
                DbError::InvalidQuery(format!(
                    "HAVING uses {} which is not selected",
                    wanted.render()
                ))
            })
    }
}

fn paginate<T>(items: Vec<T>, offset: Option<usize>, limit: Option<usize>) -> Vec<T> {
    items
        .into_iter()
        .skip(offset.unwrap_or(0))
        .take(limit.unwrap_or(usize::MAX))
        .collect()
}

/// Ordering used by ORDER BY: nulls first, incomparable values tie
fn order_values(a: &Value, b: &Value) -> Ordering {
    match (a.is_null(), b.is_null()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        _ => a.compare(b).unwrap_or(Ordering::Equal),
    }
}

fn row_snapshot(row: &Row) -> String {
    serde_json::to_string(row).unwrap_or_default()
}

/// Rows touched by a mutation, with their prior contents
type UndoLog = Vec<(RowId, Option<Row>)>;

/// Embedded execution engine over one schema and one data directory
pub struct Engine {
    schema: Arc<Database>,
    config: EngineConfig,
    triggers: TriggerRegistry,
    tables: HashMap<String, TableState>,
}

impl Engine {
    pub fn new(schema: Arc<Database>, config: EngineConfig) -> Result<Self> {
        fs::create_dir_all(&config.data_dir).map_err(|e| DbError::NotWriteable {
            path: config.data_dir.clone(),
            reason: e.to_string(),
        })?;
        info!(
            database = %schema.name,
            data_dir = %config.data_dir.display(),
            dbms = %config.dbms,
            "Engine opened"
        );
        Ok(Engine {
            schema,
            config,
            triggers: TriggerRegistry::new(),
            tables: HashMap::new(),
        })
    }

    pub fn with_triggers(mut self, triggers: TriggerRegistry) -> Self {
        self.triggers = triggers;
        self
    }

    pub fn triggers_mut(&mut self) -> &mut TriggerRegistry {
        &mut self.triggers
    }

    pub fn schema(&self) -> &Arc<Database> {
        &self.schema
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Switch to a new definition (after a migration); cached tables are dropped
    pub fn set_schema(&mut self, schema: Arc<Database>) {
        self.schema = schema;
        self.tables.clear();
    }

    // ---------------------------------------------------------------
    // Table state
    // ---------------------------------------------------------------

    fn load(&mut self, table: &Table) -> Result<()> {
        let key = table.name.to_uppercase();
        if let Some(state) = self.tables.get_mut(&key) {
            if !state.store.is_stale() {
                return Ok(());
            }
            debug!(table = %table.name, "Table file changed on disk, reloading");
            state.rows = state.store.read()?;
            state.indexes.rollback(&state.rows)?;
            return Ok(());
        }

        let mut store = RowStore::new(table, &self.config);
        let rows = store.read()?;
        let indexes = IndexManager::open(table, self.config.index_path(&table.name), &rows)?;
        self.tables.insert(key, TableState { store, rows, indexes });
        Ok(())
    }

    /// Load `table` and every table its foreign keys point at
    fn load_with_targets(&mut self, table: &Table) -> Result<()> {
        self.load(table)?;
        let schema = Arc::clone(&self.schema);
        for fk in &table.foreign_keys {
            let target = schema.get_table(&fk.target_table)?;
            self.load(target)?;
        }
        Ok(())
    }

    fn state(&self, table: &Table) -> Result<&TableState> {
        self.tables
            .get(&table.name.to_uppercase())
            .ok_or_else(|| DbError::not_found("Table", table.name.as_str()))
    }

    /// Check one table's state out of the cache for the duration of `f`
    fn with_state<T, F>(&mut self, table: &Table, f: F) -> Result<T>
    where
        F: FnOnce(&mut Self, &mut TableState) -> Result<T>,
    {
        let key = table.name.to_uppercase();
        let mut state = self
            .tables
            .remove(&key)
            .ok_or_else(|| DbError::not_found("Table", table.name.as_str()))?;
        let result = f(self, &mut state);
        self.tables.insert(key, state);
        result
    }

    fn view<'a>(&'a self, table: &'a Table, rows: &'a RowSet) -> TableView<'a> {
        TableView {
            current: (table.name.as_str(), rows),
            others: &self.tables,
        }
    }

    fn joined<'a>(&'a self, table: &'a Table, row: &'a Row, view: TableView<'a>) -> JoinedSource<'a> {
        JoinedSource {
            schema: &self.schema,
            table,
            row,
            view,
        }
    }

    /// Stored rows of a table, in primary-key order
    pub fn rows(&mut self, table: &str) -> Result<&RowSet> {
        let schema = Arc::clone(&self.schema);
        let table = schema.get_table(table)?;
        self.load(table)?;
        Ok(&self.state(table)?.rows)
    }

    /// Index manager of a table
    pub fn indexes(&mut self, table: &str) -> Result<&IndexManager> {
        let schema = Arc::clone(&self.schema);
        let table = schema.get_table(table)?;
        self.load(table)?;
        Ok(&self.state(table)?.indexes)
    }

    /// Reread a table from disk and restore its last committed index
    pub fn rollback(&mut self, table: &str) -> Result<()> {
        let schema = Arc::clone(&self.schema);
        let table = schema.get_table(table)?;
        self.load(table)?;
        self.with_state(table, |_, state| {
            state.rows = state.store.read()?;
            state.indexes.rollback(&state.rows)
        })
    }

    // ---------------------------------------------------------------
    // Read path
    // ---------------------------------------------------------------

    /// Candidate ids before filtering: the row selector, an index hit on
    /// the first usable equality conjunct, or every row.
    fn candidates(&self, table: &Table, state: &TableState, parts: &QueryParts) -> Result<Vec<RowId>> {
        if let Some(id) = &parts.row {
            return Ok(state.rows.contains_key(id).then(|| id.clone()).into_iter().collect());
        }

        if let Some(condition) = &parts.where_clause {
            for leaf in condition.conjuncts() {
                let (column, value) = match leaf {
                    Condition::Compare {
                        left: Operand::Column(ColumnRef::Column(c)),
                        op: Operator::Eq,
                        right: Operand::Literal(v),
                    }
                    | Condition::Compare {
                        left: Operand::Literal(v),
                        op: Operator::Eq,
                        right: Operand::Column(ColumnRef::Column(c)),
                    } => (c, v),
                    _ => continue,
                };
                if value.is_null() || !state.indexes.is_indexed(column) {
                    continue;
                }
                let column_type = table.get_column(column)?.column_type;
                if column_type.is_collection() || !keyed_exactly(column_type, value) {
                    continue;
                }
                let mut ids = state.indexes.lookup(column, value)?;
                ids.sort();
                debug!(table = %table.name, %column, hits = ids.len(), "Index lookup");
                return Ok(ids);
            }
        }

        Ok(state.rows.keys().cloned().collect())
    }

    /// Ids of the rows matching `parts`, filtered and ordered
    fn matching(&self, table: &Table, state: &TableState, parts: &QueryParts) -> Result<Vec<RowId>> {
        let view = self.view(table, &state.rows);
        let mut ids = Vec::new();
        for id in self.candidates(table, state, parts)? {
            let row = match state.rows.get(&id) {
                Some(r) => r,
                None => continue,
            };
            if let Some(condition) = &parts.where_clause {
                let source = self.joined(table, row, view);
                if !evaluate(condition, &source)? {
                    continue;
                }
            }
            ids.push(id);
        }

        if !parts.order_by.is_empty() {
            let mut keyed = Vec::with_capacity(ids.len());
            for id in ids {
                let mut keys = Vec::with_capacity(parts.order_by.len());
                if let Some(row) = state.rows.get(&id) {
                    let source = self.joined(table, row, view);
                    for order in &parts.order_by {
                        keys.push(source.value(&order.column)?);
                    }
                }
                keyed.push((id, keys));
            }
            keyed.sort_by(|(_, a), (_, b)| {
                for (i, order) in parts.order_by.iter().enumerate() {
                    let ord = match (a.get(i), b.get(i)) {
                        (Some(x), Some(y)) => order_values(x, y),
                        _ => Ordering::Equal,
                    };
                    let ord = match order.direction {
                        Direction::Asc => ord,
                        Direction::Desc => ord.reverse(),
                    };
                    if ord != Ordering::Equal {
                        return ord;
                    }
                }
                Ordering::Equal
            });
            ids = keyed.into_iter().map(|(id, _)| id).collect();
        }
        Ok(ids)
    }

    fn output_columns(table: &Table, parts: &QueryParts) -> Vec<SelectColumn> {
        let star = || {
            table
                .columns
                .iter()
                .map(|c| SelectColumn::new(ColumnExpr::Ref(ColumnRef::Column(c.name.clone()))))
                .collect::<Vec<_>>()
        };
        if parts.columns.is_empty() {
            return star();
        }
        let mut out = Vec::new();
        for column in &parts.columns {
            match column.expr {
                ColumnExpr::Star => out.extend(star()),
                _ => out.push(column.clone()),
            }
        }
        out
    }

    fn project(
        &self,
        table: &Table,
        state: &TableState,
        columns: &[SelectColumn],
        ids: &[RowId],
        aggregated: bool,
    ) -> Result<Vec<Row>> {
        let view = self.view(table, &state.rows);
        if !aggregated {
            let mut out = Vec::with_capacity(ids.len());
            for id in ids {
                let row = match state.rows.get(id) {
                    Some(r) => r,
                    None => continue,
                };
                let source = self.joined(table, row, view);
                let mut projected = Row::new();
                for column in columns {
                    if let ColumnExpr::Ref(r) = &column.expr {
                        projected.insert(column.label(), source.value(r)?);
                    }
                }
                out.push(projected);
            }
            return Ok(out);
        }

        // No GROUP BY: one row folded over every match
        let rows: Vec<&Row> = ids.iter().filter_map(|id| state.rows.get(id)).collect();
        let mut projected = Row::new();
        for column in columns {
            let value = match &column.expr {
                ColumnExpr::Aggregate(AggregateFunction::Count, None) => Value::Int(rows.len() as i64),
                ColumnExpr::Aggregate(func, None) => {
                    return Err(DbError::InvalidQuery(format!("{}(*) needs a column", func.name())))
                }
                ColumnExpr::Aggregate(func, Some(r)) => {
                    let mut values = Vec::with_capacity(rows.len());
                    for row in &rows {
                        values.push(self.joined(table, row, view).value(r)?);
                    }
                    aggregate(*func, &values)
                }
                ColumnExpr::Ref(r) => match rows.first() {
                    Some(row) => self.joined(table, row, view).value(r)?,
                    None => Value::Null,
                },
                ColumnExpr::Star => Value::Null,
            };
            projected.insert(column.label(), value);
        }
        Ok(vec![projected])
    }

    /// Run a select. Storage failures yield an empty result with a warning
    /// unless strict reads are on or a single row was requested.
    pub fn select(&mut self, query: &SelectQuery) -> Result<ResultSet> {
        match self.try_select(query) {
            Ok(result) => Ok(result),
            Err(e) if e.is_storage() && !self.config.strict_reads && query.parts().row.is_none() => {
                warn!(table = %query.parts().table, error = %e, "Read failed, returning empty result");
                Ok(ResultSet::empty(
                    query.parts().columns.iter().map(SelectColumn::label).collect(),
                ))
            }
            Err(e) => Err(e),
        }
    }

    fn try_select(&mut self, query: &SelectQuery) -> Result<ResultSet> {
        let schema = Arc::clone(&self.schema);
        let parts = query.parts();
        let table = schema.get_table(&parts.table)?;
        self.load_with_targets(table)?;
        let state = self.state(table)?;

        let ids = self.matching(table, state, parts)?;
        let columns = Self::output_columns(table, parts);
        let aggregated = columns.iter().any(|c| c.expr.is_aggregate());

        let mut labels: Vec<String> = columns.iter().map(SelectColumn::label).collect();
        let mut rows = if aggregated {
            let rows = self.project(table, state, &columns, &ids, true)?;
            paginate(rows, parts.offset, parts.limit)
        } else {
            let ids = paginate(ids, parts.offset, parts.limit);
            let mut rows = self.project(table, state, &columns, &ids, false)?;
            let pk = table.pk();
            if !parts.subquery && !labels.iter().any(|l| l.eq_ignore_ascii_case(pk)) {
                // Primary-key companion column
                labels.push(pk.to_string());
                for (row, id) in rows.iter_mut().zip(&ids) {
                    row.insert(pk.to_string(), id.to_value());
                }
            }
            rows
        };

        if let Some(having) = &parts.having {
            let mut kept = Vec::with_capacity(rows.len());
            for row in rows {
                let source = ResultSource {
                    row: &row,
                    columns: &columns,
                };
                if evaluate(having, &source)? {
                    kept.push(row);
                }
            }
            rows = kept;
        }

        debug!(table = %table.name, rows = rows.len(), "Select");
        Ok(ResultSet {
            columns: labels,
            rows,
        })
    }

    /// Number of matching rows (non-null values when a column is given).
    /// Pagination is ignored; any failure counts as 0.
    pub fn count(&mut self, query: &CountQuery) -> i64 {
        match self.try_count(query) {
            Ok(n) => n,
            Err(e) => {
                warn!(table = %query.parts().table, error = %e, "Count failed, returning 0");
                0
            }
        }
    }

    fn try_count(&mut self, query: &CountQuery) -> Result<i64> {
        let schema = Arc::clone(&self.schema);
        let parts = query.parts();
        let table = schema.get_table(&parts.table)?;
        self.load_with_targets(table)?;
        let state = self.state(table)?;

        let filter = QueryParts {
            table: parts.table.clone(),
            where_clause: parts.where_clause.clone(),
            row: parts.row.clone(),
            ..Default::default()
        };
        let ids = self.matching(table, state, &filter)?;

        let column = match query.column() {
            None => return Ok(ids.len() as i64),
            Some(c) => c,
        };
        let view = self.view(table, &state.rows);
        let mut n = 0;
        for id in &ids {
            if let Some(row) = state.rows.get(id) {
                let source = self.joined(table, row, view);
                if !source.value(column)?.is_null() {
                    n += 1;
                }
            }
        }
        Ok(n)
    }

    pub fn exists(&mut self, query: &ExistsQuery) -> Result<bool> {
        let schema = Arc::clone(&self.schema);
        let parts = query.parts();
        let table = schema.get_table(&parts.table)?;

        let result = match self.load_with_targets(table) {
            Ok(()) => self
                .state(table)
                .and_then(|state| self.matching(table, state, parts)),
            Err(e) => Err(e),
        };
        match result {
            Ok(ids) => Ok(!ids.is_empty()),
            Err(e) if e.is_storage() && !self.config.strict_reads && parts.row.is_none() => {
                warn!(table = %table.name, error = %e, "Read failed, reporting no rows");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Value(s) addressed by a data path, e.g. `users.3.name` or `users.*.tags.0`
    pub fn get_path(&mut self, path: &str) -> Result<Value> {
        let address = DataPath::parse(path)?;
        let query = SelectQuery::from_path(Arc::clone(&self.schema), path)?;
        let result = self.select(&query)?;

        let value_of = |row: &Row| -> Value {
            match &address.column {
                Some(_) => result
                    .columns
                    .first()
                    .and_then(|label| cell(row, label))
                    .cloned()
                    .unwrap_or(Value::Null),
                None => Value::Map(row.clone()),
            }
        };

        match &address.row {
            Some(id) => result
                .rows
                .first()
                .map(value_of)
                .ok_or_else(|| DbError::not_found("Row", format!("{}.{}", address.table, id))),
            None => Ok(Value::List(result.rows.iter().map(value_of).collect())),
        }
    }

    /// Parse and run a statement
    pub fn execute_sql(&mut self, text: &str) -> Result<QueryOutcome> {
        let query = Query::parse(Arc::clone(&self.schema), text)?;
        debug!(statement = %query, "Executing statement");
        query.execute(self)
    }

    // ---------------------------------------------------------------
    // Mutations
    // ---------------------------------------------------------------

    /// Fire the `timing` triggers for `ctx.event`; returns how many fired
    fn fire(&self, table: &Table, timing: FireTime, ctx: &mut TriggerContext) -> Result<usize> {
        let triggers = table.triggers_for(timing, ctx.event, self.config.dbms);
        ctx.timing = timing;
        for trigger in &triggers {
            self.triggers.fire(trigger, ctx)?;
        }
        Ok(triggers.len())
    }

    /// Column values for a new row that the caller left empty
    fn fill_defaults(&self, table: &Table, rows: &RowSet, row: &mut Row) -> Result<()> {
        for column in &table.columns {
            if cell(row, &column.name).map_or(false, |v| !v.is_null()) {
                continue;
            }
            let value = match &column.auto {
                Some(AutoValue::Sequence(name)) => {
                    let sequence = self.schema.get_sequence(name)?;
                    let existing = rows
                        .values()
                        .filter_map(|r| cell(r, &column.name).and_then(Value::as_i64));
                    let current = if sequence.increment() > 0 {
                        existing.max()
                    } else {
                        existing.min()
                    };
                    Value::Int(sequence.next_after(current)?)
                }
                Some(AutoValue::Now) => {
                    let now = chrono::Local::now().naive_local();
                    match column.column_type {
                        ColumnType::Date => Value::from(now.format("%Y-%m-%d").to_string()),
                        ColumnType::Time => Value::from(now.format("%H:%M:%S").to_string()),
                        ColumnType::Integer => Value::Int(chrono::Utc::now().timestamp()),
                        _ => Value::from(now.format(TIMESTAMP_FORMAT).to_string()),
                    }
                }
                None => match &column.default {
                    Some(default) => default.clone(),
                    None => continue,
                },
            };
            row.insert(column.name.clone(), value);
        }
        Ok(())
    }

    fn violation(&self, table: &Table, expression: &str, row: &Row) -> DbError {
        let row = row_snapshot(row);
        warn!(table = %table.name, %expression, %row, "Constraint violated");
        DbError::ConstraintViolation {
            table: table.name.clone(),
            expression: expression.to_string(),
            row,
        }
    }

    /// Column checks, key uniqueness, foreign keys and table constraints.
    /// `own` is the row's id before the write (updates). Returns the
    /// normalised row and its id.
    fn check_row(
        &self,
        table: &Table,
        state: &TableState,
        own: Option<&RowId>,
        row: Row,
    ) -> Result<(RowId, Row)> {
        for key in row.keys() {
            table.get_column(key)?;
        }

        let mut checked = Row::new();
        for column in &table.columns {
            let value = cell(&row, &column.name).cloned().unwrap_or(Value::Null);
            match column.normalize(&value) {
                Ok(v) => {
                    checked.insert(column.name.clone(), v);
                }
                Err(reason) => return Err(self.violation(table, &reason, &row)),
            }
        }

        let pk = table.pk();
        let id = cell(&checked, pk)
            .and_then(RowId::from_value)
            .ok_or_else(|| self.violation(table, &format!("{} IS NOT NULL", pk), &checked))?;
        if Some(&id) != own && state.rows.contains_key(&id) {
            return Err(DbError::DuplicateKey {
                table: table.name.clone(),
                key: id.to_string(),
            });
        }

        for index in table.unique_indexes() {
            let values: Vec<(&str, &Value)> = index
                .columns
                .iter()
                .filter_map(|c| {
                    let name = table.get_column(&c.name).ok()?.name.as_str();
                    Some((name, cell(&checked, name)?))
                })
                .collect();
            if values.iter().any(|(_, v)| v.is_null()) || values.is_empty() {
                continue;
            }

            let clash = match values.as_slice() {
                [(column, value)]
                    if state.indexes.is_indexed(column)
                        && table
                            .get_column(column)
                            .map_or(false, |c| keyed_exactly(c.column_type, value)) =>
                {
                    state
                        .indexes
                        .lookup(column, value)?
                        .into_iter()
                        .any(|other| Some(&other) != own)
                }
                _ => state.rows.iter().any(|(other, r)| {
                    Some(other) != own
                        && values
                            .iter()
                            .all(|(c, v)| cell(r, c).map_or(false, |x| x.loosely_equals(v)))
                }),
            };
            if clash {
                let key: Vec<String> = values.iter().map(|(c, v)| format!("{}={}", c, v)).collect();
                return Err(DbError::DuplicateKey {
                    table: table.name.clone(),
                    key: key.join(","),
                });
            }
        }

        let view = self.view(table, &state.rows);
        for fk in &table.foreign_keys {
            let value = match cell(&checked, &fk.column) {
                Some(v) if !v.is_null() => v,
                _ => continue,
            };
            let target = self.schema.get_table(&fk.target_table)?;
            let found = view
                .rows(&target.name)
                .and_then(|rows| find_row(rows, target, &fk.target_column, value))
                .is_some();
            if !found {
                let expression = format!(
                    "{} REFERENCES {}.{}",
                    fk.column, target.name, fk.target_column
                );
                return Err(self.violation(table, &expression, &checked));
            }
        }

        for constraint in table.constraints_for(self.config.dbms) {
            let source = self.joined(table, &checked, view);
            if !evaluate(constraint.condition(), &source)? {
                return Err(self.violation(table, constraint.expression(), &checked));
            }
        }

        Ok((id, checked))
    }

    /// Put touched rows back and restore the committed index
    fn undo(&self, table: &Table, state: &mut TableState, undo: UndoLog) {
        for (id, previous) in undo.into_iter().rev() {
            match previous {
                Some(row) => {
                    state.rows.insert(id, row);
                }
                None => {
                    state.rows.remove(&id);
                }
            }
        }
        if let Err(e) = state.indexes.rollback(&state.rows) {
            warn!(table = %table.name, error = %e, "Index rollback failed");
        }
    }

    /// Write rows, then commit indexes. A failed row write is undone; a
    /// failed index commit leaves the index stale until the next rollback.
    fn commit(&self, table: &Table, state: &mut TableState, undo: UndoLog) -> Result<()> {
        if let Err(e) = state.store.write(&state.rows) {
            self.undo(table, state, undo);
            return Err(e);
        }
        state.indexes.commit().map_err(|e| {
            warn!(table = %table.name, error = %e, "Index commit failed, index is stale");
            e
        })
    }

    pub fn insert(&mut self, query: &InsertQuery) -> Result<RowId> {
        let schema = Arc::clone(&self.schema);
        let table = schema.get_table(&query.parts().table)?;
        if table.readonly {
            return Err(DbError::Readonly(table.name.clone()));
        }
        self.load_with_targets(table)?;
        self.with_state(table, |engine, state| {
            engine.insert_row(table, state, query.assignments())
        })
    }

    fn insert_row(&self, table: &Table, state: &mut TableState, assignments: &[Assignment]) -> Result<RowId> {
        let mut row = Row::new();
        for assignment in assignments {
            let column = table.get_column(&assignment.column)?;
            if !column.insertable || column.readonly {
                return Err(DbError::InvalidQuery(format!(
                    "Column '{}.{}' is not insertable",
                    table.name, column.name
                )));
            }
            row.insert(column.name.clone(), assignment.value.clone());
        }
        self.fill_defaults(table, &state.rows, &mut row)?;

        let mut ctx = TriggerContext::new(&table.name, TriggerEvent::Insert, FireTime::Before);
        ctx.row_id = cell(&row, table.pk()).and_then(RowId::from_value);
        ctx.new_row = Some(row);
        self.fire(table, FireTime::Before, &mut ctx)?;
        if self.fire(table, FireTime::Instead, &mut ctx)? > 0 {
            let row = ctx.new_row.unwrap_or_default();
            return Ok(cell(&row, table.pk())
                .and_then(RowId::from_value)
                .unwrap_or_else(|| RowId::new("")));
        }

        let row = ctx.new_row.take().unwrap_or_default();
        let (id, row) = self.check_row(table, state, None, row)?;

        state.rows.insert(id.clone(), row.clone());
        state.indexes.update_row(&id, None, Some(&row));
        let undo: UndoLog = vec![(id.clone(), None)];

        let mut ctx = TriggerContext::new(&table.name, TriggerEvent::Insert, FireTime::After);
        ctx.row_id = Some(id.clone());
        ctx.new_row = Some(row);
        if let Err(e) = self.fire(table, FireTime::After, &mut ctx) {
            self.undo(table, state, undo);
            return Err(e);
        }

        self.commit(table, state, undo)?;
        info!(table = %table.name, id = %id, "Inserted row");
        Ok(id)
    }

    pub fn update(&mut self, query: &UpdateQuery) -> Result<usize> {
        let schema = Arc::clone(&self.schema);
        let table = schema.get_table(&query.parts().table)?;
        if table.readonly {
            return Err(DbError::Readonly(table.name.clone()));
        }
        if query.assignments().is_empty() {
            return Err(DbError::InvalidQuery("UPDATE without assignments".to_string()));
        }
        for assignment in query.assignments() {
            let column = table.get_column(&assignment.column)?;
            if !column.updatable || column.readonly {
                return Err(DbError::InvalidQuery(format!(
                    "Column '{}.{}' is not updatable",
                    table.name, column.name
                )));
            }
        }
        self.load_with_targets(table)?;
        self.with_state(table, |engine, state| engine.update_rows(table, state, query))
    }

    fn update_rows(&self, table: &Table, state: &mut TableState, query: &UpdateQuery) -> Result<usize> {
        let parts = query.parts();
        let ids = paginate(self.matching(table, state, parts)?, parts.offset, parts.limit);
        let mut undo = UndoLog::new();
        let mut affected = 0;

        for id in ids {
            let old = match state.rows.get(&id) {
                Some(r) => r.clone(),
                None => continue,
            };
            let mut new = old.clone();
            for assignment in query.assignments() {
                new.insert(assignment.column.clone(), assignment.value.clone());
            }

            let mut ctx = TriggerContext::new(&table.name, TriggerEvent::Update, FireTime::Before);
            ctx.row_id = Some(id.clone());
            ctx.old_row = Some(old.clone());
            ctx.new_row = Some(new);

            let step = self.update_one(table, state, &id, old, &mut ctx, &mut undo);
            match step {
                Ok(()) => affected += 1,
                Err(e) => {
                    self.undo(table, state, undo);
                    return Err(e);
                }
            }
        }

        if !undo.is_empty() {
            self.commit(table, state, undo)?;
        }
        info!(table = %table.name, rows = affected, "Updated rows");
        Ok(affected)
    }

    fn update_one(
        &self,
        table: &Table,
        state: &mut TableState,
        id: &RowId,
        old: Row,
        ctx: &mut TriggerContext,
        undo: &mut UndoLog,
    ) -> Result<()> {
        self.fire(table, FireTime::Before, ctx)?;
        if self.fire(table, FireTime::Instead, ctx)? > 0 {
            return Ok(());
        }

        let new = ctx.new_row.take().unwrap_or_default();
        let (new_id, new) = self.check_row(table, state, Some(id), new)?;

        undo.push((id.clone(), Some(old.clone())));
        if new_id != *id {
            undo.push((new_id.clone(), None));
            state.rows.remove(id);
            state.indexes.update_row(id, Some(&old), None);
            state.indexes.update_row(&new_id, None, Some(&new));
        } else {
            state.indexes.update_row(id, Some(&old), Some(&new));
        }
        state.rows.insert(new_id.clone(), new.clone());

        ctx.timing = FireTime::After;
        ctx.row_id = Some(new_id);
        ctx.new_row = Some(new);
        self.fire(table, FireTime::After, ctx)?;
        Ok(())
    }

    pub fn delete(&mut self, query: &DeleteQuery) -> Result<usize> {
        let schema = Arc::clone(&self.schema);
        let table = schema.get_table(&query.parts().table)?;
        if table.readonly {
            return Err(DbError::Readonly(table.name.clone()));
        }
        self.load_with_targets(table)?;
        self.with_state(table, |engine, state| engine.delete_rows(table, state, query.parts()))
    }

    fn delete_rows(&self, table: &Table, state: &mut TableState, parts: &QueryParts) -> Result<usize> {
        let ids = paginate(self.matching(table, state, parts)?, parts.offset, parts.limit);
        let mut undo = UndoLog::new();
        let mut affected = 0;

        for id in ids {
            let old = match state.rows.get(&id) {
                Some(r) => r.clone(),
                None => continue,
            };
            let mut ctx = TriggerContext::new(&table.name, TriggerEvent::Delete, FireTime::Before);
            ctx.row_id = Some(id.clone());
            ctx.old_row = Some(old.clone());

            let instead = self
                .fire(table, FireTime::Before, &mut ctx)
                .and_then(|_| self.fire(table, FireTime::Instead, &mut ctx));
            match instead {
                Ok(0) => {}
                Ok(_) => {
                    affected += 1;
                    continue;
                }
                Err(e) => {
                    self.undo(table, state, undo);
                    return Err(e);
                }
            }

            state.rows.remove(&id);
            state.indexes.update_row(&id, Some(&old), None);
            undo.push((id.clone(), Some(old)));

            if let Err(e) = self.fire(table, FireTime::After, &mut ctx) {
                self.undo(table, state, undo);
                return Err(e);
            }
            affected += 1;
        }

        if !undo.is_empty() {
            self.commit(table, state, undo)?;
        }
        info!(table = %table.name, rows = affected, "Deleted rows");
        Ok(affected)
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("database", &self.schema.name)
            .field("config", &self.config)
            .field("triggers", &self.triggers)
            .field("loaded_tables", &self.tables.len())
            .finish()
    }
}
