//! Query Builder
//!
//! Typed query objects bound to a schema. Setters validate and resolve column
//! references as they go, so a query that exists is a query the engine can
//! run. Each object renders to a statement through a clause template and can
//! be rebuilt from that text.

use crate::error::{DbError, Result};
use crate::query_ast::*;
use crate::query_executor::{Engine, QueryOutcome, ResultSet};
use crate::query_parser::Parser;
use crate::schema::{Database, Table};
use crate::types::{RowId, Value};
use std::fmt;
use std::sync::Arc;

const SELECT_TEMPLATE: &str = "SELECT %COLUMNS% FROM %TABLE% %WHERE% %HAVING% %ORDERBY% %LIMIT%";
const COUNT_TEMPLATE: &str = "SELECT count(%COLUMN%) FROM %TABLE% %WHERE%";
const EXISTS_TEMPLATE: &str = "SELECT exists(*) FROM %TABLE% %WHERE%";
const DELETE_TEMPLATE: &str = "DELETE FROM %TABLE% %WHERE% %ORDERBY% %LIMIT%";
const UPDATE_TEMPLATE: &str = "UPDATE %TABLE% SET %ASSIGNMENTS% %WHERE%";
const INSERT_TEMPLATE: &str = "INSERT INTO %TABLE% (%COLUMNS%) VALUES (%VALUES%)";

/// Substitute `%NAME%` placeholders word by word; words that end up empty
/// are dropped so optional clauses leave no gaps.
fn render_template(template: &str, fragments: &[(&str, String)]) -> String {
    template
        .split(' ')
        .map(|word| {
            fragments
                .iter()
                .fold(word.to_string(), |acc, (name, value)| acc.replace(name, value))
        })
        .filter(|word| !word.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

fn clause(keyword: &str, body: Option<String>) -> String {
    match body {
        Some(b) if !b.is_empty() => format!("{} {}", keyword, b),
        _ => String::new(),
    }
}

/// Shared clause state and validation of every query object
pub trait QueryObject {
    fn schema(&self) -> &Arc<Database>;
    fn parts(&self) -> &QueryParts;
    fn parts_mut(&mut self) -> &mut QueryParts;

    /// Statement text
    fn render(&self) -> String;

    /// Effective definition of the queried table
    fn table(&self) -> Result<&Table> {
        self.schema().get_table(&self.parts().table)
    }

    fn set_table(&mut self, name: &str) -> Result<()> {
        let canonical = self.schema().get_table(name)?.name.clone();
        self.parts_mut().table = canonical;
        Ok(())
    }

    /// Resolve one reference against the queried table
    fn resolve(&self, column: &ColumnRef) -> Result<ColumnRef> {
        let table = self.table()?;
        self.schema().resolve_column_ref(table, column)
    }

    /// Set the where tree. Column operands must exist; literal values are
    /// taken as given.
    fn set_where(&mut self, condition: Condition) -> Result<()> {
        let resolved = condition.try_map_operands(&mut |operand: &Operand| -> Result<Operand> {
            match operand {
                Operand::Column(c) => Ok(Operand::Column(self.resolve(c)?)),
                Operand::Aggregate(func, _) => Err(DbError::InvalidQuery(format!(
                    "Aggregate {}() is not allowed in WHERE",
                    func.name()
                ))),
                Operand::Literal(v) => Ok(Operand::Literal(v.clone())),
            }
        })?;
        self.parts_mut().where_clause = Some(resolved);
        Ok(())
    }

    fn set_where_text(&mut self, text: &str) -> Result<()> {
        self.set_where(Parser::parse_condition(text)?)
    }

    fn clear_where(&mut self) {
        self.parts_mut().where_clause = None;
    }

    /// AND another condition onto the where tree
    fn add_where(&mut self, condition: Condition) -> Result<()> {
        let combined = match self.parts().where_clause.clone() {
            Some(existing) => existing.and(condition),
            None => condition,
        };
        self.set_where(combined)
    }

    /// Order by `columns`, pairing each with the direction at the same
    /// position
    fn set_order_by(&mut self, columns: &[&str], directions: &[Direction]) -> Result<()> {
        if columns.len() != directions.len() {
            return Err(DbError::InvalidQuery(format!(
                "ORDER BY has {} columns but {} directions",
                columns.len(),
                directions.len()
            )));
        }
        let mut order = Vec::with_capacity(columns.len());
        for (column, direction) in columns.iter().zip(directions) {
            let segments = column.split('.').map(|s| s.trim().to_string()).collect();
            let reference = ColumnRef::from_segments(segments)
                .ok_or_else(|| DbError::InvalidQuery("Empty ORDER BY column".to_string()))?;
            order.push(OrderBy {
                column: self.resolve(&reference)?,
                direction: *direction,
            });
        }
        self.parts_mut().order_by = order;
        Ok(())
    }

    fn set_limit(&mut self, limit: usize) -> Result<()> {
        if limit == 0 {
            return Err(DbError::InvalidQuery("LIMIT must be positive".to_string()));
        }
        self.parts_mut().limit = Some(limit);
        Ok(())
    }

    fn set_offset(&mut self, offset: usize) {
        self.parts_mut().offset = Some(offset);
    }

    /// Restrict the query to the row with this primary key
    fn set_row(&mut self, id: RowId) {
        self.parts_mut().row = Some(id);
    }

    /// Where tree as rendered: the row selector joins as a leading
    /// `pk = id` leaf.
    fn effective_where(&self) -> Option<Condition> {
        let parts = self.parts();
        let selector = parts.row.as_ref().map(|id| {
            let pk = self.table().map(|t| t.pk().to_string()).unwrap_or_default();
            Condition::compare(
                Operand::Column(ColumnRef::Column(pk)),
                Operator::Eq,
                Operand::Literal(id.to_value()),
            )
        });
        match (selector, parts.where_clause.clone()) {
            (Some(s), Some(w)) => Some(s.and(w)),
            (Some(s), None) => Some(s),
            (None, w) => w,
        }
    }

    fn where_fragment(&self) -> String {
        clause("WHERE", self.effective_where().map(|c| c.render()))
    }

    fn order_fragment(&self) -> String {
        let order: Vec<String> = self.parts().order_by.iter().map(OrderBy::render).collect();
        clause("ORDER BY", Some(order.join(", ")))
    }

    fn limit_fragment(&self) -> String {
        let parts = self.parts();
        let mut out = Vec::new();
        if let Some(limit) = parts.limit {
            out.push(format!("LIMIT {}", limit));
        }
        if let Some(offset) = parts.offset {
            out.push(format!("OFFSET {}", offset));
        }
        out.join(" ")
    }

    /// Undo `effective_where`: a leading `pk = literal` leaf becomes the row
    /// selector again, the rest stays the where tree.
    fn split_row_selector(&self, condition: Condition) -> Result<(Option<RowId>, Option<Condition>)> {
        let pk = self.table()?.pk().to_string();
        let selector = |leaf: &Condition| match leaf {
            Condition::Compare {
                left: Operand::Column(ColumnRef::Column(column)),
                op: Operator::Eq,
                right: Operand::Literal(value),
            } if column.eq_ignore_ascii_case(&pk) => {
                RowId::from_value(value).filter(|id| id.to_value() == *value)
            }
            _ => None,
        };

        match condition {
            Condition::And(left, right) => match selector(&left) {
                Some(id) => Ok((Some(id), Some(*right))),
                None => Ok((None, Some(Condition::And(left, right)))),
            },
            leaf => match selector(&leaf) {
                Some(id) => Ok((Some(id), None)),
                None => Ok((None, Some(leaf))),
            },
        }
    }

    /// Apply parsed where/order/limit/offset clauses through the setters
    fn apply_parts(&mut self, parts: QueryParts) -> Result<()> {
        self.set_table(&parts.table)?;
        if let Some(condition) = parts.where_clause {
            let (row, rest) = self.split_row_selector(condition)?;
            if let Some(id) = row {
                self.set_row(id);
            }
            if let Some(rest) = rest {
                self.set_where(rest)?;
            }
        }
        let mut order = Vec::with_capacity(parts.order_by.len());
        for o in &parts.order_by {
            order.push(OrderBy {
                column: self.resolve(&o.column)?,
                direction: o.direction,
            });
        }
        self.parts_mut().order_by = order;
        if let Some(limit) = parts.limit {
            self.set_limit(limit)?;
        }
        if let Some(offset) = parts.offset {
            self.set_offset(offset);
        }
        Ok(())
    }
}

fn new_parts(schema: &Database, table: &str) -> Result<QueryParts> {
    Ok(QueryParts {
        table: schema.get_table(table)?.name.clone(),
        ..Default::default()
    })
}

macro_rules! query_object {
    ($ty:ident) => {
        impl QueryObject for $ty {
            fn schema(&self) -> &Arc<Database> {
                &self.schema
            }

            fn parts(&self) -> &QueryParts {
                &self.parts
            }

            fn parts_mut(&mut self) -> &mut QueryParts {
                &mut self.parts
            }

            fn render(&self) -> String {
                self.render_statement()
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.render())
            }
        }
    };
}

/// `SELECT` with projection, having, order and pagination
#[derive(Debug, Clone)]
pub struct SelectQuery {
    schema: Arc<Database>,
    parts: QueryParts,
}

query_object!(SelectQuery);

impl SelectQuery {
    pub fn new(schema: Arc<Database>, table: &str) -> Result<Self> {
        let parts = new_parts(&schema, table)?;
        Ok(SelectQuery { schema, parts })
    }

    pub fn parse(schema: Arc<Database>, text: &str) -> Result<Self> {
        match Parser::parse(text)? {
            Statement::Select(parts) => Self::from_parts(schema, parts),
            Statement::Count { parts, column } => {
                let mut query = Self::from_parts(schema, parts)?;
                query.set_columns(vec![SelectColumn::new(ColumnExpr::Aggregate(
                    AggregateFunction::Count,
                    column,
                ))])?;
                Ok(query)
            }
            other => Err(DbError::InvalidQuery(format!(
                "Expected a SELECT statement, got {:?}",
                other
            ))),
        }
    }

    fn from_parts(schema: Arc<Database>, parts: QueryParts) -> Result<Self> {
        let mut query = SelectQuery::new(schema, &parts.table)?;
        query.set_columns(parts.columns.clone())?;
        let having = parts.having.clone();
        query.apply_parts(parts)?;
        if let Some(having) = having {
            query.set_having(having)?;
        }
        Ok(query)
    }

    fn resolve_expr(&self, expr: &ColumnExpr) -> Result<ColumnExpr> {
        Ok(match expr {
            ColumnExpr::Star => ColumnExpr::Star,
            ColumnExpr::Ref(r) => ColumnExpr::Ref(self.resolve(r)?),
            ColumnExpr::Aggregate(func, column) => ColumnExpr::Aggregate(
                *func,
                column.as_ref().map(|c| self.resolve(c)).transpose()?,
            ),
        })
    }

    /// Replace the output columns; an empty list selects every column
    pub fn set_columns(&mut self, columns: Vec<SelectColumn>) -> Result<()> {
        let mut resolved = Vec::with_capacity(columns.len());
        for column in columns {
            resolved.push(SelectColumn {
                expr: self.resolve_expr(&column.expr)?,
                alias: column.alias,
            });
        }
        self.parts.columns = resolved;
        Ok(())
    }

    /// Comma-separated column list, e.g. `name, count(*) AS n`
    pub fn set_columns_text(&mut self, text: &str) -> Result<()> {
        self.set_columns(Parser::parse_columns(text)?)
    }

    pub fn add_column(&mut self, column: SelectColumn) -> Result<()> {
        let expr = self.resolve_expr(&column.expr)?;
        self.parts.columns.push(SelectColumn {
            expr,
            alias: column.alias,
        });
        Ok(())
    }

    pub fn columns(&self) -> &[SelectColumn] {
        &self.parts.columns
    }

    /// Having tree over output labels; names that are not labels must be
    /// columns of the table.
    pub fn set_having(&mut self, condition: Condition) -> Result<()> {
        let labels: Vec<String> = self.parts.columns.iter().map(SelectColumn::label).collect();
        let is_label = |r: &ColumnRef| labels.iter().any(|l| l.eq_ignore_ascii_case(&r.render()));

        let resolved = condition.try_map_operands(&mut |operand: &Operand| -> Result<Operand> {
            match operand {
                Operand::Column(c) if is_label(c) => Ok(operand.clone()),
                Operand::Column(c) => Ok(Operand::Column(self.resolve(c)?)),
                Operand::Aggregate(func, column) => Ok(Operand::Aggregate(
                    *func,
                    column.as_ref().map(|c| self.resolve(c)).transpose()?,
                )),
                Operand::Literal(_) => Ok(operand.clone()),
            }
        })?;
        self.parts.having = Some(resolved);
        Ok(())
    }

    pub fn set_having_text(&mut self, text: &str) -> Result<()> {
        self.set_having(Parser::parse_condition(text)?)
    }

    /// Sub-queries return only the selected columns
    pub fn set_subquery(&mut self, subquery: bool) {
        self.parts.subquery = subquery;
    }

    pub fn is_aggregate(&self) -> bool {
        self.parts.columns.iter().any(|c| c.expr.is_aggregate())
    }

    fn render_statement(&self) -> String {
        let columns = if self.parts.columns.is_empty() {
            "*".to_string()
        } else {
            self.parts
                .columns
                .iter()
                .map(SelectColumn::render)
                .collect::<Vec<_>>()
                .join(", ")
        };
        render_template(
            SELECT_TEMPLATE,
            &[
                ("%COLUMNS%", columns),
                ("%TABLE%", self.parts.table.clone()),
                ("%WHERE%", self.where_fragment()),
                ("%HAVING%", clause("HAVING", self.parts.having.as_ref().map(Condition::render))),
                ("%ORDERBY%", self.order_fragment()),
                ("%LIMIT%", self.limit_fragment()),
            ],
        )
    }

    pub fn execute(&self, engine: &mut Engine) -> Result<ResultSet> {
        engine.select(self)
    }
}

/// `SELECT count(..)`; pagination never applies
#[derive(Debug, Clone)]
pub struct CountQuery {
    schema: Arc<Database>,
    parts: QueryParts,
    column: Option<ColumnRef>,
}

query_object!(CountQuery);

impl CountQuery {
    pub fn new(schema: Arc<Database>, table: &str) -> Result<Self> {
        let parts = new_parts(&schema, table)?;
        Ok(CountQuery {
            schema,
            parts,
            column: None,
        })
    }

    /// Any select collapses to a count of `*` or its first non-star column
    pub fn parse(schema: Arc<Database>, text: &str) -> Result<Self> {
        let (parts, column) = match Parser::parse(text)? {
            Statement::Count { parts, column } => (parts, column),
            Statement::Select(parts) => {
                let column = parts.columns.iter().find_map(|c| match &c.expr {
                    ColumnExpr::Ref(r) => Some(r.clone()),
                    ColumnExpr::Aggregate(_, Some(r)) => Some(r.clone()),
                    _ => None,
                });
                (parts, column)
            }
            other => {
                return Err(DbError::InvalidQuery(format!(
                    "Expected a SELECT statement, got {:?}",
                    other
                )))
            }
        };

        let mut query = CountQuery::new(schema, &parts.table)?;
        if let Some(condition) = parts.where_clause {
            query.set_where(condition)?;
        }
        if let Some(column) = column {
            query.column = Some(query.resolve(&column)?);
        }
        Ok(query)
    }

    /// Count non-null values of `column` instead of rows
    pub fn set_column(&mut self, column: Option<&str>) -> Result<()> {
        self.column = match column {
            None | Some("*") => None,
            Some(name) => {
                let segments = name.split('.').map(|s| s.trim().to_string()).collect();
                let reference = ColumnRef::from_segments(segments)
                    .ok_or_else(|| DbError::InvalidQuery("Empty count column".to_string()))?;
                Some(self.resolve(&reference)?)
            }
        };
        Ok(())
    }

    pub fn column(&self) -> Option<&ColumnRef> {
        self.column.as_ref()
    }

    fn render_statement(&self) -> String {
        render_template(
            COUNT_TEMPLATE,
            &[
                (
                    "%COLUMN%",
                    self.column
                        .as_ref()
                        .map(ColumnRef::render)
                        .unwrap_or_else(|| "*".to_string()),
                ),
                ("%TABLE%", self.parts.table.clone()),
                ("%WHERE%", self.where_fragment()),
            ],
        )
    }

    /// Number of matching rows; 0 when nothing matches or the query fails
    pub fn execute(&self, engine: &mut Engine) -> i64 {
        engine.count(self)
    }
}

/// `SELECT exists(*)`
#[derive(Debug, Clone)]
pub struct ExistsQuery {
    schema: Arc<Database>,
    parts: QueryParts,
}

query_object!(ExistsQuery);

impl ExistsQuery {
    pub fn new(schema: Arc<Database>, table: &str) -> Result<Self> {
        let parts = new_parts(&schema, table)?;
        Ok(ExistsQuery { schema, parts })
    }

    pub fn parse(schema: Arc<Database>, text: &str) -> Result<Self> {
        let parts = match Parser::parse(text)? {
            Statement::Exists(parts) | Statement::Select(parts) => parts,
            Statement::Count { parts, .. } => parts,
            other => {
                return Err(DbError::InvalidQuery(format!(
                    "Expected a SELECT statement, got {:?}",
                    other
                )))
            }
        };
        let mut query = ExistsQuery::new(schema, &parts.table)?;
        if let Some(condition) = parts.where_clause {
            query.set_where(condition)?;
        }
        Ok(query)
    }

    fn render_statement(&self) -> String {
        render_template(
            EXISTS_TEMPLATE,
            &[
                ("%TABLE%", self.parts.table.clone()),
                ("%WHERE%", self.where_fragment()),
            ],
        )
    }

    pub fn execute(&self, engine: &mut Engine) -> Result<bool> {
        engine.exists(self)
    }
}

/// `DELETE` of the matching rows
#[derive(Debug, Clone)]
pub struct DeleteQuery {
    schema: Arc<Database>,
    parts: QueryParts,
}

query_object!(DeleteQuery);

impl DeleteQuery {
    pub fn new(schema: Arc<Database>, table: &str) -> Result<Self> {
        let parts = new_parts(&schema, table)?;
        Ok(DeleteQuery { schema, parts })
    }

    pub fn parse(schema: Arc<Database>, text: &str) -> Result<Self> {
        match Parser::parse(text)? {
            Statement::Delete(parts) => {
                let mut query = DeleteQuery::new(schema, &parts.table)?;
                query.apply_parts(parts)?;
                Ok(query)
            }
            other => Err(DbError::InvalidQuery(format!(
                "Expected a DELETE statement, got {:?}",
                other
            ))),
        }
    }

    fn render_statement(&self) -> String {
        render_template(
            DELETE_TEMPLATE,
            &[
                ("%TABLE%", self.parts.table.clone()),
                ("%WHERE%", self.where_fragment()),
                ("%ORDERBY%", self.order_fragment()),
                ("%LIMIT%", self.limit_fragment()),
            ],
        )
    }

    /// Number of rows deleted
    pub fn execute(&self, engine: &mut Engine) -> Result<usize> {
        engine.delete(self)
    }
}

fn resolve_assignment(table: &Table, column: &str, value: Value) -> Result<Assignment> {
    Ok(Assignment {
        column: table.get_column(column)?.name.clone(),
        value,
    })
}

fn upsert_assignment(assignments: &mut Vec<Assignment>, assignment: Assignment) {
    match assignments.iter_mut().find(|a| a.column == assignment.column) {
        Some(existing) => existing.value = assignment.value,
        None => assignments.push(assignment),
    }
}

/// `UPDATE` of the matching rows
#[derive(Debug, Clone)]
pub struct UpdateQuery {
    schema: Arc<Database>,
    parts: QueryParts,
    assignments: Vec<Assignment>,
}

query_object!(UpdateQuery);

impl UpdateQuery {
    pub fn new(schema: Arc<Database>, table: &str) -> Result<Self> {
        let parts = new_parts(&schema, table)?;
        Ok(UpdateQuery {
            schema,
            parts,
            assignments: Vec::new(),
        })
    }

    pub fn parse(schema: Arc<Database>, text: &str) -> Result<Self> {
        match Parser::parse(text)? {
            Statement::Update { parts, assignments } => {
                let mut query = UpdateQuery::new(schema, &parts.table)?;
                query.apply_parts(parts)?;
                for a in assignments {
                    query.set(&a.column, a.value)?;
                }
                Ok(query)
            }
            other => Err(DbError::InvalidQuery(format!(
                "Expected an UPDATE statement, got {:?}",
                other
            ))),
        }
    }

    /// Assign `value` to `column`; the value is checked on execution
    pub fn set(&mut self, column: &str, value: impl Into<Value>) -> Result<()> {
        let assignment = resolve_assignment(self.table()?, column, value.into())?;
        upsert_assignment(&mut self.assignments, assignment);
        Ok(())
    }

    pub fn assignments(&self) -> &[Assignment] {
        &self.assignments
    }

    fn render_statement(&self) -> String {
        let assignments: Vec<String> = self
            .assignments
            .iter()
            .map(|a| format!("{} = {}", a.column, a.value.render_literal()))
            .collect();
        render_template(
            UPDATE_TEMPLATE,
            &[
                ("%TABLE%", self.parts.table.clone()),
                ("%ASSIGNMENTS%", assignments.join(", ")),
                ("%WHERE%", self.where_fragment()),
            ],
        )
    }

    /// Number of rows changed
    pub fn execute(&self, engine: &mut Engine) -> Result<usize> {
        engine.update(self)
    }
}

/// `INSERT` of one row
#[derive(Debug, Clone)]
pub struct InsertQuery {
    schema: Arc<Database>,
    parts: QueryParts,
    assignments: Vec<Assignment>,
}

query_object!(InsertQuery);

impl InsertQuery {
    pub fn new(schema: Arc<Database>, table: &str) -> Result<Self> {
        let parts = new_parts(&schema, table)?;
        Ok(InsertQuery {
            schema,
            parts,
            assignments: Vec::new(),
        })
    }

    pub fn parse(schema: Arc<Database>, text: &str) -> Result<Self> {
        match Parser::parse(text)? {
            Statement::Insert { table, assignments } => {
                let mut query = InsertQuery::new(schema, &table)?;
                for a in assignments {
                    query.set(&a.column, a.value)?;
                }
                Ok(query)
            }
            other => Err(DbError::InvalidQuery(format!(
                "Expected an INSERT statement, got {:?}",
                other
            ))),
        }
    }

    pub fn set(&mut self, column: &str, value: impl Into<Value>) -> Result<()> {
        let assignment = resolve_assignment(self.table()?, column, value.into())?;
        upsert_assignment(&mut self.assignments, assignment);
        Ok(())
    }

    pub fn assignments(&self) -> &[Assignment] {
        &self.assignments
    }

    fn render_statement(&self) -> String {
        let columns: Vec<&str> = self.assignments.iter().map(|a| a.column.as_str()).collect();
        let values: Vec<String> = self
            .assignments
            .iter()
            .map(|a| a.value.render_literal())
            .collect();
        render_template(
            INSERT_TEMPLATE,
            &[
                ("%TABLE%", self.parts.table.clone()),
                ("%COLUMNS%", columns.join(", ")),
                ("%VALUES%", values.join(", ")),
            ],
        )
    }

    /// Primary key of the new row
    pub fn execute(&self, engine: &mut Engine) -> Result<RowId> {
        engine.insert(self)
    }
}

/// Any query object
#[derive(Debug, Clone)]
pub enum Query {
    Select(SelectQuery),
    Count(CountQuery),
    Exists(ExistsQuery),
    Delete(DeleteQuery),
    Update(UpdateQuery),
    Insert(InsertQuery),
}

impl Query {
    /// Parse a statement into the matching query object
    pub fn parse(schema: Arc<Database>, text: &str) -> Result<Self> {
        Ok(match Parser::parse(text)? {
            Statement::Select(_) => Query::Select(SelectQuery::parse(schema, text)?),
            Statement::Count { .. } => Query::Count(CountQuery::parse(schema, text)?),
            Statement::Exists(_) => Query::Exists(ExistsQuery::parse(schema, text)?),
            Statement::Delete(_) => Query::Delete(DeleteQuery::parse(schema, text)?),
            Statement::Update { .. } => Query::Update(UpdateQuery::parse(schema, text)?),
            Statement::Insert { .. } => Query::Insert(InsertQuery::parse(schema, text)?),
        })
    }

    pub fn execute(&self, engine: &mut Engine) -> Result<QueryOutcome> {
        Ok(match self {
            Query::Select(q) => QueryOutcome::Rows(q.execute(engine)?),
            Query::Count(q) => QueryOutcome::Count(q.execute(engine)),
            Query::Exists(q) => QueryOutcome::Exists(q.execute(engine)?),
            Query::Delete(q) => QueryOutcome::Affected(q.execute(engine)?),
            Query::Update(q) => QueryOutcome::Affected(q.execute(engine)?),
            Query::Insert(q) => QueryOutcome::Inserted(q.execute(engine)?),
        })
    }
}

impl fmt::Display for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Query::Select(q) => write!(f, "{}", q),
            Query::Count(q) => write!(f, "{}", q),
            Query::Exists(q) => write!(f, "{}", q),
            Query::Delete(q) => write!(f, "{}", q),
            Query::Update(q) => write!(f, "{}", q),
            Query::Insert(q) => write!(f, "{}", q),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema() -> Arc<Database> {
        Arc::new(
            Database::from_json(
                r#"{"name": "shop", "tables": [
                    {"name": "customers", "primary_key": "id", "columns": [
                        {"name": "id", "type": "integer"},
                        {"name": "name", "type": "string"}]},
                    {"name": "orders", "primary_key": "id", "columns": [
                        {"name": "id", "type": "integer"},
                        {"name": "customer", "type": "reference"},
                        {"name": "total", "type": "float"},
                        {"name": "tags", "type": "list"}],
                     "foreign_keys": [{"name": "fk_c", "column": "customer", "target_table": "customers", "target_column": "id"}]}
                ]}"#,
            )
            .unwrap(),
        )
    }

    #[test]
    fn test_select_renders_template() {
        let mut q = SelectQuery::new(schema(), "ORDERS").unwrap();
        q.set_columns_text("total, customers.name AS who").unwrap();
        q.set_where_text("total > 100 AND tags.0 = 'x'").unwrap();
        q.set_order_by(&["total"], &[Direction::Desc]).unwrap();
        q.set_limit(10).unwrap();
        q.set_offset(5);
        assert_eq!(
            q.to_string(),
            "SELECT total, customers.name AS who FROM orders WHERE total > 100 AND tags.0 = 'x' ORDER BY total DESC LIMIT 10 OFFSET 5"
        );

        let empty = SelectQuery::new(schema(), "orders").unwrap();
        assert_eq!(empty.to_string(), "SELECT * FROM orders");
    }

    #[test]
    fn test_setters_validate() {
        let mut q = SelectQuery::new(schema(), "orders").unwrap();
        assert!(q.set_columns_text("nope").unwrap_err().is_not_found());
        assert!(q.set_where_text("nope = 1").is_err());
        assert!(q.set_where_text("count(*) > 1").is_err());
        assert!(matches!(
            q.set_order_by(&["total", "id"], &[Direction::Asc]),
            Err(DbError::InvalidQuery(_))
        ));
        assert!(q.set_limit(0).is_err());
        assert!(SelectQuery::new(schema(), "nope").is_err());

        // Right-hand values are not type-checked here
        assert!(q.set_where_text("total = 'not a number'").is_ok());
    }

    #[test]
    fn test_parse_roundtrip() {
        let text = "SELECT id, count(*) AS n FROM orders WHERE total >= 5 HAVING n > 1 ORDER BY id ASC LIMIT 3";
        let q = SelectQuery::parse(schema(), text).unwrap();
        let again = SelectQuery::parse(schema(), &q.to_string()).unwrap();
        assert_eq!(q.parts(), again.parts());
        assert_eq!(again.parts().having, q.parts().having);
    }

    #[test]
    fn test_count_ignores_pagination() {
        let q = CountQuery::parse(schema(), "SELECT total FROM orders WHERE id > 1 LIMIT 5 OFFSET 2").unwrap();
        assert_eq!(q.to_string(), "SELECT count(total) FROM orders WHERE id > 1");
        assert_eq!(q.parts().limit, None);
    }

    #[test]
    fn test_row_selector_renders_as_leaf() {
        let mut q = DeleteQuery::new(schema(), "orders").unwrap();
        q.set_row(RowId::from(7));
        q.set_where_text("total < 1 OR total > 9").unwrap();
        assert_eq!(
            q.to_string(),
            "DELETE FROM orders WHERE id = 7 AND (total < 1 OR total > 9)"
        );
    }

    #[test]
    fn test_row_selector_reparses() {
        let mut q = SelectQuery::new(schema(), "orders").unwrap();
        q.set_row(RowId::from(100));
        let again = SelectQuery::parse(schema(), &q.to_string()).unwrap();
        assert_eq!(again.parts().row, Some(RowId::from(100)));
        assert_eq!(again.parts(), q.parts());

        let mut d = DeleteQuery::new(schema(), "orders").unwrap();
        d.set_row(RowId::from("A-7"));
        d.set_where_text("total < 1 OR total > 9").unwrap();
        let again = DeleteQuery::parse(schema(), &d.to_string()).unwrap();
        assert_eq!(again.parts(), d.parts());

        // Only an exact key literal in the leading position is a selector
        let q = SelectQuery::parse(schema(), "SELECT * FROM orders WHERE total > 1 AND id = 3").unwrap();
        assert_eq!(q.parts().row, None);
        let q = SelectQuery::parse(schema(), "SELECT * FROM orders WHERE id = '007'").unwrap();
        assert_eq!(q.parts().row, None);
        assert!(q.parts().where_clause.is_some());
    }

    #[test]
    fn test_update_and_insert_render() {
        let mut u = UpdateQuery::new(schema(), "orders").unwrap();
        u.set("TOTAL", 2.5).unwrap();
        u.set_where_text("id = 1").unwrap();
        assert_eq!(u.to_string(), "UPDATE orders SET total = 2.5 WHERE id = 1");
        assert!(u.set("nope", 1).is_err());

        let mut i = InsertQuery::new(schema(), "customers").unwrap();
        i.set("id", 3).unwrap();
        i.set("name", "O'Neil").unwrap();
        let text = i.to_string();
        assert_eq!(text, "INSERT INTO customers (id, name) VALUES (3, 'O\\'Neil')");
        let back = InsertQuery::parse(schema(), &text).unwrap();
        assert_eq!(back.assignments(), i.assignments());
    }

    #[test]
    fn test_query_enum_dispatch() {
        let q = Query::parse(schema(), "SELECT exists(*) FROM orders WHERE id = 1").unwrap();
        assert!(matches!(q, Query::Exists(_)));
        assert_eq!(q.to_string(), "SELECT exists(*) FROM orders WHERE id = 1");
        assert!(matches!(
            Query::parse(schema(), "select count(*) from orders").unwrap(),
            Query::Count(_)
        ));
    }
}
