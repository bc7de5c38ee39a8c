//! Data Paths
//!
//! Dotted addresses of the form `table.row.column[.sub.path]` where `row` is
//! `*` (every row) or a primary-key literal, optionally single-quoted when it
//! contains dots. The sub-path navigates a list/map column, or crosses the
//! column's foreign key into the target table.

use crate::error::{DbError, Result};
use crate::query_ast::{ColumnExpr, ColumnRef, SelectColumn};
use crate::query_builder::{QueryObject, SelectQuery};
use crate::schema::Database;
use crate::types::RowId;
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataPath {
    pub table: String,
    /// `None` addresses every row
    pub row: Option<RowId>,
    pub column: Option<String>,
    pub path: Vec<String>,
}

fn split_segments(text: &str) -> Result<Vec<String>> {
    let mut segments = Vec::new();
    let mut current = String::new();
    let mut quoted = false;

    for ch in text.chars() {
        match ch {
            '\'' => quoted = !quoted,
            '.' if !quoted => segments.push(std::mem::take(&mut current)),
            _ => current.push(ch),
        }
    }
    if quoted {
        return Err(DbError::Parse(format!("Unterminated quote in path '{}'", text)));
    }
    segments.push(current);

    if segments.iter().any(|s| s.is_empty()) {
        return Err(DbError::Parse(format!("Empty segment in path '{}'", text)));
    }
    Ok(segments)
}

impl DataPath {
    pub fn parse(text: &str) -> Result<Self> {
        let mut segments = split_segments(text.trim())?.into_iter();
        let table = segments
            .next()
            .ok_or_else(|| DbError::Parse("Empty path".to_string()))?;
        let row = match segments.next() {
            None => None,
            Some(s) if s == "*" => None,
            Some(s) => Some(RowId::new(s)),
        };
        let column = segments.next();
        Ok(DataPath {
            table,
            row,
            column,
            path: segments.collect(),
        })
    }
}

impl fmt::Display for DataPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.", self.table)?;
        match &self.row {
            Some(id) if id.as_str().contains('.') => write!(f, "'{}'", id)?,
            Some(id) => write!(f, "{}", id)?,
            None => write!(f, "*")?,
        }
        if let Some(column) = &self.column {
            write!(f, ".{}", column)?;
        }
        for segment in &self.path {
            write!(f, ".{}", segment)?;
        }
        Ok(())
    }
}

impl SelectQuery {
    /// Query reading the value(s) a data path addresses
    pub fn from_path(schema: Arc<Database>, path: &str) -> Result<Self> {
        let path = DataPath::parse(path)?;
        let mut query = SelectQuery::new(Arc::clone(&schema), &path.table)?;
        if let Some(id) = path.row.clone() {
            query.set_row(id);
        }

        if let Some(column_name) = &path.column {
            let table = schema.get_table(&path.table)?;
            let column = table.get_column(column_name)?;

            let reference = if path.path.is_empty() {
                ColumnRef::Column(column.name.clone())
            } else if column.column_type.is_collection() {
                ColumnRef::Path {
                    column: column.name.clone(),
                    path: path.path.clone(),
                }
            } else {
                let fk = table
                    .foreign_keys
                    .iter()
                    .find(|fk| fk.column.eq_ignore_ascii_case(&column.name))
                    .ok_or_else(|| {
                        DbError::InvalidQuery(format!(
                            "Column '{}' has no sub-path '{}'",
                            column.name,
                            path.path.join(".")
                        ))
                    })?;
                if path.path.len() != 1 {
                    return Err(DbError::InvalidQuery(format!(
                        "Foreign key '{}' leads to a single column, got '{}'",
                        fk.name,
                        path.path.join(".")
                    )));
                }
                ColumnRef::nested(&fk.target_table, &path.path[0])
            };

            query.set_columns(vec![SelectColumn::new(ColumnExpr::Ref(reference))])?;
            query.set_subquery(true);
        }
        Ok(query)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_paths() {
        let p = DataPath::parse("users.12.tags.0").unwrap();
        assert_eq!(p.table, "users");
        assert_eq!(p.row, Some(RowId::from(12)));
        assert_eq!(p.column.as_deref(), Some("tags"));
        assert_eq!(p.path, vec!["0".to_string()]);

        let all = DataPath::parse("users.*.name").unwrap();
        assert_eq!(all.row, None);

        let quoted = DataPath::parse("files.'a.txt'.size").unwrap();
        assert_eq!(quoted.row, Some(RowId::from("a.txt")));
        assert_eq!(quoted.to_string(), "files.'a.txt'.size");

        assert!(DataPath::parse("users..name").is_err());
        assert!(DataPath::parse("users.'open").is_err());
    }

    #[test]
    fn test_from_path_crosses_foreign_key() {
        let schema = Arc::new(
            Database::from_json(
                r#"{"name": "blog", "tables": [
                    {"name": "users", "primary_key": "id", "columns": [
                        {"name": "id", "type": "integer"}, {"name": "name", "type": "string"}]},
                    {"name": "posts", "primary_key": "id", "columns": [
                        {"name": "id", "type": "integer"}, {"name": "author", "type": "reference"},
                        {"name": "tags", "type": "list"}],
                     "foreign_keys": [{"name": "fk_author", "column": "author", "target_table": "users", "target_column": "id"}]}
                ]}"#,
            )
            .unwrap(),
        );

        let q = SelectQuery::from_path(Arc::clone(&schema), "posts.3.author.name").unwrap();
        assert_eq!(q.to_string(), "SELECT users.name FROM posts WHERE id = 3");

        let q = SelectQuery::from_path(Arc::clone(&schema), "posts.*.tags.1").unwrap();
        assert_eq!(q.to_string(), "SELECT tags.1 FROM posts");

        assert!(SelectQuery::from_path(schema, "posts.3.id.x").is_err());
    }
}
