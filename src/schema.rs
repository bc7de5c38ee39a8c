//! Schema Model
//!
//! The declarative database definition: tables, columns, indexes, sequences,
//! constraints, triggers, foreign keys, functions and the change-log. Loaded
//! from JSON, saved back through the same serde mapping, and resolved once
//! into flat per-table views (parent chains merged, names validated).

use crate::changelog::ChangeLog;
use crate::error::{DbError, Result};
use crate::query_ast::{ColumnRef, Condition, Operand};
use crate::query_parser::Parser;
use crate::sequence::Sequence;
use crate::types::Value;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::debug;

/// Supported database backends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Dbms {
    /// Applies to every backend
    #[default]
    Generic,
    Mysql,
    Postgres,
    Sqlite,
    Oracle,
    Mssql,
}

impl Dbms {
    pub fn tag(&self) -> &'static str {
        match self {
            Dbms::Generic => "generic",
            Dbms::Mysql => "mysql",
            Dbms::Postgres => "postgres",
            Dbms::Sqlite => "sqlite",
            Dbms::Oracle => "oracle",
            Dbms::Mssql => "mssql",
        }
    }

    /// Whether an object tagged `self` is active when running as `active`
    pub fn applies_to(&self, active: Dbms) -> bool {
        *self == Dbms::Generic || *self == active
    }
}

impl FromStr for Dbms {
    type Err = DbError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "" | "generic" => Ok(Dbms::Generic),
            "mysql" => Ok(Dbms::Mysql),
            "postgres" | "postgresql" => Ok(Dbms::Postgres),
            "sqlite" => Ok(Dbms::Sqlite),
            "oracle" => Ok(Dbms::Oracle),
            "mssql" => Ok(Dbms::Mssql),
            _ => Err(DbError::UnsupportedDbms(s.to_string())),
        }
    }
}

impl TryFrom<String> for Dbms {
    type Error = DbError;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<Dbms> for String {
    fn from(dbms: Dbms) -> Self {
        dbms.tag().to_string()
    }
}

impl fmt::Display for Dbms {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.tag())
    }
}

/// Logical column types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    Bool,
    Integer,
    Float,
    String,
    Text,
    Html,
    Enum,
    Set,
    List,
    Date,
    Time,
    Timestamp,
    File,
    Image,
    Reference,
    Password,
    Url,
    Mail,
}

impl ColumnType {
    /// Columns whose values can be navigated by path
    pub fn is_collection(&self) -> bool {
        matches!(self, ColumnType::List | ColumnType::Set)
    }

    pub fn is_textual(&self) -> bool {
        matches!(
            self,
            ColumnType::String
                | ColumnType::Text
                | ColumnType::Html
                | ColumnType::File
                | ColumnType::Image
                | ColumnType::Password
                | ColumnType::Url
                | ColumnType::Mail
        )
    }
}

impl FromStr for ColumnType {
    type Err = DbError;

    fn from_str(s: &str) -> Result<Self> {
        serde_json::from_value(serde_json::Value::String(s.trim().to_lowercase()))
            .map_err(|_| DbError::Definition(format!("Unknown column type '{}'", s)))
    }
}

/// Value generated on insert when the column is left empty
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AutoValue {
    /// Next value of the named sequence after the column's current maximum
    Sequence(String),
    /// Current date/time, formatted for the column type
    Now,
}

fn yes() -> bool {
    true
}

fn is_true(v: &bool) -> bool {
    *v
}

fn is_false(v: &bool) -> bool {
    !*v
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    #[serde(rename = "type")]
    pub column_type: ColumnType,
    #[serde(default = "yes", skip_serializing_if = "is_true")]
    pub nullable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto: Option<AutoValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub length: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub precision: Option<u32>,
    /// Allowed values of enum and set columns
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub items: Vec<String>,
    #[serde(default = "yes", skip_serializing_if = "is_true")]
    pub updatable: bool,
    #[serde(default = "yes", skip_serializing_if = "is_true")]
    pub insertable: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub readonly: bool,
}

impl Column {
    pub fn new(name: &str, column_type: ColumnType) -> Self {
        Column {
            name: name.to_string(),
            column_type,
            nullable: true,
            default: None,
            auto: None,
            length: None,
            precision: None,
            items: Vec::new(),
            updatable: true,
            insertable: true,
            readonly: false,
        }
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    pub fn with_default(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(value.into());
        self
    }

    pub fn with_auto(mut self, auto: AutoValue) -> Self {
        self.auto = Some(auto);
        self
    }

    pub fn with_length(mut self, length: usize) -> Self {
        self.length = Some(length);
        self
    }

    pub fn with_items(mut self, items: &[&str]) -> Self {
        self.items = items.iter().map(|s| s.to_string()).collect();
        self
    }

    /// Closed dispatch for change-log `change` parameters
    pub fn set(&mut self, field: &str, value: &str) -> Result<()> {
        let bool_of = |v: &str| -> Result<bool> {
            match v.trim().to_lowercase().as_str() {
                "true" | "1" | "yes" => Ok(true),
                "false" | "0" | "no" => Ok(false),
                _ => Err(DbError::Definition(format!(
                    "Parameter '{}' expects a boolean, got '{}'",
                    field, v
                ))),
            }
        };

        match field.to_lowercase().as_str() {
            "name" => self.name = value.to_string(),
            "type" => self.column_type = value.parse()?,
            "nullable" => self.nullable = bool_of(value)?,
            "updatable" => self.updatable = bool_of(value)?,
            "insertable" => self.insertable = bool_of(value)?,
            "readonly" => self.readonly = bool_of(value)?,
            "default" => {
                self.default = if value.is_empty() {
                    None
                } else {
                    Some(serde_json::from_str(value).unwrap_or_else(|_| Value::from(value)))
                }
            }
            "length" => {
                self.length = if value.is_empty() {
                    None
                } else {
                    Some(value.trim().parse().map_err(|_| {
                        DbError::Definition(format!("Invalid length '{}'", value))
                    })?)
                }
            }
            "precision" => {
                self.precision = if value.is_empty() {
                    None
                } else {
                    Some(value.trim().parse().map_err(|_| {
                        DbError::Definition(format!("Invalid precision '{}'", value))
                    })?)
                }
            }
            "items" => {
                self.items = value
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            }
            "auto" => {
                self.auto = match value.trim() {
                    "" => None,
                    "now" => Some(AutoValue::Now),
                    other => match other.strip_prefix("sequence:") {
                        Some(name) => Some(AutoValue::Sequence(name.trim().to_string())),
                        None => {
                            return Err(DbError::Definition(format!(
                                "Invalid auto value '{}'",
                                other
                            )))
                        }
                    },
                }
            }
            other => {
                return Err(DbError::Definition(format!(
                    "Unknown column parameter '{}'",
                    other
                )))
            }
        }
        Ok(())
    }

    /// Check `value` against type, nullability, length and item rules and
    /// return the stored form. `Err` carries a short reason.
    pub fn normalize(&self, value: &Value) -> std::result::Result<Value, String> {
        if value.is_null() {
            if !self.nullable {
                return Err(format!("{} is not nullable", self.name));
            }
            return Ok(Value::Null);
        }

        let normalized = match self.column_type {
            ColumnType::Bool => match value {
                Value::Bool(b) => Value::Bool(*b),
                Value::Int(0) => Value::Bool(false),
                Value::Int(1) => Value::Bool(true),
                Value::String(s) => match s.trim().to_lowercase().as_str() {
                    "true" | "1" => Value::Bool(true),
                    "false" | "0" => Value::Bool(false),
                    _ => return Err(self.type_error(value)),
                },
                _ => return Err(self.type_error(value)),
            },
            ColumnType::Integer => match value {
                Value::Float(f) if f.fract() == 0.0 => Value::Int(*f as i64),
                Value::Bool(_) => return Err(self.type_error(value)),
                other => Value::Int(other.as_i64().ok_or_else(|| self.type_error(value))?),
            },
            ColumnType::Float => {
                let f = match value {
                    Value::Bool(_) => return Err(self.type_error(value)),
                    other => other.as_f64().ok_or_else(|| self.type_error(value))?,
                };
                match self.precision {
                    Some(p) => {
                        let scale = 10f64.powi(p as i32);
                        Value::Float((f * scale).round() / scale)
                    }
                    None => Value::Float(f),
                }
            }
            ColumnType::Enum => {
                let s = self.scalar_text(value)?;
                Value::String(self.match_item(&s)?)
            }
            ColumnType::Set => {
                let members: Vec<String> = match value {
                    Value::List(items) => items
                        .iter()
                        .map(|v| self.scalar_text(v))
                        .collect::<std::result::Result<_, _>>()?,
                    Value::String(s) => s
                        .split(',')
                        .map(|p| p.trim().to_string())
                        .filter(|p| !p.is_empty())
                        .collect(),
                    _ => return Err(self.type_error(value)),
                };
                let mut out = Vec::with_capacity(members.len());
                for m in members {
                    out.push(Value::String(self.match_item(&m)?));
                }
                Value::List(out)
            }
            ColumnType::List => match value {
                Value::List(_) | Value::Map(_) => value.clone(),
                Value::String(s) => match serde_json::from_str::<Value>(s) {
                    Ok(v @ Value::List(_)) | Ok(v @ Value::Map(_)) => v,
                    _ => return Err(self.type_error(value)),
                },
                _ => return Err(self.type_error(value)),
            },
            ColumnType::Date => {
                let s = self.scalar_text(value)?;
                let date = NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
                    .map_err(|_| format!("{}: '{}' is not a date", self.name, s))?;
                Value::String(date.format("%Y-%m-%d").to_string())
            }
            ColumnType::Time => {
                let s = self.scalar_text(value)?;
                let time = NaiveTime::parse_from_str(s.trim(), "%H:%M:%S")
                    .or_else(|_| NaiveTime::parse_from_str(s.trim(), "%H:%M"))
                    .map_err(|_| format!("{}: '{}' is not a time", self.name, s))?;
                Value::String(time.format("%H:%M:%S").to_string())
            }
            ColumnType::Timestamp => match value {
                Value::Int(secs) => DateTime::from_timestamp(*secs, 0)
                    .map(|dt| Value::String(dt.naive_utc().format(TIMESTAMP_FORMAT).to_string()))
                    .ok_or_else(|| self.type_error(value))?,
                _ => {
                    let s = self.scalar_text(value)?;
                    let ts = parse_timestamp(s.trim())
                        .ok_or_else(|| format!("{}: '{}' is not a timestamp", self.name, s))?;
                    Value::String(ts.format(TIMESTAMP_FORMAT).to_string())
                }
            },
            ColumnType::Reference => match value {
                Value::List(_) | Value::Map(_) => return Err(self.type_error(value)),
                other => other.clone(),
            },
            ColumnType::Mail => {
                let s = self.scalar_text(value)?;
                match s.split_once('@') {
                    Some((user, host)) if !user.is_empty() && host.contains('.') => {
                        Value::String(s)
                    }
                    _ => return Err(format!("{}: '{}' is not a mail address", self.name, s)),
                }
            }
            _ => Value::String(self.scalar_text(value)?),
        };

        if let (Some(max), Value::String(s)) = (self.length, &normalized) {
            if s.chars().count() > max {
                return Err(format!("{} exceeds length {}", self.name, max));
            }
        }
        Ok(normalized)
    }

    fn type_error(&self, value: &Value) -> String {
        format!(
            "{} expects {:?}, got {}",
            self.name,
            self.column_type,
            value.type_name()
        )
    }

    fn scalar_text(&self, value: &Value) -> std::result::Result<String, String> {
        match value {
            Value::List(_) | Value::Map(_) | Value::Null => Err(self.type_error(value)),
            other => Ok(other.to_string()),
        }
    }

    fn match_item(&self, candidate: &str) -> std::result::Result<String, String> {
        self.items
            .iter()
            .find(|item| item.eq_ignore_ascii_case(candidate))
            .cloned()
            .ok_or_else(|| format!("{}: '{}' is not one of {:?}", self.name, candidate, self.items))
    }
}

pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

fn parse_timestamp(s: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(s, TIMESTAMP_FORMAT)
        .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S"))
        .ok()
        .or_else(|| DateTime::parse_from_rfc3339(s).ok().map(|dt| dt.naive_utc()))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexColumn {
    pub name: String,
    #[serde(default, skip_serializing_if = "is_false")]
    pub descending: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub length: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Index {
    pub name: String,
    #[serde(default, skip_serializing_if = "is_false")]
    pub unique: bool,
    pub columns: Vec<IndexColumn>,
}

impl Index {
    pub fn new(name: &str, columns: &[&str]) -> Self {
        Index {
            name: name.to_string(),
            unique: false,
            columns: columns
                .iter()
                .map(|c| IndexColumn {
                    name: c.to_string(),
                    descending: false,
                    length: None,
                })
                .collect(),
        }
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }
}

/// Boolean row check; the expression is parsed once, at load
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "ConstraintDef", into = "ConstraintDef")]
pub struct Constraint {
    pub name: Option<String>,
    pub dbms: Dbms,
    expression: String,
    condition: Condition,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ConstraintDef {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(default)]
    dbms: Dbms,
    expression: String,
}

impl TryFrom<ConstraintDef> for Constraint {
    type Error = DbError;

    fn try_from(def: ConstraintDef) -> Result<Self> {
        let mut constraint = Constraint::new(&def.expression)?;
        constraint.name = def.name;
        constraint.dbms = def.dbms;
        Ok(constraint)
    }
}

impl From<Constraint> for ConstraintDef {
    fn from(c: Constraint) -> Self {
        ConstraintDef {
            name: c.name,
            dbms: c.dbms,
            expression: c.expression,
        }
    }
}

impl Constraint {
    pub fn new(expression: &str) -> Result<Self> {
        let condition = Parser::parse_condition(expression).map_err(|e| {
            DbError::Definition(format!("Constraint '{}' does not parse: {}", expression, e))
        })?;
        Ok(Constraint {
            name: None,
            dbms: Dbms::Generic,
            expression: expression.to_string(),
            condition,
        })
    }

    pub fn named(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }

    pub fn for_dbms(mut self, dbms: Dbms) -> Self {
        self.dbms = dbms;
        self
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    pub fn condition(&self) -> &Condition {
        &self.condition
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FireTime {
    Before,
    After,
    Instead,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerEvent {
    Insert,
    Update,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trigger {
    pub name: String,
    #[serde(default)]
    pub dbms: Dbms,
    pub timing: FireTime,
    pub events: Vec<TriggerEvent>,
    /// Name under which the handler is registered with the engine
    pub handler: String,
}

impl Trigger {
    pub fn new(name: &str, timing: FireTime, events: &[TriggerEvent], handler: &str) -> Self {
        Trigger {
            name: name.to_string(),
            dbms: Dbms::Generic,
            timing,
            events: events.to_vec(),
            handler: handler.to_string(),
        }
    }

    pub fn fires_on(&self, timing: FireTime, event: TriggerEvent, dbms: Dbms) -> bool {
        self.timing == timing && self.events.contains(&event) && self.dbms.applies_to(dbms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForeignKey {
    pub name: String,
    pub column: String,
    pub target_table: String,
    pub target_column: String,
}

impl ForeignKey {
    pub fn new(name: &str, column: &str, target_table: &str, target_column: &str) -> Self {
        ForeignKey {
            name: name.to_string(),
            column: column.to_string(),
            target_table: target_table.to_string(),
            target_column: target_column.to_string(),
        }
    }
}

/// Stored routine; modelled and round-tripped, never executed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Function {
    pub name: String,
    #[serde(default)]
    pub dbms: Dbms,
    #[serde(default)]
    pub params: Vec<String>,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Table {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary_key: Option<String>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub readonly: bool,
    #[serde(default)]
    pub columns: Vec<Column>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub indexes: Vec<Index>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub constraints: Vec<Constraint>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub triggers: Vec<Trigger>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub foreign_keys: Vec<ForeignKey>,
}

impl Table {
    pub fn new(name: &str, primary_key: &str) -> Self {
        Table {
            name: name.to_string(),
            parent: None,
            primary_key: Some(primary_key.to_string()),
            readonly: false,
            columns: Vec::new(),
            indexes: Vec::new(),
            constraints: Vec::new(),
            triggers: Vec::new(),
            foreign_keys: Vec::new(),
        }
    }

    pub fn with_column(mut self, column: Column) -> Self {
        self.columns.push(column);
        self
    }

    pub fn with_index(mut self, index: Index) -> Self {
        self.indexes.push(index);
        self
    }

    pub fn with_constraint(mut self, constraint: Constraint) -> Self {
        self.constraints.push(constraint);
        self
    }

    pub fn with_trigger(mut self, trigger: Trigger) -> Self {
        self.triggers.push(trigger);
        self
    }

    pub fn with_foreign_key(mut self, fk: ForeignKey) -> Self {
        self.foreign_keys.push(fk);
        self
    }

    /// Primary-key column name (always set on a resolved table)
    pub fn pk(&self) -> &str {
        self.primary_key.as_deref().unwrap_or_default()
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.columns.iter().any(|c| c.name.eq_ignore_ascii_case(name))
    }

    pub fn get_column(&self, name: &str) -> Result<&Column> {
        self.columns
            .iter()
            .find(|c| c.name.eq_ignore_ascii_case(name))
            .ok_or_else(|| DbError::not_found("Column", format!("{}.{}", self.name, name)))
    }

    pub fn get_column_mut(&mut self, name: &str) -> Result<&mut Column> {
        let table = self.name.clone();
        self.columns
            .iter_mut()
            .find(|c| c.name.eq_ignore_ascii_case(name))
            .ok_or_else(|| DbError::not_found("Column", format!("{}.{}", table, name)))
    }

    /// Columns that get a value index: every indexed or unique column except
    /// the primary key.
    pub fn indexed_columns(&self) -> Vec<&str> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for index in &self.indexes {
            for col in &index.columns {
                if col.name.eq_ignore_ascii_case(self.pk()) {
                    continue;
                }
                if seen.insert(col.name.to_uppercase()) {
                    if let Ok(column) = self.get_column(&col.name) {
                        out.push(column.name.as_str());
                    }
                }
            }
        }
        out
    }

    pub fn unique_indexes(&self) -> impl Iterator<Item = &Index> {
        self.indexes.iter().filter(|i| i.unique)
    }

    /// First foreign key of this table pointing at `table`
    pub fn foreign_key_to(&self, table: &str) -> Option<&ForeignKey> {
        self.foreign_keys
            .iter()
            .find(|fk| fk.target_table.eq_ignore_ascii_case(table))
    }

    pub fn triggers_for(&self, timing: FireTime, event: TriggerEvent, dbms: Dbms) -> Vec<&Trigger> {
        self.triggers
            .iter()
            .filter(|t| t.fires_on(timing, event, dbms))
            .collect()
    }

    pub fn constraints_for(&self, dbms: Dbms) -> impl Iterator<Item = &Constraint> {
        self.constraints.iter().filter(move |c| c.dbms.applies_to(dbms))
    }

    /// Overlay `child` on this (parent) view: same-named members are
    /// replaced, new ones appended.
    fn merged_with(&self, child: &Table) -> Table {
        let mut out = self.clone();
        out.name = child.name.clone();
        out.parent = child.parent.clone();
        if child.primary_key.is_some() {
            out.primary_key = child.primary_key.clone();
        }
        out.readonly = out.readonly || child.readonly;

        merge_by(&mut out.columns, &child.columns, |c| Some(c.name.as_str()));
        merge_by(&mut out.indexes, &child.indexes, |i| Some(i.name.as_str()));
        merge_by(&mut out.constraints, &child.constraints, |c| c.name.as_deref());
        merge_by(&mut out.triggers, &child.triggers, |t| Some(t.name.as_str()));
        merge_by(&mut out.foreign_keys, &child.foreign_keys, |f| Some(f.name.as_str()));
        out
    }

    fn validate(&self) -> Result<()> {
        let mut names = HashSet::new();
        for column in &self.columns {
            if !names.insert(column.name.to_uppercase()) {
                return Err(DbError::Definition(format!(
                    "Duplicate column '{}' in table '{}'",
                    column.name, self.name
                )));
            }
        }

        let pk = self.primary_key.as_deref().ok_or_else(|| {
            DbError::Definition(format!("Table '{}' has no primary key", self.name))
        })?;
        self.get_column(pk).map_err(|_| {
            DbError::Definition(format!(
                "Primary key '{}' of table '{}' is not a column",
                pk, self.name
            ))
        })?;

        for index in &self.indexes {
            if index.columns.is_empty() {
                return Err(DbError::Definition(format!(
                    "Index '{}' on table '{}' has no columns",
                    index.name, self.name
                )));
            }
            for col in &index.columns {
                self.get_column(&col.name)?;
            }
        }

        for fk in &self.foreign_keys {
            self.get_column(&fk.column)?;
        }

        for trigger in &self.triggers {
            if trigger.events.is_empty() {
                return Err(DbError::Definition(format!(
                    "Trigger '{}' on table '{}' has no events",
                    trigger.name, self.name
                )));
            }
        }
        Ok(())
    }
}

fn merge_by<T: Clone, F>(base: &mut Vec<T>, overlay: &[T], key: F)
where
    F: Fn(&T) -> Option<&str>,
{
    for item in overlay {
        let slot = key(item).and_then(|name| {
            base.iter()
                .position(|b| key(b).map_or(false, |k| k.eq_ignore_ascii_case(name)))
        });
        match slot {
            Some(i) => base[i] = item.clone(),
            None => base.push(item.clone()),
        }
    }
}

/// A complete database definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Database {
    pub name: String,
    /// Other definition files merged into this one (relative to this file)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub includes: Vec<String>,
    #[serde(default)]
    pub tables: Vec<Table>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sequences: Vec<Sequence>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub functions: Vec<Function>,
    #[serde(default, skip_serializing_if = "ChangeLog::is_empty")]
    pub changelog: ChangeLog,

    #[serde(skip)]
    included: Vec<Database>,
    /// Effective tables keyed by uppercased name
    #[serde(skip)]
    resolved: HashMap<String, Table>,
    /// Table names in definition order, own tables first
    #[serde(skip)]
    order: Vec<String>,
}

impl Database {
    pub fn new(name: &str) -> Self {
        Database {
            name: name.to_string(),
            includes: Vec::new(),
            tables: Vec::new(),
            sequences: Vec::new(),
            functions: Vec::new(),
            changelog: ChangeLog::new(),
            included: Vec::new(),
            resolved: HashMap::new(),
            order: Vec::new(),
        }
    }

    /// Load a definition file, its includes, and resolve it
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut visiting = HashSet::new();
        Self::load_inner(path.as_ref(), &mut visiting)
    }

    fn load_inner(path: &Path, visiting: &mut HashSet<PathBuf>) -> Result<Self> {
        let canonical = path.canonicalize().map_err(|e| DbError::NotReadable {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        if !visiting.insert(canonical.clone()) {
            return Err(DbError::Definition(format!(
                "Circular include of '{}'",
                path.display()
            )));
        }

        let text = fs::read_to_string(&canonical).map_err(|e| DbError::NotReadable {
            path: canonical.clone(),
            reason: e.to_string(),
        })?;
        let mut db: Database = serde_json::from_str(&text)?;

        let base = canonical.parent().map(Path::to_path_buf).unwrap_or_default();
        for include in &db.includes {
            let included = Self::load_inner(&base.join(include), visiting)?;
            db.included.push(included);
        }
        visiting.remove(&canonical);

        db.resolve()?;
        debug!(
            database = %db.name,
            path = %canonical.display(),
            tables = db.order.len(),
            "Loaded schema"
        );
        Ok(db)
    }

    /// Parse a definition without includes
    pub fn from_json(text: &str) -> Result<Self> {
        let mut db: Database = serde_json::from_str(text)?;
        if !db.includes.is_empty() {
            return Err(DbError::Definition(
                "Includes need a file location; use Database::load".to_string(),
            ));
        }
        db.resolve()?;
        Ok(db)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Write the definition (own objects only; includes stay references)
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        fs::write(path, self.to_json()?).map_err(|e| DbError::NotWriteable {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }

    /// Raw definitions of every table visible here, own tables winning
    fn all_definitions(&self) -> Vec<&Table> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for table in &self.tables {
            if seen.insert(table.name.to_uppercase()) {
                out.push(table);
            }
        }
        for db in &self.included {
            for table in db.all_definitions() {
                if seen.insert(table.name.to_uppercase()) {
                    out.push(table);
                }
            }
        }
        out
    }

    /// Recompute the effective table views and validate the whole definition
    pub fn resolve(&mut self) -> Result<()> {
        let mut names = HashSet::new();
        for table in &self.tables {
            if !names.insert(table.name.to_uppercase()) {
                return Err(DbError::Definition(format!(
                    "Duplicate table '{}'",
                    table.name
                )));
            }
        }
        let mut seq_names = HashSet::new();
        for seq in &self.sequences {
            if !seq_names.insert(seq.name().to_uppercase()) {
                return Err(DbError::Definition(format!(
                    "Duplicate sequence '{}'",
                    seq.name()
                )));
            }
        }
        self.changelog.validate()?;

        let definitions = self.all_definitions();
        let by_name: HashMap<String, &Table> = definitions
            .iter()
            .map(|t| (t.name.to_uppercase(), *t))
            .collect();

        let mut resolved = HashMap::new();
        let mut order = Vec::new();
        for table in &definitions {
            let effective = flatten(table, &by_name)?;
            effective.validate()?;
            order.push(effective.name.to_uppercase());
            resolved.insert(effective.name.to_uppercase(), effective);
        }

        self.resolved = resolved;
        self.order = order;

        // Cross-table checks need every effective view in place
        for key in self.order.clone() {
            let table = match self.resolved.get(&key) {
                Some(t) => t.clone(),
                None => continue,
            };
            for fk in &table.foreign_keys {
                self.get_table(&fk.target_table)?
                    .get_column(&fk.target_column)?;
            }
            for column in &table.columns {
                if let Some(AutoValue::Sequence(seq)) = &column.auto {
                    self.get_sequence(seq)?;
                }
            }
            for constraint in &table.constraints {
                for operand in constraint.condition().operands() {
                    if let Operand::Column(r) = operand {
                        self.resolve_column_ref(&table, r)?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Effective tables in definition order
    pub fn tables(&self) -> impl Iterator<Item = &Table> {
        self.order.iter().filter_map(move |k| self.resolved.get(k))
    }

    pub fn get_table(&self, name: &str) -> Result<&Table> {
        self.resolved
            .get(&name.to_uppercase())
            .ok_or_else(|| DbError::not_found("Table", name))
    }

    pub fn get_column(&self, table: &str, column: &str) -> Result<&Column> {
        self.get_table(table)?.get_column(column)
    }

    pub fn get_sequence(&self, name: &str) -> Result<&Sequence> {
        self.sequences
            .iter()
            .find(|s| s.name().eq_ignore_ascii_case(name))
            .or_else(|| self.included.iter().find_map(|db| db.get_sequence(name).ok()))
            .ok_or_else(|| DbError::not_found("Sequence", name))
    }

    pub fn get_function(&self, name: &str) -> Result<&Function> {
        self.functions
            .iter()
            .find(|f| f.name.eq_ignore_ascii_case(name))
            .or_else(|| self.included.iter().find_map(|db| db.get_function(name).ok()))
            .ok_or_else(|| DbError::not_found("Function", name))
    }

    /// Add a table and re-resolve; on failure the definition is unchanged
    pub fn add_table(&mut self, table: Table) -> Result<()> {
        self.tables.push(table);
        if let Err(e) = self.resolve() {
            self.tables.pop();
            self.resolve()?;
            return Err(e);
        }
        Ok(())
    }

    pub fn add_sequence(&mut self, sequence: Sequence) -> Result<()> {
        self.sequences.push(sequence);
        if let Err(e) = self.resolve() {
            self.sequences.pop();
            self.resolve()?;
            return Err(e);
        }
        Ok(())
    }

    /// Own (unresolved) table definition, for structural edits
    pub fn table_def_mut(&mut self, name: &str) -> Result<&mut Table> {
        self.tables
            .iter_mut()
            .find(|t| t.name.eq_ignore_ascii_case(name))
            .ok_or_else(|| DbError::not_found("Table", name))
    }

    pub fn remove_table(&mut self, name: &str) -> Result<Table> {
        let pos = self
            .tables
            .iter()
            .position(|t| t.name.eq_ignore_ascii_case(name))
            .ok_or_else(|| DbError::not_found("Table", name))?;
        Ok(self.tables.remove(pos))
    }

    /// Resolve a reference as written in a query against `table`.
    ///
    /// - `col` names a column of `table`;
    /// - `col.a.b` navigates a list/set column;
    /// - `table.col` qualifies a column of `table` itself;
    /// - `other.col` reaches a column of `other` through a foreign key.
    ///
    /// Already-resolved references resolve to themselves.
    pub fn resolve_column_ref(&self, table: &Table, r: &ColumnRef) -> Result<ColumnRef> {
        match r {
            ColumnRef::Column(name) => Ok(ColumnRef::Column(table.get_column(name)?.name.clone())),
            ColumnRef::Path { column, path } => {
                if let Ok(col) = table.get_column(column) {
                    if col.column_type.is_collection() {
                        return Ok(ColumnRef::Path {
                            column: col.name.clone(),
                            path: path.clone(),
                        });
                    }
                    if !self.resolved.contains_key(&column.to_uppercase()) {
                        return Err(DbError::InvalidQuery(format!(
                            "Column '{}' of type {:?} has no path '{}'",
                            col.name,
                            col.column_type,
                            path.join(".")
                        )));
                    }
                }
                if path.len() != 1 {
                    return Err(DbError::InvalidQuery(format!(
                        "Cannot resolve '{}' on table '{}'",
                        r.render(),
                        table.name
                    )));
                }
                if column.eq_ignore_ascii_case(&table.name) {
                    return Ok(ColumnRef::Column(table.get_column(&path[0])?.name.clone()));
                }
                self.resolve_nested(table, column, &path[0])
            }
            ColumnRef::Nested { table: other, column } => self.resolve_nested(table, other, column),
        }
    }

    fn resolve_nested(&self, table: &Table, other: &str, column: &str) -> Result<ColumnRef> {
        let target = self.get_table(other)?;
        if table.foreign_key_to(&target.name).is_none() {
            return Err(DbError::InvalidQuery(format!(
                "Table '{}' has no foreign key to '{}'",
                table.name, target.name
            )));
        }
        Ok(ColumnRef::Nested {
            table: target.name.clone(),
            column: target.get_column(column)?.name.clone(),
        })
    }
}

/// Merge `table` with its parent chain, root first
fn flatten(table: &Table, by_name: &HashMap<String, &Table>) -> Result<Table> {
    let mut chain = vec![table];
    let mut seen = HashSet::new();
    seen.insert(table.name.to_uppercase());

    let mut current = table;
    while let Some(parent) = &current.parent {
        let key = parent.to_uppercase();
        if !seen.insert(key.clone()) {
            return Err(DbError::Definition(format!(
                "Inheritance cycle through table '{}'",
                parent
            )));
        }
        current = by_name
            .get(&key)
            .copied()
            .ok_or_else(|| DbError::not_found("Table", parent.as_str()))?;
        chain.push(current);
    }

    let mut iter = chain.into_iter().rev();
    let mut effective = match iter.next() {
        Some(root) => root.clone(),
        None => return Err(DbError::not_found("Table", table.name.as_str())),
    };
    for child in iter {
        effective = effective.merged_with(child);
    }
    Ok(effective)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SHOP: &str = r#"{
        "name": "shop",
        "tables": [
            {
                "name": "base",
                "primary_key": "id",
                "columns": [
                    {"name": "id", "type": "integer", "auto": {"sequence": "ids"}},
                    {"name": "created", "type": "timestamp", "auto": "now"}
                ]
            },
            {
                "name": "customers",
                "parent": "base",
                "columns": [
                    {"name": "name", "type": "string", "length": 20, "nullable": false},
                    {"name": "tags", "type": "list"}
                ],
                "indexes": [{"name": "by_name", "unique": true, "columns": [{"name": "name"}]}],
                "constraints": [{"name": "named", "expression": "name != ''"}]
            },
            {
                "name": "orders",
                "primary_key": "id",
                "columns": [
                    {"name": "id", "type": "integer"},
                    {"name": "customer", "type": "reference"},
                    {"name": "status", "type": "enum", "items": ["open", "paid"]}
                ],
                "foreign_keys": [{"name": "fk_customer", "column": "customer", "target_table": "customers", "target_column": "id"}]
            }
        ],
        "sequences": [{"name": "ids"}],
        "changelog": [
            {"version": "1.1", "action": {"type": "create", "table": "orders"}},
            {"version": "1.0", "action": {"type": "create", "table": "customers"}}
        ]
    }"#;

    #[test]
    fn test_inheritance_merges_parent_columns() {
        let db = Database::from_json(SHOP).unwrap();
        let customers = db.get_table("CUSTOMERS").unwrap();
        let names: Vec<&str> = customers.columns.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["id", "created", "name", "tags"]);
        assert_eq!(customers.pk(), "id");
        assert_eq!(customers.indexed_columns(), vec!["name"]);
    }

    #[test]
    fn test_lookups_are_case_insensitive() {
        let db = Database::from_json(SHOP).unwrap();
        assert!(db.get_column("Orders", "STATUS").is_ok());
        assert!(db.get_sequence("IDS").is_ok());
        assert!(db.get_table("nope").unwrap_err().is_not_found());
        assert!(db.get_column("orders", "nope").unwrap_err().is_not_found());
    }

    #[test]
    fn test_save_load_is_idempotent() {
        let db = Database::from_json(SHOP).unwrap();
        let json = db.to_json().unwrap();
        let again = Database::from_json(&json).unwrap();
        assert_eq!(again.to_json().unwrap(), json);
        assert_eq!(again.tables, db.tables);
    }

    #[test]
    fn test_inheritance_cycle_rejected() {
        let json = r#"{"name": "x", "tables": [
            {"name": "a", "parent": "b", "primary_key": "id", "columns": [{"name": "id", "type": "integer"}]},
            {"name": "b", "parent": "a", "primary_key": "id", "columns": [{"name": "id", "type": "integer"}]}
        ]}"#;
        assert!(matches!(Database::from_json(json), Err(DbError::Definition(_))));
    }

    #[test]
    fn test_missing_primary_key_rejected() {
        let mut db = Database::new("x");
        let table = Table::new("t", "id").with_column(Column::new("name", ColumnType::String));
        assert!(db.add_table(table).is_err());
        assert!(db.get_table("t").is_err());
        assert!(db.tables.is_empty());
    }

    #[test]
    fn test_unknown_dbms_rejected_on_load() {
        let json = r#"{"name": "x", "tables": [{"name": "t", "primary_key": "id",
            "columns": [{"name": "id", "type": "integer"}],
            "constraints": [{"dbms": "foxpro", "expression": "id > 0"}]}]}"#;
        assert!(Database::from_json(json).is_err());
        assert!("DB2".parse::<Dbms>().is_err());
        assert_eq!("MySQL".parse::<Dbms>().unwrap(), Dbms::Mysql);
    }

    #[test]
    fn test_resolve_column_refs() {
        let db = Database::from_json(SHOP).unwrap();
        let orders = db.get_table("orders").unwrap();
        let customers = db.get_table("customers").unwrap();

        let nested = db
            .resolve_column_ref(orders, &ColumnRef::Path {
                column: "CUSTOMERS".to_string(),
                path: vec!["NAME".to_string()],
            })
            .unwrap();
        assert_eq!(nested, ColumnRef::nested("customers", "name"));
        assert_eq!(db.resolve_column_ref(orders, &nested).unwrap(), nested);

        let qualified = db
            .resolve_column_ref(orders, &ColumnRef::Path {
                column: "orders".to_string(),
                path: vec!["status".to_string()],
            })
            .unwrap();
        assert_eq!(qualified, ColumnRef::column("status"));

        let path = ColumnRef::Path {
            column: "tags".to_string(),
            path: vec!["0".to_string()],
        };
        assert_eq!(db.resolve_column_ref(customers, &path).unwrap(), path);

        // No foreign key from customers to orders
        assert!(db
            .resolve_column_ref(customers, &ColumnRef::nested("orders", "status"))
            .is_err());
    }

    #[test]
    fn test_column_normalize() {
        let db = Database::from_json(SHOP).unwrap();
        let name = db.get_column("customers", "name").unwrap();
        assert!(name.normalize(&Value::Null).is_err());
        assert!(name.normalize(&Value::from("x".repeat(21))).is_err());
        assert_eq!(name.normalize(&Value::Int(7)).unwrap(), Value::from("7"));

        let status = db.get_column("orders", "status").unwrap();
        assert_eq!(status.normalize(&Value::from("PAID")).unwrap(), Value::from("paid"));
        assert!(status.normalize(&Value::from("lost")).is_err());

        let created = db.get_column("customers", "created").unwrap();
        assert_eq!(
            created.normalize(&Value::from("2024-02-03T04:05:06")).unwrap(),
            Value::from("2024-02-03 04:05:06")
        );
        assert!(created.normalize(&Value::from("yesterday")).is_err());

        let id = Column::new("id", ColumnType::Integer);
        assert_eq!(id.normalize(&Value::from("42")).unwrap(), Value::Int(42));
        assert!(id.normalize(&Value::from("4x")).is_err());
    }

    #[test]
    fn test_column_set_dispatch() {
        let mut column = Column::new("age", ColumnType::String);
        column.set("type", "integer").unwrap();
        column.set("nullable", "false").unwrap();
        column.set("default", "18").unwrap();
        assert_eq!(column.column_type, ColumnType::Integer);
        assert!(!column.nullable);
        assert_eq!(column.default, Some(Value::Int(18)));
        assert!(column.set("colour", "red").is_err());
    }
}
