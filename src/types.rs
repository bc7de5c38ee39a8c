//! Core type definitions for the flatbase engine

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

/// Cell values (heterogeneous types)
///
/// Serialized untagged so row files stay plain JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

impl Value {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(v) => Some(*v),
            Value::Int(v) => Some(*v as f64),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            Value::Int(i) => Some(*i != 0),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Type name for error messages
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "integer",
            Value::Float(_) => "float",
            Value::String(_) => "string",
            Value::List(_) => "list",
            Value::Map(_) => "map",
        }
    }

    /// Key under which this value is filed in a column index.
    ///
    /// Nulls are never indexed.
    pub fn index_key(&self) -> Option<String> {
        match self {
            Value::Null => None,
            Value::Bool(b) => Some(if *b { "TRUE".into() } else { "FALSE".into() }),
            Value::Int(i) => Some(i.to_string()),
            // -0.0 and 0.0 compare equal, so they share a key
            Value::Float(f) if *f == 0.0 => Some("0".into()),
            Value::Float(f) => Some(f.to_string()),
            Value::String(s) => Some(s.to_uppercase()),
            Value::List(_) | Value::Map(_) => serde_json::to_string(self)
                .ok()
                .map(|s| s.to_uppercase()),
        }
    }

    /// Compare two values the way where-clauses do.
    ///
    /// Numbers compare numerically (numeric strings included), strings
    /// case-insensitively. `None` means the values are not comparable.
    pub fn compare(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::Null, Value::Null) => Some(Ordering::Equal),
            (Value::Null, _) | (_, Value::Null) => None,
            (Value::Int(a), Value::Int(b)) => Some(a.cmp(b)),
            (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
            (Value::String(a), Value::String(b)) => {
                Some(a.to_uppercase().cmp(&b.to_uppercase()))
            }
            (Value::List(a), Value::List(b)) => {
                if a.len() != b.len() {
                    return Some(a.len().cmp(&b.len()));
                }
                for (x, y) in a.iter().zip(b.iter()) {
                    match x.compare(y)? {
                        Ordering::Equal => continue,
                        other => return Some(other),
                    }
                }
                Some(Ordering::Equal)
            }
            (Value::Bool(b), other) | (other, Value::Bool(b)) if other.as_bool().is_some() => {
                let ord = b.cmp(&other.as_bool()?);
                if matches!(self, Value::Bool(_)) {
                    Some(ord)
                } else {
                    Some(ord.reverse())
                }
            }
            _ => {
                let a = self.as_f64()?;
                let b = other.as_f64()?;
                a.partial_cmp(&b)
            }
        }
    }

    /// Equality as used by `=` in where-clauses and by index matching
    pub fn loosely_equals(&self, other: &Value) -> bool {
        self.compare(other) == Some(Ordering::Equal)
    }

    /// Render as a literal of the textual query grammar
    pub fn render_literal(&self) -> String {
        match self {
            Value::Null => "NULL".to_string(),
            Value::Bool(true) => "TRUE".to_string(),
            Value::Bool(false) => "FALSE".to_string(),
            Value::Int(i) => i.to_string(),
            Value::Float(f) => format!("{:?}", f),
            Value::String(s) => quote(s),
            Value::List(items) => {
                let parts: Vec<String> = items.iter().map(|v| v.render_literal()).collect();
                format!("[{}]", parts.join(", "))
            }
            // Maps have no literal form; they travel as JSON text
            Value::Map(_) => quote(&serde_json::to_string(self).unwrap_or_default()),
        }
    }

    /// Navigate one step into a list (by position) or map (by key)
    pub fn get_path(&self, segment: &str) -> Option<&Value> {
        match self {
            Value::List(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
            Value::Map(map) => map.get(segment).or_else(|| {
                map.iter()
                    .find(|(k, _)| k.eq_ignore_ascii_case(segment))
                    .map(|(_, v)| v)
            }),
            _ => None,
        }
    }
}

fn quote(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('\'');
    for ch in s.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '\'' => out.push_str("\\'"),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '\r' => out.push_str("\\r"),
            _ => out.push(ch),
        }
    }
    out.push('\'');
    out
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, ""),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(v) => write!(f, "{}", v),
            Value::String(s) => write!(f, "{}", s),
            Value::List(_) | Value::Map(_) => {
                write!(f, "{}", serde_json::to_string(self).unwrap_or_default())
            }
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

/// Row identifier: the primary-key value of a row in its textual form
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RowId(pub String);

impl RowId {
    pub fn new(id: impl Into<String>) -> Self {
        RowId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Derive the row id from a primary-key cell
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Null | Value::List(_) | Value::Map(_) => None,
            other => Some(RowId(other.to_string())),
        }
    }

    /// Value to compare against the primary-key column
    pub fn to_value(&self) -> Value {
        match self.0.parse::<i64>() {
            Ok(i) => Value::Int(i),
            Err(_) => Value::String(self.0.clone()),
        }
    }
}

// Numeric keys order numerically so "primary-key order" matches intuition.
impl Ord for RowId {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self.0.parse::<i64>(), other.0.parse::<i64>()) {
            (Ok(a), Ok(b)) => a.cmp(&b).then_with(|| self.0.cmp(&other.0)),
            (Ok(_), Err(_)) => Ordering::Less,
            (Err(_), Ok(_)) => Ordering::Greater,
            (Err(_), Err(_)) => self.0.cmp(&other.0),
        }
    }
}

impl PartialOrd for RowId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for RowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for RowId {
    fn from(v: &str) -> Self {
        RowId(v.to_string())
    }
}

impl From<i64> for RowId {
    fn from(v: i64) -> Self {
        RowId(v.to_string())
    }
}

/// One stored row: column name -> value
pub type Row = BTreeMap<String, Value>;

/// All rows of a table in primary-key order
pub type RowSet = BTreeMap<RowId, Row>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_index_key_is_case_insensitive() {
        assert_eq!(Value::from("Alice").index_key(), Value::from("ALICE").index_key());
        assert_eq!(Value::Int(3).index_key(), Some("3".to_string()));
        assert_eq!(Value::Null.index_key(), None);
    }

    #[test]
    fn test_compare_mixed_numbers() {
        assert_eq!(Value::Int(2).compare(&Value::Float(2.0)), Some(Ordering::Equal));
        assert_eq!(Value::from("10").compare(&Value::Int(9)), Some(Ordering::Greater));
        assert_eq!(Value::from("abc").compare(&Value::Int(1)), None);
        assert!(Value::from("Bob").loosely_equals(&Value::from("bob")));
    }

    #[test]
    fn test_row_id_numeric_order() {
        let mut ids = vec![RowId::from("10"), RowId::from("9"), RowId::from("b"), RowId::from("a")];
        ids.sort();
        let ordered: Vec<&str> = ids.iter().map(|id| id.as_str()).collect();
        assert_eq!(ordered, vec!["9", "10", "a", "b"]);
    }

    #[test]
    fn test_render_literal_escapes_quotes() {
        assert_eq!(Value::from("it's").render_literal(), "'it\\'s'");
        assert_eq!(Value::Float(3.0).render_literal(), "3.0");
        assert_eq!(
            Value::List(vec![Value::Int(1), Value::from("a")]).render_literal(),
            "[1, 'a']"
        );
    }

    #[test]
    fn test_json_untagged_roundtrip() {
        let row: Row = serde_json::from_str(r#"{"id": 1, "price": 2.5, "name": "x", "tags": ["a"], "gone": null}"#).unwrap();
        assert_eq!(row["id"], Value::Int(1));
        assert_eq!(row["price"], Value::Float(2.5));
        assert_eq!(row["tags"], Value::List(vec![Value::from("a")]));
        assert!(row["gone"].is_null());
    }
}
