//! Sequences
//!
//! Numeric generators backing auto-increment columns. The bounds invariant
//! `min <= start <= max` holds at all times: every setter validates before it
//! mutates, so a rejected value leaves the sequence untouched.

use crate::error::{DbError, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "SequenceDef", into = "SequenceDef")]
pub struct Sequence {
    name: String,
    start: i64,
    increment: i64,
    min: i64,
    max: i64,
    cycle: bool,
}

/// Declarative form of a sequence, validated on conversion
#[derive(Debug, Clone, Serialize, Deserialize)]
struct SequenceDef {
    name: String,
    #[serde(default = "one")]
    start: i64,
    #[serde(default = "one")]
    increment: i64,
    #[serde(default = "one")]
    min: i64,
    #[serde(default = "max_value")]
    max: i64,
    #[serde(default)]
    cycle: bool,
}

fn one() -> i64 {
    1
}

fn max_value() -> i64 {
    i64::MAX
}

impl TryFrom<SequenceDef> for Sequence {
    type Error = DbError;

    fn try_from(def: SequenceDef) -> Result<Self> {
        let mut seq = Sequence::new(&def.name);
        seq.set_increment(def.increment)?;
        seq.set_bounds(def.min, def.max, def.start)?;
        seq.cycle = def.cycle;
        Ok(seq)
    }
}

impl From<Sequence> for SequenceDef {
    fn from(seq: Sequence) -> Self {
        SequenceDef {
            name: seq.name,
            start: seq.start,
            increment: seq.increment,
            min: seq.min,
            max: seq.max,
            cycle: seq.cycle,
        }
    }
}

impl Sequence {
    /// Ascending sequence 1, 2, 3, ... without upper bound
    pub fn new(name: &str) -> Self {
        Sequence {
            name: name.to_string(),
            start: 1,
            increment: 1,
            min: 1,
            max: i64::MAX,
            cycle: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn start(&self) -> i64 {
        self.start
    }

    pub fn increment(&self) -> i64 {
        self.increment
    }

    pub fn min(&self) -> i64 {
        self.min
    }

    pub fn max(&self) -> i64 {
        self.max
    }

    pub fn cycle(&self) -> bool {
        self.cycle
    }

    fn out_of_bounds(&self, value: i64, min: i64, max: i64) -> DbError {
        DbError::OutOfBounds {
            sequence: self.name.clone(),
            value,
            min,
            max,
        }
    }

    pub fn set_start(&mut self, start: i64) -> Result<()> {
        if start < self.min || start > self.max {
            return Err(self.out_of_bounds(start, self.min, self.max));
        }
        self.start = start;
        Ok(())
    }

    pub fn set_increment(&mut self, increment: i64) -> Result<()> {
        if increment == 0 {
            return Err(DbError::Definition(format!(
                "Sequence '{}' increment must not be zero",
                self.name
            )));
        }
        self.increment = increment;
        Ok(())
    }

    pub fn set_min(&mut self, min: i64) -> Result<()> {
        if min > self.start || min > self.max {
            return Err(self.out_of_bounds(min, i64::MIN, self.start.min(self.max)));
        }
        self.min = min;
        Ok(())
    }

    pub fn set_max(&mut self, max: i64) -> Result<()> {
        if max < self.start || max < self.min {
            return Err(self.out_of_bounds(max, self.start.max(self.min), i64::MAX));
        }
        self.max = max;
        Ok(())
    }

    /// Replace bounds and start together, for moves the one-field setters
    /// cannot express without passing through an invalid state.
    pub fn set_bounds(&mut self, min: i64, max: i64, start: i64) -> Result<()> {
        if min > max {
            return Err(self.out_of_bounds(min, i64::MIN, max));
        }
        if start < min || start > max {
            return Err(self.out_of_bounds(start, min, max));
        }
        self.min = min;
        self.max = max;
        self.start = start;
        Ok(())
    }

    pub fn set_cycle(&mut self, cycle: bool) {
        self.cycle = cycle;
    }

    /// Value following `current` (the column's present extreme), or `start`
    /// for an empty column. Wraps around when cycling, fails otherwise.
    pub fn next_after(&self, current: Option<i64>) -> Result<i64> {
        let current = match current {
            None => return Ok(self.start),
            Some(c) => c,
        };

        let next = current.checked_add(self.increment);
        match next {
            Some(n) if n >= self.min && n <= self.max => Ok(n),
            _ if self.cycle => Ok(if self.increment > 0 { self.min } else { self.max }),
            _ => Err(self.out_of_bounds(
                next.unwrap_or(current),
                self.min,
                self.max,
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_start_out_of_bounds_keeps_previous() {
        let mut seq = Sequence::new("ids");
        seq.set_bounds(1, 100, 10).unwrap();

        let err = seq.set_start(500).unwrap_err();
        assert!(matches!(err, DbError::OutOfBounds { value: 500, .. }));
        assert_eq!(seq.start(), 10);

        assert!(seq.set_start(0).is_err());
        assert_eq!(seq.start(), 10);

        seq.set_start(100).unwrap();
        assert_eq!(seq.start(), 100);
    }

    #[test]
    fn test_bounds_cannot_cross_start() {
        let mut seq = Sequence::new("ids");
        seq.set_bounds(1, 100, 50).unwrap();
        assert!(seq.set_min(60).is_err());
        assert!(seq.set_max(40).is_err());
        assert_eq!((seq.min(), seq.max()), (1, 100));
        assert!(seq.set_increment(0).is_err());
    }

    #[test]
    fn test_next_after_cycles() {
        let mut seq = Sequence::new("ring");
        seq.set_bounds(1, 3, 1).unwrap();
        assert_eq!(seq.next_after(None).unwrap(), 1);
        assert_eq!(seq.next_after(Some(2)).unwrap(), 3);
        assert!(seq.next_after(Some(3)).is_err());

        seq.set_cycle(true);
        assert_eq!(seq.next_after(Some(3)).unwrap(), 1);
    }

    #[test]
    fn test_deserialize_validates() {
        let ok: Sequence = serde_json::from_str(r#"{"name": "s", "start": 5, "min": 1, "max": 10}"#).unwrap();
        assert_eq!(ok.start(), 5);

        let bad = serde_json::from_str::<Sequence>(r#"{"name": "s", "start": 50, "min": 1, "max": 10}"#);
        assert!(bad.is_err());

        let zero = serde_json::from_str::<Sequence>(r#"{"name": "s", "increment": 0}"#);
        assert!(zero.is_err());
    }
}
