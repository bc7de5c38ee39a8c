//! Trigger Handlers
//!
//! Schema triggers name a handler; the engine resolves that name through a
//! [`TriggerRegistry`] injected at construction. Handlers see the row being
//! written and may adjust it (before-triggers) or veto the write by failing.

use crate::error::{DbError, Result};
use crate::schema::{FireTime, Trigger, TriggerEvent};
use crate::types::{Row, RowId, Value};
use std::collections::HashMap;
use tracing::{debug, warn};

/// What a handler sees when it fires
#[derive(Debug, Clone)]
pub struct TriggerContext {
    pub table: String,
    pub event: TriggerEvent,
    pub timing: FireTime,
    pub row_id: Option<RowId>,
    /// Stored row before the write (update, delete)
    pub old_row: Option<Row>,
    /// Row about to be written (insert, update); before-triggers may edit it
    pub new_row: Option<Row>,
}

impl TriggerContext {
    pub fn new(table: &str, event: TriggerEvent, timing: FireTime) -> Self {
        TriggerContext {
            table: table.to_string(),
            event,
            timing,
            row_id: None,
            old_row: None,
            new_row: None,
        }
    }

    /// Set a column of the new row
    pub fn set(&mut self, column: &str, value: impl Into<Value>) {
        if let Some(row) = self.new_row.as_mut() {
            row.insert(column.to_string(), value.into());
        }
    }

    /// Value of a column in the new row, falling back to the old row
    pub fn get(&self, column: &str) -> Option<&Value> {
        self.new_row
            .as_ref()
            .and_then(|r| r.get(column))
            .or_else(|| self.old_row.as_ref().and_then(|r| r.get(column)))
    }
}

/// Handler result; `Err` carries the failure reason
pub type TriggerOutcome = std::result::Result<(), String>;

/// Executable side of a trigger
pub trait TriggerHandler: Send + Sync {
    fn fire(&self, ctx: &mut TriggerContext) -> TriggerOutcome;
}

impl<F> TriggerHandler for F
where
    F: Fn(&mut TriggerContext) -> TriggerOutcome + Send + Sync,
{
    fn fire(&self, ctx: &mut TriggerContext) -> TriggerOutcome {
        self(ctx)
    }
}

/// Handler name -> handler
#[derive(Default)]
pub struct TriggerRegistry {
    handlers: HashMap<String, Box<dyn TriggerHandler>>,
}

impl TriggerRegistry {
    pub fn new() -> Self {
        TriggerRegistry::default()
    }

    pub fn register<H: TriggerHandler + 'static>(&mut self, name: &str, handler: H) {
        debug!(handler = name, "Registered trigger handler");
        self.handlers.insert(name.to_string(), Box::new(handler));
    }

    pub fn unregister(&mut self, name: &str) -> bool {
        self.handlers.remove(name).is_some()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// Run the handler behind `trigger`
    pub fn fire(&self, trigger: &Trigger, ctx: &mut TriggerContext) -> Result<()> {
        let handler = self
            .handlers
            .get(&trigger.handler)
            .ok_or_else(|| DbError::not_found("Trigger handler", trigger.handler.as_str()))?;

        handler.fire(ctx).map_err(|reason| {
            warn!(
                table = %ctx.table,
                trigger = %trigger.name,
                event = ?ctx.event,
                %reason,
                "Trigger failed"
            );
            DbError::TriggerFailed {
                table: ctx.table.clone(),
                trigger: trigger.name.clone(),
                reason,
            }
        })
    }
}

impl std::fmt::Debug for TriggerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&String> = self.handlers.keys().collect();
        names.sort();
        f.debug_struct("TriggerRegistry").field("handlers", &names).finish()
    }
}
