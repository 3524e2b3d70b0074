//! Row changes delivered to handlers

use super::schema::{ColumnKind, Table};
use crate::common::{CanalError, Result};
use crate::mysql::{EventHeader, RowValue, RowsAction};
use serde_json::{json, Map, Value};
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Rows of one binlog rows event, bound to the table's metadata.
///
/// For updates, `rows` holds `[before, after]` pairs back to back.
#[derive(Debug, Clone, PartialEq)]
pub struct RowsEvent {
    pub table: Arc<Table>,
    pub action: RowsAction,
    pub rows: Vec<Vec<RowValue>>,
    /// `None` for rows produced by the snapshot dump
    pub header: Option<EventHeader>,
}

impl RowsEvent {
    /// Bind rows to `table`, converting integers of unsigned columns.
    pub fn new(
        table: Arc<Table>,
        action: RowsAction,
        rows: Vec<Vec<RowValue>>,
        header: Option<EventHeader>,
    ) -> Result<Self> {
        if action == RowsAction::Update && rows.len() % 2 != 0 {
            return Err(CanalError::invariant(format!(
                "update event on {} carries {} rows, expected before/after pairs",
                table,
                rows.len()
            )));
        }
        let mut event = Self {
            table,
            action,
            rows,
            header,
        };
        event.handle_unsigned();
        Ok(event)
    }

    /// The binlog sends every integer signed; reinterpret the bits of
    /// unsigned columns.
    fn handle_unsigned(&mut self) {
        if self.table.unsigned_columns.is_empty() {
            return;
        }
        for row in &mut self.rows {
            for &idx in &self.table.unsigned_columns {
                let Some(value) = row.get_mut(idx) else {
                    debug!(
                        table = %self.table,
                        column = idx,
                        width = row.len(),
                        "unsigned column outside row, skipped"
                    );
                    continue;
                };
                let medium = self
                    .table
                    .columns
                    .get(idx)
                    .is_some_and(|c| c.kind == ColumnKind::MediumInt);
                *value = match *value {
                    RowValue::Int8(v) => RowValue::UInt8(v as u8),
                    RowValue::Int16(v) => RowValue::UInt16(v as u16),
                    RowValue::Int32(v) if v < 0 && medium => RowValue::UInt32((v + (1 << 24)) as u32),
                    RowValue::Int32(v) => RowValue::UInt32(v as u32),
                    RowValue::Int64(v) => RowValue::UInt64(v as u64),
                    _ => continue,
                };
            }
        }
    }

    /// Value of `column` in row `row`.
    pub fn column_value(&self, row: usize, column: &str) -> Option<&RowValue> {
        let idx = self.table.find_column(column)?;
        self.rows.get(row)?.get(idx)
    }

    /// `(before, after)` images of an update event.
    pub fn update_pairs(&self) -> impl Iterator<Item = (&[RowValue], &[RowValue])> {
        self.rows
            .chunks_exact(2)
            .map(|pair| (pair[0].as_slice(), pair[1].as_slice()))
    }

    /// JSON rendering with rows keyed by column name.
    pub fn to_json(&self) -> Value {
        let rows: Vec<Value> = self
            .rows
            .iter()
            .map(|row| {
                let mut object = Map::new();
                for (i, value) in row.iter().enumerate() {
                    let name = self
                        .table
                        .columns
                        .get(i)
                        .map(|c| c.name.clone())
                        .unwrap_or_else(|| format!("@{}", i));
                    object.insert(name, value.to_json());
                }
                Value::Object(object)
            })
            .collect();

        json!({
            "schema": self.table.schema,
            "table": self.table.name,
            "action": self.action.as_str(),
            "log_pos": self.header.as_ref().map(|h| h.log_pos),
            "rows": rows,
        })
    }
}

impl fmt::Display for RowsEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} [", self.action, self.table)?;
        for (i, row) in self.rows.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            f.write_str("(")?;
            for (j, value) in row.iter().enumerate() {
                if j > 0 {
                    f.write_str(", ")?;
                }
                write!(f, "{}", value)?;
            }
            f.write_str(")")?;
        }
        f.write_str("]")
    }
}
