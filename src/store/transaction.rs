//! Write transactions.

use super::state::extract_key;
use super::typed::Table;
use super::Database;
use crate::error::{Result, TrackerError};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};

/// A single staged write.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum WriteOp {
    /// Insert a row that must not exist yet.
    Add {
        table: String,
        key: String,
        value: Value,
    },
    /// Insert or replace a row.
    Put {
        table: String,
        key: String,
        value: Value,
    },
    Delete {
        table: String,
        key: String,
    },
    Clear {
        table: String,
    },
}

impl WriteOp {
    pub fn table(&self) -> &str {
        match self {
            WriteOp::Add { table, .. }
            | WriteOp::Put { table, .. }
            | WriteOp::Delete { table, .. }
            | WriteOp::Clear { table } => table,
        }
    }
}

/// A set of writes that commit atomically.
///
/// Writes are staged in memory and are visible to reads made through the
/// same transaction. Nothing reaches the database until [`commit`](Self::commit);
/// dropping the transaction discards it.
pub struct Transaction<'db> {
    db: &'db Database,
    ops: Vec<WriteOp>,
    /// Staged row values; `None` marks a staged delete.
    overlay: HashMap<(String, String), Option<Value>>,
    cleared: HashSet<String>,
}

impl<'db> Transaction<'db> {
    pub(crate) fn new(db: &'db Database) -> Self {
        Self {
            db,
            ops: Vec::new(),
            overlay: HashMap::new(),
            cleared: HashSet::new(),
        }
    }

    /// Number of staged writes.
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    // --- Raw access ---

    /// Read a row, seeing this transaction's staged writes.
    pub fn get_raw(&self, table: &str, key: &str) -> Result<Option<Value>> {
        if let Some(staged) = self.overlay.get(&(table.to_string(), key.to_string())) {
            return Ok(staged.clone());
        }
        if self.cleared.contains(table) {
            return Ok(None);
        }
        self.db.get_raw(table, key)
    }

    /// Stage an insert-or-replace. Returns the row's primary key.
    pub fn put_raw(&mut self, table: &str, value: Value) -> Result<String> {
        let key = self.key_for(table, &value)?;
        self.stage(WriteOp::Put {
            table: table.to_string(),
            key: key.clone(),
            value,
        });
        Ok(key)
    }

    /// Stage an insert that fails if the key already exists.
    pub fn add_raw(&mut self, table: &str, value: Value) -> Result<String> {
        let key = self.key_for(table, &value)?;
        if self.get_raw(table, &key)?.is_some() {
            return Err(TrackerError::ConstraintViolation {
                table: table.to_string(),
                key,
            });
        }
        self.stage(WriteOp::Add {
            table: table.to_string(),
            key: key.clone(),
            value,
        });
        Ok(key)
    }

    pub fn delete_raw(&mut self, table: &str, key: &str) -> Result<()> {
        self.db.table_def(table)?;
        self.stage(WriteOp::Delete {
            table: table.to_string(),
            key: key.to_string(),
        });
        Ok(())
    }

    /// Stage removal of every row of `table`.
    pub fn clear(&mut self, table: &str) -> Result<()> {
        self.db.table_def(table)?;
        self.stage(WriteOp::Clear {
            table: table.to_string(),
        });
        Ok(())
    }

    // --- Typed access ---

    pub fn get<T: Table>(&self, key: &str) -> Result<Option<T::Record>> {
        self.get_raw(T::NAME, key)?
            .map(serde_json::from_value)
            .transpose()
            .map_err(Into::into)
    }

    pub fn put<T: Table>(&mut self, record: &T::Record) -> Result<String> {
        self.put_raw(T::NAME, serde_json::to_value(record)?)
    }

    pub fn add<T: Table>(&mut self, record: &T::Record) -> Result<String> {
        self.add_raw(T::NAME, serde_json::to_value(record)?)
    }

    pub fn delete<T: Table>(&mut self, key: &str) -> Result<()> {
        self.delete_raw(T::NAME, key)
    }

    /// Read a `meta` value, seeing staged writes.
    pub fn meta_get<V: DeserializeOwned>(&self, key: &str) -> Result<Option<V>> {
        super::typed::decode_meta(self.get_raw(super::typed::Meta::NAME, key)?)
    }

    /// Stage a `meta` value.
    pub fn meta_put<V: Serialize>(&mut self, key: &str, value: &V) -> Result<()> {
        self.put_raw(super::typed::Meta::NAME, super::typed::encode_meta(key, value)?)?;
        Ok(())
    }

    // --- Completion ---

    /// Commit every staged write atomically.
    ///
    /// On success a single change event is published, after the writes are
    /// visible. A transaction with no writes commits without an event.
    pub fn commit(self) -> Result<()> {
        self.db.commit_ops(self.ops)
    }

    /// Discard the staged writes.
    pub fn rollback(self) {}

    fn key_for(&self, table: &str, value: &Value) -> Result<String> {
        let def = self.db.table_def(table)?;
        extract_key(&def, value)
    }

    fn stage(&mut self, op: WriteOp) {
        match &op {
            WriteOp::Add { table, key, value } | WriteOp::Put { table, key, value } => {
                self.overlay
                    .insert((table.clone(), key.clone()), Some(value.clone()));
            }
            WriteOp::Delete { table, key } => {
                self.overlay.insert((table.clone(), key.clone()), None);
            }
            WriteOp::Clear { table } => {
                self.overlay.retain(|(t, _), _| t != table);
                self.cleared.insert(table.clone());
            }
        }
        self.ops.push(op);
    }
}
