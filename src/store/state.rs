//! In-memory table contents and the operations that mutate them.

use super::schema::{IndexDef, SchemaOp, TableDef};
use super::transaction::WriteOp;
use crate::error::{Result, TrackerError};
use crate::subscriptions::{ChangeKind, TableChange};
use crate::wal::TableSnapshot;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

/// Look up a dotted field path inside a JSON object.
pub(crate) fn lookup<'v>(value: &'v Value, key_path: &str) -> Option<&'v Value> {
    key_path.split('.').try_fold(value, |v, part| v.get(part))
}

/// Extract the primary key of `value`. Only strings and numbers are keys.
pub(crate) fn extract_key(table: &TableDef, value: &Value) -> Result<String> {
    match lookup(value, &table.key_path) {
        Some(Value::String(s)) => Ok(s.clone()),
        Some(Value::Number(n)) => Ok(n.to_string()),
        _ => Err(TrackerError::MissingKey {
            table: table.name.clone(),
            key_path: table.key_path.clone(),
        }),
    }
}

/// Encoding of an indexed field value. JSON text keeps `1` and `"1"` apart.
pub(crate) fn index_key(value: &Value) -> String {
    value.to_string()
}

pub(crate) struct TableData {
    pub def: TableDef,
    pub rows: BTreeMap<String, Value>,
    /// index name -> encoded field value -> primary keys
    indexes: BTreeMap<String, BTreeMap<String, BTreeSet<String>>>,
}

impl TableData {
    fn new(def: TableDef) -> Self {
        let mut table = Self {
            def: TableDef {
                indexes: Vec::new(),
                ..def.clone()
            },
            rows: BTreeMap::new(),
            indexes: BTreeMap::new(),
        };
        for index in def.indexes {
            table.add_index(index);
        }
        table
    }

    fn add_index(&mut self, def: IndexDef) {
        let mut entries: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for (key, row) in &self.rows {
            if let Some(field) = lookup(row, &def.key_path) {
                entries.entry(index_key(field)).or_default().insert(key.clone());
            }
        }
        self.indexes.insert(def.name.clone(), entries);
        self.def.indexes.push(def);
    }

    fn unindex(&mut self, key: &str, row: &Value) {
        for def in &self.def.indexes {
            if let Some(field) = lookup(row, &def.key_path) {
                if let Some(entries) = self.indexes.get_mut(&def.name) {
                    let field_key = index_key(field);
                    if let Some(keys) = entries.get_mut(&field_key) {
                        keys.remove(key);
                        if keys.is_empty() {
                            entries.remove(&field_key);
                        }
                    }
                }
            }
        }
    }

    fn put(&mut self, key: String, value: Value) {
        if let Some(old) = self.rows.remove(&key) {
            self.unindex(&key, &old);
        }
        for def in &self.def.indexes {
            if let Some(field) = lookup(&value, &def.key_path) {
                self.indexes
                    .entry(def.name.clone())
                    .or_default()
                    .entry(index_key(field))
                    .or_default()
                    .insert(key.clone());
            }
        }
        self.rows.insert(key, value);
    }

    fn delete(&mut self, key: &str) -> Option<Value> {
        let old = self.rows.remove(key)?;
        self.unindex(key, &old);
        Some(old)
    }

    fn clear(&mut self) {
        self.rows.clear();
        for entries in self.indexes.values_mut() {
            entries.clear();
        }
    }

    /// Rows whose indexed field equals `value`, in primary key order.
    pub fn from_index(&self, index: &str, value: &Value) -> Result<Vec<Value>> {
        let entries = self
            .indexes
            .get(index)
            .ok_or_else(|| TrackerError::IndexNotFound {
                table: self.def.name.clone(),
                index: index.to_string(),
            })?;

        Ok(entries
            .get(&index_key(value))
            .map(|keys| keys.iter().filter_map(|k| self.rows.get(k).cloned()).collect())
            .unwrap_or_default())
    }
}

/// Everything the database holds in memory.
#[derive(Default)]
pub(crate) struct StoreState {
    pub version: u32,
    /// Sequence number of the last applied commit.
    pub seq: u64,
    pub tables: BTreeMap<String, TableData>,
}

impl StoreState {
    pub fn table(&self, name: &str) -> Result<&TableData> {
        self.tables
            .get(name)
            .ok_or_else(|| TrackerError::TableNotFound(name.to_string()))
    }

    fn table_mut(&mut self, name: &str) -> Result<&mut TableData> {
        self.tables
            .get_mut(name)
            .ok_or_else(|| TrackerError::TableNotFound(name.to_string()))
    }

    /// Apply one schema change. Re-applying an identical change is a no-op.
    pub fn apply_schema(&mut self, op: &SchemaOp) -> Result<()> {
        match op {
            SchemaOp::CreateTable { name, key_path } => match self.tables.get(name) {
                Some(existing) if existing.def.key_path == *key_path => Ok(()),
                Some(existing) => Err(TrackerError::Migration(format!(
                    "table {} already exists with key path {}",
                    name, existing.def.key_path
                ))),
                None => {
                    self.tables.insert(
                        name.clone(),
                        TableData::new(TableDef {
                            name: name.clone(),
                            key_path: key_path.clone(),
                            indexes: Vec::new(),
                        }),
                    );
                    Ok(())
                }
            },
            SchemaOp::CreateIndex {
                table,
                name,
                key_path,
            } => {
                let data = self
                    .tables
                    .get_mut(table)
                    .ok_or_else(|| TrackerError::Migration(format!("no table {} to index", table)))?;
                match data.def.index(name) {
                    Some(existing) if existing.key_path == *key_path => Ok(()),
                    Some(existing) => Err(TrackerError::Migration(format!(
                        "index {}.{} already exists on {}",
                        table, name, existing.key_path
                    ))),
                    None => {
                        data.add_index(IndexDef {
                            name: name.clone(),
                            key_path: key_path.clone(),
                        });
                        Ok(())
                    }
                }
            }
        }
    }

    /// Apply one write and describe it.
    pub fn apply_write(&mut self, op: &WriteOp) -> Result<TableChange> {
        match op {
            WriteOp::Add { table, key, value } | WriteOp::Put { table, key, value } => {
                self.table_mut(table)?.put(key.clone(), value.clone());
                let kind = match op {
                    WriteOp::Add { .. } => ChangeKind::Add,
                    _ => ChangeKind::Put,
                };
                Ok(TableChange {
                    table: table.clone(),
                    key: Some(key.clone()),
                    kind,
                    value: Some(value.clone()),
                })
            }
            WriteOp::Delete { table, key } => {
                self.table_mut(table)?.delete(key);
                Ok(TableChange {
                    table: table.clone(),
                    key: Some(key.clone()),
                    kind: ChangeKind::Delete,
                    value: None,
                })
            }
            WriteOp::Clear { table } => {
                self.table_mut(table)?.clear();
                Ok(TableChange {
                    table: table.clone(),
                    key: None,
                    kind: ChangeKind::Clear,
                    value: None,
                })
            }
        }
    }

    pub fn snapshot(&self) -> Vec<TableSnapshot> {
        self.tables
            .values()
            .map(|t| TableSnapshot {
                def: t.def.clone(),
                rows: t.rows.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            })
            .collect()
    }

    pub fn restore(version: u32, seq: u64, tables: Vec<TableSnapshot>) -> Self {
        let tables = tables
            .into_iter()
            .map(|snapshot| {
                let mut data = TableData::new(snapshot.def);
                for (key, row) in snapshot.rows {
                    data.put(key, row);
                }
                (data.def.name.clone(), data)
            })
            .collect();

        Self {
            version,
            seq,
            tables,
        }
    }

    /// Copy with the same contents, used to stage migrations.
    pub fn duplicate(&self) -> Self {
        Self::restore(self.version, self.seq, self.snapshot())
    }
}
