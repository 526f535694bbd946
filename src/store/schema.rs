//! Table definitions and the migration ladder.

use super::typed::{
    ChapterHistory, ChapterHistoryReplication, ChapterToTitle, MdApi, MdApiReplication, Meta,
    Table, IS_REPLICATED_INDEX,
};
use serde::{Deserialize, Serialize};

/// Secondary index over one field of a table.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDef {
    pub name: String,
    pub key_path: String,
}

/// A named table keyed by the field at `key_path`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableDef {
    pub name: String,
    pub key_path: String,
    pub indexes: Vec<IndexDef>,
}

impl TableDef {
    pub fn index(&self, name: &str) -> Option<&IndexDef> {
        self.indexes.iter().find(|i| i.name == name)
    }
}

/// One schema change inside a migration step.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SchemaOp {
    CreateTable {
        name: String,
        key_path: String,
    },
    CreateIndex {
        table: String,
        name: String,
        key_path: String,
    },
}

impl SchemaOp {
    pub fn create_table(name: &str, key_path: &str) -> Self {
        SchemaOp::CreateTable {
            name: name.to_string(),
            key_path: key_path.to_string(),
        }
    }

    pub fn create_index(table: &str, name: &str, key_path: &str) -> Self {
        SchemaOp::CreateIndex {
            table: table.to_string(),
            name: name.to_string(),
            key_path: key_path.to_string(),
        }
    }
}

/// An ordered migration ladder.
///
/// Step `i` (zero-based) moves a database from version `i` to `i + 1`, so the
/// target version equals the number of steps.
#[derive(Clone, Debug, Default)]
pub struct Schema {
    steps: Vec<Vec<SchemaOp>>,
}

impl Schema {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append the next migration step.
    pub fn step(mut self, ops: Vec<SchemaOp>) -> Self {
        self.steps.push(ops);
        self
    }

    /// Version a database has after running every step.
    pub fn version(&self) -> u32 {
        self.steps.len() as u32
    }

    /// Steps needed to go from `from` to the target version, in order.
    pub fn steps_from(&self, from: u32) -> &[Vec<SchemaOp>] {
        let start = (from as usize).min(self.steps.len());
        &self.steps[start..]
    }

    /// The tracker's tables.
    pub fn tracker() -> Self {
        Schema::new()
            .step(vec![
                SchemaOp::create_table(Meta::NAME, "key"),
                SchemaOp::create_table(ChapterHistory::NAME, "id"),
                SchemaOp::create_table(ChapterHistoryReplication::NAME, "id"),
                SchemaOp::create_index(
                    ChapterHistoryReplication::NAME,
                    IS_REPLICATED_INDEX,
                    "isReplicated",
                ),
            ])
            .step(vec![
                SchemaOp::create_table(MdApi::NAME, "id"),
                SchemaOp::create_table(MdApiReplication::NAME, "id"),
                SchemaOp::create_index(MdApiReplication::NAME, IS_REPLICATED_INDEX, "isReplicated"),
            ])
            .step(vec![SchemaOp::create_table(ChapterToTitle::NAME, "chapter")])
    }
}
