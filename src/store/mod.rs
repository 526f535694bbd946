//! Versioned local database with typed tables.
//!
//! The database is a set of named tables, each keyed by a declared key path,
//! kept in memory and made durable through the [journal](crate::wal). Schema
//! evolution runs through a [`Schema`] migration ladder when the database is
//! opened. Every committed write transaction is published on the
//! [`ChangeFeed`].
//!
//! # Example
//!
//! ```ignore
//! let db = Database::open(DatabaseConfig::new("./tracker"), &Schema::tracker())?;
//!
//! let mut txn = db.transaction();
//! txn.put::<ChapterHistory>(&record)?;
//! txn.put::<ChapterHistoryReplication>(&ReplicationHistoryRecord::pending(&record.id))?;
//! txn.commit()?;
//! ```

mod schema;
mod state;
mod transaction;
mod typed;

pub use schema::{IndexDef, Schema, SchemaOp, TableDef};
pub use transaction::{Transaction, WriteOp};
pub use typed::{
    meta_keys, ChapterHistory, ChapterHistoryReplication, ChapterToTitle, MdApi, MdApiReplication,
    Meta, Table, IS_REPLICATED_INDEX,
};

use crate::error::{Result, TrackerError};
use crate::subscriptions::{ChangeEvent, ChangeFeed, FeedConfig, FeedHandle};
use crate::wal::{Journal, JournalEntry};
use fs2::FileExt;
use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use state::StoreState;
use std::collections::{HashMap, HashSet};
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, instrument};

/// Database configuration.
#[derive(Clone, Debug)]
pub struct DatabaseConfig {
    /// Directory holding the database files.
    pub path: PathBuf,

    /// Whether to create the database if it doesn't exist.
    pub create_if_missing: bool,

    /// fsync the journal after every commit.
    pub sync_on_commit: bool,

    /// Buffer size for change feed subscriptions made through
    /// [`Database::subscribe`].
    pub feed_buffer: usize,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./mdtracker"),
            create_if_missing: true,
            sync_on_commit: true,
            feed_buffer: 1000,
        }
    }
}

impl DatabaseConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }
}

/// Magic bytes for the database manifest.
const DB_MAGIC: &[u8; 4] = b"MDT\0";

/// Current on-disk layout version.
const DB_FORMAT_VERSION: u8 = 1;

struct DbInner {
    path: Option<PathBuf>,

    /// Lock file for exclusive access.
    _lock_file: Option<File>,

    journal: Option<Journal>,

    state: RwLock<StoreState>,

    /// Serializes commits and migrations.
    write_lock: Mutex<()>,

    feed: ChangeFeed,

    feed_buffer: usize,
}

/// Handle to an open database. Clones share the same database.
#[derive(Clone)]
pub struct Database {
    inner: Arc<DbInner>,
}

impl Database {
    /// Open (or create) the database at `config.path` and migrate it to
    /// `schema`'s version.
    ///
    /// Fails with [`TrackerError::Locked`] if another process holds the
    /// database, and with [`TrackerError::Migration`] if the stored version is
    /// newer than the schema or a migration step fails. A failed migration
    /// leaves the stored database untouched.
    #[instrument(skip_all, fields(path = %config.path.display()))]
    pub fn open(config: DatabaseConfig, schema: &Schema) -> Result<Self> {
        let manifest = config.path.join("MANIFEST");
        if manifest.exists() {
            Self::verify_manifest(&config.path)?;
        } else if config.create_if_missing {
            fs::create_dir_all(&config.path)?;
            Self::write_manifest(&config.path)?;
        } else {
            return Err(TrackerError::NotInitialized);
        }

        let lock_file = Self::acquire_lock(&config.path)?;

        let (journal, entries) =
            Journal::open(config.path.join("journal.log"), config.sync_on_commit)?;
        let state = Self::replay(entries)?;

        let db = Self::from_parts(
            Some(config.path.clone()),
            Some(lock_file),
            Some(journal),
            state,
            config.feed_buffer,
        );
        db.migrate(schema)?;
        Ok(db)
    }

    /// Open the tracker database with its standard schema.
    pub fn open_tracker(config: DatabaseConfig) -> Result<Self> {
        Self::open(config, &Schema::tracker())
    }

    /// A database without a journal. Contents are lost when the last handle
    /// is dropped.
    pub fn open_in_memory(schema: &Schema) -> Result<Self> {
        let db = Self::from_parts(
            None,
            None,
            None,
            StoreState::default(),
            DatabaseConfig::default().feed_buffer,
        );
        db.migrate(schema)?;
        Ok(db)
    }

    fn from_parts(
        path: Option<PathBuf>,
        lock_file: Option<File>,
        journal: Option<Journal>,
        state: StoreState,
        feed_buffer: usize,
    ) -> Self {
        Self {
            inner: Arc::new(DbInner {
                path,
                _lock_file: lock_file,
                journal,
                state: RwLock::new(state),
                write_lock: Mutex::new(()),
                feed: ChangeFeed::new(),
                feed_buffer,
            }),
        }
    }

    fn replay(entries: Vec<JournalEntry>) -> Result<StoreState> {
        let mut state = StoreState::default();
        for entry in entries {
            match entry {
                JournalEntry::Upgrade { to, ops, .. } => {
                    for op in &ops {
                        state.apply_schema(op)?;
                    }
                    state.version = to;
                }
                JournalEntry::Commit { seq, ops } => {
                    for op in &ops {
                        state.apply_write(op).map_err(|e| {
                            TrackerError::Corruption(format!("replaying commit {}: {}", seq, e))
                        })?;
                    }
                    state.seq = seq;
                }
                JournalEntry::Snapshot {
                    version,
                    seq,
                    tables,
                } => {
                    state = StoreState::restore(version, seq, tables);
                }
            }
        }
        Ok(state)
    }

    /// Run the migration steps between the stored version and `schema`'s.
    ///
    /// All pending steps form one upgrade: they are applied to a copy of the
    /// database, journaled as a single frame and only then swapped in.
    /// Returns `false` if the database was already up to date.
    pub fn migrate(&self, schema: &Schema) -> Result<bool> {
        let _lock = self.inner.write_lock.lock();

        let from = self.inner.state.read().version;
        let to = schema.version();
        if from > to {
            return Err(TrackerError::Migration(format!(
                "database version {} is newer than schema version {}",
                from, to
            )));
        }
        if from == to {
            return Ok(false);
        }

        let mut staged = self.inner.state.read().duplicate();
        let mut ops = Vec::new();
        for (offset, step) in schema.steps_from(from).iter().enumerate() {
            for op in step {
                staged.apply_schema(op).map_err(|e| {
                    TrackerError::Migration(format!(
                        "step {} -> {}: {}",
                        from as usize + offset,
                        from as usize + offset + 1,
                        e
                    ))
                })?;
                ops.push(op.clone());
            }
        }
        staged.version = to;

        if let Some(ref journal) = self.inner.journal {
            journal.append(&JournalEntry::Upgrade { from, to, ops })?;
        }
        *self.inner.state.write() = staged;

        info!(from, to, "migrated database");
        Ok(true)
    }

    /// Current schema version.
    pub fn version(&self) -> u32 {
        self.inner.state.read().version
    }

    /// Directory of an on-disk database.
    pub fn path(&self) -> Option<&Path> {
        self.inner.path.as_deref()
    }

    pub fn table_names(&self) -> Vec<String> {
        self.inner.state.read().tables.keys().cloned().collect()
    }

    pub fn table_def(&self, table: &str) -> Result<TableDef> {
        Ok(self.inner.state.read().table(table)?.def.clone())
    }

    /// Primary key `value` would be stored under in `table`.
    pub fn key_of(&self, table: &str, value: &Value) -> Result<String> {
        state::extract_key(&self.inner.state.read().table(table)?.def, value)
    }

    // --- Reads ---

    pub fn get_raw(&self, table: &str, key: &str) -> Result<Option<Value>> {
        Ok(self.inner.state.read().table(table)?.rows.get(key).cloned())
    }

    /// Every row of `table` in primary key order.
    pub fn get_all_raw(&self, table: &str) -> Result<Vec<Value>> {
        Ok(self
            .inner
            .state
            .read()
            .table(table)?
            .rows
            .values()
            .cloned()
            .collect())
    }

    /// Rows of `table` whose `index` field equals `value`.
    pub fn get_all_from_index(&self, table: &str, index: &str, value: &Value) -> Result<Vec<Value>> {
        self.inner.state.read().table(table)?.from_index(index, value)
    }

    pub fn count(&self, table: &str) -> Result<usize> {
        Ok(self.inner.state.read().table(table)?.rows.len())
    }

    pub fn get<T: Table>(&self, key: &str) -> Result<Option<T::Record>> {
        self.get_raw(T::NAME, key)?
            .map(serde_json::from_value)
            .transpose()
            .map_err(Into::into)
    }

    pub fn get_all<T: Table>(&self) -> Result<Vec<T::Record>> {
        self.get_all_raw(T::NAME)?
            .into_iter()
            .map(|v| serde_json::from_value(v).map_err(Into::into))
            .collect()
    }

    pub fn meta_get<V: DeserializeOwned>(&self, key: &str) -> Result<Option<V>> {
        typed::decode_meta(self.get_raw(Meta::NAME, key)?)
    }

    // --- Writes ---

    /// Start a write transaction.
    pub fn transaction(&self) -> Transaction<'_> {
        Transaction::new(self)
    }

    /// Insert or replace one row in its own transaction.
    pub fn put<T: Table>(&self, record: &T::Record) -> Result<String> {
        let mut txn = self.transaction();
        let key = txn.put::<T>(record)?;
        txn.commit()?;
        Ok(key)
    }

    /// Insert one row that must not exist yet, in its own transaction.
    pub fn add<T: Table>(&self, record: &T::Record) -> Result<String> {
        let mut txn = self.transaction();
        let key = txn.add::<T>(record)?;
        txn.commit()?;
        Ok(key)
    }

    pub fn delete<T: Table>(&self, key: &str) -> Result<()> {
        let mut txn = self.transaction();
        txn.delete::<T>(key)?;
        txn.commit()
    }

    pub fn meta_put<V: Serialize>(&self, key: &str, value: &V) -> Result<()> {
        let mut txn = self.transaction();
        txn.meta_put(key, value)?;
        txn.commit()
    }

    pub fn meta_delete(&self, key: &str) -> Result<()> {
        self.delete::<Meta>(key)
    }

    pub(crate) fn commit_ops(&self, ops: Vec<WriteOp>) -> Result<()> {
        if ops.is_empty() {
            return Ok(());
        }

        let event = {
            let _lock = self.inner.write_lock.lock();
            let mut state = self.inner.state.write();

            Self::check_constraints(&state, &ops)?;

            let seq = state.seq + 1;
            if let Some(ref journal) = self.inner.journal {
                journal.append(&JournalEntry::Commit {
                    seq,
                    ops: ops.clone(),
                })?;
            }

            let mut changes = Vec::with_capacity(ops.len());
            for op in &ops {
                changes.push(state.apply_write(op)?);
            }
            state.seq = seq;

            ChangeEvent { seq, changes }
        };

        debug!(seq = event.seq, ops = event.changes.len(), "committed transaction");
        self.inner.feed.publish(event);
        Ok(())
    }

    /// Reject adds of keys that exist at commit time, taking earlier writes
    /// of the same transaction into account.
    fn check_constraints(state: &StoreState, ops: &[WriteOp]) -> Result<()> {
        let mut written: HashMap<(&str, &str), bool> = HashMap::new();
        let mut cleared: HashSet<&str> = HashSet::new();

        for op in ops {
            let table = state.table(op.table())?;
            match op {
                WriteOp::Add { table: name, key, .. } => {
                    let exists = match written.get(&(name.as_str(), key.as_str())) {
                        Some(exists) => *exists,
                        None => !cleared.contains(name.as_str()) && table.rows.contains_key(key),
                    };
                    if exists {
                        return Err(TrackerError::ConstraintViolation {
                            table: name.clone(),
                            key: key.clone(),
                        });
                    }
                    written.insert((name.as_str(), key.as_str()), true);
                }
                WriteOp::Put { table: name, key, .. } => {
                    written.insert((name.as_str(), key.as_str()), true);
                }
                WriteOp::Delete { table: name, key } => {
                    written.insert((name.as_str(), key.as_str()), false);
                }
                WriteOp::Clear { table: name } => {
                    written.retain(|(t, _), _| *t != name.as_str());
                    cleared.insert(name.as_str());
                }
            }
        }
        Ok(())
    }

    // --- Change notification ---

    pub fn feed(&self) -> &ChangeFeed {
        &self.inner.feed
    }

    /// Channel subscription to commits touching any of `tables`
    /// (all tables if empty).
    pub fn subscribe(&self, tables: &[&str]) -> FeedHandle {
        let mut config = if tables.is_empty() {
            FeedConfig::default()
        } else {
            FeedConfig::tables(tables.iter().copied())
        };
        config.buffer_size = self.inner.feed_buffer;
        self.inner.feed.subscribe(config)
    }

    // --- Maintenance ---

    /// Rewrite the journal as a single snapshot frame.
    pub fn compact(&self) -> Result<()> {
        let Some(ref journal) = self.inner.journal else {
            return Ok(());
        };

        let _lock = self.inner.write_lock.lock();
        let entry = {
            let state = self.inner.state.read();
            JournalEntry::Snapshot {
                version: state.version,
                seq: state.seq,
                tables: state.snapshot(),
            }
        };
        journal.rewrite(&[entry])?;

        info!("compacted journal");
        Ok(())
    }

    fn write_manifest(path: &Path) -> Result<()> {
        use std::io::Write;

        let mut file = File::create(path.join("MANIFEST"))?;
        file.write_all(DB_MAGIC)?;
        file.write_all(&[DB_FORMAT_VERSION])?;
        file.sync_all()?;

        Ok(())
    }

    fn verify_manifest(path: &Path) -> Result<()> {
        use std::io::Read;

        let mut file = File::open(path.join("MANIFEST"))?;

        let mut magic = [0u8; 4];
        file.read_exact(&mut magic)?;
        if &magic != DB_MAGIC {
            return Err(TrackerError::InvalidFormat("Invalid database magic".into()));
        }

        let mut version = [0u8; 1];
        file.read_exact(&mut version)?;
        if version[0] != DB_FORMAT_VERSION {
            return Err(TrackerError::InvalidFormat(format!(
                "Unsupported database format version: {}",
                version[0]
            )));
        }

        Ok(())
    }

    fn acquire_lock(path: &Path) -> Result<File> {
        let lock_file = File::create(path.join("LOCK"))?;

        lock_file
            .try_lock_exclusive()
            .map_err(|_| TrackerError::Locked)?;

        Ok(lock_file)
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("path", &self.inner.path)
            .field("version", &self.version())
            .finish()
    }
}
