//! Push/pull replication of one local table.

use super::config::ReplicationConfig;
use super::remote::ChangelogRemote;
use crate::cell::Cell;
use crate::error::Result;
use crate::store::{Database, IS_REPLICATED_INDEX};
use crate::types::{ReplicationCheckpoint, ReplicationHistoryRecord};
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, instrument, warn};

/// Where a replicator is in its cycle.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SyncPhase {
    #[default]
    Idle,
    EnsureRemoteSchema,
    Push,
    Pull,
}

/// Result of one full cycle.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SyncOutcome {
    /// Rows acknowledged by the remote.
    pub pushed: usize,
    /// Rows written locally from the remote.
    pub pulled: usize,
    /// Checkpoint after the pull.
    pub checkpoint: i64,
}

/// Replicates one local table against one remote changelog table.
///
/// At most one cycle runs at a time per replicator; clones share that
/// restriction and the phase cell.
#[derive(Clone)]
pub struct Replicator {
    db: Database,
    remote: Arc<dyn ChangelogRemote>,
    config: ReplicationConfig,
    client_id: String,
    phase: Cell<SyncPhase>,
    running: Arc<AsyncMutex<()>>,
}

impl Replicator {
    pub fn new(
        db: Database,
        remote: Arc<dyn ChangelogRemote>,
        config: ReplicationConfig,
        client_id: impl Into<String>,
    ) -> Self {
        Self {
            db,
            remote,
            config,
            client_id: client_id.into(),
            phase: Cell::new(SyncPhase::Idle),
            running: Arc::new(AsyncMutex::new(())),
        }
    }

    pub fn config(&self) -> &ReplicationConfig {
        &self.config
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Observable cycle phase.
    pub fn phase(&self) -> Cell<SyncPhase> {
        self.phase.clone()
    }

    /// Stored checkpoint, 0 if none.
    pub fn checkpoint(&self) -> Result<ReplicationCheckpoint> {
        Ok(self
            .db
            .meta_get(&self.config.checkpoint_key)?
            .unwrap_or_default())
    }

    /// Run a full cycle: ensure the remote schema, push, then pull.
    ///
    /// Returns `Ok(None)` without doing anything if a cycle is already
    /// running on this replicator.
    #[instrument(skip(self), fields(table = %self.config.name))]
    pub async fn sync(&self) -> Result<Option<SyncOutcome>> {
        let Ok(_running) = self.running.try_lock() else {
            debug!("sync already in flight, skipping");
            return Ok(None);
        };
        let _idle = PhaseReset(&self.phase);

        self.phase.set(SyncPhase::EnsureRemoteSchema);
        self.ensure_remote_schema().await?;

        self.phase.set(SyncPhase::Push);
        let pushed = self.push().await?;

        self.phase.set(SyncPhase::Pull);
        let pulled = self.pull().await?;

        let outcome = SyncOutcome {
            pushed,
            pulled,
            checkpoint: self.checkpoint()?.changelog_id,
        };
        info!(pushed, pulled, checkpoint = outcome.checkpoint, "sync complete");
        Ok(Some(outcome))
    }

    pub async fn ensure_remote_schema(&self) -> Result<()> {
        self.remote.ensure_table(&self.config.remote_table).await
    }

    /// Push every pending row in one remote transaction.
    ///
    /// Rows are marked replicated only after the remote accepted the push,
    /// and only if their bookkeeping did not change while the push was in
    /// flight. A pending row whose payload is missing stays pending.
    pub async fn push(&self) -> Result<usize> {
        let pending: Vec<ReplicationHistoryRecord> = self
            .db
            .get_all_from_index(&self.config.history_table, IS_REPLICATED_INDEX, &json!(0))?
            .into_iter()
            .map(serde_json::from_value)
            .collect::<std::result::Result<_, _>>()?;
        if pending.is_empty() {
            return Ok(0);
        }

        let mut rows = Vec::with_capacity(pending.len());
        let mut sent = Vec::with_capacity(pending.len());
        for history in pending {
            match self.db.get_raw(&self.config.local_table, &history.id)? {
                Some(payload) => {
                    rows.push((history.id.clone(), payload));
                    sent.push(history);
                }
                None => warn!(id = %history.id, "pending row has no payload, skipping"),
            }
        }
        if rows.is_empty() {
            return Ok(0);
        }

        info!(count = rows.len(), "pushing rows");
        self.remote
            .push(&self.config.remote_table, &self.client_id, &rows)
            .await?;

        let mut txn = self.db.transaction();
        let mut acknowledged = 0;
        for history in &sent {
            let current: Option<ReplicationHistoryRecord> = txn
                .get_raw(&self.config.history_table, &history.id)?
                .map(serde_json::from_value)
                .transpose()?;
            if current.as_ref() != Some(history) {
                debug!(id = %history.id, "row changed during push, leaving pending");
                continue;
            }
            txn.put_raw(
                &self.config.history_table,
                serde_json::to_value(history.acknowledged())?,
            )?;
            acknowledged += 1;
        }
        txn.commit()?;

        Ok(acknowledged)
    }

    /// Apply remote changes made by other clients since the checkpoint.
    ///
    /// Rows, their bookkeeping and the new checkpoint are written in one
    /// local transaction. Rows identical to the local copy are not rewritten.
    pub async fn pull(&self) -> Result<usize> {
        let checkpoint = self.checkpoint()?;
        debug!(checkpoint = checkpoint.changelog_id, "pulling");

        let entries = self
            .remote
            .changes_since(
                &self.config.remote_table,
                checkpoint.changelog_id,
                &self.client_id,
            )
            .await?;
        let Some(last_id) = entries.iter().map(|e| e.id).max() else {
            return Ok(0);
        };

        let mut seen = HashSet::new();
        let keys: Vec<String> = entries
            .into_iter()
            .flat_map(|e| e.rows)
            .filter(|key| seen.insert(key.clone()))
            .collect();
        let documents = self
            .remote
            .fetch_rows(&self.config.remote_table, &keys)
            .await?;

        let mut txn = self.db.transaction();
        let mut applied = 0;
        for document in documents {
            let key = self.db.key_of(&self.config.local_table, &document)?;
            if txn.get_raw(&self.config.local_table, &key)?.as_ref() == Some(&document) {
                continue;
            }
            txn.put_raw(&self.config.local_table, document)?;
            txn.put_raw(
                &self.config.history_table,
                serde_json::to_value(ReplicationHistoryRecord::from_remote(key))?,
            )?;
            applied += 1;
        }

        let next = ReplicationCheckpoint {
            changelog_id: checkpoint.changelog_id.max(last_id),
        };
        txn.meta_put(&self.config.checkpoint_key, &next)?;
        txn.commit()?;

        info!(
            applied,
            checkpoint = next.changelog_id,
            "pulled remote changes"
        );
        Ok(applied)
    }

    /// Create pending bookkeeping for local rows that have none.
    pub fn insert_missing_history(&self) -> Result<usize> {
        let mut txn = self.db.transaction();
        let mut inserted = 0;
        for row in self.db.get_all_raw(&self.config.local_table)? {
            let key = self.db.key_of(&self.config.local_table, &row)?;
            if txn.get_raw(&self.config.history_table, &key)?.is_some() {
                continue;
            }
            txn.add_raw(
                &self.config.history_table,
                serde_json::to_value(ReplicationHistoryRecord::pending(key))?,
            )?;
            inserted += 1;
        }
        txn.commit()?;

        if inserted > 0 {
            info!(table = %self.config.name, inserted, "added missing replication history");
        }
        Ok(inserted)
    }
}

struct PhaseReset<'a>(&'a Cell<SyncPhase>);

impl Drop for PhaseReset<'_> {
    fn drop(&mut self) {
        self.0.set(SyncPhase::Idle);
    }
}

impl std::fmt::Debug for Replicator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Replicator")
            .field("config", &self.config)
            .field("client_id", &self.client_id)
            .field("phase", &self.phase.get())
            .finish()
    }
}

