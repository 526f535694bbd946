//! Replication of local tables through a remote append-only changelog.
//!
//! A [`Replicator`] binds one local table (plus its replication history
//! table) to one remote table and runs the cycle
//! `Idle → EnsureRemoteSchema → Push → Pull → Idle`:
//!
//! - **push** sends every row whose history says `isReplicated = 0` in one
//!   remote transaction that also appends a changelog entry, then marks the
//!   rows replicated
//! - **pull** fetches changelog entries after the local checkpoint that other
//!   clients wrote, applies the referenced rows and advances the checkpoint,
//!   all in one local transaction
//!
//! Tables replicate independently: [`replicate_all`] runs one cycle per
//! replicator concurrently and a failing table does not stop the others.

mod config;
mod remote;
mod replicator;
mod session;

pub use config::ReplicationConfig;
pub use remote::{ChangelogEntry, ChangelogRemote, KvServer};
pub use replicator::{Replicator, SyncOutcome, SyncPhase};
pub use session::{client_id, find_session, login, KvSession, SessionStatus};

use crate::error::Result;
use crate::store::Database;
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Per-table result of a replication pass.
pub type TableOutcome = (String, Result<Option<SyncOutcome>>);

/// Run one cycle on every replicator concurrently.
///
/// Failures are logged and reported per table.
pub async fn replicate_all(replicators: &[Replicator]) -> Vec<TableOutcome> {
    let cycles = replicators.iter().map(|replicator| async move {
        let name = replicator.config().name.clone();
        let result = replicator.sync().await;
        if let Err(ref e) = result {
            error!(table = %name, error = %e, "replication failed");
        }
        (name, result)
    });
    join_all(cycles).await
}

/// Replicators for every tracked table against the sync server, using the
/// stored session.
///
/// Returns an empty list when there is no active session.
pub fn kv_replicators(db: &Database, sync_server_url: &str) -> Result<Vec<Replicator>> {
    let Some(session) = find_session(db)?.active() else {
        warn!("not logged in to sync server, skipping replication");
        return Ok(Vec::new());
    };
    let client_id = client_id(db)?;

    let remote: Arc<dyn ChangelogRemote> = Arc::new(KvServer::new(sync_server_url, session.sid));
    Ok(ReplicationConfig::all()
        .into_iter()
        .map(|config| Replicator::new(db.clone(), Arc::clone(&remote), config, client_id.clone()))
        .collect())
}

/// Run [`replicate_all`] now and then every `interval` until `token` is
/// cancelled.
pub fn spawn_periodic(
    replicators: Vec<Replicator>,
    interval: Duration,
    token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            replicate_all(&replicators).await;
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }
        info!("periodic replication stopped");
    })
}
