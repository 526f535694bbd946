//! Import of the host site's reading history.

use crate::error::{Result, TrackerError};
use crate::store::{meta_keys, ChapterHistory, ChapterHistoryReplication, Database};
use crate::types::{ChapterHistoryRecord, ReadTime, ReplicationHistoryRecord, Timestamp};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

/// Newest read time already imported.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryScan {
    pub timestamp: Timestamp,
}

/// Extract `(content id, read time)` pairs from the host's persisted state
/// (`readingHistory._readingHistory`, newest first).
///
/// Read times keep the host's text. A state without a reading history yields
/// an empty list.
pub fn parse_reading_history(state: &Value) -> Result<Vec<(String, ReadTime)>> {
    let Some(entries) = state.pointer("/readingHistory/_readingHistory") else {
        return Ok(Vec::new());
    };
    let entries: Vec<(String, String)> = serde_json::from_value(entries.clone())?;

    entries
        .into_iter()
        .map(|(content_id, timestamp)| {
            let timestamp = ReadTime::parse(&timestamp).map_err(|e| {
                TrackerError::InvalidFormat(format!("reading history timestamp {:?}: {}", timestamp, e))
            })?;
            Ok((content_id, timestamp))
        })
        .collect()
}

/// Store reads newer than the last scan.
///
/// `entries` must be newest first; the scan stops at the first entry not
/// newer than the stored marker. New records and their pending replication
/// rows are written with the advanced marker in one transaction. Returns the
/// number of records written.
pub fn import_reading_history(db: &Database, entries: &[(String, ReadTime)]) -> Result<usize> {
    let last_scan: Option<HistoryScan> = db.meta_get(meta_keys::LAST_HISTORY_SCAN)?;

    let fresh: Vec<&(String, ReadTime)> = entries
        .iter()
        .take_while(|(_, read)| last_scan.map_or(true, |scan| read.instant() > scan.timestamp))
        .collect();
    let Some(newest) = fresh.iter().map(|(_, read)| read.instant()).max() else {
        debug!("no new reading history");
        return Ok(0);
    };

    let mut txn = db.transaction();
    let mut written = 0;
    for (content_id, timestamp) in fresh {
        let record = ChapterHistoryRecord::new(content_id.as_str(), timestamp.clone());
        if txn.get::<ChapterHistory>(&record.id)?.is_some() {
            continue;
        }
        debug!(id = %record.id, "importing history item");
        txn.put::<ChapterHistoryReplication>(&ReplicationHistoryRecord::pending(&record.id))?;
        txn.put::<ChapterHistory>(&record)?;
        written += 1;
    }
    txn.meta_put(meta_keys::LAST_HISTORY_SCAN, &HistoryScan { timestamp: newest })?;
    txn.commit()?;

    info!(written, newest = %newest, "imported reading history");
    Ok(written)
}
