//! Typed views over the tracker's tables.

use crate::error::Result;
use crate::types::{ApiCacheEntry, ChapterHistoryRecord, ChapterTitle, MetaEntry, ReplicationHistoryRecord};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

/// Name of the index over `isReplicated` on every replication history table.
pub const IS_REPLICATED_INDEX: &str = "isReplicated";

/// Well-known keys of the `meta` table.
pub mod meta_keys {
    pub const CONFIG: &str = "config";
    pub const KV_SESSION: &str = "kv_session";
    pub const CLIENT_ID: &str = "client_id";
    pub const LAST_HISTORY_SCAN: &str = "last_history_scan";
}

/// A table with a known name and row type.
pub trait Table {
    const NAME: &'static str;
    type Record: Serialize + DeserializeOwned;
}

/// Generic key-value entries: configuration, session, checkpoints, identity.
pub struct Meta;

impl Table for Meta {
    const NAME: &'static str = "meta";
    type Record = MetaEntry;
}

pub struct ChapterHistory;

impl Table for ChapterHistory {
    const NAME: &'static str = "chapter_history";
    type Record = ChapterHistoryRecord;
}

pub struct ChapterHistoryReplication;

impl Table for ChapterHistoryReplication {
    const NAME: &'static str = "chapter_history_replication_history";
    type Record = ReplicationHistoryRecord;
}

/// Cached upstream API responses.
pub struct MdApi;

impl Table for MdApi {
    const NAME: &'static str = "md_api";
    type Record = ApiCacheEntry;
}

pub struct MdApiReplication;

impl Table for MdApiReplication {
    const NAME: &'static str = "md_api_replication_history";
    type Record = ReplicationHistoryRecord;
}

/// Chapter → title mapping resolved through the API.
pub struct ChapterToTitle;

impl Table for ChapterToTitle {
    const NAME: &'static str = "chapter_to_title";
    type Record = ChapterTitle;
}

pub(crate) fn encode_meta<V: Serialize>(key: &str, value: &V) -> Result<Value> {
    Ok(serde_json::to_value(MetaEntry {
        key: key.to_string(),
        value: serde_json::to_value(value)?,
    })?)
}

pub(crate) fn decode_meta<V: DeserializeOwned>(row: Option<Value>) -> Result<Option<V>> {
    match row {
        Some(row) => {
            let entry: MetaEntry = serde_json::from_value(row)?;
            Ok(Some(serde_json::from_value(entry.value)?))
        }
        None => Ok(None),
    }
}
