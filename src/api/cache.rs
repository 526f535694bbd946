//! TTL cache in front of the upstream API.

use super::limiter::RateLimiter;
use super::upstream::UpstreamApi;
use crate::error::Result;
use crate::store::{Database, MdApi, MdApiReplication, Table};
use crate::types::{ApiCacheEntry, ReplicationHistoryRecord, Timestamp};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument, warn};

/// Per-request cache policy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FetchOptions {
    /// Entries older than this are refetched.
    pub max_age: Duration,
    /// Never hit the network. Stale entries are returned as they are.
    pub only_cache: bool,
}

impl FetchOptions {
    pub fn max_age(max_age: Duration) -> Self {
        Self {
            max_age,
            only_cache: false,
        }
    }

    pub fn only_cache(mut self, only_cache: bool) -> Self {
        self.only_cache = only_cache;
        self
    }
}

/// Rate-limited, persistent cache of upstream responses.
///
/// Fresh entries are written together with a pending replication row, so
/// cached responses are shared with other clients through the replicator.
#[derive(Clone)]
pub struct ApiCache {
    db: Database,
    upstream: Arc<dyn UpstreamApi>,
    limiter: RateLimiter,
    table: String,
    history_table: String,
}

impl ApiCache {
    /// Cache backed by the `md_api` table.
    pub fn new(db: Database, upstream: Arc<dyn UpstreamApi>, limiter: RateLimiter) -> Self {
        Self {
            db,
            upstream,
            limiter,
            table: MdApi::NAME.to_string(),
            history_table: MdApiReplication::NAME.to_string(),
        }
    }

    /// Store entries in `table`, tracking replication in `history_table`.
    pub fn with_tables(mut self, table: &str, history_table: &str) -> Self {
        self.table = table.to_string();
        self.history_table = history_table.to_string();
        self
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Return the response for `path`, cached under `key`.
    ///
    /// Returns `Ok(None)` when the upstream answered with an error envelope
    /// (not-found or otherwise) or when `only_cache` is set and nothing is
    /// cached. Transport and storage failures are returned as errors.
    #[instrument(skip(self, token, options), fields(table = %self.table))]
    pub async fn fetch_cached(
        &self,
        key: &str,
        token: Option<&str>,
        path: &str,
        options: FetchOptions,
    ) -> Result<Option<Value>> {
        let cached: Option<ApiCacheEntry> = self
            .db
            .get_raw(&self.table, key)?
            .map(serde_json::from_value)
            .transpose()?;

        let data = match cached {
            Some(entry) if !entry.is_stale(options.max_age, Timestamp::now()) => {
                debug!("cache hit");
                entry.data
            }
            Some(entry) if options.only_cache => {
                debug!(updated_at = %entry.updated_at, "returning stale entry");
                entry.data
            }
            None if options.only_cache => return Ok(None),
            _ => self.refresh(key, token, path).await?,
        };

        Ok(normalize_envelope(path, data))
    }

    async fn refresh(&self, key: &str, token: Option<&str>, path: &str) -> Result<Value> {
        self.limiter.acquire().await;
        let data = self.upstream.get_json(path, token).await?;

        let entry = ApiCacheEntry {
            id: key.to_string(),
            data,
            updated_at: Timestamp::now(),
        };

        let mut txn = self.db.transaction();
        txn.put_raw(&self.table, serde_json::to_value(&entry)?)?;
        txn.put_raw(
            &self.history_table,
            serde_json::to_value(ReplicationHistoryRecord::pending(key))?,
        )?;
        txn.commit()?;

        Ok(entry.data)
    }
}

/// Collapse error envelopes to `None`; 404s quietly, everything else with a
/// warning.
fn normalize_envelope(path: &str, data: Value) -> Option<Value> {
    if data.get("result").and_then(Value::as_str) == Some("ok") {
        return Some(data);
    }

    let status = data
        .pointer("/errors/0/status")
        .and_then(Value::as_u64);
    if status == Some(404) {
        debug!(path, "upstream not found");
    } else {
        warn!(path, ?status, body = %data, "upstream request failed");
    }
    None
}

impl std::fmt::Debug for ApiCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiCache")
            .field("table", &self.table)
            .field("limiter", &self.limiter)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_normalize_envelope() {
        let ok = json!({ "result": "ok", "data": { "id": "c1" } });
        assert_eq!(normalize_envelope("/chapter/c1", ok.clone()), Some(ok));

        let missing = json!({ "result": "error", "errors": [{ "status": 404 }] });
        assert_eq!(normalize_envelope("/chapter/c1", missing), None);

        let failed = json!({ "result": "error", "errors": [{ "status": 500 }] });
        assert_eq!(normalize_envelope("/chapter/c1", failed), None);

        assert_eq!(normalize_envelope("/chapter/c1", json!([])), None);
    }
}
