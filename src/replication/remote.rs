//! The remote changelog protocol.
//!
//! Every remote table holds three SQL tables: `kv` (row id → JSON payload),
//! `changelog` (one row per push: id, pushing client, ids of the rows it
//! wrote) and `meta` (the `changelog_id` counter). A push writes all three
//! in one script wrapped in `BEGIN`/`COMMIT`, so it is applied whole or not
//! at all.

use crate::error::{Result, TrackerError};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

/// One push as recorded in the remote changelog.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangelogEntry {
    pub id: i64,
    /// Keys of the rows written by the push.
    pub rows: Vec<String>,
}

/// Operations the replicator needs from the remote side.
#[async_trait]
pub trait ChangelogRemote: Send + Sync {
    /// Create the remote table and its changelog if they do not exist.
    async fn ensure_table(&self, table: &str) -> Result<()>;

    /// Upsert `rows` (key, payload) and append one changelog entry for them.
    async fn push(&self, table: &str, client_id: &str, rows: &[(String, Value)]) -> Result<()>;

    /// Changelog entries after `checkpoint` not written by `exclude_client`,
    /// ascending by id.
    async fn changes_since(
        &self,
        table: &str,
        checkpoint: i64,
        exclude_client: &str,
    ) -> Result<Vec<ChangelogEntry>>;

    /// Current payloads of `keys`. Keys with no row are left out.
    async fn fetch_rows(&self, table: &str, keys: &[String]) -> Result<Vec<Value>>;
}

/// [`ChangelogRemote`] backed by the key-value sync server.
#[derive(Clone, Debug)]
pub struct KvServer {
    client: Client,
    base_url: String,
    sid: String,
}

impl KvServer {
    pub fn new(base_url: impl Into<String>, sid: impl Into<String>) -> Self {
        Self::with_client(Client::new(), base_url, sid)
    }

    pub fn with_client(client: Client, base_url: impl Into<String>, sid: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            sid: sid.into(),
        }
    }

    async fn post_json(&self, path: &str, body: &Value) -> Result<Value> {
        let url = format!("{}{}", self.base_url, path);
        debug!(%url, "posting");

        let response = self
            .client
            .post(&url)
            .header("sid", &self.sid)
            .header(reqwest::header::ACCEPT, "application/json")
            .json(body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(TrackerError::Remote {
                status: status.as_u16(),
                url,
            });
        }

        // `execute` may answer with an empty body.
        let text = response.text().await?;
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_str(&text)?)
    }

    async fn execute(&self, table: &str, sql: String) -> Result<Value> {
        self.post_json(&format!("/execute/{}", table), &json!({ "sql": sql }))
            .await
    }

    async fn select(&self, table: &str, sql: String) -> Result<Vec<Value>> {
        let rows = self
            .post_json(&format!("/select/{}", table), &json!({ "sql": sql }))
            .await?;
        match rows {
            Value::Array(rows) => Ok(rows),
            Value::Null => Ok(Vec::new()),
            other => Err(TrackerError::InvalidFormat(format!(
                "expected an array of rows from {}, got {}",
                table, other
            ))),
        }
    }
}

#[async_trait]
impl ChangelogRemote for KvServer {
    async fn ensure_table(&self, table: &str) -> Result<()> {
        let created = self
            .post_json(
                "/create_kv",
                &json!({
                    "name": table,
                    "allow_guest_read": false,
                    "allow_guest_write": false,
                }),
            )
            .await;
        match created {
            Ok(_) => {}
            Err(TrackerError::Remote { status, .. }) if status == StatusCode::CONFLICT.as_u16() => {
                debug!(table, "remote table already exists");
            }
            Err(e) => return Err(e),
        }

        self.execute(table, sql::ensure_schema()).await?;
        Ok(())
    }

    async fn push(&self, table: &str, client_id: &str, rows: &[(String, Value)]) -> Result<()> {
        self.execute(table, sql::push_script(client_id, rows)?).await?;
        Ok(())
    }

    async fn changes_since(
        &self,
        table: &str,
        checkpoint: i64,
        exclude_client: &str,
    ) -> Result<Vec<ChangelogEntry>> {
        self.select(table, sql::changes_since(checkpoint, exclude_client))
            .await?
            .into_iter()
            .map(parse_changelog_row)
            .collect()
    }

    async fn fetch_rows(&self, table: &str, keys: &[String]) -> Result<Vec<Value>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        self.select(table, sql::select_values(keys))
            .await?
            .into_iter()
            .map(|row| parse_json_column(row.get("value").cloned().unwrap_or(Value::Null)))
            .collect()
    }
}

fn parse_changelog_row(row: Value) -> Result<ChangelogEntry> {
    let id = row
        .get("id")
        .and_then(Value::as_i64)
        .ok_or_else(|| TrackerError::InvalidFormat(format!("changelog row without id: {}", row)))?;
    let rows = parse_json_column(row.get("rows").cloned().unwrap_or(Value::Null))?;
    Ok(ChangelogEntry {
        id,
        rows: serde_json::from_value(rows)?,
    })
}

/// JSON columns come back as text; decode them if so.
fn parse_json_column(value: Value) -> Result<Value> {
    match value {
        Value::String(text) => Ok(serde_json::from_str(&text)?),
        Value::Null => Err(TrackerError::InvalidFormat("missing JSON column".into())),
        other => Ok(other),
    }
}

/// SQL scripts sent to the sync server.
pub(crate) mod sql {
    use crate::error::Result;
    use serde_json::Value;

    /// Quote `s` as an SQL string literal.
    pub fn quote(s: &str) -> String {
        format!("'{}'", s.replace('\'', "''"))
    }

    pub fn ensure_schema() -> String {
        "CREATE TABLE IF NOT EXISTS meta (key TEXT PRIMARY KEY, value BLOB NOT NULL);\n\
         CREATE TABLE IF NOT EXISTS changelog (id INTEGER PRIMARY KEY, client_id TEXT NOT NULL, rows JSON NOT NULL);\n\
         INSERT OR IGNORE INTO meta (key, value) VALUES ('changelog_id', 0);"
            .to_string()
    }

    pub fn push_script(client_id: &str, rows: &[(String, Value)]) -> Result<String> {
        let mut script = String::from("BEGIN;\n");
        for (key, value) in rows {
            script.push_str(&format!(
                "INSERT OR REPLACE INTO kv (key, value) VALUES ({}, {});\n",
                quote(key),
                quote(&serde_json::to_string(value)?)
            ));
        }

        let keys: Vec<&str> = rows.iter().map(|(key, _)| key.as_str()).collect();
        script.push_str(&format!(
            "INSERT INTO changelog (id, client_id, rows) VALUES \
             ((SELECT value + 1 FROM meta WHERE key = 'changelog_id'), {}, {});\n",
            quote(client_id),
            quote(&serde_json::to_string(&keys)?)
        ));
        script.push_str(
            "UPDATE meta SET value = (SELECT value + 1 FROM meta WHERE key = 'changelog_id') \
             WHERE key = 'changelog_id';\n",
        );
        script.push_str("COMMIT;");
        Ok(script)
    }

    pub fn changes_since(checkpoint: i64, exclude_client: &str) -> String {
        format!(
            "SELECT id, rows FROM changelog WHERE id > {} AND client_id != {} ORDER BY id ASC;",
            checkpoint,
            quote(exclude_client)
        )
    }

    pub fn select_values(keys: &[String]) -> String {
        let keys: Vec<String> = keys.iter().map(|k| quote(k)).collect();
        format!("SELECT value FROM kv WHERE key IN ({});", keys.join(", "))
    }
}
