//! Sync-server session and client identity.

use crate::error::{Result, TrackerError};
use crate::store::{meta_keys, Database};
use crate::types::Timestamp;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

/// A logged-in session on the sync server.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KvSession {
    pub sid: String,
    pub username: String,
    pub expires: Timestamp,
}

impl KvSession {
    pub fn is_expired(&self, now: Timestamp) -> bool {
        self.expires < now
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionStatus {
    Active(KvSession),
    /// The stored session had expired and has been removed. The user should
    /// be told to log in again.
    Expired { username: String },
    Missing,
}

impl SessionStatus {
    pub fn active(self) -> Option<KvSession> {
        match self {
            SessionStatus::Active(session) => Some(session),
            _ => None,
        }
    }
}

/// Look up the stored session, deleting it if it has expired.
pub fn find_session(db: &Database) -> Result<SessionStatus> {
    let Some(session) = db.meta_get::<KvSession>(meta_keys::KV_SESSION)? else {
        return Ok(SessionStatus::Missing);
    };

    if session.is_expired(Timestamp::now()) {
        warn!(username = %session.username, expires = %session.expires, "sync session expired");
        db.meta_delete(meta_keys::KV_SESSION)?;
        return Ok(SessionStatus::Expired {
            username: session.username,
        });
    }

    Ok(SessionStatus::Active(session))
}

/// This client's identity, generated on first use.
pub fn client_id(db: &Database) -> Result<String> {
    let mut txn = db.transaction();
    if let Some(id) = txn.meta_get::<String>(meta_keys::CLIENT_ID)? {
        return Ok(id);
    }

    let id = Uuid::new_v4().to_string();
    txn.meta_put(meta_keys::CLIENT_ID, &id)?;
    txn.commit()?;
    info!(client_id = %id, "generated client id");
    Ok(id)
}

/// Log in to the sync server at `base_url` and store the session.
pub async fn login(db: &Database, base_url: &str, username: &str, password: &str) -> Result<KvSession> {
    let url = format!("{}/login", base_url.trim_end_matches('/'));
    let response = Client::new()
        .post(&url)
        .json(&json!({
            "username": username,
            "password": password,
            "duration": null,
        }))
        .send()
        .await?;

    let status = response.status();
    if !status.is_success() {
        return Err(TrackerError::Remote {
            status: status.as_u16(),
            url,
        });
    }

    let session: KvSession = response.json().await?;
    db.meta_put(meta_keys::KV_SESSION, &session)?;
    info!(username = %session.username, expires = %session.expires, "logged in to sync server");
    Ok(session)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Schema;
    use std::time::Duration;

    fn db() -> Database {
        Database::open_in_memory(&Schema::tracker()).unwrap()
    }

    fn session(expires: Timestamp) -> KvSession {
        KvSession {
            sid: "sid-1".into(),
            username: "reader".into(),
            expires,
        }
    }

    #[test]
    fn test_missing_session() {
        assert_eq!(find_session(&db()).unwrap(), SessionStatus::Missing);
    }

    #[test]
    fn test_active_session() {
        let db = db();
        let stored = session(Timestamp::now().plus(Duration::from_secs(3600)));
        db.meta_put(meta_keys::KV_SESSION, &stored).unwrap();

        assert_eq!(find_session(&db).unwrap(), SessionStatus::Active(stored));
    }

    #[test]
    fn test_expired_session_is_deleted() {
        let db = db();
        let stored = session(Timestamp::now().minus(Duration::from_secs(60)));
        db.meta_put(meta_keys::KV_SESSION, &stored).unwrap();

        assert_eq!(
            find_session(&db).unwrap(),
            SessionStatus::Expired {
                username: "reader".into()
            }
        );
        assert!(db.meta_get::<KvSession>(meta_keys::KV_SESSION).unwrap().is_none());
        assert_eq!(find_session(&db).unwrap(), SessionStatus::Missing);
    }

    #[test]
    fn test_client_id_is_stable() {
        let db = db();
        let first = client_id(&db).unwrap();
        let second = client_id(&db).unwrap();

        assert_eq!(first, second);
        assert!(Uuid::parse_str(&first).is_ok());
    }
}
