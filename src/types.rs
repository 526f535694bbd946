//! Core types shared by the store, the replicator and the API cache.

use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

/// Number of content-id characters kept in a chapter history id.
const CONTENT_ID_PREFIX_LEN: usize = 10;

/// A UTC instant, serialized as an ISO-8601 (RFC 3339) string.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(OffsetDateTime);

impl Timestamp {
    /// Current time.
    pub fn now() -> Self {
        Timestamp(OffsetDateTime::now_utc())
    }

    /// Parse an ISO-8601 string such as `2024-01-01T00:00:00Z`.
    pub fn parse(s: &str) -> Result<Self, time::error::Parse> {
        OffsetDateTime::parse(s, &Rfc3339).map(|t| Timestamp(t.to_offset(time::UtcOffset::UTC)))
    }

    /// Time elapsed between `self` and `now`, clamped to zero for instants
    /// in the future.
    pub fn age(&self, now: Timestamp) -> Duration {
        let delta = now.0 - self.0;
        if delta.is_negative() {
            Duration::ZERO
        } else {
            delta.unsigned_abs()
        }
    }

    /// Shift the instant backwards by `d`.
    pub fn minus(&self, d: Duration) -> Self {
        Timestamp(self.0 - d)
    }

    /// Shift the instant forwards by `d`.
    pub fn plus(&self, d: Duration) -> Self {
        Timestamp(self.0 + d)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0.format(&Rfc3339) {
            Ok(s) => f.write_str(&s),
            Err(_) => Err(fmt::Error),
        }
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({})", self)
    }
}

impl FromStr for Timestamp {
    type Err = time::error::Parse;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Timestamp::parse(s)
    }
}

impl Serialize for Timestamp {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Timestamp {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Timestamp::parse(&s).map_err(de::Error::custom)
    }
}

/// A read time as the host reported it.
///
/// Chapter history ids are built from the source text, so it is kept
/// verbatim next to the parsed instant: `2024-01-01T00:00:00.000Z` and
/// `2024-01-01T00:00:00Z` are different ids.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct ReadTime {
    text: String,
    instant: Timestamp,
}

impl ReadTime {
    /// Parse an ISO-8601 string, keeping its exact text.
    pub fn parse(s: &str) -> Result<Self, time::error::Parse> {
        Ok(Self {
            instant: Timestamp::parse(s)?,
            text: s.to_string(),
        })
    }

    /// The text the read time was parsed from.
    pub fn as_str(&self) -> &str {
        &self.text
    }

    pub fn instant(&self) -> Timestamp {
        self.instant
    }
}

impl From<Timestamp> for ReadTime {
    fn from(instant: Timestamp) -> Self {
        Self {
            text: instant.to_string(),
            instant,
        }
    }
}

impl fmt::Display for ReadTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

impl fmt::Debug for ReadTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ReadTime({})", self.text)
    }
}

impl Serialize for ReadTime {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.text)
    }
}

impl<'de> Deserialize<'de> for ReadTime {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        ReadTime::parse(&s).map_err(de::Error::custom)
    }
}

/// Serde adapter storing a flag as `0`/`1` so it can be indexed.
mod int_flag {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(flag: &bool, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(u8::from(*flag))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
        Ok(u8::deserialize(deserializer)? != 0)
    }
}

/// One chapter read on the host site.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChapterHistoryRecord {
    pub id: String,
    pub content_id: String,
    pub timestamp: ReadTime,
}

impl ChapterHistoryRecord {
    /// Build a record whose id is derived from the read time and the content
    /// id, so replaying the same read on any client yields the same key.
    pub fn new(content_id: impl Into<String>, timestamp: impl Into<ReadTime>) -> Self {
        let content_id = content_id.into();
        let timestamp = timestamp.into();
        let prefix: String = content_id.chars().take(CONTENT_ID_PREFIX_LEN).collect();
        Self {
            id: format!("{}_{}", timestamp, prefix),
            content_id,
            timestamp,
        }
    }
}

/// Replication bookkeeping for one record of a replicated table.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplicationHistoryRecord {
    pub id: String,
    #[serde(with = "int_flag")]
    pub is_replicated: bool,
    pub from_remote: bool,
    pub updated_at: Timestamp,
}

impl ReplicationHistoryRecord {
    /// A locally written record that still needs to be pushed.
    pub fn pending(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            is_replicated: false,
            from_remote: false,
            updated_at: Timestamp::now(),
        }
    }

    /// A record that arrived through a pull.
    pub fn from_remote(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            is_replicated: true,
            from_remote: true,
            updated_at: Timestamp::now(),
        }
    }

    /// Copy of this record acknowledged by the remote.
    pub fn acknowledged(&self) -> Self {
        Self {
            is_replicated: true,
            updated_at: Timestamp::now(),
            ..self.clone()
        }
    }
}

/// Last remote changelog position fully applied locally.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplicationCheckpoint {
    pub changelog_id: i64,
}

/// Generic configuration / bookkeeping entry in the `meta` table.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MetaEntry {
    pub key: String,
    pub value: Value,
}

/// Cached upstream API response.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiCacheEntry {
    pub id: String,
    pub data: Value,
    pub updated_at: Timestamp,
}

impl ApiCacheEntry {
    /// Whether the entry is older than `max_age` at `now`.
    pub fn is_stale(&self, max_age: Duration, now: Timestamp) -> bool {
        self.updated_at.age(now) > max_age
    }
}

/// Derived mapping from a chapter to the title it belongs to.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChapterTitle {
    pub chapter: String,
    pub title: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_chapter_id_derivation() {
        let ts = Timestamp::parse("2024-01-01T00:00:00Z").unwrap();
        let record = ChapterHistoryRecord::new("abc", ts);
        assert_eq!(record.id, "2024-01-01T00:00:00Z_abc");

        let record = ChapterHistoryRecord::new("0123456789abcdef", ts);
        assert_eq!(record.id, "2024-01-01T00:00:00Z_0123456789");
        assert_eq!(record.content_id, "0123456789abcdef");
    }

    #[test]
    fn test_chapter_id_keeps_host_timestamp_text() {
        let read = ReadTime::parse("2024-01-01T00:00:00.000Z").unwrap();
        let record = ChapterHistoryRecord::new("abcdefghijklmnop", read.clone());
        assert_eq!(record.id, "2024-01-01T00:00:00.000Z_abcdefghij");
        assert_eq!(
            serde_json::to_value(&record).unwrap()["timestamp"],
            "2024-01-01T00:00:00.000Z"
        );

        let read = ReadTime::parse("2024-01-01T00:00:00.120Z").unwrap();
        assert_eq!(
            ChapterHistoryRecord::new("abc", read).id,
            "2024-01-01T00:00:00.120Z_abc"
        );

        // Same instant, different text.
        assert_eq!(
            ReadTime::parse("2024-01-01T00:00:00.000Z").unwrap().instant(),
            ReadTime::parse("2024-01-01T00:00:00Z").unwrap().instant()
        );
    }

    #[test]
    fn test_pulled_record_round_trips_verbatim() {
        let row = json!({
            "id": "2024-01-01T00:00:00.000Z_abc",
            "contentId": "abc",
            "timestamp": "2024-01-01T00:00:00.000Z",
        });
        let record: ChapterHistoryRecord = serde_json::from_value(row.clone()).unwrap();
        assert_eq!(serde_json::to_value(&record).unwrap(), row);
    }

    #[test]
    fn test_replication_history_wire_format() {
        let mut record = ReplicationHistoryRecord::pending("x");
        record.updated_at = Timestamp::parse("2024-01-01T00:00:00Z").unwrap();

        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(
            value,
            json!({
                "id": "x",
                "isReplicated": 0,
                "fromRemote": false,
                "updatedAt": "2024-01-01T00:00:00Z",
            })
        );

        let acked = record.acknowledged();
        assert!(acked.is_replicated);
        assert!(!acked.from_remote);
        assert_eq!(serde_json::to_value(&acked).unwrap()["isReplicated"], 1);
    }

    #[test]
    fn test_timestamp_age() {
        let earlier = Timestamp::parse("2024-01-01T00:00:00Z").unwrap();
        let later = Timestamp::parse("2024-01-01T00:00:10Z").unwrap();

        assert_eq!(earlier.age(later), Duration::from_secs(10));
        assert_eq!(later.age(earlier), Duration::ZERO);
    }

    #[test]
    fn test_cache_entry_staleness() {
        let now = Timestamp::now();
        let entry = ApiCacheEntry {
            id: "/chapter/1".into(),
            data: json!({"result": "ok"}),
            updated_at: now.minus(Duration::from_secs(60)),
        };

        assert!(!entry.is_stale(Duration::from_secs(120), now));
        assert!(entry.is_stale(Duration::from_secs(30), now));
    }
}
