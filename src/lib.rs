//! # mdtracker
//!
//! Local reading-history tracking for a manga site, with replication to a
//! remote key-value server and a rate-limited cache of the site's API.
//!
//! ## Core Concepts
//!
//! - **Cells**: observable values with sync and serialized async subscribers
//! - **Database**: versioned local tables, journaled to disk, publishing a
//!   change event per committed transaction
//! - **API cache**: TTL cache of upstream responses behind a FIFO rate limiter
//! - **Replication**: push/pull of pending rows through a remote changelog
//!
//! ## Example
//!
//! ```ignore
//! use mdtracker::{Database, DatabaseConfig, ReplicationConfig, Replicator};
//!
//! let db = Database::open_tracker(DatabaseConfig::new("./tracker"))?;
//! import_reading_history(&db, &entries)?;
//!
//! let replicators = kv_replicators(&db, "https://sync.example.com")?;
//! for (table, result) in replicate_all(&replicators).await {
//!     println!("{table}: {result:?}");
//! }
//! ```

pub mod api;
pub mod cell;
pub mod config;
pub mod error;
pub mod history;
pub mod replication;
pub mod store;
pub mod subscriptions;
pub mod tasks;
pub mod titles;
pub mod types;
pub mod wal;

// Re-exports
pub use api::{ApiCache, FetchOptions, HttpUpstream, RateLimiter, RateLimiterConfig, UpstreamApi};
pub use cell::{Cell, Debounced, Derived, Merged, SubscriberId, Subscription};
pub use config::{load_config, write_config, Config};
pub use error::{Result, TrackerError};
pub use history::{import_reading_history, parse_reading_history};
pub use replication::{
    client_id, find_session, kv_replicators, login, replicate_all, spawn_periodic, ChangelogRemote,
    KvServer, KvSession, ReplicationConfig, Replicator, SessionStatus, SyncOutcome, SyncPhase,
};
pub use store::{Database, DatabaseConfig, Schema, Table, Transaction};
pub use subscriptions::{ChangeEvent, ChangeFeed, ChangeKind, FeedEvent, FeedHandle, TableChange};
pub use tasks::PageTasks;
pub use titles::{fetch_titles_seen, watch_titles_seen, TitlesSeen};
pub use types::*;
