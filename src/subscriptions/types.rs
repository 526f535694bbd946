//! Change feed event and subscription types.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

/// Configuration for a feed subscription.
#[derive(Clone, Debug)]
pub struct FeedConfig {
    /// Max buffered events before dropping the subscriber.
    /// Default: 1000
    pub buffer_size: usize,

    /// Filter criteria.
    pub filter: FeedFilter,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            buffer_size: 1000,
            filter: FeedFilter::default(),
        }
    }
}

impl FeedConfig {
    /// Subscribe to commits touching any of `tables`.
    pub fn tables<I, S>(tables: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            filter: FeedFilter::tables(tables),
            ..Default::default()
        }
    }
}

/// Filter criteria for feed subscriptions.
#[derive(Clone, Debug, Default)]
pub struct FeedFilter {
    /// Only deliver commits touching one of these tables (None = all tables).
    pub tables: Option<Vec<String>>,
}

impl FeedFilter {
    /// Deliver every commit.
    pub fn all() -> Self {
        Self::default()
    }

    pub fn tables<I, S>(tables: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            tables: Some(tables.into_iter().map(Into::into).collect()),
        }
    }

    pub(crate) fn matches(&self, event: &ChangeEvent) -> bool {
        match self.tables {
            Some(ref tables) => event.changes.iter().any(|c| tables.contains(&c.table)),
            None => true,
        }
    }
}

/// What happened to a row.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    /// Row inserted, failing if the key existed.
    Add,
    /// Row inserted or replaced.
    Put,
    /// Row removed.
    Delete,
    /// Every row of the table removed.
    Clear,
}

/// One row-level change inside a commit.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TableChange {
    pub table: String,
    /// Primary key of the row. `None` for [`ChangeKind::Clear`].
    pub key: Option<String>,
    pub kind: ChangeKind,
    /// New row value for adds and puts.
    pub value: Option<Value>,
}

/// All changes of one committed transaction, in write order.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// Commit sequence number, increasing per database.
    pub seq: u64,
    pub changes: Vec<TableChange>,
}

impl ChangeEvent {
    /// Whether any change targets `table`.
    pub fn touches(&self, table: &str) -> bool {
        self.changes.iter().any(|c| c.table == table)
    }

    /// Changes targeting `table`.
    pub fn changes_for<'a>(&'a self, table: &'a str) -> impl Iterator<Item = &'a TableChange> + 'a {
        self.changes.iter().filter(move |c| c.table == table)
    }
}

/// Events delivered to feed subscribers.
#[derive(Clone, Debug)]
pub enum FeedEvent {
    /// A transaction committed.
    Change(Arc<ChangeEvent>),

    /// Subscription was dropped.
    Dropped { reason: DropReason },
}

/// Why a subscription was dropped.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    /// Send buffer overflowed (slow consumer).
    BufferOverflow,
    /// Receiver went away.
    Disconnected,
    /// Explicitly unsubscribed.
    Unsubscribed,
}

/// Unique identifier for a feed subscription.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct FeedId(pub u64);

/// Handle to a feed subscription.
pub struct FeedHandle {
    pub id: FeedId,
    /// Channel to receive events.
    pub receiver: crossbeam_channel::Receiver<FeedEvent>,
}

impl FeedHandle {
    /// Receive the next event (blocking).
    pub fn recv(&self) -> Result<FeedEvent, crossbeam_channel::RecvError> {
        self.receiver.recv()
    }

    /// Try to receive an event (non-blocking).
    pub fn try_recv(&self) -> Result<FeedEvent, crossbeam_channel::TryRecvError> {
        self.receiver.try_recv()
    }

    /// Receive with timeout.
    pub fn recv_timeout(
        &self,
        timeout: std::time::Duration,
    ) -> Result<FeedEvent, crossbeam_channel::RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }
}
