//! Change feed broadcasting committed transactions.

use crate::cell::Cell;
use crossbeam_channel::{bounded, Sender};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

use super::types::{ChangeEvent, DropReason, FeedConfig, FeedEvent, FeedHandle, FeedId};

/// Internal subscription state.
struct Subscription {
    config: FeedConfig,
    sender: Sender<FeedEvent>,
}

impl Subscription {
    /// Try to send an event. Returns false if the buffer is full or the
    /// receiver is gone (subscriber will be dropped).
    fn try_send(&self, event: FeedEvent) -> Result<(), DropReason> {
        match self.sender.try_send(event) {
            Ok(()) => Ok(()),
            Err(crossbeam_channel::TrySendError::Full(_)) => Err(DropReason::BufferOverflow),
            Err(crossbeam_channel::TrySendError::Disconnected(_)) => Err(DropReason::Disconnected),
        }
    }
}

/// Publishes committed transactions of one database.
///
/// Two ways to listen:
/// - channel subscriptions ([`subscribe`](Self::subscribe)) with per-table
///   filters and bounded buffers; slow subscribers are dropped
/// - the [`latest`](Self::latest) cell, which every commit updates
pub struct ChangeFeed {
    /// Active subscriptions by ID.
    subscriptions: RwLock<HashMap<FeedId, Subscription>>,
    /// Counter for generating subscription IDs.
    next_id: AtomicU64,
    latest: Cell<Option<Arc<ChangeEvent>>>,
}

impl ChangeFeed {
    pub fn new() -> Self {
        Self {
            subscriptions: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            latest: Cell::new(None),
        }
    }

    /// Create a new channel subscription. Only commits published after this
    /// call are delivered.
    pub fn subscribe(&self, config: FeedConfig) -> FeedHandle {
        let id = FeedId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let (sender, receiver) = bounded(config.buffer_size);

        self.subscriptions
            .write()
            .insert(id, Subscription { config, sender });

        FeedHandle { id, receiver }
    }

    /// Unsubscribe and clean up.
    pub fn unsubscribe(&self, id: FeedId) {
        if let Some(sub) = self.subscriptions.write().remove(&id) {
            // Best effort: the buffer may already be full.
            let _ = sub.sender.try_send(FeedEvent::Dropped {
                reason: DropReason::Unsubscribed,
            });
        }
    }

    /// Get subscription count.
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.read().len()
    }

    /// Cell holding the most recent commit. Subscribers are notified once per
    /// commit, after the data is visible to readers.
    pub fn latest(&self) -> Cell<Option<Arc<ChangeEvent>>> {
        self.latest.clone()
    }

    /// Broadcast a committed transaction. Drops subscribers that fail to receive.
    pub(crate) fn publish(&self, event: ChangeEvent) {
        let event = Arc::new(event);
        let mut to_remove = Vec::new();

        {
            let subs = self.subscriptions.read();
            for (id, sub) in subs.iter() {
                if !sub.config.filter.matches(&event) {
                    continue;
                }
                if let Err(reason) = sub.try_send(FeedEvent::Change(Arc::clone(&event))) {
                    to_remove.push((*id, reason));
                }
            }
        }

        if !to_remove.is_empty() {
            let mut subs = self.subscriptions.write();
            for (id, reason) in to_remove {
                if let Some(sub) = subs.remove(&id) {
                    warn!(feed_id = id.0, ?reason, "dropping change feed subscriber");
                    let _ = sub.sender.try_send(FeedEvent::Dropped { reason });
                }
            }
        }

        debug!(seq = event.seq, changes = event.changes.len(), "published commit");
        self.latest.publish(Some(event));
    }
}

impl Default for ChangeFeed {
    fn default() -> Self {
        Self::new()
    }
}
