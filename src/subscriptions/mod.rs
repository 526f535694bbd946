//! Change notifications for committed transactions.
//!
//! Every commit that writes at least one row produces a [`ChangeEvent`]
//! listing its row-level changes. Consumers either:
//! - hold a [`FeedHandle`] (bounded channel, optional per-table filter)
//! - subscribe to [`ChangeFeed::latest`], a [`Cell`](crate::cell::Cell)
//!
//! # Example
//!
//! ```ignore
//! let handle = db.feed().subscribe(FeedConfig::tables(["chapter_history"]));
//!
//! loop {
//!     match handle.recv() {
//!         Ok(FeedEvent::Change(event)) => println!("commit {}", event.seq),
//!         Ok(FeedEvent::Dropped { reason }) => break,
//!         Err(_) => break,
//!     }
//! }
//! ```

mod manager;
mod types;

pub use manager::ChangeFeed;
pub use types::{
    ChangeEvent, ChangeKind, DropReason, FeedConfig, FeedEvent, FeedFilter, FeedHandle, FeedId,
    TableChange,
};
