//! Reactive value cells.
//!
//! A [`Cell`] holds a value and pushes every change to its subscribers:
//! - synchronous subscribers run inline, in subscription order
//! - async subscribers run on the tokio runtime, one invocation at a time per
//!   subscriber, collapsing bursts down to the latest value
//!
//! Combinators build new cells out of existing ones ([`Cell::pipe`],
//! [`merge2`]/[`merge_all!`](crate::merge_all)), adapt callback APIs
//! ([`observe`]) and rate-shape handlers ([`Debounced`]).
//!
//! # Example
//!
//! ```ignore
//! use mdtracker::cell::Cell;
//!
//! let count = Cell::new(1);
//! let doubled = count.pipe(|x| x * 2);
//! let sub = doubled.subscribe(|x| println!("doubled: {x}"));
//!
//! count.set(2); // prints "doubled: 4"
//! sub.unsubscribe();
//! ```

mod debounce;
mod merge;
mod observe;
mod value;

pub use self::debounce::Debounced;
pub use self::merge::{merge2, merge3, merge4, Merged};
pub use self::observe::{observe, Observer};
pub use self::value::{Cell, Derived, SubscriberId, Subscription};
