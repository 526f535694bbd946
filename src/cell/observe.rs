//! Adapting callback-style observers into cells.

use super::value::Cell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Feeds batches from a callback API into the cell returned by [`observe`].
pub struct Observer<B> {
    emit: Arc<dyn Fn(B) + Send + Sync>,
    connected: Arc<AtomicBool>,
}

impl<B> Clone for Observer<B> {
    fn clone(&self) -> Self {
        Self {
            emit: Arc::clone(&self.emit),
            connected: Arc::clone(&self.connected),
        }
    }
}

/// Create a cell holding the mapped result of the most recent batch.
///
/// The cell starts out as `None`. Each batch passed to [`Observer::emit`]
/// (or to the closure from [`Observer::callback`]) is mapped and published,
/// notifying subscribers even when the mapped value repeats, so unit-valued
/// maps still work as change signals.
pub fn observe<B, R, F>(map: F) -> (Cell<Option<R>>, Observer<B>)
where
    B: 'static,
    R: Clone + PartialEq + Send + Sync + 'static,
    F: Fn(B) -> R + Send + Sync + 'static,
{
    let cell = Cell::new(None);
    let connected = Arc::new(AtomicBool::new(true));

    let emit: Arc<dyn Fn(B) + Send + Sync> = {
        let cell = cell.clone();
        let connected = Arc::clone(&connected);
        Arc::new(move |batch: B| {
            if connected.load(Ordering::Acquire) {
                cell.publish(Some(map(batch)));
            }
        })
    };

    (cell, Observer { emit, connected })
}

impl<B: 'static> Observer<B> {
    /// Deliver one batch.
    pub fn emit(&self, batch: B) {
        (self.emit)(batch)
    }

    /// A plain closure suitable for registering with the wrapped API.
    pub fn callback(&self) -> impl Fn(B) + Send + Sync + 'static {
        let emit = Arc::clone(&self.emit);
        move |batch| emit(batch)
    }

    /// Stop forwarding batches. Later emissions are ignored.
    pub fn disconnect(&self) {
        self.connected.store(false, Ordering::Release);
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn test_observe_maps_each_batch() {
        let (cell, observer) = observe(|batch: Vec<u32>| batch.len());
        assert_eq!(cell.get(), None);

        observer.emit(vec![1, 2, 3]);
        assert_eq!(cell.get(), Some(3));

        let callback = observer.callback();
        callback(vec![]);
        assert_eq!(cell.get(), Some(0));
    }

    #[test]
    fn test_repeated_unit_batches_still_notify() {
        let (cell, observer) = observe(|_: ()| ());
        let count = Arc::new(Mutex::new(0));
        let c = Arc::clone(&count);
        cell.subscribe(move |_| *c.lock() += 1);

        observer.emit(());
        observer.emit(());
        assert_eq!(*count.lock(), 3);

        observer.disconnect();
        observer.emit(());
        assert_eq!(*count.lock(), 3);
        assert!(!observer.is_connected());
    }
}
