//! The observable value container and its subscription handles.

use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::future::Future;
use std::ops::Deref;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::error;

/// Counter for generating subscriber IDs.
static NEXT_SUBSCRIBER_ID: AtomicU64 = AtomicU64::new(1);

/// Identifies one subscriber of a cell.
///
/// Subscribing twice with the same ID replaces the earlier handler in place.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriberId(pub u64);

impl SubscriberId {
    /// Allocate a fresh, process-unique ID.
    pub fn next() -> Self {
        SubscriberId(NEXT_SUBSCRIBER_ID.fetch_add(1, Ordering::Relaxed))
    }
}

type Notify<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Sink<T> {
    id: SubscriberId,
    notify: Notify<T>,
    /// Cleared on unsubscribe so queued async work stops early.
    alive: Arc<AtomicBool>,
}

struct Inner<T> {
    value: RwLock<T>,
    sinks: Mutex<Vec<Sink<T>>>,
}

/// Type-erased unsubscribe, so handles don't carry the cell's value type.
trait Detach: Send + Sync {
    fn detach(&self, id: SubscriberId) -> bool;
}

impl<T: Send + Sync> Detach for Inner<T> {
    fn detach(&self, id: SubscriberId) -> bool {
        let mut sinks = self.sinks.lock();
        match sinks.iter().position(|s| s.id == id) {
            Some(pos) => {
                let sink = sinks.remove(pos);
                sink.alive.store(false, Ordering::Release);
                true
            }
            None => false,
        }
    }
}

/// Handle returned by the `subscribe*` family.
///
/// Dropping the handle does not unsubscribe; call [`Subscription::unsubscribe`].
pub struct Subscription {
    id: SubscriberId,
    cell: Weak<dyn Detach>,
}

impl Subscription {
    /// The subscriber ID this handle controls.
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Remove the handler. Returns `false` if it was already removed.
    pub fn unsubscribe(&self) -> bool {
        match self.cell.upgrade() {
            Some(cell) => cell.detach(self.id),
            None => false,
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

/// Serialization state for one async subscriber.
struct AsyncSlot<T> {
    running: bool,
    /// Latest value that arrived while the handler was busy.
    pending: Option<T>,
}

/// A mutable observable value.
///
/// Cloning a cell yields another handle to the same value.
pub struct Cell<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Cell<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for Cell<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Cell").field(&*self.inner.value.read()).finish()
    }
}

impl<T: Default + Clone + PartialEq + Send + Sync + 'static> Default for Cell<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T> Cell<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    /// Create a cell holding `value`.
    pub fn new(value: T) -> Self {
        Self {
            inner: Arc::new(Inner {
                value: RwLock::new(value),
                sinks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Current value.
    pub fn get(&self) -> T {
        self.inner.value.read().clone()
    }

    /// Borrow the current value without cloning it.
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        f(&self.inner.value.read())
    }

    /// Replace the value and notify subscribers.
    ///
    /// Setting a value equal to the current one is a no-op. Returns whether
    /// subscribers were notified.
    pub fn set(&self, value: T) -> bool {
        {
            let mut current = self.inner.value.write();
            if *current == value {
                return false;
            }
            *current = value.clone();
        }
        self.notify(&value);
        true
    }

    /// Replace the value and notify subscribers even if it is unchanged.
    ///
    /// For cells that model a stream of events rather than a state.
    pub fn publish(&self, value: T) {
        *self.inner.value.write() = value.clone();
        self.notify(&value);
    }

    /// Compute the next value from a copy of the current one, then [`set`](Self::set) it.
    pub fn set_with(&self, f: impl FnOnce(&mut T)) -> bool {
        let mut next = self.get();
        f(&mut next);
        self.set(next)
    }

    /// Mutate the value in place and force a notification.
    pub fn update(&self, f: impl FnOnce(&mut T)) {
        f(&mut self.inner.value.write());
        self.refresh();
    }

    /// Re-notify every subscriber with the current value.
    pub fn refresh(&self) {
        let value = self.get();
        self.notify(&value);
    }

    fn notify(&self, value: &T) {
        // Snapshot the handlers so they may (un)subscribe or set re-entrantly.
        let sinks: Vec<Notify<T>> = self
            .inner
            .sinks
            .lock()
            .iter()
            .map(|s| Arc::clone(&s.notify))
            .collect();
        for notify in sinks {
            notify(value);
        }
    }

    /// Register a synchronous handler.
    ///
    /// The handler is invoked immediately with the current value and then on
    /// every change.
    pub fn subscribe<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        self.subscribe_with_id(SubscriberId::next(), handler)
    }

    /// [`subscribe`](Self::subscribe) under a caller-chosen ID.
    pub fn subscribe_with_id<F>(&self, id: SubscriberId, handler: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let notify: Notify<T> = Arc::new(handler);
        notify(&self.get());
        self.insert(id, notify, Arc::new(AtomicBool::new(true)))
    }

    /// Register a handler without the initial invocation.
    pub(crate) fn attach<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        self.insert(
            SubscriberId::next(),
            Arc::new(handler),
            Arc::new(AtomicBool::new(true)),
        )
    }

    /// Register an async handler.
    ///
    /// Delivery is serialized per subscriber: if the handler is still busy
    /// with one value when new values arrive, exactly one follow-up
    /// invocation runs afterwards, with the latest value. Intermediate values
    /// are skipped.
    ///
    /// # Panics
    ///
    /// Must be called from within a tokio runtime. Handlers run on that
    /// runtime, whichever thread the value is set from.
    pub fn subscribe_async<F, Fut>(&self, handler: F) -> Subscription
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.subscribe_async_with_id(SubscriberId::next(), handler)
    }

    /// [`subscribe_async`](Self::subscribe_async) under a caller-chosen ID.
    pub fn subscribe_async_with_id<F, Fut>(&self, id: SubscriberId, handler: F) -> Subscription
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let alive = Arc::new(AtomicBool::new(true));
        let slot = Arc::new(Mutex::new(AsyncSlot::<T> {
            running: false,
            pending: None,
        }));
        let handler = Arc::new(handler);
        let runtime = tokio::runtime::Handle::current();

        let notify: Notify<T> = {
            let alive = Arc::clone(&alive);
            Arc::new(move |value: &T| {
                {
                    let mut slot = slot.lock();
                    if slot.running {
                        slot.pending = Some(value.clone());
                        return;
                    }
                    slot.running = true;
                }
                runtime.spawn(drive_async(
                    Arc::clone(&slot),
                    Arc::clone(&handler),
                    Arc::clone(&alive),
                    value.clone(),
                ));
            })
        };

        notify(&self.get());
        self.insert(id, notify, alive)
    }

    fn insert(&self, id: SubscriberId, notify: Notify<T>, alive: Arc<AtomicBool>) -> Subscription {
        let mut sinks = self.inner.sinks.lock();
        let sink = Sink { id, notify, alive };
        match sinks.iter_mut().find(|s| s.id == id) {
            Some(existing) => {
                existing.alive.store(false, Ordering::Release);
                *existing = sink;
            }
            None => sinks.push(sink),
        }
        drop(sinks);

        let weak: Weak<Inner<T>> = Arc::downgrade(&self.inner);
        Subscription { id, cell: weak }
    }

    /// Remove a handler by ID. Redundant calls are no-ops returning `false`.
    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        self.inner.detach(id)
    }

    /// Number of registered handlers.
    pub fn subscriber_count(&self) -> usize {
        self.inner.sinks.lock().len()
    }

    /// Derive a cell whose value is `transform` applied to this cell's value,
    /// recomputed on every change.
    ///
    /// The returned [`Derived`] keeps the source subscription and releases it
    /// when dropped. Chain further transforms with [`Derived::pipe`].
    pub fn pipe<R, F>(&self, transform: F) -> Derived<R>
    where
        R: Clone + PartialEq + Send + Sync + 'static,
        F: Fn(&T) -> R + Send + Sync + 'static,
    {
        let target = Cell::new(self.with(&transform));
        let sink = target.clone();
        let source = self.attach(move |value| {
            sink.set(transform(value));
        });
        Derived::new(target, vec![source])
    }
}

async fn drive_async<T, F, Fut>(
    slot: Arc<Mutex<AsyncSlot<T>>>,
    handler: Arc<F>,
    alive: Arc<AtomicBool>,
    mut value: T,
) where
    F: Fn(T) -> Fut,
    Fut: Future<Output = ()>,
{
    loop {
        if AssertUnwindSafe((*handler)(value)).catch_unwind().await.is_err() {
            error!("async cell subscriber panicked");
        }

        let next = {
            let mut slot = slot.lock();
            let next = if alive.load(Ordering::Acquire) {
                slot.pending.take()
            } else {
                None
            };
            if next.is_none() {
                slot.running = false;
                slot.pending = None;
            }
            next
        };

        match next {
            Some(v) => value = v,
            None => return,
        }
    }
}

/// A cell computed from one or more source cells.
///
/// Holds the source subscriptions and releases them on drop; the derived
/// value itself stays readable through any clone of the inner [`Cell`].
pub struct Derived<T> {
    cell: Cell<T>,
    sources: Vec<Subscription>,
}

impl<T> Derived<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    pub(crate) fn new(cell: Cell<T>, sources: Vec<Subscription>) -> Self {
        Self { cell, sources }
    }

    /// Handle to the derived cell.
    pub fn cell(&self) -> &Cell<T> {
        &self.cell
    }

    /// Apply a further transform, carrying the upstream subscriptions along.
    pub fn pipe<R, F>(mut self, transform: F) -> Derived<R>
    where
        R: Clone + PartialEq + Send + Sync + 'static,
        F: Fn(&T) -> R + Send + Sync + 'static,
    {
        let mut next = self.cell.pipe(transform);
        next.sources.append(&mut self.sources);
        next
    }

    /// Stop tracking the sources and return the (now static) cell.
    pub fn release(mut self) -> Cell<T> {
        for source in self.sources.drain(..) {
            source.unsubscribe();
        }
        self.cell.clone()
    }
}

impl<T> Deref for Derived<T> {
    type Target = Cell<T>;

    fn deref(&self) -> &Cell<T> {
        &self.cell
    }
}

impl<T> Drop for Derived<T> {
    fn drop(&mut self) {
        for source in &self.sources {
            source.unsubscribe();
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for Derived<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Derived")
            .field("cell", &self.cell)
            .field("sources", &self.sources.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn recorder<T: Clone + Send + 'static>() -> (Arc<Mutex<Vec<T>>>, impl Fn(&T) + Send + Sync) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        (seen, move |v: &T| sink.lock().push(v.clone()))
    }

    #[test]
    fn test_subscribe_receives_initial_and_changes() {
        let cell = Cell::new(1);
        let (seen, handler) = recorder();
        cell.subscribe(handler);

        cell.set(2);
        cell.set(3);

        assert_eq!(*seen.lock(), vec![1, 2, 3]);
    }

    #[test]
    fn test_equal_value_does_not_notify() {
        let cell = Cell::new(1);
        let (seen, handler) = recorder();
        cell.subscribe(handler);

        assert!(!cell.set(1));
        assert!(cell.set(2));
        assert!(!cell.set(2));

        assert_eq!(*seen.lock(), vec![1, 2]);
    }

    #[test]
    fn test_refresh_and_update_force_notification() {
        let cell = Cell::new(vec![1]);
        let (seen, handler) = recorder();
        cell.subscribe(handler);

        cell.refresh();
        cell.update(|v| v.push(2));

        assert_eq!(*seen.lock(), vec![vec![1], vec![1], vec![1, 2]]);
    }

    #[test]
    fn test_unsubscribe_by_id_is_idempotent() {
        let cell = Cell::new(1);
        let id = SubscriberId::next();
        let (seen, handler) = recorder();

        cell.subscribe_with_id(id, handler);
        cell.set(2);

        assert!(cell.unsubscribe(id));
        cell.set(3);
        assert!(!cell.unsubscribe(id));
        cell.set(4);

        assert_eq!(*seen.lock(), vec![1, 2]);
        assert_eq!(cell.subscriber_count(), 0);
    }

    #[test]
    fn test_unsubscribe_by_handle_is_idempotent() {
        let cell = Cell::new(1);
        let (seen, handler) = recorder();

        let sub = cell.subscribe(handler);
        cell.set(2);

        assert!(sub.unsubscribe());
        cell.set(3);
        assert!(!sub.unsubscribe());
        cell.set(4);

        assert_eq!(*seen.lock(), vec![1, 2]);
    }

    #[test]
    fn test_same_id_replaces_handler_in_place() {
        let cell = Cell::new(0);
        let order = Arc::new(Mutex::new(Vec::new()));
        let id = SubscriberId::next();

        let o = Arc::clone(&order);
        cell.subscribe_with_id(id, move |v| o.lock().push(("first", *v)));
        let o = Arc::clone(&order);
        cell.subscribe(move |v| o.lock().push(("second", *v)));
        let o = Arc::clone(&order);
        cell.subscribe_with_id(id, move |v| o.lock().push(("replaced", *v)));

        order.lock().clear();
        cell.set(1);

        assert_eq!(*order.lock(), vec![("replaced", 1), ("second", 1)]);
        assert_eq!(cell.subscriber_count(), 2);
    }

    #[test]
    fn test_handler_may_unsubscribe_itself() {
        let cell = Cell::new(0);
        let id = SubscriberId::next();
        let (seen, record) = recorder();

        let this = cell.clone();
        cell.subscribe_with_id(id, move |v| {
            record(v);
            if *v >= 1 {
                this.unsubscribe(id);
            }
        });

        cell.set(1);
        cell.set(2);

        assert_eq!(*seen.lock(), vec![0, 1]);
    }

    #[test]
    fn test_pipe_follows_source() {
        let cell = Cell::new(2);
        let doubled = cell.pipe(|x| x * 2).pipe(|x| format!("={x}"));
        assert_eq!(doubled.get(), "=4");

        cell.set(5);
        assert_eq!(doubled.get(), "=10");
    }

    #[test]
    fn test_dropping_derived_releases_source() {
        let cell = Cell::new(1);
        let derived = cell.pipe(|x| x + 1);
        assert_eq!(cell.subscriber_count(), 1);

        let frozen = derived.release();
        assert_eq!(cell.subscriber_count(), 0);

        cell.set(10);
        assert_eq!(frozen.get(), 2);

        let chained = cell.pipe(|x| x + 1).pipe(|x| x * 3);
        assert_eq!(cell.subscriber_count(), 1);
        drop(chained);
        assert_eq!(cell.subscriber_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscribe_async_collapses_burst() {
        let cell = Cell::new(3u64);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let active = Arc::new(AtomicU64::new(0));
        let overlap = Arc::new(AtomicBool::new(false));

        let (s, a, o) = (Arc::clone(&seen), Arc::clone(&active), Arc::clone(&overlap));
        cell.subscribe_async(move |x| {
            let (seen, active, overlap) = (Arc::clone(&s), Arc::clone(&a), Arc::clone(&o));
            async move {
                if active.fetch_add(1, Ordering::SeqCst) > 0 {
                    overlap.store(true, Ordering::SeqCst);
                }
                tokio::time::sleep(Duration::from_millis(x * 50)).await;
                seen.lock().push(x);
                active.fetch_sub(1, Ordering::SeqCst);
            }
        });

        for x in [2, 7, 4, 1] {
            cell.set(x);
        }
        assert!(seen.lock().is_empty());

        tokio::time::sleep(Duration::from_secs(5)).await;

        assert_eq!(*seen.lock(), vec![3, 1]);
        assert!(!overlap.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscribe_async_stops_after_unsubscribe() {
        let cell = Cell::new(1u64);
        let seen = Arc::new(Mutex::new(Vec::new()));

        let s = Arc::clone(&seen);
        let sub = cell.subscribe_async(move |x| {
            let seen = Arc::clone(&s);
            async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                seen.lock().push(x);
            }
        });

        cell.set(2);
        sub.unsubscribe();
        cell.set(3);

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(*seen.lock(), vec![1]);
    }
}
