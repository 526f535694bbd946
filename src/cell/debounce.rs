//! Leading-edge debounce with a trailing call.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;

struct DebounceState {
    last_fired: Option<Instant>,
    pending: Option<JoinHandle<()>>,
}

struct DebounceInner<A> {
    interval: Duration,
    func: Box<dyn Fn(A) + Send + Sync>,
    state: Mutex<DebounceState>,
}

/// Wraps a function so that it runs at most once per `interval`.
///
/// A call arriving at least `interval` after the previous invocation runs
/// immediately. Calls arriving sooner replace any scheduled call, and the
/// last of them runs once the interval has elapsed.
///
/// Requires a tokio runtime for the deferred calls.
pub struct Debounced<A> {
    inner: Arc<DebounceInner<A>>,
}

impl<A> Clone for Debounced<A> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<A: Send + 'static> Debounced<A> {
    pub fn new<F>(interval: Duration, func: F) -> Self
    where
        F: Fn(A) + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(DebounceInner {
                interval,
                func: Box::new(func),
                state: Mutex::new(DebounceState {
                    last_fired: None,
                    pending: None,
                }),
            }),
        }
    }

    pub fn call(&self, args: A) {
        let mut state = self.inner.state.lock();
        if let Some(pending) = state.pending.take() {
            pending.abort();
        }

        let now = Instant::now();
        let remaining = match state.last_fired {
            Some(last) => self.inner.interval.saturating_sub(now - last),
            None => Duration::ZERO,
        };

        if remaining.is_zero() {
            state.last_fired = Some(now);
            drop(state);
            (self.inner.func)(args);
            return;
        }

        let inner = Arc::clone(&self.inner);
        state.pending = Some(tokio::spawn(async move {
            tokio::time::sleep(remaining).await;
            inner.state.lock().last_fired = Some(Instant::now());
            (inner.func)(args);
        }));
    }

    /// Drop any scheduled trailing call.
    pub fn cancel(&self) {
        if let Some(pending) = self.inner.state.lock().pending.take() {
            pending.abort();
        }
    }
}

impl<A: Clone + Send + 'static> Debounced<A> {
    /// Adapter for [`Cell::subscribe`](super::Cell::subscribe).
    pub fn handler(&self) -> impl Fn(&A) + Send + Sync + 'static {
        let this = self.clone();
        move |args: &A| this.call(args.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cell::Cell;

    type Log = Arc<Mutex<Vec<(u32, u128)>>>;

    fn recording(interval: Duration) -> (Debounced<u32>, Log) {
        let start = Instant::now();
        let log: Log = Arc::new(Mutex::new(Vec::new()));
        let l = Arc::clone(&log);
        let debounced = Debounced::new(interval, move |x| {
            l.lock().push((x, start.elapsed().as_millis()));
        });
        (debounced, log)
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_call_runs_immediately() {
        let (debounced, log) = recording(Duration::from_millis(300));

        debounced.call(1);
        assert_eq!(*log.lock(), vec![(1, 0)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_collapses_into_trailing_call() {
        let (debounced, log) = recording(Duration::from_millis(300));

        debounced.call(1);
        tokio::time::sleep(Duration::from_millis(100)).await;
        debounced.call(2);
        tokio::time::sleep(Duration::from_millis(100)).await;
        debounced.call(3);
        tokio::time::sleep(Duration::from_millis(500)).await;

        assert_eq!(*log.lock(), vec![(1, 0), (3, 300)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_spaced_calls_each_run_immediately() {
        let (debounced, log) = recording(Duration::from_millis(300));

        debounced.call(1);
        tokio::time::sleep(Duration::from_millis(400)).await;
        debounced.call(2);

        assert_eq!(*log.lock(), vec![(1, 0), (2, 400)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_drops_trailing_call() {
        let (debounced, log) = recording(Duration::from_millis(300));

        debounced.call(1);
        debounced.call(2);
        debounced.cancel();
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(log.lock().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_handler_debounces_cell_changes() {
        let (debounced, log) = recording(Duration::from_millis(300));
        let cell = Cell::new(0u32);
        cell.subscribe(debounced.handler());

        cell.set(1);
        cell.set(2);
        tokio::time::sleep(Duration::from_secs(1)).await;

        let values: Vec<u32> = log.lock().iter().map(|(x, _)| *x).collect();
        assert_eq!(values, vec![0, 2]);
    }
}
