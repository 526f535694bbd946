//! FIFO rate limiter for upstream requests.

use crate::cell::{Cell, Subscription};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::trace;

/// Rate limit: at most `quota` requests per rolling `window`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RateLimiterConfig {
    pub quota: usize,
    pub window: Duration,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            quota: 5,
            window: Duration::from_secs(1),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Ticket(u64);

#[derive(Clone, Debug, Default, PartialEq)]
struct LimiterState {
    /// Waiting callers, oldest first. Only the head may touch `history`.
    queue: VecDeque<Ticket>,
    /// Start times of recent requests, oldest first.
    history: VecDeque<Instant>,
}

/// Gates outbound requests through a FIFO queue.
///
/// Each caller enqueues a ticket and waits until it reaches the head of the
/// queue; the head then waits for a free slot in the window, records its
/// request time and leaves the queue. Queueing is unbounded, the outbound
/// rate is not.
///
/// Clones share the same queue, so construct one limiter per upstream and
/// hand it to every component that calls it.
#[derive(Clone)]
pub struct RateLimiter {
    config: RateLimiterConfig,
    state: Cell<LimiterState>,
    next_ticket: Arc<AtomicU64>,
}

impl RateLimiter {
    pub fn new(config: RateLimiterConfig) -> Self {
        Self {
            config,
            state: Cell::new(LimiterState::default()),
            next_ticket: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn config(&self) -> &RateLimiterConfig {
        &self.config
    }

    /// Number of callers currently waiting.
    pub fn queued(&self) -> usize {
        self.state.with(|s| s.queue.len())
    }

    /// Wait for permission to issue one request.
    ///
    /// Dropping the returned future gives up the caller's place in the queue.
    pub async fn acquire(&self) {
        let ticket = Ticket(self.next_ticket.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = oneshot::channel::<()>();
        let tx = Arc::new(Mutex::new(Some(tx)));

        self.state.update(|s| s.queue.push_back(ticket));

        let state = self.state.clone();
        let config = self.config.clone();
        let sub = self.state.subscribe_async(move |snapshot: LimiterState| {
            let state = state.clone();
            let config = config.clone();
            let tx = Arc::clone(&tx);
            async move {
                if snapshot.queue.front() != Some(&ticket) {
                    return;
                }
                if tx.lock().as_ref().map_or(true, |tx| tx.is_closed()) {
                    return;
                }

                if let Some(wait) = Self::wait_time(&state, &config) {
                    trace!(ticket = ticket.0, ?wait, "rate limit window full");
                    tokio::time::sleep(wait).await;
                }

                let Some(tx) = tx.lock().take() else { return };
                if tx.is_closed() {
                    return;
                }

                state.update(|s| {
                    let now = Instant::now();
                    while s
                        .history
                        .front()
                        .is_some_and(|t| now.duration_since(*t) >= config.window)
                    {
                        s.history.pop_front();
                    }
                    while s.history.len() >= config.quota.max(1) {
                        s.history.pop_front();
                    }
                    s.history.push_back(now);
                    s.queue.retain(|t| *t != ticket);
                });
                let _ = tx.send(());
            }
        });

        let _guard = QueueGuard {
            state: self.state.clone(),
            ticket,
            sub,
        };

        let _ = rx.await;
    }

    /// How long the head must wait before the window has room.
    fn wait_time(state: &Cell<LimiterState>, config: &RateLimiterConfig) -> Option<Duration> {
        state.with(|s| {
            let now = Instant::now();
            let in_window: Vec<&Instant> = s
                .history
                .iter()
                .filter(|t| now.duration_since(**t) < config.window)
                .collect();
            if in_window.len() < config.quota.max(1) {
                return None;
            }
            // The oldest request that must expire before there is room.
            let oldest = in_window[in_window.len() - config.quota.max(1)];
            Some(config.window.saturating_sub(now.duration_since(*oldest)))
        })
    }
}

/// Detaches a waiter, and removes its ticket if the caller went away while
/// still queued.
struct QueueGuard {
    state: Cell<LimiterState>,
    ticket: Ticket,
    sub: Subscription,
}

impl Drop for QueueGuard {
    fn drop(&mut self) {
        self.sub.unsubscribe();
        let ticket = self.ticket;
        self.state.set_with(|s| s.queue.retain(|t| *t != ticket));
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("config", &self.config)
            .field("queued", &self.queued())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(quota: usize) -> RateLimiter {
        RateLimiter::new(RateLimiterConfig {
            quota,
            window: Duration::from_secs(1),
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_under_quota_is_immediate() {
        let limiter = limiter(3);
        let start = Instant::now();

        for _ in 0..3 {
            limiter.acquire().await;
        }

        assert_eq!(start.elapsed(), Duration::ZERO);
        assert_eq!(limiter.queued(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_window_exceeds_quota() {
        let limiter = limiter(2);
        let times = Arc::new(Mutex::new(Vec::new()));

        let tasks: Vec<_> = (0..7)
            .map(|_| {
                let limiter = limiter.clone();
                let times = Arc::clone(&times);
                tokio::spawn(async move {
                    limiter.acquire().await;
                    times.lock().push(Instant::now());
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }

        let mut times = times.lock().clone();
        times.sort();
        assert_eq!(times.len(), 7);
        for pair in times.windows(3) {
            assert!(pair[2].duration_since(pair[0]) >= Duration::from_secs(1));
        }
        assert_eq!(limiter.queued(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_waiter_leaves_queue() {
        let limiter = limiter(1);
        limiter.acquire().await;

        // Blocked behind the full window, then abandoned.
        let waiting = tokio::time::timeout(Duration::from_millis(100), limiter.acquire()).await;
        assert!(waiting.is_err());
        assert_eq!(limiter.queued(), 0);

        let start = Instant::now();
        limiter.acquire().await;
        assert!(start.elapsed() <= Duration::from_secs(1));
    }
}
