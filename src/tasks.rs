//! Per-page tasks restarted on navigation.

use crate::error::Result;
use futures::future::BoxFuture;
use std::future::Future;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Cleanup routine returned by a page task once it is set up.
pub type Cleanup = BoxFuture<'static, ()>;

struct RunningTask {
    name: String,
    token: CancellationToken,
    handle: JoinHandle<Result<Cleanup>>,
}

/// Runs at most one page task at a time.
///
/// [`navigate`](Self::navigate) cancels the running task, waits for it to
/// finish and for its cleanup to complete, and only then starts the next.
/// Concurrent calls are serialized.
#[derive(Default)]
pub struct PageTasks {
    current: Mutex<Option<RunningTask>>,
}

impl PageTasks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the running task with `task`.
    ///
    /// `task` receives a cancellation token, sets the page up and resolves
    /// to its cleanup routine. A task that observes the token should return
    /// [`TrackerError::Cancelled`](crate::TrackerError::Cancelled).
    pub async fn navigate<F, Fut>(&self, name: impl Into<String>, task: F)
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<Cleanup>> + Send + 'static,
    {
        let mut current = self.current.lock().await;
        if let Some(previous) = current.take() {
            Self::stop(previous).await;
        }

        let name = name.into();
        let token = CancellationToken::new();
        info!(task = %name, "starting page task");
        let handle = tokio::spawn(task(token.clone()));
        *current = Some(RunningTask { name, token, handle });
    }

    /// Cancel and clean up the running task, if any.
    pub async fn shutdown(&self) {
        if let Some(previous) = self.current.lock().await.take() {
            Self::stop(previous).await;
        }
    }

    /// Name of the running task.
    pub async fn current(&self) -> Option<String> {
        self.current.lock().await.as_ref().map(|t| t.name.clone())
    }

    async fn stop(task: RunningTask) {
        task.token.cancel();
        match task.handle.await {
            Ok(Ok(cleanup)) => {
                cleanup.await;
                debug!(task = %task.name, "page task cleaned up");
            }
            Ok(Err(e)) if e.is_cancelled() => {
                debug!(task = %task.name, "page task cancelled during setup");
            }
            Ok(Err(e)) => error!(task = %task.name, error = %e, "page task failed"),
            Err(e) => error!(task = %task.name, error = %e, "page task panicked"),
        }
    }
}

impl std::fmt::Debug for PageTasks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageTasks").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TrackerError;
    use futures::FutureExt;
    use parking_lot::Mutex as SyncMutex;
    use std::sync::Arc;
    use std::time::Duration;

    type Log = Arc<SyncMutex<Vec<String>>>;

    fn page(log: &Log, name: &'static str) -> impl FnOnce(CancellationToken) -> BoxFuture<'static, Result<Cleanup>> {
        let log = Arc::clone(log);
        move |_token| {
            async move {
                log.lock().push(format!("start {}", name));
                let cleanup: Cleanup = async move {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    log.lock().push(format!("cleanup {}", name));
                }
                .boxed();
                Ok(cleanup)
            }
            .boxed()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_runs_before_next_start() {
        let log: Log = Arc::default();
        let tasks = PageTasks::new();

        tasks.navigate("latest", page(&log, "latest")).await;
        tokio::task::yield_now().await;
        tasks.navigate("recent", page(&log, "recent")).await;
        tokio::task::yield_now().await;
        tasks.shutdown().await;

        assert_eq!(
            *log.lock(),
            vec!["start latest", "cleanup latest", "start recent", "cleanup recent"]
        );
        assert_eq!(tasks.current().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_setup_is_cancelled() {
        let tasks = PageTasks::new();
        let observed = Arc::new(SyncMutex::new(false));

        let flag = Arc::clone(&observed);
        tasks
            .navigate("slow", move |token: CancellationToken| async move {
                token.cancelled().await;
                *flag.lock() = true;
                Err::<Cleanup, _>(TrackerError::Cancelled)
            })
            .await;
        assert_eq!(tasks.current().await.as_deref(), Some("slow"));

        tasks.navigate("next", |_| async { Ok(futures::future::ready(()).boxed()) }).await;

        assert!(*observed.lock());
        assert_eq!(tasks.current().await.as_deref(), Some("next"));
    }
}
