//! One-shot awaitable initialization handle.
//!
//! Coordinator construction cannot block (some tiers provision remote tables)
//! yet must be transparent to callers. [`Deferred`] spawns the construction
//! work in the background at creation time and lets any number of callers
//! await the outcome; cancellation of one awaiter never cancels the
//! underlying work.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::error::CacheError;

type Slot<T> = Option<Result<T, Arc<CacheError>>>;

/// A value produced exactly once by a background task.
///
/// Once the handle completes, success or failure, every subsequent
/// [`Deferred::wait`] returns the same result without re-running anything.
pub struct Deferred<T> {
    rx: watch::Receiver<Slot<T>>,
}

impl<T: Clone + Send + Sync + 'static> Deferred<T> {
    /// Spawn `fut` and hand back the awaitable handle. The task runs to
    /// completion even when every awaiter goes away.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn spawn<F>(fut: F) -> Self
    where
        F: Future<Output = Result<T, CacheError>> + Send + 'static,
    {
        let (tx, rx) = watch::channel(None);
        tokio::spawn(async move {
            let result = fut.await.map_err(Arc::new);
            let _ = tx.send(Some(result));
        });
        Self { rx }
    }

    /// Suspend until the handle completes or `ctx` is cancelled, whichever
    /// comes first. Cancellation fails this wait only; the background task
    /// keeps running.
    pub async fn wait(&self, ctx: &CancellationToken) -> Result<T, Arc<CacheError>> {
        let mut rx = self.rx.clone();
        loop {
            if let Some(result) = rx.borrow_and_update().as_ref() {
                return result.clone();
            }
            tokio::select! {
                _ = ctx.cancelled() => return Err(Arc::new(CacheError::Cancelled)),
                changed = rx.changed() => {
                    if changed.is_err() {
                        // The initializer task died without reporting.
                        return Err(Arc::new(CacheError::Initialization(
                            "initializer task terminated before completing".to_string(),
                        )));
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_wait_returns_spawned_value() {
        let deferred = Deferred::spawn(async { Ok(7_u32) });
        let ctx = CancellationToken::new();

        assert_eq!(deferred.wait(&ctx).await.unwrap(), 7);
        // Completion is final; a second wait sees the same result.
        assert_eq!(deferred.wait(&ctx).await.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_failure_is_sticky() {
        let runs = Arc::new(AtomicUsize::new(0));
        let runs_clone = Arc::clone(&runs);

        let deferred: Deferred<u32> = Deferred::spawn(async move {
            runs_clone.fetch_add(1, Ordering::SeqCst);
            Err(CacheError::InvalidConfiguration("bad tier".into()))
        });

        let ctx = CancellationToken::new();
        assert!(deferred.wait(&ctx).await.is_err());
        assert!(deferred.wait(&ctx).await.is_err());
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancelled_awaiter_does_not_cancel_the_work() {
        let deferred = Deferred::spawn(async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            Ok(42_u32)
        });

        let cancelled = CancellationToken::new();
        cancelled.cancel();
        let err = deferred.wait(&cancelled).await.unwrap_err();
        assert!(matches!(*err, CacheError::Cancelled));

        // The background task finished on its own.
        let ctx = CancellationToken::new();
        assert_eq!(deferred.wait(&ctx).await.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_concurrent_waiters_observe_one_run() {
        let runs = Arc::new(AtomicUsize::new(0));
        let runs_clone = Arc::clone(&runs);

        let deferred = Arc::new(Deferred::spawn(async move {
            runs_clone.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok("ready".to_string())
        }));

        let mut handles = Vec::new();
        for _ in 0..32 {
            let deferred = Arc::clone(&deferred);
            handles.push(tokio::spawn(async move {
                deferred.wait(&CancellationToken::new()).await.unwrap()
            }));
        }

        for handle in handles {
            assert_eq!(handle.await.unwrap(), "ready");
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }
}
