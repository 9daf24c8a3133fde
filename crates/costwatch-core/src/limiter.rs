//! Bounded concurrency for backend calls.
//!
//! Callers beyond the limit wait in arrival order (the underlying semaphore is
//! fair) for at most the configured queue timeout, after which they fail with
//! `BackendUnavailable` instead of blocking forever.

use crate::error::{BackendCause, CostError, Result};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::timeout;
use tracing::{debug, warn};

/// FIFO concurrency limiter.
#[derive(Debug, Clone)]
pub struct ConcurrencyLimiter {
    semaphore: Arc<Semaphore>,
    max_concurrent: usize,
    queue_timeout: Duration,
}

impl ConcurrencyLimiter {
    /// Allows at most `max_concurrent` simultaneous calls; waiters give up after
    /// `queue_timeout`.
    #[must_use]
    pub fn new(max_concurrent: usize, queue_timeout: Duration) -> Self {
        let max_concurrent = max_concurrent.max(1);
        Self { semaphore: Arc::new(Semaphore::new(max_concurrent)), max_concurrent, queue_timeout }
    }

    /// Configured limit.
    #[must_use]
    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// Calls currently holding a slot.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.max_concurrent - self.semaphore.available_permits()
    }

    /// Runs `call` once a slot is free.
    ///
    /// # Errors
    /// Returns `BackendUnavailable` with cause `QueueTimeout` if no slot frees up
    /// in time, otherwise whatever `call` returns.
    pub async fn with_concurrency_limit<F, Fut, T>(&self, call: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let permit = match timeout(self.queue_timeout, self.semaphore.acquire()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_closed)) => {
                return Err(CostError::BackendUnavailable {
                    cause: BackendCause::Other,
                    message: "concurrency limiter closed".to_string(),
                    attempts: 0,
                });
            }
            Err(_elapsed) => {
                warn!(
                    limit = self.max_concurrent,
                    waited_ms = self.queue_timeout.as_millis() as u64,
                    "Timed out waiting for a backend slot"
                );
                return Err(CostError::BackendUnavailable {
                    cause: BackendCause::QueueTimeout,
                    message: format!(
                        "no backend slot free within {}ms",
                        self.queue_timeout.as_millis()
                    ),
                    attempts: 0,
                });
            }
        };

        debug!(in_flight = self.in_flight(), limit = self.max_concurrent, "Backend slot acquired");
        let result = call().await;
        drop(permit);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_limit_is_never_exceeded() {
        let limiter = ConcurrencyLimiter::new(2, Duration::from_secs(5));
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let limiter = limiter.clone();
                let current = Arc::clone(&current);
                let peak = Arc::clone(&peak);
                tokio::spawn(async move {
                    limiter
                        .with_concurrency_limit(|| async {
                            let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                            peak.fetch_max(now, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(20)).await;
                            current.fetch_sub(1, Ordering::SeqCst);
                            Ok(())
                        })
                        .await
                })
            })
            .collect();

        for task in tasks {
            task.await.unwrap().unwrap();
        }
        assert_eq!(peak.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_waiters_are_served_in_arrival_order() {
        let limiter = ConcurrencyLimiter::new(1, Duration::from_secs(5));
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut tasks = Vec::new();

        for i in 0..5 {
            let limiter = limiter.clone();
            let order = Arc::clone(&order);
            tasks.push(tokio::spawn(async move {
                limiter
                    .with_concurrency_limit(|| async {
                        order.lock().unwrap().push(i);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        Ok(())
                    })
                    .await
            }));
            // Stagger arrivals so the queue order is well defined.
            tokio::time::sleep(Duration::from_millis(2)).await;
        }

        for task in tasks {
            task.await.unwrap().unwrap();
        }
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_queue_wait_is_bounded() {
        let limiter = ConcurrencyLimiter::new(1, Duration::from_millis(20));
        let holder = limiter.clone();
        let slow = tokio::spawn(async move {
            holder
                .with_concurrency_limit(|| async {
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    Ok(())
                })
                .await
        });
        tokio::time::sleep(Duration::from_millis(5)).await;

        let err = limiter.with_concurrency_limit(|| async { Ok(()) }).await.unwrap_err();
        assert!(matches!(
            err,
            CostError::BackendUnavailable { cause: BackendCause::QueueTimeout, .. }
        ));
        slow.await.unwrap().unwrap();
    }
}
