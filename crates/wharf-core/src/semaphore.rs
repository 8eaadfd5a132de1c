//! Resizable counting semaphore
//!
//! Like a normal async semaphore, but the limit can change at runtime:
//! providers announce their worker pool size after connecting and may shrink
//! or grow it at any time. When the limit drops below the current count,
//! existing holders stay valid and new acquires wait until enough permits
//! drain back.

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// Returned when an acquire was aborted by the lifetime token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("semaphore acquire aborted: lifetime cancelled")]
pub struct AcquireCancelled;

#[derive(Debug)]
struct State {
    count: usize,
    limit: usize,
}

/// Counting semaphore with a dynamic limit.
#[derive(Debug)]
pub struct ResizableSemaphore {
    state: Mutex<State>,
    notify: Notify,
}

impl ResizableSemaphore {
    pub fn new(limit: usize) -> Self {
        Self {
            state: Mutex::new(State { count: 0, limit }),
            notify: Notify::new(),
        }
    }

    /// Acquire `n` permits, waiting until `count + n <= limit` or the token
    /// is cancelled.
    pub async fn acquire(&self, n: usize, token: &CancellationToken) -> Result<(), AcquireCancelled> {
        loop {
            // register interest before checking, so a release between the
            // check and the await cannot be lost
            let notified = self.notify.notified();
            tokio::pin!(notified);
            {
                let mut state = self.state.lock();
                if state.count + n <= state.limit {
                    state.count += n;
                    return Ok(());
                }
                notified.as_mut().enable();
            }
            tokio::select! {
                _ = &mut notified => {}
                _ = token.cancelled() => return Err(AcquireCancelled),
            }
        }
    }

    /// Acquire `n` permits only if they are available right now.
    pub fn try_acquire(&self, n: usize) -> bool {
        let mut state = self.state.lock();
        if state.count + n <= state.limit {
            state.count += n;
            true
        } else {
            false
        }
    }

    /// Release `n` permits.
    pub fn release(&self, n: usize) {
        {
            let mut state = self.state.lock();
            state.count = state.count.saturating_sub(n);
        }
        // wake all waiters; those still over the limit re-park
        self.notify.notify_waiters();
    }

    /// Change the limit. Growing wakes waiters; shrinking below the current
    /// count lets existing holders drain naturally.
    pub fn set_limit(&self, limit: usize) {
        {
            let mut state = self.state.lock();
            state.limit = limit;
        }
        self.notify.notify_waiters();
    }

    /// Currently held permits.
    pub fn count(&self) -> usize {
        self.state.lock().count
    }

    /// Currently configured limit.
    pub fn limit(&self) -> usize {
        self.state.lock().limit
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_acquire_up_to_limit() {
        let sem = ResizableSemaphore::new(2);
        let token = CancellationToken::new();
        sem.acquire(1, &token).await.unwrap();
        sem.acquire(1, &token).await.unwrap();
        assert_eq!(sem.count(), 2);
        assert!(!sem.try_acquire(1));
    }

    #[tokio::test]
    async fn test_release_unblocks_waiter() {
        let sem = Arc::new(ResizableSemaphore::new(1));
        let token = CancellationToken::new();
        sem.acquire(1, &token).await.unwrap();

        let waiter = {
            let sem = sem.clone();
            let token = token.clone();
            tokio::spawn(async move { sem.acquire(1, &token).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        sem.release(1);
        waiter.await.unwrap().unwrap();
        assert_eq!(sem.count(), 1);
    }

    #[tokio::test]
    async fn test_set_limit_grow_unblocks() {
        let sem = Arc::new(ResizableSemaphore::new(0));
        let token = CancellationToken::new();

        let waiter = {
            let sem = sem.clone();
            let token = token.clone();
            tokio::spawn(async move { sem.acquire(1, &token).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        sem.set_limit(4);
        waiter.await.unwrap().unwrap();
        assert_eq!(sem.count(), 1);
        assert_eq!(sem.limit(), 4);
    }

    #[tokio::test]
    async fn test_shrink_below_count_keeps_holders() {
        let sem = ResizableSemaphore::new(3);
        let token = CancellationToken::new();
        sem.acquire(3, &token).await.unwrap();

        sem.set_limit(1);
        assert_eq!(sem.count(), 3);
        assert!(!sem.try_acquire(1));

        // drain: new admissions only once count < limit again
        sem.release(1);
        assert!(!sem.try_acquire(1), "2 held, limit 1");
        sem.release(2);
        assert!(sem.try_acquire(1));
        assert_eq!(sem.count(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_acquire_returns_error() {
        let sem = Arc::new(ResizableSemaphore::new(0));
        let token = CancellationToken::new();

        let waiter = {
            let sem = sem.clone();
            let token = token.clone();
            tokio::spawn(async move { sem.acquire(1, &token).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        token.cancel();
        assert_eq!(waiter.await.unwrap(), Err(AcquireCancelled));
        assert_eq!(sem.count(), 0);
    }
}
