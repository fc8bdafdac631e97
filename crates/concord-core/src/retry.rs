use std::future::Future;
use std::time::Duration;

use concord_types::ConcordError;

/// Fixed-delay retry of optimistic updates that lost a race.
///
/// Only retryable errors (`ConcurrentModification`, `Locked`) are retried;
/// anything else is returned at once. `max_retries == None` retries until
/// the operation succeeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub delay: Duration,
    pub max_retries: Option<u32>,
}

impl RetryPolicy {
    pub fn new(delay: Duration, max_retries: Option<u32>) -> Self {
        RetryPolicy { delay, max_retries }
    }

    pub async fn run<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T, ConcordError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ConcordError>>,
    {
        let mut attempt: u32 = 0;
        loop {
            match op().await {
                Err(e) if e.is_retryable() && self.max_retries.map_or(true, |max| attempt < max) => {
                    attempt += 1;
                    tracing::debug!(op = what, attempt, error = %e, "retrying after conflict");
                    tokio::time::sleep(self.delay).await;
                }
                other => return other,
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy { delay: Duration::from_millis(50), max_retries: None }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn retries_conflicts_until_success() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let policy = RetryPolicy::default();
        let result = policy
            .run("test", move || async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 3 {
                    Err(ConcordError::ConcurrentModification)
                } else {
                    Ok(7)
                }
            })
            .await;
        assert_eq!(result, Ok(7));
        assert_eq!(counter.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn bounded_retries_give_up() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let policy = RetryPolicy::new(Duration::from_millis(10), Some(2));
        let result: Result<(), _> = policy
            .run("test", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ConcordError::Locked)
            })
            .await;
        assert_eq!(result, Err(ConcordError::Locked));
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn other_errors_are_not_retried() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<(), _> = RetryPolicy::default()
            .run("test", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ConcordError::Timeout)
            })
            .await;
        assert_eq!(result, Err(ConcordError::Timeout));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
