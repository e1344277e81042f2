//! Test utilities for p2p-usbredir
//!
//! Timeout and polling helpers shared by the async test suites of every crate.
//!
//! # Example
//!
//! ```
//! use common::test_utils::{with_timeout, DEFAULT_TEST_TIMEOUT};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let value = with_timeout(DEFAULT_TEST_TIMEOUT, async { 42 }).await.unwrap();
//! assert_eq!(value, 42);
//! # }
//! ```

use std::future::Future;
use std::time::Duration;

/// Default test timeout (5 seconds)
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Interval between checks in [`wait_until`]
const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Run a future with a timeout
///
/// Prevents a wedged channel or lost completion from hanging the test suite.
pub async fn with_timeout<T, F>(duration: Duration, future: F) -> Result<T, TimeoutError>
where
    F: Future<Output = T>,
{
    tokio::time::timeout(duration, future)
        .await
        .map_err(|_| TimeoutError { duration })
}

/// Poll a condition until it holds or the timeout elapses
///
/// Used for effects produced on another thread (e.g. the USB event pump)
/// that have no completion to await.
pub async fn wait_until<F>(duration: Duration, mut condition: F) -> Result<(), TimeoutError>
where
    F: FnMut() -> bool,
{
    with_timeout(duration, async {
        while !condition() {
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    })
    .await
}

/// Error returned when a test times out
#[derive(Debug)]
pub struct TimeoutError {
    /// The timeout duration that was exceeded
    pub duration: Duration,
}

impl std::fmt::Display for TimeoutError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Test timed out after {:?}", self.duration)
    }
}

impl std::error::Error for TimeoutError {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[tokio::test]
    async fn test_with_timeout_success() {
        let result = with_timeout(DEFAULT_TEST_TIMEOUT, async { 42 }).await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_with_timeout_failure() {
        let result = with_timeout(Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            42
        })
        .await;

        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_wait_until_sees_flag_from_thread() {
        let flag = Arc::new(AtomicBool::new(false));
        let setter = flag.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            setter.store(true, Ordering::SeqCst);
        });

        let result = wait_until(DEFAULT_TEST_TIMEOUT, || flag.load(Ordering::SeqCst)).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_wait_until_times_out() {
        let result = wait_until(Duration::from_millis(20), || false).await;
        assert!(result.is_err());
    }
}
