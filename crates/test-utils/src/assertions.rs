//! Polling assertions for async tests.

use std::time::Duration;

use tokio::time::{Instant, sleep};

/// Default polling interval for [`assert_eventually`].
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Polls `condition` until it holds or `timeout` elapses.
///
/// Returns whether the condition held. Use it for effects of background
/// tasks (expiry sweeps, cleanup) instead of fixed sleeps.
///
/// # Example
///
/// ```no_run
/// use std::time::Duration;
/// use keel_test_utils::assert_eventually;
///
/// # async fn example(swept: impl Fn() -> bool) {
/// assert!(assert_eventually(Duration::from_secs(1), || swept()).await);
/// # }
/// ```
pub async fn assert_eventually<F>(timeout: Duration, condition: F) -> bool
where
    F: Fn() -> bool,
{
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        sleep(DEFAULT_POLL_INTERVAL).await;
    }
}
