//! Fail-open helper for best-effort steps
//!
//! Some kernel steps must never decide the outcome of a goal: the closing
//! summary, the abort issued after a run deadline, the controller call that
//! writes a prompt for an unknown role. Those go through [`fail_open`].
//!
//! DO NOT use fail-open for:
//! - Plan acquisition
//! - Task attempts
//! - Mailbox operations

use std::future::Future;
use tracing::warn;

use crate::Result;

/// Run an operation whose failure is logged and swallowed
///
/// Logs the error via `tracing::warn!` and returns `None` on failure.
///
/// ```no_run
/// use troupe_core::fail_open::fail_open;
/// use troupe_core::Result;
///
/// async fn summarize() -> Result<String> {
///     Ok("two tasks done".to_string())
/// }
///
/// async fn example() {
///     let summary = fail_open("goal_summary", || summarize()).await;
///     // summary is None if summarize() failed
/// }
/// ```
pub async fn fail_open<F, Fut, T>(operation_name: &str, f: F) -> Option<T>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    match f().await {
        Ok(val) => Some(val),
        Err(e) => {
            warn!("{} failed (fail-open): {}", operation_name, e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TroupeError;

    #[tokio::test]
    async fn test_fail_open_success() {
        let result = fail_open("test_op", || async { Ok::<_, TroupeError>(42) }).await;
        assert_eq!(result, Some(42));
    }

    #[tokio::test]
    async fn test_fail_open_failure() {
        let result = fail_open("test_op", || async {
            Err::<i32, _>(TroupeError::Runtime("controller offline".to_string()))
        })
        .await;
        assert_eq!(result, None);
    }
}
