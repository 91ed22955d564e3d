//! Bounded retry combinator for fail-fast lock attempts.

use fsqlite_error::Result;
use tracing::trace;

use crate::config::RetryPolicy;

/// Run `op` until it reports success or `policy.attempts` is exhausted.
///
/// `op` receives the zero-based attempt number and returns `Ok(true)` on
/// success, `Ok(false)` on contention. The delay is slept between attempts
/// only. An `Err` is returned immediately without further attempts.
pub fn retry<F>(policy: RetryPolicy, mut op: F) -> Result<bool>
where
    F: FnMut(u32) -> Result<bool>,
{
    for attempt in 0..policy.attempts {
        if attempt > 0 && !policy.delay.is_zero() {
            std::thread::sleep(policy.delay);
        }
        if op(attempt)? {
            return Ok(true);
        }
        trace!(
            target: "fsqlite_vfs::lock",
            attempt,
            attempts = policy.attempts,
            "lock attempt contended"
        );
    }
    Ok(false)
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use fsqlite_error::FrankenError;

    use super::*;

    #[test]
    fn test_retry_stops_on_success() {
        let mut calls = 0;
        let ok = retry(RetryPolicy::immediate(3), |attempt| {
            calls += 1;
            Ok(attempt == 1)
        })
        .unwrap();
        assert!(ok);
        assert_eq!(calls, 2);
    }

    #[test]
    fn test_retry_exhausts_exactly_attempts() {
        let mut calls = 0;
        let ok = retry(RetryPolicy::immediate(3), |_| {
            calls += 1;
            Ok(false)
        })
        .unwrap();
        assert!(!ok);
        assert_eq!(calls, 3);
    }

    #[test]
    fn test_retry_error_is_not_retried() {
        let mut calls = 0;
        let err = retry(RetryPolicy::immediate(3), |_| {
            calls += 1;
            Err(FrankenError::Io(std::io::Error::other("boom")))
        })
        .unwrap_err();
        assert!(matches!(err, FrankenError::Io(_)));
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_retry_zero_attempts_never_calls() {
        let mut calls = 0;
        let ok = retry(RetryPolicy::immediate(0), |_| {
            calls += 1;
            Ok(true)
        })
        .unwrap();
        assert!(!ok);
        assert_eq!(calls, 0);
    }

    #[test]
    fn test_retry_sleeps_between_attempts_only() {
        let policy = RetryPolicy::new(3, Duration::from_millis(5));
        let start = Instant::now();
        retry(policy, |_| Ok(false)).unwrap();
        // Two gaps between three attempts.
        assert!(start.elapsed() >= Duration::from_millis(10));
    }
}
