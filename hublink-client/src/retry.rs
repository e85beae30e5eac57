//! Bounded retry for transient transport failures. Retries absorb flaky
//! adapter/radio behavior during scan and connect; they are not used for
//! program transfer, where a half-written program is not resumable.

use std::future::Future;
use std::time::Duration;

pub(crate) const DEFAULT_ATTEMPTS: usize = 3;
pub(crate) const DEFAULT_DELAY: Duration = Duration::from_millis(500);

/// Run `action` up to `attempts` times, sleeping `delay` between attempts.
/// Any `Err` is retryable; the last one is surfaced unchanged.
pub async fn retry<T, E, F, Fut>(attempts: usize, delay: Duration, action: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    retry_with_cleanup(attempts, delay, action, || async {}).await
}

/// Like [`retry`], but runs `cleanup` unconditionally after each failed
/// attempt (except the last) to release partially-acquired transport
/// resources, e.g. a half-open scan.
pub async fn retry_with_cleanup<T, E, F, Fut, C, CFut>(
    attempts: usize,
    delay: Duration,
    mut action: F,
    mut cleanup: C,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    C: FnMut() -> CFut,
    CFut: Future<Output = ()>,
{
    let mut attempt = 1;
    loop {
        match action().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt >= attempts => return Err(e),
            Err(_) => {
                tracing::debug!("attempt {attempt} of {attempts} failed, retrying");
                cleanup().await;
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

/// Like [`retry_with_cleanup`], but also runs `cleanup` once after the
/// final failed attempt. For actions whose half-acquired state would
/// otherwise outlive the loop, e.g. an adapter left scanning.
pub async fn retry_with_final_cleanup<T, E, F, Fut, C, CFut>(
    attempts: usize,
    delay: Duration,
    action: F,
    mut cleanup: C,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    C: FnMut() -> CFut,
    CFut: Future<Output = ()>,
{
    let result = retry_with_cleanup(attempts, delay, action, &mut cleanup).await;
    if result.is_err() {
        cleanup().await;
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::{Cell, RefCell};

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let calls = Cell::new(0);
        let result: Result<u32, &str> = retry(3, Duration::from_millis(1), || {
            calls.set(calls.get() + 1);
            let n = calls.get();
            async move { if n < 3 { Err("radio glitch") } else { Ok(42) } }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.get(), 3);
    }

    #[tokio::test]
    async fn surfaces_last_error_after_exhaustion() {
        let calls = Cell::new(0);
        let result: Result<(), u32> = retry(3, Duration::from_millis(1), || {
            calls.set(calls.get() + 1);
            let n = calls.get();
            async move { Err(n) }
        })
        .await;
        assert_eq!(result.unwrap_err(), 3);
        assert_eq!(calls.get(), 3);
    }

    #[tokio::test]
    async fn cleanup_runs_between_attempts() {
        let log = RefCell::new(Vec::new());
        let result: Result<(), &str> = retry_with_cleanup(
            2,
            Duration::from_millis(1),
            || {
                log.borrow_mut().push("action");
                async { Err("nope") }
            },
            || {
                log.borrow_mut().push("cleanup");
                async {}
            },
        )
        .await;
        assert!(result.is_err());
        // no cleanup after the final attempt
        assert_eq!(*log.borrow(), vec!["action", "cleanup", "action"]);
    }

    #[tokio::test]
    async fn final_cleanup_runs_after_exhaustion() {
        let log = RefCell::new(Vec::new());
        let result: Result<(), &str> = retry_with_final_cleanup(
            2,
            Duration::from_millis(1),
            || {
                log.borrow_mut().push("action");
                async { Err("nope") }
            },
            || {
                log.borrow_mut().push("cleanup");
                async {}
            },
        )
        .await;
        assert!(result.is_err());
        assert_eq!(*log.borrow(), vec!["action", "cleanup", "action", "cleanup"]);
    }

    #[tokio::test]
    async fn final_cleanup_variant_skips_cleanup_on_success() {
        let cleaned = Cell::new(false);
        let result: Result<u32, &str> = retry_with_final_cleanup(
            3,
            Duration::from_millis(1),
            || async { Ok(7) },
            || {
                cleaned.set(true);
                async {}
            },
        )
        .await;
        assert_eq!(result.unwrap(), 7);
        assert!(!cleaned.get());
    }

    #[tokio::test]
    async fn success_skips_cleanup() {
        let cleaned = Cell::new(false);
        let result: Result<u32, &str> = retry_with_cleanup(
            3,
            Duration::from_millis(1),
            || async { Ok(7) },
            || {
                cleaned.set(true);
                async {}
            },
        )
        .await;
        assert_eq!(result.unwrap(), 7);
        assert!(!cleaned.get());
    }
}
