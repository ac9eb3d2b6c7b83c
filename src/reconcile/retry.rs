//! Retry combinators
//!
//! `retry_on_transient_state` handles the "resource is busy" answers Scaleway returns
//! while an object is mid-mutation: wait for it to settle, then try again.
//! `retry_on_error_kinds` retries a fixed set of error kinds on an interval (RDB database
//! creation racing its instance, for instance).

use super::wait::default_interval;
use crate::error::{Error, ErrorKind, Result};
use crate::provider::meta::Context;
use crate::scw::http::sleep_cancellable;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

/// Smallest pause between two transient-state attempts
const MIN_TRANSIENT_PAUSE: Duration = Duration::from_millis(100);

/// Run `action`; on a transient-state error run `waiter`, then try again.
///
/// Any other outcome of `action` is returned as is. Once the context deadline has passed
/// the last transient-state error is returned, even if the waiter itself timed out.
pub async fn retry_on_transient_state<T, A, AFut, W, WFut>(
    ctx: &Context,
    mut action: A,
    mut waiter: W,
) -> Result<T>
where
    A: FnMut() -> AFut,
    AFut: Future<Output = Result<T>>,
    W: FnMut() -> WFut,
    WFut: Future<Output = Result<()>>,
{
    let mut attempts = 0u32;
    loop {
        attempts += 1;
        let err = match action().await {
            Err(err) if err.is_transient() => err,
            other => return other,
        };

        if ctx.is_expired() {
            return Err(err);
        }
        tracing::debug!("transient state (attempt {}): {}", attempts, err);

        match waiter().await {
            Ok(()) => {}
            Err(wait_err) if wait_err.kind() == ErrorKind::Timeout => return Err(err),
            Err(wait_err) => return Err(wait_err),
        }

        if ctx.is_expired() {
            return Err(err);
        }

        let pause = default_interval().max(MIN_TRANSIENT_PAUSE);
        let pause = ctx.remaining().map_or(pause, |left| pause.min(left));
        if !sleep_cancellable(ctx.cancel_token(), pause).await {
            return Err(Error::Cancelled {
                what: "transient state retry".into(),
                last: Some(err.to_string()),
            });
        }
    }
}

/// Retry `action` while its error kind is one of `kinds`, for at most `timeout`.
pub async fn retry_on_error_kinds<T, A, AFut>(
    ctx: &Context,
    kinds: &[ErrorKind],
    timeout: Duration,
    interval: Duration,
    mut action: A,
) -> Result<T>
where
    A: FnMut() -> AFut,
    AFut: Future<Output = Result<T>>,
{
    let mut deadline = Instant::now() + timeout;
    if let Some(ctx_deadline) = ctx.deadline() {
        deadline = deadline.min(ctx_deadline);
    }

    loop {
        let err = match action().await {
            Err(err) if kinds.contains(&err.kind()) => err,
            other => return other,
        };

        let now = Instant::now();
        if now >= deadline {
            return Err(err);
        }
        tracing::debug!("retrying after {}: {}", err.kind(), err);

        let pause = interval.min(deadline - now);
        if !sleep_cancellable(ctx.cancel_token(), pause).await {
            return Err(Error::Cancelled {
                what: "retry".into(),
                last: Some(err.to_string()),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn transient() -> Error {
        Error::transient("instance", "initializing")
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_then_ok() {
        let calls = Arc::new(AtomicU32::new(0));
        let ctx = Context::default().with_timeout(Duration::from_secs(60));
        let counter = calls.clone();
        let out = retry_on_transient_state(
            &ctx,
            move || {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(transient())
                    } else {
                        Ok("ok")
                    }
                }
            },
            || async { Ok(()) },
        )
        .await
        .unwrap();
        assert_eq!(out, "ok");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_forever_surfaces_at_deadline() {
        let ctx = Context::default().with_timeout(Duration::from_secs(30));
        let start = Instant::now();
        let err = retry_on_transient_state(
            &ctx,
            || async { Err::<(), _>(transient()) },
            || async { Ok(()) },
        )
        .await
        .unwrap_err();
        assert!(err.is_transient());
        assert!(start.elapsed() >= Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_other_errors_are_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let ctx = Context::default();
        let err = retry_on_transient_state(
            &ctx,
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(Error::InvalidArgument("bad".into())) }
            },
            || async { Ok(()) },
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_on_conflict_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let ctx = Context::default();
        let out = retry_on_error_kinds(
            &ctx,
            &[ErrorKind::Conflict],
            Duration::from_secs(60),
            Duration::from_secs(5),
            move || {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        Err(Error::Api(crate::error::ApiError {
                            status: 409,
                            method: "POST".into(),
                            url: "u".into(),
                            body: Default::default(),
                        }))
                    } else {
                        Ok(n)
                    }
                }
            },
        )
        .await
        .unwrap();
        assert_eq!(out, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_on_error_kinds_gives_up() {
        let ctx = Context::default();
        let start = Instant::now();
        let err = retry_on_error_kinds(
            &ctx,
            &[ErrorKind::TransientState],
            Duration::from_secs(10),
            Duration::from_secs(3),
            || async { Err::<(), _>(transient()) },
        )
        .await
        .unwrap_err();
        assert!(err.is_transient());
        assert_eq!(start.elapsed(), Duration::from_secs(10));
    }
}
