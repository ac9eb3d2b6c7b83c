//! Wait engine
//!
//! One polling combinator drives every resource to a terminal status. Kinds only supply
//! a poll function and a classifier mapping the remote status to a [`Phase`].
//!
//! ```text
//! create:  absent -> pending -> ready
//!          absent -> error
//!          absent -> pending -> not-found   (fatal)
//! update:  ready  -> pending -> ready
//! delete:  ready  -> pending -> not-found   (success at any point)
//! ```

use crate::error::{Error, Result};
use crate::provider::meta::Context;
use crate::scw::http::sleep_cancellable;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;

/// Interval used when neither the caller nor the configuration sets one
pub const DEFAULT_WAIT_INTERVAL: Duration = Duration::from_secs(5);

/// Lower bound applied to intervals coming from configuration
pub const MIN_CONFIGURED_INTERVAL: Duration = Duration::from_secs(2);

static WAIT_INTERVAL_MS: AtomicU64 = AtomicU64::new(DEFAULT_WAIT_INTERVAL.as_millis() as u64);

/// Process-wide default poll interval
pub fn default_interval() -> Duration {
    Duration::from_millis(WAIT_INTERVAL_MS.load(Ordering::Relaxed))
}

/// Override the default poll interval; tests may set it to zero
pub fn set_default_interval(interval: Duration) {
    WAIT_INTERVAL_MS.store(interval.as_millis() as u64, Ordering::Relaxed);
}

/// Interval actually used for a configured value
pub fn configured_interval(interval: Duration) -> Duration {
    interval.max(MIN_CONFIGURED_INTERVAL)
}

/// Set the default poll interval from user configuration
pub fn set_configured_interval(interval: Duration) {
    set_default_interval(configured_interval(interval));
}

/// Classification of one observed remote status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Pending,
    Ready,
    Failed,
    NotFound,
}

/// What the caller is waiting for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    /// A ready object; not-found is fatal
    Ready,
    /// The object to disappear; not-found is success
    Gone,
}

#[derive(Debug, Clone)]
pub struct WaitOptions {
    /// Used in error messages and logs
    pub what: String,
    pub target: Target,
    /// Further bounds the context deadline
    pub timeout: Option<Duration>,
    pub interval: Option<Duration>,
}

impl WaitOptions {
    pub fn new(what: impl Into<String>, target: Target) -> Self {
        Self {
            what: what.into(),
            target,
            timeout: None,
            interval: None,
        }
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = Some(interval);
        self
    }
}

/// Poll until the object reaches a terminal phase or the deadline passes.
///
/// `poll` returning a not-found error counts as [`Phase::NotFound`]; any other error
/// aborts the wait. `classify` returns the phase plus the status label reported in
/// timeout and cancellation errors.
///
/// Returns the last observed object when the target is reached, `None` when the target
/// is [`Target::Gone`] and the object disappeared.
pub async fn wait_for<T, P, Fut, C>(
    ctx: &Context,
    options: WaitOptions,
    mut poll: P,
    classify: C,
) -> Result<Option<T>>
where
    P: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
    C: Fn(&T) -> (Phase, String),
{
    let interval = options.interval.unwrap_or_else(default_interval);
    let deadline = match (ctx.deadline(), options.timeout) {
        (Some(d), Some(t)) => Some(d.min(Instant::now() + t)),
        (Some(d), None) => Some(d),
        (None, Some(t)) => Some(Instant::now() + t),
        (None, None) => None,
    };

    let mut last: Option<String> = None;
    let mut polls = 0u32;

    loop {
        if ctx.is_cancelled() {
            return Err(Error::Cancelled {
                what: options.what,
                last,
            });
        }

        polls += 1;
        let observed = match poll().await {
            Ok(obj) => {
                let (phase, status) = classify(&obj);
                Some((phase, status, obj))
            }
            Err(err) if err.is_not_found() => None,
            Err(err) => return Err(err),
        };

        match observed {
            None => {
                tracing::debug!("wait {}: not found after {} polls", options.what, polls);
                return match options.target {
                    Target::Gone => Ok(None),
                    Target::Ready => Err(Error::NotFound(options.what)),
                };
            }
            Some((Phase::NotFound, status, _)) => {
                tracing::debug!("wait {}: {} (gone) after {} polls", options.what, status, polls);
                return match options.target {
                    Target::Gone => Ok(None),
                    Target::Ready => Err(Error::NotFound(options.what)),
                };
            }
            Some((Phase::Failed, status, _)) => {
                return Err(Error::ErrorState {
                    what: options.what,
                    status,
                });
            }
            Some((Phase::Ready, status, obj)) if options.target == Target::Ready => {
                tracing::debug!("wait {}: {} after {} polls", options.what, status, polls);
                return Ok(Some(obj));
            }
            Some((_, status, _)) => {
                tracing::trace!("wait {}: still {}", options.what, status);
                last = Some(status);
            }
        }

        let pause = match deadline {
            Some(deadline) => {
                let now = Instant::now();
                if now >= deadline {
                    return Err(Error::Timeout {
                        what: options.what,
                        last,
                    });
                }
                interval.min(deadline - now)
            }
            None => interval,
        };

        if !sleep_cancellable(ctx.cancel_token(), pause).await {
            return Err(Error::Cancelled {
                what: options.what,
                last,
            });
        }
    }
}

/// Classifier for objects whose status is a string field
pub fn classify_status<'a>(
    field: &'a str,
    phase: fn(&str) -> Phase,
) -> impl Fn(&serde_json::Value) -> (Phase, String) + 'a {
    move |obj| {
        let status = obj
            .get(field)
            .and_then(|s| s.as_str())
            .unwrap_or("unknown")
            .to_string();
        (phase(&status), status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::sync::Arc;

    fn by_label(s: &&'static str) -> (Phase, String) {
        let phase = match *s {
            "ready" => Phase::Ready,
            "error" => Phase::Failed,
            "deleted" => Phase::NotFound,
            _ => Phase::Pending,
        };
        (phase, s.to_string())
    }

    fn scripted(
        script: Vec<Result<&'static str>>,
    ) -> (Arc<AtomicU32>, impl FnMut() -> std::future::Ready<Result<&'static str>>) {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let mut script = script.into_iter();
        let poll = move || {
            counter.fetch_add(1, Ordering::SeqCst);
            std::future::ready(script.next().unwrap_or(Ok("pending")))
        };
        (calls, poll)
    }

    fn options(target: Target) -> WaitOptions {
        WaitOptions::new("thing", target).interval(Duration::from_secs(1))
    }

    #[tokio::test(start_paused = true)]
    async fn test_ready_after_three_polls() {
        let (calls, poll) = scripted(vec![Ok("pending"), Ok("pending"), Ok("ready")]);
        let ctx = Context::default().with_timeout(Duration::from_secs(60));
        let out = wait_for(&ctx, options(Target::Ready), poll, by_label)
            .await
            .unwrap();
        assert_eq!(out, Some("ready"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_exactly_at_deadline() {
        let (_, poll) = scripted(vec![]);
        let ctx = Context::default().with_timeout(Duration::from_secs(5));
        let start = Instant::now();
        let err = wait_for(
            &ctx,
            WaitOptions::new("thing", Target::Ready).interval(Duration::from_secs(2)),
            poll,
            by_label,
        )
        .await
        .unwrap_err();
        assert_eq!(start.elapsed(), Duration::from_secs(5));
        match err {
            Error::Timeout { last, .. } => assert_eq!(last.as_deref(), Some("pending")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_not_found_depends_on_target() {
        let not_found = || Err(Error::NotFound("thing".into()));
        let (_, poll) = scripted(vec![not_found()]);
        let ctx = Context::default().with_timeout(Duration::from_secs(60));
        assert_eq!(
            wait_for(&ctx, options(Target::Gone), poll, by_label)
                .await
                .unwrap(),
            None
        );

        let (_, poll) = scripted(vec![not_found()]);
        let err = wait_for(&ctx, options(Target::Ready), poll, by_label)
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test(start_paused = true)]
    async fn test_error_status_is_fatal() {
        let (_, poll) = scripted(vec![Ok("pending"), Ok("error")]);
        let ctx = Context::default();
        let err = wait_for(&ctx, options(Target::Ready), poll, by_label)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ErrorState { ref status, .. } if status == "error"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_gone_waits_through_ready() {
        let (calls, poll) = scripted(vec![Ok("ready"), Ok("deleting"), Ok("deleted")]);
        let ctx = Context::default();
        let out = wait_for(&ctx, options(Target::Gone), poll, by_label)
            .await
            .unwrap();
        assert_eq!(out, None);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_reports_last_status() {
        let ctx = Context::default();
        let token = ctx.cancel_token().clone();
        let (_, poll) = scripted(vec![Ok("provisioning")]);
        let handle = tokio::spawn(async move {
            wait_for(&ctx, options(Target::Ready), poll, by_label).await
        });
        tokio::time::sleep(Duration::from_millis(1500)).await;
        token.cancel();
        let err = handle.await.unwrap().unwrap_err();
        match err {
            Error::Cancelled { last, .. } => assert!(last.is_some()),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_ready_on_first_poll_never_sleeps() {
        let (calls, poll) = scripted(vec![Ok("ready")]);
        let ctx = Context::default();
        let out = tokio_test::block_on(wait_for(&ctx, options(Target::Ready), poll, by_label));
        assert_eq!(out.unwrap(), Some("ready"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_configured_interval_is_clamped() {
        assert_eq!(
            configured_interval(Duration::from_millis(10)),
            Duration::from_secs(2)
        );
        assert_eq!(
            configured_interval(Duration::from_secs(30)),
            Duration::from_secs(30)
        );
    }
}
