//! Dispatch pacing and bounded retry with exponential backoff.

use outreach_core::config::SchedulerConfig;
use outreach_core::error::{OutreachError, Result};
use outreach_core::{OutboundMessage, Transport};
use std::time::Duration;
use tokio::time::Instant;

/// How many times a send is attempted and how long to wait in between.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, at least 1.
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
        }
    }

    pub fn from_config(config: &SchedulerConfig) -> Self {
        Self::new(config.max_attempts, config.backoff_base())
    }

    /// Wait after the failed attempt `attempt_index` (0-based): `base * 2^index`.
    pub fn delay_for(&self, attempt_index: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt_index).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor)
    }
}

/// Fixed minimum spacing between consecutive transport calls within a pass.
#[derive(Debug)]
pub struct RateLimiter {
    spacing: Option<Duration>,
    last: Option<Instant>,
}

impl RateLimiter {
    /// `None` disables pacing.
    pub fn new(spacing: Option<Duration>) -> Self {
        Self {
            spacing,
            last: None,
        }
    }

    /// Sleep until the next call is allowed, then claim the slot.
    pub async fn acquire(&mut self) {
        if let (Some(spacing), Some(last)) = (self.spacing, self.last) {
            tokio::time::sleep_until(last + spacing).await;
        }
        self.last = Some(Instant::now());
    }
}

/// Result of dispatching one message through the retry loop.
#[derive(Debug)]
pub struct Delivery {
    /// Provider message id on success, last error otherwise.
    pub result: Result<Option<String>>,
    pub attempts: u32,
}

/// Send with pacing and backoff. Recipient-scoped errors are retried and the
/// last attempt's error is terminal; any other error ends the loop at once. A
/// backoff that would overrun `deadline` ends the loop instead.
pub async fn send_with_retry(
    transport: &dyn Transport,
    message: &OutboundMessage,
    policy: &RetryPolicy,
    limiter: &mut RateLimiter,
    deadline: Option<Instant>,
) -> Delivery {
    let mut last_err = OutreachError::Transport("no attempt made".into());

    for attempt in 0..policy.max_attempts {
        limiter.acquire().await;
        match transport.send(message).await {
            Ok(id) => {
                return Delivery {
                    result: Ok(id),
                    attempts: attempt + 1,
                };
            }
            Err(e) if !e.is_recipient_scoped() => {
                return Delivery {
                    result: Err(e),
                    attempts: attempt + 1,
                };
            }
            Err(e) => {
                tracing::warn!(
                    "⚠️ {} send to {} failed (attempt {}/{}): {e}",
                    transport.name(),
                    message.to,
                    attempt + 1,
                    policy.max_attempts
                );
                last_err = e;
            }
        }

        if attempt + 1 >= policy.max_attempts {
            return Delivery {
                result: Err(last_err),
                attempts: attempt + 1,
            };
        }

        let delay = policy.delay_for(attempt);
        if deadline.is_some_and(|d| Instant::now() + delay > d) {
            tracing::warn!("⏱️ Pass deadline reached, giving up on {} after {} attempt(s)", message.to, attempt + 1);
            return Delivery {
                result: Err(last_err),
                attempts: attempt + 1,
            };
        }
        tokio::time::sleep(delay).await;
    }

    Delivery {
        result: Err(last_err),
        attempts: policy.max_attempts,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Fails the first `fail_first` calls, then succeeds.
    struct Flaky {
        fail_first: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl Transport for Flaky {
        fn name(&self) -> &str {
            "flaky"
        }

        async fn send(&self, _message: &OutboundMessage) -> Result<Option<String>> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first {
                Err(OutreachError::Transport(format!("boom {n}")))
            } else {
                Ok(Some(format!("msg-{n}")))
            }
        }
    }

    fn msg() -> OutboundMessage {
        OutboundMessage::new("a@example.com", "s", "b")
    }

    #[test]
    fn test_backoff_doubles() {
        let p = RetryPolicy::new(5, Duration::from_millis(100));
        assert_eq!(p.delay_for(0), Duration::from_millis(100));
        assert_eq!(p.delay_for(1), Duration::from_millis(200));
        assert_eq!(p.delay_for(3), Duration::from_millis(800));
    }

    #[test]
    fn test_backoff_saturates() {
        let p = RetryPolicy::new(5, Duration::from_secs(1));
        assert!(p.delay_for(40) >= Duration::from_secs(u32::MAX as u64));
    }

    #[test]
    fn test_at_least_one_attempt() {
        assert_eq!(RetryPolicy::new(0, Duration::ZERO).max_attempts, 1);
    }

    #[tokio::test]
    async fn test_recovers_within_budget() {
        let t = Flaky { fail_first: 2, calls: AtomicU32::new(0) };
        let policy = RetryPolicy::new(3, Duration::from_millis(1));
        let mut limiter = RateLimiter::new(None);
        let d = send_with_retry(&t, &msg(), &policy, &mut limiter, None).await;
        assert_eq!(d.attempts, 3);
        assert_eq!(d.result.unwrap().as_deref(), Some("msg-2"));
    }

    #[tokio::test]
    async fn test_exhausts_budget() {
        let t = Flaky { fail_first: u32::MAX, calls: AtomicU32::new(0) };
        let policy = RetryPolicy::new(3, Duration::from_millis(1));
        let mut limiter = RateLimiter::new(None);
        let d = send_with_retry(&t, &msg(), &policy, &mut limiter, None).await;
        assert_eq!(d.attempts, 3);
        assert_eq!(t.calls.load(Ordering::SeqCst), 3);
        assert!(d.result.unwrap_err().to_string().contains("boom 2"));
    }

    #[tokio::test]
    async fn test_deadline_cuts_backoff() {
        let t = Flaky { fail_first: u32::MAX, calls: AtomicU32::new(0) };
        let policy = RetryPolicy::new(5, Duration::from_secs(30));
        let mut limiter = RateLimiter::new(None);
        let deadline = Some(Instant::now() + Duration::from_millis(50));
        let d = send_with_retry(&t, &msg(), &policy, &mut limiter, deadline).await;
        assert_eq!(d.attempts, 1);
        assert!(d.result.is_err());
    }

    struct Misconfigured {
        calls: AtomicU32,
    }

    #[async_trait]
    impl Transport for Misconfigured {
        fn name(&self) -> &str {
            "misconfigured"
        }

        async fn send(&self, _message: &OutboundMessage) -> Result<Option<String>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(OutreachError::Config("sender address rejected at startup".into()))
        }
    }

    #[tokio::test]
    async fn test_non_recipient_error_not_retried() {
        let t = Misconfigured { calls: AtomicU32::new(0) };
        let policy = RetryPolicy::new(3, Duration::from_millis(1));
        let mut limiter = RateLimiter::new(None);
        let d = send_with_retry(&t, &msg(), &policy, &mut limiter, None).await;
        assert_eq!(d.attempts, 1);
        assert_eq!(t.calls.load(Ordering::SeqCst), 1);
        assert!(matches!(d.result, Err(OutreachError::Config(_))));
    }

    #[tokio::test]
    async fn test_rate_limiter_spacing() {
        let mut limiter = RateLimiter::new(Some(Duration::from_millis(20)));
        let start = Instant::now();
        for _ in 0..3 {
            limiter.acquire().await;
        }
        // First call is free, the next two wait one spacing each
        assert!(start.elapsed() >= Duration::from_millis(40));
    }
}
