//! Retry policies for node execution.
//!
//! The executor evaluates a node's policies in order and uses the first one
//! whose predicate accepts the current error. Interrupt errors are never
//! retried, whatever the predicate says. Retry delays are clamped to the
//! step deadline: a delay that would overshoot it fails the task immediately
//! with the underlying error.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;

use crate::node::NodeError;

/// Default attempt budget for [`RetryPolicy::exponential`].
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
/// Default wall-clock budget across all attempts.
pub const DEFAULT_MAX_ELAPSED: Duration = Duration::from_secs(300);

type RetryPredicate = Arc<dyn Fn(&NodeError) -> bool + Send + Sync>;
type DelayFn = Arc<dyn Fn(u32) -> Duration + Send + Sync>;

/// When and how often to retry a failing node.
#[derive(Clone)]
pub struct RetryPolicy {
    should_retry: RetryPredicate,
    delay: DelayFn,
    /// Total attempts allowed, including the first.
    pub max_attempts: u32,
    /// Wall-clock budget measured from the task's first attempt.
    pub max_elapsed: Duration,
}

impl RetryPolicy {
    /// Policy with a fixed delay between attempts.
    #[must_use]
    pub fn fixed(delay: Duration) -> Self {
        Self {
            should_retry: Arc::new(|_| true),
            delay: Arc::new(move |_| delay),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            max_elapsed: DEFAULT_MAX_ELAPSED,
        }
    }

    /// Policy with jittered exponential backoff: `base * 2^(attempt-1)`,
    /// scaled by a random factor in `[0.8, 1.2)`.
    #[must_use]
    pub fn exponential(base: Duration) -> Self {
        Self {
            should_retry: Arc::new(|_| true),
            delay: Arc::new(move |attempt| {
                let exp = attempt.saturating_sub(1).min(16);
                let raw = base.saturating_mul(1u32 << exp);
                let jitter = rand::rng().random_range(0.8..1.2);
                raw.mul_f64(jitter)
            }),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            max_elapsed: DEFAULT_MAX_ELAPSED,
        }
    }

    /// Policy with a caller-supplied delay function.
    #[must_use]
    pub fn with_delay_fn<F>(mut self, f: F) -> Self
    where
        F: Fn(u32) -> Duration + Send + Sync + 'static,
    {
        self.delay = Arc::new(f);
        self
    }

    /// Restricts the policy to errors accepted by the predicate.
    #[must_use]
    pub fn retry_if<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&NodeError) -> bool + Send + Sync + 'static,
    {
        self.should_retry = Arc::new(predicate);
        self
    }

    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    #[must_use]
    pub fn with_max_elapsed(mut self, max_elapsed: Duration) -> Self {
        self.max_elapsed = max_elapsed;
        self
    }

    /// Whether this policy handles the given error. Interrupts are
    /// categorically refused.
    #[must_use]
    pub fn accepts(&self, error: &NodeError) -> bool {
        !error.is_interrupt() && (self.should_retry)(error)
    }

    /// Delay before the attempt following `attempt` (1-based).
    #[must_use]
    pub fn next_delay(&self, attempt: u32) -> Duration {
        (self.delay)(attempt)
    }
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("max_elapsed", &self.max_elapsed)
            .finish_non_exhaustive()
    }
}

/// First policy whose predicate accepts the error, in declaration order.
#[must_use]
pub fn first_matching<'a>(
    policies: &'a [RetryPolicy],
    error: &NodeError,
) -> Option<&'a RetryPolicy> {
    policies.iter().find(|policy| policy.accepts(error))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::interrupt::InterruptError;
    use serde_json::json;

    #[test]
    fn first_matching_respects_order() {
        let transient_only = RetryPolicy::fixed(Duration::from_millis(1))
            .retry_if(|e| matches!(e, NodeError::Execution { .. }));
        let catch_all = RetryPolicy::fixed(Duration::from_millis(2));
        let policies = vec![transient_only, catch_all];

        let err = NodeError::execution("transient");
        let selected = first_matching(&policies, &err).unwrap();
        assert_eq!(selected.next_delay(1), Duration::from_millis(1));

        let err = NodeError::ValidationFailed("bad".into());
        let selected = first_matching(&policies, &err).unwrap();
        assert_eq!(selected.next_delay(1), Duration::from_millis(2));
    }

    #[test]
    fn interrupts_are_never_retried() {
        let policy = RetryPolicy::fixed(Duration::from_millis(1));
        let interrupt = NodeError::Interrupt(InterruptError::new("confirm", json!("approve?")));
        assert!(!policy.accepts(&interrupt));
        assert!(first_matching(std::slice::from_ref(&policy), &interrupt).is_none());
    }

    #[test]
    fn exponential_grows_with_attempts() {
        let policy = RetryPolicy::exponential(Duration::from_millis(100));
        let first = policy.next_delay(1);
        let third = policy.next_delay(3);
        assert!(first >= Duration::from_millis(80) && first < Duration::from_millis(120));
        assert!(third >= Duration::from_millis(320) && third < Duration::from_millis(480));
    }
}
