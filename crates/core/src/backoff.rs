//! Retry backoff policy.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{QueueError, QueueResult};

/// Base delay used when a job does not declare its own backoff.
pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_secs(1);

/// Backoff strategy for retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffStrategy {
    /// Re-queue immediately (still subject to priority ordering)
    None,
    /// Constant delay between attempts
    #[default]
    Fixed,
    /// base * 2^(attempt - 1)
    Exponential,
    /// base * attempt
    Linear,
}

/// Delay policy applied between a failed attempt and the next one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BackoffPolicy {
    pub strategy: BackoffStrategy,
    #[serde(with = "crate::serde_ms")]
    pub base_delay: Duration,
    /// Upper bound for growing strategies.
    #[serde(
        with = "crate::serde_ms::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub max_delay: Option<Duration>,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::fixed(DEFAULT_BACKOFF_BASE)
    }
}

impl BackoffPolicy {
    pub fn none() -> Self {
        Self {
            strategy: BackoffStrategy::None,
            base_delay: Duration::ZERO,
            max_delay: None,
        }
    }

    pub fn fixed(delay: Duration) -> Self {
        Self {
            strategy: BackoffStrategy::Fixed,
            base_delay: delay,
            max_delay: None,
        }
    }

    pub fn exponential(base_delay: Duration) -> Self {
        Self {
            strategy: BackoffStrategy::Exponential,
            base_delay,
            max_delay: None,
        }
    }

    pub fn linear(base_delay: Duration) -> Self {
        Self {
            strategy: BackoffStrategy::Linear,
            base_delay,
            max_delay: None,
        }
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = Some(max_delay);
        self
    }

    /// Delay before the attempt following failed attempt number `attempt`
    /// (1-indexed). Attempt `0` never waits.
    pub fn next_delay(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let delay = match self.strategy {
            BackoffStrategy::None => Duration::ZERO,
            BackoffStrategy::Fixed => self.base_delay,
            BackoffStrategy::Exponential => {
                let factor = 1u32 << (attempt - 1).min(31);
                self.base_delay.saturating_mul(factor)
            }
            BackoffStrategy::Linear => self.base_delay.saturating_mul(attempt),
        };

        match self.max_delay {
            Some(cap) => delay.min(cap),
            None => delay,
        }
    }

    pub fn validate(&self) -> QueueResult<()> {
        if let Some(max) = self.max_delay {
            if max < self.base_delay {
                return Err(QueueError::validation(format!(
                    "backoff maxDelay ({}ms) is below baseDelay ({}ms)",
                    max.as_millis(),
                    self.base_delay.as_millis()
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn exponential_backoff_doubles() {
        let policy = BackoffPolicy::exponential(Duration::from_millis(100));

        assert_eq!(policy.next_delay(1), Duration::from_millis(100));
        assert_eq!(policy.next_delay(2), Duration::from_millis(200));
        assert_eq!(policy.next_delay(3), Duration::from_millis(400));
        assert_eq!(policy.next_delay(4), Duration::from_millis(800));
    }

    #[test]
    fn exponential_backoff_respects_cap() {
        let policy = BackoffPolicy::exponential(Duration::from_millis(100))
            .with_max_delay(Duration::from_millis(250));

        assert_eq!(policy.next_delay(2), Duration::from_millis(200));
        assert_eq!(policy.next_delay(3), Duration::from_millis(250));
        assert_eq!(policy.next_delay(30), Duration::from_millis(250));
    }

    #[test]
    fn fixed_backoff_is_constant() {
        let policy = BackoffPolicy::fixed(Duration::from_millis(500));

        assert_eq!(policy.next_delay(1), Duration::from_millis(500));
        assert_eq!(policy.next_delay(2), Duration::from_millis(500));
        assert_eq!(policy.next_delay(3), Duration::from_millis(500));
    }

    #[test]
    fn linear_backoff_increases_linearly() {
        let policy = BackoffPolicy::linear(Duration::from_millis(100));

        assert_eq!(policy.next_delay(1), Duration::from_millis(100));
        assert_eq!(policy.next_delay(2), Duration::from_millis(200));
        assert_eq!(policy.next_delay(3), Duration::from_millis(300));
    }

    #[test]
    fn none_never_waits() {
        let policy = BackoffPolicy::none();
        assert_eq!(policy.next_delay(1), Duration::ZERO);
        assert_eq!(policy.next_delay(9), Duration::ZERO);
    }

    #[test]
    fn default_is_fixed_one_second() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.strategy, BackoffStrategy::Fixed);
        assert_eq!(policy.next_delay(1), DEFAULT_BACKOFF_BASE);
    }

    #[test]
    fn cap_below_base_is_rejected() {
        let policy = BackoffPolicy::exponential(Duration::from_secs(2))
            .with_max_delay(Duration::from_secs(1));
        assert!(matches!(policy.validate(), Err(QueueError::Validation(_))));
    }

    #[test]
    fn deserializes_wire_shape() {
        let policy: BackoffPolicy =
            serde_json::from_str(r#"{"strategy":"exponential","baseDelay":100}"#).unwrap();
        assert_eq!(policy, BackoffPolicy::exponential(Duration::from_millis(100)));
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            ..ProptestConfig::default()
        })]

        /// Growing strategies never shrink from one attempt to the next and
        /// never exceed their cap.
        #[test]
        fn growing_delays_are_monotonic(
            base_ms in 0u64..10_000,
            cap_extra_ms in 0u64..1_000_000,
            attempt in 1u32..64,
            linear in any::<bool>(),
        ) {
            let base = Duration::from_millis(base_ms);
            let cap = base + Duration::from_millis(cap_extra_ms);
            let policy = if linear {
                BackoffPolicy::linear(base)
            } else {
                BackoffPolicy::exponential(base)
            }
            .with_max_delay(cap);

            let here = policy.next_delay(attempt);
            let next = policy.next_delay(attempt + 1);
            prop_assert!(next >= here);
            prop_assert!(next <= cap);
            prop_assert!(here >= base.min(cap));
        }
    }
}
