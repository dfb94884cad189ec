//! Exponential backoff with jitter between attempts.
//!
//! [`BackoffConfig`] controls how long the step executor waits before
//! re-trying a transient failure (429, 5xx, timeouts, unparseable output).
//! For a local Ollama, [`BackoffConfig::none()`] skips waiting entirely.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for retry delays with exponential backoff and jitter.
///
/// # Example
///
/// ```
/// use tet_workflow::backend::BackoffConfig;
///
/// let none = BackoffConfig::none();
/// assert!(none.initial_delay.is_zero());
///
/// let standard = BackoffConfig::standard();
/// assert!(standard.retryable_statuses.contains(&503));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// Delay before the first retry. Default: 1 second.
    #[serde(rename = "initial_delay_secs", with = "secs")]
    pub initial_delay: Duration,

    /// Multiplier applied to delay after each retry. Default: 2.0.
    /// Delay grows: initial, initial * multiplier, initial * multiplier^2, ...
    pub multiplier: f64,

    /// Maximum delay between retries. Default: 60 seconds.
    #[serde(rename = "max_delay_secs", with = "secs")]
    pub max_delay: Duration,

    /// Jitter strategy. Default: Full.
    pub jitter: JitterStrategy,

    /// HTTP status codes (besides 429) that are worth retrying.
    /// Default: `[500, 502, 503, 504]`.
    pub retryable_statuses: Vec<u16>,

    /// Whether to respect `Retry-After` headers from the provider.
    /// Default: `true`.
    pub respect_retry_after: bool,
}

/// Jitter strategy to prevent thundering herd on shared rate limits.
///
/// Parallel branches of one stage usually hit the same provider at the same
/// moment, so without jitter they also retry in lock-step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JitterStrategy {
    /// No jitter. Delay is exactly the calculated value.
    None,

    /// Full jitter: random value in `[0, calculated_delay]`.
    Full,

    /// Equal jitter: `calculated_delay/2 + random in [0, calculated_delay/2]`.
    Equal,
}

impl BackoffConfig {
    /// Retry immediately. For local models or tests.
    pub fn none() -> Self {
        Self {
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter: JitterStrategy::None,
            ..Self::standard()
        }
    }

    /// Sensible defaults for cloud APIs: 1s initial, 2x multiplier,
    /// 60s max, full jitter, respects Retry-After.
    pub fn standard() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            multiplier: 2.0,
            max_delay: Duration::from_secs(60),
            jitter: JitterStrategy::Full,
            retryable_statuses: vec![500, 502, 503, 504],
            respect_retry_after: true,
        }
    }

    /// Conservative delays for interactive use (user is waiting):
    /// 500ms initial, 10s max.
    pub fn interactive() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            multiplier: 1.5,
            max_delay: Duration::from_secs(10),
            ..Self::standard()
        }
    }

    /// Calculate the delay before retry N (0-indexed).
    ///
    /// The base delay is `initial_delay * multiplier^retry`, capped at
    /// `max_delay`. Jitter is then applied according to the configured strategy.
    pub fn delay_for_attempt(&self, retry: u32) -> Duration {
        let base = self.initial_delay.as_secs_f64() * self.multiplier.powi(retry as i32);
        let capped = base.min(self.max_delay.as_secs_f64()).max(0.0);

        let jittered = match self.jitter {
            JitterStrategy::None => capped,
            JitterStrategy::Full => fastrand::f64() * capped,
            JitterStrategy::Equal => capped / 2.0 + fastrand::f64() * (capped / 2.0),
        };

        Duration::from_secs_f64(jittered)
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self::standard()
    }
}

/// Serde adapter: `Duration` as fractional seconds.
pub(crate) mod secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exact(initial: u64, max: u64) -> BackoffConfig {
        BackoffConfig {
            initial_delay: Duration::from_secs(initial),
            multiplier: 2.0,
            max_delay: Duration::from_secs(max),
            jitter: JitterStrategy::None,
            retryable_statuses: vec![503],
            respect_retry_after: false,
        }
    }

    #[test]
    fn test_backoff_delay_exponential() {
        let config = exact(1, 60);
        assert_eq!(config.delay_for_attempt(0), Duration::from_secs(1));
        assert_eq!(config.delay_for_attempt(1), Duration::from_secs(2));
        assert_eq!(config.delay_for_attempt(2), Duration::from_secs(4));
        assert_eq!(config.delay_for_attempt(3), Duration::from_secs(8));
    }

    #[test]
    fn test_backoff_delay_capped_at_max() {
        let config = exact(1, 5);
        assert_eq!(config.delay_for_attempt(3), Duration::from_secs(5));
        assert_eq!(config.delay_for_attempt(10), Duration::from_secs(5));
    }

    #[test]
    fn test_backoff_jitter_full_in_range() {
        let config = BackoffConfig {
            jitter: JitterStrategy::Full,
            ..exact(1, 60)
        };
        for _ in 0..100 {
            assert!(config.delay_for_attempt(0) <= Duration::from_secs(1));
            assert!(config.delay_for_attempt(1) <= Duration::from_secs(2));
        }
    }

    #[test]
    fn test_backoff_jitter_equal_lower_bound() {
        let config = BackoffConfig {
            jitter: JitterStrategy::Equal,
            ..exact(2, 60)
        };
        for _ in 0..100 {
            let d = config.delay_for_attempt(0);
            assert!(d >= Duration::from_secs(1) && d <= Duration::from_secs(2));
        }
    }

    #[test]
    fn test_backoff_none_is_zero() {
        let config = BackoffConfig::none();
        assert_eq!(config.delay_for_attempt(4), Duration::ZERO);
    }

    #[test]
    fn test_backoff_deserializes_seconds() {
        let config: BackoffConfig =
            serde_json::from_str(r#"{"initial_delay_secs": 0.5, "jitter": "none"}"#).unwrap();
        assert_eq!(config.initial_delay, Duration::from_millis(500));
        assert_eq!(config.jitter, JitterStrategy::None);
        assert_eq!(config.max_delay, Duration::from_secs(60));
    }
}
