//! Capped exponential backoff, shared by model-turn and tool-call retries

use std::time::Duration;

/// Retry configuration
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Maximum number of retries after the first attempt
    pub max_retries: u32,
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
    /// Fraction of the delay added or removed at random (0.0 - 1.0)
    pub jitter_factor: f64,
}

/// Defaults for opening a model turn
impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            backoff_multiplier: 2.0,
            jitter_factor: 0.0,
        }
    }
}

impl RetryConfig {
    /// Defaults for tool calls: shorter, jittered delays so parallel
    /// failures do not retry in lockstep
    pub fn for_tools() -> Self {
        Self {
            max_retries: 2,
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
            jitter_factor: 0.2,
        }
    }

    /// Total attempts including the first
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Delay before retry number `attempt` (0-indexed)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.delay_with_random(attempt, rand::random::<f64>())
    }

    /// Same as [`delay_for_attempt`](Self::delay_for_attempt) with an explicit random value in `[0, 1)`.
    pub fn delay_with_random(&self, attempt: u32, random: f64) -> Duration {
        let exponential = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(attempt.min(30) as i32);
        let capped = exponential.min(self.max_delay.as_secs_f64());
        let jitter = 1.0 + (random * 2.0 - 1.0) * self.jitter_factor.clamp(0.0, 1.0);
        Duration::from_secs_f64((capped * jitter).max(0.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_turn_backoff_is_exponential_and_capped() {
        let config = RetryConfig::default();
        assert_eq!(config.max_attempts(), 4);
        assert_eq!(config.delay_for_attempt(0), Duration::from_secs(1));
        assert_eq!(config.delay_for_attempt(2), Duration::from_secs(4));
        assert_eq!(config.delay_for_attempt(10), Duration::from_secs(60));
    }

    #[test]
    fn test_tool_backoff_is_exponential_and_capped() {
        let config = RetryConfig {
            jitter_factor: 0.0,
            ..RetryConfig::for_tools()
        };
        assert_eq!(config.max_attempts(), 3);
        assert_eq!(config.delay_for_attempt(0), Duration::from_millis(250));
        assert_eq!(config.delay_for_attempt(1), Duration::from_millis(500));
        assert_eq!(config.delay_for_attempt(2), Duration::from_millis(1000));
        assert_eq!(config.delay_for_attempt(20), Duration::from_secs(10));
    }

    #[test]
    fn test_jitter_bounds() {
        let config = RetryConfig::for_tools();
        let low = config.delay_with_random(0, 0.0);
        let high = config.delay_with_random(0, 0.999_999);
        assert_eq!(low, Duration::from_millis(200));
        assert!(high > Duration::from_millis(299) && high <= Duration::from_millis(300));
        for _ in 0..50 {
            let d = config.delay_for_attempt(1);
            assert!(d >= Duration::from_millis(400) && d <= Duration::from_millis(600));
        }
    }
}
