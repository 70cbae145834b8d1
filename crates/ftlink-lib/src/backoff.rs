//! Exponential backoff.
//!
//! Paces two things: idle polls in the Read Loop (empty polls back off,
//! received data resets) and reconnection attempts after a device fault.

use std::time::{Duration, Instant};

/// Backoff timing.
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Delay after the first miss.
    pub initial_delay: Duration,
    /// Upper bound on the delay.
    pub max_delay: Duration,
    /// Multiplier applied after each miss (typically 2.0).
    pub multiplier: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

impl BackoffConfig {
    /// Idle pacing for the Read Loop: `min` doubling up to `max`.
    pub fn idle(min: Duration, max: Duration) -> Self {
        Self {
            initial_delay: min,
            max_delay: max.max(min),
            multiplier: 2.0,
        }
    }
}

/// Backoff state machine.
#[derive(Debug)]
pub struct Backoff {
    config: BackoffConfig,
    current_delay: Duration,
    last_attempt: Option<Instant>,
    consecutive_failures: u32,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            current_delay: config.initial_delay,
            config,
            last_attempt: None,
            consecutive_failures: 0,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(BackoffConfig::default())
    }

    /// `true` if nothing has failed yet, or the current delay has elapsed
    /// since the last failure.
    pub fn should_attempt(&self) -> bool {
        match self.last_attempt {
            None => true,
            Some(last) => last.elapsed() >= self.current_delay,
        }
    }

    /// Record a miss and advance the delay, capped at `max_delay`.
    pub fn record_failure(&mut self) {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.last_attempt = Some(Instant::now());

        let next = self.current_delay.as_nanos() as f64 * self.config.multiplier;
        self.current_delay = Duration::from_nanos(next.round() as u64).min(self.config.max_delay);
    }

    /// Record a hit and reset to the initial delay.
    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
        self.current_delay = self.config.initial_delay;
        self.last_attempt = None;
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Delay before the next attempt.
    pub fn current_delay(&self) -> Duration {
        self.current_delay
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_values() {
        let config = BackoffConfig::default();
        assert_eq!(config.initial_delay, Duration::from_secs(1));
        assert_eq!(config.max_delay, Duration::from_secs(30));
        assert_eq!(config.multiplier, 2.0);
    }

    #[test]
    fn idle_pacing_doubles_to_cap() {
        let mut idle = Backoff::new(BackoffConfig::idle(
            Duration::from_millis(1),
            Duration::from_millis(16),
        ));
        let mut seen = Vec::new();
        for _ in 0..7 {
            seen.push(idle.current_delay().as_millis());
            idle.record_failure();
        }
        assert_eq!(seen, vec![1, 2, 4, 8, 16, 16, 16]);

        idle.record_success();
        assert_eq!(idle.current_delay(), Duration::from_millis(1));
    }

    #[test]
    fn idle_max_below_min_is_raised() {
        let config = BackoffConfig::idle(Duration::from_millis(10), Duration::from_millis(2));
        assert_eq!(config.max_delay, Duration::from_millis(10));
    }

    #[test]
    fn initial_should_attempt_is_true() {
        let state = Backoff::with_defaults();
        assert!(state.should_attempt());
        assert_eq!(state.consecutive_failures(), 0);
    }

    #[test]
    fn backoff_capped_at_max() {
        let mut state = Backoff::new(BackoffConfig {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(4),
            multiplier: 2.0,
        });

        state.record_failure(); // 1s → 2s
        assert_eq!(state.current_delay(), Duration::from_secs(2));

        state.record_failure(); // 2s → 4s
        assert_eq!(state.current_delay(), Duration::from_secs(4));

        state.record_failure(); // capped
        assert_eq!(state.current_delay(), Duration::from_secs(4));
        assert_eq!(state.consecutive_failures(), 3);
    }

    #[test]
    fn success_resets_backoff() {
        let mut state = Backoff::with_defaults();
        state.record_failure();
        state.record_failure();
        state.record_success();
        assert_eq!(state.consecutive_failures(), 0);
        assert_eq!(state.current_delay(), Duration::from_secs(1));
        assert!(state.should_attempt());
    }

    #[test]
    fn should_attempt_false_immediately_after_failure() {
        let mut state = Backoff::new(BackoffConfig {
            initial_delay: Duration::from_secs(60),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
        });
        state.record_failure();
        assert!(!state.should_attempt());
    }

    #[test]
    fn should_attempt_true_after_delay_elapses() {
        let mut state = Backoff::new(BackoffConfig {
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(1),
            multiplier: 2.0,
        });
        state.record_failure();
        std::thread::sleep(Duration::from_millis(10));
        assert!(state.should_attempt());
    }
}
