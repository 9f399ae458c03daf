//! Session configuration.

use std::env;
use std::time::Duration;

use rand::Rng;

/// Reconnection policy for transient transport failures.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Consecutive reconnect attempts allowed after the first connection.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Relative spread applied to each delay, in `[0, 1]`.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(1_000),
            max_delay: Duration::from_millis(30_000),
            jitter: 0.2,
        }
    }
}

impl RetryPolicy {
    /// A policy that retries immediately; used by tests and local tools.
    pub fn immediate(max_retries: u32) -> Self {
        Self {
            max_retries,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter: 0.0,
        }
    }

    /// Un-jittered delay before reconnect `attempt` (1-based):
    /// `min(base * 2^(attempt - 1), max)`.
    pub fn nominal_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base_delay
            .checked_mul(1_u32 << exponent)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Delay before reconnect `attempt`, scaled by a random factor in
    /// `[1 - jitter, 1 + jitter]`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let nominal = self.nominal_delay(attempt);
        let jitter = self.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 || nominal.is_zero() {
            return nominal;
        }
        let factor = rand::thread_rng().gen_range((1.0 - jitter)..=(1.0 + jitter));
        nominal.mul_f64(factor)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionConfig {
    pub retry: RetryPolicy,
    /// System instructions sent along with every turn.
    pub instructions: Option<String>,
}

impl SessionConfig {
    /// Reads `OPENCODE_MAX_RETRIES`, `OPENCODE_RETRY_BASE_MS`,
    /// `OPENCODE_RETRY_MAX_MS` and `OPENCODE_INSTRUCTIONS`, keeping defaults
    /// for unset or unparsable values.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(max_retries) = env_parse::<u32>("OPENCODE_MAX_RETRIES") {
            config.retry.max_retries = max_retries;
        }
        if let Some(base_ms) = env_parse::<u64>("OPENCODE_RETRY_BASE_MS") {
            config.retry.base_delay = Duration::from_millis(base_ms);
        }
        if let Some(max_ms) = env_parse::<u64>("OPENCODE_RETRY_MAX_MS") {
            config.retry.max_delay = Duration::from_millis(max_ms);
        }
        config.instructions = env_string_opt("OPENCODE_INSTRUCTIONS");
        config
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = Some(instructions.into());
        self
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env_string_opt(key).and_then(|value| value.trim().parse().ok())
}

fn env_string_opt(key: &str) -> Option<String> {
    env::var(key).ok().and_then(|value| {
        if value.trim().is_empty() {
            None
        } else {
            Some(value)
        }
    })
}

#[cfg(test)]
mod tests {
    use std::env;
    use std::sync::{Mutex, OnceLock};
    use std::time::Duration;

    use super::{RetryPolicy, SessionConfig};

    struct EnvGuard {
        key: &'static str,
        previous: Option<String>,
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            if let Some(value) = &self.previous {
                env::set_var(self.key, value);
            } else {
                env::remove_var(self.key);
            }
        }
    }

    fn env_lock() -> std::sync::MutexGuard<'static, ()> {
        static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
        LOCK.get_or_init(|| Mutex::new(()))
            .lock()
            .expect("env lock poisoned")
    }

    fn set_env_guard(key: &'static str, value: Option<&str>) -> EnvGuard {
        let previous = env::var(key).ok();
        if let Some(value) = value {
            env::set_var(key, value);
        } else {
            env::remove_var(key);
        }
        EnvGuard { key, previous }
    }

    #[test]
    fn nominal_delay_doubles_until_capped() {
        let policy = RetryPolicy {
            max_retries: 10,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(1_000),
            jitter: 0.0,
        };
        let delays: Vec<_> = (1..=6)
            .map(|attempt| policy.nominal_delay(attempt).as_millis())
            .collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 1_000, 1_000]);
        assert_eq!(policy.nominal_delay(200), Duration::from_millis(1_000));
    }

    #[test]
    fn jittered_delay_stays_within_bounds() {
        let policy = RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(1_000),
            max_delay: Duration::from_secs(60),
            jitter: 0.25,
        };
        for _ in 0..200 {
            let delay = policy.delay_for(2);
            assert!(delay >= Duration::from_millis(1_499), "{delay:?}");
            assert!(delay <= Duration::from_millis(2_501), "{delay:?}");
        }
    }

    #[test]
    fn immediate_policy_never_waits() {
        let policy = RetryPolicy::immediate(5);
        assert_eq!(policy.delay_for(1), Duration::ZERO);
        assert_eq!(policy.delay_for(5), Duration::ZERO);
    }

    #[test]
    fn env_values_override_retry_defaults() {
        let _lock = env_lock();
        let _g1 = set_env_guard("OPENCODE_MAX_RETRIES", Some("7"));
        let _g2 = set_env_guard("OPENCODE_RETRY_BASE_MS", Some("50"));
        let _g3 = set_env_guard("OPENCODE_RETRY_MAX_MS", Some("400"));
        let _g4 = set_env_guard("OPENCODE_INSTRUCTIONS", Some("Answer tersely."));

        let config = SessionConfig::from_env();
        assert_eq!(config.retry.max_retries, 7);
        assert_eq!(config.retry.base_delay, Duration::from_millis(50));
        assert_eq!(config.retry.max_delay, Duration::from_millis(400));
        assert_eq!(config.instructions.as_deref(), Some("Answer tersely."));
    }

    #[test]
    fn invalid_env_values_keep_defaults() {
        let _lock = env_lock();
        let _g1 = set_env_guard("OPENCODE_MAX_RETRIES", Some("many"));
        let _g2 = set_env_guard("OPENCODE_RETRY_BASE_MS", Some(" "));
        let _g3 = set_env_guard("OPENCODE_RETRY_MAX_MS", None);
        let _g4 = set_env_guard("OPENCODE_INSTRUCTIONS", None);

        let config = SessionConfig::from_env();
        assert_eq!(config, SessionConfig::default());
    }
}
