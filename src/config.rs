//! Call timing and backend settings, with environment overrides.

use std::time::Duration;

use thiserror::Error;

pub const DEFAULT_RING_INTERVAL: Duration = Duration::from_millis(1_500);
pub const DEFAULT_MISSED_CALL_TIMEOUT: Duration = Duration::from_millis(30_000);
pub const DEFAULT_DECLINE_GRACE: Duration = Duration::from_millis(2_000);

pub const ENV_RING_INTERVAL_MS: &str = "CALL_RING_INTERVAL_MS";
pub const ENV_MISSED_CALL_TIMEOUT_MS: &str = "CALL_MISSED_TIMEOUT_MS";
pub const ENV_DECLINE_GRACE_MS: &str = "CALL_DECLINE_GRACE_MS";
pub const ENV_REALTIME_URL: &str = "REALTIME_URL";
pub const ENV_REALTIME_API_KEY: &str = "REALTIME_API_KEY";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{name} must be a positive integer number of milliseconds, got {value:?}")]
    InvalidDuration { name: &'static str, value: String },

    #[error("{0} must be greater than zero")]
    ZeroDuration(&'static str),
}

/// Timing of the incoming-call lifecycle.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CallConfig {
    /// Delay between ring sounds while ringing. The first ring is immediate.
    pub ring_interval: Duration,
    /// How long an unanswered call rings before it counts as missed.
    pub missed_call_timeout: Duration,
    /// How long shutdown waits for a decline that is still being sent.
    pub decline_grace: Duration,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            ring_interval: DEFAULT_RING_INTERVAL,
            missed_call_timeout: DEFAULT_MISSED_CALL_TIMEOUT,
            decline_grace: DEFAULT_DECLINE_GRACE,
        }
    }
}

impl CallConfig {
    pub fn with_ring_interval(mut self, interval: Duration) -> Self {
        self.ring_interval = interval;
        self
    }

    pub fn with_missed_call_timeout(mut self, timeout: Duration) -> Self {
        self.missed_call_timeout = timeout;
        self
    }

    pub fn with_decline_grace(mut self, grace: Duration) -> Self {
        self.decline_grace = grace;
        self
    }

    /// Defaults overridden by `CALL_RING_INTERVAL_MS`, `CALL_MISSED_TIMEOUT_MS`
    /// and `CALL_DECLINE_GRACE_MS`.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        if let Some(raw) = lookup(ENV_RING_INTERVAL_MS) {
            config.ring_interval = parse_millis(ENV_RING_INTERVAL_MS, &raw)?;
        }
        if let Some(raw) = lookup(ENV_MISSED_CALL_TIMEOUT_MS) {
            config.missed_call_timeout = parse_millis(ENV_MISSED_CALL_TIMEOUT_MS, &raw)?;
        }
        if let Some(raw) = lookup(ENV_DECLINE_GRACE_MS) {
            config.decline_grace = parse_millis(ENV_DECLINE_GRACE_MS, &raw)?;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ring_interval.is_zero() {
            return Err(ConfigError::ZeroDuration("ring_interval"));
        }
        if self.missed_call_timeout.is_zero() {
            return Err(ConfigError::ZeroDuration("missed_call_timeout"));
        }
        if self.decline_grace.is_zero() {
            return Err(ConfigError::ZeroDuration("decline_grace"));
        }
        Ok(())
    }
}

/// Connection settings for the hosted realtime/REST backend.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BackendConfig {
    pub url: String,
    pub api_key: String,
}

impl BackendConfig {
    /// `None` unless both `REALTIME_URL` and `REALTIME_API_KEY` are set.
    pub fn from_env() -> Option<Self> {
        let url = std::env::var(ENV_REALTIME_URL).ok()?;
        let api_key = std::env::var(ENV_REALTIME_API_KEY).ok()?;
        Some(Self { url, api_key })
    }
}

fn parse_millis(name: &'static str, raw: &str) -> Result<Duration, ConfigError> {
    let millis: u64 = raw
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidDuration {
            name,
            value: raw.to_string(),
        })?;
    if millis == 0 {
        return Err(ConfigError::ZeroDuration(name));
    }
    Ok(Duration::from_millis(millis))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = CallConfig::default();
        assert_eq!(config.ring_interval, Duration::from_millis(1500));
        assert_eq!(config.missed_call_timeout, Duration::from_secs(30));
        assert_eq!(config.decline_grace, Duration::from_secs(2));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_env_overrides() {
        let config = CallConfig::from_lookup(lookup(&[
            (ENV_RING_INTERVAL_MS, "200"),
            (ENV_MISSED_CALL_TIMEOUT_MS, " 1000 "),
            (ENV_DECLINE_GRACE_MS, "500"),
        ]))
        .unwrap();
        assert_eq!(config.decline_grace, Duration::from_millis(500));
        assert_eq!(config.ring_interval, Duration::from_millis(200));
        assert_eq!(config.missed_call_timeout, Duration::from_secs(1));
    }

    #[test]
    fn test_invalid_values_rejected() {
        let err = CallConfig::from_lookup(lookup(&[(ENV_RING_INTERVAL_MS, "fast")])).unwrap_err();
        assert_eq!(
            err,
            ConfigError::InvalidDuration {
                name: ENV_RING_INTERVAL_MS,
                value: "fast".into()
            }
        );

        let err =
            CallConfig::from_lookup(lookup(&[(ENV_MISSED_CALL_TIMEOUT_MS, "0")])).unwrap_err();
        assert_eq!(err, ConfigError::ZeroDuration(ENV_MISSED_CALL_TIMEOUT_MS));
    }

    #[test]
    fn test_builder_validation() {
        let config = CallConfig::default().with_ring_interval(Duration::ZERO);
        assert_eq!(
            config.validate(),
            Err(ConfigError::ZeroDuration("ring_interval"))
        );

        // A zero grace would drop every decline still in flight at shutdown.
        let config = CallConfig::default().with_decline_grace(Duration::ZERO);
        assert_eq!(
            config.validate(),
            Err(ConfigError::ZeroDuration("decline_grace"))
        );
    }
}
