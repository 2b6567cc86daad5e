use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;
use crate::options::{OptionMap, TableOptions};
use crate::retry::{Backoff, RetryConfig};
use crate::throttle::Throttle;

/// Transport settings shared by every connector.
///
/// Read from the connection options (string values) or deserialized from a
/// host configuration file; absent fields keep their defaults.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct HttpSettings {
    /// Per-request timeout.
    pub timeout_ms: u64,
    /// Retries after the first attempt for 429/5xx/transport failures.
    pub max_retries: u32,
    /// Base of the exponential backoff (`base * 2^attempt`).
    pub backoff_base_ms: u64,
    /// Cap on server-requested waits (`Retry-After`, reset headers).
    pub max_server_delay_secs: u64,
    /// Client-side pacing; 0 disables it.
    pub requests_per_second: u32,
    pub user_agent: Option<String>,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            timeout_ms: 30_000,
            max_retries: 3,
            backoff_base_ms: 1_000,
            max_server_delay_secs: 60,
            requests_per_second: 0,
            user_agent: None,
        }
    }
}

impl HttpSettings {
    pub fn from_options(raw: &OptionMap) -> Result<Self, ConfigError> {
        let options = TableOptions::connection(raw);
        let defaults = Self::default();
        Ok(Self {
            timeout_ms: options.parse_or("timeout_ms", defaults.timeout_ms)?,
            max_retries: options.parse_or("max_retries", defaults.max_retries)?,
            backoff_base_ms: options.parse_or("backoff_base_ms", defaults.backoff_base_ms)?,
            max_server_delay_secs: options
                .parse_or("max_server_delay_secs", defaults.max_server_delay_secs)?,
            requests_per_second: options
                .parse_or("requests_per_second", defaults.requests_per_second)?,
            user_agent: options.get("user_agent").map(str::to_owned),
        })
    }

    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_retries: self.max_retries,
            backoff: Backoff::Exponential {
                base: Duration::from_millis(self.backoff_base_ms),
                max: Duration::from_secs(self.max_server_delay_secs.max(1)),
                jitter: false,
            },
            max_server_delay: Duration::from_secs(self.max_server_delay_secs),
            ..RetryConfig::default()
        }
    }

    pub fn throttle(&self) -> Option<Throttle> {
        Throttle::per_second(self.requests_per_second)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_when_options_are_absent() {
        let settings = HttpSettings::from_options(&OptionMap::new()).expect("defaults");

        assert_eq!(settings, HttpSettings::default());
        assert!(settings.throttle().is_none());
    }

    #[test]
    fn string_options_override_defaults() {
        let raw: OptionMap = [("timeout_ms", "500"), ("max_retries", "1")]
            .into_iter()
            .map(|(key, value)| (key.to_owned(), value.to_owned()))
            .collect();

        let settings = HttpSettings::from_options(&raw).expect("valid");

        assert_eq!(settings.timeout_ms, 500);
        assert_eq!(settings.retry_config().max_retries, 1);
    }

    #[test]
    fn partial_json_config_keeps_defaults() {
        let settings: HttpSettings =
            serde_json::from_str(r#"{"requests_per_second": 5}"#).expect("valid");

        assert_eq!(settings.requests_per_second, 5);
        assert_eq!(settings.max_retries, 3);
        assert!(settings.throttle().is_some());
    }

    #[test]
    fn malformed_numbers_are_config_errors() {
        let raw: OptionMap = [("timeout_ms".to_owned(), "soon".to_owned())]
            .into_iter()
            .collect();

        assert!(HttpSettings::from_options(&raw).is_err());
    }
}
