//! Retry budget and wait computation for upstream calls.
//!
//! A retryable response waits for the server's hint when one is present
//! (`Retry-After`, or a connector-specific reset header) and otherwise for
//! `base * 2^attempt`, optionally jittered by ±50%. Every wait is capped.

use std::time::Duration;

use time::OffsetDateTime;

use crate::http_client::HttpResponse;

/// Statuses retried within the budget: timeouts, rate limits and 5xx.
pub const RETRYABLE_STATUSES: [u16; 6] = [408, 429, 500, 502, 503, 504];

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Backoff {
    Constant(Duration),
    /// `base * 2^attempt`, capped at `max`.
    Exponential {
        base: Duration,
        max: Duration,
        jitter: bool,
    },
}

impl Default for Backoff {
    fn default() -> Self {
        Self::Exponential {
            base: Duration::from_secs(1),
            max: Duration::from_secs(60),
            jitter: false,
        }
    }
}

impl Backoff {
    /// Wait before retry number `attempt + 1`.
    pub fn wait(self, attempt: u32) -> Duration {
        let (base, max, jitter) = match self {
            Self::Constant(wait) => return wait,
            Self::Exponential { base, max, jitter } => (base, max, jitter),
        };
        let doubled = base.saturating_mul(1_u32 << attempt.min(20)).min(max);
        if !jitter || doubled.is_zero() {
            return doubled;
        }
        let spread = doubled.as_millis() as u64 / 2;
        let low = doubled.as_millis() as u64 - spread;
        Duration::from_millis(fastrand::u64(low..=low + 2 * spread))
    }
}

/// How a connector-specific rate-limit reset header encodes its value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetEncoding {
    /// Seconds to wait from now.
    DeltaSeconds,
    /// Unix epoch second at which the window resets.
    EpochSeconds,
}

/// Rate-limit reset header advertised by an upstream API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResetHeader {
    pub name: String,
    pub encoding: ResetEncoding,
}

impl ResetHeader {
    pub fn new(name: impl Into<String>, encoding: ResetEncoding) -> Self {
        Self {
            name: name.into().to_ascii_lowercase(),
            encoding,
        }
    }

    /// Seconds until the advertised reset, never negative.
    fn wait(&self, response: &HttpResponse, now_epoch: i64) -> Option<Duration> {
        let raw = response.header(&self.name)?.trim().parse::<i64>().ok()?;
        let seconds = match self.encoding {
            ResetEncoding::DeltaSeconds => raw,
            ResetEncoding::EpochSeconds => raw - now_epoch,
        };
        Some(Duration::from_secs(seconds.max(0).unsigned_abs()))
    }
}

/// Retry policy of one [`crate::transport::ApiClient`].
///
/// `max_retries` counts retries, so a call is attempted at most
/// `max_retries + 1` times.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub backoff: Backoff,
    /// Retry transport failures the client flags as retryable.
    pub retry_on_transport: bool,
    pub reset_header: Option<ResetHeader>,
    /// Cap on any wait, hinted or computed.
    pub max_server_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff: Backoff::default(),
            retry_on_transport: true,
            reset_header: None,
            max_server_delay: Duration::from_secs(60),
        }
    }
}

impl RetryConfig {
    /// Single attempt, no retries of any kind.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            retry_on_transport: false,
            ..Self::default()
        }
    }

    pub fn with_reset_header(mut self, header: ResetHeader) -> Self {
        self.reset_header = Some(header);
        self
    }

    pub fn is_retryable_status(&self, status: u16) -> bool {
        RETRYABLE_STATUSES.contains(&status)
    }

    /// A retryable status, or a 403 announcing an exhausted rate limit
    /// (`x-ratelimit-remaining: 0` or a `Retry-After`).
    pub fn is_retryable_response(&self, response: &HttpResponse) -> bool {
        self.is_retryable_status(response.status) || (response.status == 403 && rate_limited(response))
    }

    /// Whether another attempt fits in the budget after `attempt` failures.
    pub fn has_budget(&self, attempt: u32) -> bool {
        attempt < self.max_retries
    }

    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        self.backoff.wait(attempt).min(self.max_server_delay)
    }

    /// Wait before retrying `response`: the server hint when present, else backoff.
    pub fn delay_for_response(&self, response: &HttpResponse, attempt: u32) -> Duration {
        self.server_delay(response, OffsetDateTime::now_utc().unix_timestamp())
            .unwrap_or_else(|| self.backoff_delay(attempt))
    }

    /// `Retry-After` in seconds, else the configured reset header.
    pub fn server_delay(&self, response: &HttpResponse, now_epoch: i64) -> Option<Duration> {
        let retry_after = response
            .header("retry-after")
            .and_then(|value| value.trim().parse::<u64>().ok())
            .map(Duration::from_secs);
        let hinted = retry_after.or_else(|| self.reset_header.as_ref()?.wait(response, now_epoch))?;
        Some(hinted.min(self.max_server_delay))
    }
}

fn rate_limited(response: &HttpResponse) -> bool {
    let exhausted = response
        .header("x-ratelimit-remaining")
        .is_some_and(|remaining| remaining.trim() == "0");
    exhausted || response.header("retry-after").is_some()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_wait_doubles_up_to_the_cap() {
        let backoff = Backoff::Exponential {
            base: Duration::from_millis(250),
            max: Duration::from_secs(1),
            jitter: false,
        };

        let waits = (0..4).map(|attempt| backoff.wait(attempt)).collect::<Vec<_>>();

        assert_eq!(
            waits,
            vec![
                Duration::from_millis(250),
                Duration::from_millis(500),
                Duration::from_secs(1),
                Duration::from_secs(1),
            ]
        );
    }

    #[test]
    fn jittered_wait_stays_within_half_of_the_nominal_wait() {
        let backoff = Backoff::Exponential {
            base: Duration::from_millis(200),
            max: Duration::from_secs(5),
            jitter: true,
        };

        for attempt in 0..4 {
            let nominal = 200 * 2_u128.pow(attempt);
            for _ in 0..20 {
                let wait = backoff.wait(attempt).as_millis();
                assert!(wait >= nominal / 2 && wait <= nominal * 3 / 2, "attempt={attempt}, wait={wait}");
            }
        }
    }

    #[test]
    fn zero_base_never_sleeps() {
        let backoff = Backoff::Exponential {
            base: Duration::ZERO,
            max: Duration::from_secs(1),
            jitter: true,
        };

        assert_eq!(backoff.wait(5), Duration::ZERO);
    }

    #[test]
    fn default_budget_allows_three_retries() {
        let config = RetryConfig::default();

        assert!(config.has_budget(2));
        assert!(!config.has_budget(3));
        assert!(config.is_retryable_status(429));
        assert!(config.is_retryable_status(503));
        assert!(!config.is_retryable_status(401));
        assert!(!config.is_retryable_status(404));
    }

    #[test]
    fn forbidden_is_retried_only_when_rate_limited() {
        let config = RetryConfig::default();
        let limited = HttpResponse::new(403, "")
            .with_header("x-ratelimit-remaining", "0")
            .with_header("x-ratelimit-reset", "1700000000");
        let hinted = HttpResponse::new(403, "").with_header("retry-after", "30");
        let denied = HttpResponse::new(403, "").with_header("x-ratelimit-remaining", "4999");

        assert!(config.is_retryable_response(&limited));
        assert!(config.is_retryable_response(&hinted));
        assert!(!config.is_retryable_response(&denied));
        assert!(config.is_retryable_response(&HttpResponse::new(502, "")));
    }

    #[test]
    fn disabled_config_has_no_budget() {
        let config = RetryConfig::none();

        assert!(!config.has_budget(0));
        assert!(!config.retry_on_transport);
    }

    #[test]
    fn retry_after_header_is_preferred_over_reset_header() {
        let config = RetryConfig::default()
            .with_reset_header(ResetHeader::new("X-RateLimit-Reset", ResetEncoding::EpochSeconds));
        let response = HttpResponse::new(429, "")
            .with_header("retry-after", "7")
            .with_header("x-ratelimit-reset", "1000");

        assert_eq!(config.server_delay(&response, 990), Some(Duration::from_secs(7)));
    }

    #[test]
    fn epoch_reset_header_is_relative_to_now() {
        let config = RetryConfig::default()
            .with_reset_header(ResetHeader::new("x-ratelimit-reset", ResetEncoding::EpochSeconds));
        let response = HttpResponse::new(429, "").with_header("x-ratelimit-reset", "1012");

        assert_eq!(config.server_delay(&response, 1000), Some(Duration::from_secs(12)));
        assert_eq!(config.server_delay(&response, 2000), Some(Duration::ZERO));
    }

    #[test]
    fn server_delay_is_capped() {
        let config = RetryConfig::default()
            .with_reset_header(ResetHeader::new("x-reset", ResetEncoding::DeltaSeconds));
        let response = HttpResponse::new(429, "").with_header("x-reset", "3600");

        assert_eq!(config.server_delay(&response, 0), Some(Duration::from_secs(60)));
    }

    #[test]
    fn missing_hint_falls_back_to_backoff() {
        let config = RetryConfig {
            backoff: Backoff::Constant(Duration::from_millis(5)),
            ..RetryConfig::default()
        };
        let response = HttpResponse::new(429, "");

        assert_eq!(config.server_delay(&response, 0), None);
        assert_eq!(config.delay_for_response(&response, 2), Duration::from_millis(5));
    }
}
