//! Settings for the resilience primitives, loadable from TOML.
//!
//! [`ResilienceSettings`] groups the defaults used by the three registries and
//! by [`Retry`]. Durations are written in milliseconds (`timeout_ms = 30000`).
//! Every field is optional in the file; missing fields take the same defaults
//! as the runtime config structs.
//!
//! ```toml
//! [circuit_breaker]
//! max_failures = 3
//! timeout_ms = 10000
//!
//! [bulkhead]
//! max_concurrent = 4
//! queue_size = 0
//!
//! [rate_limiter]
//! rate = 4.0
//! burst = 8
//! wait_timeout_ms = 2000
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::bulkhead::BulkheadConfig;
use crate::circuit_breaker::CircuitBreakerConfig;
use crate::error::ConfigResult;
use crate::rate_limiter::RateLimiterConfig;
use crate::registry::{BulkheadRegistry, CircuitBreakerRegistry, RateLimiterRegistry};
use crate::retry::{Retry, RetryConfig};

/// Serialize a `Duration` as whole milliseconds.
///
/// ```rust
/// use std::time::Duration;
///
/// use revenge_resilience::config::duration_millis;
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Serialize, Deserialize)]
/// struct Example {
///     #[serde(with = "duration_millis")]
///     timeout: Duration,
/// }
/// ```
pub mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Like [`duration_millis`] for `Option<Duration>`.
pub mod duration_millis_opt {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(d) => super::duration_millis::serialize(d, serializer),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerSettings {
    pub max_failures: u32,
    pub failure_ratio: f64,
    pub min_requests: u32,
    #[serde(rename = "timeout_ms", with = "duration_millis")]
    pub timeout: Duration,
    pub max_half_open_requests: u32,
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        let defaults = CircuitBreakerConfig::default();
        Self {
            max_failures: defaults.max_failures,
            failure_ratio: defaults.failure_ratio,
            min_requests: defaults.min_requests,
            timeout: defaults.timeout,
            max_half_open_requests: defaults.max_half_open_requests,
        }
    }
}

impl CircuitBreakerSettings {
    /// Runtime config without callbacks.
    pub fn to_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            max_failures: self.max_failures,
            failure_ratio: self.failure_ratio,
            min_requests: self.min_requests,
            timeout: self.timeout,
            max_half_open_requests: self.max_half_open_requests,
            ..CircuitBreakerConfig::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BulkheadSettings {
    pub max_concurrent: usize,
    pub queue_size: usize,
    #[serde(rename = "max_wait_ms", with = "duration_millis")]
    pub max_wait: Duration,
}

impl Default for BulkheadSettings {
    fn default() -> Self {
        let defaults = BulkheadConfig::default();
        Self {
            max_concurrent: defaults.max_concurrent,
            queue_size: defaults.queue_size,
            max_wait: defaults.max_wait,
        }
    }
}

impl BulkheadSettings {
    /// Runtime config without callbacks.
    pub fn to_config(&self) -> BulkheadConfig {
        BulkheadConfig {
            max_concurrent: self.max_concurrent,
            queue_size: self.queue_size,
            max_wait: self.max_wait,
            ..BulkheadConfig::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimiterSettings {
    pub rate: f64,
    pub burst: u32,
    #[serde(
        rename = "wait_timeout_ms",
        with = "duration_millis_opt",
        skip_serializing_if = "Option::is_none"
    )]
    pub wait_timeout: Option<Duration>,
}

impl Default for RateLimiterSettings {
    fn default() -> Self {
        let defaults = RateLimiterConfig::default();
        Self { rate: defaults.rate, burst: defaults.burst, wait_timeout: defaults.wait_timeout }
    }
}

impl RateLimiterSettings {
    pub fn to_config(&self) -> RateLimiterConfig {
        RateLimiterConfig {
            rate: self.rate,
            burst: self.burst,
            wait_timeout: self.wait_timeout,
            ..RateLimiterConfig::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    #[serde(rename = "initial_wait_ms", with = "duration_millis")]
    pub initial_wait: Duration,
    #[serde(rename = "max_wait_ms", with = "duration_millis")]
    pub max_wait: Duration,
    pub multiplier: f64,
    pub jitter: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        let defaults = RetryConfig::default();
        Self {
            max_attempts: defaults.max_attempts,
            initial_wait: defaults.initial_wait,
            max_wait: defaults.max_wait,
            multiplier: defaults.multiplier,
            jitter: defaults.jitter,
        }
    }
}

impl RetrySettings {
    pub fn to_config(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.max_attempts,
            initial_wait: self.initial_wait,
            max_wait: self.max_wait,
            multiplier: self.multiplier,
            jitter: self.jitter,
        }
    }
}

/// Defaults for every primitive.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResilienceSettings {
    pub circuit_breaker: CircuitBreakerSettings,
    pub bulkhead: BulkheadSettings,
    pub rate_limiter: RateLimiterSettings,
    pub retry: RetrySettings,
}

/// The three named registries built from one set of settings.
#[derive(Debug)]
pub struct Registries {
    pub circuit_breakers: CircuitBreakerRegistry,
    pub bulkheads: BulkheadRegistry,
    pub rate_limiters: RateLimiterRegistry,
}

impl Registries {
    /// Drain and stop the event notifiers of every breaker and bulkhead.
    pub fn shutdown(&self) {
        self.circuit_breakers.shutdown();
        self.bulkheads.shutdown();
    }
}

impl ResilienceSettings {
    /// Check every section against its runtime config rules.
    pub fn validate(&self) -> ConfigResult<()> {
        self.circuit_breaker.to_config().validate()?;
        self.bulkhead.to_config().validate()?;
        self.rate_limiter.to_config().validate()?;
        self.retry.to_config().validate()
    }

    /// Registries whose entries start from these defaults.
    pub fn build_registries(&self) -> ConfigResult<Registries> {
        Ok(Registries {
            circuit_breakers: CircuitBreakerRegistry::new(self.circuit_breaker.to_config())?,
            bulkheads: BulkheadRegistry::new(self.bulkhead.to_config())?,
            rate_limiters: RateLimiterRegistry::new(self.rate_limiter.to_config())?,
        })
    }

    /// Retry policy from the `[retry]` section.
    pub fn build_retry(&self) -> ConfigResult<Retry> {
        Retry::new(self.retry.to_config())
    }
}

#[cfg(feature = "config")]
mod loading {
    use std::path::Path;

    use tracing::debug;

    use super::ResilienceSettings;
    use crate::error::{ConfigError, ConfigResult};

    impl ResilienceSettings {
        /// Parse and validate settings from TOML text.
        pub fn from_toml_str(text: &str) -> ConfigResult<Self> {
            let settings: Self = toml::from_str(text)
                .map_err(|e| ConfigError::Parse { message: e.to_string() })?;
            settings.validate()?;
            Ok(settings)
        }

        /// Read, parse and validate a TOML settings file.
        pub fn from_toml_file(path: impl AsRef<Path>) -> ConfigResult<Self> {
            let path = path.as_ref();
            let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
                path: path.display().to_string(),
                message: e.to_string(),
            })?;
            debug!(path = %path.display(), "loading resilience settings");
            Self::from_toml_str(&text)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Timed {
        #[serde(with = "duration_millis")]
        timeout: Duration,
        #[serde(default, with = "duration_millis_opt")]
        grace: Option<Duration>,
    }

    #[test]
    fn durations_are_milliseconds() {
        let value = Timed { timeout: Duration::from_millis(1500), grace: None };
        let json = serde_json::to_string(&value).expect("serialize");
        assert_eq!(json, r#"{"timeout":1500,"grace":null}"#);

        let parsed: Timed = serde_json::from_str(r#"{"timeout":250,"grace":40}"#).expect("parse");
        assert_eq!(parsed.timeout, Duration::from_millis(250));
        assert_eq!(parsed.grace, Some(Duration::from_millis(40)));
    }

    #[test]
    fn defaults_match_runtime_configs() {
        let settings = ResilienceSettings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.circuit_breaker.timeout, Duration::from_secs(30));
        assert_eq!(settings.bulkhead.max_wait, Duration::from_secs(5));
        assert_eq!(settings.rate_limiter.burst, 20);
        assert_eq!(settings.retry.to_config(), RetryConfig::default());
    }

    #[test]
    fn builds_registries_from_settings() {
        let mut settings = ResilienceSettings::default();
        settings.circuit_breaker.max_failures = 2;
        settings.bulkhead.max_concurrent = 3;

        let registries = settings.build_registries().expect("valid settings");
        assert_eq!(registries.circuit_breakers.get("tmdb").config().max_failures, 2);
        assert_eq!(registries.bulkheads.get("tmdb").stats().max_concurrent, 3);
        assert_eq!(registries.rate_limiters.get("tmdb").name(), "tmdb");
        assert!(settings.build_retry().is_ok());
    }

    #[test]
    fn invalid_section_fails_validation() {
        let mut settings = ResilienceSettings::default();
        settings.retry.jitter = 2.0;
        assert!(settings.validate().is_err());
        assert!(settings.build_retry().is_err());
    }

    #[cfg(feature = "config")]
    mod toml_loading {
        use std::io::Write;

        use super::*;
        use crate::error::ConfigError;

        #[test]
        fn partial_toml_keeps_defaults() {
            let settings = ResilienceSettings::from_toml_str(
                r#"
                [circuit_breaker]
                max_failures = 3
                timeout_ms = 1000

                [rate_limiter]
                rate = 4.0
                wait_timeout_ms = 250
                "#,
            )
            .expect("valid settings");

            assert_eq!(settings.circuit_breaker.max_failures, 3);
            assert_eq!(settings.circuit_breaker.timeout, Duration::from_secs(1));
            assert_eq!(settings.circuit_breaker.max_half_open_requests, 3);
            assert_eq!(settings.rate_limiter.wait_timeout, Some(Duration::from_millis(250)));
            assert_eq!(settings.bulkhead, BulkheadSettings::default());
        }

        #[test]
        fn rejects_invalid_values() {
            let err = ResilienceSettings::from_toml_str("[bulkhead]\nmax_concurrent = 0\n")
                .expect_err("zero slots");
            assert!(matches!(err, ConfigError::Invalid { .. }));

            let err = ResilienceSettings::from_toml_str("[retry]\nmax_attempts = \"three\"\n")
                .expect_err("wrong type");
            assert!(matches!(err, ConfigError::Parse { .. }));
        }

        #[test]
        fn loads_from_file() {
            let mut file = tempfile::NamedTempFile::new().expect("temp file");
            writeln!(file, "[retry]\nmax_attempts = 5\njitter = 0.0").expect("write");

            let settings = ResilienceSettings::from_toml_file(file.path()).expect("load");
            assert_eq!(settings.retry.max_attempts, 5);

            let missing = ResilienceSettings::from_toml_file("/nonexistent/resilience.toml");
            assert!(matches!(missing, Err(ConfigError::Io { .. })));
        }
    }
}
