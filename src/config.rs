//! Plugin configuration.
//!
//! [`PluginConfig`] carries the defaults used by resilience descriptors that
//! were declared without explicit options (`retry_default`, `debounce_default`,
//! ...). It is installed per container with
//! [`Container::set_config`](crate::Container::set_config) and read lazily when
//! an instance is created, so a container can be configured after services
//! were declared.
//!
//! Configuration can be loaded from JSON (durations in milliseconds) and
//! overridden from environment variables:
//!
//! ```
//! use ferrous_services::PluginConfig;
//! use std::time::Duration;
//!
//! let config = PluginConfig::from_json_str(r#"{
//!     "retry": { "shots": 5, "interval": 250, "curve": "linear" },
//!     "debounce": { "delay": 40 }
//! }"#).unwrap();
//!
//! assert_eq!(config.retry.shots, 5);
//! assert_eq!(config.retry.interval, Duration::from_millis(250));
//! assert_eq!(config.debounce.delay, Duration::from_millis(40));
//! // Sections that were not given keep their defaults.
//! assert_eq!(config.timer, Default::default());
//! ```

use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{ServiceError, ServiceResult};
use crate::plugins::cache::CacheOptions;
use crate::plugins::debounce::DebounceOptions;
use crate::plugins::retry::{RetryCurve, RetryOptions};
use crate::plugins::timer::TimerOptions;

/// Container property under which the active [`PluginConfig`] is stored.
pub const CONFIG_PROPERTY: &str = "ferrous_services.config";

/// Default options for every resilience plugin.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PluginConfig {
    pub retry: RetryOptions,
    pub debounce: DebounceOptions,
    pub timer: TimerOptions,
    pub cache: CacheOptions,
}

impl PluginConfig {
    /// Parses and validates a JSON document.
    ///
    /// # Errors
    ///
    /// [`ServiceError::Config`] for malformed JSON or invalid values.
    pub fn from_json_str(json: &str) -> ServiceResult<Self> {
        let config: PluginConfig =
            serde_json::from_str(json).map_err(|err| ServiceError::Config(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Loads defaults, then applies overrides from `{PREFIX}_*` environment variables.
    ///
    /// Recognised variables (durations in milliseconds):
    /// `RETRY_SHOTS`, `RETRY_INTERVAL`, `RETRY_MAXIMUM_DELAY`, `RETRY_CURVE`,
    /// `DEBOUNCE_DELAY`, `TIMER_INTERVAL`, `TIMER_SHOTS`, `CACHE_TTL`.
    ///
    /// # Errors
    ///
    /// [`ServiceError::Config`] if a variable is present but cannot be parsed.
    pub fn from_env(prefix: &str) -> ServiceResult<Self> {
        let mut config = PluginConfig::default();
        config.apply_env(prefix)?;
        Ok(config)
    }

    /// Overrides fields from `{PREFIX}_*` environment variables.
    ///
    /// # Errors
    ///
    /// [`ServiceError::Config`] if a variable is present but cannot be parsed.
    pub fn apply_env(&mut self, prefix: &str) -> ServiceResult<()> {
        let var = |key: &str| {
            let name = format!("{}_{}", prefix.to_uppercase(), key);
            env::var(&name).ok().map(|raw| (name, raw))
        };

        if let Some((name, raw)) = var("RETRY_SHOTS") {
            self.retry.shots = parse_number(&name, &raw)?;
        }
        if let Some((name, raw)) = var("RETRY_INTERVAL") {
            self.retry.interval = Duration::from_millis(parse_number(&name, &raw)?);
        }
        if let Some((name, raw)) = var("RETRY_MAXIMUM_DELAY") {
            self.retry.maximum_delay = Duration::from_millis(parse_number(&name, &raw)?);
        }
        if let Some((name, raw)) = var("RETRY_CURVE") {
            self.retry.curve = match raw.to_lowercase().as_str() {
                "log" => RetryCurve::Log,
                "linear" => RetryCurve::Linear,
                other => return Err(ServiceError::Config(format!("{name}: unknown retry curve `{other}`"))),
            };
        }
        if let Some((name, raw)) = var("DEBOUNCE_DELAY") {
            self.debounce.delay = Duration::from_millis(parse_number(&name, &raw)?);
        }
        if let Some((name, raw)) = var("TIMER_INTERVAL") {
            self.timer.interval = Duration::from_millis(parse_number(&name, &raw)?);
        }
        if let Some((name, raw)) = var("TIMER_SHOTS") {
            self.timer.shots = parse_number(&name, &raw)?;
        }
        if let Some((name, raw)) = var("CACHE_TTL") {
            self.cache.ttl = Duration::from_millis(parse_number(&name, &raw)?);
        }

        self.validate()?;
        debug!(prefix, "Plugin configuration loaded from environment");
        Ok(())
    }

    /// Checks cross-field constraints.
    ///
    /// # Errors
    ///
    /// [`ServiceError::Config`] when the retry cap is below its interval or a
    /// timer interval is zero.
    pub fn validate(&self) -> ServiceResult<()> {
        if self.retry.maximum_delay < self.retry.interval {
            return Err(ServiceError::Config(format!(
                "retry.maximum_delay ({:?}) is shorter than retry.interval ({:?})",
                self.retry.maximum_delay, self.retry.interval
            )));
        }
        if self.timer.interval.is_zero() {
            return Err(ServiceError::Config("timer.interval must be greater than zero".into()));
        }
        Ok(())
    }
}

fn parse_number<T>(name: &str, raw: &str) -> ServiceResult<T>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    raw.trim()
        .parse::<T>()
        .map_err(|err| ServiceError::Config(format!("{name}: {err}")))
}

/// `Duration` as whole milliseconds.
pub(crate) mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn invalid_json_is_a_config_error() {
        let err = PluginConfig::from_json_str("{ retry: }").unwrap_err();
        assert!(matches!(err, ServiceError::Config(_)));
    }

    #[test]
    fn cap_below_interval_is_rejected() {
        let err = PluginConfig::from_json_str(r#"{"retry": {"interval": 500, "maximum_delay": 100}}"#).unwrap_err();
        assert!(err.to_string().contains("maximum_delay"));
    }

    #[test]
    fn json_round_trips_in_milliseconds() {
        let config = PluginConfig::default();
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["retry"]["interval"], serde_json::json!(1000));
        assert_eq!(json["retry"]["curve"], serde_json::json!("log"));
    }

    #[test]
    #[serial]
    fn environment_overrides_defaults() {
        env::set_var("FSVC_TEST_RETRY_SHOTS", "9");
        env::set_var("FSVC_TEST_RETRY_CURVE", "Linear");
        env::set_var("FSVC_TEST_CACHE_TTL", "1500");

        let config = PluginConfig::from_env("fsvc_test").unwrap();
        assert_eq!(config.retry.shots, 9);
        assert_eq!(config.retry.curve, RetryCurve::Linear);
        assert_eq!(config.cache.ttl, Duration::from_millis(1500));

        env::remove_var("FSVC_TEST_RETRY_SHOTS");
        env::remove_var("FSVC_TEST_RETRY_CURVE");
        env::remove_var("FSVC_TEST_CACHE_TTL");
    }

    #[test]
    #[serial]
    fn unparsable_environment_value_is_reported() {
        env::set_var("FSVC_BAD_TIMER_SHOTS", "many");
        let err = PluginConfig::from_env("fsvc_bad").unwrap_err();
        assert!(err.to_string().contains("FSVC_BAD_TIMER_SHOTS"));
        env::remove_var("FSVC_BAD_TIMER_SHOTS");
    }

    #[test]
    #[serial]
    fn out_of_range_shot_counts_are_rejected() {
        env::set_var("FSVC_WIDE_RETRY_SHOTS", "4294967296");
        let err = PluginConfig::from_env("fsvc_wide").unwrap_err();
        assert!(matches!(err, ServiceError::Config(ref msg) if msg.contains("FSVC_WIDE_RETRY_SHOTS")));
        env::remove_var("FSVC_WIDE_RETRY_SHOTS");

        env::set_var("FSVC_WIDE_TIMER_SHOTS", "-1");
        assert!(PluginConfig::from_env("fsvc_wide").is_err());
        env::remove_var("FSVC_WIDE_TIMER_SHOTS");

        env::set_var("FSVC_WIDE_TIMER_SHOTS", "4294967295");
        assert_eq!(PluginConfig::from_env("fsvc_wide").unwrap().timer.shots, u32::MAX);
        env::remove_var("FSVC_WIDE_TIMER_SHOTS");
    }
}
