//! Breaker configuration.
//!
//! Thresholds are immutable once a breaker is built from them. Every
//! constructor that parses a config validates it before returning, so a
//! breaker can never exist with an unusable config.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Errors raised while building or loading a configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("{field} must be greater than zero")]
    ZeroThreshold { field: &'static str },

    #[error("{field} must be a non-zero duration")]
    ZeroDuration { field: &'static str },

    #[error("{field} is too large to schedule: {value:?}")]
    DurationOutOfRange { field: &'static str, value: Duration },

    #[error("invalid config for breaker '{breaker}': {source}")]
    Breaker {
        breaker: String,
        #[source]
        source: Box<ConfigError>,
    },

    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Failed to parse JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// How many probes may be in flight while a breaker is half-open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbePolicy {
    /// Every caller arriving while half-open is admitted. Callers racing at
    /// the recovery boundary may all probe at once.
    #[default]
    Unlimited,

    /// Only one probe at a time; others are denied until it resolves.
    Single,
}

/// Thresholds for a single breaker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Consecutive failures before tripping
    pub failure_threshold: u32,

    /// Time spent open before a probe is admitted
    #[serde(with = "duration_str")]
    pub recovery_timeout: Duration,

    /// Idle time after which a failure streak decays; also the sweep interval
    #[serde(with = "duration_str")]
    pub monitoring_period: Duration,

    /// Consecutive half-open successes needed to close
    pub success_threshold: u32,

    /// Successful calls slower than this are reported, never counted as failures
    #[serde(with = "duration_str")]
    pub slow_call_threshold: Duration,

    /// Optional deadline for each call
    #[serde(with = "option_duration_str", skip_serializing_if = "Option::is_none")]
    pub call_timeout: Option<Duration>,

    pub probe_policy: ProbePolicy,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(30),
            monitoring_period: Duration::from_secs(60),
            success_threshold: 3,
            slow_call_threshold: Duration::from_secs(2),
            call_timeout: None,
            probe_policy: ProbePolicy::Unlimited,
        }
    }
}

impl BreakerConfig {
    /// Check thresholds and durations.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.failure_threshold == 0 {
            return Err(ConfigError::ZeroThreshold {
                field: "failure_threshold",
            });
        }
        if self.success_threshold == 0 {
            return Err(ConfigError::ZeroThreshold {
                field: "success_threshold",
            });
        }

        check_duration("recovery_timeout", self.recovery_timeout)?;
        check_duration("monitoring_period", self.monitoring_period)?;
        check_duration("slow_call_threshold", self.slow_call_threshold)?;
        if let Some(timeout) = self.call_timeout {
            check_duration("call_timeout", timeout)?;
        }

        Ok(())
    }

    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    pub fn with_success_threshold(mut self, threshold: u32) -> Self {
        self.success_threshold = threshold;
        self
    }

    pub fn with_recovery_timeout(mut self, timeout: Duration) -> Self {
        self.recovery_timeout = timeout;
        self
    }

    pub fn with_monitoring_period(mut self, period: Duration) -> Self {
        self.monitoring_period = period;
        self
    }

    pub fn with_slow_call_threshold(mut self, threshold: Duration) -> Self {
        self.slow_call_threshold = threshold;
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = Some(timeout);
        self
    }

    pub fn with_probe_policy(mut self, policy: ProbePolicy) -> Self {
        self.probe_policy = policy;
        self
    }
}

/// Upper bound on any configured duration (100 years). Keeps deadline
/// arithmetic on `DateTime<Utc>` well inside its range.
const MAX_DURATION: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

fn check_duration(field: &'static str, value: Duration) -> Result<(), ConfigError> {
    if value.is_zero() {
        return Err(ConfigError::ZeroDuration { field });
    }
    if value > MAX_DURATION {
        return Err(ConfigError::DurationOutOfRange { field, value });
    }
    Ok(())
}

/// Registry-wide configuration: defaults plus per-resource overrides.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Config for breakers without an override
    pub defaults: BreakerConfig,

    /// Per-resource overrides, keyed by breaker name
    pub breakers: BTreeMap<String, BreakerConfig>,
}

impl RegistryConfig {
    /// Parse a registry config from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let config: RegistryConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a registry config from a JSON string.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: RegistryConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a registry config from a YAML file.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Parse a registry config from a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        Self::from_json(&contents)
    }

    /// Validate the defaults and every override.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.defaults.validate()?;
        for (name, config) in &self.breakers {
            config.validate().map_err(|e| ConfigError::Breaker {
                breaker: name.clone(),
                source: Box::new(e),
            })?;
        }
        Ok(())
    }

    /// Config that applies to the named breaker.
    pub fn config_for(&self, name: &str) -> &BreakerConfig {
        self.breakers.get(name).unwrap_or(&self.defaults)
    }

    /// Add or replace an override.
    pub fn with_breaker(mut self, name: impl Into<String>, config: BreakerConfig) -> Self {
        self.breakers.insert(name.into(), config);
        self
    }
}

mod duration_str {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let text = String::deserialize(deserializer)?;
        humantime::parse_duration(&text).map_err(serde::de::Error::custom)
    }
}

mod option_duration_str {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(d) => serializer.serialize_str(&humantime::format_duration(*d).to_string()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Option::<String>::deserialize(deserializer)?
            .map(|text| humantime::parse_duration(&text).map_err(serde::de::Error::custom))
            .transpose()
    }
}
