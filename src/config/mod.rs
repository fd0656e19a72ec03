//! Startup configuration.
//!
//! Values come from a [`ConfigSource`] exactly once, when a relay, consumer
//! or service is constructed. Nothing on the dispatch path reads config.

use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::relay::BackoffPolicy;

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("missing configuration value {0}")]
    Missing(String),
    #[error("invalid value {value:?} for {name}: {reason}")]
    Invalid {
        name: String,
        value: String,
        reason: String,
    },
}

/// Synchronous key/value lookup: environment, secret manager, parameter store.
pub trait ConfigSource {
    /// Look up `names`. Names with no value are absent from the result.
    fn get(&self, names: &[&str]) -> Result<HashMap<String, String>, ConfigError>;

    /// Look up a single value that must be present.
    fn require(&self, name: &str) -> Result<String, ConfigError> {
        self.get(&[name])?
            .remove(name)
            .ok_or_else(|| ConfigError::Missing(name.to_string()))
    }
}

/// Reads `PREFIX` + upper-cased name from the process environment.
#[derive(Clone, Debug, Default)]
pub struct EnvSource {
    prefix: String,
}

impl EnvSource {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    fn var_name(&self, name: &str) -> String {
        format!("{}{}", self.prefix, name.to_uppercase())
    }
}

impl ConfigSource for EnvSource {
    fn get(&self, names: &[&str]) -> Result<HashMap<String, String>, ConfigError> {
        let mut values = HashMap::new();
        for name in names {
            let var = self.var_name(name);
            match std::env::var(&var) {
                Ok(value) => {
                    values.insert(name.to_string(), value);
                }
                Err(std::env::VarError::NotPresent) => {}
                Err(std::env::VarError::NotUnicode(raw)) => {
                    return Err(ConfigError::Invalid {
                        name: var,
                        value: raw.to_string_lossy().into_owned(),
                        reason: "not valid unicode".into(),
                    })
                }
            }
        }
        Ok(values)
    }
}

/// Fixed values, for tests and embedded defaults.
#[derive(Clone, Debug, Default)]
pub struct StaticSource {
    values: HashMap<String, String>,
}

impl StaticSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: &str, value: impl Into<String>) -> Self {
        self.values.insert(name.to_string(), value.into());
        self
    }
}

impl ConfigSource for StaticSource {
    fn get(&self, names: &[&str]) -> Result<HashMap<String, String>, ConfigError> {
        Ok(names
            .iter()
            .filter_map(|name| {
                self.values
                    .get(*name)
                    .map(|value| (name.to_string(), value.clone()))
            })
            .collect())
    }
}

fn parse<T>(values: &HashMap<String, String>, name: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    values
        .get(name)
        .map(|raw| {
            raw.trim().parse().map_err(|err: T::Err| ConfigError::Invalid {
                name: name.to_string(),
                value: raw.clone(),
                reason: err.to_string(),
            })
        })
        .transpose()
}

fn at_least_one(name: &str, value: usize) -> Result<usize, ConfigError> {
    if value == 0 {
        return Err(ConfigError::Invalid {
            name: name.to_string(),
            value: value.to_string(),
            reason: "must be at least 1".into(),
        });
    }
    Ok(value)
}

/// Settings for one relay worker.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Identifies this worker in leases and logs.
    pub worker_id: String,
    /// Bus topic every outbox row is published to.
    pub topic: String,
    /// Rows claimed per poll.
    pub batch_size: usize,
    /// How long a claim stays exclusive before another worker may take over.
    pub lease_ms: u64,
    /// Publish attempts before a row is marked FAILED.
    pub max_attempts: u32,
    pub publish_timeout_ms: u64,
    /// Sleep between polls when the outbox is drained.
    pub poll_interval_ms: u64,
    /// Concurrent publishes per batch.
    pub max_in_flight: usize,
    /// Rows younger than this are left for the next poll.
    pub settle_delay_ms: u64,
    pub backoff: BackoffPolicy,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            worker_id: "outbox-relay".to_string(),
            topic: "InvoiceManagementEventBus".to_string(),
            batch_size: 100,
            lease_ms: 30_000,
            max_attempts: 5,
            publish_timeout_ms: 2_000,
            poll_interval_ms: 100,
            max_in_flight: 8,
            settle_delay_ms: 0,
            backoff: BackoffPolicy::default(),
        }
    }
}

impl RelayConfig {
    /// Shortest lease a relay accepts.
    pub const MIN_LEASE_MS: u64 = 1_000;

    pub const KEYS: [&'static str; 12] = [
        "relay_worker_id",
        "relay_topic",
        "relay_batch_size",
        "relay_lease_ms",
        "relay_max_attempts",
        "relay_publish_timeout_ms",
        "relay_poll_interval_ms",
        "relay_max_in_flight",
        "relay_settle_delay_ms",
        "relay_backoff_initial_ms",
        "relay_backoff_multiplier",
        "relay_backoff_max_ms",
    ];

    pub fn new(worker_id: impl Into<String>) -> Self {
        Self::default().with_worker_id(worker_id)
    }

    /// Defaults overridden by whatever `source` provides.
    pub fn from_source(source: &dyn ConfigSource) -> Result<Self, ConfigError> {
        let values = source.get(&Self::KEYS)?;
        let mut config = Self::default();

        if let Some(worker_id) = values.get("relay_worker_id") {
            config.worker_id = worker_id.clone();
        }
        if let Some(topic) = values.get("relay_topic") {
            config.topic = topic.clone();
        }
        if let Some(batch_size) = parse(&values, "relay_batch_size")? {
            config.batch_size = at_least_one("relay_batch_size", batch_size)?;
        }
        if let Some(lease_ms) = parse(&values, "relay_lease_ms")? {
            config.lease_ms = lease_ms;
        }
        if let Some(max_attempts) = parse::<u32>(&values, "relay_max_attempts")? {
            config.max_attempts = at_least_one("relay_max_attempts", max_attempts as usize)? as u32;
        }
        if let Some(timeout) = parse(&values, "relay_publish_timeout_ms")? {
            config.publish_timeout_ms = timeout;
        }
        if let Some(interval) = parse(&values, "relay_poll_interval_ms")? {
            config.poll_interval_ms = interval;
        }
        if let Some(in_flight) = parse(&values, "relay_max_in_flight")? {
            config.max_in_flight = at_least_one("relay_max_in_flight", in_flight)?;
        }
        if let Some(settle) = parse(&values, "relay_settle_delay_ms")? {
            config.settle_delay_ms = settle;
        }
        if let Some(initial) = parse(&values, "relay_backoff_initial_ms")? {
            config.backoff.initial_ms = initial;
        }
        if let Some(multiplier) = parse(&values, "relay_backoff_multiplier")? {
            config.backoff.multiplier = multiplier;
        }
        if let Some(max) = parse(&values, "relay_backoff_max_ms")? {
            config.backoff.max_ms = max;
        }

        config.validate()?;
        Ok(config)
    }

    /// Worst-case time to publish one full batch: `batch_size` rows in
    /// waves of `max_in_flight`, each wave bounded by the publish timeout.
    pub fn publish_window(&self) -> Duration {
        let waves = self.batch_size.div_ceil(self.max_in_flight.max(1));
        self.publish_timeout()
            .saturating_mul(u32::try_from(waves).unwrap_or(u32::MAX))
    }

    /// A lease must outlive every publish of the batch it covers.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid_lease = |reason: String| ConfigError::Invalid {
            name: "relay_lease_ms".to_string(),
            value: self.lease_ms.to_string(),
            reason,
        };
        if self.lease_ms < Self::MIN_LEASE_MS {
            return Err(invalid_lease(format!(
                "must be at least {} ms",
                Self::MIN_LEASE_MS
            )));
        }
        let window = duration_ms(self.publish_window());
        if self.lease_ms < window {
            return Err(invalid_lease(format!(
                "must cover a full batch of publishes ({window} ms)"
            )));
        }
        Ok(())
    }

    pub fn with_worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = worker_id.into();
        self
    }

    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = topic.into();
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease_ms = duration_ms(lease).max(Self::MIN_LEASE_MS);
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_publish_timeout(mut self, timeout: Duration) -> Self {
        self.publish_timeout_ms = duration_ms(timeout);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval_ms = duration_ms(interval);
        self
    }

    pub fn with_max_in_flight(mut self, max_in_flight: usize) -> Self {
        self.max_in_flight = max_in_flight.max(1);
        self
    }

    pub fn with_settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay_ms = duration_ms(delay);
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn lease(&self) -> Duration {
        Duration::from_millis(self.lease_ms)
    }

    pub fn publish_timeout(&self) -> Duration {
        Duration::from_millis(self.publish_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }
}

/// Settings for a consumer's receive loop.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    /// Longest single wait on the subscription.
    pub poll_timeout_ms: u64,
    /// Pause after the bus reports an error.
    pub idle_backoff_ms: u64,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            poll_timeout_ms: 100,
            idle_backoff_ms: 50,
        }
    }
}

impl ConsumerConfig {
    pub const KEYS: [&'static str; 2] = ["consumer_poll_timeout_ms", "consumer_idle_backoff_ms"];

    pub fn from_source(source: &dyn ConfigSource) -> Result<Self, ConfigError> {
        let values = source.get(&Self::KEYS)?;
        let mut config = Self::default();
        if let Some(timeout) = parse(&values, "consumer_poll_timeout_ms")? {
            config.poll_timeout_ms = timeout;
        }
        if let Some(backoff) = parse(&values, "consumer_idle_backoff_ms")? {
            config.idle_backoff_ms = backoff;
        }
        Ok(config)
    }

    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout_ms = duration_ms(timeout);
        self
    }

    pub fn with_idle_backoff(mut self, backoff: Duration) -> Self {
        self.idle_backoff_ms = duration_ms(backoff);
        self
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn idle_backoff(&self) -> Duration {
        Duration::from_millis(self.idle_backoff_ms)
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relay_defaults_survive_an_empty_source() {
        let config = RelayConfig::from_source(&StaticSource::new()).unwrap();
        assert_eq!(config, RelayConfig::default());
        assert_eq!(config.topic, "InvoiceManagementEventBus");
    }

    #[test]
    fn relay_values_override_defaults() {
        let source = StaticSource::new()
            .with("relay_worker_id", "relay-7")
            .with("relay_batch_size", "25")
            .with("relay_lease_ms", "45000")
            .with("relay_backoff_multiplier", "3.0");

        let config = RelayConfig::from_source(&source).unwrap();
        assert_eq!(config.worker_id, "relay-7");
        assert_eq!(config.batch_size, 25);
        assert_eq!(config.lease(), Duration::from_secs(45));
        assert_eq!(config.backoff.multiplier, 3.0);
    }

    #[test]
    fn rejects_unparseable_and_zero_values() {
        let bad = StaticSource::new().with("relay_batch_size", "lots");
        assert!(matches!(
            RelayConfig::from_source(&bad),
            Err(ConfigError::Invalid { .. })
        ));

        let zero = StaticSource::new().with("relay_max_in_flight", "0");
        assert!(matches!(
            RelayConfig::from_source(&zero),
            Err(ConfigError::Invalid { .. })
        ));
    }

    #[test]
    fn rejects_a_zero_lease() {
        let zero = StaticSource::new().with("relay_lease_ms", "0");
        match RelayConfig::from_source(&zero) {
            Err(ConfigError::Invalid { name, value, .. }) => {
                assert_eq!(name, "relay_lease_ms");
                assert_eq!(value, "0");
            }
            other => panic!("expected an invalid lease, got {other:?}"),
        }
    }

    #[test]
    fn lease_must_cover_a_full_batch_of_publishes() {
        // 10 rows, one at a time, 6s each: the lease needs 60s.
        let source = StaticSource::new()
            .with("relay_batch_size", "10")
            .with("relay_max_in_flight", "1")
            .with("relay_publish_timeout_ms", "6000")
            .with("relay_lease_ms", "10000");
        assert!(matches!(
            RelayConfig::from_source(&source),
            Err(ConfigError::Invalid { .. })
        ));

        let config = RelayConfig::new("relay-1")
            .with_batch_size(10)
            .with_max_in_flight(4)
            .with_publish_timeout(Duration::from_secs(6));
        assert_eq!(config.publish_window(), Duration::from_secs(18));
        assert!(config.clone().with_lease(Duration::from_secs(18)).validate().is_ok());
        assert!(config.with_lease(Duration::from_secs(17)).validate().is_err());
        assert!(RelayConfig::default().validate().is_ok());
    }

    #[test]
    fn with_lease_never_goes_below_the_minimum() {
        let config = RelayConfig::new("relay-1").with_lease(Duration::ZERO);
        assert_eq!(config.lease_ms, RelayConfig::MIN_LEASE_MS);
    }

    #[test]
    fn require_reports_missing_names() {
        let source = StaticSource::new().with("sender_email", "billing@example.com");
        assert_eq!(source.require("sender_email").unwrap(), "billing@example.com");
        assert_eq!(
            source.require("pdf_bucket_name"),
            Err(ConfigError::Missing("pdf_bucket_name".into()))
        );
    }

    #[test]
    fn env_source_prefixes_and_upper_cases() {
        std::env::set_var("OUTBOX_TEST_RELAY_TOPIC", "Orders");
        let config = RelayConfig::from_source(&EnvSource::new("OUTBOX_TEST_")).unwrap();
        assert_eq!(config.topic, "Orders");
        std::env::remove_var("OUTBOX_TEST_RELAY_TOPIC");
    }

    #[test]
    fn deserializes_partial_documents() {
        let config: RelayConfig =
            serde_json::from_value(serde_json::json!({"workerId": "ignored", "batch_size": 10}))
                .unwrap();
        assert_eq!(config.batch_size, 10);
        assert_eq!(config.worker_id, "outbox-relay");
    }
}
