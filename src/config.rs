//! Messaging configuration.
//!
//! Loaded from a TOML file with serde defaults for every field, then
//! overridden by environment variables for the deployment-critical keys.
//! A single boolean toggle disables messaging entirely; the factory then
//! wires a no-op transport behind the same facade.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{BusError, BusResult};

/// Which broker backend the bus runs against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BrokerKind {
    /// In-process peek-lock broker; the default and the test backend.
    #[default]
    Memory,
    /// NATS JetStream (requires the `nats` cargo feature).
    Nats,
}

/// Retry and dead-letter policy knobs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeadLetterOptions {
    /// When false the disabled engine is wired in: failures are not
    /// retried or dead-lettered (for environments without message
    /// infrastructure).
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_max_retry_attempts")]
    pub max_retry_attempts: u32,
    #[serde(default = "default_initial_retry_delay_ms")]
    pub initial_retry_delay_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    #[serde(default = "default_max_retry_delay_ms")]
    pub max_retry_delay_ms: u64,
    /// How long dead-letter records are kept before purge.
    #[serde(default = "default_dead_letter_ttl_secs")]
    pub dead_letter_ttl_secs: u64,
    /// Promotes per-message disposition logs from debug to info.
    #[serde(default)]
    pub detailed_logging: bool,
    /// Escalates every dead-letter record to a warn-level operator log.
    #[serde(default)]
    pub admin_notifications: bool,
}

impl Default for DeadLetterOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            max_retry_attempts: default_max_retry_attempts(),
            initial_retry_delay_ms: default_initial_retry_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            max_retry_delay_ms: default_max_retry_delay_ms(),
            dead_letter_ttl_secs: default_dead_letter_ttl_secs(),
            detailed_logging: false,
            admin_notifications: false,
        }
    }
}

impl DeadLetterOptions {
    pub fn initial_retry_delay(&self) -> Duration {
        Duration::from_millis(self.initial_retry_delay_ms)
    }

    pub fn max_retry_delay(&self) -> Duration {
        Duration::from_millis(self.max_retry_delay_ms)
    }

    pub fn dead_letter_ttl(&self) -> Duration {
        Duration::from_secs(self.dead_letter_ttl_secs)
    }
}

/// Configuration for the messaging core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagingConfig {
    /// Master toggle; when false every operation is a logged no-op.
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub broker: BrokerKind,
    /// Broker connection string (unused by the memory backend).
    #[serde(default)]
    pub broker_url: Option<String>,
    /// Optional prefix for every derived queue/topic name.
    #[serde(default)]
    pub namespace: Option<String>,
    /// Queue provisioned for un-routed point-to-point traffic.
    #[serde(default = "default_default_queue")]
    pub default_queue: String,
    /// Statically configured domain queues, provisioned at startup.
    #[serde(default)]
    pub queues: Vec<String>,
    /// Default subscription name for this service's consumers.
    #[serde(default = "default_subscription")]
    pub subscription: String,
    /// Maximum in-flight handler invocations per processor.
    #[serde(default = "default_max_concurrent_calls")]
    pub max_concurrent_calls: usize,
    #[serde(default = "default_lock_duration_secs")]
    pub lock_duration_secs: u64,
    #[serde(default = "default_max_auto_lock_renewal_secs")]
    pub max_auto_lock_renewal_secs: u64,
    /// Deliveries after which a transiently failing message dead-letters.
    #[serde(default = "default_max_delivery_count")]
    pub max_delivery_count: u32,
    #[serde(default)]
    pub default_time_to_live_secs: Option<u64>,
    /// Processor sleep between polls of an empty source.
    #[serde(default = "default_idle_poll_ms")]
    pub idle_poll_ms: u64,
    /// Directory for the durable dead-letter store; in-memory when unset.
    #[serde(default)]
    pub dead_letter_path: Option<PathBuf>,
    #[serde(default)]
    pub dead_letter: DeadLetterOptions,
}

fn default_true() -> bool {
    true
}
fn default_max_retry_attempts() -> u32 {
    5
}
fn default_initial_retry_delay_ms() -> u64 {
    2_000
}
fn default_backoff_multiplier() -> f64 {
    2.0
}
fn default_max_retry_delay_ms() -> u64 {
    300_000
}
fn default_dead_letter_ttl_secs() -> u64 {
    14 * 24 * 3600
}
fn default_default_queue() -> String {
    "default".to_string()
}
fn default_subscription() -> String {
    "default".to_string()
}
fn default_max_concurrent_calls() -> usize {
    8
}
fn default_lock_duration_secs() -> u64 {
    30
}
fn default_max_auto_lock_renewal_secs() -> u64 {
    300
}
fn default_max_delivery_count() -> u32 {
    5
}
fn default_idle_poll_ms() -> u64 {
    100
}

impl Default for MessagingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            broker: BrokerKind::Memory,
            broker_url: None,
            namespace: None,
            default_queue: default_default_queue(),
            queues: Vec::new(),
            subscription: default_subscription(),
            max_concurrent_calls: default_max_concurrent_calls(),
            lock_duration_secs: default_lock_duration_secs(),
            max_auto_lock_renewal_secs: default_max_auto_lock_renewal_secs(),
            max_delivery_count: default_max_delivery_count(),
            default_time_to_live_secs: None,
            idle_poll_ms: default_idle_poll_ms(),
            dead_letter_path: None,
            dead_letter: DeadLetterOptions::default(),
        }
    }
}

impl MessagingConfig {
    /// Load from a TOML file, then apply environment overrides.
    pub fn load(path: &Path) -> BusResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            BusError::Configuration(format!("cannot read {}: {e}", path.display()))
        })?;
        let mut config: Self = toml::from_str(&content)
            .map_err(|e| BusError::Configuration(format!("cannot parse {}: {e}", path.display())))?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Environment overrides for the deployment-critical keys.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(enabled) = std::env::var("OMNIBUS_ENABLED") {
            if let Ok(enabled) = enabled.parse::<bool>() {
                self.enabled = enabled;
            }
        }
        if let Ok(url) = std::env::var("OMNIBUS_BROKER_URL") {
            if !url.is_empty() {
                self.broker_url = Some(url);
            }
        }
        if let Ok(ns) = std::env::var("OMNIBUS_NAMESPACE") {
            if !ns.is_empty() {
                self.namespace = Some(ns);
            }
        }
    }

    pub fn validate(&self) -> BusResult<()> {
        if self.default_queue.is_empty() {
            return Err(BusError::Configuration(
                "default_queue must not be empty".into(),
            ));
        }
        if self.max_concurrent_calls == 0 {
            return Err(BusError::Configuration(
                "max_concurrent_calls must be at least 1".into(),
            ));
        }
        if self.lock_duration_secs == 0 {
            return Err(BusError::Configuration(
                "lock_duration_secs must be at least 1".into(),
            ));
        }
        if self.max_delivery_count == 0 {
            return Err(BusError::Configuration(
                "max_delivery_count must be at least 1".into(),
            ));
        }
        if self.dead_letter.backoff_multiplier < 1.0 {
            return Err(BusError::Configuration(
                "dead_letter.backoff_multiplier must be >= 1.0".into(),
            ));
        }
        if self.dead_letter.max_retry_delay_ms < self.dead_letter.initial_retry_delay_ms {
            return Err(BusError::Configuration(
                "dead_letter.max_retry_delay_ms must be >= initial_retry_delay_ms".into(),
            ));
        }
        Ok(())
    }

    pub fn lock_duration(&self) -> Duration {
        Duration::from_secs(self.lock_duration_secs)
    }

    pub fn max_auto_lock_renewal(&self) -> Duration {
        Duration::from_secs(self.max_auto_lock_renewal_secs)
    }

    pub fn default_time_to_live(&self) -> Option<Duration> {
        self.default_time_to_live_secs.map(Duration::from_secs)
    }

    pub fn idle_poll(&self) -> Duration {
        Duration::from_millis(self.idle_poll_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = MessagingConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.enabled);
        assert_eq!(config.broker, BrokerKind::Memory);
        assert_eq!(config.max_delivery_count, 5);
    }

    #[test]
    fn parses_partial_toml_with_defaults() {
        let config: MessagingConfig = toml::from_str(
            r#"
            namespace = "marketplace"
            queues = ["provider-commands"]
            max_concurrent_calls = 4

            [dead_letter]
            max_retry_attempts = 3
            detailed_logging = true
            "#,
        )
        .unwrap();
        assert_eq!(config.namespace.as_deref(), Some("marketplace"));
        assert_eq!(config.queues, vec!["provider-commands".to_string()]);
        assert_eq!(config.max_concurrent_calls, 4);
        assert_eq!(config.dead_letter.max_retry_attempts, 3);
        assert!(config.dead_letter.detailed_logging);
        // untouched fields keep their defaults
        assert_eq!(config.lock_duration_secs, 30);
        assert!(config.dead_letter.enabled);
    }

    #[test]
    fn rejects_zero_concurrency() {
        let config = MessagingConfig {
            max_concurrent_calls: 0,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(BusError::Configuration(_))
        ));
    }

    #[test]
    fn rejects_sub_unit_backoff_multiplier() {
        let mut config = MessagingConfig::default();
        config.dead_letter.backoff_multiplier = 0.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_cap_below_initial_delay() {
        let mut config = MessagingConfig::default();
        config.dead_letter.initial_retry_delay_ms = 10_000;
        config.dead_letter.max_retry_delay_ms = 1_000;
        assert!(config.validate().is_err());
    }
}
