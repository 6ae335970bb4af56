//! Dead-letter / retry decision engine.
//!
//! Pure decision logic, broker-independent: given a handler error and the
//! current delivery attempt, decide whether the message is abandoned for
//! redelivery (with a computed backoff surfaced for transports that support
//! scheduled redelivery) or routed to the dead-letter store with a reason.
//!
//! Transient classification checks concrete error types for the
//! unambiguous cases (I/O timeouts and connection failures, elapsed tokio
//! timeouts) and falls back to a case-insensitive substring match on the
//! message, recursively walking the `source()` chain. The marker list is an
//! extension point: broker adapters can append broker-native error codes
//! instead of patching the classification logic.

use std::error::Error as StdError;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::{DeadLetterOptions, MessagingConfig};

#[cfg(test)]
mod tests;

/// Why a message was routed to the dead-letter store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DeadLetterReason {
    /// The body could not be parsed into the handler's declared type.
    DeserializationFailed,
    /// A transiently failing message exhausted its delivery budget.
    MaxDeliveryCountExceeded,
    /// The handler failed with a non-retryable error.
    PermanentFailure,
}

impl std::fmt::Display for DeadLetterReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            DeadLetterReason::DeserializationFailed => "DeserializationFailed",
            DeadLetterReason::MaxDeliveryCountExceeded => "MaxDeliveryCountExceeded",
            DeadLetterReason::PermanentFailure => "PermanentFailure",
        };
        f.write_str(name)
    }
}

/// What the adapter should do with a failed delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// Remove the message without further processing.
    Complete,
    /// Return the message to its source for redelivery. The computed
    /// backoff is honored by transports that support scheduled redelivery;
    /// otherwise redelivery timing is broker-dependent.
    Abandon { retry_delay: Duration },
    /// Route the message to the dead-letter store.
    DeadLetter { reason: DeadLetterReason },
}

/// Decides, per failed delivery, whether to retry and after how long.
pub trait RetryEngine: Send + Sync {
    /// True only when `error` is transient and attempts remain.
    fn should_retry(
        &self,
        error: &(dyn StdError + Send + Sync + 'static),
        attempt: u32,
    ) -> bool;

    /// Exponential backoff for the given attempt (1-based), capped.
    fn retry_delay(&self, attempt: u32) -> Duration;

    /// Disposition for a handler failure at the given delivery count.
    fn disposition(
        &self,
        error: &(dyn StdError + Send + Sync + 'static),
        delivery_count: u32,
    ) -> Disposition;
}

/// Substrings that mark an error message as transient. Checked
/// case-insensitively against every error in the source chain.
const DEFAULT_TRANSIENT_MARKERS: &[&str] = &[
    "timeout",
    "timed out",
    "connection",
    "unavailable",
    "network",
    "temporarily",
    "canceled",
    "cancelled",
    "busy",
    "try again",
];

/// The standard engine: typed + substring transient classification,
/// exponential backoff, delivery-budget dead-lettering.
pub struct StandardRetryEngine {
    options: DeadLetterOptions,
    max_delivery_count: u32,
    transient_markers: Vec<String>,
}

impl StandardRetryEngine {
    pub fn new(options: DeadLetterOptions, max_delivery_count: u32) -> Self {
        Self {
            options,
            max_delivery_count,
            transient_markers: DEFAULT_TRANSIENT_MARKERS
                .iter()
                .map(|m| m.to_string())
                .collect(),
        }
    }

    /// Extend the transient marker set, e.g. with broker-native error
    /// codes exposed by a transport.
    pub fn with_transient_markers<I, S>(mut self, markers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.transient_markers
            .extend(markers.into_iter().map(|m| m.into().to_lowercase()));
        self
    }

    /// Whether the error (or any error in its source chain) is transient.
    pub fn is_transient(&self, error: &(dyn StdError + Send + Sync + 'static)) -> bool {
        let mut current: Option<&(dyn StdError + 'static)> = Some(error);
        while let Some(err) = current {
            if self.node_is_transient(err) {
                return true;
            }
            current = err.source();
        }
        false
    }

    fn node_is_transient(&self, err: &(dyn StdError + 'static)) -> bool {
        if let Some(io_err) = err.downcast_ref::<io::Error>() {
            if matches!(
                io_err.kind(),
                io::ErrorKind::TimedOut
                    | io::ErrorKind::ConnectionRefused
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::NotConnected
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::WouldBlock
                    | io::ErrorKind::Interrupted
            ) {
                return true;
            }
        }
        if err.downcast_ref::<tokio::time::error::Elapsed>().is_some() {
            return true;
        }
        let message = err.to_string().to_lowercase();
        self.transient_markers.iter().any(|m| message.contains(m))
    }
}

impl RetryEngine for StandardRetryEngine {
    fn should_retry(
        &self,
        error: &(dyn StdError + Send + Sync + 'static),
        attempt: u32,
    ) -> bool {
        attempt < self.options.max_retry_attempts && self.is_transient(error)
    }

    fn retry_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let initial = self.options.initial_retry_delay_ms as f64;
        let raw = initial * self.options.backoff_multiplier.powi(exponent);
        let capped = if raw.is_finite() {
            raw.min(self.options.max_retry_delay_ms as f64)
        } else {
            self.options.max_retry_delay_ms as f64
        };
        Duration::from_millis(capped.max(0.0) as u64)
    }

    fn disposition(
        &self,
        error: &(dyn StdError + Send + Sync + 'static),
        delivery_count: u32,
    ) -> Disposition {
        if !self.is_transient(error) {
            // Permanent failures spend no retry budget.
            return Disposition::DeadLetter {
                reason: DeadLetterReason::PermanentFailure,
            };
        }
        if delivery_count >= self.max_delivery_count
            || delivery_count >= self.options.max_retry_attempts
        {
            return Disposition::DeadLetter {
                reason: DeadLetterReason::MaxDeliveryCountExceeded,
            };
        }
        Disposition::Abandon {
            retry_delay: self.retry_delay(delivery_count),
        }
    }
}

/// Engine for environments without message infrastructure: nothing is
/// retried or dead-lettered, failed deliveries are completed and dropped.
pub struct DisabledRetryEngine;

impl RetryEngine for DisabledRetryEngine {
    fn should_retry(&self, _: &(dyn StdError + Send + Sync + 'static), _: u32) -> bool {
        false
    }

    fn retry_delay(&self, _: u32) -> Duration {
        Duration::ZERO
    }

    fn disposition(
        &self,
        error: &(dyn StdError + Send + Sync + 'static),
        _: u32,
    ) -> Disposition {
        log::warn!("dead-lettering disabled; dropping failed delivery: {error}");
        Disposition::Complete
    }
}

/// Select the engine for this deployment from configuration alone.
pub fn engine_from_config(config: &MessagingConfig) -> Arc<dyn RetryEngine> {
    if config.dead_letter.enabled {
        Arc::new(StandardRetryEngine::new(
            config.dead_letter.clone(),
            config.max_delivery_count,
        ))
    } else {
        Arc::new(DisabledRetryEngine)
    }
}
