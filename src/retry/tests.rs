use std::io;
use std::time::Duration;

use super::*;

fn options(initial_ms: u64, multiplier: f64, max_ms: u64, attempts: u32) -> DeadLetterOptions {
    DeadLetterOptions {
        max_retry_attempts: attempts,
        initial_retry_delay_ms: initial_ms,
        backoff_multiplier: multiplier,
        max_retry_delay_ms: max_ms,
        ..Default::default()
    }
}

fn engine() -> StandardRetryEngine {
    StandardRetryEngine::new(options(2_000, 2.0, 300_000, 5), 5)
}

#[derive(Debug)]
struct ValidationError(&'static str);

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "validation failed: {}", self.0)
    }
}

impl std::error::Error for ValidationError {}

#[derive(Debug)]
struct WrappedError {
    inner: io::Error,
}

impl std::fmt::Display for WrappedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "handler failed")
    }
}

impl std::error::Error for WrappedError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.inner)
    }
}

#[test]
fn backoff_doubles_per_attempt() {
    let engine = engine();
    assert_eq!(engine.retry_delay(1), Duration::from_secs(2));
    assert_eq!(engine.retry_delay(2), Duration::from_secs(4));
    assert_eq!(engine.retry_delay(3), Duration::from_secs(8));
}

#[test]
fn backoff_caps_at_max_delay() {
    let engine = engine();
    // 2s * 2^9 = 1024s uncapped; the cap wins exactly.
    assert_eq!(engine.retry_delay(10), Duration::from_secs(300));
    assert_eq!(engine.retry_delay(100), Duration::from_secs(300));
}

#[test]
fn backoff_is_nondecreasing_and_bounded() {
    let engine = engine();
    let max = Duration::from_secs(300);
    let mut previous = Duration::ZERO;
    for attempt in 1..=64 {
        let delay = engine.retry_delay(attempt);
        assert!(delay >= previous, "delay decreased at attempt {attempt}");
        assert!(delay <= max, "delay exceeded cap at attempt {attempt}");
        previous = delay;
    }
}

#[test]
fn backoff_with_unit_multiplier_is_flat() {
    let engine = StandardRetryEngine::new(options(500, 1.0, 10_000, 5), 5);
    assert_eq!(engine.retry_delay(1), Duration::from_millis(500));
    assert_eq!(engine.retry_delay(7), Duration::from_millis(500));
}

#[test]
fn typed_io_errors_are_transient() {
    let engine = engine();
    for kind in [
        io::ErrorKind::TimedOut,
        io::ErrorKind::ConnectionRefused,
        io::ErrorKind::ConnectionReset,
        io::ErrorKind::BrokenPipe,
    ] {
        let err = io::Error::new(kind, "boom");
        assert!(engine.should_retry(&err, 1), "{kind:?} should be retryable");
    }
}

#[test]
fn message_substring_match_is_case_insensitive() {
    let engine = engine();
    let err = ValidationError("upstream service UNAVAILABLE right now");
    // "unavailable" marker matches despite the casing.
    assert!(engine.is_transient(&err));
}

#[test]
fn nested_source_errors_are_found() {
    let engine = engine();
    let err = WrappedError {
        inner: io::Error::new(io::ErrorKind::TimedOut, "deadline exceeded"),
    };
    // the outer message says nothing transient; the inner io error does
    assert!(engine.should_retry(&err, 1));
}

#[test]
fn validation_errors_are_permanent() {
    let engine = engine();
    let err = ValidationError("missing provider id");
    assert!(!engine.is_transient(&err));
    assert!(!engine.should_retry(&err, 1));
}

#[test]
fn exhausted_attempts_stop_retries_even_for_transient_errors() {
    let engine = engine();
    let err = io::Error::new(io::ErrorKind::TimedOut, "boom");
    assert!(engine.should_retry(&err, 4));
    assert!(!engine.should_retry(&err, 5));
    assert!(!engine.should_retry(&err, 50));
}

#[test]
fn transient_failure_with_budget_abandons_with_backoff() {
    let engine = engine();
    let err = io::Error::new(io::ErrorKind::ConnectionReset, "boom");
    match engine.disposition(&err, 2) {
        Disposition::Abandon { retry_delay } => {
            assert_eq!(retry_delay, Duration::from_secs(4));
        }
        other => panic!("expected abandon, got {other:?}"),
    }
}

#[test]
fn transient_failure_past_delivery_budget_dead_letters() {
    let engine = engine();
    let err = io::Error::new(io::ErrorKind::TimedOut, "boom");
    assert_eq!(
        engine.disposition(&err, 5),
        Disposition::DeadLetter {
            reason: DeadLetterReason::MaxDeliveryCountExceeded
        }
    );
}

#[test]
fn permanent_failure_dead_letters_on_first_attempt() {
    let engine = engine();
    let err = ValidationError("malformed catalog entry");
    assert_eq!(
        engine.disposition(&err, 1),
        Disposition::DeadLetter {
            reason: DeadLetterReason::PermanentFailure
        }
    );
}

#[test]
fn custom_markers_extend_classification() {
    let base = StandardRetryEngine::new(options(100, 2.0, 1_000, 3), 3);
    let err = ValidationError("broker said SLOW_CONSUMER");
    assert!(!base.is_transient(&err));
    let extended = StandardRetryEngine::new(options(100, 2.0, 1_000, 3), 3)
        .with_transient_markers(["slow_consumer"]);
    assert!(extended.is_transient(&err));
}

#[test]
fn disabled_engine_never_retries() {
    let engine = DisabledRetryEngine;
    let err = io::Error::new(io::ErrorKind::TimedOut, "boom");
    assert!(!engine.should_retry(&err, 1));
    assert_eq!(engine.disposition(&err, 1), Disposition::Complete);
}

#[test]
fn factory_selects_engine_from_config() {
    let mut config = crate::config::MessagingConfig::default();
    let engine = engine_from_config(&config);
    let err = io::Error::new(io::ErrorKind::TimedOut, "boom");
    assert!(engine.should_retry(&err, 1));

    config.dead_letter.enabled = false;
    let engine = engine_from_config(&config);
    assert!(!engine.should_retry(&err, 1));
}
