//! Per-subscription processing loop.
//!
//! One loop per subscription identity: lease a message, dispatch the
//! handler under a concurrency permit while a background task keeps the
//! lock alive, then settle the lease by disposition. A failed disposition
//! call is logged and never crashes the loop; the broker redelivers after
//! lock expiry.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, Instant, MissedTickBehavior};

use crate::config::MessagingConfig;
use crate::dead_letter::{DeadLetterRecord, DeadLetterStore};
use crate::message::MessageEnvelope;
use crate::retry::{DeadLetterReason, Disposition, RetryEngine};
use crate::transport::{BrokerTransport, LeaseToken, LeasedMessage, Source};

use super::{CancellationToken, HandlerOutcome, MessageHandler};

/// Delay before retrying the receive call after a transport error.
const RECEIVE_ERROR_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Clone)]
pub(crate) struct ProcessorSettings {
    pub max_concurrent_calls: usize,
    pub lock_duration: Duration,
    pub max_auto_lock_renewal: Duration,
    pub idle_poll: Duration,
    pub detailed_logging: bool,
    pub admin_notifications: bool,
}

impl ProcessorSettings {
    pub fn from_config(config: &MessagingConfig) -> Self {
        Self {
            max_concurrent_calls: config.max_concurrent_calls,
            lock_duration: config.lock_duration(),
            max_auto_lock_renewal: config.max_auto_lock_renewal(),
            idle_poll: config.idle_poll(),
            detailed_logging: config.dead_letter.detailed_logging,
            admin_notifications: config.dead_letter.admin_notifications,
        }
    }
}

pub(crate) struct Processor {
    source: Source,
    transport: Arc<dyn BrokerTransport>,
    retry: Arc<dyn RetryEngine>,
    dead_letters: Arc<dyn DeadLetterStore>,
    handler: MessageHandler,
    settings: ProcessorSettings,
    token: CancellationToken,
}

pub(crate) struct ProcessorHandle {
    join: JoinHandle<()>,
}

impl ProcessorHandle {
    pub async fn join(self) {
        if let Err(e) = self.join.await {
            log::warn!("processor task ended abnormally: {e}");
        }
    }
}

impl Processor {
    pub fn new(
        source: Source,
        transport: Arc<dyn BrokerTransport>,
        retry: Arc<dyn RetryEngine>,
        dead_letters: Arc<dyn DeadLetterStore>,
        handler: MessageHandler,
        settings: ProcessorSettings,
        token: CancellationToken,
    ) -> Self {
        Self {
            source,
            transport,
            retry,
            dead_letters,
            handler,
            settings,
            token,
        }
    }

    pub fn spawn(self) -> ProcessorHandle {
        ProcessorHandle {
            join: tokio::spawn(self.run()),
        }
    }

    async fn run(self) {
        log::info!(
            "processor started for {} (max {} concurrent)",
            self.source,
            self.settings.max_concurrent_calls
        );
        let semaphore = Arc::new(Semaphore::new(self.settings.max_concurrent_calls));
        let context = Arc::new(DeliveryContext {
            source: self.source.clone(),
            transport: Arc::clone(&self.transport),
            retry: Arc::clone(&self.retry),
            dead_letters: Arc::clone(&self.dead_letters),
            handler: Arc::clone(&self.handler),
            settings: self.settings.clone(),
            token: self.token.clone(),
        });

        loop {
            if self.token.is_cancelled() {
                break;
            }
            let permit = match Arc::clone(&semaphore).acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };
            match self
                .transport
                .receive(&self.source, self.settings.lock_duration)
                .await
            {
                Ok(Some(delivery)) => {
                    let context = Arc::clone(&context);
                    tokio::spawn(async move {
                        context.process(delivery).await;
                        drop(permit);
                    });
                }
                Ok(None) => {
                    drop(permit);
                    tokio::select! {
                        _ = self.token.cancelled() => break,
                        _ = sleep(self.settings.idle_poll) => {}
                    }
                }
                Err(error) => {
                    drop(permit);
                    log::warn!("receive failed on {}: {error}", self.source);
                    tokio::select! {
                        _ = self.token.cancelled() => break,
                        _ = sleep(RECEIVE_ERROR_BACKOFF) => {}
                    }
                }
            }
        }
        log::info!("processor stopped for {}", self.source);
    }
}

/// Everything one in-flight delivery needs, shared across worker tasks.
struct DeliveryContext {
    source: Source,
    transport: Arc<dyn BrokerTransport>,
    retry: Arc<dyn RetryEngine>,
    dead_letters: Arc<dyn DeadLetterStore>,
    handler: MessageHandler,
    settings: ProcessorSettings,
    token: CancellationToken,
}

impl DeliveryContext {
    async fn process(&self, delivery: LeasedMessage) {
        let LeasedMessage { envelope, lease } = delivery;
        let renewal = tokio::spawn(renew_loop(
            Arc::clone(&self.transport),
            lease.clone(),
            self.settings.lock_duration,
            self.settings.max_auto_lock_renewal,
        ));
        let outcome = (self.handler)(envelope.clone(), self.token.clone()).await;
        renewal.abort();

        match outcome {
            HandlerOutcome::Completed => {
                if let Err(e) = self.transport.complete(&lease).await {
                    log::error!(
                        "failed to complete message {} on {}: {e}",
                        envelope.message_id,
                        self.source
                    );
                    return;
                }
                self.trace(format_args!(
                    "completed {} ({}) on delivery {}",
                    envelope.message_id, envelope.subject, envelope.delivery_count
                ));
            }
            HandlerOutcome::Malformed(detail) => {
                log::warn!(
                    "message {} on {} failed deserialization: {detail}",
                    envelope.message_id,
                    self.source
                );
                self.dead_letter(
                    &envelope,
                    &lease,
                    DeadLetterReason::DeserializationFailed,
                    detail,
                )
                .await;
            }
            HandlerOutcome::Failed(error) => {
                self.settle_failure(&envelope, &lease, error).await;
            }
        }
    }

    async fn settle_failure(
        &self,
        envelope: &MessageEnvelope,
        lease: &LeaseToken,
        error: super::HandlerError,
    ) {
        let detail = error_chain(error.as_ref());
        match self.retry.disposition(error.as_ref(), envelope.delivery_count) {
            Disposition::Complete => {
                log::warn!(
                    "dropping failed message {} on {} (dead-lettering disabled): {detail}",
                    envelope.message_id,
                    self.source
                );
                if let Err(e) = self.transport.complete(lease).await {
                    log::error!("failed to drop message {}: {e}", envelope.message_id);
                }
            }
            Disposition::Abandon { retry_delay } => {
                self.trace(format_args!(
                    "abandoning {} on {} after delivery {} (retry in {:?}): {detail}",
                    envelope.message_id, self.source, envelope.delivery_count, retry_delay
                ));
                if let Err(e) = self.transport.abandon(lease, Some(retry_delay)).await {
                    log::error!("failed to abandon message {}: {e}", envelope.message_id);
                }
            }
            Disposition::DeadLetter { reason } => {
                self.dead_letter(envelope, lease, reason, detail).await;
            }
        }
    }

    async fn dead_letter(
        &self,
        envelope: &MessageEnvelope,
        lease: &LeaseToken,
        reason: DeadLetterReason,
        detail: String,
    ) {
        let record = DeadLetterRecord::from_envelope(envelope, reason, &detail);
        if let Err(e) = self.dead_letters.record(&record) {
            log::error!(
                "failed to record dead letter for message {}: {e}",
                envelope.message_id
            );
        }
        if self.settings.admin_notifications {
            log::warn!(
                "ADMIN: message {} ({}) dead-lettered on {}: {reason} ({detail})",
                envelope.message_id,
                envelope.subject,
                self.source
            );
        } else {
            log::warn!(
                "message {} dead-lettered on {}: {reason}",
                envelope.message_id,
                self.source
            );
        }
        if let Err(e) = self.transport.dead_letter(lease, reason, &detail).await {
            log::error!(
                "failed to dead-letter message {}: {e}",
                envelope.message_id
            );
        }
    }

    fn trace(&self, message: std::fmt::Arguments<'_>) {
        if self.settings.detailed_logging {
            log::info!("{message}");
        } else {
            log::debug!("{message}");
        }
    }
}

/// Keep a lease alive while the handler runs, renewing at half the lock
/// duration, until the renewal window is exhausted or the handler task
/// aborts this one.
async fn renew_loop(
    transport: Arc<dyn BrokerTransport>,
    lease: LeaseToken,
    lock_duration: Duration,
    max_auto_lock_renewal: Duration,
) {
    let deadline = Instant::now() + max_auto_lock_renewal;
    let period = (lock_duration / 2).max(Duration::from_millis(1));
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await; // first tick fires immediately
    loop {
        ticker.tick().await;
        if Instant::now() >= deadline {
            log::debug!("lock renewal window exhausted for {}", lease.source);
            break;
        }
        if let Err(e) = transport.renew_lock(&lease, lock_duration).await {
            log::debug!("lock renewal stopped for {}: {e}", lease.source);
            break;
        }
    }
}

/// Full display chain of an error, outermost first.
fn error_chain(error: &(dyn std::error::Error + 'static)) -> String {
    let mut chain = error.to_string();
    let mut current = error.source();
    while let Some(cause) = current {
        chain.push_str(": ");
        chain.push_str(&cause.to_string());
        current = cause.source();
    }
    chain
}
