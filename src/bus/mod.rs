//! The message bus facade.
//!
//! The single interface application code depends on: `send` for
//! point-to-point messages, `publish` for events, `subscribe` to register
//! durable consumers. The facade delegates to whichever
//! [`BrokerTransport`] the configuration selects and never leaks which
//! backend is wired in — a disabled environment gets a no-op transport
//! behind the same surface.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::watch;

use crate::config::{BrokerKind, MessagingConfig};
use crate::dead_letter::{DeadLetterStore, MemoryDeadLetterStore, SledDeadLetterStore};
use crate::error::{BusError, BusResult};
use crate::message::{BusMessage, IntegrationEvent, MessageEnvelope};
use crate::retry::{engine_from_config, RetryEngine};
use crate::routing::TopicStrategy;
use crate::transport::{BrokerTransport, Destination, InMemoryTransport, NoopTransport, Source};

mod processor;


use processor::{Processor, ProcessorHandle, ProcessorSettings};

/// Error type returned by message handlers. Classification (transient
/// versus permanent) walks the source chain, so wrapping is fine.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Outcome of one handler invocation, as seen by the processor.
pub(crate) enum HandlerOutcome {
    Completed,
    /// The body could not be parsed into the declared type; the handler
    /// was never invoked.
    Malformed(String),
    Failed(HandlerError),
}

/// Type-erased handler: envelope bytes in, outcome out.
pub(crate) type MessageHandler =
    Arc<dyn Fn(MessageEnvelope, CancellationToken) -> BoxFuture<'static, HandlerOutcome> + Send + Sync>;

/// Cooperative cancellation signal flowing from the bus into every
/// processor and handler invocation. Cancellation never forcibly abandons
/// broker calls already in flight.
#[derive(Clone, Debug)]
pub struct CancellationToken {
    receiver: watch::Receiver<bool>,
}

impl CancellationToken {
    pub fn is_cancelled(&self) -> bool {
        *self.receiver.borrow()
    }

    /// Resolves when cancellation is requested (or the bus is dropped).
    pub async fn cancelled(&self) {
        let mut receiver = self.receiver.clone();
        loop {
            if *receiver.borrow() {
                return;
            }
            if receiver.changed().await.is_err() {
                return;
            }
        }
    }
}

struct Canceller {
    sender: watch::Sender<bool>,
}

impl Canceller {
    fn new() -> (Self, CancellationToken) {
        let (sender, receiver) = watch::channel(false);
        (Self { sender }, CancellationToken { receiver })
    }

    fn cancel(&self) {
        let _ = self.sender.send(true);
    }
}

/// Identity of one consumer: `(destination name, subscription name)`.
type SubscriptionIdentity = (String, String);

/// Broker-agnostic send/publish/subscribe facade.
pub struct MessageBus {
    transport: Arc<dyn BrokerTransport>,
    config: MessagingConfig,
    strategy: TopicStrategy,
    retry: Arc<dyn RetryEngine>,
    dead_letters: Arc<dyn DeadLetterStore>,
    processors: Mutex<HashMap<SubscriptionIdentity, ProcessorHandle>>,
    canceller: Canceller,
    token: CancellationToken,
}

impl MessageBus {
    /// Wire the bus from configuration alone. A disabled configuration
    /// gets a no-op transport behind the same interface; the `memory`
    /// broker gets the in-process peek-lock transport. The `nats` broker
    /// requires an async connection — use [`MessageBus::connect`].
    pub fn from_config(config: MessagingConfig) -> BusResult<Self> {
        config.validate()?;
        if !config.enabled {
            log::info!("messaging disabled; using no-op transport");
            return Self::with_transport(Arc::new(NoopTransport::new()), config);
        }
        match config.broker {
            BrokerKind::Memory => {
                Self::with_transport(Arc::new(InMemoryTransport::new()), config)
            }
            BrokerKind::Nats => Err(BusError::Configuration(
                "the nats broker connects asynchronously; use MessageBus::connect".into(),
            )),
        }
    }

    /// Async factory covering every broker kind.
    #[cfg(feature = "nats")]
    pub async fn connect(config: MessagingConfig) -> BusResult<Self> {
        config.validate()?;
        if !config.enabled || config.broker == BrokerKind::Memory {
            return Self::from_config(config);
        }
        let url = config
            .broker_url
            .clone()
            .ok_or_else(|| BusError::Configuration("broker_url is required for nats".into()))?;
        let transport =
            crate::transport::NatsTransport::connect(&url, config.max_delivery_count).await?;
        Self::with_transport(Arc::new(transport), config)
    }

    /// Wire the bus over an explicit transport (custom adapters, tests).
    pub fn with_transport(
        transport: Arc<dyn BrokerTransport>,
        config: MessagingConfig,
    ) -> BusResult<Self> {
        config.validate()?;
        let dead_letters: Arc<dyn DeadLetterStore> = match &config.dead_letter_path {
            Some(path) => Arc::new(SledDeadLetterStore::open(path)?),
            None => Arc::new(MemoryDeadLetterStore::new()),
        };
        let (canceller, token) = Canceller::new();
        Ok(Self {
            strategy: TopicStrategy::new(config.namespace.clone()),
            retry: engine_from_config(&config),
            dead_letters,
            transport,
            config,
            processors: Mutex::new(HashMap::new()),
            canceller,
            token,
        })
    }

    /// Point-to-point delivery. The queue defaults to the naming
    /// convention's result for `M`. Transport failures surface directly;
    /// the retry engine only governs consumption.
    pub async fn send<M: BusMessage>(&self, message: &M, queue: Option<&str>) -> BusResult<()> {
        let envelope = MessageEnvelope::for_message(message, self.config.default_time_to_live())?;
        let queue = queue
            .map(str::to_owned)
            .unwrap_or_else(|| self.strategy.queue_name::<M>());
        self.log_dispatch("send", &envelope, &queue);
        self.transport
            .send(&Destination::Queue(queue), envelope)
            .await
    }

    /// Fan-out delivery to a topic. Stamps the event's id, type and
    /// occurred-at into the envelope's application properties.
    pub async fn publish<E: IntegrationEvent>(
        &self,
        event: &E,
        topic: Option<&str>,
    ) -> BusResult<()> {
        let envelope = MessageEnvelope::for_event(event, self.config.default_time_to_live())?;
        let topic = topic
            .map(str::to_owned)
            .unwrap_or_else(|| self.strategy.topic_name::<E>());
        self.log_dispatch("publish", &envelope, &topic);
        self.transport
            .send(&Destination::Topic(topic), envelope)
            .await
    }

    /// Register a durable consumer for `T` on its topic. Idempotent per
    /// `(topic, subscription)` identity: a second call is a logged no-op.
    /// Returns once the processor accepts messages; does not block for its
    /// lifetime.
    pub async fn subscribe<T, F, Fut>(
        &self,
        handler: F,
        subscription: Option<&str>,
    ) -> BusResult<()>
    where
        T: BusMessage,
        F: Fn(T, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        let topic = self.strategy.destination_for(T::message_type());
        let subscription = subscription
            .unwrap_or(&self.config.subscription)
            .to_string();
        self.transport.ensure_topic(&topic).await?;
        self.transport
            .ensure_subscription(&topic, &subscription, T::message_type())
            .await?;
        let source = Source::subscription(topic, subscription);
        self.start_processor(source, make_handler(handler))
    }

    /// Register a consumer on a point-to-point queue (defaults to the
    /// naming convention's queue for `T`).
    pub async fn subscribe_queue<T, F, Fut>(
        &self,
        handler: F,
        queue: Option<&str>,
    ) -> BusResult<()>
    where
        T: BusMessage,
        F: Fn(T, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        let queue = queue
            .map(str::to_owned)
            .unwrap_or_else(|| self.strategy.queue_name::<T>());
        self.transport.ensure_queue(&queue).await?;
        let source = Source::queue(queue);
        self.start_processor(source, make_handler(handler))
    }

    /// Number of live processors (one per subscription identity).
    pub fn active_processor_count(&self) -> usize {
        self.processors.lock().map(|p| p.len()).unwrap_or(0)
    }

    /// The store holding terminal records for poison messages.
    pub fn dead_letter_store(&self) -> Arc<dyn DeadLetterStore> {
        Arc::clone(&self.dead_letters)
    }

    /// Cancellation token observed by processors and handlers.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Request cooperative shutdown and wait for processor loops to exit.
    /// In-flight handler invocations observe the token; broker calls
    /// already issued are not aborted.
    pub async fn shutdown(&self) {
        self.canceller.cancel();
        let handles: Vec<ProcessorHandle> = {
            match self.processors.lock() {
                Ok(mut processors) => processors.drain().map(|(_, handle)| handle).collect(),
                Err(_) => Vec::new(),
            }
        };
        for handle in handles {
            handle.join().await;
        }
    }

    fn start_processor(&self, source: Source, handler: MessageHandler) -> BusResult<()> {
        let identity = (
            source.destination.name().to_string(),
            source.subscription.clone().unwrap_or_default(),
        );
        let mut processors = self
            .processors
            .lock()
            .map_err(|_| BusError::transport("processor table poisoned"))?;
        if processors.contains_key(&identity) {
            log::info!("{source} already has an active processor; ignoring duplicate subscribe");
            return Ok(());
        }
        let processor = Processor::new(
            source,
            Arc::clone(&self.transport),
            Arc::clone(&self.retry),
            Arc::clone(&self.dead_letters),
            handler,
            ProcessorSettings::from_config(&self.config),
            self.token.clone(),
        );
        processors.insert(identity, processor.spawn());
        Ok(())
    }

    fn log_dispatch(&self, operation: &str, envelope: &MessageEnvelope, destination: &str) {
        if self.config.dead_letter.detailed_logging {
            log::info!(
                "{operation} {} ({}) -> {destination}",
                envelope.message_id,
                envelope.subject
            );
        } else {
            log::debug!(
                "{operation} {} ({}) -> {destination}",
                envelope.message_id,
                envelope.subject
            );
        }
    }
}

/// Wrap a typed handler into the envelope-level handler the processor
/// drives. Deserialization happens here: a body that cannot be parsed into
/// `T` (or is empty) is reported malformed without invoking the handler.
fn make_handler<T, F, Fut>(handler: F) -> MessageHandler
where
    T: BusMessage,
    F: Fn(T, CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    let handler = Arc::new(handler);
    Arc::new(move |envelope: MessageEnvelope, token: CancellationToken| {
        let handler = Arc::clone(&handler);
        async move {
            if envelope.body.is_empty() {
                return HandlerOutcome::Malformed("empty message body".into());
            }
            match serde_json::from_slice::<T>(&envelope.body) {
                Err(e) => HandlerOutcome::Malformed(e.to_string()),
                Ok(payload) => match handler(payload, token).await {
                    Ok(()) => HandlerOutcome::Completed,
                    Err(error) => HandlerOutcome::Failed(error),
                },
            }
        }
        .boxed()
    })
}
