//! NATS JetStream transport.
//!
//! Mapping onto the peek-lock model: a stream per destination, a durable
//! pull consumer per subscription identity, `ack` completes, `Nak(delay)`
//! abandons with scheduled redelivery, `Term` dead-letters, `Progress`
//! renews the lock (`ack_wait`), and the server-side `delivered` count is
//! the delivery count. JetStream has no per-message dead-letter sub-queue,
//! so terminal records live in the crate's [`DeadLetterStore`]
//! (`crate::dead_letter`) and the message is terminated here.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_nats::jetstream::{
    self,
    consumer::{pull, AckPolicy, PullConsumer},
    stream, AckKind,
};
use async_trait::async_trait;
use futures_util::StreamExt;
use uuid::Uuid;

use crate::error::{BusError, BusResult};
use crate::message::MessageEnvelope;
use crate::retry::DeadLetterReason;

use super::{BrokerTransport, Destination, LeaseToken, LeasedMessage, Source};

/// Stream names may not contain subject token separators.
fn stream_name(destination: &str) -> String {
    destination.replace(['.', '*', '>'], "_")
}

fn consumer_name(source: &Source) -> String {
    match &source.subscription {
        Some(sub) => format!("{}_{}", stream_name(source.destination.name()), sub),
        None => stream_name(source.destination.name()),
    }
}

pub struct NatsTransport {
    context: jetstream::Context,
    max_deliver: i64,
    consumers: Mutex<HashMap<Source, PullConsumer>>,
    leases: Mutex<HashMap<Uuid, jetstream::Message>>,
}

impl NatsTransport {
    /// Connect and initialize a JetStream context.
    pub async fn connect(url: &str, max_delivery_count: u32) -> BusResult<Self> {
        let client = async_nats::connect(url)
            .await
            .map_err(|e| BusError::transport(format!("nats connect to {url}: {e}")))?;
        log::info!("connected to NATS at {url}");
        Ok(Self {
            context: jetstream::new(client),
            max_deliver: max_delivery_count as i64,
            consumers: Mutex::new(HashMap::new()),
            leases: Mutex::new(HashMap::new()),
        })
    }

    fn subject_for(&self, destination: &Destination, envelope: &MessageEnvelope) -> String {
        match destination {
            Destination::Queue(name) => name.clone(),
            // topic subjects are suffixed with the type name so bindings
            // (consumer filters) can key on it
            Destination::Topic(name) => format!("{name}.{}", envelope.subject),
        }
    }

    async fn ensure_stream(&self, destination: &Destination) -> BusResult<stream::Stream> {
        let (name, subjects) = match destination {
            Destination::Queue(queue) => (stream_name(queue), vec![queue.clone()]),
            Destination::Topic(topic) => (stream_name(topic), vec![format!("{topic}.>")]),
        };
        self.context
            .get_or_create_stream(stream::Config {
                name: name.clone(),
                subjects,
                storage: stream::StorageType::File,
                ..Default::default()
            })
            .await
            .map_err(|e| BusError::provisioning(name, e))
    }

    async fn consumer_for(
        &self,
        source: &Source,
        lock_duration: Duration,
    ) -> BusResult<PullConsumer> {
        if let Some(consumer) = self
            .consumers
            .lock()
            .map_err(|_| BusError::transport("consumer cache poisoned"))?
            .get(source)
        {
            return Ok(consumer.clone());
        }

        let stream = self.ensure_stream(&source.destination).await?;
        let name = consumer_name(source);
        let filter_subject = match &source.destination {
            Destination::Queue(queue) => queue.clone(),
            Destination::Topic(topic) => format!("{topic}.>"),
        };
        let consumer = stream
            .get_or_create_consumer(
                &name,
                pull::Config {
                    durable_name: Some(name.clone()),
                    filter_subject,
                    ack_policy: AckPolicy::Explicit,
                    ack_wait: lock_duration,
                    max_deliver: self.max_deliver,
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| BusError::provisioning(name, e))?;

        let mut cache = self
            .consumers
            .lock()
            .map_err(|_| BusError::transport("consumer cache poisoned"))?;
        // a racing first-use may have inserted one already; keep the first
        Ok(cache.entry(source.clone()).or_insert(consumer).clone())
    }

    fn take_lease(&self, lease: &LeaseToken) -> BusResult<jetstream::Message> {
        self.leases
            .lock()
            .map_err(|_| BusError::transport("lease table poisoned"))?
            .remove(&lease.token)
            .ok_or_else(|| {
                BusError::transport(format!("no active lock {} on {}", lease.token, lease.source))
            })
    }
}

#[async_trait]
impl BrokerTransport for NatsTransport {
    async fn ensure_queue(&self, name: &str) -> BusResult<()> {
        self.ensure_stream(&Destination::Queue(name.to_string()))
            .await
            .map(|_| ())
    }

    async fn ensure_topic(&self, name: &str) -> BusResult<()> {
        self.ensure_stream(&Destination::Topic(name.to_string()))
            .await
            .map(|_| ())
    }

    async fn ensure_subscription(
        &self,
        topic: &str,
        subscription: &str,
        _routing_key: &str,
    ) -> BusResult<()> {
        // the durable consumer is the subscription; its filter covers the
        // whole topic since topics are already type-scoped
        let source = Source::subscription(topic, subscription);
        self.consumer_for(&source, Duration::from_secs(30)).await?;
        Ok(())
    }

    async fn send(&self, destination: &Destination, envelope: MessageEnvelope) -> BusResult<()> {
        self.ensure_stream(destination).await?;
        let subject = self.subject_for(destination, &envelope);
        let payload = serde_json::to_vec(&envelope)?;
        let ack = self
            .context
            .publish(subject.clone(), payload.into())
            .await
            .map_err(|e| BusError::transport(format!("publish to {subject}: {e}")))?;
        ack.await
            .map_err(|e| BusError::transport(format!("publish ack for {subject}: {e}")))?;
        Ok(())
    }

    async fn receive(
        &self,
        source: &Source,
        lock_duration: Duration,
    ) -> BusResult<Option<LeasedMessage>> {
        let consumer = self.consumer_for(source, lock_duration).await?;
        let mut batch = consumer
            .fetch()
            .max_messages(1)
            .expires(Duration::from_millis(500))
            .messages()
            .await
            .map_err(|e| BusError::transport(format!("fetch from {source}: {e}")))?;

        let message = match batch.next().await {
            Some(Ok(message)) => message,
            Some(Err(e)) => {
                return Err(BusError::transport(format!("fetch from {source}: {e}")))
            }
            None => return Ok(None),
        };

        let mut envelope: MessageEnvelope = serde_json::from_slice(&message.payload)?;
        envelope.delivery_count = message
            .info()
            .map(|info| info.delivered.max(1) as u32)
            .unwrap_or(1);

        let token = Uuid::new_v4();
        self.leases
            .lock()
            .map_err(|_| BusError::transport("lease table poisoned"))?
            .insert(token, message);

        Ok(Some(LeasedMessage {
            envelope,
            lease: LeaseToken {
                source: source.clone(),
                token,
            },
        }))
    }

    async fn complete(&self, lease: &LeaseToken) -> BusResult<()> {
        let message = self.take_lease(lease)?;
        message
            .ack()
            .await
            .map_err(|e| BusError::transport(format!("ack on {}: {e}", lease.source)))
    }

    async fn abandon(&self, lease: &LeaseToken, delay: Option<Duration>) -> BusResult<()> {
        let message = self.take_lease(lease)?;
        message
            .ack_with(AckKind::Nak(delay))
            .await
            .map_err(|e| BusError::transport(format!("nak on {}: {e}", lease.source)))
    }

    async fn dead_letter(
        &self,
        lease: &LeaseToken,
        reason: DeadLetterReason,
        detail: &str,
    ) -> BusResult<()> {
        let message = self.take_lease(lease)?;
        log::warn!(
            "terminating message on {}: {reason} ({detail})",
            lease.source
        );
        message
            .ack_with(AckKind::Term)
            .await
            .map_err(|e| BusError::transport(format!("term on {}: {e}", lease.source)))
    }

    async fn renew_lock(&self, lease: &LeaseToken, _lock_duration: Duration) -> BusResult<()> {
        let message = {
            let leases = self
                .leases
                .lock()
                .map_err(|_| BusError::transport("lease table poisoned"))?;
            leases.get(&lease.token).cloned()
        };
        match message {
            Some(message) => message
                .ack_with(AckKind::Progress)
                .await
                .map_err(|e| BusError::transport(format!("progress on {}: {e}", lease.source))),
            None => Err(BusError::transport(format!(
                "no active lock {} on {}",
                lease.token, lease.source
            ))),
        }
    }
}
