//! In-process broker with peek-lock semantics.
//!
//! The default backend, and the one the test suite runs against. It
//! simulates the consumption model of a real broker: messages are leased,
//! not destructively read; an unresolved lease expires back onto the
//! queue; the delivery count increments on every lease; abandon honors a
//! scheduled-redelivery delay; expired-TTL messages are discarded.
//!
//! All entity state lives behind one mutex that is never held across an
//! await, so concurrent first-use of a destination resolves to a single
//! instance.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use crate::error::{BusError, BusResult};
use crate::message::MessageEnvelope;
use crate::retry::DeadLetterReason;

use super::{BrokerTransport, Destination, LeaseToken, LeasedMessage, Source};

/// Per-entity operation counts, for assertions and diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransportCounters {
    pub sent: u64,
    pub received: u64,
    pub completed: u64,
    pub abandoned: u64,
    pub dead_lettered: u64,
}

/// A message moved to an entity's dead-letter sub-queue.
#[derive(Debug, Clone)]
pub struct DeadLetteredMessage {
    pub reason: DeadLetterReason,
    pub detail: String,
    pub envelope: MessageEnvelope,
}

struct Lease {
    envelope: MessageEnvelope,
    expires_at: Instant,
}

#[derive(Default)]
struct Entity {
    ready: VecDeque<MessageEnvelope>,
    /// Redeliveries scheduled by abandon-with-delay, due at the instant.
    scheduled: Vec<(Instant, MessageEnvelope)>,
    leased: HashMap<Uuid, Lease>,
    dead: Vec<DeadLetteredMessage>,
    counters: TransportCounters,
}

impl Entity {
    /// Expired leases return to the queue.
    fn restock(&mut self, now: Instant) {
        let expired: Vec<Uuid> = self
            .leased
            .iter()
            .filter(|(_, lease)| lease.expires_at <= now)
            .map(|(token, _)| *token)
            .collect();
        for token in expired {
            if let Some(lease) = self.leased.remove(&token) {
                log::debug!(
                    "lock expired for message {}; returning to queue",
                    lease.envelope.message_id
                );
                self.ready.push_back(lease.envelope);
            }
        }
    }

    /// Due scheduled redeliveries become ready, oldest due first.
    fn restock_scheduled(&mut self, now: Instant) {
        let mut due: Vec<(Instant, MessageEnvelope)> = Vec::new();
        let mut remaining: Vec<(Instant, MessageEnvelope)> = Vec::new();
        for entry in self.scheduled.drain(..) {
            if entry.0 <= now {
                due.push(entry);
            } else {
                remaining.push(entry);
            }
        }
        due.sort_by_key(|(at, _)| *at);
        for (_, envelope) in due {
            self.ready.push_back(envelope);
        }
        self.scheduled = remaining;
    }
}

#[derive(Default)]
struct TopicState {
    subscriptions: HashMap<String, Entity>,
    /// Routing keys bound per subscription; empty set delivers everything.
    bindings: HashMap<String, HashSet<String>>,
}

#[derive(Default)]
struct State {
    queues: HashMap<String, Entity>,
    topics: HashMap<String, TopicState>,
}

impl State {
    fn entity_mut(&mut self, source: &Source) -> BusResult<&mut Entity> {
        match (&source.destination, &source.subscription) {
            (Destination::Queue(name), _) => {
                Ok(self.queues.entry(name.clone()).or_default())
            }
            (Destination::Topic(name), Some(subscription)) => Ok(self
                .topics
                .entry(name.clone())
                .or_default()
                .subscriptions
                .entry(subscription.clone())
                .or_default()),
            (Destination::Topic(name), None) => Err(BusError::transport(format!(
                "consuming topic '{name}' requires a subscription name"
            ))),
        }
    }
}

/// In-process peek-lock broker.
#[derive(Default)]
pub struct InMemoryTransport {
    state: Mutex<State>,
}

impl InMemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> BusResult<std::sync::MutexGuard<'_, State>> {
        self.state
            .lock()
            .map_err(|_| BusError::transport("broker state poisoned"))
    }

    /// Operation counts for a queue or subscription.
    pub fn counters(&self, source: &Source) -> TransportCounters {
        let mut state = match self.lock() {
            Ok(state) => state,
            Err(_) => return TransportCounters::default(),
        };
        state
            .entity_mut(source)
            .map(|e| e.counters)
            .unwrap_or_default()
    }

    /// Ready + scheduled messages waiting on an entity.
    pub fn depth(&self, source: &Source) -> usize {
        let mut state = match self.lock() {
            Ok(state) => state,
            Err(_) => return 0,
        };
        state
            .entity_mut(source)
            .map(|e| e.ready.len() + e.scheduled.len())
            .unwrap_or(0)
    }

    /// Contents of an entity's dead-letter sub-queue.
    pub fn dead_letters(&self, source: &Source) -> Vec<DeadLetteredMessage> {
        let mut state = match self.lock() {
            Ok(state) => state,
            Err(_) => return Vec::new(),
        };
        state
            .entity_mut(source)
            .map(|e| e.dead.clone())
            .unwrap_or_default()
    }

    pub fn queue_exists(&self, name: &str) -> bool {
        self.lock()
            .map(|state| state.queues.contains_key(name))
            .unwrap_or(false)
    }

    pub fn topic_exists(&self, name: &str) -> bool {
        self.lock()
            .map(|state| state.topics.contains_key(name))
            .unwrap_or(false)
    }

    pub fn subscription_exists(&self, topic: &str, subscription: &str) -> bool {
        self.lock()
            .map(|state| {
                state
                    .topics
                    .get(topic)
                    .map(|t| t.subscriptions.contains_key(subscription))
                    .unwrap_or(false)
            })
            .unwrap_or(false)
    }

    pub fn binding_exists(&self, topic: &str, subscription: &str, routing_key: &str) -> bool {
        self.lock()
            .map(|state| {
                state
                    .topics
                    .get(topic)
                    .and_then(|t| t.bindings.get(subscription))
                    .map(|keys| keys.contains(routing_key))
                    .unwrap_or(false)
            })
            .unwrap_or(false)
    }
}

#[async_trait]
impl BrokerTransport for InMemoryTransport {
    async fn ensure_queue(&self, name: &str) -> BusResult<()> {
        let mut state = self.lock()?;
        state.queues.entry(name.to_string()).or_default();
        Ok(())
    }

    async fn ensure_topic(&self, name: &str) -> BusResult<()> {
        let mut state = self.lock()?;
        state.topics.entry(name.to_string()).or_default();
        Ok(())
    }

    async fn ensure_subscription(
        &self,
        topic: &str,
        subscription: &str,
        routing_key: &str,
    ) -> BusResult<()> {
        let mut state = self.lock()?;
        let topic_state = state.topics.entry(topic.to_string()).or_default();
        topic_state
            .subscriptions
            .entry(subscription.to_string())
            .or_default();
        topic_state
            .bindings
            .entry(subscription.to_string())
            .or_default()
            .insert(routing_key.to_string());
        Ok(())
    }

    async fn send(&self, destination: &Destination, envelope: MessageEnvelope) -> BusResult<()> {
        let mut state = self.lock()?;
        match destination {
            Destination::Queue(name) => {
                let entity = state.queues.entry(name.clone()).or_default();
                entity.counters.sent += 1;
                entity.ready.push_back(envelope);
            }
            Destination::Topic(name) => {
                let topic = state.topics.entry(name.clone()).or_default();
                let subject = envelope.subject.clone();
                for (sub_name, entity) in topic.subscriptions.iter_mut() {
                    let matches = topic
                        .bindings
                        .get(sub_name)
                        .map(|keys| keys.is_empty() || keys.contains(&subject))
                        .unwrap_or(true);
                    if matches {
                        entity.counters.sent += 1;
                        entity.ready.push_back(envelope.clone());
                    }
                }
            }
        }
        Ok(())
    }

    async fn receive(
        &self,
        source: &Source,
        lock_duration: Duration,
    ) -> BusResult<Option<LeasedMessage>> {
        let now = Instant::now();
        let mut state = self.lock()?;
        let entity = state.entity_mut(source)?;
        entity.restock(now);
        entity.restock_scheduled(now);

        while let Some(mut envelope) = entity.ready.pop_front() {
            if envelope.is_expired(Utc::now()) {
                log::debug!("message {} expired; discarding", envelope.message_id);
                continue;
            }
            envelope.delivery_count += 1;
            let token = Uuid::new_v4();
            entity.leased.insert(
                token,
                Lease {
                    envelope: envelope.clone(),
                    expires_at: now + lock_duration,
                },
            );
            entity.counters.received += 1;
            return Ok(Some(LeasedMessage {
                envelope,
                lease: LeaseToken {
                    source: source.clone(),
                    token,
                },
            }));
        }
        Ok(None)
    }

    async fn complete(&self, lease: &LeaseToken) -> BusResult<()> {
        let mut state = self.lock()?;
        let entity = state.entity_mut(&lease.source)?;
        match entity.leased.remove(&lease.token) {
            Some(_) => {
                entity.counters.completed += 1;
                Ok(())
            }
            None => Err(BusError::transport(format!(
                "no active lock {} on {}",
                lease.token, lease.source
            ))),
        }
    }

    async fn abandon(&self, lease: &LeaseToken, delay: Option<Duration>) -> BusResult<()> {
        let mut state = self.lock()?;
        let entity = state.entity_mut(&lease.source)?;
        let held = entity.leased.remove(&lease.token).ok_or_else(|| {
            BusError::transport(format!("no active lock {} on {}", lease.token, lease.source))
        })?;
        entity.counters.abandoned += 1;
        match delay.filter(|d| !d.is_zero()) {
            Some(delay) => entity
                .scheduled
                .push((Instant::now() + delay, held.envelope)),
            None => entity.ready.push_back(held.envelope),
        }
        Ok(())
    }

    async fn dead_letter(
        &self,
        lease: &LeaseToken,
        reason: DeadLetterReason,
        detail: &str,
    ) -> BusResult<()> {
        let mut state = self.lock()?;
        let entity = state.entity_mut(&lease.source)?;
        let held = entity.leased.remove(&lease.token).ok_or_else(|| {
            BusError::transport(format!("no active lock {} on {}", lease.token, lease.source))
        })?;
        entity.counters.dead_lettered += 1;
        entity.dead.push(DeadLetteredMessage {
            reason,
            detail: detail.to_string(),
            envelope: held.envelope,
        });
        Ok(())
    }

    async fn renew_lock(&self, lease: &LeaseToken, lock_duration: Duration) -> BusResult<()> {
        let mut state = self.lock()?;
        let entity = state.entity_mut(&lease.source)?;
        match entity.leased.get_mut(&lease.token) {
            Some(held) => {
                held.expires_at = Instant::now() + lock_duration;
                Ok(())
            }
            None => Err(BusError::transport(format!(
                "no active lock {} on {}",
                lease.token, lease.source
            ))),
        }
    }
}
