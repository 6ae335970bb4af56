//! The broker seam and its adapters.
//!
//! [`BrokerTransport`] is the object-safe surface one concrete broker
//! integration implements: provisioning primitives, envelope send, and
//! peek-lock consumption (receive a leased message, then complete, abandon
//! or dead-letter it). Everything above the seam — the facade, the
//! processor loop, the retry engine — is broker-independent.
//!
//! Adapters:
//! - [`InMemoryTransport`]: full peek-lock simulation, the default backend.
//! - [`NoopTransport`]: for environments where messaging is disabled.
//! - `NatsTransport` (feature `nats`): NATS JetStream.

use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::BusResult;
use crate::message::MessageEnvelope;
use crate::retry::DeadLetterReason;

mod memory;
mod noop;

#[cfg(feature = "nats")]
mod nats;

#[cfg(test)]
mod tests;

pub use memory::{InMemoryTransport, TransportCounters};
pub use noop::NoopTransport;

#[cfg(feature = "nats")]
pub use nats::NatsTransport;

/// Where a message is sent or consumed from.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Destination {
    /// Point-to-point target with one logical consumer group.
    Queue(String),
    /// Fan-out target; consumers attach via named subscriptions.
    Topic(String),
}

impl Destination {
    pub fn name(&self) -> &str {
        match self {
            Destination::Queue(name) | Destination::Topic(name) => name,
        }
    }
}

impl std::fmt::Display for Destination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Destination::Queue(name) => write!(f, "queue:{name}"),
            Destination::Topic(name) => write!(f, "topic:{name}"),
        }
    }
}

/// The consumption side of a subscription: a queue, or a named
/// subscription on a topic.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Source {
    pub destination: Destination,
    /// Subscription name; meaningful only for topic sources.
    pub subscription: Option<String>,
}

impl Source {
    pub fn queue(name: impl Into<String>) -> Self {
        Self {
            destination: Destination::Queue(name.into()),
            subscription: None,
        }
    }

    pub fn subscription(topic: impl Into<String>, subscription: impl Into<String>) -> Self {
        Self {
            destination: Destination::Topic(topic.into()),
            subscription: Some(subscription.into()),
        }
    }
}

impl std::fmt::Display for Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.subscription {
            Some(sub) => write!(f, "{}/{sub}", self.destination),
            None => write!(f, "{}", self.destination),
        }
    }
}

/// Opaque handle for one leased delivery; every disposition call names it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LeaseToken {
    pub source: Source,
    pub token: Uuid,
}

/// A message leased to a consumer. The broker still owns it; the lease is
/// resolved by completing, abandoning or dead-lettering it before the lock
/// expires (or is renewed).
#[derive(Debug, Clone)]
pub struct LeasedMessage {
    pub envelope: MessageEnvelope,
    pub lease: LeaseToken,
}

/// One concrete broker integration.
///
/// Provisioning calls are idempotent: ensuring an entity that already
/// exists is a no-op, never an error. Consumption is peek-lock; a lease
/// that is neither resolved nor renewed within the lock duration returns
/// to the source and the delivery count increments on the next lease.
#[async_trait]
pub trait BrokerTransport: Send + Sync {
    async fn ensure_queue(&self, name: &str) -> BusResult<()>;

    async fn ensure_topic(&self, name: &str) -> BusResult<()>;

    /// Ensure a subscription on `topic` and its binding keyed by
    /// `routing_key` (the event type name).
    async fn ensure_subscription(
        &self,
        topic: &str,
        subscription: &str,
        routing_key: &str,
    ) -> BusResult<()>;

    async fn send(&self, destination: &Destination, envelope: MessageEnvelope) -> BusResult<()>;

    /// Lease the next available message, if any. The envelope's delivery
    /// count reflects this lease.
    async fn receive(
        &self,
        source: &Source,
        lock_duration: Duration,
    ) -> BusResult<Option<LeasedMessage>>;

    /// Permanently remove a completed message.
    async fn complete(&self, lease: &LeaseToken) -> BusResult<()>;

    /// Return a message to its source for redelivery. `delay` schedules
    /// the redelivery where the broker supports it.
    async fn abandon(&self, lease: &LeaseToken, delay: Option<Duration>) -> BusResult<()>;

    /// Move a message to the broker's dead-letter sub-queue.
    async fn dead_letter(
        &self,
        lease: &LeaseToken,
        reason: DeadLetterReason,
        detail: &str,
    ) -> BusResult<()>;

    /// Extend the lock on an in-flight lease.
    async fn renew_lock(&self, lease: &LeaseToken, lock_duration: Duration) -> BusResult<()>;
}
