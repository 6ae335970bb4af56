//! Transport for environments where messaging is disabled.
//!
//! Satisfies the full broker interface so the facade behaves identically
//! regardless of wiring: sends are dropped with a debug log, sources never
//! yield messages, and lease operations fail (there are never leases).

use std::time::Duration;

use async_trait::async_trait;

use crate::error::{BusError, BusResult};
use crate::message::MessageEnvelope;
use crate::retry::DeadLetterReason;

use super::{BrokerTransport, Destination, LeaseToken, LeasedMessage, Source};

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopTransport;

impl NoopTransport {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl BrokerTransport for NoopTransport {
    async fn ensure_queue(&self, _name: &str) -> BusResult<()> {
        Ok(())
    }

    async fn ensure_topic(&self, _name: &str) -> BusResult<()> {
        Ok(())
    }

    async fn ensure_subscription(&self, _: &str, _: &str, _: &str) -> BusResult<()> {
        Ok(())
    }

    async fn send(&self, destination: &Destination, envelope: MessageEnvelope) -> BusResult<()> {
        log::debug!(
            "messaging disabled; dropping message {} to {destination}",
            envelope.message_id
        );
        Ok(())
    }

    async fn receive(
        &self,
        _source: &Source,
        _lock_duration: Duration,
    ) -> BusResult<Option<LeasedMessage>> {
        Ok(None)
    }

    async fn complete(&self, lease: &LeaseToken) -> BusResult<()> {
        Err(BusError::transport(format!(
            "no lease {} exists on a disabled transport",
            lease.token
        )))
    }

    async fn abandon(&self, lease: &LeaseToken, _delay: Option<Duration>) -> BusResult<()> {
        Err(BusError::transport(format!(
            "no lease {} exists on a disabled transport",
            lease.token
        )))
    }

    async fn dead_letter(
        &self,
        lease: &LeaseToken,
        _reason: DeadLetterReason,
        _detail: &str,
    ) -> BusResult<()> {
        Err(BusError::transport(format!(
            "no lease {} exists on a disabled transport",
            lease.token
        )))
    }

    async fn renew_lock(&self, lease: &LeaseToken, _lock_duration: Duration) -> BusResult<()> {
        Err(BusError::transport(format!(
            "no lease {} exists on a disabled transport",
            lease.token
        )))
    }
}
