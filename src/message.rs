//! Message envelope and payload capability traits.
//!
//! Application payloads opt into the bus with [`BusMessage`] (any
//! serializable type with a canonical name) and, for fan-out events, with
//! [`IntegrationEvent`] (adds event id / occurred-at metadata that travels
//! in the envelope's application properties so brokers and consumers can
//! filter without deserializing the body).

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::BusResult;

/// Application-property keys stamped onto envelopes for domain events.
pub const PROP_EVENT_ID: &str = "eventId";
pub const PROP_EVENT_TYPE: &str = "eventType";
pub const PROP_OCCURRED_AT: &str = "occurredAt";

/// Wire content type for all bus payloads.
pub const CONTENT_TYPE_JSON: &str = "application/json";

/// A payload that can travel over the bus.
///
/// The canonical type name defaults to the short Rust type name and is used
/// by the naming convention to derive queue and topic names, so most types
/// only need `impl BusMessage for MyType {}`.
pub trait BusMessage: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Canonical name for this message type.
    fn message_type() -> &'static str {
        short_type_name::<Self>()
    }
}

/// The domain-event capability: a fact published for cross-module
/// consumption. Its identity metadata is copied into the envelope's
/// application properties on publish.
pub trait IntegrationEvent: BusMessage {
    fn event_id(&self) -> Uuid;
    fn occurred_at(&self) -> DateTime<Utc>;

    /// Canonical event type name; equals the message type name.
    fn event_type() -> &'static str {
        Self::message_type()
    }
}

/// Last segment of the Rust type path, e.g. `ProviderRegistered`.
pub(crate) fn short_type_name<T: ?Sized>() -> &'static str {
    let full = std::any::type_name::<T>();
    full.rsplit("::").next().unwrap_or(full)
}

/// The unit the broker owns from send until acknowledgement.
///
/// `delivery_count` is broker-maintained: it is stamped when a message is
/// leased to a consumer and increments on every redelivery.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MessageEnvelope {
    /// Fresh unique id, generated per send/publish.
    pub message_id: String,
    /// Payload type name; doubles as the routing subject.
    pub subject: String,
    /// UTF-8 JSON payload bytes.
    pub body: Vec<u8>,
    pub content_type: String,
    pub created_at: DateTime<Utc>,
    /// Relative time-to-live; expired messages are discarded by the broker.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_to_live: Option<Duration>,
    /// Number of times this message has been leased to a consumer.
    #[serde(default)]
    pub delivery_count: u32,
    /// Event metadata and cross-cutting correlation values, carried outside
    /// the body so it can be read without full deserialization.
    #[serde(default)]
    pub application_properties: HashMap<String, serde_json::Value>,
}

impl MessageEnvelope {
    /// Envelope for a point-to-point message.
    pub fn for_message<M: BusMessage>(
        message: &M,
        time_to_live: Option<Duration>,
    ) -> BusResult<Self> {
        Ok(Self {
            message_id: Uuid::new_v4().to_string(),
            subject: M::message_type().to_string(),
            body: serde_json::to_vec(message)?,
            content_type: CONTENT_TYPE_JSON.to_string(),
            created_at: Utc::now(),
            time_to_live,
            delivery_count: 0,
            application_properties: HashMap::new(),
        })
    }

    /// Envelope for a published event; stamps the domain-event metadata
    /// into the application properties.
    pub fn for_event<E: IntegrationEvent>(
        event: &E,
        time_to_live: Option<Duration>,
    ) -> BusResult<Self> {
        let mut envelope = Self::for_message(event, time_to_live)?;
        envelope.application_properties.insert(
            PROP_EVENT_ID.to_string(),
            serde_json::Value::String(event.event_id().to_string()),
        );
        envelope.application_properties.insert(
            PROP_EVENT_TYPE.to_string(),
            serde_json::Value::String(E::event_type().to_string()),
        );
        envelope.application_properties.insert(
            PROP_OCCURRED_AT.to_string(),
            serde_json::Value::String(event.occurred_at().to_rfc3339()),
        );
        Ok(envelope)
    }

    /// Whether the message has outlived its TTL as of `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match self.time_to_live {
            Some(ttl) => match chrono::Duration::from_std(ttl) {
                Ok(ttl) => self.created_at + ttl < now,
                Err(_) => false,
            },
            None => false,
        }
    }
}
