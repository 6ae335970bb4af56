//! # Omnibus
//!
//! `omnibus` is a broker-agnostic reliable messaging core. It provides a
//! single facade for point-to-point messaging and publish/subscribe
//! eventing, layered with delivery-failure classification, exponential
//! backoff retry, and dead-letter routing for poison messages.
//!
//! ## Core Modules
//!
//! - `bus`: the [`MessageBus`] facade and the per-subscription processor loop.
//! - `transport`: the broker seam ([`BrokerTransport`]) and its adapters
//!   (in-memory peek-lock simulation, no-op, NATS JetStream behind the
//!   `nats` feature).
//! - `retry`: the dead-letter/retry decision engine — transient/permanent
//!   classification and backoff calculation.
//! - `dead_letter`: terminal records for poison messages and the stores
//!   that hold them.
//! - `topology`: idempotent provisioning of queues, topics and bindings.
//! - `registry` / `routing`: event-type bookkeeping and the type-name to
//!   destination naming convention.
//! - `config`: TOML + environment driven configuration.
//!
//! ## Delivery model
//!
//! Delivery is at-least-once: consumers see a leased message, and the lease
//! is resolved by completing, abandoning (redeliver with an incremented
//! delivery count) or dead-lettering it. Handlers are expected to be
//! idempotent.
//!
//! ```no_run
//! use omnibus::{MessageBus, MessagingConfig, BusMessage};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Serialize, Deserialize)]
//! struct ProviderRegistered { provider_id: String }
//! impl BusMessage for ProviderRegistered {}
//!
//! # async fn demo() -> omnibus::BusResult<()> {
//! let bus = MessageBus::from_config(MessagingConfig::default())?;
//! bus.subscribe(|msg: ProviderRegistered, _token| async move {
//!     println!("registered {}", msg.provider_id);
//!     Ok(())
//! }, None).await?;
//! bus.send(&ProviderRegistered { provider_id: "p-1".into() }, None).await?;
//! # Ok(())
//! # }
//! ```

pub mod bus;
pub mod config;
pub mod dead_letter;
pub mod error;
pub mod message;
pub mod registry;
pub mod retry;
pub mod routing;
pub mod topology;
pub mod transport;

pub use bus::{CancellationToken, HandlerError, MessageBus};
pub use config::{BrokerKind, DeadLetterOptions, MessagingConfig};
pub use dead_letter::{DeadLetterRecord, DeadLetterStore, MemoryDeadLetterStore, SledDeadLetterStore};
pub use error::{BusError, BusResult};
pub use message::{BusMessage, IntegrationEvent, MessageEnvelope};
pub use registry::EventTypeRegistry;
pub use retry::{DeadLetterReason, Disposition, RetryEngine, StandardRetryEngine};
pub use routing::TopicStrategy;
pub use topology::TopologyManager;
pub use transport::{BrokerTransport, Destination, InMemoryTransport, LeasedMessage};
