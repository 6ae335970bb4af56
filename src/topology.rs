//! Idempotent provisioning of messaging topology.
//!
//! Runs before any traffic flows: the default queue, every statically
//! configured domain queue, and — for each event type in the registry — a
//! topic, a subscription queue for this service, and the binding between
//! them keyed by event type name. Every call is idempotent, so this runs
//! on every process start without coordination. Failure here is fatal:
//! the system cannot guarantee delivery without its topology.

use std::sync::Arc;

use crate::config::MessagingConfig;
use crate::error::{BusError, BusResult};
use crate::registry::EventTypeRegistry;
use crate::transport::BrokerTransport;

pub struct TopologyManager {
    transport: Arc<dyn BrokerTransport>,
    config: MessagingConfig,
}

impl TopologyManager {
    pub fn new(transport: Arc<dyn BrokerTransport>, config: MessagingConfig) -> Self {
        Self { transport, config }
    }

    /// Ensure every queue, topic and binding exists.
    pub async fn provision(&self, registry: &EventTypeRegistry) -> BusResult<()> {
        self.transport
            .ensure_queue(&self.config.default_queue)
            .await
            .map_err(|e| wrap(&self.config.default_queue, e))?;

        for queue in &self.config.queues {
            self.transport
                .ensure_queue(queue)
                .await
                .map_err(|e| wrap(queue, e))?;
        }

        for descriptor in registry.descriptors() {
            self.transport
                .ensure_topic(&descriptor.topic_name)
                .await
                .map_err(|e| wrap(&descriptor.topic_name, e))?;
            self.transport
                .ensure_subscription(
                    &descriptor.topic_name,
                    &self.config.subscription,
                    descriptor.type_name,
                )
                .await
                .map_err(|e| {
                    wrap(
                        &format!("{}/{}", descriptor.topic_name, self.config.subscription),
                        e,
                    )
                })?;
        }

        log::info!(
            "messaging topology provisioned: {} static queue(s), {} event type(s)",
            self.config.queues.len() + 1,
            registry.len()
        );
        Ok(())
    }
}

fn wrap(entity: &str, error: BusError) -> BusError {
    match error {
        already @ BusError::Provisioning { .. } => already,
        other => BusError::provisioning(entity, other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Serialize};
    use uuid::Uuid;

    use crate::message::{BusMessage, IntegrationEvent};
    use crate::routing::TopicStrategy;
    use crate::transport::InMemoryTransport;

    #[derive(Serialize, Deserialize)]
    struct ProviderRegistered {
        event_id: Uuid,
        at: DateTime<Utc>,
    }
    impl BusMessage for ProviderRegistered {}
    impl IntegrationEvent for ProviderRegistered {
        fn event_id(&self) -> Uuid {
            self.event_id
        }
        fn occurred_at(&self) -> DateTime<Utc> {
            self.at
        }
    }

    fn config() -> MessagingConfig {
        MessagingConfig {
            default_queue: "default".into(),
            queues: vec!["document-commands".into()],
            subscription: "catalog-service".into(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn provisions_queues_topics_and_bindings() {
        let transport = Arc::new(InMemoryTransport::new());
        let mut registry = EventTypeRegistry::new(TopicStrategy::default());
        registry.register::<ProviderRegistered>();

        let manager = TopologyManager::new(transport.clone(), config());
        manager.provision(&registry).await.unwrap();

        assert!(transport.queue_exists("default"));
        assert!(transport.queue_exists("document-commands"));
        assert!(transport.topic_exists("provider-registered"));
        assert!(transport.subscription_exists("provider-registered", "catalog-service"));
        assert!(transport.binding_exists(
            "provider-registered",
            "catalog-service",
            "ProviderRegistered"
        ));
    }

    #[tokio::test]
    async fn provisioning_twice_is_idempotent() {
        let transport = Arc::new(InMemoryTransport::new());
        let mut registry = EventTypeRegistry::new(TopicStrategy::default());
        registry.register::<ProviderRegistered>();

        let manager = TopologyManager::new(transport.clone(), config());
        manager.provision(&registry).await.unwrap();
        manager.provision(&registry).await.unwrap();

        assert!(transport.topic_exists("provider-registered"));
    }
}
