//! Registry of event types known to the system.
//!
//! The topology manager walks this registry at startup to provision a
//! topic, a subscription queue and a binding for every event type before
//! traffic flows. Registration is cheap bookkeeping; duplicate
//! registrations are ignored.

use crate::message::IntegrationEvent;
use crate::routing::TopicStrategy;

/// Canonical name and derived topic for one registered event type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventTypeDescriptor {
    pub type_name: &'static str,
    pub topic_name: String,
}

/// Enumerates the event types the process publishes or consumes.
#[derive(Debug, Default)]
pub struct EventTypeRegistry {
    strategy: TopicStrategy,
    entries: Vec<EventTypeDescriptor>,
}

impl EventTypeRegistry {
    pub fn new(strategy: TopicStrategy) -> Self {
        Self {
            strategy,
            entries: Vec::new(),
        }
    }

    /// Register an event type. Registering the same type twice is a no-op.
    pub fn register<E: IntegrationEvent>(&mut self) -> &mut Self {
        let type_name = E::event_type();
        if self.entries.iter().any(|e| e.type_name == type_name) {
            log::debug!("event type '{type_name}' already registered");
            return self;
        }
        let topic_name = self.strategy.destination_for(type_name);
        self.entries.push(EventTypeDescriptor {
            type_name,
            topic_name,
        });
        self
    }

    pub fn descriptors(&self) -> impl Iterator<Item = &EventTypeDescriptor> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Serialize};
    use uuid::Uuid;

    use crate::message::BusMessage;

    #[derive(Serialize, Deserialize)]
    struct LocationOpened {
        event_id: Uuid,
        at: DateTime<Utc>,
    }
    impl BusMessage for LocationOpened {}
    impl IntegrationEvent for LocationOpened {
        fn event_id(&self) -> Uuid {
            self.event_id
        }
        fn occurred_at(&self) -> DateTime<Utc> {
            self.at
        }
    }

    #[test]
    fn registers_type_with_derived_topic() {
        let mut registry = EventTypeRegistry::new(TopicStrategy::default());
        registry.register::<LocationOpened>();
        let entries: Vec<_> = registry.descriptors().collect();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].type_name, "LocationOpened");
        assert_eq!(entries[0].topic_name, "location-opened");
    }

    #[test]
    fn duplicate_registration_is_a_noop() {
        let mut registry = EventTypeRegistry::new(TopicStrategy::default());
        registry.register::<LocationOpened>();
        registry.register::<LocationOpened>();
        assert_eq!(registry.len(), 1);
    }
}
