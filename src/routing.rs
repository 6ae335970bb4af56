//! Naming convention for queues and topics.
//!
//! A pure mapping from a message type to its destination name. Queue names
//! are point-to-point targets, topic names are fan-out targets; both derive
//! from the canonical type name so every producer and consumer of a type
//! agrees on the destination without coordination.

use convert_case::{Case, Casing};

use crate::message::{BusMessage, IntegrationEvent};

/// Derives destination names from canonical type names.
///
/// `ProviderRegistered` becomes `provider-registered`; with a namespace of
/// `marketplace` it becomes `marketplace.provider-registered`.
#[derive(Debug, Clone, Default)]
pub struct TopicStrategy {
    namespace: Option<String>,
}

impl TopicStrategy {
    pub fn new(namespace: Option<String>) -> Self {
        Self {
            namespace: namespace.filter(|ns| !ns.is_empty()),
        }
    }

    /// Queue name for a point-to-point message type.
    pub fn queue_name<M: BusMessage>(&self) -> String {
        self.destination_for(M::message_type())
    }

    /// Topic name for an event type.
    pub fn topic_name<E: IntegrationEvent>(&self) -> String {
        self.destination_for(E::event_type())
    }

    /// Destination name for a type name already known as a string; used by
    /// registry-driven provisioning.
    pub fn destination_for(&self, type_name: &str) -> String {
        let base = type_name.to_case(Case::Kebab);
        match &self.namespace {
            Some(ns) => format!("{ns}.{base}"),
            None => base,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Serialize, Deserialize)]
    struct CatalogItemPriceChanged;
    impl BusMessage for CatalogItemPriceChanged {}

    #[test]
    fn kebab_cases_the_type_name() {
        let strategy = TopicStrategy::default();
        assert_eq!(
            strategy.queue_name::<CatalogItemPriceChanged>(),
            "catalog-item-price-changed"
        );
    }

    #[test]
    fn namespace_prefixes_the_destination() {
        let strategy = TopicStrategy::new(Some("marketplace".into()));
        assert_eq!(
            strategy.destination_for("ProviderRegistered"),
            "marketplace.provider-registered"
        );
    }

    #[test]
    fn empty_namespace_is_ignored() {
        let strategy = TopicStrategy::new(Some(String::new()));
        assert_eq!(strategy.destination_for("DocumentUploaded"), "document-uploaded");
    }

    #[test]
    fn mapping_is_deterministic() {
        let strategy = TopicStrategy::new(Some("mp".into()));
        assert_eq!(
            strategy.destination_for("DocumentUploaded"),
            strategy.destination_for("DocumentUploaded")
        );
    }
}
