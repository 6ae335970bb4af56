use std::collections::HashMap;
use std::time::Duration;

use chrono::Utc;
use uuid::Uuid;

use crate::error::BusError;
use crate::message::{MessageEnvelope, CONTENT_TYPE_JSON};
use crate::retry::DeadLetterReason;

use super::{BrokerTransport, Destination, InMemoryTransport, LeaseToken, NoopTransport, Source};

const LOCK: Duration = Duration::from_secs(30);

fn envelope(subject: &str) -> MessageEnvelope {
    MessageEnvelope {
        message_id: Uuid::new_v4().to_string(),
        subject: subject.to_string(),
        body: br#"{"documentId":"d-1"}"#.to_vec(),
        content_type: CONTENT_TYPE_JSON.to_string(),
        created_at: Utc::now(),
        time_to_live: None,
        delivery_count: 0,
        application_properties: HashMap::new(),
    }
}

#[tokio::test]
async fn lease_then_complete_removes_the_message() {
    let transport = InMemoryTransport::new();
    let source = Source::queue("documents");
    transport
        .send(&Destination::Queue("documents".into()), envelope("DocumentUploaded"))
        .await
        .unwrap();

    let leased = transport.receive(&source, LOCK).await.unwrap().unwrap();
    assert_eq!(leased.envelope.delivery_count, 1);

    // leased, not gone: the queue is empty but a second receive yields nothing
    assert!(transport.receive(&source, LOCK).await.unwrap().is_none());

    transport.complete(&leased.lease).await.unwrap();
    assert!(transport.receive(&source, LOCK).await.unwrap().is_none());

    let counters = transport.counters(&source);
    assert_eq!(counters.sent, 1);
    assert_eq!(counters.received, 1);
    assert_eq!(counters.completed, 1);
}

#[tokio::test]
async fn abandon_redelivers_with_incremented_count() {
    let transport = InMemoryTransport::new();
    let source = Source::queue("documents");
    transport
        .send(&Destination::Queue("documents".into()), envelope("DocumentUploaded"))
        .await
        .unwrap();

    let first = transport.receive(&source, LOCK).await.unwrap().unwrap();
    transport.abandon(&first.lease, None).await.unwrap();

    let second = transport.receive(&source, LOCK).await.unwrap().unwrap();
    assert_eq!(second.envelope.delivery_count, 2);
    assert_eq!(second.envelope.message_id, first.envelope.message_id);
}

#[tokio::test]
async fn abandon_with_delay_schedules_redelivery() {
    let transport = InMemoryTransport::new();
    let source = Source::queue("documents");
    transport
        .send(&Destination::Queue("documents".into()), envelope("DocumentUploaded"))
        .await
        .unwrap();

    let leased = transport.receive(&source, LOCK).await.unwrap().unwrap();
    transport
        .abandon(&leased.lease, Some(Duration::from_millis(50)))
        .await
        .unwrap();

    // not yet due
    assert!(transport.receive(&source, LOCK).await.unwrap().is_none());
    assert_eq!(transport.depth(&source), 1);

    tokio::time::sleep(Duration::from_millis(80)).await;
    let redelivered = transport.receive(&source, LOCK).await.unwrap().unwrap();
    assert_eq!(redelivered.envelope.delivery_count, 2);
}

#[tokio::test]
async fn expired_lock_returns_the_message_to_the_queue() {
    let transport = InMemoryTransport::new();
    let source = Source::queue("documents");
    transport
        .send(&Destination::Queue("documents".into()), envelope("DocumentUploaded"))
        .await
        .unwrap();

    let first = transport
        .receive(&source, Duration::from_millis(20))
        .await
        .unwrap()
        .unwrap();

    tokio::time::sleep(Duration::from_millis(40)).await;
    let second = transport.receive(&source, LOCK).await.unwrap().unwrap();
    assert_eq!(second.envelope.delivery_count, 2);

    // the original lease is dead
    assert!(matches!(
        transport.complete(&first.lease).await,
        Err(BusError::Transport { .. })
    ));
    transport.complete(&second.lease).await.unwrap();
}

#[tokio::test]
async fn expired_ttl_messages_are_discarded_on_receive() {
    let transport = InMemoryTransport::new();
    let source = Source::queue("documents");
    let mut stale = envelope("DocumentUploaded");
    stale.time_to_live = Some(Duration::from_millis(1));
    stale.created_at = Utc::now() - chrono::Duration::seconds(10);
    transport
        .send(&Destination::Queue("documents".into()), stale)
        .await
        .unwrap();

    assert!(transport.receive(&source, LOCK).await.unwrap().is_none());
    assert_eq!(transport.depth(&source), 0);
}

#[tokio::test]
async fn topic_send_fans_out_to_matching_subscriptions() {
    let transport = InMemoryTransport::new();
    transport
        .ensure_subscription("document-uploaded", "catalog-service", "DocumentUploaded")
        .await
        .unwrap();
    transport
        .ensure_subscription("document-uploaded", "audit-service", "DocumentUploaded")
        .await
        .unwrap();
    transport
        .ensure_subscription("document-uploaded", "other-service", "SomethingElse")
        .await
        .unwrap();

    transport
        .send(
            &Destination::Topic("document-uploaded".into()),
            envelope("DocumentUploaded"),
        )
        .await
        .unwrap();

    let catalog = Source::subscription("document-uploaded", "catalog-service");
    let audit = Source::subscription("document-uploaded", "audit-service");
    let other = Source::subscription("document-uploaded", "other-service");

    assert!(transport.receive(&catalog, LOCK).await.unwrap().is_some());
    assert!(transport.receive(&audit, LOCK).await.unwrap().is_some());
    // binding keys don't match the subject
    assert!(transport.receive(&other, LOCK).await.unwrap().is_none());
}

#[tokio::test]
async fn consuming_a_topic_requires_a_subscription() {
    let transport = InMemoryTransport::new();
    let bare = Source {
        destination: Destination::Topic("document-uploaded".into()),
        subscription: None,
    };
    assert!(transport.receive(&bare, LOCK).await.is_err());
}

#[tokio::test]
async fn dead_letter_moves_message_to_sub_queue() {
    let transport = InMemoryTransport::new();
    let source = Source::queue("documents");
    transport
        .send(&Destination::Queue("documents".into()), envelope("DocumentUploaded"))
        .await
        .unwrap();

    let leased = transport.receive(&source, LOCK).await.unwrap().unwrap();
    transport
        .dead_letter(
            &leased.lease,
            DeadLetterReason::PermanentFailure,
            "validation failed",
        )
        .await
        .unwrap();

    assert!(transport.receive(&source, LOCK).await.unwrap().is_none());
    let dead = transport.dead_letters(&source);
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].reason, DeadLetterReason::PermanentFailure);
    assert_eq!(dead[0].detail, "validation failed");
    assert_eq!(transport.counters(&source).dead_lettered, 1);
}

#[tokio::test]
async fn renew_lock_extends_the_lease() {
    let transport = InMemoryTransport::new();
    let source = Source::queue("documents");
    transport
        .send(&Destination::Queue("documents".into()), envelope("DocumentUploaded"))
        .await
        .unwrap();

    let leased = transport
        .receive(&source, Duration::from_millis(30))
        .await
        .unwrap()
        .unwrap();

    tokio::time::sleep(Duration::from_millis(20)).await;
    transport
        .renew_lock(&leased.lease, Duration::from_secs(30))
        .await
        .unwrap();

    // past the original expiry, still leased
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(transport.receive(&source, LOCK).await.unwrap().is_none());
    transport.complete(&leased.lease).await.unwrap();
}

#[tokio::test]
async fn disposition_calls_without_a_lease_fail() {
    let transport = InMemoryTransport::new();
    let ghost = LeaseToken {
        source: Source::queue("documents"),
        token: Uuid::new_v4(),
    };
    assert!(transport.complete(&ghost).await.is_err());
    assert!(transport.abandon(&ghost, None).await.is_err());
    assert!(transport
        .dead_letter(&ghost, DeadLetterReason::PermanentFailure, "x")
        .await
        .is_err());
    assert!(transport.renew_lock(&ghost, LOCK).await.is_err());
}

#[tokio::test]
async fn provisioning_is_idempotent_and_observable() {
    let transport = InMemoryTransport::new();
    transport.ensure_queue("documents").await.unwrap();
    transport.ensure_queue("documents").await.unwrap();
    transport.ensure_topic("document-uploaded").await.unwrap();
    transport
        .ensure_subscription("document-uploaded", "catalog-service", "DocumentUploaded")
        .await
        .unwrap();
    transport
        .ensure_subscription("document-uploaded", "catalog-service", "DocumentUploaded")
        .await
        .unwrap();

    assert!(transport.queue_exists("documents"));
    assert!(transport.topic_exists("document-uploaded"));
    assert!(transport.subscription_exists("document-uploaded", "catalog-service"));
    assert!(transport.binding_exists(
        "document-uploaded",
        "catalog-service",
        "DocumentUploaded"
    ));
}

#[tokio::test]
async fn noop_transport_swallows_sends_and_yields_nothing() {
    let transport = NoopTransport::new();
    transport
        .send(&Destination::Queue("documents".into()), envelope("DocumentUploaded"))
        .await
        .unwrap();
    assert!(transport
        .receive(&Source::queue("documents"), LOCK)
        .await
        .unwrap()
        .is_none());

    let ghost = LeaseToken {
        source: Source::queue("documents"),
        token: Uuid::new_v4(),
    };
    assert!(transport.complete(&ghost).await.is_err());
}
