// tests/transport_memory.rs

//! Delivery semantics of the in-memory reference broker.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::time::timeout;

use amqp_rpc::{
    // ---
    create_memory_transport,
    create_memory_transport_with_probe,
    Address,
    Delivery,
    Envelope,
    QueueSpec,
    TransportEvent,
};

fn plain_envelope(payload: &'static [u8]) -> Envelope {
    // ---
    Envelope::response(Bytes::from_static(payload), Arc::from("TOKEN"))
}

async fn recv_one(
    inbox: &mut tokio::sync::mpsc::Receiver<Delivery>,
) -> Delivery {
    // ---
    timeout(Duration::from_millis(200), inbox.recv())
        .await
        .expect("timed out waiting for delivery")
        .expect("stream closed unexpectedly")
}

#[tokio::test]
async fn test_consume_then_publish_delivers() {
    // ---
    // Arrange
    // ---
    let transport = create_memory_transport()
        .await
        .expect("failed to create memory transport");

    let queue = transport
        .declare_queue(QueueSpec::shared("test.queue"))
        .await
        .expect("declare failed");

    let mut stream = transport
        .consume(&queue, true)
        .await
        .expect("consume failed");

    // ---
    // Act
    // ---
    transport
        .publish(queue.clone(), plain_envelope(b"hello"), Duration::from_secs(1))
        .await
        .expect("publish failed");

    // ---
    // Assert
    // ---
    let delivery = recv_one(&mut stream.inbox).await;
    assert_eq!(delivery.envelope.payload, Bytes::from_static(b"hello"));
    assert_eq!(delivery.envelope.correlation_id.as_deref(), Some("TOKEN"));
}

#[tokio::test]
async fn test_publish_before_consumer_is_buffered() {
    // ---
    let transport = create_memory_transport().await.expect("create failed");

    let queue = transport
        .declare_queue(QueueSpec::shared("test.buffered"))
        .await
        .expect("declare failed");

    transport
        .publish(queue.clone(), plain_envelope(b"early"), Duration::from_secs(1))
        .await
        .expect("publish failed");

    // The consumer attaches after the publish; the message must still
    // arrive.
    let mut stream = transport
        .consume(&queue, true)
        .await
        .expect("consume failed");

    let delivery = recv_one(&mut stream.inbox).await;
    assert_eq!(delivery.envelope.payload, Bytes::from_static(b"early"));
}

#[tokio::test]
async fn test_reply_queue_names_are_server_assigned() {
    // ---
    let transport = create_memory_transport().await.expect("create failed");

    let first = transport
        .declare_queue(QueueSpec::reply())
        .await
        .expect("declare failed");
    let second = transport
        .declare_queue(QueueSpec::reply())
        .await
        .expect("declare failed");

    assert!(first.as_str().starts_with("amq.gen-"), "got {first}");
    assert!(second.as_str().starts_with("amq.gen-"), "got {second}");
    assert_ne!(first, second);
}

#[tokio::test]
async fn test_named_declare_is_idempotent() {
    // ---
    let transport = create_memory_transport().await.expect("create failed");

    let first = transport
        .declare_queue(QueueSpec::shared("test.idempotent"))
        .await
        .expect("declare failed");
    let second = transport
        .declare_queue(QueueSpec::shared("test.idempotent"))
        .await
        .expect("redeclare failed");

    assert_eq!(first, second);
    assert_eq!(first, Address::from("test.idempotent"));
}

#[tokio::test]
async fn test_competing_consumers_share_the_queue() {
    // ---
    let transport = create_memory_transport().await.expect("create failed");

    let queue = transport
        .declare_queue(QueueSpec::shared("test.competing"))
        .await
        .expect("declare failed");

    let mut first = transport.consume(&queue, true).await.expect("consume failed");
    let mut second = transport.consume(&queue, true).await.expect("consume failed");

    for payload in [b"a", b"b", b"c", b"d"] {
        transport
            .publish(
                queue.clone(),
                Envelope::response(Bytes::from_static(payload), Arc::from("TOKEN")),
                Duration::from_secs(1),
            )
            .await
            .expect("publish failed");
    }

    // Round-robin: each consumer sees exactly two of the four messages.
    let first_a = recv_one(&mut first.inbox).await;
    let first_b = recv_one(&mut first.inbox).await;
    let second_a = recv_one(&mut second.inbox).await;
    let second_b = recv_one(&mut second.inbox).await;

    let mut seen: Vec<Bytes> = vec![
        first_a.envelope.payload,
        first_b.envelope.payload,
        second_a.envelope.payload,
        second_b.envelope.payload,
    ];
    seen.sort();
    assert_eq!(seen, vec![
        Bytes::from_static(b"a"),
        Bytes::from_static(b"b"),
        Bytes::from_static(b"c"),
        Bytes::from_static(b"d"),
    ]);
}

#[tokio::test]
async fn test_auto_ack_settles_on_receipt() {
    // ---
    let (transport, probe) = create_memory_transport_with_probe()
        .await
        .expect("create failed");

    let queue = transport
        .declare_queue(QueueSpec::shared("test.autoack"))
        .await
        .expect("declare failed");

    let mut stream = transport.consume(&queue, true).await.expect("consume failed");

    transport
        .publish(queue.clone(), plain_envelope(b"x"), Duration::from_secs(1))
        .await
        .expect("publish failed");

    let _delivery = recv_one(&mut stream.inbox).await;

    assert!(
        probe.events().iter().any(|event| matches!(
            event,
            TransportEvent::Acked { queue, .. } if queue == "test.autoack"
        )),
        "auto-ack consumer did not settle the delivery",
    );
}

#[tokio::test]
async fn test_manual_ack_is_recorded_once() {
    // ---
    let (transport, probe) = create_memory_transport_with_probe()
        .await
        .expect("create failed");

    let queue = transport
        .declare_queue(QueueSpec::shared("test.manual"))
        .await
        .expect("declare failed");

    let mut stream = transport.consume(&queue, false).await.expect("consume failed");

    transport
        .publish(queue.clone(), plain_envelope(b"x"), Duration::from_secs(1))
        .await
        .expect("publish failed");

    let delivery = recv_one(&mut stream.inbox).await;

    // Not settled until the consumer says so.
    assert!(!probe
        .events()
        .iter()
        .any(|event| matches!(event, TransportEvent::Acked { .. })));

    delivery.ack().await.expect("ack failed");
    delivery.ack().await.expect("second ack must be a no-op");

    let acks = probe
        .events()
        .iter()
        .filter(|event| matches!(event, TransportEvent::Acked { .. }))
        .count();
    assert_eq!(acks, 1);
}

#[tokio::test]
async fn test_nack_with_requeue_redelivers() {
    // ---
    let (transport, probe) = create_memory_transport_with_probe()
        .await
        .expect("create failed");

    let queue = transport
        .declare_queue(QueueSpec::shared("test.requeue"))
        .await
        .expect("declare failed");

    let mut stream = transport.consume(&queue, false).await.expect("consume failed");

    transport
        .publish(queue.clone(), plain_envelope(b"again"), Duration::from_secs(1))
        .await
        .expect("publish failed");

    let first = recv_one(&mut stream.inbox).await;
    first.nack(true).await.expect("nack failed");

    // The same envelope comes back around.
    let second = recv_one(&mut stream.inbox).await;
    assert_eq!(second.envelope.payload, Bytes::from_static(b"again"));

    assert!(probe.events().iter().any(|event| matches!(
        event,
        TransportEvent::Nacked { requeue: true, .. }
    )));
}

#[tokio::test]
async fn test_close_ends_consumer_streams() {
    // ---
    let transport = create_memory_transport().await.expect("create failed");

    let queue = transport
        .declare_queue(QueueSpec::shared("test.close"))
        .await
        .expect("declare failed");

    let mut stream = transport.consume(&queue, true).await.expect("consume failed");

    transport.close().await.expect("close failed");

    let next = timeout(Duration::from_millis(200), stream.inbox.recv())
        .await
        .expect("stream did not end after close");
    assert!(next.is_none());
}
