// src/domain/transport.rs

//! Transport domain abstractions.
//!
//! This module defines the domain-level transport interface used by the
//! client and server layers to exchange messages. It intentionally avoids
//! any reference to concrete protocols, brokers, or client libraries.
//!
//! The transport layer is responsible only for delivering opaque envelopes
//! to consumers of named queues. Higher-level semantics such as RPC
//! correlation, deadlines, or reply routing are handled elsewhere.
//!
//! Concrete implementations of this interface live under `src/transport/`.

use crate::Result;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// A transport address.
///
/// An `Address` names a destination to which messages may be published.
/// Its interpretation is transport-specific (a queue name, a routing key),
/// but it is treated as an opaque identifier at the domain level.
///
/// Addresses are immutable, cheap to clone, and safe to share across
/// threads.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Address(pub Arc<str>);

impl Address {
    /// Borrow the address as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl<T> From<T> for Address
where
    T: Into<Arc<str>>,
{
    fn from(value: T) -> Self {
        // ---
        Address(value.into())
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Declaration parameters for a named queue.
///
/// Mirrors the broker-side queue properties the RPC layers care about;
/// anything beyond these four is a transport concern.
#[derive(Clone, Debug)]
pub struct QueueSpec {
    /// Queue name. Empty means the broker assigns a unique name, returned
    /// from [`Transport::declare_queue`].
    pub name: String,
    /// Queue survives broker restarts.
    pub durable: bool,
    /// Queue is scoped to the declaring connection; no other connection
    /// may consume it.
    pub exclusive: bool,
    /// Queue is deleted once its connection closes or its last consumer
    /// goes away.
    pub auto_delete: bool,
}

impl QueueSpec {
    /// Shared, durable request queue. Multiple workers may consume it.
    pub fn shared(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            durable: true,
            exclusive: false,
            auto_delete: false,
        }
    }

    /// Private reply queue: broker-named, exclusive to the declaring
    /// connection, deleted when that connection closes.
    pub fn reply() -> Self {
        Self {
            name: String::new(),
            durable: false,
            exclusive: true,
            auto_delete: true,
        }
    }
}

/// An opaque message envelope.
///
/// An `Envelope` is the unit of transport between producers and consumers.
/// The payload is never interpreted by the transport; correlation and
/// reply routing metadata ride alongside it as message properties.
/// Envelopes are immutable once published.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Envelope {
    /// Opaque payload bytes.
    pub payload: Bytes,

    /// Correlation identifier associating a response with its request.
    ///
    /// Echoed verbatim by responders; this is the sole causal link
    /// between the two messages.
    pub correlation_id: Option<Arc<str>>,

    /// Address the consumer must send the reply to. Present on request
    /// envelopes, absent on responses.
    pub reply_to: Option<Address>,

    /// Informational payload format hint (e.g. `"text/plain"`). Not
    /// enforced by any layer.
    pub content_type: Option<Arc<str>>,
}

impl Envelope {
    /// Create a request envelope carrying a correlation token and the
    /// address replies must be routed to.
    pub fn request(payload: Bytes, correlation_id: Arc<str>, reply_to: Address) -> Self {
        // ---
        Self {
            payload,
            correlation_id: Some(correlation_id),
            reply_to: Some(reply_to),
            content_type: Some(Arc::from("text/plain")),
        }
    }

    /// Create a response envelope. The correlation id must be the one
    /// carried by the request being answered.
    pub fn response(payload: Bytes, correlation_id: Arc<str>) -> Self {
        // ---
        Self {
            payload,
            correlation_id: Some(correlation_id),
            reply_to: None,
            content_type: Some(Arc::from("text/plain")),
        }
    }
}

/// Consumer-side acknowledgement surface for one delivery.
///
/// Transports hand every manually-consumed message an acknowledger; the
/// consuming layer decides when to settle it. For an RPC worker that
/// point is after the response has been handed to the transport, never
/// before.
#[async_trait::async_trait]
pub trait Acknowledger: Send + Sync {
    /// Acknowledge this delivery.
    async fn ack(&self) -> Result<()>;

    /// Reject this delivery, optionally asking the broker to requeue it
    /// for another consumer.
    async fn nack(&self, requeue: bool) -> Result<()>;
}

/// Acknowledger for auto-ack consumers; the transport has already
/// settled the delivery.
pub(crate) struct NoopAcknowledger;

#[async_trait::async_trait]
impl Acknowledger for NoopAcknowledger {
    async fn ack(&self) -> Result<()> {
        Ok(())
    }

    async fn nack(&self, _requeue: bool) -> Result<()> {
        Ok(())
    }
}

/// A message delivered to a consumer.
pub struct Delivery {
    /// The delivered envelope.
    pub envelope: Envelope,
    acker: Box<dyn Acknowledger>,
}

impl Delivery {
    /// Package an envelope with its acknowledgement handle.
    pub fn new(envelope: Envelope, acker: Box<dyn Acknowledger>) -> Self {
        Self { envelope, acker }
    }

    /// Acknowledge this delivery.
    pub async fn ack(&self) -> Result<()> {
        self.acker.ack().await
    }

    /// Reject this delivery, optionally requeueing it.
    pub async fn nack(&self, requeue: bool) -> Result<()> {
        self.acker.nack(requeue).await
    }
}

/// Handle returned from a successful `consume()`.
///
/// The stream is infinite: it remains active until the handle is dropped
/// or the transport is closed, and is restartable only by issuing a new
/// `consume()`.
pub struct MessageStream {
    /// Receiver channel for deliveries on the consumed queue.
    pub inbox: mpsc::Receiver<Delivery>,
}

/// Transport abstraction.
///
/// A `Transport` provides at-least-once delivery of message envelopes
/// between producers and consumers of named queues, without committing to
/// any specific protocol or broker. Correlation, deadlines, and reply
/// routing are built on top by the client and server layers.
///
/// Implementations must ensure that:
/// - Once `consume()` returns successfully, messages published *after*
///   that point to the consumed queue are deliverable.
/// - Messages published to a queue with no consumer are buffered, not
///   dropped.
/// - No ordering guarantee is made across queues; per-queue delivery
///   order follows the underlying broker.
///
/// The in-memory transport serves as the reference implementation of
/// these semantics.
///
/// # Notes
///
/// This trait uses `async_trait`; the expanded documentation may show
/// explicit lifetimes and a boxed `Future`. Consumers should treat the
/// methods as normal `async fn`s.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    // ---
    /// Declare a queue, creating it if needed.
    ///
    /// Returns the actual queue name, which differs from `spec.name` when
    /// the broker assigns one. Declaring an existing queue with identical
    /// parameters is idempotent.
    async fn declare_queue(&self, spec: QueueSpec) -> Result<Address>;

    /// Bound the number of unacknowledged deliveries the broker may have
    /// outstanding to this transport's consumers.
    async fn set_prefetch(&self, count: u16) -> Result<()>;

    /// Publish an envelope to the given address within `budget`.
    ///
    /// Fails with [`RpcError::Publish`](crate::RpcError::Publish) when
    /// the budget elapses or the broker rejects the publish.
    async fn publish(&self, address: Address, env: Envelope, budget: Duration) -> Result<()>;

    /// Start consuming a queue.
    ///
    /// With `auto_ack` the transport settles each delivery on receipt and
    /// the delivery's acknowledger is a no-op; otherwise the consumer must
    /// ack or nack every delivery.
    async fn consume(&self, queue: &Address, auto_ack: bool) -> Result<MessageStream>;

    /// Close the transport and release any associated resources.
    async fn close(&self) -> Result<()>;
}

/// Shared transport pointer.
///
/// This is an `Arc<dyn Transport>`, which means:
/// - `.clone()` is cheap (only increments a reference count)
/// - Multiple clones share the same underlying connection
/// - Used to erase concrete transport types behind a stable domain interface.
pub type TransportPtr = Arc<dyn Transport>;

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn test_queue_spec_shapes() {
        // ---
        let shared = QueueSpec::shared("rpc_queue");
        assert_eq!(shared.name, "rpc_queue");
        assert!(shared.durable);
        assert!(!shared.exclusive);
        assert!(!shared.auto_delete);

        let reply = QueueSpec::reply();
        assert!(reply.name.is_empty());
        assert!(!reply.durable);
        assert!(reply.exclusive);
        assert!(reply.auto_delete);
    }

    #[test]
    fn test_envelope_shapes() {
        // ---
        let req = Envelope::request(
            Bytes::from_static(b"30"),
            Arc::from("TOKEN"),
            Address::from("amq.gen-reply"),
        );
        assert_eq!(req.correlation_id.as_deref(), Some("TOKEN"));
        assert_eq!(req.reply_to.as_ref().map(Address::as_str), Some("amq.gen-reply"));

        let resp = Envelope::response(Bytes::from_static(b"832040"), Arc::from("TOKEN"));
        assert_eq!(resp.correlation_id.as_deref(), Some("TOKEN"));
        assert!(resp.reply_to.is_none());
    }
}
