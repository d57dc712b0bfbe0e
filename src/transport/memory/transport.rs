// src/transport/memory/transport.rs

//! In-memory transport implementation.
//!
//! This file contains the concrete implementation of the domain-level
//! `Transport` trait using in-process data structures only.
//!
//! The memory transport is the **reference implementation** of transport
//! semantics. Other transports are expected to approximate this behavior
//! as closely as their underlying systems allow and to document any
//! unavoidable deviations.
//!
//! ## Semantics
//!
//! - Queues are named; an empty declaration name yields a broker-assigned
//!   `amq.gen-…` name, matching AMQP server-named queues.
//! - Messages published to a queue with no consumer are buffered and
//!   drained when a consumer attaches.
//! - Multiple consumers on one queue compete: deliveries are handed out
//!   round-robin, one consumer per message.
//! - Manual-ack deliveries may be nacked with requeue, which puts the
//!   envelope back into delivery rotation.
//!
//! ## Instrumentation
//!
//! Every publish and every settlement is recorded as a [`TransportEvent`]
//! on a [`TransportProbe`], so tests can assert ordering properties such
//! as "the reply was published before the request was acknowledged".
//!
//! ## Non-Goals
//!
//! - Persistence: the `durable` flag is accepted and ignored.
//! - Exclusivity enforcement: everything lives in one process.
//! - Prefetch enforcement: bounded consumer channels already provide
//!   equivalent in-process backpressure.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

use crate::domain::NoopAcknowledger;
use crate::{
    // ---
    Acknowledger,
    Address,
    Delivery,
    Envelope,
    MessageStream,
    QueueSpec,
    Result,
    Transport,
    TransportPtr,
};
use std::time::Duration;

/// Observable transport action, in the order it happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// An envelope was handed to the transport for publishing.
    Published {
        queue: String,
        correlation_id: Option<String>,
    },
    /// A delivery was acknowledged (explicitly, or on receipt for
    /// auto-ack consumers).
    Acked {
        queue: String,
        correlation_id: Option<String>,
    },
    /// A delivery was rejected.
    Nacked {
        queue: String,
        correlation_id: Option<String>,
        requeue: bool,
    },
}

/// Recording of every [`TransportEvent`] on a memory transport.
///
/// Cheap to clone; all clones observe the same event log.
#[derive(Clone, Default)]
pub struct TransportProbe {
    events: Arc<Mutex<Vec<TransportEvent>>>,
}

impl TransportProbe {
    /// Snapshot of the events recorded so far.
    pub fn events(&self) -> Vec<TransportEvent> {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn record(&self, event: TransportEvent) {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event);
    }
}

struct ConsumerSlot {
    tx: mpsc::Sender<Delivery>,
    auto_ack: bool,
}

#[derive(Default)]
struct QueueState {
    buffer: VecDeque<Envelope>,
    consumers: Vec<ConsumerSlot>,
    /// Round-robin cursor over `consumers`.
    next: usize,
}

type SharedQueues = Arc<RwLock<HashMap<String, QueueState>>>;

/// In-memory transport.
///
/// Simulates a message broker entirely within the process. Intended for
/// tests and for validating higher-level behavior without network,
/// broker, or timing variability.
struct MemoryTransport {
    // ---
    queues: SharedQueues,
    probe: TransportProbe,
}

/// Hand an envelope to one consumer of `queue`, or buffer it when no
/// consumer is attached.
///
/// Free function rather than a method so acknowledgers can reuse it for
/// requeue without holding a transport reference.
async fn deliver(queues: &SharedQueues, probe: &TransportProbe, queue: &str, env: Envelope) {
    // ---
    let mut env = env;

    loop {
        let slot = {
            let mut map = queues.write().await;
            let state = map.entry(queue.to_string()).or_default();

            state.consumers.retain(|c| !c.tx.is_closed());
            if state.consumers.is_empty() {
                state.buffer.push_back(env);
                return;
            }

            state.next %= state.consumers.len();
            let consumer = &state.consumers[state.next];
            state.next = (state.next + 1) % state.consumers.len();
            (consumer.tx.clone(), consumer.auto_ack)
        };

        let (tx, auto_ack) = slot;

        let acker: Box<dyn Acknowledger> = if auto_ack {
            // Settled on receipt, like an AMQP no-ack consumer.
            probe.record(TransportEvent::Acked {
                queue: queue.to_string(),
                correlation_id: env.correlation_id.as_deref().map(str::to_string),
            });
            Box::new(NoopAcknowledger)
        } else {
            Box::new(MemoryAcknowledger {
                queue: queue.to_string(),
                envelope: env.clone(),
                queues: Arc::clone(queues),
                probe: probe.clone(),
                settled: AtomicBool::new(false),
            })
        };

        match tx.send(Delivery::new(env, acker)).await {
            Ok(()) => return,
            Err(err) => {
                // Consumer vanished between the lock and the send;
                // reclaim the envelope and pick another.
                env = err.0.envelope;
            }
        }
    }
}

/// Acknowledgement handle for one manually-consumed memory delivery.
struct MemoryAcknowledger {
    queue: String,
    envelope: Envelope,
    queues: SharedQueues,
    probe: TransportProbe,
    settled: AtomicBool,
}

#[async_trait::async_trait]
impl Acknowledger for MemoryAcknowledger {
    // ---
    async fn ack(&self) -> Result<()> {
        if self.settled.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.probe.record(TransportEvent::Acked {
            queue: self.queue.clone(),
            correlation_id: self.envelope.correlation_id.as_deref().map(str::to_string),
        });
        Ok(())
    }

    async fn nack(&self, requeue: bool) -> Result<()> {
        if self.settled.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.probe.record(TransportEvent::Nacked {
            queue: self.queue.clone(),
            correlation_id: self.envelope.correlation_id.as_deref().map(str::to_string),
            requeue,
        });
        if requeue {
            deliver(&self.queues, &self.probe, &self.queue, self.envelope.clone()).await;
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl Transport for MemoryTransport {
    // ---

    /// Declare a queue, generating an `amq.gen-…` name when the spec
    /// leaves the name empty.
    async fn declare_queue(&self, spec: QueueSpec) -> Result<Address> {
        // ---
        let name = if spec.name.is_empty() {
            format!("amq.gen-{}", Uuid::new_v4().simple())
        } else {
            spec.name
        };

        self.queues.write().await.entry(name.clone()).or_default();
        Ok(Address::from(name))
    }

    /// Recorded for interface fidelity only; bounded consumer channels
    /// already throttle in-process delivery.
    async fn set_prefetch(&self, _count: u16) -> Result<()> {
        // ---
        Ok(())
    }

    /// Publish an envelope.
    ///
    /// Delivery is in-process and immediate, so the budget cannot
    /// meaningfully elapse; it is accepted for interface parity.
    async fn publish(&self, address: Address, env: Envelope, _budget: Duration) -> Result<()> {
        // ---
        self.probe.record(TransportEvent::Published {
            queue: address.as_str().to_string(),
            correlation_id: env.correlation_id.as_deref().map(str::to_string),
        });

        deliver(&self.queues, &self.probe, address.as_str(), env).await;
        Ok(())
    }

    /// Register a consumer.
    ///
    /// Any envelopes buffered while the queue had no consumer are put
    /// back into delivery rotation immediately.
    async fn consume(&self, queue: &Address, auto_ack: bool) -> Result<MessageStream> {
        // ---
        let (tx, rx) = mpsc::channel(64);

        let backlog: Vec<Envelope> = {
            let mut map = self.queues.write().await;
            let state = map.entry(queue.as_str().to_string()).or_default();
            state.consumers.push(ConsumerSlot { tx, auto_ack });
            state.buffer.drain(..).collect()
        };

        for env in backlog {
            deliver(&self.queues, &self.probe, queue.as_str(), env).await;
        }

        Ok(MessageStream { inbox: rx })
    }

    /// Close the transport.
    ///
    /// Clears all queues; consumer streams end once their senders drop.
    async fn close(&self) -> Result<()> {
        // ---
        let mut map = self.queues.write().await;
        map.clear();
        Ok(())
    }
}

/// Create a new in-memory transport.
///
/// This transport is always available and requires no external resources.
pub async fn create_memory_transport() -> Result<TransportPtr> {
    // ---
    Ok(create_memory_transport_with_probe().await?.0)
}

/// Create an in-memory transport together with its instrumentation probe.
///
/// The probe records every publish and settlement, letting tests assert
/// ordering invariants such as ack-after-reply-publish.
pub async fn create_memory_transport_with_probe() -> Result<(TransportPtr, TransportProbe)> {
    // ---
    let probe = TransportProbe::default();

    let transport = MemoryTransport {
        // ---
        queues: Arc::new(RwLock::new(HashMap::new())),
        probe: probe.clone(),
    };

    Ok((Arc::new(transport), probe))
}
