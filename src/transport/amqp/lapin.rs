//! AMQP transport implementation using `lapin`.
//!
//! This module provides an implementation of the `Transport` trait backed
//! by an AMQP broker connection. It follows an **actor-based concurrency
//! model** to safely integrate with the underlying AMQP client.
//!
//! ## Concurrency model
//!
//! - A single background **actor task** owns the AMQP connection and channel.
//! - The actor is responsible for:
//!   - publishing outbound messages,
//!   - declaring queues,
//!   - setting the channel prefetch,
//!   - starting consumers,
//!   - clean shutdown of the connection.
//! - All interaction with the AMQP client is serialized through this actor;
//!   no other task ever touches the connection directly. Concurrent callers
//!   therefore never race on the channel.
//!
//! ## Message semantics
//!
//! Correlation ids and reply-to addresses ride in the AMQP message
//! properties; the body is the caller's opaque payload bytes. The
//! transport never interprets either.
//!
//! Consumers started with `auto_ack` use the broker's no-ack mode; manual
//! consumers receive an acknowledger wired to the broker delivery, and the
//! consuming layer decides when to settle it.
//!
//! ## Connection behavior
//!
//! The connection is established during transport creation, retried with
//! exponential backoff when [`RpcConfig::retry_config`] is set. Brokers
//! that come up after their clients are the common case in container
//! deployments.

use lapin::{
    //
    options::{
        //
        BasicAckOptions,
        BasicConsumeOptions,
        BasicNackOptions,
        BasicPublishOptions,
        BasicQosOptions,
        QueueDeclareOptions,
    },
    types::FieldTable,
    BasicProperties,
    Channel,
    Connection,
    ConnectionProperties,
};

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::domain::NoopAcknowledger;
use crate::{
    //
    log_debug,
    log_error,
    log_info,
    Acknowledger,
    Address,
    Delivery,
    Envelope,
    MessageStream,
    QueueSpec,
    Result,
    RpcConfig,
    RpcError,
    Transport,
    TransportPtr,
};

//
// Actor commands
//

enum Cmd {
    //
    DeclareQueue {
        spec: QueueSpec,
        resp: oneshot::Sender<Result<Address>>,
    },
    SetPrefetch {
        count: u16,
        resp: oneshot::Sender<Result<()>>,
    },
    Publish {
        address: Address,
        env: Envelope,
        resp: oneshot::Sender<Result<()>>,
    },
    Consume {
        queue: Address,
        auto_ack: bool,
        resp: oneshot::Sender<Result<MessageStream>>,
    },
    Close {
        resp: oneshot::Sender<Result<()>>,
    },
}

/// AMQP transport implementation using lapin.
///
/// Cheap to clone through [`TransportPtr`]; all clones share the actor
/// and therefore the broker connection.
struct AmqpTransport {
    // ---
    transport_id: String,
    cmd_tx: mpsc::Sender<Cmd>,
}

impl AmqpTransport {
    /// Creates a new AMQP transport around an established connection and
    /// channel, spawning the background actor task.
    fn create(transport_id: &str, connection: Connection, channel: Channel) -> TransportPtr {
        // ---
        let transport_id = transport_id.to_string();

        let (cmd_tx, cmd_rx) = mpsc::channel(16);

        let actor = Actor {
            transport_id: transport_id.clone(),
            connection,
            channel,
            cmd_rx,
            consumer_tasks: Vec::new(),
        };

        tokio::spawn(async move {
            actor.run().await;
        });

        Arc::new(Self {
            transport_id,
            cmd_tx,
        })
    }

    async fn send_cmd<T>(
        &self,
        cmd: Cmd,
        rx: oneshot::Receiver<Result<T>>,
    ) -> Result<T> {
        // ---
        self.cmd_tx.send(cmd).await.map_err(|e| {
            let msg = format!("actor command channel closed: {e}");
            RpcError::Transport(msg)
        })?;

        rx.await.map_err(|e| {
            let msg = format!("actor response channel read failed: {e}");
            RpcError::Transport(msg)
        })?
    }
}

/// Background actor task that owns the AMQP connection and channel.
struct Actor {
    // ---
    transport_id: String,
    connection: Connection,
    channel: Channel,
    cmd_rx: mpsc::Receiver<Cmd>,
    consumer_tasks: Vec<JoinHandle<()>>,
}

impl Actor {
    async fn run(mut self) {
        // ---
        log_info!("[{}] AMQP actor started", self.transport_id);

        while let Some(cmd) = self.cmd_rx.recv().await {
            if self.handle_cmd(cmd).await {
                break;
            }
        }

        for handle in self.consumer_tasks.drain(..) {
            handle.abort();
        }

        let _ = self.channel.close(200, "Normal shutdown").await;
        let _ = self.connection.close(200, "Normal shutdown").await;

        log_info!("[{}] AMQP actor stopped", self.transport_id);
    }

    /// Returns `true` when the actor should shut down.
    async fn handle_cmd(&mut self, cmd: Cmd) -> bool {
        // ---
        match cmd {
            Cmd::DeclareQueue { spec, resp } => {
                let result = self.do_declare_queue(spec).await;
                let _ = resp.send(result);
            }
            Cmd::SetPrefetch { count, resp } => {
                let result = self.do_set_prefetch(count).await;
                let _ = resp.send(result);
            }
            Cmd::Publish { address, env, resp } => {
                let result = self.do_publish(address, env).await;
                let _ = resp.send(result);
            }
            Cmd::Consume {
                queue,
                auto_ack,
                resp,
            } => {
                let result = self.do_consume(queue, auto_ack).await;
                let _ = resp.send(result);
            }
            Cmd::Close { resp } => {
                let _ = resp.send(Ok(()));
                return true;
            }
        }
        false
    }

    async fn do_declare_queue(&mut self, spec: QueueSpec) -> Result<Address> {
        // ---
        let options = QueueDeclareOptions {
            passive: false,
            durable: spec.durable,
            exclusive: spec.exclusive,
            auto_delete: spec.auto_delete,
            nowait: false,
        };

        let queue = self
            .channel
            .queue_declare(&spec.name, options, FieldTable::default())
            .await
            .map_err(|e| RpcError::Transport(format!("amqp: queue declare failed: {e}")))?;

        let name = queue.name().as_str().to_string();
        log_info!("[{}] Declared queue: {name}", self.transport_id);

        Ok(Address::from(name))
    }

    async fn do_set_prefetch(&mut self, count: u16) -> Result<()> {
        // ---
        self.channel
            .basic_qos(count, BasicQosOptions::default())
            .await
            .map_err(|e| RpcError::Transport(format!("amqp: basic_qos failed: {e}")))?;

        log_debug!("[{}] Prefetch set to {count}", self.transport_id);
        Ok(())
    }

    async fn do_publish(&mut self, address: Address, env: Envelope) -> Result<()> {
        // ---
        let mut properties = BasicProperties::default();
        if let Some(content_type) = &env.content_type {
            properties = properties.with_content_type(content_type.as_ref().into());
        }
        if let Some(correlation_id) = &env.correlation_id {
            properties = properties.with_correlation_id(correlation_id.as_ref().into());
        }
        if let Some(reply_to) = &env.reply_to {
            properties = properties.with_reply_to(reply_to.as_str().into());
        }

        // Confirmation resolves immediately unless publisher confirms
        // are enabled on the channel; either way the publish has been
        // handed to the broker connection.
        let _confirm = self
            .channel
            .basic_publish(
                "", // default exchange: routing key = queue name
                address.as_str(),
                BasicPublishOptions::default(),
                &env.payload,
                properties,
            )
            .await
            .map_err(|e| RpcError::Publish(format!("amqp: publish failed: {e}")))?;

        log_debug!("[{}] Published to queue: {address}", self.transport_id);
        Ok(())
    }

    async fn do_consume(&mut self, queue: Address, auto_ack: bool) -> Result<MessageStream> {
        // ---
        let options = BasicConsumeOptions {
            no_ack: auto_ack,
            ..BasicConsumeOptions::default()
        };

        let consumer = self
            .channel
            .basic_consume(
                queue.as_str(),
                "", // broker assigns the consumer tag
                options,
                FieldTable::default(),
            )
            .await
            .map_err(|e| RpcError::Transport(format!("amqp: consume failed: {e}")))?;

        log_info!("[{}] Started consuming queue: {queue}", self.transport_id);

        let (tx, rx) = mpsc::channel(64);
        let transport_id = self.transport_id.clone();
        let queue_name = queue.as_str().to_string();

        let handle = tokio::spawn(async move {
            use futures_lite::stream::StreamExt;

            let mut consumer = consumer;
            while let Some(delivery_result) = consumer.next().await {
                match delivery_result {
                    Ok(delivery) => {
                        log_debug!("[{transport_id}] Received message on queue: {queue_name}");

                        let lapin::message::Delivery {
                            data,
                            properties,
                            acker,
                            ..
                        } = delivery;

                        let envelope = Envelope {
                            payload: Bytes::from(data),
                            correlation_id: properties
                                .correlation_id()
                                .as_ref()
                                .map(|s| Arc::<str>::from(s.as_str())),
                            reply_to: properties
                                .reply_to()
                                .as_ref()
                                .map(|s| Address::from(s.as_str())),
                            content_type: properties
                                .content_type()
                                .as_ref()
                                .map(|s| Arc::<str>::from(s.as_str())),
                        };

                        let boxed: Box<dyn Acknowledger> = if auto_ack {
                            Box::new(NoopAcknowledger)
                        } else {
                            Box::new(LapinAcknowledger { acker })
                        };

                        if tx.send(Delivery::new(envelope, boxed)).await.is_err() {
                            // Stream handle dropped; stop consuming.
                            break;
                        }
                    }
                    Err(_e) => {
                        log_error!("[{transport_id}] Consumer error on {queue_name}: {_e}");
                        break;
                    }
                }
            }

            log_info!("[{transport_id}] Consumer task ended for queue: {queue_name}");
        });

        self.consumer_tasks.push(handle);

        Ok(MessageStream { inbox: rx })
    }
}

/// Acknowledgement handle wired to one broker delivery.
struct LapinAcknowledger {
    acker: lapin::acker::Acker,
}

#[async_trait::async_trait]
impl Acknowledger for LapinAcknowledger {
    // ---
    async fn ack(&self) -> Result<()> {
        self.acker
            .ack(BasicAckOptions::default())
            .await
            .map_err(|e| RpcError::Transport(format!("amqp: ack failed: {e}")))
    }

    async fn nack(&self, requeue: bool) -> Result<()> {
        self.acker
            .nack(BasicNackOptions {
                requeue,
                ..BasicNackOptions::default()
            })
            .await
            .map_err(|e| RpcError::Transport(format!("amqp: nack failed: {e}")))
    }
}

#[async_trait::async_trait]
impl Transport for AmqpTransport {
    // ---
    async fn declare_queue(&self, spec: QueueSpec) -> Result<Address> {
        // ---
        let (tx, rx) = oneshot::channel();
        self.send_cmd(Cmd::DeclareQueue { spec, resp: tx }, rx).await
    }

    async fn set_prefetch(&self, count: u16) -> Result<()> {
        // ---
        let (tx, rx) = oneshot::channel();
        self.send_cmd(Cmd::SetPrefetch { count, resp: tx }, rx).await
    }

    async fn publish(&self, address: Address, env: Envelope, budget: Duration) -> Result<()> {
        // ---
        let (tx, rx) = oneshot::channel();
        let fut = self.send_cmd(
            Cmd::Publish {
                address: address.clone(),
                env,
                resp: tx,
            },
            rx,
        );

        match tokio::time::timeout(budget, fut).await {
            Ok(result) => result,
            Err(_) => Err(RpcError::Publish(format!(
                "publish to {address} exceeded budget of {budget:?}"
            ))),
        }
    }

    async fn consume(&self, queue: &Address, auto_ack: bool) -> Result<MessageStream> {
        // ---
        let (tx, rx) = oneshot::channel();
        self.send_cmd(
            Cmd::Consume {
                queue: queue.clone(),
                auto_ack,
                resp: tx,
            },
            rx,
        )
        .await
    }

    async fn close(&self) -> Result<()> {
        // ---
        let (tx, rx) = oneshot::channel();

        let _ = self.cmd_tx.send(Cmd::Close { resp: tx }).await;
        let _ = rx.await;

        log_info!("[{}] AMQP transport closed", self.transport_id);
        Ok(())
    }
}

/// Creates a lapin-based AMQP transport from the given configuration.
///
/// Connection establishment is retried with exponential backoff when
/// [`RpcConfig::retry_config`] is set.
///
/// # Errors
///
/// Returns [`RpcError::Transport`] if:
/// - The configuration has no `transport_uri`
/// - Connection to the broker fails (after retries, if configured)
pub async fn create_transport(config: &RpcConfig) -> Result<TransportPtr> {
    // ---
    let uri = config
        .transport_uri
        .as_deref()
        .ok_or_else(|| RpcError::Transport("AMQP transport requires transport_uri".to_string()))?;

    let (connection, channel) =
        crate::retry_with_backoff(config.retry_config.as_ref(), || connect(uri))
            .await
            .map_err(|err| match err {
                // Retries exhausted; the failure is terminal for this call.
                RpcError::TransportRetryable(msg) => RpcError::Transport(msg),
                other => other,
            })?;

    Ok(AmqpTransport::create(
        &config.transport_id,
        connection,
        channel,
    ))
}

/// Creates an AMQP connection and channel.
async fn connect(uri: &str) -> Result<(Connection, Channel)> {
    // ---
    log_info!("Connecting to AMQP broker: {uri}");

    let connection = Connection::connect(uri, ConnectionProperties::default())
        .await
        .map_err(|e| {
            let msg = format!("amqp: connection failed: {e}");
            log_error!("{msg}");
            RpcError::TransportRetryable(msg)
        })?;

    let channel = connection.create_channel().await.map_err(|e| {
        let msg = format!("amqp: channel creation failed: {e}");
        log_error!("{msg}");
        RpcError::Transport(msg)
    })?;

    log_info!("Connected to AMQP broker");

    Ok((connection, channel))
}
