//! Request/response RPC over a message broker with automatic
//! correlation-token matching.
//!
//! Caller and callee never connect directly: the client publishes a
//! tagged request into a well-known shared queue and listens on a private
//! reply queue; a worker consumes the request, computes the response, and
//! routes it back tagged with the original token. Token equality is the
//! only causal link between the two messages.
//!
//! The library handles token generation, request/response matching,
//! publish budgets and call deadlines, worker backpressure via bounded
//! prefetch, and ack-after-reply delivery discipline.

// Import all sub modules once...
mod client;
mod domain;
mod server;
mod transport;

mod rpc_config;

mod correlation;
mod error;
mod macros;
mod retry;

pub(crate) use macros::{log_debug, log_error, log_info, log_warn};
pub(crate) use retry::retry_with_backoff;

// Re-export main types
pub use client::RpcClient;
pub use server::RpcServer;

pub use rpc_config::RpcConfig;
pub use retry::RetryConfig;

pub use correlation::{
    //
    CorrelationToken,
    RandomTokenGenerator,
    SequenceTokenGenerator,
    TokenGenerator,
};
pub use error::{Result, RpcError};

pub use transport::{
    //
    create_memory_transport,
    create_memory_transport_with_probe,
    TransportEvent,
    TransportProbe,
};

#[cfg(feature = "transport_lapin")]
pub use transport::create_lapin_transport;

// --- public re-exports
pub use domain::{
    //
    Acknowledger,
    Address,
    Delivery,
    Envelope,
    MessageStream,
    QueueSpec,
    Transport,
    TransportPtr,
};

/// Create the transport selected by `config`.
///
/// A config with a `transport_uri` selects the AMQP transport when the
/// `transport_lapin` feature is enabled; otherwise the in-memory
/// transport is used.
pub async fn create_transport(config: &RpcConfig) -> Result<TransportPtr> {
    // ---
    #[cfg(feature = "transport_lapin")]
    {
        if config.transport_uri.is_some() {
            return transport::create_lapin_transport(config).await;
        }
    }

    // Fallback / default
    create_memory_transport().await
}
