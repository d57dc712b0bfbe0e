use thiserror::Error;

/// Errors that can occur during RPC operations.
#[derive(Error, Debug)]
pub enum RpcError {
    /// Broker connection, channel, or queue declaration failed.
    #[error("transport error: {0}")]
    Transport(String),

    /// Transient transport failure eligible for backoff retry.
    ///
    /// Produced by connection establishment when the broker is not yet
    /// reachable. The backoff retry helper retries only this variant;
    /// everything else fails immediately.
    #[error("transport error (retryable): {0}")]
    TransportRetryable(String),

    /// A publish attempt was rejected by the broker or exceeded its
    /// time budget.
    #[error("publish failed: {0}")]
    Publish(String),

    /// No matching response arrived within the call deadline.
    ///
    /// The call is abandoned, not cancelled: the request may still be
    /// processed by a worker and its reply discarded on arrival.
    #[error("call timed out waiting for response")]
    Timeout,

    /// A message body could not be decoded into the handler's input type.
    ///
    /// Never fatal to a worker process; the server nacks the delivery
    /// and continues serving.
    #[error("decode error: {0}")]
    Decode(String),
}

/// Result type alias for RPC operations.
pub type Result<T> = std::result::Result<T, RpcError>;
