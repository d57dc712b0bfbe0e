use crate::CorrelationToken;
use bytes::Bytes;
use std::collections::HashMap;
use tokio::sync::oneshot;

/// Tracks outstanding calls waiting for responses.
///
/// Maps correlation tokens to oneshot channels. When a matching response
/// arrives, the channel delivers the payload to the waiting call; the
/// entry is removed on first match, so a duplicate response finds no slot
/// and is discarded by the dispatcher.
pub(super) struct PendingCalls {
    // ---
    calls: HashMap<CorrelationToken, oneshot::Sender<Bytes>>,
}

impl PendingCalls {
    // ---

    /// Create a new empty pending-call tracker.
    pub fn new() -> Self {
        // ---
        Self {
            calls: HashMap::new(),
        }
    }

    /// Register a new outstanding call.
    ///
    /// Returns a receiver that resolves when the matching response arrives.
    /// The token must not already be outstanding; re-registering replaces
    /// the old slot, which the caller rules out by generating a fresh
    /// token per call.
    pub fn register(&mut self, token: CorrelationToken) -> oneshot::Receiver<Bytes> {
        // ---
        let (tx, rx) = oneshot::channel();
        self.calls.insert(token, tx);
        rx
    }

    /// Complete an outstanding call with the response payload.
    ///
    /// Returns true if the token was outstanding and the response was
    /// delivered.
    pub fn complete(&mut self, token: &CorrelationToken, response: Bytes) -> bool {
        // ---
        if let Some(tx) = self.calls.remove(token) {
            // Ignore a receiver dropped by a timed-out call.
            let _ = tx.send(response);
            true
        } else {
            false
        }
    }

    /// Remove an outstanding call without delivering a response.
    ///
    /// Used for cleanup on timeout and publish failure.
    pub fn remove(&mut self, token: &CorrelationToken) -> bool {
        // ---
        self.calls.remove(token).is_some()
    }

    /// Number of outstanding calls.
    #[allow(dead_code)]
    pub fn len(&self) -> usize {
        // ---
        self.calls.len()
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::{RandomTokenGenerator, TokenGenerator};

    #[test]
    fn test_register_and_complete() {
        // ---
        let mut pending = PendingCalls::new();
        let token = RandomTokenGenerator.generate();

        let rx = pending.register(token.clone());
        assert_eq!(pending.len(), 1);

        let response = Bytes::from("test response");
        assert!(pending.complete(&token, response.clone()));

        // Removed after completion
        assert_eq!(pending.len(), 0);

        let received = rx.blocking_recv().unwrap();
        assert_eq!(received, response);
    }

    #[test]
    fn test_remove() {
        // ---
        let mut pending = PendingCalls::new();
        let token = RandomTokenGenerator.generate();

        let _rx = pending.register(token.clone());
        assert_eq!(pending.len(), 1);

        assert!(pending.remove(&token));
        assert_eq!(pending.len(), 0);

        // Second remove should return false
        assert!(!pending.remove(&token));
    }

    #[test]
    fn test_complete_unknown_token() {
        // ---
        let mut pending = PendingCalls::new();
        let token = RandomTokenGenerator.generate();

        let response = Bytes::from("test");
        assert!(!pending.complete(&token, response));
    }
}
