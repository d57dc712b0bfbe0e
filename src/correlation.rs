use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Length of a generated correlation token in characters.
const TOKEN_LEN: usize = 32;

/// Opaque identifier linking a request message to its eventual response.
///
/// Tokens are carried *in-band* inside message properties and echoed
/// unmodified by the responder. They are opaque to the transport layer
/// and meaningful only within the reply queue they arrive on, for the
/// lifetime of one outstanding call.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CorrelationToken(String);

impl CorrelationToken {
    /// Borrow the token as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for CorrelationToken {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for CorrelationToken {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for CorrelationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Source of correlation tokens for an RPC client.
///
/// Generation sits behind a trait so the process-wide random source can
/// be swapped for a deterministic sequence in tests.
pub trait TokenGenerator: Send + Sync {
    /// Produce a token for one outstanding call.
    fn generate(&self) -> CorrelationToken;
}

/// Tokens drawn uniformly from the uppercase alphabet `A..=Z`,
/// [`TOKEN_LEN`] characters long.
///
/// Uniqueness is probabilistic only: at this length a collision between
/// calls concurrently sharing one reply queue is negligible, and no
/// registry or coordination is kept.
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomTokenGenerator;

impl TokenGenerator for RandomTokenGenerator {
    fn generate(&self) -> CorrelationToken {
        let mut rng = rand::thread_rng();
        let token: String = (0..TOKEN_LEN)
            .map(|_| char::from(b'A' + rng.gen_range(0..26u8)))
            .collect();
        CorrelationToken(token)
    }
}

/// Deterministic generator producing `T-0000`, `T-0001`, ...
///
/// Intended for tests that need to predict or forge tokens.
#[derive(Debug, Default)]
pub struct SequenceTokenGenerator {
    next: AtomicU64,
}

impl TokenGenerator for SequenceTokenGenerator {
    fn generate(&self) -> CorrelationToken {
        let n = self.next.fetch_add(1, Ordering::Relaxed);
        CorrelationToken(format!("T-{n:04}"))
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn test_generate_length_and_alphabet() {
        // ---
        let token = RandomTokenGenerator.generate();
        assert_eq!(token.as_str().len(), TOKEN_LEN);
        assert!(token.as_str().chars().all(|c| c.is_ascii_uppercase()));
    }

    #[test]
    fn test_generate_independent() {
        // ---
        let gen = RandomTokenGenerator;
        let t1 = gen.generate();
        let t2 = gen.generate();
        assert_ne!(t1, t2);
    }

    #[test]
    fn test_sequence_generator_is_deterministic() {
        // ---
        let gen = SequenceTokenGenerator::default();
        assert_eq!(gen.generate().as_str(), "T-0000");
        assert_eq!(gen.generate().as_str(), "T-0001");
        assert_eq!(gen.generate().as_str(), "T-0002");
    }

    #[test]
    fn test_from_round_trip() {
        // ---
        let token = CorrelationToken::from("ABCDEF");
        assert_eq!(token.to_string(), "ABCDEF");
        assert_eq!(CorrelationToken::from("ABCDEF".to_string()), token);
    }
}
