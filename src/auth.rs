//! Shared-token authentication.
//!
//! The server issues (or is given) one token at startup and every WebSocket
//! connection and API request must present it. Only a bcrypt hash of the token
//! is kept in memory.

use tracing::warn;
use uuid::Uuid;

/// Validates bearer tokens presented by clients.
pub trait TokenValidator: Send + Sync {
    fn validate(&self, token: &str) -> bool;
}

/// Generate a fresh random token.
pub fn issue_token() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Longest token bcrypt can hash without truncating it.
pub const MAX_TOKEN_BYTES: usize = 71;

/// Holds the bcrypt hash of the single shared token.
pub struct TokenAuth {
    token_hash: String,
}

impl TokenAuth {
    pub fn new(token: &str) -> Result<Self, bcrypt::BcryptError> {
        Self::with_cost(token, bcrypt::DEFAULT_COST)
    }

    /// Fails with `BcryptError::Truncation` for tokens over [`MAX_TOKEN_BYTES`].
    pub fn with_cost(token: &str, cost: u32) -> Result<Self, bcrypt::BcryptError> {
        Ok(Self {
            token_hash: bcrypt::non_truncating_hash(token, cost)?,
        })
    }
}

impl TokenValidator for TokenAuth {
    fn validate(&self, token: &str) -> bool {
        if token.is_empty() {
            return false;
        }
        // Rejects over-long tokens instead of comparing only their prefix.
        match bcrypt::non_truncating_verify(token, &self.token_hash) {
            Ok(valid) => valid,
            Err(bcrypt::BcryptError::Truncation(len)) => {
                warn!("Rejected a {} byte token", len.saturating_sub(1));
                false
            }
            Err(e) => {
                warn!("Token verification failed: {}", e);
                false
            }
        }
    }
}
