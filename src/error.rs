// Error taxonomy for the gateway.
// Only recipient-semantic and backpressure errors cross into domain code;
// transport and protocol failures stay inside the ccs module and are
// translated by the delivery manager.

use thiserror::Error;

/// Failures surfaced to domain callers of `DeliveryManager::notify`.
#[derive(Debug, Error)]
pub enum DeliveryError {
    /// The recipient cannot receive messages: no registration token, or the
    /// relay reported the token permanently invalid. Never retried.
    #[error("recipient cannot receive messages: {reason}")]
    InvalidRecipient { reason: String },

    /// Relay or transport hiccup that survived the internal retry policy.
    #[error("transient delivery failure: {reason}")]
    Transient { reason: String },

    /// No ack/nack observed within the wait window, retries exhausted.
    #[error("no acknowledgment from relay after {attempts} attempts")]
    Timeout { attempts: u32 },

    /// The gateway is reconnecting and the pending queue is full. Callers
    /// are expected to apply their own backpressure.
    #[error("gateway unavailable, {queued} sends already queued")]
    ServiceUnavailable { queued: usize },
}

impl DeliveryError {
    pub fn invalid_recipient(reason: &str) -> Self {
        DeliveryError::InvalidRecipient {
            reason: reason.to_string(),
        }
    }

    pub fn transient(reason: &str) -> Self {
        DeliveryError::Transient {
            reason: reason.to_string(),
        }
    }
}

/// Connection-level failures. Internal to the session and the manager's
/// reconnect loop; never returned from the public API.
#[derive(Debug, Clone, Error)]
pub enum ConnectionError {
    /// The relay rejected the configured credentials. Fatal for the
    /// connection attempt; retrying the same credentials cannot succeed.
    #[error("relay rejected credentials for sender id")]
    AuthenticationFailed,

    #[error("transport I/O error: {0}")]
    Io(String),

    #[error("TLS error: {0}")]
    Tls(String),

    /// The inbound stream ended without a disconnect event.
    #[error("relay stream ended unexpectedly")]
    StreamEnded,

    /// Handshake did not complete within the configured window.
    #[error("relay handshake timed out")]
    HandshakeTimeout,

    /// A send was attempted while the session had no live connection.
    #[error("session is not connected")]
    NotConnected,

    /// The relay asked the session to drain; no new sends are accepted.
    #[error("session is draining")]
    Draining,

    #[error("invalid gateway configuration: {0}")]
    InvalidConfig(String),
}
