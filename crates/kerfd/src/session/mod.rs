//! Session types: lifecycle phases, close reasons, and the binary
//! message transport the connection driver runs over.
//!
//! The driver is generic over a source/sink pair rather than tied to
//! the websocket types, so the integration harness can run a whole
//! session over in-process channels with a real Noise client.

pub mod connection;

use async_trait::async_trait;

/// Connection lifecycle. Monotonic: a session only moves forward, and
/// Failed is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Handshake,
    Established,
    Failed,
}

/// Why the gateway closed the socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Clean shutdown.
    Normal,
    /// Malformed protocol bytes: bad framing, bad envelope shape.
    CannotAccept,
    /// Crypto or internal failure.
    UnexpectedCondition,
}

impl CloseReason {
    /// Websocket close code.
    pub fn code(self) -> u16 {
        match self {
            CloseReason::Normal => 1000,
            CloseReason::CannotAccept => 1003,
            CloseReason::UnexpectedCondition => 1011,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CloseReason::Normal => "bye",
            CloseReason::CannotAccept => "cannot accept",
            CloseReason::UnexpectedCondition => "unexpected condition",
        }
    }
}

/// Transport-level failure reading or writing the socket.
#[derive(Debug, thiserror::Error)]
#[error("transport error: {0}")]
pub struct TransportError(pub String);

/// Inbound half of the binary message socket.
#[async_trait]
pub trait MessageSource: Send {
    /// Next binary message. `None` means the peer closed cleanly.
    async fn recv(&mut self) -> Option<Result<Vec<u8>, TransportError>>;
}

/// Outbound half of the binary message socket.
#[async_trait]
pub trait MessageSink: Send {
    async fn send(&mut self, message: Vec<u8>) -> Result<(), TransportError>;

    /// Best-effort close with a reason; errors are ignored because the
    /// peer may already be gone.
    async fn close(&mut self, reason: CloseReason);
}
