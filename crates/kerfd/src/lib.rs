//! kerfd — the Kerf gateway daemon.
//!
//! One long-lived binary websocket per client; a Noise_XX handshake
//! bound to a TEE attestation report; then many independent HTTP-like
//! requests multiplexed over the encrypted tunnel.

pub mod attest;
pub mod dispatch;
pub mod handler;
pub mod handlers;
pub mod respond;
pub mod server;
pub mod session;
pub mod stream;
