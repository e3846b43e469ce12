//! Cryptographic primitives for the Kerf tunnel.
//!
//! Provides two things:
//!   1. Noise_XX handshake drivers — the gateway is the responder, and
//!      its first outbound handshake message carries the attestation
//!      evidence that binds the static key to the TEE quote.
//!   2. The post-handshake transport cipher used for every frame.
//!
//! Identity keys are plain x25519-dalek values held behind
//! `Zeroizing`, so secret bytes are wiped when a session or provider
//! drops them; snow drives the Noise_XX state machine on top. There is
//! no unsafe code in this module.

use snow::{Builder, HandshakeState, TransportState};
use thiserror::Error;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroizing;

use crate::wire::{MAX_HANDSHAKE_FRAME, MAX_NOISE_PAYLOAD, NOISE_TAG_LEN};

/// The Noise protocol pattern Kerf uses.
///
/// Noise_XX: mutual authentication, both static keys transmitted
/// encrypted. The responder's static key travels in message 2 together
/// with the attestation payload that vouches for it.
const NOISE_PATTERN: &str = "Noise_XX_25519_AESGCM_SHA256";

// ── Keypair ───────────────────────────────────────────────────────────────────

/// X25519 identity used on one side of the handshake.
///
/// The gateway side comes from the attestation provider, which binds
/// the public half into the first 32 bytes of the quote's report_data;
/// a TEE regenerates its identity with the enclave, so nothing here is
/// ever persisted. Clients and the test harness mint ephemeral ones.
/// The secret half never leaves the struct and is wiped on drop.
pub struct Keypair {
    secret: Zeroizing<[u8; 32]>,
    /// Public half, bound into the attestation quote.
    pub public: [u8; 32],
}

impl Keypair {
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(rand::thread_rng());
        let public = PublicKey::from(&secret);
        Self {
            secret: Zeroizing::new(secret.to_bytes()),
            public: *public.as_bytes(),
        }
    }
}

// ── Handshake drivers ─────────────────────────────────────────────────────────

/// What the handshake state machine needs next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeAction {
    /// Feed the next inbound handshake message to `read_message`.
    ReadMessage,
    /// Produce the next outbound handshake message via `write_message`.
    WriteMessage,
    /// The handshake is complete; call `split`.
    Split,
}

/// Responder side of the Noise_XX handshake.
///
/// Drives the three-message exchange from the gateway's side. The
/// attestation payload given at construction rides on the first (and
/// only the first) outbound message; later outbound handshake messages
/// carry an empty payload.
pub struct ResponderHandshake {
    state: HandshakeState,
    first_payload: Option<Vec<u8>>,
}

impl ResponderHandshake {
    pub fn new(keypair: &Keypair, first_payload: Vec<u8>) -> Result<Self, CryptoError> {
        let state = Builder::new(NOISE_PATTERN.parse().map_err(|_| CryptoError::BadPattern)?)
            .local_private_key(&*keypair.secret)
            .build_responder()
            .map_err(CryptoError::Noise)?;
        Ok(Self {
            state,
            first_payload: Some(first_payload),
        })
    }

    pub fn next_action(&self) -> HandshakeAction {
        if self.state.is_handshake_finished() {
            HandshakeAction::Split
        } else if self.state.is_my_turn() {
            HandshakeAction::WriteMessage
        } else {
            HandshakeAction::ReadMessage
        }
    }

    /// Process one inbound handshake message, returning its payload.
    pub fn read_message(&mut self, message: &[u8]) -> Result<Vec<u8>, CryptoError> {
        read_handshake_message(&mut self.state, message)
    }

    /// Produce the next outbound handshake message.
    pub fn write_message(&mut self) -> Result<Vec<u8>, CryptoError> {
        let payload = self.first_payload.take().unwrap_or_default();
        write_handshake_message(&mut self.state, &payload)
    }

    /// Destroy the handshake state and keep only the transport cipher.
    pub fn split(self) -> Result<TransportCipher, CryptoError> {
        let transport = self
            .state
            .into_transport_mode()
            .map_err(CryptoError::Noise)?;
        Ok(TransportCipher { transport })
    }
}

/// Initiator side of the Noise_XX handshake.
///
/// Used by clients (and the test harness). The attestation payload the
/// responder sends in message 2 comes back from `read_message`.
pub struct InitiatorHandshake {
    state: HandshakeState,
}

impl InitiatorHandshake {
    pub fn new(keypair: &Keypair) -> Result<Self, CryptoError> {
        let state = Builder::new(NOISE_PATTERN.parse().map_err(|_| CryptoError::BadPattern)?)
            .local_private_key(&*keypair.secret)
            .build_initiator()
            .map_err(CryptoError::Noise)?;
        Ok(Self { state })
    }

    pub fn next_action(&self) -> HandshakeAction {
        if self.state.is_handshake_finished() {
            HandshakeAction::Split
        } else if self.state.is_my_turn() {
            HandshakeAction::WriteMessage
        } else {
            HandshakeAction::ReadMessage
        }
    }

    pub fn read_message(&mut self, message: &[u8]) -> Result<Vec<u8>, CryptoError> {
        read_handshake_message(&mut self.state, message)
    }

    pub fn write_message(&mut self) -> Result<Vec<u8>, CryptoError> {
        write_handshake_message(&mut self.state, &[])
    }

    pub fn split(self) -> Result<TransportCipher, CryptoError> {
        let transport = self
            .state
            .into_transport_mode()
            .map_err(CryptoError::Noise)?;
        Ok(TransportCipher { transport })
    }
}

fn read_handshake_message(
    state: &mut HandshakeState,
    message: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    if message.len() > MAX_HANDSHAKE_FRAME {
        return Err(CryptoError::OversizeHandshake(message.len()));
    }
    let mut payload = vec![0u8; message.len()];
    let len = state
        .read_message(message, &mut payload)
        .map_err(CryptoError::Noise)?;
    payload.truncate(len);
    Ok(payload)
}

fn write_handshake_message(
    state: &mut HandshakeState,
    payload: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let mut message = vec![0u8; payload.len() + 128];
    let len = state
        .write_message(payload, &mut message)
        .map_err(CryptoError::Noise)?;
    message.truncate(len);
    if message.len() > MAX_HANDSHAKE_FRAME {
        return Err(CryptoError::OversizeHandshake(message.len()));
    }
    Ok(message)
}

// ── Transport cipher ──────────────────────────────────────────────────────────

/// Post-handshake cipher for both directions of the tunnel.
///
/// The websocket delivers messages reliably and in order, so the
/// implicit-nonce Noise transport applies directly: ciphertext is
/// exactly plaintext length + 16. Encrypt and decrypt each require
/// exclusive access; the session wraps this in a Mutex and guarantees
/// one logical writer and one logical reader.
pub struct TransportCipher {
    transport: TransportState,
}

impl TransportCipher {
    /// Encrypt one frame. The result is `plaintext.len() + 16` bytes.
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if plaintext.len() > MAX_NOISE_PAYLOAD {
            return Err(CryptoError::PayloadTooLarge(plaintext.len()));
        }
        let mut out = vec![0u8; plaintext.len() + NOISE_TAG_LEN];
        let len = self
            .transport
            .write_message(plaintext, &mut out)
            .map_err(CryptoError::Noise)?;
        out.truncate(len);
        Ok(out)
    }

    /// Decrypt one frame. Fails on truncation or tag mismatch; a
    /// failure here is fatal for the session.
    pub fn decrypt(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if ciphertext.len() < NOISE_TAG_LEN {
            return Err(CryptoError::TooShort);
        }
        let mut out = vec![0u8; ciphertext.len()];
        let len = self
            .transport
            .read_message(ciphertext, &mut out)
            .map_err(CryptoError::Noise)?;
        out.truncate(len);
        Ok(out)
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("invalid Noise pattern string — this is a bug")]
    BadPattern,

    #[error("Noise protocol error: {0}")]
    Noise(#[from] snow::Error),

    #[error("handshake message of {0} bytes exceeds the 4096-byte limit")]
    OversizeHandshake(usize),

    #[error("plaintext of {0} bytes exceeds the Noise payload limit")]
    PayloadTooLarge(usize),

    #[error("ciphertext shorter than the 16-byte authentication tag")]
    TooShort,
}

// ── Tests ─────────────────────────────────────────────────────────────────────
