//! Per-connection driver: handshake, established-phase pumps, teardown.
//!
//! Task layout per session:
//!   * the inbound reader (this task) owns the frame assembler and the
//!     dispatcher, and is the receive cipher's single logical reader;
//!   * one spawned task per initiating request (inside the dispatcher);
//!   * one outbound writer task owning the socket sink — handler tasks
//!     queue envelopes, the writer serializes encode → split →
//!     encrypt → send, which is the only mutual exclusion the
//!     outbound path needs.
//!
//! Teardown on close or failure: cancel every stream, abort every
//! handler task, drain the writer, close the socket with a reason.

use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};

use kerf_core::auth::AuthSnapshot;
use kerf_core::crypto::{HandshakeAction, ResponderHandshake, TransportCipher};
use kerf_core::envelope::{RequestEnvelope, ResponseEnvelope};
use kerf_core::wire::{self, FrameAssembler, MAX_HANDSHAKE_FRAME, MAX_WIRE_FRAME};

use crate::attest::AttestationProvider;
use crate::dispatch::Dispatcher;
use crate::handler::RouteTable;
use crate::session::{CloseReason, MessageSink, MessageSource, Phase};
use crate::stream::{StreamLimits, StreamRegistry};

/// Everything a connection needs besides its socket.
pub struct ConnectionConfig {
    pub attest: Arc<dyn AttestationProvider>,
    pub routes: Arc<RouteTable>,
    pub limits: StreamLimits,
    pub auth: AuthSnapshot,
}

/// Drive one connection to completion. Returns when the socket is
/// closed, from either side, for any reason.
pub async fn run<Source, Sink>(mut source: Source, mut sink: Sink, config: ConnectionConfig)
where
    Source: MessageSource,
    Sink: MessageSink + Send + 'static,
{
    tracing::debug!(phase = ?Phase::Handshake, "connection opened");

    let cipher = match run_handshake(&mut source, &mut sink, &config).await {
        Ok(cipher) => cipher,
        Err(reason) => {
            sink.close(reason).await;
            return;
        }
    };

    tracing::debug!(phase = ?Phase::Established, "noise handshake complete");

    // Established phase. The cipher handles both directions and needs
    // exclusive access either way; reader and writer share it behind a
    // lock, each being the single logical user of its direction.
    let cipher = Arc::new(Mutex::new(cipher));
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel::<ResponseEnvelope>();
    let writer = tokio::spawn(outbound_loop(sink, cipher.clone(), outbound_rx));

    let registry = Arc::new(StreamRegistry::new(config.limits));
    let mut dispatcher = Dispatcher::new(
        config.routes.clone(),
        registry.clone(),
        config.auth,
        outbound_tx.clone(),
    );
    let mut assembler = FrameAssembler::new();

    let reason = read_loop(&mut source, &cipher, &mut assembler, &mut dispatcher).await;

    if reason != CloseReason::Normal {
        tracing::debug!(phase = ?Phase::Failed, ?reason, "session failed");
    }

    // Teardown: streams first (handlers blocked on upload pipes see
    // EOF), then the handler tasks, then the writer.
    registry.cancel_all().await;
    dispatcher.shutdown().await;
    assembler.clear();
    drop(dispatcher);
    drop(outbound_tx);

    if let Ok(Some(mut sink)) = writer.await {
        sink.close(reason).await;
    }
    tracing::debug!("connection closed");
}

/// Noise_XX responder exchange. The attestation evidence rides the
/// first outbound handshake message.
async fn run_handshake<Source, Sink>(
    source: &mut Source,
    sink: &mut Sink,
    config: &ConnectionConfig,
) -> Result<TransportCipher, CloseReason>
where
    Source: MessageSource,
    Sink: MessageSink,
{
    let evidence = config.attest.evidence().map_err(|e| {
        tracing::error!(error = %e, "attestation provider failed");
        CloseReason::UnexpectedCondition
    })?;
    let payload = serde_json::to_vec(&evidence).map_err(|e| {
        tracing::error!(error = %e, "attestation evidence does not serialize");
        CloseReason::UnexpectedCondition
    })?;

    let mut handshake =
        ResponderHandshake::new(config.attest.static_keypair(), payload).map_err(|e| {
            tracing::error!(error = %e, "handshake init failed");
            CloseReason::UnexpectedCondition
        })?;

    loop {
        match handshake.next_action() {
            HandshakeAction::ReadMessage => {
                let message = match source.recv().await {
                    Some(Ok(message)) => message,
                    Some(Err(e)) => {
                        tracing::debug!(error = %e, "socket error during handshake");
                        return Err(CloseReason::UnexpectedCondition);
                    }
                    None => return Err(CloseReason::Normal),
                };
                if message.len() > MAX_HANDSHAKE_FRAME {
                    tracing::warn!(len = message.len(), "oversize handshake frame");
                    return Err(CloseReason::CannotAccept);
                }
                handshake.read_message(&message).map_err(|e| {
                    tracing::warn!(error = %e, "handshake message rejected");
                    CloseReason::UnexpectedCondition
                })?;
            }
            HandshakeAction::WriteMessage => {
                let message = handshake.write_message().map_err(|e| {
                    tracing::error!(error = %e, "handshake write failed");
                    CloseReason::UnexpectedCondition
                })?;
                sink.send(message).await.map_err(|e| {
                    tracing::debug!(error = %e, "socket error during handshake");
                    CloseReason::UnexpectedCondition
                })?;
            }
            HandshakeAction::Split => {
                return handshake.split().map_err(|e| {
                    tracing::error!(error = %e, "handshake split failed");
                    CloseReason::UnexpectedCondition
                });
            }
        }
    }
}

/// Established-phase inbound pump: decrypt, reassemble, decode,
/// dispatch. Any protocol or crypto failure here is fatal for the
/// whole session — a client that framed one message wrong cannot be
/// trusted with the rest.
async fn read_loop<Source>(
    source: &mut Source,
    cipher: &Arc<Mutex<TransportCipher>>,
    assembler: &mut FrameAssembler,
    dispatcher: &mut Dispatcher,
) -> CloseReason
where
    Source: MessageSource,
{
    loop {
        let message = match source.recv().await {
            Some(Ok(message)) => message,
            Some(Err(e)) => {
                tracing::debug!(error = %e, "socket error");
                return CloseReason::UnexpectedCondition;
            }
            None => return CloseReason::Normal,
        };

        if message.len() > MAX_WIRE_FRAME {
            tracing::warn!(len = message.len(), "oversize frame");
            return CloseReason::CannotAccept;
        }

        let plaintext = match cipher.lock().await.decrypt(&message) {
            Ok(plaintext) => plaintext,
            Err(e) => {
                tracing::warn!(error = %e, "frame decryption failed");
                return CloseReason::UnexpectedCondition;
            }
        };

        let frame = match wire::decode_frame(&plaintext) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(error = %e, "malformed frame");
                return CloseReason::CannotAccept;
            }
        };

        let complete = match assembler.process(frame) {
            Ok(complete) => complete,
            Err(e) => {
                tracing::warn!(error = %e, "inconsistent frame");
                return CloseReason::CannotAccept;
            }
        };

        let Some(message) = complete else { continue };

        let envelope = match RequestEnvelope::decode(&message) {
            Ok(envelope) => envelope,
            Err(e) => {
                // A malformed envelope means a broken client; close the
                // session rather than answering on one id.
                tracing::warn!(error = %e, "malformed request envelope");
                return CloseReason::CannotAccept;
            }
        };

        dispatcher.dispatch(envelope).await;
    }
}

/// Outbound writer: the single logical sender. Serializes every
/// envelope into frames, encrypts each, and writes them to the socket
/// in order. Returns the sink for the final close frame, or `None`
/// when it already closed the socket after a failure.
async fn outbound_loop<Sink>(
    mut sink: Sink,
    cipher: Arc<Mutex<TransportCipher>>,
    mut outbound: mpsc::UnboundedReceiver<ResponseEnvelope>,
) -> Option<Sink>
where
    Sink: MessageSink,
{
    while let Some(envelope) = outbound.recv().await {
        let message = envelope.encode();
        for frame in wire::encode_frames(&message) {
            let ciphertext = match cipher.lock().await.encrypt(&frame) {
                Ok(ciphertext) => ciphertext,
                Err(e) => {
                    tracing::error!(error = %e, "outbound encryption failed");
                    sink.close(CloseReason::UnexpectedCondition).await;
                    return None;
                }
            };
            if let Err(e) = sink.send(ciphertext).await {
                tracing::debug!(error = %e, "outbound socket write failed");
                return None;
            }
        }
    }
    Some(sink)
}
