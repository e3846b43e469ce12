//! Kerf integration harness.
//!
//! Drives a complete session — Noise_XX handshake, framed encrypted
//! transport, multiplexed requests — against the real connection
//! driver, with the websocket replaced by in-process channels. The
//! client side runs a genuine Noise initiator, so every byte crosses
//! the same cipher and framing paths a production client would use.

use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use tokio::io::AsyncReadExt;
use tokio::sync::{mpsc, Notify};

use kerf_core::auth::AuthSnapshot;
use kerf_core::crypto::{HandshakeAction, InitiatorHandshake, Keypair, TransportCipher};
use kerf_core::envelope::{BodyChunk, RequestEnvelope, ResponseEnvelope};
use kerf_core::wire::{self, FrameAssembler, NOISE_TAG_LEN};

use kerfd::attest::DevAttestationProvider;
use kerfd::handler::{Handler, HandlerError, Outcome, Request, RouteTable};
use kerfd::handlers::{EchoHandler, PingHandler};
use kerfd::session::connection::{self, ConnectionConfig};
use kerfd::session::{CloseReason, MessageSink, MessageSource, TransportError};
use kerfd::stream::{StreamLimits, StreamRegistry};

// ── Channel transport ─────────────────────────────────────────────────────────

struct ChanSource(mpsc::UnboundedReceiver<Vec<u8>>);

#[async_trait]
impl MessageSource for ChanSource {
    async fn recv(&mut self) -> Option<Result<Vec<u8>, TransportError>> {
        self.0.recv().await.map(Ok)
    }
}

struct ChanSink {
    tx: Option<mpsc::UnboundedSender<Vec<u8>>>,
    closed: Arc<StdMutex<Option<CloseReason>>>,
}

#[async_trait]
impl MessageSink for ChanSink {
    async fn send(&mut self, message: Vec<u8>) -> Result<(), TransportError> {
        self.tx
            .as_ref()
            .and_then(|tx| tx.send(message).ok())
            .ok_or_else(|| TransportError("peer gone".into()))
    }

    async fn close(&mut self, reason: CloseReason) {
        *self.closed.lock().unwrap() = Some(reason);
        // Dropping the sender is the channel equivalent of the close frame.
        self.tx.take();
    }
}

// ── Client harness ────────────────────────────────────────────────────────────

struct TestClient {
    to_server: mpsc::UnboundedSender<Vec<u8>>,
    from_server: mpsc::UnboundedReceiver<Vec<u8>>,
    cipher: TransportCipher,
    assembler: FrameAssembler,
    evidence: serde_json::Value,
    closed: Arc<StdMutex<Option<CloseReason>>>,
}

fn live_auth() -> AuthSnapshot {
    AuthSnapshot {
        subscribed: false,
        token_expiry: Some(SystemTime::now() + Duration::from_secs(3600)),
    }
}

fn spawn_session(
    routes: RouteTable,
    auth: AuthSnapshot,
) -> (
    mpsc::UnboundedSender<Vec<u8>>,
    mpsc::UnboundedReceiver<Vec<u8>>,
    Arc<StdMutex<Option<CloseReason>>>,
) {
    let (client_tx, server_rx) = mpsc::unbounded_channel();
    let (server_tx, client_rx) = mpsc::unbounded_channel();
    let closed = Arc::new(StdMutex::new(None));

    let config = ConnectionConfig {
        attest: Arc::new(DevAttestationProvider::new()),
        routes: Arc::new(routes),
        limits: StreamLimits::default(),
        auth,
    };
    tokio::spawn(connection::run(
        ChanSource(server_rx),
        ChanSink {
            tx: Some(server_tx),
            closed: closed.clone(),
        },
        config,
    ));

    (client_tx, client_rx, closed)
}

impl TestClient {
    /// Open a session and complete the Noise handshake.
    async fn connect(routes: RouteTable, auth: AuthSnapshot) -> Self {
        let (to_server, mut from_server, closed) = spawn_session(routes, auth);

        let keys = Keypair::generate();
        let mut handshake = InitiatorHandshake::new(&keys).expect("initiator");
        let mut evidence_payload = Vec::new();

        let cipher = loop {
            match handshake.next_action() {
                HandshakeAction::WriteMessage => {
                    let message = handshake.write_message().expect("handshake write");
                    to_server.send(message).expect("server alive");
                }
                HandshakeAction::ReadMessage => {
                    let message = from_server.recv().await.expect("handshake reply");
                    let payload = handshake.read_message(&message).expect("handshake read");
                    if !payload.is_empty() {
                        evidence_payload = payload;
                    }
                }
                HandshakeAction::Split => break handshake.split().expect("split"),
            }
        };

        let evidence: serde_json::Value =
            serde_json::from_slice(&evidence_payload).expect("attestation payload is JSON");

        Self {
            to_server,
            from_server,
            cipher,
            assembler: FrameAssembler::new(),
            evidence,
            closed,
        }
    }

    /// Frame, encrypt, and send one application message.
    fn send_message(&mut self, message: &[u8]) {
        for frame in wire::encode_frames(message) {
            let ciphertext = self.cipher.encrypt(&frame).expect("encrypt");
            self.to_server.send(ciphertext).expect("server alive");
        }
    }

    fn send_request(&mut self, envelope: &RequestEnvelope) {
        self.send_message(&envelope.encode());
    }

    fn send_chunk(&mut self, id: u64, data: &[u8], seq: u32, is_final: bool) {
        self.send_request(&RequestEnvelope {
            id,
            verb: None,
            path: None,
            body: None,
            chunk: Some(BodyChunk {
                data: data.to_vec(),
                seq,
                is_final,
            }),
        });
    }

    fn initiating(id: u64, verb: &str, path: &str) -> RequestEnvelope {
        RequestEnvelope {
            id,
            verb: Some(verb.to_string()),
            path: Some(path.to_string()),
            body: None,
            chunk: None,
        }
    }

    /// Receive the next complete response envelope, or None once the
    /// server closed the tunnel.
    async fn recv_response(&mut self) -> Option<ResponseEnvelope> {
        loop {
            let ciphertext = self.from_server.recv().await?;
            let plaintext = self.cipher.decrypt(&ciphertext).expect("decrypt");
            // Every websocket message is exactly one encrypted frame.
            assert_eq!(ciphertext.len(), plaintext.len() + NOISE_TAG_LEN);
            let frame = wire::decode_frame(&plaintext).expect("frame");
            if let Some(message) = self.assembler.process(frame).expect("assembly") {
                return Some(ResponseEnvelope::decode(&message).expect("response envelope"));
            }
        }
    }

    /// Wait for the server to drop the tunnel and report its reason.
    async fn wait_close(&mut self) -> Option<CloseReason> {
        while self.from_server.recv().await.is_some() {}
        *self.closed.lock().unwrap()
    }
}

// ── Test handlers ─────────────────────────────────────────────────────────────

/// Parks until released, then answers. Used to prove request isolation.
struct SlowHandler {
    release: Arc<Notify>,
}

#[async_trait]
impl Handler for SlowHandler {
    async fn handle(
        &self,
        _request: Request,
        _streams: &StreamRegistry,
    ) -> Result<Outcome, HandlerError> {
        self.release.notified().await;
        Ok(Outcome::single(200, b"slow done".to_vec()))
    }
}

/// Collects a chunked upload and answers with the assembled bytes.
struct UploadHandler;

#[async_trait]
impl Handler for UploadHandler {
    async fn handle(
        &self,
        request: Request,
        streams: &StreamRegistry,
    ) -> Result<Outcome, HandlerError> {
        let (write_half, mut read_half) = tokio::io::duplex(256 * 1024);
        streams
            .create_stream(request.id, Box::new(write_half))
            .await
            .map_err(|e| HandlerError::bad_request(e.to_string()))?;
        if let Some(first) = request.first_chunk {
            streams
                .handle_chunk(request.id, first.data, first.seq, first.is_final)
                .await
                .map_err(|e| HandlerError::bad_request(e.to_string()))?;
        }

        let mut collected = Vec::new();
        read_half
            .read_to_end(&mut collected)
            .await
            .map_err(|e| HandlerError::Upstream(e.to_string()))?;
        Ok(Outcome::single(200, collected))
    }
}

fn default_routes() -> RouteTable {
    let mut routes = RouteTable::new();
    routes.register("GET", "/ping", Arc::new(PingHandler));
    routes.register("POST", "/echo", Arc::new(EchoHandler));
    routes.register("POST", "/upload", Arc::new(UploadHandler));
    routes
}

// ── Scenarios ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn single_frame_ping() {
    let mut client = TestClient::connect(default_routes(), live_auth()).await;

    client.send_request(&TestClient::initiating(1, "GET", "/ping"));

    let reply = client.recv_response().await.unwrap();
    assert_eq!(reply.id, 1);
    assert_eq!(reply.status, 200);
    assert_eq!(reply.body, b"PONG");
}

#[tokio::test]
async fn handshake_carries_attestation_evidence() {
    let client = TestClient::connect(default_routes(), live_auth()).await;

    assert_eq!(client.evidence["platform"], "TDX");
    assert!(client.evidence.get("manifest").is_some());
    assert!(client.evidence.get("manifestBundle").is_some());

    // The quote placeholder still follows the report_data convention.
    let report_data = BASE64
        .decode(client.evidence["attestation"].as_str().unwrap())
        .unwrap();
    assert_eq!(report_data.len(), 64);
    assert_ne!(&report_data[..32], [0u8; 32].as_slice());
}

#[tokio::test]
async fn fast_request_overtakes_slow_one() {
    let release = Arc::new(Notify::new());
    let mut routes = default_routes();
    routes.register(
        "POST",
        "/slow",
        Arc::new(SlowHandler {
            release: release.clone(),
        }),
    );
    let mut client = TestClient::connect(routes, live_auth()).await;

    client.send_request(&TestClient::initiating(1, "POST", "/slow"));
    client.send_request(&TestClient::initiating(2, "GET", "/ping"));

    let first = client.recv_response().await.unwrap();
    assert_eq!(first.id, 2, "fast handler answers while slow one is parked");

    release.notify_one();
    let second = client.recv_response().await.unwrap();
    assert_eq!(second.id, 1);
    assert_eq!(second.body, b"slow done");
}

#[tokio::test]
async fn multi_frame_message_round_trips() {
    let mut client = TestClient::connect(default_routes(), live_auth()).await;

    // An inline body large enough that both the request and the echoed
    // response must split across transport frames.
    let body: Vec<u8> = (0..80_000u32).map(|i| (i % 251) as u8).collect();
    client.send_request(&RequestEnvelope {
        id: 3,
        verb: Some("POST".into()),
        path: Some("/echo".into()),
        body: Some(body.clone()),
        chunk: None,
    });

    let reply = client.recv_response().await.unwrap();
    assert_eq!(reply.id, 3);
    assert_eq!(reply.status, 200);
    assert_eq!(reply.body, body);
}

#[tokio::test]
async fn out_of_order_upload_is_reassembled() {
    let mut client = TestClient::connect(default_routes(), live_auth()).await;

    client.send_request(&TestClient::initiating(7, "POST", "/upload"));
    client.send_chunk(7, b"part-two!", 2, true);
    client.send_chunk(7, b"part-zero", 0, false);
    client.send_chunk(7, b"part-one!", 1, false);

    let reply = client.recv_response().await.unwrap();
    assert_eq!(reply.id, 7);
    assert_eq!(reply.status, 200);
    assert_eq!(reply.body, b"part-zeropart-one!part-two!");
}

#[tokio::test]
async fn chunks_before_handler_are_replayed() {
    let mut client = TestClient::connect(default_routes(), live_auth()).await;

    // Continuations land before any handler created the stream.
    client.send_chunk(9, b"A", 0, false);
    client.send_chunk(9, b"B", 1, true);
    client.send_request(&TestClient::initiating(9, "POST", "/upload"));

    let reply = client.recv_response().await.unwrap();
    assert_eq!(reply.id, 9);
    assert_eq!(reply.body, b"AB");
}

#[tokio::test]
async fn streamed_echo_returns_body_then_terminal_envelope() {
    let mut client = TestClient::connect(default_routes(), live_auth()).await;

    client.send_request(&RequestEnvelope {
        id: 4,
        verb: Some("POST".into()),
        path: Some("/echo".into()),
        body: None,
        chunk: Some(BodyChunk {
            data: b"hello ".to_vec(),
            seq: 0,
            is_final: false,
        }),
    });
    client.send_chunk(4, b"stream", 1, true);

    let mut collected = Vec::new();
    let mut envelopes = 0;
    loop {
        let reply = client.recv_response().await.unwrap();
        assert_eq!(reply.id, 4);
        assert_eq!(reply.status, 200);
        if envelopes == 0 {
            assert!(reply.headers.is_some(), "headers ride the first envelope");
        } else {
            assert!(reply.headers.is_none());
        }
        envelopes += 1;
        if reply.body.is_empty() {
            break;
        }
        collected.extend_from_slice(&reply.body);
    }
    assert_eq!(collected, b"hello stream");
}

#[tokio::test]
async fn expired_token_without_subscription_answers_402() {
    let expired = AuthSnapshot {
        subscribed: false,
        token_expiry: Some(SystemTime::now() - Duration::from_secs(60)),
    };
    let mut client = TestClient::connect(default_routes(), expired).await;

    client.send_request(&TestClient::initiating(1, "GET", "/ping"));
    let reply = client.recv_response().await.unwrap();
    assert_eq!(reply.id, 1);
    assert_eq!(reply.status, 402);
}

#[tokio::test]
async fn subscribed_session_survives_expiry() {
    let subscribed = AuthSnapshot {
        subscribed: true,
        token_expiry: Some(SystemTime::now() - Duration::from_secs(60)),
    };
    let mut client = TestClient::connect(default_routes(), subscribed).await;

    client.send_request(&TestClient::initiating(1, "GET", "/ping"));
    let reply = client.recv_response().await.unwrap();
    assert_eq!(reply.status, 200);
    assert_eq!(reply.body, b"PONG");
}

#[tokio::test]
async fn unknown_route_answers_404_and_session_survives() {
    let mut client = TestClient::connect(default_routes(), live_auth()).await;

    client.send_request(&TestClient::initiating(1, "GET", "/nowhere"));
    let reply = client.recv_response().await.unwrap();
    assert_eq!(reply.status, 404);

    // Same tunnel still works.
    client.send_request(&TestClient::initiating(2, "GET", "/ping"));
    assert_eq!(client.recv_response().await.unwrap().status, 200);
}

#[tokio::test]
async fn malformed_envelope_closes_the_session() {
    let mut client = TestClient::connect(default_routes(), live_auth()).await;

    client.send_message(b"this is not an envelope");

    assert_eq!(client.wait_close().await, Some(CloseReason::CannotAccept));
}

#[tokio::test]
async fn undecryptable_frame_closes_the_session() {
    let mut client = TestClient::connect(default_routes(), live_auth()).await;

    client.to_server.send(vec![0u8; 64]).unwrap();

    assert_eq!(
        client.wait_close().await,
        Some(CloseReason::UnexpectedCondition)
    );
}

#[tokio::test]
async fn oversize_handshake_frame_aborts_the_session() {
    let (to_server, mut from_server, closed) = spawn_session(default_routes(), live_auth());

    to_server.send(vec![0u8; 5000]).unwrap();

    while from_server.recv().await.is_some() {}
    assert_eq!(*closed.lock().unwrap(), Some(CloseReason::CannotAccept));
}

#[tokio::test]
async fn client_disconnect_cancels_inflight_requests() {
    let release = Arc::new(Notify::new());
    let mut routes = default_routes();
    routes.register(
        "POST",
        "/slow",
        Arc::new(SlowHandler {
            release: release.clone(),
        }),
    );
    let mut client = TestClient::connect(routes, live_auth()).await;

    client.send_request(&TestClient::initiating(1, "POST", "/slow"));
    // Also leave an upload stream open.
    client.send_request(&TestClient::initiating(2, "POST", "/upload"));
    client.send_chunk(2, b"never finished", 0, false);

    // Hang up without completing anything.
    let TestClient {
        to_server,
        mut from_server,
        closed,
        ..
    } = client;
    drop(to_server);

    while from_server.recv().await.is_some() {}
    assert_eq!(*closed.lock().unwrap(), Some(CloseReason::Normal));
    // The parked handler was aborted; releasing it now is a no-op and
    // nothing panics during teardown.
    release.notify_one();
}
