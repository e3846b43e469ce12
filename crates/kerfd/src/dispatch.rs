//! Router & dispatcher — classifies decoded envelopes and fans
//! initiating requests out to isolated handler tasks.
//!
//! The concurrency invariant lives here: every initiating request gets
//! its own task, and the dispatcher returns to the socket as soon as
//! the task is spawned. A slow handler can never block newer requests
//! on the same session. Nothing a handler task does reaches the
//! inbound reader; errors become envelopes on the request's own id.

use std::sync::Arc;
use std::time::SystemTime;

use tokio::sync::mpsc;
use tokio::task::JoinSet;

use kerf_core::auth::AuthSnapshot;
use kerf_core::envelope::{RequestEnvelope, RequestShape, ResponseEnvelope};

use crate::handler::{Handler, HandlerError, Outcome, Request, RouteTable};
use crate::respond::ResponseSink;
use crate::stream::StreamRegistry;

pub struct Dispatcher {
    routes: Arc<RouteTable>,
    registry: Arc<StreamRegistry>,
    auth: AuthSnapshot,
    outbound: mpsc::UnboundedSender<ResponseEnvelope>,
    tasks: JoinSet<()>,
}

impl Dispatcher {
    pub fn new(
        routes: Arc<RouteTable>,
        registry: Arc<StreamRegistry>,
        auth: AuthSnapshot,
        outbound: mpsc::UnboundedSender<ResponseEnvelope>,
    ) -> Self {
        Self {
            routes,
            registry,
            auth,
            outbound,
            tasks: JoinSet::new(),
        }
    }

    /// Route one decoded, shape-checked envelope.
    pub async fn dispatch(&mut self, envelope: RequestEnvelope) {
        match envelope.classify() {
            Ok(RequestShape::Continuation) => self.handle_continuation(envelope).await,
            Ok(RequestShape::Initiating) => self.handle_initiating(envelope),
            // The reader already rejected malformed shapes; nothing to do.
            Err(_) => {}
        }
    }

    async fn handle_continuation(&self, envelope: RequestEnvelope) {
        let id = envelope.id;
        let Some(chunk) = envelope.chunk else { return };

        if let Err(e) = self
            .registry
            .handle_chunk(id, chunk.data, chunk.seq, chunk.is_final)
            .await
        {
            tracing::warn!(request_id = id, error = %e, "upload chunk rejected");
            self.registry.cancel_stream(id).await;
            self.send(ResponseEnvelope::error(id, 400, &e.to_string()));
        }
    }

    fn handle_initiating(&mut self, envelope: RequestEnvelope) {
        let id = envelope.id;

        if !self.auth.allows_request(SystemTime::now()) {
            tracing::debug!(request_id = id, "request refused: token expired");
            self.send(ResponseEnvelope::error(id, 402, "subscription or live token required"));
            return;
        }

        let (Some(verb), Some(path)) = (envelope.verb, envelope.path) else {
            return;
        };

        let Some(handler) = self.routes.lookup(&verb, &path) else {
            tracing::debug!(request_id = id, verb, path, "no route");
            self.send(ResponseEnvelope::error(
                id,
                404,
                &format!("no route for {verb} {path}"),
            ));
            return;
        };

        let request = Request {
            id,
            verb,
            path,
            body: envelope.body,
            first_chunk: envelope.chunk,
        };
        let registry = self.registry.clone();
        let outbound = self.outbound.clone();

        self.tasks.spawn(async move {
            run_request(handler, request, registry, outbound).await;
        });
    }

    fn send(&self, envelope: ResponseEnvelope) {
        // A send failure means the connection is tearing down.
        let _ = self.outbound.send(envelope);
    }

    /// Abort every in-flight handler task and wait for them to stop.
    pub async fn shutdown(&mut self) {
        self.tasks.shutdown().await;
    }

    #[cfg(test)]
    pub(crate) fn in_flight(&self) -> usize {
        self.tasks.len()
    }
}

/// Body of one handler task: invoke the handler and translate its
/// outcome into envelopes.
async fn run_request(
    handler: Arc<dyn Handler>,
    request: Request,
    registry: Arc<StreamRegistry>,
    outbound: mpsc::UnboundedSender<ResponseEnvelope>,
) {
    let id = request.id;
    let verb = request.verb.clone();
    let path = request.path.clone();

    match handler.handle(request, &registry).await {
        Ok(Outcome::Single { status, body }) => {
            let _ = outbound.send(ResponseEnvelope {
                id,
                status,
                body,
                headers: None,
            });
        }
        Ok(Outcome::Streaming { headers, writer }) => {
            let (sink, shared) = ResponseSink::new(id, headers, outbound.clone());
            match writer(sink).await {
                Ok(()) => {
                    // Zero-length terminal envelope; if the writer never
                    // produced a body envelope, this one carries headers.
                    let _ = outbound.send(ResponseEnvelope {
                        id,
                        status: 200,
                        body: Vec::new(),
                        headers: shared.take_headers(),
                    });
                }
                Err(e) => {
                    let status = e.status(shared.body_started());
                    log_handler_error(id, &verb, &path, &e);
                    registry.cancel_stream(id).await;
                    let _ = outbound.send(ResponseEnvelope::error(id, status, &e.public_message()));
                }
            }
        }
        Err(e) => {
            log_handler_error(id, &verb, &path, &e);
            registry.cancel_stream(id).await;
            let _ = outbound.send(ResponseEnvelope::error(id, e.status(false), &e.public_message()));
        }
    }
}

fn log_handler_error(id: u64, verb: &str, path: &str, error: &HandlerError) {
    match error {
        HandlerError::Request { status, message } => {
            tracing::debug!(request_id = id, verb, path, status, message, "request error");
        }
        HandlerError::Upstream(detail) => {
            tracing::warn!(request_id = id, verb, path, detail, "upstream failure");
        }
        HandlerError::Internal(detail) => {
            tracing::error!(request_id = id, verb, path, error = %detail, "handler panic-equivalent");
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
