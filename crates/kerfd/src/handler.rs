//! Handler contract — the shape every upstream adapter implements.
//!
//! The tunnel core depends on this shape but never on handler bodies.
//! Handlers run on their own task, may block on upstream I/O, and must
//! never touch the socket: single results and streaming writers both
//! go back through the dispatcher.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;

use kerf_core::envelope::BodyChunk;

use crate::respond::ResponseSink;
use crate::stream::StreamRegistry;

/// A decoded initiating request, handed to exactly one handler.
#[derive(Debug)]
pub struct Request {
    pub id: u64,
    pub verb: String,
    pub path: String,
    pub body: Option<Vec<u8>>,
    /// Present when the request is a streaming upload. The handler
    /// should install a sink via the registry, then feed this chunk
    /// through `handle_chunk` so ordering rules apply uniformly.
    pub first_chunk: Option<BodyChunk>,
}

/// The body-producing half of a streaming outcome. The dispatcher
/// hands it the sink; every `write` becomes one response envelope.
pub type StreamingBody =
    Box<dyn FnOnce(ResponseSink) -> BoxFuture<'static, Result<(), HandlerError>> + Send>;

/// What a handler produced.
pub enum Outcome {
    /// One response envelope, done.
    Single { status: u16, body: Vec<u8> },
    /// A streamed body: headers ride the first envelope, a zero-length
    /// envelope marks the end.
    Streaming {
        headers: BTreeMap<String, String>,
        writer: StreamingBody,
    },
}

impl Outcome {
    pub fn single(status: u16, body: Vec<u8>) -> Self {
        Self::Single { status, body }
    }

    pub fn streaming<F>(headers: BTreeMap<String, String>, writer: F) -> Self
    where
        F: FnOnce(ResponseSink) -> BoxFuture<'static, Result<(), HandlerError>> + Send + 'static,
    {
        Self::Streaming {
            headers,
            writer: Box::new(writer),
        }
    }
}

/// Handler failures, translated to error envelopes by the dispatcher.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    /// A request-level problem the client can act on. `status` must be
    /// in the 4xx range; the message is sent back verbatim.
    #[error("{message}")]
    Request { status: u16, message: String },

    /// The upstream service failed. Reported as 502 before any body
    /// bytes went out, 500 after.
    #[error("upstream failure: {0}")]
    Upstream(String),

    /// Anything else. Logged in full, reported as a generic 500.
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl HandlerError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::Request {
            status: 400,
            message: message.into(),
        }
    }

    /// Status for the error envelope. `body_started` is whether any
    /// 200 body envelope already went out for this id.
    pub fn status(&self, body_started: bool) -> u16 {
        match self {
            Self::Request { status, .. } => *status,
            Self::Upstream(_) => {
                if body_started {
                    500
                } else {
                    502
                }
            }
            Self::Internal(_) => 500,
        }
    }

    /// Message safe to show the client.
    pub fn public_message(&self) -> String {
        match self {
            Self::Request { message, .. } => message.clone(),
            Self::Upstream(_) => "upstream failure".to_string(),
            Self::Internal(_) => "internal error".to_string(),
        }
    }
}

/// The uniform contract the dispatcher invokes.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(
        &self,
        request: Request,
        streams: &StreamRegistry,
    ) -> Result<Outcome, HandlerError>;
}

// ── Route table ───────────────────────────────────────────────────────────────

/// Exact-match route key. No path parameters, no prefixes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Route {
    pub verb: String,
    pub path: String,
}

/// Immutable (verb, path) → handler mapping, installed at startup and
/// shared read-only by every connection.
#[derive(Default)]
pub struct RouteTable {
    routes: HashMap<Route, Arc<dyn Handler>>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, verb: &str, path: &str, handler: Arc<dyn Handler>) {
        self.routes.insert(
            Route {
                verb: verb.to_string(),
                path: path.to_string(),
            },
            handler,
        );
    }

    pub fn lookup(&self, verb: &str, path: &str) -> Option<Arc<dyn Handler>> {
        self.routes
            .get(&Route {
                verb: verb.to_string(),
                path: path.to_string(),
            })
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}
