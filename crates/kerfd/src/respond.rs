//! Response writer — adapts a streaming handler's byte writes into a
//! sequence of 200 envelopes sharing one request id.
//!
//! The sink is synchronous and never blocks on peer consumption: it
//! feeds the connection's outbound queue, and backpressure (such as it
//! is) lives in the serialized encrypt-and-send path behind that queue.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

use kerf_core::envelope::ResponseEnvelope;

/// State shared between the sink (held by the handler's writer) and
/// the dispatcher task that emits the terminal envelope.
pub struct SinkShared {
    headers: Mutex<Option<BTreeMap<String, String>>>,
    wrote: AtomicBool,
}

impl SinkShared {
    /// Headers for the next envelope, if no envelope has claimed them
    /// yet. Only the first envelope of a stream carries headers.
    pub fn take_headers(&self) -> Option<BTreeMap<String, String>> {
        self.headers.lock().expect("sink state poisoned").take()
    }

    /// Whether any body envelope has been emitted.
    pub fn body_started(&self) -> bool {
        self.wrote.load(Ordering::Acquire)
    }
}

/// One write call = one outbound 200 envelope with the request id.
pub struct ResponseSink {
    id: u64,
    outbound: mpsc::UnboundedSender<ResponseEnvelope>,
    shared: Arc<SinkShared>,
}

impl ResponseSink {
    pub fn new(
        id: u64,
        headers: BTreeMap<String, String>,
        outbound: mpsc::UnboundedSender<ResponseEnvelope>,
    ) -> (Self, Arc<SinkShared>) {
        let shared = Arc::new(SinkShared {
            headers: Mutex::new(Some(headers)),
            wrote: AtomicBool::new(false),
        });
        (
            Self {
                id,
                outbound,
                shared: shared.clone(),
            },
            shared,
        )
    }

    /// Emit one body envelope. Fails only when the connection is gone.
    pub fn write(&mut self, data: &[u8]) -> Result<(), SinkClosed> {
        let headers = self.shared.take_headers();
        self.shared.wrote.store(true, Ordering::Release);
        self.outbound
            .send(ResponseEnvelope {
                id: self.id,
                status: 200,
                body: data.to_vec(),
                headers,
            })
            .map_err(|_| SinkClosed)
    }

    pub fn id(&self) -> u64 {
        self.id
    }
}

/// The connection closed underneath the writer.
#[derive(Debug, thiserror::Error)]
#[error("response channel closed")]
pub struct SinkClosed;
