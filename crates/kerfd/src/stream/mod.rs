//! Upload stream plumbing: per-request ordered write paths into
//! handler-installed sinks, with bounded buffering for chunks that
//! arrive before the handler has a sink ready.

mod context;
mod registry;

pub use context::{ChunkSink, StreamContext};
pub use registry::StreamRegistry;

use kerf_core::config::LimitsConfig;

/// Bounds on stream-registry memory. Two independent out-of-order
/// knobs: `max_pending_chunks_per_id` guards chunks buffered before a
/// sink exists, `max_out_of_order` guards reordering inside an active
/// stream.
#[derive(Debug, Clone, Copy)]
pub struct StreamLimits {
    pub max_active_streams: usize,
    pub max_pending_ids: usize,
    pub max_pending_chunks_per_id: usize,
    pub max_out_of_order: usize,
    pub max_stream_bytes: u64,
}

impl Default for StreamLimits {
    fn default() -> Self {
        LimitsConfig::default().into()
    }
}

impl From<LimitsConfig> for StreamLimits {
    fn from(config: LimitsConfig) -> Self {
        Self {
            max_active_streams: config.max_active_streams,
            max_pending_ids: config.max_pending_ids,
            max_pending_chunks_per_id: config.max_pending_chunks_per_id,
            max_out_of_order: config.max_out_of_order,
            max_stream_bytes: config.max_stream_bytes,
        }
    }
}

/// A chunk held for a request id that has no sink yet.
#[derive(Debug)]
pub(crate) struct PendingChunk {
    pub data: Vec<u8>,
    pub seq: u32,
    pub is_final: bool,
}

/// Stream-local failures. These cancel the one stream they name; the
/// rest of the session is untouched.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("too many active upload streams")]
    TooManyActiveStreams,

    #[error("too many buffered chunks for request {0}")]
    TooManyPendingChunks(u64),

    #[error("upload stream already completed")]
    StreamClosed,

    #[error("too many out-of-order chunks")]
    TooManyOutOfOrder,

    #[error("upload exceeds {0} bytes")]
    StreamTooLarge(u64),

    #[error("upload sink failed: {0}")]
    Sink(String),
}
