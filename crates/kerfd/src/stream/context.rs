//! One in-flight upload: an ordered, bounded write path into a sink.

use std::collections::BTreeMap;

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

use super::{StreamError, StreamLimits};

/// The write end a handler installs for its upload — typically the
/// write half of a pipe feeding an upstream client.
pub type ChunkSink = Box<dyn AsyncWrite + Send + Unpin>;

struct BufferedChunk {
    data: Vec<u8>,
    is_final: bool,
}

struct Inner {
    sink: Option<ChunkSink>,
    next_expected_seq: u32,
    /// Chunks that arrived ahead of `next_expected_seq`, keyed by seq.
    reordered: BTreeMap<u32, BufferedChunk>,
    total_bytes: u64,
    completed: bool,
}

/// Ordered write path for one request id. All mutation happens under
/// the internal lock, so concurrent writers are serialized.
pub struct StreamContext {
    id: u64,
    limits: StreamLimits,
    inner: Mutex<Inner>,
}

impl std::fmt::Debug for StreamContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamContext")
            .field("id", &self.id)
            .field("limits", &self.limits)
            .finish()
    }
}

impl StreamContext {
    pub(crate) fn new(id: u64, sink: ChunkSink, limits: StreamLimits) -> Self {
        Self {
            id,
            limits,
            inner: Mutex::new(Inner {
                sink: Some(sink),
                next_expected_seq: 0,
                reordered: BTreeMap::new(),
                total_bytes: 0,
                completed: false,
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Apply one chunk.
    ///
    /// Chunks ahead of the expected seq are buffered (bounded); chunks
    /// behind it are duplicates from a client retry and ignored; the
    /// expected chunk is written through, then any now-contiguous
    /// buffered chunks follow under the same rules.
    pub async fn write(&self, data: &[u8], seq: u32, is_final: bool) -> Result<(), StreamError> {
        let mut inner = self.inner.lock().await;

        if inner.completed {
            return Err(StreamError::StreamClosed);
        }

        if seq > inner.next_expected_seq {
            if !inner.reordered.contains_key(&seq)
                && inner.reordered.len() >= self.limits.max_out_of_order
            {
                return Err(StreamError::TooManyOutOfOrder);
            }
            inner.reordered.insert(
                seq,
                BufferedChunk {
                    data: data.to_vec(),
                    is_final,
                },
            );
            return Ok(());
        }

        if seq < inner.next_expected_seq {
            tracing::trace!(request_id = self.id, seq, "duplicate chunk ignored");
            return Ok(());
        }

        self.write_through(&mut inner, data, is_final).await?;

        // Drain chunks made contiguous by this write.
        while !inner.completed {
            let next = inner.next_expected_seq;
            let Some(chunk) = inner.reordered.remove(&next) else {
                break;
            };
            self.write_through(&mut inner, &chunk.data, chunk.is_final)
                .await?;
        }

        Ok(())
    }

    /// Write one in-order chunk to the sink and advance the stream.
    async fn write_through(
        &self,
        inner: &mut Inner,
        data: &[u8],
        is_final: bool,
    ) -> Result<(), StreamError> {
        {
            let sink = inner.sink.as_mut().ok_or(StreamError::StreamClosed)?;
            sink.write_all(data)
                .await
                .map_err(|e| StreamError::Sink(e.to_string()))?;
        }

        inner.next_expected_seq += 1;
        inner.total_bytes += data.len() as u64;
        if inner.total_bytes > self.limits.max_stream_bytes {
            return Err(StreamError::StreamTooLarge(self.limits.max_stream_bytes));
        }

        if is_final {
            inner.completed = true;
            inner.reordered.clear();
            if let Some(mut sink) = inner.sink.take() {
                let _ = sink.shutdown().await;
            }
            tracing::debug!(
                request_id = self.id,
                bytes = inner.total_bytes,
                "upload stream completed"
            );
        }

        Ok(())
    }

    /// Abandon the stream: close the sink so downstream readers see
    /// EOF, and refuse any further writes.
    pub async fn cancel(&self) {
        let mut inner = self.inner.lock().await;
        if inner.completed {
            return;
        }
        inner.completed = true;
        inner.reordered.clear();
        if let Some(mut sink) = inner.sink.take() {
            let _ = sink.shutdown().await;
        }
        tracing::debug!(request_id = self.id, "upload stream cancelled");
    }

    pub async fn is_completed(&self) -> bool {
        self.inner.lock().await.completed
    }

    #[cfg(test)]
    pub(crate) async fn buffered(&self) -> usize {
        self.inner.lock().await.reordered.len()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
