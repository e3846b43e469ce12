//! Per-connection registry of upload streams.
//!
//! Two maps: active streams (handler installed a sink) and pending
//! queues (chunks that arrived first). Buffering early chunks at the
//! registry removes the race between handler setup and the network —
//! continuation envelopes can beat `create_stream` and still land.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use tokio::sync::Mutex;

use super::{ChunkSink, PendingChunk, StreamContext, StreamError, StreamLimits};

#[derive(Default)]
struct Inner {
    active: HashMap<u64, Arc<StreamContext>>,
    pending: HashMap<u64, VecDeque<PendingChunk>>,
    /// Pending ids in insertion order; front is evicted first.
    pending_order: VecDeque<u64>,
}

/// Per-connection stream registry. The connection owns it; handlers
/// borrow it to install sinks for their own request ids.
pub struct StreamRegistry {
    limits: StreamLimits,
    inner: Mutex<Inner>,
}

impl StreamRegistry {
    pub fn new(limits: StreamLimits) -> Self {
        Self {
            limits,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Install a sink for `id` and replay any chunks that arrived
    /// before the handler got here, in their registered order.
    pub async fn create_stream(
        &self,
        id: u64,
        sink: ChunkSink,
    ) -> Result<Arc<StreamContext>, StreamError> {
        let (context, replay) = {
            let mut inner = self.inner.lock().await;
            if inner.active.len() >= self.limits.max_active_streams {
                return Err(StreamError::TooManyActiveStreams);
            }
            let context = Arc::new(StreamContext::new(id, sink, self.limits));
            inner.active.insert(id, context.clone());
            let replay = inner.pending.remove(&id).unwrap_or_default();
            inner.pending_order.retain(|&pending_id| pending_id != id);
            (context, replay)
        };

        for chunk in replay {
            context.write(&chunk.data, chunk.seq, chunk.is_final).await?;
        }
        if context.is_completed().await {
            self.inner.lock().await.active.remove(&id);
        }

        Ok(context)
    }

    /// Route one continuation chunk: forward to the active stream, or
    /// buffer it until a handler installs a sink.
    pub async fn handle_chunk(
        &self,
        id: u64,
        data: Vec<u8>,
        seq: u32,
        is_final: bool,
    ) -> Result<(), StreamError> {
        let context = { self.inner.lock().await.active.get(&id).cloned() };

        if let Some(context) = context {
            context.write(&data, seq, is_final).await?;
            if context.is_completed().await {
                self.inner.lock().await.active.remove(&id);
            }
            return Ok(());
        }

        let mut inner = self.inner.lock().await;
        if let Some(queue) = inner.pending.get_mut(&id) {
            if queue.len() >= self.limits.max_pending_chunks_per_id {
                inner.pending.remove(&id);
                inner.pending_order.retain(|&pending_id| pending_id != id);
                return Err(StreamError::TooManyPendingChunks(id));
            }
            queue.push_back(PendingChunk { data, seq, is_final });
        } else {
            if inner.pending.len() >= self.limits.max_pending_ids {
                if let Some(oldest) = inner.pending_order.pop_front() {
                    inner.pending.remove(&oldest);
                    tracing::warn!(
                        request_id = oldest,
                        "evicted pending upload chunks (id cap reached)"
                    );
                }
            }
            inner
                .pending
                .insert(id, VecDeque::from([PendingChunk { data, seq, is_final }]));
            inner.pending_order.push_back(id);
        }
        Ok(())
    }

    /// Drop one stream from both maps and cancel its context.
    pub async fn cancel_stream(&self, id: u64) {
        let context = {
            let mut inner = self.inner.lock().await;
            inner.pending.remove(&id);
            inner.pending_order.retain(|&pending_id| pending_id != id);
            inner.active.remove(&id)
        };
        if let Some(context) = context {
            context.cancel().await;
        }
    }

    /// Drop everything. Called when the connection closes; every
    /// context still held is cancelled so downstream readers see EOF.
    pub async fn cancel_all(&self) {
        let contexts: Vec<_> = {
            let mut inner = self.inner.lock().await;
            inner.pending.clear();
            inner.pending_order.clear();
            inner.active.drain().map(|(_, context)| context).collect()
        };
        for context in contexts {
            context.cancel().await;
        }
    }

    pub async fn active_count(&self) -> usize {
        self.inner.lock().await.active.len()
    }

    pub async fn has_active(&self, id: u64) -> bool {
        self.inner.lock().await.active.contains_key(&id)
    }

    pub async fn pending_ids(&self) -> Vec<u64> {
        self.inner.lock().await.pending_order.iter().copied().collect()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    fn limits() -> StreamLimits {
        StreamLimits {
            max_active_streams: 2,
            max_pending_ids: 3,
            max_pending_chunks_per_id: 4,
            max_out_of_order: 64,
            max_stream_bytes: 1024,
        }
    }

    fn pipe() -> (ChunkSink, tokio::task::JoinHandle<Vec<u8>>) {
        let (write_half, mut read_half) = tokio::io::duplex(64 * 1024);
        let reader = tokio::spawn(async move {
            let mut collected = Vec::new();
            read_half.read_to_end(&mut collected).await.unwrap();
            collected
        });
        (Box::new(write_half), reader)
    }

    #[tokio::test]
    async fn chunks_before_create_are_replayed_in_order() {
        let registry = StreamRegistry::new(limits());
        registry.handle_chunk(9, b"A".to_vec(), 0, false).await.unwrap();
        registry.handle_chunk(9, b"B".to_vec(), 1, true).await.unwrap();

        let (sink, reader) = pipe();
        registry.create_stream(9, sink).await.unwrap();

        // Final chunk replayed, so the stream is gone from the active map.
        assert!(!registry.has_active(9).await);
        assert_eq!(reader.await.unwrap(), b"AB");
    }

    #[tokio::test]
    async fn live_stream_receives_chunks_directly() {
        let registry = StreamRegistry::new(limits());
        let (sink, reader) = pipe();
        registry.create_stream(5, sink).await.unwrap();
        assert!(registry.has_active(5).await);

        registry.handle_chunk(5, b"one".to_vec(), 0, false).await.unwrap();
        registry.handle_chunk(5, b"two".to_vec(), 1, true).await.unwrap();

        assert!(!registry.has_active(5).await);
        assert_eq!(reader.await.unwrap(), b"onetwo");
    }

    #[tokio::test]
    async fn active_stream_cap_is_enforced() {
        let registry = StreamRegistry::new(limits());
        let (sink_a, _ra) = pipe();
        let (sink_b, _rb) = pipe();
        let (sink_c, _rc) = pipe();
        registry.create_stream(1, sink_a).await.unwrap();
        registry.create_stream(2, sink_b).await.unwrap();
        assert!(matches!(
            registry.create_stream(3, sink_c).await.unwrap_err(),
            StreamError::TooManyActiveStreams
        ));
    }

    #[tokio::test]
    async fn pending_chunk_cap_drops_the_whole_queue() {
        let registry = StreamRegistry::new(limits());
        // Cap is 4 chunks per id; the 5th drops the queue.
        for seq in 0..4u32 {
            registry.handle_chunk(7, vec![seq as u8], seq, false).await.unwrap();
        }
        assert!(matches!(
            registry.handle_chunk(7, b"x".to_vec(), 4, false).await.unwrap_err(),
            StreamError::TooManyPendingChunks(7)
        ));
        assert!(registry.pending_ids().await.is_empty());
    }

    #[tokio::test]
    async fn pending_id_cap_evicts_least_recently_inserted() {
        let registry = StreamRegistry::new(limits());
        // Cap is 3 ids; inserting a 4th evicts the oldest (id 10).
        for id in [10u64, 11, 12] {
            registry.handle_chunk(id, b"x".to_vec(), 0, false).await.unwrap();
        }
        registry.handle_chunk(13, b"x".to_vec(), 0, false).await.unwrap();
        assert_eq!(registry.pending_ids().await, vec![11, 12, 13]);

        // The evicted id starts a fresh queue if it comes back.
        registry.handle_chunk(10, b"again".to_vec(), 0, false).await.unwrap();
        assert_eq!(registry.pending_ids().await, vec![12, 13, 10]);
    }

    #[tokio::test]
    async fn cancel_stream_clears_both_maps() {
        let registry = StreamRegistry::new(limits());
        let (sink, reader) = pipe();
        let context = registry.create_stream(1, sink).await.unwrap();
        registry.handle_chunk(2, b"early".to_vec(), 0, false).await.unwrap();

        registry.cancel_stream(1).await;
        registry.cancel_stream(2).await;

        assert!(!registry.has_active(1).await);
        assert!(registry.pending_ids().await.is_empty());
        assert!(context.is_completed().await);
        // Sink closed: reader saw EOF with nothing written.
        assert_eq!(reader.await.unwrap(), b"");
    }

    #[tokio::test]
    async fn cancel_all_cancels_every_live_context() {
        let registry = StreamRegistry::new(limits());
        let (sink_a, reader_a) = pipe();
        let (sink_b, reader_b) = pipe();
        let ctx_a = registry.create_stream(1, sink_a).await.unwrap();
        let ctx_b = registry.create_stream(2, sink_b).await.unwrap();
        registry.handle_chunk(3, b"early".to_vec(), 0, false).await.unwrap();

        registry.cancel_all().await;

        assert_eq!(registry.active_count().await, 0);
        assert!(registry.pending_ids().await.is_empty());
        assert!(ctx_a.is_completed().await);
        assert!(ctx_b.is_completed().await);
        reader_a.await.unwrap();
        reader_b.await.unwrap();
    }

    #[tokio::test]
    async fn replay_failure_surfaces_to_the_creator() {
        let registry = StreamRegistry::new(StreamLimits {
            max_stream_bytes: 2,
            ..limits()
        });
        registry.handle_chunk(4, b"toolarge".to_vec(), 0, false).await.unwrap();
        let (sink, _reader) = pipe();
        assert!(matches!(
            registry.create_stream(4, sink).await.unwrap_err(),
            StreamError::StreamTooLarge(2)
        ));
    }
}
