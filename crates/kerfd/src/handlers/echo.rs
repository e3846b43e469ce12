//! Echo — streams an uploaded body straight back to the client.
//!
//! Exercises the full pipeline in both directions: chunked upload
//! through the stream registry into a pipe, then a streamed response
//! reading the pipe back out. Doubles as the reference for how a real
//! upstream adapter wires an upload into a body.

use std::collections::BTreeMap;

use async_trait::async_trait;
use tokio::io::AsyncReadExt;

use crate::handler::{Handler, HandlerError, Outcome, Request};
use crate::stream::StreamRegistry;

/// Pipe buffer between the upload side and the response side.
const PIPE_CAPACITY: usize = 64 * 1024;

pub struct EchoHandler;

#[async_trait]
impl Handler for EchoHandler {
    async fn handle(
        &self,
        request: Request,
        streams: &StreamRegistry,
    ) -> Result<Outcome, HandlerError> {
        let Some(first) = request.first_chunk else {
            // Plain request: echo the inline body in one envelope.
            return Ok(Outcome::single(200, request.body.unwrap_or_default()));
        };

        // Streaming upload: install the write end of a pipe, feed the
        // first chunk through the registry so ordering and replay rules
        // apply, then stream the read end back.
        let (write_half, mut read_half) = tokio::io::duplex(PIPE_CAPACITY);
        streams
            .create_stream(request.id, Box::new(write_half))
            .await
            .map_err(|e| HandlerError::bad_request(e.to_string()))?;
        streams
            .handle_chunk(request.id, first.data, first.seq, first.is_final)
            .await
            .map_err(|e| HandlerError::bad_request(e.to_string()))?;

        let headers = BTreeMap::from([(
            "content-type".to_string(),
            "application/octet-stream".to_string(),
        )]);

        Ok(Outcome::streaming(headers, move |mut sink| {
            Box::pin(async move {
                let mut buffer = vec![0u8; 16 * 1024];
                loop {
                    let n = read_half
                        .read(&mut buffer)
                        .await
                        .map_err(|e| HandlerError::Upstream(e.to_string()))?;
                    if n == 0 {
                        break;
                    }
                    sink.write(&buffer[..n])
                        .map_err(|_| HandlerError::Upstream("client gone".into()))?;
                }
                Ok(())
            })
        }))
    }
}
