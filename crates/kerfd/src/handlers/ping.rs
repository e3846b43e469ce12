//! Liveness probe over the tunnel.

use async_trait::async_trait;

use crate::handler::{Handler, HandlerError, Outcome, Request};
use crate::stream::StreamRegistry;

pub struct PingHandler;

#[async_trait]
impl Handler for PingHandler {
    async fn handle(
        &self,
        _request: Request,
        _streams: &StreamRegistry,
    ) -> Result<Outcome, HandlerError> {
        Ok(Outcome::single(200, b"PONG".to_vec()))
    }
}
