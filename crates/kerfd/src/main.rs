//! kerfd — the Kerf gateway daemon.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{bail, Context, Result};

use kerf_core::config::KerfConfig;
use kerfd::attest::DevAttestationProvider;
use kerfd::handler::RouteTable;
use kerfd::handlers::{EchoHandler, PingHandler};
use kerfd::server::{self, GatewayState};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialise tracing — RUST_LOG controls verbosity
    // e.g. RUST_LOG=debug cargo run -p kerfd
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = KerfConfig::load().context("failed to load configuration")?;
    if config.auth.shared_secret.is_empty() {
        bail!("auth.shared_secret must be set (config file or KERF_AUTH__SHARED_SECRET)");
    }

    let addr: SocketAddr = config
        .network
        .bind_addr
        .parse()
        .with_context(|| format!("invalid bind_addr {:?}", config.network.bind_addr))?;

    // TODO: load a TDX/SEV-SNP provider when running inside a TEE;
    // only the dev provider exists so far.
    let attest = Arc::new(DevAttestationProvider::new());

    let mut routes = RouteTable::new();
    routes.register("GET", "/ping", Arc::new(PingHandler));
    routes.register("POST", "/echo", Arc::new(EchoHandler));

    let state = GatewayState {
        attest,
        routes: Arc::new(routes),
        limits: config.limits.clone().into(),
        token_secret: Arc::new(config.auth.shared_secret.into_bytes()),
    };

    server::serve(addr, state).await
}
