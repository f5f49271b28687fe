//! bearingpro - bearing selection tool server.
//!
//! Speaks the framed JSON-RPC protocol on stdin/stdout. Standard output
//! carries protocol frames only; logs are written to stderr, where the host
//! collects them as diagnostics.

use anyhow::{Context, Result};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use toolhost::ipc::serve_stdio;
use toolhost::tools;

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "toolhost=info,bearingpro=info".into()),
        ))
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_ansi(false)
                .with_writer(std::io::stderr),
        )
        .init();

    let handlers = tools::handler_table()?;
    tracing::info!(
        "bearingpro v{} serving {} methods",
        env!("CARGO_PKG_VERSION"),
        handlers.len()
    );

    serve_stdio(handlers).context("bearingpro transport failed")
}
