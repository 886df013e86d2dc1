//! `pdfserve` binary.
//!
//! ```bash
//! pdfserve 5000
//! PDFSERVE_MAX_WORKERS=4 pdfserve --work-dir /var/tmp/pdfserve 5000
//! ```
//!
//! Without a port argument the server asks for one on stdin.

use std::io;

use clap::Parser;
use pdfserve::config::{CliArgs, ServerConfig, prompt_port};
use pdfserve::logging::init_tracing;
use pdfserve::server::{serve, spawn_signal_handler};
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mut args = CliArgs::parse();
    init_tracing();

    if args.port.is_none() {
        let stdin = io::stdin();
        args.port = Some(prompt_port(stdin.lock(), io::stdout(), args.port_range())?);
    }
    let config = ServerConfig::try_from(args)?;

    let shutdown = CancellationToken::new();
    let signals = spawn_signal_handler(shutdown.clone());

    let state = serve(config, shutdown.clone()).await?;
    shutdown.cancel();
    let _ = signals.await;

    tracing::info!(
        spawned = state.spawned,
        succeeded = state.succeeded,
        failed = state.failed,
        crashed = state.crashed,
        rejected = state.rejected,
        "pdfserve exited"
    );
    Ok(())
}
