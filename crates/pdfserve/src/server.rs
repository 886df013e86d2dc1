//! Server lifecycle: bind, run the supervisor, shut down.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpSocket, lookup_host};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::ServerConfig;
use crate::supervisor::{ServerState, Supervisor};

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("could not resolve {addr}: {source}")]
    Resolve { addr: String, source: io::Error },

    #[error("could not bind to {addr}: {source}")]
    Bind { addr: String, source: io::Error },
}

/// Bind the listening socket. Failure here is fatal to the server.
pub async fn bind(host: &str, port: u16, backlog: u32) -> Result<TcpListener, ServerError> {
    let addr = format!("{host}:{port}");
    let resolved: SocketAddr = lookup_host(&addr)
        .await
        .map_err(|source| ServerError::Resolve {
            addr: addr.clone(),
            source,
        })?
        .next()
        .ok_or_else(|| ServerError::Resolve {
            addr: addr.clone(),
            source: io::Error::new(io::ErrorKind::NotFound, "no addresses"),
        })?;

    let bind_err = |source| ServerError::Bind {
        addr: addr.clone(),
        source,
    };
    let socket = match resolved {
        SocketAddr::V4(_) => TcpSocket::new_v4(),
        SocketAddr::V6(_) => TcpSocket::new_v6(),
    };
    let socket = socket.map_err(bind_err)?;
    socket.set_reuseaddr(true).map_err(bind_err)?;
    socket.bind(resolved).map_err(bind_err)?;
    socket.listen(backlog).map_err(bind_err)
}

/// Bind, serve until the connection bound or `shutdown`, and drain.
pub async fn serve(
    config: ServerConfig,
    shutdown: CancellationToken,
) -> Result<ServerState, ServerError> {
    let listener = bind(&config.host, config.port, config.backlog).await?;
    Ok(serve_with_listener(listener, config, shutdown).await)
}

/// Run the supervisor on an already bound listener.
pub async fn serve_with_listener(
    listener: TcpListener,
    config: ServerConfig,
    shutdown: CancellationToken,
) -> ServerState {
    if let Ok(addr) = listener.local_addr() {
        info!(
            %addr,
            version = env!("CARGO_PKG_VERSION"),
            max_workers = config.supervisor.max_workers,
            max_connections = ?config.supervisor.max_connections,
            work_dir = %config.work_dir.display(),
            "Starting pdfserve"
        );
    }

    let supervisor = Supervisor::new(
        config.supervisor.clone(),
        config.worker_config(),
        Arc::new(config.pipeline()),
    );
    let state = supervisor.run(listener, shutdown).await;

    info!("Server shutdown complete");
    state
}

/// Cancel `token` on SIGINT or SIGTERM.
///
/// # Panics
///
/// Panics if signal handlers cannot be installed, which only happens when the
/// tokio runtime is misconfigured. That should fail fast at startup.
pub fn spawn_signal_handler(token: CancellationToken) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        tokio::select! {
            _ = shutdown_signal() => token.cancel(),
            _ = token.cancelled() => {}
        }
    })
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler - is tokio runtime configured correctly?");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler - is tokio runtime configured correctly?")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT, shutting down...");
        }
        _ = terminate => {
            info!("Received SIGTERM, shutting down...");
        }
    }
}
