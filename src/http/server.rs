//! HTTP server implementation.

use axum::Router;
use std::future::Future;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::error::Result;

/// An HTTP listener serving one router.
pub struct HttpServer {
    /// Name used in logs
    name: &'static str,
    /// Address to bind to
    addr: SocketAddr,
    /// Routes to serve
    router: Router,
}

impl HttpServer {
    /// Create a new server.
    pub fn new(name: &'static str, addr: SocketAddr, router: Router) -> Self {
        Self { name, addr, router }
    }

    /// Bind the listener and serve until `signal` resolves.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(self.addr).await.map_err(|e| {
            error!(server = self.name, addr = %self.addr, error = %e, "Failed to bind");
            e
        })?;
        serve_listener(self.name, listener, self.router, signal).await
    }
}

/// Serve `router` on an already bound listener until `signal` resolves.
///
/// Client addresses are made available to handlers as
/// `ConnectInfo<SocketAddr>`.
pub async fn serve_listener<F>(
    name: &'static str,
    listener: TcpListener,
    router: Router,
    signal: F,
) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = listener.local_addr()?;
    info!(server = name, addr = %addr, "Starting HTTP server with graceful shutdown");

    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(signal)
    .await
    .map_err(|e| {
        error!(server = name, error = %e, "HTTP server failed");
        e
    })?;

    info!(server = name, "HTTP server stopped");
    Ok(())
}
