//! HTTP listener with graceful shutdown.

use std::net::SocketAddr;

use axum::Router;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::error::ServerError;

pub struct ApiServer {
    addr: SocketAddr,
    router: Option<Router>,
    local_addr: Option<SocketAddr>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl ApiServer {
    pub fn new(addr: SocketAddr, router: Router) -> Self {
        Self {
            addr,
            router: Some(router),
            local_addr: None,
            shutdown_tx: None,
            handle: None,
        }
    }

    /// Bind and spawn the server task. Returns the bound address.
    pub async fn start(&mut self) -> Result<SocketAddr, ServerError> {
        let startup_failed = |reason: String| ServerError::StartupFailed {
            addr: self.addr.to_string(),
            reason,
        };
        let router = self
            .router
            .take()
            .ok_or_else(|| startup_failed("server already started".to_string()))?;

        let listener = tokio::net::TcpListener::bind(self.addr)
            .await
            .map_err(|e| startup_failed(format!("bind failed: {}", e)))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| startup_failed(e.to_string()))?;

        tracing::info!(addr = %local_addr, "HTTP API listening");

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let handle = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, router)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                    tracing::info!("HTTP API shutting down");
                })
                .await
            {
                tracing::error!(error = %e, "HTTP API server error");
            }
        });

        self.shutdown_tx = Some(shutdown_tx);
        self.handle = Some(handle);
        self.local_addr = Some(local_addr);
        Ok(local_addr)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Signal graceful shutdown and wait for the server task to finish.
    pub async fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn any_port() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    #[tokio::test]
    async fn start_and_shutdown_lifecycle() {
        let mut server = ApiServer::new(any_port(), Router::new());
        let addr = server.start().await.unwrap();
        assert_ne!(addr.port(), 0);
        assert_eq!(server.local_addr(), Some(addr));
        server.shutdown().await;
        assert!(server.handle.is_none());
    }

    #[tokio::test]
    async fn start_twice_fails() {
        let mut server = ApiServer::new(any_port(), Router::new());
        server.start().await.unwrap();
        let err = server.start().await.unwrap_err();
        assert!(err.to_string().contains("already started"));
        server.shutdown().await;
    }

    #[tokio::test]
    async fn start_on_occupied_port_returns_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let occupied = listener.local_addr().unwrap();

        let mut server = ApiServer::new(occupied, Router::new());
        match server.start().await.unwrap_err() {
            ServerError::StartupFailed { addr, reason } => {
                assert_eq!(addr, occupied.to_string());
                assert!(reason.contains("bind failed"));
            }
        }
    }

    #[tokio::test]
    async fn shutdown_when_not_started_is_noop() {
        let mut server = ApiServer::new(any_port(), Router::new());
        server.shutdown().await;
    }
}
