//! TCP listener that runs connection establishment for each accepted socket.
//!
//! Every connection is handled on its own task, tracked so that
//! [`ServerHandle::stop`] can wait for all of them. A connection's failure is
//! logged and dropped there; nothing propagates back to the accept loop.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::codec::SaslCode;
use crate::error::{ConnError, Result};
use crate::incoming::{ConnectionConfig, IncomingConnection};
use crate::protocol::{condition, timeouts};

/// What to do with a connection that finished negotiating.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Accept,
    Reject {
        condition: String,
        description: String,
    },
}

/// Application hook consulted once per successfully negotiated connection.
pub trait AcceptPolicy: Send + Sync {
    fn decide(&self, conn: &IncomingConnection) -> Decision;
}

/// Accepts connections whose SASL exchange ended with `ok`.
#[derive(Debug, Default, Clone, Copy)]
pub struct RequireAuthenticated;

impl AcceptPolicy for RequireAuthenticated {
    fn decide(&self, conn: &IncomingConnection) -> Decision {
        match conn.sasl_outcome() {
            Some(o) if o.code == SaslCode::Ok => Decision::Accept,
            _ => Decision::Reject {
                condition: condition::UNAUTHORIZED_ACCESS.to_string(),
                description: "SASL authentication did not succeed".to_string(),
            },
        }
    }
}

/// Listener configuration. Cloned into every connection handler.
#[derive(Clone)]
pub struct Server {
    config: ConnectionConfig,
    negotiation_timeout: Duration,
    policy: Arc<dyn AcceptPolicy>,
}

impl Server {
    pub fn new(config: ConnectionConfig) -> Self {
        Server {
            config,
            negotiation_timeout: Duration::from_millis(timeouts::NEGOTIATION_MS),
            policy: Arc::new(RequireAuthenticated),
        }
    }

    /// Window for a whole negotiation, on top of the per-operation
    /// connect timeout.
    pub fn with_negotiation_timeout(mut self, timeout: Duration) -> Self {
        self.negotiation_timeout = timeout;
        self
    }

    pub fn with_policy(mut self, policy: Arc<dyn AcceptPolicy>) -> Self {
        self.policy = policy;
        self
    }

    /// Bind `host:port` and start accepting in the background.
    pub async fn start(self, host: &str, port: u16) -> io::Result<ServerHandle> {
        let listener = TcpListener::bind((host, port)).await?;
        let local_addr = listener.local_addr()?;
        info!(%local_addr, "amqpd listening");

        let shutdown = CancellationToken::new();
        let tracker = TaskTracker::new();
        let accept_loop = tokio::spawn(accept_loop(
            listener,
            Arc::new(self),
            shutdown.clone(),
            tracker.clone(),
        ));

        Ok(ServerHandle {
            local_addr,
            shutdown,
            tracker,
            accept_loop: Mutex::new(Some(accept_loop)),
        })
    }
}

/// Handle to a running listener.
pub struct ServerHandle {
    local_addr: SocketAddr,
    shutdown: CancellationToken,
    tracker: TaskTracker,
    accept_loop: Mutex<Option<JoinHandle<()>>>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting, close the listening socket and wait for every
    /// connection handler to return. Later calls return immediately once the
    /// first has finished.
    pub async fn stop(&self) {
        self.shutdown.cancel();
        let accept_loop = self.accept_loop.lock().take();
        if let Some(handle) = accept_loop {
            if let Err(e) = handle.await {
                warn!(error = %e, "accept loop panicked");
            }
            info!(local_addr = %self.local_addr, "amqpd stopped");
        }
        self.tracker.close();
        self.tracker.wait().await;
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn accept_loop(
    listener: TcpListener,
    server: Arc<Server>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
) {
    loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => break,
            r = listener.accept() => r,
        };
        let (stream, peer) = match accepted {
            Ok(pair) => pair,
            Err(e) => {
                // usually fd exhaustion; back off rather than spin
                warn!(error = %e, "accept failed");
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            }
        };
        let _ = stream.set_nodelay(true);
        debug!(%peer, "connection accepted");

        let server = server.clone();
        let shutdown = shutdown.clone();
        tracker.spawn(async move {
            let res = tokio::select! {
                r = handle_connection(&server, stream) => r,
                _ = shutdown.cancelled() => Err(ConnError::ConnectionClosed),
            };
            match res {
                Ok(()) => debug!(%peer, "connection closed"),
                Err(e) if e.is_closed() => debug!(%peer, "connection closed by shutdown"),
                Err(e) => warn!(%peer, error = %e, "connection failed"),
            }
        });
    }
    // listener dropped here, closing the socket
}

async fn handle_connection(server: &Server, stream: TcpStream) -> Result<()> {
    let negotiated = tokio::time::timeout(
        server.negotiation_timeout,
        IncomingConnection::negotiate(stream, server.config.clone()),
    )
    .await
    .map_err(|_| ConnError::Timeout)?;
    let mut conn = negotiated?;

    match server.policy.decide(&conn) {
        Decision::Accept => {
            conn.accept().await?;
            info!(
                identity = conn.authenticated_identity().unwrap_or(""),
                peer_container = conn.peer_container_id().unwrap_or(""),
                "connection accepted"
            );
            // steady state is handled elsewhere; close cleanly
            conn.close().await
        }
        Decision::Reject {
            condition,
            description,
        } => {
            info!(%condition, %description, "connection rejected");
            conn.reject(condition, description).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sasl::SaslRegistry;

    #[tokio::test]
    async fn test_start_binds_ephemeral_port() {
        let config = ConnectionConfig::new().with_mechanisms(SaslRegistry::with_anonymous());
        let server = Server::new(config);
        let handle = server.start("127.0.0.1", 0).await.unwrap();
        assert_ne!(handle.local_addr().port(), 0);
        handle.stop().await;
    }

    #[tokio::test]
    async fn test_stop_is_idempotent_and_closes_listener() {
        let handle = Server::new(ConnectionConfig::new())
            .start("127.0.0.1", 0)
            .await
            .unwrap();
        let addr = handle.local_addr();
        handle.stop().await;
        handle.stop().await;
        assert!(TcpStream::connect(addr).await.is_err());
    }

    #[tokio::test]
    async fn test_bind_conflict_is_an_error() {
        let first = Server::new(ConnectionConfig::new())
            .start("127.0.0.1", 0)
            .await
            .unwrap();
        let port = first.local_addr().port();
        let second = Server::new(ConnectionConfig::new())
            .start("127.0.0.1", port)
            .await;
        assert!(second.is_err());
        first.stop().await;
    }
}
