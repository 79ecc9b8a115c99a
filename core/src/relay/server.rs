//! Relay Server: accepts WebSocket sessions and feeds their events to the router

use super::protocol::{decode_client_event, encode, Envelope};
use super::registry::{ConnectionHandle, ConnectionId};
use super::router::RelayRouter;
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

/// Relay server configuration
#[derive(Debug, Clone)]
pub struct RelayServerConfig {
    /// Address to accept sessions on
    pub listen_addr: SocketAddr,
    /// Envelopes buffered per session before new ones are dropped
    pub outbound_queue: usize,
    /// How often unanswered requests are checked for expiry
    pub sweep_interval: Duration,
}

impl Default for RelayServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], crate::DEFAULT_RELAY_PORT)),
            outbound_queue: 256,
            sweep_interval: Duration::from_secs(1),
        }
    }
}

/// Relay server error types
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },
    #[error("Network error: {0}")]
    NetworkError(#[from] std::io::Error),
}

/// Runs cleanup for a session exactly once, however the session ends
struct SessionGuard {
    router: Arc<RelayRouter>,
    connection: ConnectionId,
    peer_addr: SocketAddr,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.router.disconnect(self.connection);
        info!("Session {} ({}) closed", self.connection, self.peer_addr);
    }
}

/// A bound relay server
pub struct RelayServer {
    config: RelayServerConfig,
    listener: TcpListener,
    router: Arc<RelayRouter>,
}

impl RelayServer {
    /// Bind the listening socket
    pub async fn bind(
        config: RelayServerConfig,
        router: Arc<RelayRouter>,
    ) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(config.listen_addr)
            .await
            .map_err(|source| ServerError::Bind {
                addr: config.listen_addr,
                source,
            })?;
        Ok(Self {
            config,
            listener,
            router,
        })
    }

    /// Address actually bound (useful with port 0)
    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.listener.local_addr()?)
    }

    pub fn router(&self) -> &Arc<RelayRouter> {
        &self.router
    }

    /// Accept sessions until `shutdown` flips to `true`
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let local = self
            .listener
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_default();
        info!("Relay listening on ws://{}", local);

        let sweeper = spawn_sweeper(
            self.router.clone(),
            self.config.sweep_interval,
            shutdown.clone(),
        );

        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, peer_addr)) => {
                            tokio::spawn(handle_connection(
                                stream,
                                peer_addr,
                                self.router.clone(),
                                self.config.outbound_queue,
                                shutdown.clone(),
                            ));
                        }
                        Err(e) => warn!("Accept failed: {}", e),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        sweeper.abort();
        info!("Relay on {} stopped", local);
    }

    /// Run on a background task, returning a handle that stops it
    pub fn spawn(self) -> Result<ServerHandle, ServerError> {
        let local_addr = self.local_addr()?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(self.run(shutdown_rx));
        Ok(ServerHandle {
            local_addr,
            shutdown: shutdown_tx,
            task,
        })
    }
}

/// Handle to a relay server running in the background
pub struct ServerHandle {
    local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting, close every session and wait for the accept loop to end
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            error!("Relay task failed: {}", e);
        }
    }
}

fn spawn_sweeper(
    router: Arc<RelayRouter>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let expired = router.expire_requests(Instant::now());
                    if expired > 0 {
                        debug!("Expired {} connection requests", expired);
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
    })
}

/// Drive one WebSocket session until it closes
async fn handle_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    router: Arc<RelayRouter>,
    queue: usize,
    mut shutdown: watch::Receiver<bool>,
) {
    let ws_stream = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!("WebSocket handshake failed for {}: {}", peer_addr, e);
            return;
        }
    };

    let (outbound_tx, mut outbound_rx) = mpsc::channel::<Envelope>(queue);
    let handle = ConnectionHandle::new(ConnectionId::next(), outbound_tx);
    let _guard = SessionGuard {
        router: router.clone(),
        connection: handle.id(),
        peer_addr,
    };
    info!("Session {} opened from {}", handle.id(), peer_addr);

    let (mut write, mut read) = ws_stream.split();

    loop {
        tokio::select! {
            frame = read.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        match decode_client_event(&text) {
                            Ok(event) => {
                                router.handle(&handle, event);
                            }
                            Err(e) => debug!("Ignoring frame from {}: {}", handle.id(), e),
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if write.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!("Session {} read error: {}", handle.id(), e);
                        break;
                    }
                }
            }
            Some(envelope) = outbound_rx.recv() => {
                let text = match encode(&envelope) {
                    Ok(text) => text,
                    Err(e) => {
                        error!("Failed to encode {}: {}", envelope.channel(), e);
                        continue;
                    }
                };
                if let Err(e) = write.send(Message::Text(text)).await {
                    debug!("Session {} write error: {}", handle.id(), e);
                    break;
                }
            }
            _ = shutdown.changed() => {
                let _ = write.send(Message::Close(None)).await;
                break;
            }
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
