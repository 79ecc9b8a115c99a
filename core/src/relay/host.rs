//! Relay Host: a relay server plus the discovery responder advertising it

use super::router::{RelayRouter, RouterConfig};
use super::server::{RelayServer, RelayServerConfig, ServerError, ServerHandle};
use crate::transport::discovery::{
    DiscoveryError, DiscoveryResponder, ResponderConfig, ResponderHandle, DEFAULT_DISCOVERY_PORT,
    DEFAULT_HOST_NAME,
};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum HostError {
    #[error(transparent)]
    Server(#[from] ServerError),
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),
}

/// Everything needed to host a room
#[derive(Debug, Clone)]
pub struct HostConfig {
    pub relay: RelayServerConfig,
    pub router: RouterConfig,
    /// Where discovery probes are answered
    pub discovery_addr: SocketAddr,
    pub name: String,
    /// Address to advertise instead of the detected one
    pub advertise_ip: Option<Ipv4Addr>,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            relay: RelayServerConfig::default(),
            router: RouterConfig::default(),
            discovery_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_DISCOVERY_PORT)),
            name: DEFAULT_HOST_NAME.to_string(),
            advertise_ip: None,
        }
    }
}

/// A running relay and responder, stopped together
pub struct RelayHost {
    router: Arc<RelayRouter>,
    server: ServerHandle,
    responder: ResponderHandle,
}

impl RelayHost {
    /// Bind the relay, then start answering probes with its actual port
    pub async fn start(config: HostConfig) -> Result<Self, HostError> {
        let router = Arc::new(RelayRouter::with_config(config.router));
        let server = RelayServer::bind(config.relay, router.clone()).await?;
        let relay_addr = server.local_addr()?;

        let responder = DiscoveryResponder::bind(ResponderConfig {
            bind_addr: config.discovery_addr,
            relay_port: relay_addr.port(),
            name: config.name,
            advertise_ip: config.advertise_ip,
        })
        .await?;
        let advertised = responder.advertised().relay_url();

        let server = server.spawn()?;
        let responder = responder.spawn()?;
        info!("Hosting room at {}", advertised);

        Ok(Self {
            router,
            server,
            responder,
        })
    }

    pub fn relay_addr(&self) -> SocketAddr {
        self.server.local_addr()
    }

    pub fn discovery_addr(&self) -> SocketAddr {
        self.responder.local_addr()
    }

    pub fn router(&self) -> &Arc<RelayRouter> {
        &self.router
    }

    /// Stop answering probes, then close the relay and all its sessions
    pub async fn shutdown(self) {
        self.responder.shutdown().await;
        self.server.shutdown().await;
        info!("Room closed");
    }
}
