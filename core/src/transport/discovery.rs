// LAN discovery over UDP broadcast
//
// A host running a relay answers probes on a well-known port with the address
// and port of its relay. A client broadcasts one probe, listens for a fixed
// window, and returns whatever hosts replied.

use network_interface::{Addr, NetworkInterface, NetworkInterfaceConfig};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, warn};

/// The entire body of a discovery probe
pub const PROBE_TOKEN: &[u8] = b"DISCOVER_CHAT_SERVER";

/// Well-known port responders listen on
pub const DEFAULT_DISCOVERY_PORT: u16 = 41234;

/// How long a prober collects replies
pub const DEFAULT_PROBE_WINDOW: Duration = Duration::from_millis(1500);

/// Name advertised when a host does not pick one
pub const DEFAULT_HOST_NAME: &str = "LAN-Chat-Host";

const MAX_DATAGRAM: usize = 2048;

/// Errors that can occur while setting up discovery sockets
#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error("Failed to bind discovery socket on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },
    #[error("Socket option error: {0}")]
    SocketOption(#[from] std::io::Error),
}

/// One discovered host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryRecord {
    /// Address the host advertises for its relay
    pub ip: String,
    /// Port the relay accepts sessions on
    #[serde(rename = "socketPort")]
    pub socket_port: u16,
    /// Display name
    pub name: String,
}

impl DiscoveryRecord {
    /// WebSocket URL of the advertised relay
    pub fn relay_url(&self) -> String {
        format!("ws://{}:{}", self.ip, self.socket_port)
    }
}

/// Reply as it may arrive from an arbitrary responder; every field optional
#[derive(Debug, Deserialize)]
struct RawReply {
    ip: Option<String>,
    #[serde(rename = "socketPort")]
    socket_port: Option<u16>,
    name: Option<String>,
}

/// Pick the first non-loopback address, falling back to `127.0.0.1`
pub fn first_non_loopback(candidates: impl IntoIterator<Item = Ipv4Addr>) -> Ipv4Addr {
    candidates
        .into_iter()
        .find(|ip| !ip.is_loopback() && !ip.is_unspecified())
        .unwrap_or(Ipv4Addr::LOCALHOST)
}

/// First non-loopback IPv4 address of this machine, or `127.0.0.1`
pub fn local_ipv4() -> Ipv4Addr {
    match NetworkInterface::show() {
        Ok(interfaces) => first_non_loopback(interfaces.into_iter().flat_map(|iface| {
            iface.addr.into_iter().filter_map(|addr| match addr {
                Addr::V4(v4) => Some(v4.ip),
                Addr::V6(_) => None,
            })
        })),
        Err(e) => {
            warn!("Failed to enumerate interfaces: {}", e);
            Ipv4Addr::LOCALHOST
        }
    }
}

/// Reply body for `datagram`, or `None` when it is not a probe
pub fn reply_for(datagram: &[u8], advertised: &DiscoveryRecord) -> Option<Vec<u8>> {
    if datagram != PROBE_TOKEN {
        return None;
    }
    serde_json::to_vec(advertised).ok()
}

/// Parse a reply observed from `sender`, filling any missing fields.
///
/// Returns the dedup key (`sender_ip:socketPort`) with the record.
pub fn parse_reply(
    datagram: &[u8],
    sender: SocketAddr,
    discovery_port: u16,
) -> Option<(String, DiscoveryRecord)> {
    let raw: RawReply = serde_json::from_slice(datagram).ok()?;
    let socket_port = raw.socket_port.unwrap_or(discovery_port);
    let record = DiscoveryRecord {
        ip: raw.ip.unwrap_or_else(|| sender.ip().to_string()),
        socket_port,
        name: raw.name.unwrap_or_else(|| DEFAULT_HOST_NAME.to_string()),
    };
    Some((format!("{}:{}", sender.ip(), socket_port), record))
}

/// Responder configuration
#[derive(Debug, Clone)]
pub struct ResponderConfig {
    /// Where to listen for probes
    pub bind_addr: SocketAddr,
    /// Relay port to advertise
    pub relay_port: u16,
    /// Display name to advertise
    pub name: String,
    /// Address to advertise; detected from interfaces when `None`
    pub advertise_ip: Option<Ipv4Addr>,
}

impl Default for ResponderConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_DISCOVERY_PORT)),
            relay_port: crate::DEFAULT_RELAY_PORT,
            name: DEFAULT_HOST_NAME.to_string(),
            advertise_ip: None,
        }
    }
}

/// Answers discovery probes on behalf of a locally hosted relay
pub struct DiscoveryResponder {
    socket: UdpSocket,
    advertised: DiscoveryRecord,
}

impl DiscoveryResponder {
    pub async fn bind(config: ResponderConfig) -> Result<Self, DiscoveryError> {
        let socket = UdpSocket::bind(config.bind_addr)
            .await
            .map_err(|source| DiscoveryError::Bind {
                addr: config.bind_addr,
                source,
            })?;
        socket.set_broadcast(true)?;

        let ip = config.advertise_ip.unwrap_or_else(local_ipv4);
        Ok(Self {
            socket,
            advertised: DiscoveryRecord {
                ip: ip.to_string(),
                socket_port: config.relay_port,
                name: config.name,
            },
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, DiscoveryError> {
        Ok(self.socket.local_addr()?)
    }

    /// Record this responder advertises
    pub fn advertised(&self) -> &DiscoveryRecord {
        &self.advertised
    }

    /// Answer probes until `shutdown` flips to `true`
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(
            "Discovery responder on {} advertising {}",
            self.local_addr()
                .map(|a| a.to_string())
                .unwrap_or_default(),
            self.advertised.relay_url()
        );

        let mut buf = [0u8; MAX_DATAGRAM];
        loop {
            tokio::select! {
                received = self.socket.recv_from(&mut buf) => {
                    let (len, sender) = match received {
                        Ok(v) => v,
                        Err(e) => {
                            debug!("Discovery receive error: {}", e);
                            continue;
                        }
                    };
                    let Some(reply) = reply_for(&buf[..len], &self.advertised) else {
                        debug!("Ignoring {} byte datagram from {}", len, sender);
                        continue;
                    };
                    if let Err(e) = self.socket.send_to(&reply, sender).await {
                        warn!("Discovery reply to {} failed: {}", sender, e);
                    } else {
                        debug!("Answered probe from {}", sender);
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        debug!("Discovery responder stopped");
    }

    /// Run on a background task
    pub fn spawn(self) -> Result<ResponderHandle, DiscoveryError> {
        let local_addr = self.local_addr()?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(self.run(shutdown_rx));
        Ok(ResponderHandle {
            local_addr,
            shutdown: shutdown_tx,
            task,
        })
    }
}

/// Handle to a responder running in the background
pub struct ResponderHandle {
    local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ResponderHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop answering and release the port
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        let _ = self.task.await;
    }
}

/// Prober configuration
#[derive(Debug, Clone)]
pub struct ProbeConfig {
    /// Where the probe is sent (normally the limited broadcast address)
    pub target: SocketAddr,
    /// How long replies are collected
    pub window: Duration,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self::broadcast(DEFAULT_DISCOVERY_PORT)
    }
}

impl ProbeConfig {
    /// Probe the limited broadcast address on `port`
    pub fn broadcast(port: u16) -> Self {
        Self {
            target: SocketAddr::from((Ipv4Addr::BROADCAST, port)),
            window: DEFAULT_PROBE_WINDOW,
        }
    }

    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }
}

/// Finds relays hosted on the local network segment
#[derive(Debug, Clone, Default)]
pub struct DiscoveryProber {
    config: ProbeConfig,
}

impl DiscoveryProber {
    pub fn new(config: ProbeConfig) -> Self {
        Self { config }
    }

    /// Send one probe and collect replies for the configured window.
    ///
    /// Never fails: socket errors are logged and yield an empty list.
    pub async fn probe(&self) -> Vec<DiscoveryRecord> {
        let deadline = Instant::now() + self.config.window;

        let socket = match UdpSocket::bind(SocketAddr::from(([0, 0, 0, 0], 0))).await {
            Ok(socket) => socket,
            Err(e) => {
                warn!("Discovery bind failed: {}", e);
                return Vec::new();
            }
        };
        if let Err(e) = socket.set_broadcast(true) {
            warn!("Failed to enable broadcast: {}", e);
            return Vec::new();
        }
        if let Err(e) = socket.send_to(PROBE_TOKEN, self.config.target).await {
            warn!("Discovery send to {} failed: {}", self.config.target, e);
            return Vec::new();
        }
        debug!("Probe sent to {}", self.config.target);

        let mut discovered: HashMap<String, DiscoveryRecord> = HashMap::new();
        let mut buf = [0u8; MAX_DATAGRAM];
        loop {
            match timeout_at(deadline, socket.recv_from(&mut buf)).await {
                Err(_elapsed) => break,
                Ok(Ok((len, sender))) => {
                    match parse_reply(&buf[..len], sender, self.config.target.port()) {
                        Some((key, record)) => {
                            debug!("Discovered {} at {}", record.name, key);
                            discovered.insert(key, record);
                        }
                        None => debug!("Ignoring malformed reply from {}", sender),
                    }
                }
                Ok(Err(e)) => debug!("Discovery receive error: {}", e),
            }
        }

        let mut records: Vec<DiscoveryRecord> = discovered.into_values().collect();
        records.sort_by(|a, b| (&a.ip, a.socket_port).cmp(&(&b.ip, b.socket_port)));
        info!("Discovery found {} host(s)", records.len());
        records
    }
}
