// LANPair Core: pairing and relay for chat on a local network
//
// One machine hosts a relay and answers discovery probes. Everyone else finds
// it by broadcast, registers an identity, negotiates a pairing and chats
// through it.

pub mod relay;
pub mod transport;

pub use relay::{
    ClientError, ClientNotice, HostConfig, HostError, Identity, RelayClient, RelayHost,
    RelayRouter, RelayServer, RelayServerConfig, RouterConfig,
};
pub use transport::discovery::{
    DiscoveryProber, DiscoveryRecord, ProbeConfig, DEFAULT_DISCOVERY_PORT, DEFAULT_HOST_NAME,
    DEFAULT_PROBE_WINDOW, PROBE_TOKEN,
};

/// Port the relay accepts WebSocket sessions on
pub const DEFAULT_RELAY_PORT: u16 = 5000;
