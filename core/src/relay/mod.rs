//! LAN relay: identities, pairing negotiation and message routing
//!
//! A host runs a [`RelayServer`] around one shared [`RelayRouter`]; every
//! participant, the host's own user included, talks to it through a
//! [`RelayClient`].

pub mod client;
pub mod host;
pub mod pairing;
pub mod protocol;
pub mod registry;
pub mod router;
pub mod server;

pub use client::{ClientError, ClientNotice, RelayClient};
pub use host::{HostConfig, HostError, RelayHost};
pub use pairing::{LocalPairing, PairedSession, PairingState, PairingTable, PendingRequest};
pub use protocol::{ClientEvent, Envelope, EventKind, ProtocolError, RelayEvent};
pub use registry::{ConnectionHandle, ConnectionId, Identity, IdentityRegistry};
pub use router::{RelayRouter, RouteOutcome, RouterConfig, RouterStats};
pub use server::{RelayServer, RelayServerConfig, ServerError, ServerHandle};
