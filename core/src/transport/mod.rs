// Transport module: LAN discovery of relay hosts

pub mod discovery;

pub use discovery::{
    local_ipv4, DiscoveryError, DiscoveryProber, DiscoveryRecord, DiscoveryResponder,
    ProbeConfig, ResponderConfig, ResponderHandle,
};
