//! Identity Registry: binds self-asserted identities to live relay connections

use super::protocol::Envelope;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

/// A self-asserted peer identifier. Nothing proves ownership.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identity(String);

impl Identity {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Identity {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for Identity {
    fn from(value: String) -> Self {
        Self(value)
    }
}

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique id of a transport session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Allocate a fresh id
    pub fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Why an envelope could not be queued on a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryFailure {
    /// The session's outbound queue is full
    QueueFull,
    /// The session has already gone away
    Closed,
}

/// Sending side of one live session.
///
/// Cloning is cheap; every clone feeds the same outbound queue.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    outbound: mpsc::Sender<Envelope>,
}

impl ConnectionHandle {
    pub fn new(id: ConnectionId, outbound: mpsc::Sender<Envelope>) -> Self {
        Self { id, outbound }
    }

    /// Create a handle with a fresh id and its receiving queue
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Envelope>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self::new(ConnectionId::next(), tx), rx)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Queue an envelope without waiting
    pub fn deliver(&self, envelope: Envelope) -> Result<(), DeliveryFailure> {
        self.outbound.try_send(envelope).map_err(|e| match e {
            TrySendError::Full(_) => DeliveryFailure::QueueFull,
            TrySendError::Closed(_) => DeliveryFailure::Closed,
        })
    }

    pub fn is_closed(&self) -> bool {
        self.outbound.is_closed()
    }
}

/// What a registration replaced
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Registration {
    /// Connection that held this identity before (still open, now unaddressable)
    pub superseded: Option<ConnectionId>,
    /// Identity this connection held before, if it was a different one
    pub previous_identity: Option<Identity>,
}

#[derive(Default)]
struct Bindings {
    by_identity: HashMap<Identity, ConnectionHandle>,
    by_connection: HashMap<ConnectionId, Identity>,
}

/// Identity ⇄ connection map, unique in both directions.
///
/// Both directions live behind one lock so every mutation keeps them an
/// exact inverse pair.
#[derive(Default)]
pub struct IdentityRegistry {
    bindings: Mutex<Bindings>,
}

impl IdentityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `identity` to `connection`, replacing any prior binding of either
    pub fn register(&self, identity: Identity, connection: ConnectionHandle) -> Registration {
        let mut bindings = self.bindings.lock();
        let conn_id = connection.id();
        let mut registration = Registration::default();

        if let Some(previous) = bindings.by_connection.remove(&conn_id) {
            if previous != identity {
                bindings.by_identity.remove(&previous);
                registration.previous_identity = Some(previous);
            }
        }

        if let Some(old) = bindings.by_identity.insert(identity.clone(), connection) {
            if old.id() != conn_id {
                bindings.by_connection.remove(&old.id());
                registration.superseded = Some(old.id());
            }
        }
        bindings.by_connection.insert(conn_id, identity);

        registration
    }

    /// Live connection for `identity`, if any
    pub fn lookup(&self, identity: &Identity) -> Option<ConnectionHandle> {
        self.bindings.lock().by_identity.get(identity).cloned()
    }

    /// Identity currently bound to `connection`
    pub fn identity_of(&self, connection: ConnectionId) -> Option<Identity> {
        self.bindings.lock().by_connection.get(&connection).cloned()
    }

    /// Drop whatever binding `connection` holds. Idempotent.
    pub fn unbind(&self, connection: ConnectionId) -> Option<Identity> {
        let mut bindings = self.bindings.lock();
        let identity = bindings.by_connection.remove(&connection)?;
        if bindings
            .by_identity
            .get(&identity)
            .map_or(false, |handle| handle.id() == connection)
        {
            bindings.by_identity.remove(&identity);
        }
        Some(identity)
    }

    /// Number of bound identities
    pub fn len(&self) -> usize {
        self.bindings.lock().by_identity.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[cfg(test)]
    fn is_consistent(&self) -> bool {
        let bindings = self.bindings.lock();
        bindings.by_identity.len() == bindings.by_connection.len()
            && bindings.by_identity.iter().all(|(identity, handle)| {
                bindings.by_connection.get(&handle.id()) == Some(identity)
            })
    }
}
