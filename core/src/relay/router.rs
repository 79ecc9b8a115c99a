//! Relay Router: forwards negotiation events and messages by identity

use super::pairing::PairingTable;
use super::protocol::{ClientEvent, Envelope, RelayEvent};
use super::registry::{ConnectionHandle, ConnectionId, DeliveryFailure, Identity, IdentityRegistry};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Router configuration
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// How long a delivered connection request stays answerable (`None` = forever)
    pub request_timeout: Option<Duration>,
    /// Only relay messages between identities with an established session
    pub require_pairing: bool,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            request_timeout: Some(Duration::from_secs(60)),
            require_pairing: false,
        }
    }
}

/// Result of handling one client event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    /// The identity was bound to the sending connection
    Registered,
    /// The event was queued for its recipient
    Delivered,
    /// The recipient is offline and the sender was told so
    RecipientOffline,
    /// Nothing was delivered and nobody was told
    Dropped,
}

/// Statistics about router operations
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouterStats {
    /// Identities currently bound to a connection
    pub identities_registered: usize,
    /// Connection requests awaiting an answer
    pub pending_requests: usize,
    /// Established paired sessions
    pub paired_sessions: usize,
    /// Envelopes queued on a connection
    pub events_delivered: u64,
    /// Events that reached no connection
    pub events_dropped: u64,
}

/// Routes client events to the connections of their recipients.
///
/// The router is the single owner of the identity registry and the pairing
/// table; transports only hand it events and disconnect notices.
pub struct RelayRouter {
    config: RouterConfig,
    registry: Arc<IdentityRegistry>,
    pairing: Mutex<PairingTable>,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

impl RelayRouter {
    /// Create a router with a fresh registry and default configuration
    pub fn new() -> Self {
        Self::with_config(RouterConfig::default())
    }

    pub fn with_config(config: RouterConfig) -> Self {
        Self::with_registry(config, Arc::new(IdentityRegistry::new()))
    }

    /// Create a router over an existing registry
    pub fn with_registry(config: RouterConfig, registry: Arc<IdentityRegistry>) -> Self {
        Self {
            pairing: Mutex::new(PairingTable::new(config.request_timeout)),
            config,
            registry,
            delivered: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn registry(&self) -> &Arc<IdentityRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    /// Dispatch one event received on `origin`
    pub fn handle(&self, origin: &ConnectionHandle, event: ClientEvent) -> RouteOutcome {
        debug!("{} from {}", event.name(), origin.id());
        match event {
            ClientEvent::Register { mobile } => self.register(mobile, origin),
            ClientEvent::ConnectionRequest { from, to } => self.connection_request(origin, from, to),
            ClientEvent::AcceptRequest { from, to } => self.accept_request(from, to),
            ClientEvent::RejectRequest { from, to } => self.reject_request(from, to),
            ClientEvent::Message { to, text, from } => self.route_message(from, to, text),
        }
    }

    /// Bind `identity` to `origin`
    pub fn register(&self, identity: Identity, origin: &ConnectionHandle) -> RouteOutcome {
        if identity.is_empty() {
            warn!("Ignoring empty identity from {}", origin.id());
            return RouteOutcome::Dropped;
        }

        let registration = self.registry.register(identity.clone(), origin.clone());
        if let Some(superseded) = registration.superseded {
            info!("Identity {} moved from {} to {}", identity, superseded, origin.id());
        }
        if let Some(previous) = registration.previous_identity {
            info!("{} re-registered from {} to {}", origin.id(), previous, identity);
            self.forget_identity(&previous);
        }
        info!("Registered {} -> {}", identity, origin.id());
        RouteOutcome::Registered
    }

    /// Forward a pairing request, or tell the requesting connection the target is offline
    pub fn connection_request(
        &self,
        origin: &ConnectionHandle,
        from: Identity,
        to: Identity,
    ) -> RouteOutcome {
        match self.registry.lookup(&to) {
            Some(target) => {
                let envelope = Envelope::new(
                    to.clone(),
                    RelayEvent::IncomingRequest { from: from.clone() },
                );
                // pending before the target can answer it
                self.pairing
                    .lock()
                    .request_delivered(&from, &to, Instant::now());
                if self.send(&target, envelope) {
                    RouteOutcome::Delivered
                } else {
                    self.pairing.lock().withdraw(&from, &to);
                    RouteOutcome::Dropped
                }
            }
            None => {
                info!("Connection request from {} to offline {}", from, to);
                // goes to the requesting connection even if `from` never registered
                self.send(origin, Envelope::new(from, RelayEvent::not_online()));
                RouteOutcome::RecipientOffline
            }
        }
    }

    /// `from` accepted the request of `to`
    pub fn accept_request(&self, from: Identity, to: Identity) -> RouteOutcome {
        let ended = self.pairing.lock().accept(&from, &to, Instant::now());
        match ended {
            Some(ended) => {
                info!("Paired {} <-> {}", to, from);
                for (who, peer) in ended {
                    self.notify(&who, RelayEvent::PairingEnded { peer });
                }
            }
            None => debug!("Accept from {} to {} without a pending request", from, to),
        }

        self.forward(to, RelayEvent::RequestAccepted { from })
    }

    /// `from` declined the request of `to`
    pub fn reject_request(&self, from: Identity, to: Identity) -> RouteOutcome {
        self.pairing.lock().reject(&from, &to);
        self.forward(
            to,
            RelayEvent::RequestRejected {
                from: Some(from),
                reason: None,
            },
        )
    }

    /// Relay text to `to`; silently dropped when `to` is offline
    pub fn route_message(&self, from: Identity, to: Identity, text: String) -> RouteOutcome {
        if self.config.require_pairing && !self.pairing.lock().are_paired(&from, &to) {
            debug!("Dropping message from {} to unpaired {}", from, to);
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return RouteOutcome::Dropped;
        }
        self.forward(to, RelayEvent::Message { from, text })
    }

    /// Clean up after a transport session ended. Idempotent.
    pub fn disconnect(&self, connection: ConnectionId) -> Option<Identity> {
        let identity = self.registry.unbind(connection)?;
        info!("Unregistered {} ({})", identity, connection);
        self.forget_identity(&identity);
        Some(identity)
    }

    /// Expire unanswered requests, telling each requester. Returns how many expired.
    pub fn expire_requests(&self, now: Instant) -> usize {
        let expired = self.pairing.lock().expire(now);
        for request in &expired {
            debug!("Request from {} to {} expired", request.from, request.to);
            self.notify(
                &request.from,
                RelayEvent::RequestExpired {
                    to: request.to.clone(),
                },
            );
        }
        expired.len()
    }

    /// Whether the relay has seen `a` and `b` complete a pairing
    pub fn are_paired(&self, a: &Identity, b: &Identity) -> bool {
        self.pairing.lock().are_paired(a, b)
    }

    /// Current router statistics
    pub fn stats(&self) -> RouterStats {
        let identities_registered = self.registry.len();
        let pairing = self.pairing.lock();
        RouterStats {
            identities_registered,
            pending_requests: pairing.pending_count(),
            paired_sessions: pairing.session_count(),
            events_delivered: self.delivered.load(Ordering::Relaxed),
            events_dropped: self.dropped.load(Ordering::Relaxed),
        }
    }

    fn forget_identity(&self, identity: &Identity) {
        let ended = self.pairing.lock().forget(identity);
        for (who, peer) in ended {
            self.notify(&who, RelayEvent::PairingEnded { peer });
        }
    }

    /// Deliver to `recipient` if online; offline recipients are a silent drop
    fn forward(&self, recipient: Identity, event: RelayEvent) -> RouteOutcome {
        match self.registry.lookup(&recipient) {
            Some(target) => {
                if self.send(&target, Envelope::new(recipient, event)) {
                    RouteOutcome::Delivered
                } else {
                    RouteOutcome::Dropped
                }
            }
            None => {
                debug!("Dropping {} for offline {}", event.kind().as_str(), recipient);
                self.dropped.fetch_add(1, Ordering::Relaxed);
                RouteOutcome::Dropped
            }
        }
    }

    fn notify(&self, recipient: &Identity, event: RelayEvent) {
        if let Some(target) = self.registry.lookup(recipient) {
            self.send(&target, Envelope::new(recipient.clone(), event));
        }
    }

    fn send(&self, target: &ConnectionHandle, envelope: Envelope) -> bool {
        let channel = envelope.channel();
        match target.deliver(envelope) {
            Ok(()) => {
                self.delivered.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(failure) => {
                match failure {
                    DeliveryFailure::QueueFull => {
                        warn!("Outbound queue full on {}, dropped {}", target.id(), channel)
                    }
                    DeliveryFailure::Closed => {
                        debug!("{} already closed, dropped {}", target.id(), channel)
                    }
                }
                self.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }
}

impl Default for RelayRouter {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// TESTS
// ============================================================================
