//! Pairing negotiation state
//!
//! Two views of the same handshake live here:
//!
//! - [`PairingTable`] is the relay's record of outstanding requests and
//!   established [`PairedSession`]s. It lets unanswered requests expire and
//!   keeps at most one session per identity.
//! - [`LocalPairing`] is a client's own belief about who it is paired with.
//!   The relay never consults it.

use super::registry::Identity;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// A request the relay delivered and is waiting to see answered
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingRequest {
    pub from: Identity,
    pub to: Identity,
    /// `None` when requests never expire
    pub expires_at: Option<Instant>,
}

/// Two identities the relay has seen complete a request/accept exchange
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairedSession {
    pub a: Identity,
    pub b: Identity,
    pub established_at: Instant,
}

impl PairedSession {
    /// The other side of the session, if `identity` is part of it
    pub fn peer_of(&self, identity: &Identity) -> Option<&Identity> {
        if &self.a == identity {
            Some(&self.b)
        } else if &self.b == identity {
            Some(&self.a)
        } else {
            None
        }
    }
}

/// Identities whose session was torn down, paired with who they lost
pub type EndedPairings = Vec<(Identity, Identity)>;

/// Relay-side negotiation bookkeeping
#[derive(Debug)]
pub struct PairingTable {
    request_timeout: Option<Duration>,
    /// (requester, target) -> request
    pending: HashMap<(Identity, Identity), PendingRequest>,
    /// identity -> its session (each session is stored under both members)
    sessions: HashMap<Identity, PairedSession>,
}

impl PairingTable {
    pub fn new(request_timeout: Option<Duration>) -> Self {
        Self {
            request_timeout,
            pending: HashMap::new(),
            sessions: HashMap::new(),
        }
    }

    /// Record that `from`'s request was delivered to `to`.
    ///
    /// A repeated request restarts its timer.
    pub fn request_delivered(&mut self, from: &Identity, to: &Identity, now: Instant) {
        let expires_at = self.request_timeout.map(|timeout| now + timeout);
        self.pending.insert(
            (from.clone(), to.clone()),
            PendingRequest {
                from: from.clone(),
                to: to.clone(),
                expires_at,
            },
        );
    }

    /// `acceptor` accepted `requester`. Establishes a session only when a
    /// matching request is still pending, returning the pairings it displaced.
    pub fn accept(
        &mut self,
        acceptor: &Identity,
        requester: &Identity,
        now: Instant,
    ) -> Option<EndedPairings> {
        self.pending
            .remove(&(requester.clone(), acceptor.clone()))?;

        let mut ended = self.end_session(acceptor);
        ended.extend(self.end_session(requester));
        // the two sides were paired to each other before; nobody else lost anything
        ended.retain(|(who, _)| who != acceptor && who != requester);

        let session = PairedSession {
            a: requester.clone(),
            b: acceptor.clone(),
            established_at: now,
        };
        self.sessions.insert(requester.clone(), session.clone());
        self.sessions.insert(acceptor.clone(), session);
        Some(ended)
    }

    /// Drop a request that never reached `to`
    pub fn withdraw(&mut self, from: &Identity, to: &Identity) {
        self.pending.remove(&(from.clone(), to.clone()));
    }

    /// `rejecter` declined `requester`; returns whether a request was pending
    pub fn reject(&mut self, rejecter: &Identity, requester: &Identity) -> bool {
        self.pending
            .remove(&(requester.clone(), rejecter.clone()))
            .is_some()
    }

    /// Remove every request whose deadline has passed
    pub fn expire(&mut self, now: Instant) -> Vec<PendingRequest> {
        let expired: Vec<(Identity, Identity)> = self
            .pending
            .iter()
            .filter(|(_, request)| request.expires_at.map_or(false, |at| at <= now))
            .map(|(key, _)| key.clone())
            .collect();

        expired
            .into_iter()
            .filter_map(|key| self.pending.remove(&key))
            .collect()
    }

    /// Forget everything about an identity that went offline.
    ///
    /// Returns the surviving partner (if any) and who it was paired with.
    pub fn forget(&mut self, identity: &Identity) -> EndedPairings {
        self.pending
            .retain(|(from, to), _| from != identity && to != identity);
        self.end_session(identity)
            .into_iter()
            .filter(|(who, _)| who != identity)
            .collect()
    }

    /// Whether `a` and `b` share an established session
    pub fn are_paired(&self, a: &Identity, b: &Identity) -> bool {
        self.sessions
            .get(a)
            .and_then(|session| session.peer_of(a))
            .map_or(false, |peer| peer == b)
    }

    pub fn session_of(&self, identity: &Identity) -> Option<&PairedSession> {
        self.sessions.get(identity)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Number of established sessions
    pub fn session_count(&self) -> usize {
        self.sessions.len() / 2
    }

    fn end_session(&mut self, identity: &Identity) -> EndedPairings {
        let Some(session) = self.sessions.remove(identity) else {
            return Vec::new();
        };
        let Some(peer) = session.peer_of(identity).cloned() else {
            return Vec::new();
        };
        self.sessions.remove(&peer);
        vec![(peer.clone(), identity.clone()), (identity.clone(), peer)]
    }
}

impl Default for PairingTable {
    fn default() -> Self {
        Self::new(None)
    }
}

/// A client's view of its own negotiation
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum PairingState {
    #[default]
    Idle,
    /// We asked `to` and are waiting for an answer
    Requesting { to: Identity },
    /// `from` asked us and we have not answered
    Notified { from: Identity },
    /// We consider ourselves paired with `with`
    Paired { with: Identity },
}

/// Client-local pairing state machine.
///
/// Only [`LocalPairing::paired_with`] matters for sending; the other states
/// exist so a UI can show what it is waiting on. An incoming request is held
/// next to the state, so it stays answerable while we are paired or waiting
/// on our own request.
#[derive(Debug, Clone, Default)]
pub struct LocalPairing {
    state: PairingState,
    incoming: Option<Identity>,
}

impl LocalPairing {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> &PairingState {
        &self.state
    }

    pub fn paired_with(&self) -> Option<&Identity> {
        match &self.state {
            PairingState::Paired { with } => Some(with),
            _ => None,
        }
    }

    /// Identity that asked us and still awaits an answer
    pub fn pending_incoming(&self) -> Option<&Identity> {
        self.incoming.as_ref()
    }

    pub fn request_sent(&mut self, to: Identity) {
        self.state = PairingState::Requesting { to };
    }

    /// Record a request from `from`, replacing any unanswered one.
    ///
    /// Returns whether the visible state moved to `Notified`; it does not
    /// while we are paired or waiting on our own request.
    pub fn incoming(&mut self, from: Identity) -> bool {
        self.incoming = Some(from.clone());
        match self.state {
            PairingState::Idle | PairingState::Notified { .. } => {
                self.state = PairingState::Notified { from };
                true
            }
            _ => false,
        }
    }

    /// Our request was accepted by `from`
    pub fn accepted(&mut self, from: Identity) {
        // a crossed request from the same peer is answered by the pairing
        if self.incoming.as_ref() == Some(&from) {
            self.incoming = None;
        }
        self.state = PairingState::Paired { with: from };
    }

    /// Our request was declined (or the target was offline)
    pub fn rejected(&mut self) {
        if matches!(self.state, PairingState::Requesting { .. }) {
            self.settle();
        }
    }

    /// Our request to `to` timed out on the relay
    pub fn expired(&mut self, to: &Identity) {
        if matches!(&self.state, PairingState::Requesting { to: pending } if pending == to) {
            self.settle();
        }
    }

    /// We told the relay we accept `from`
    pub fn accept_incoming(&mut self, from: &Identity) {
        if self.incoming.as_ref() == Some(from) {
            self.incoming = None;
        }
        self.state = PairingState::Paired { with: from.clone() };
    }

    /// We told the relay we decline `from`; an existing pairing is kept
    pub fn reject_incoming(&mut self, from: &Identity) {
        if self.incoming.as_ref() == Some(from) {
            self.incoming = None;
        }
        if matches!(&self.state, PairingState::Notified { from: asked } if asked == from) {
            self.settle();
        }
    }

    /// The relay tore down our session with `peer`
    pub fn ended(&mut self, peer: &Identity) {
        if self.paired_with() == Some(peer) {
            self.settle();
        }
    }

    /// Drop the local pairing without telling anyone
    pub fn leave(&mut self) -> Option<Identity> {
        let previous = self.paired_with().cloned();
        self.settle();
        previous
    }

    fn settle(&mut self) {
        self.state = match &self.incoming {
            Some(from) => PairingState::Notified { from: from.clone() },
            None => PairingState::Idle,
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> Identity {
        Identity::from(s)
    }

    #[test]
    fn test_accept_establishes_session() {
        let mut table = PairingTable::new(Some(Duration::from_secs(60)));
        let now = Instant::now();

        table.request_delivered(&id("alice"), &id("bob"), now);
        assert_eq!(table.pending_count(), 1);

        let ended = table.accept(&id("bob"), &id("alice"), now).expect("request pending");
        assert!(ended.is_empty());
        assert!(table.are_paired(&id("alice"), &id("bob")));
        assert!(table.are_paired(&id("bob"), &id("alice")));
        assert_eq!(table.session_count(), 1);
        assert_eq!(table.pending_count(), 0);
    }

    #[test]
    fn test_accept_without_request_does_not_pair() {
        let mut table = PairingTable::default();
        assert!(table.accept(&id("bob"), &id("alice"), Instant::now()).is_none());
        assert!(!table.are_paired(&id("alice"), &id("bob")));
    }

    #[test]
    fn test_accept_direction_matters() {
        let mut table = PairingTable::default();
        let now = Instant::now();
        table.request_delivered(&id("alice"), &id("bob"), now);

        // alice cannot accept her own request
        assert!(table.accept(&id("alice"), &id("bob"), now).is_none());
        assert_eq!(table.pending_count(), 1);
    }

    #[test]
    fn test_one_session_per_identity() {
        let mut table = PairingTable::default();
        let now = Instant::now();

        table.request_delivered(&id("alice"), &id("bob"), now);
        table.accept(&id("bob"), &id("alice"), now);

        table.request_delivered(&id("carol"), &id("bob"), now);
        let ended = table.accept(&id("bob"), &id("carol"), now).unwrap();

        assert_eq!(ended, vec![(id("alice"), id("bob"))]);
        assert!(table.are_paired(&id("bob"), &id("carol")));
        assert!(!table.are_paired(&id("alice"), &id("bob")));
        assert!(table.session_of(&id("alice")).is_none());
        assert_eq!(table.session_count(), 1);
    }

    #[test]
    fn test_repairing_same_peers_ends_nothing() {
        let mut table = PairingTable::default();
        let now = Instant::now();

        table.request_delivered(&id("alice"), &id("bob"), now);
        table.accept(&id("bob"), &id("alice"), now);
        table.request_delivered(&id("bob"), &id("alice"), now);
        let ended = table.accept(&id("alice"), &id("bob"), now).unwrap();

        assert!(ended.is_empty());
        assert!(table.are_paired(&id("alice"), &id("bob")));
    }

    #[test]
    fn test_reject_clears_pending() {
        let mut table = PairingTable::default();
        table.request_delivered(&id("alice"), &id("bob"), Instant::now());

        assert!(table.reject(&id("bob"), &id("alice")));
        assert!(!table.reject(&id("bob"), &id("alice")));
        assert_eq!(table.pending_count(), 0);
    }

    #[test]
    fn test_withdrawn_request_cannot_be_accepted() {
        let mut table = PairingTable::default();
        let now = Instant::now();
        table.request_delivered(&id("alice"), &id("bob"), now);
        table.request_delivered(&id("carol"), &id("bob"), now);

        table.withdraw(&id("alice"), &id("bob"));
        assert_eq!(table.pending_count(), 1);
        assert!(table.accept(&id("bob"), &id("alice"), now).is_none());
        assert!(table.accept(&id("bob"), &id("carol"), now).is_some());
    }

    #[test]
    fn test_expire_only_past_deadline() {
        let mut table = PairingTable::new(Some(Duration::from_secs(10)));
        let start = Instant::now();

        table.request_delivered(&id("alice"), &id("bob"), start);
        table.request_delivered(&id("carol"), &id("bob"), start + Duration::from_secs(5));

        assert!(table.expire(start + Duration::from_secs(9)).is_empty());

        let expired = table.expire(start + Duration::from_secs(10));
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].from, id("alice"));
        assert_eq!(table.pending_count(), 1);

        // an expired request can no longer be accepted into a session
        assert!(table.accept(&id("bob"), &id("alice"), start).is_none());
    }

    #[test]
    fn test_no_timeout_never_expires() {
        let mut table = PairingTable::new(None);
        let start = Instant::now();
        table.request_delivered(&id("alice"), &id("bob"), start);
        assert!(table.expire(start + Duration::from_secs(3600)).is_empty());
    }

    #[test]
    fn test_forget_tears_down_session_and_requests() {
        let mut table = PairingTable::default();
        let now = Instant::now();

        table.request_delivered(&id("alice"), &id("bob"), now);
        table.accept(&id("bob"), &id("alice"), now);
        table.request_delivered(&id("carol"), &id("alice"), now);

        let ended = table.forget(&id("alice"));
        assert_eq!(ended, vec![(id("bob"), id("alice"))]);
        assert_eq!(table.session_count(), 0);
        assert_eq!(table.pending_count(), 0);
        assert!(table.forget(&id("alice")).is_empty());
    }

    #[test]
    fn test_local_requester_flow() {
        let mut local = LocalPairing::new();
        local.request_sent(id("bob"));
        assert_eq!(local.state(), &PairingState::Requesting { to: id("bob") });

        local.accepted(id("bob"));
        assert_eq!(local.paired_with(), Some(&id("bob")));

        assert_eq!(local.leave(), Some(id("bob")));
        assert_eq!(local.state(), &PairingState::Idle);
    }

    #[test]
    fn test_local_rejected_and_expired_return_to_idle() {
        let mut local = LocalPairing::new();
        local.request_sent(id("bob"));
        local.rejected();
        assert_eq!(local.state(), &PairingState::Idle);

        local.request_sent(id("bob"));
        local.expired(&id("carol"));
        assert!(matches!(local.state(), PairingState::Requesting { .. }));
        local.expired(&id("bob"));
        assert_eq!(local.state(), &PairingState::Idle);
    }

    #[test]
    fn test_local_receiver_flow() {
        let mut local = LocalPairing::new();
        assert!(local.incoming(id("alice")));
        assert_eq!(local.pending_incoming(), Some(&id("alice")));

        local.accept_incoming(&id("alice"));
        assert_eq!(local.paired_with(), Some(&id("alice")));
        assert_eq!(local.pending_incoming(), None);

        local.ended(&id("alice"));
        assert_eq!(local.state(), &PairingState::Idle);
    }

    #[test]
    fn test_local_request_while_paired_stays_answerable() {
        let mut local = LocalPairing::new();
        local.incoming(id("alice"));
        local.accept_incoming(&id("alice"));

        // the partner stays visible, the new request is held
        assert!(!local.incoming(id("carol")));
        assert_eq!(local.paired_with(), Some(&id("alice")));
        assert_eq!(local.pending_incoming(), Some(&id("carol")));

        local.accept_incoming(&id("carol"));
        assert_eq!(local.paired_with(), Some(&id("carol")));
    }

    #[test]
    fn test_local_reject_while_paired_keeps_partner() {
        let mut local = LocalPairing::new();
        local.request_sent(id("bob"));
        local.accepted(id("bob"));
        local.incoming(id("carol"));

        local.reject_incoming(&id("carol"));
        assert_eq!(local.paired_with(), Some(&id("bob")));
        assert_eq!(local.pending_incoming(), None);
    }

    #[test]
    fn test_local_crossed_requests() {
        let mut local = LocalPairing::new();
        local.request_sent(id("bob"));
        assert!(!local.incoming(id("bob")));
        assert_eq!(local.pending_incoming(), Some(&id("bob")));

        // bob accepted ours first; his request to us is moot
        local.accepted(id("bob"));
        assert_eq!(local.paired_with(), Some(&id("bob")));
        assert_eq!(local.pending_incoming(), None);
    }

    #[test]
    fn test_local_held_request_surfaces_when_free() {
        let mut local = LocalPairing::new();
        local.request_sent(id("bob"));
        local.incoming(id("carol"));
        local.rejected();
        assert_eq!(local.state(), &PairingState::Notified { from: id("carol") });

        local.accept_incoming(&id("carol"));
        local.incoming(id("dave"));
        assert_eq!(local.leave(), Some(id("carol")));
        assert_eq!(local.state(), &PairingState::Notified { from: id("dave") });
    }

    #[test]
    fn test_local_reject_incoming() {
        let mut local = LocalPairing::new();
        local.incoming(id("alice"));
        local.reject_incoming(&id("alice"));
        assert_eq!(local.state(), &PairingState::Idle);
        assert_eq!(local.pending_incoming(), None);
    }

    #[test]
    fn test_local_answer_keeps_newer_request() {
        let mut local = LocalPairing::new();
        local.incoming(id("alice"));
        // carol asks while our answer to alice is in flight
        local.incoming(id("carol"));

        local.reject_incoming(&id("alice"));
        assert_eq!(local.state(), &PairingState::Notified { from: id("carol") });

        local.accept_incoming(&id("alice"));
        assert_eq!(local.paired_with(), Some(&id("alice")));
        assert_eq!(local.pending_incoming(), Some(&id("carol")));
    }
}
