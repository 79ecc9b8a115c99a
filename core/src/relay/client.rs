//! Relay Client: one identity's session with a relay
//!
//! The client registers on connect, keeps its own [`LocalPairing`] in step
//! with the envelopes it receives, and hands every envelope addressed to it
//! to the caller as a [`ClientNotice`].

use super::pairing::{LocalPairing, PairingState};
use super::protocol::{decode_envelope, encode, ClientEvent, RelayEvent};
use super::registry::Identity;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

const OUTBOUND_QUEUE: usize = 64;
const NOTICE_QUEUE: usize = 256;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Failed to connect to relay: {0}")]
    Connect(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("Identity must not be empty")]
    EmptyIdentity,
    #[error("Cannot pair with yourself")]
    SelfPairing,
    #[error("No pending request to answer")]
    NoPendingRequest,
    #[error("Not paired with anyone")]
    NotPaired,
    #[error("Relay connection closed")]
    Disconnected,
}

/// Something the relay told us
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientNotice {
    Relay(RelayEvent),
    /// The relay session ended; no further notices follow
    Disconnected,
}

/// A registered session with a relay
pub struct RelayClient {
    identity: Identity,
    outbound: mpsc::Sender<ClientEvent>,
    pairing: Arc<Mutex<LocalPairing>>,
}

impl RelayClient {
    /// Connect to `url` (e.g. `ws://192.168.1.20:5000`) and register `identity`
    pub async fn connect(
        url: &str,
        identity: Identity,
    ) -> Result<(Self, mpsc::Receiver<ClientNotice>), ClientError> {
        if identity.is_empty() {
            return Err(ClientError::EmptyIdentity);
        }

        let (ws_stream, _) = connect_async(url).await?;
        let (mut write, mut read) = ws_stream.split();
        info!("Connected to relay {} as {}", url, identity);

        let (outbound_tx, mut outbound_rx) = mpsc::channel::<ClientEvent>(OUTBOUND_QUEUE);
        let (notice_tx, notice_rx) = mpsc::channel(NOTICE_QUEUE);
        let pairing = Arc::new(Mutex::new(LocalPairing::new()));

        tokio::spawn(async move {
            while let Some(event) = outbound_rx.recv().await {
                let text = match encode(&event) {
                    Ok(text) => text,
                    Err(e) => {
                        warn!("Failed to encode {}: {}", event.name(), e);
                        continue;
                    }
                };
                if let Err(e) = write.send(Message::Text(text)).await {
                    debug!("Relay write failed: {}", e);
                    return;
                }
            }
            let _ = write.close().await;
        });

        let me = identity.clone();
        let state = pairing.clone();
        tokio::spawn(async move {
            while let Some(frame) = read.next().await {
                let text = match frame {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(e) => {
                        debug!("Relay read failed: {}", e);
                        break;
                    }
                };
                let envelope = match decode_envelope(&text) {
                    Ok(envelope) => envelope,
                    Err(e) => {
                        debug!("Ignoring frame from relay: {}", e);
                        continue;
                    }
                };
                if envelope.recipient != me {
                    debug!("Ignoring {} not addressed to us", envelope.channel());
                    continue;
                }
                apply(&mut state.lock(), &envelope.event);
                let _ = notice_tx.send(ClientNotice::Relay(envelope.event)).await;
            }
            info!("Relay session for {} ended", me);
            let _ = notice_tx.send(ClientNotice::Disconnected).await;
        });

        let client = Self {
            identity,
            outbound: outbound_tx,
            pairing,
        };
        client
            .send(ClientEvent::Register {
                mobile: client.identity.clone(),
            })
            .await?;
        Ok((client, notice_rx))
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn state(&self) -> PairingState {
        self.pairing.lock().state().clone()
    }

    pub fn paired_with(&self) -> Option<Identity> {
        self.pairing.lock().paired_with().cloned()
    }

    /// Ask `to` to pair with us
    pub async fn request_pairing(&self, to: Identity) -> Result<(), ClientError> {
        if to.is_empty() {
            return Err(ClientError::EmptyIdentity);
        }
        if to == self.identity {
            return Err(ClientError::SelfPairing);
        }
        self.pairing.lock().request_sent(to.clone());
        self.send(ClientEvent::ConnectionRequest {
            from: self.identity.clone(),
            to,
        })
        .await
    }

    /// Accept the pending incoming request; returns the new partner.
    ///
    /// Works while already paired: the relay ends the old session and the
    /// previous partner is told.
    pub async fn accept(&self) -> Result<Identity, ClientError> {
        let requester = self.pending_request()?;
        self.send(ClientEvent::AcceptRequest {
            from: self.identity.clone(),
            to: requester.clone(),
        })
        .await?;
        self.pairing.lock().accept_incoming(&requester);
        Ok(requester)
    }

    /// Decline the pending incoming request; returns who asked
    pub async fn reject(&self) -> Result<Identity, ClientError> {
        let requester = self.pending_request()?;
        self.send(ClientEvent::RejectRequest {
            from: self.identity.clone(),
            to: requester.clone(),
        })
        .await?;
        self.pairing.lock().reject_incoming(&requester);
        Ok(requester)
    }

    /// Who is waiting for an answer from us
    pub fn pending_request(&self) -> Result<Identity, ClientError> {
        self.pairing
            .lock()
            .pending_incoming()
            .cloned()
            .ok_or(ClientError::NoPendingRequest)
    }

    /// Send text to the paired peer
    pub async fn send_text(&self, text: impl Into<String>) -> Result<Identity, ClientError> {
        let to = self.paired_with().ok_or(ClientError::NotPaired)?;
        self.send(ClientEvent::Message {
            to: to.clone(),
            text: text.into(),
            from: self.identity.clone(),
        })
        .await?;
        Ok(to)
    }

    /// Forget the current pairing locally; the peer is not told
    pub fn leave(&self) -> Option<Identity> {
        self.pairing.lock().leave()
    }

    async fn send(&self, event: ClientEvent) -> Result<(), ClientError> {
        self.outbound
            .send(event)
            .await
            .map_err(|_| ClientError::Disconnected)
    }
}

fn apply(pairing: &mut LocalPairing, event: &RelayEvent) {
    match event {
        RelayEvent::IncomingRequest { from } => {
            if !pairing.incoming(from.clone()) {
                debug!("Holding request from {} until answered", from);
            }
        }
        RelayEvent::RequestAccepted { from } => pairing.accepted(from.clone()),
        RelayEvent::RequestRejected { .. } => pairing.rejected(),
        RelayEvent::RequestExpired { to } => pairing.expired(to),
        RelayEvent::PairingEnded { peer } => pairing.ended(peer),
        RelayEvent::Message { .. } => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::router::RelayRouter;
    use crate::relay::server::{RelayServer, RelayServerConfig, ServerHandle};
    use std::time::Duration;

    async fn start() -> (ServerHandle, Arc<RelayRouter>) {
        let router = Arc::new(RelayRouter::new());
        let config = RelayServerConfig {
            listen_addr: "127.0.0.1:0".parse().unwrap(),
            ..Default::default()
        };
        let server = RelayServer::bind(config, router.clone()).await.unwrap();
        (server.spawn().unwrap(), router)
    }

    async fn connect(
        handle: &ServerHandle,
        router: &RelayRouter,
        id: &str,
    ) -> (RelayClient, mpsc::Receiver<ClientNotice>) {
        let url = format!("ws://{}", handle.local_addr());
        let pair = RelayClient::connect(&url, id.into()).await.unwrap();
        for _ in 0..100 {
            if router.registry().lookup(&id.into()).is_some() {
                return pair;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("{} never registered", id);
    }

    async fn next(notices: &mut mpsc::Receiver<ClientNotice>) -> ClientNotice {
        tokio::time::timeout(Duration::from_secs(2), notices.recv())
            .await
            .expect("timed out waiting for notice")
            .expect("notice channel closed")
    }

    #[test]
    fn test_apply_tracks_pairing() {
        let mut pairing = LocalPairing::new();
        pairing.request_sent("bob".into());
        apply(&mut pairing, &RelayEvent::RequestAccepted { from: "bob".into() });
        assert_eq!(pairing.paired_with(), Some(&"bob".into()));

        apply(&mut pairing, &RelayEvent::PairingEnded { peer: "bob".into() });
        assert_eq!(pairing.state(), &PairingState::Idle);

        pairing.request_sent("carol".into());
        apply(&mut pairing, &RelayEvent::not_online());
        assert_eq!(pairing.state(), &PairingState::Idle);
    }

    fn offline_client(identity: &str) -> RelayClient {
        let (outbound, _) = mpsc::channel(1);
        RelayClient {
            identity: identity.into(),
            outbound,
            pairing: Arc::new(Mutex::new(LocalPairing::new())),
        }
    }

    #[tokio::test]
    async fn test_failed_answer_keeps_request_pending() {
        let bob = offline_client("bob");
        bob.pairing.lock().incoming("alice".into());

        assert!(matches!(bob.accept().await, Err(ClientError::Disconnected)));
        assert_eq!(bob.state(), PairingState::Notified { from: "alice".into() });
        assert_eq!(bob.paired_with(), None);

        assert!(matches!(bob.reject().await, Err(ClientError::Disconnected)));
        assert_eq!(bob.pending_request().unwrap(), Identity::from("alice"));
    }

    #[tokio::test]
    async fn test_failed_accept_keeps_current_partner() {
        let bob = offline_client("bob");
        {
            let mut pairing = bob.pairing.lock();
            pairing.request_sent("alice".into());
            pairing.accepted("alice".into());
            pairing.incoming("carol".into());
        }

        assert!(bob.accept().await.is_err());
        assert_eq!(bob.paired_with(), Some("alice".into()));
        assert_eq!(bob.pending_request().unwrap(), Identity::from("carol"));
    }

    #[tokio::test]
    async fn test_empty_identity_refused_before_connecting() {
        let result = RelayClient::connect("ws://127.0.0.1:1", "  ".into()).await;
        assert!(matches!(result, Err(ClientError::EmptyIdentity)));
    }

    #[tokio::test]
    async fn test_local_checks() {
        let (handle, router) = start().await;
        let (alice, _notices) = connect(&handle, &router, "alice").await;

        assert!(matches!(
            alice.request_pairing("alice".into()).await,
            Err(ClientError::SelfPairing)
        ));
        assert!(matches!(alice.accept().await, Err(ClientError::NoPendingRequest)));
        assert!(matches!(alice.send_text("hi").await, Err(ClientError::NotPaired)));
        assert_eq!(alice.leave(), None);

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_pair_and_chat() {
        let (handle, router) = start().await;
        let (alice, mut alice_notices) = connect(&handle, &router, "alice").await;
        let (bob, mut bob_notices) = connect(&handle, &router, "bob").await;

        alice.request_pairing("bob".into()).await.unwrap();
        assert_eq!(
            next(&mut bob_notices).await,
            ClientNotice::Relay(RelayEvent::IncomingRequest { from: "alice".into() })
        );

        assert_eq!(bob.accept().await.unwrap(), Identity::from("alice"));
        assert_eq!(
            next(&mut alice_notices).await,
            ClientNotice::Relay(RelayEvent::RequestAccepted { from: "bob".into() })
        );
        assert_eq!(alice.paired_with(), Some("bob".into()));

        alice.send_text("hello").await.unwrap();
        assert_eq!(
            next(&mut bob_notices).await,
            ClientNotice::Relay(RelayEvent::Message {
                from: "alice".into(),
                text: "hello".to_string(),
            })
        );

        handle.shutdown().await;
        assert_eq!(next(&mut alice_notices).await, ClientNotice::Disconnected);
    }
}
