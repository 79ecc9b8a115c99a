//! Relay integration tests over real WebSocket sessions
//!
//! Run with: cargo test --test integration_relay

use lanpair_core::relay::{
    ClientNotice, HostConfig, Identity, PairingState, RelayClient, RelayEvent, RelayHost,
    RelayServerConfig, RouterConfig,
};
use std::net::Ipv4Addr;
use std::time::Duration;
use tokio::sync::mpsc;

fn loopback(router: RouterConfig) -> HostConfig {
    HostConfig {
        relay: RelayServerConfig {
            listen_addr: "127.0.0.1:0".parse().unwrap(),
            sweep_interval: Duration::from_millis(20),
            ..Default::default()
        },
        router,
        discovery_addr: "127.0.0.1:0".parse().unwrap(),
        advertise_ip: Some(Ipv4Addr::LOCALHOST),
        ..Default::default()
    }
}

async fn join(host: &RelayHost, id: &str) -> (RelayClient, mpsc::Receiver<ClientNotice>) {
    let url = format!("ws://{}", host.relay_addr());
    let (client, notices) = RelayClient::connect(&url, id.into()).await.unwrap();
    wait_until(|| {
        host.router()
            .registry()
            .lookup(&id.into())
            .is_some_and(|handle| !handle.is_closed())
    })
    .await;
    (client, notices)
}

async fn wait_until<F: Fn() -> bool>(condition: F) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

async fn next_event(notices: &mut mpsc::Receiver<ClientNotice>) -> RelayEvent {
    match tokio::time::timeout(Duration::from_secs(2), notices.recv()).await {
        Ok(Some(ClientNotice::Relay(event))) => event,
        other => panic!("expected a relay event, got {:?}", other),
    }
}

async fn assert_quiet(notices: &mut mpsc::Receiver<ClientNotice>) {
    let waited = tokio::time::timeout(Duration::from_millis(200), notices.recv()).await;
    assert!(waited.is_err(), "unexpected notice: {:?}", waited);
}

fn id(s: &str) -> Identity {
    Identity::from(s)
}

#[tokio::test]
async fn test_request_to_offline_peer() {
    let host = RelayHost::start(loopback(RouterConfig::default())).await.unwrap();
    let (alice, mut alice_rx) = join(&host, "alice").await;

    alice.request_pairing(id("bob")).await.unwrap();

    match next_event(&mut alice_rx).await {
        RelayEvent::RequestRejected { from, reason } => {
            assert_eq!(from, None);
            assert_eq!(reason.as_deref(), Some("User not online on this host"));
        }
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(alice.state(), PairingState::Idle);
    assert_quiet(&mut alice_rx).await;

    host.shutdown().await;
}

#[tokio::test]
async fn test_full_negotiation_and_chat() {
    let host = RelayHost::start(loopback(RouterConfig::default())).await.unwrap();
    let (alice, mut alice_rx) = join(&host, "alice").await;
    let (bob, mut bob_rx) = join(&host, "bob").await;

    alice.request_pairing(id("bob")).await.unwrap();
    assert_eq!(
        next_event(&mut bob_rx).await,
        RelayEvent::IncomingRequest { from: id("alice") }
    );
    assert_quiet(&mut alice_rx).await;

    bob.accept().await.unwrap();
    assert_eq!(
        next_event(&mut alice_rx).await,
        RelayEvent::RequestAccepted { from: id("bob") }
    );
    assert!(host.router().are_paired(&id("alice"), &id("bob")));

    alice.send_text("hi bob").await.unwrap();
    bob.send_text("hi alice").await.unwrap();
    assert_eq!(
        next_event(&mut bob_rx).await,
        RelayEvent::Message {
            from: id("alice"),
            text: "hi bob".to_string()
        }
    );
    assert_eq!(
        next_event(&mut alice_rx).await,
        RelayEvent::Message {
            from: id("bob"),
            text: "hi alice".to_string()
        }
    );

    host.shutdown().await;
}

#[tokio::test]
async fn test_reject_returns_requester_to_idle() {
    let host = RelayHost::start(loopback(RouterConfig::default())).await.unwrap();
    let (alice, mut alice_rx) = join(&host, "alice").await;
    let (bob, mut bob_rx) = join(&host, "bob").await;

    alice.request_pairing(id("bob")).await.unwrap();
    next_event(&mut bob_rx).await;
    assert_eq!(bob.reject().await.unwrap(), id("alice"));

    assert_eq!(
        next_event(&mut alice_rx).await,
        RelayEvent::RequestRejected {
            from: Some(id("bob")),
            reason: None
        }
    );
    assert_eq!(alice.state(), PairingState::Idle);
    assert_eq!(host.router().stats().pending_requests, 0);

    host.shutdown().await;
}

#[tokio::test]
async fn test_second_registration_takes_over() {
    let host = RelayHost::start(loopback(RouterConfig::default())).await.unwrap();
    let (_first, mut first_rx) = join(&host, "bob").await;
    let url = format!("ws://{}", host.relay_addr());
    let (_second, mut second_rx) = RelayClient::connect(&url, id("bob")).await.unwrap();
    let (alice, _alice_rx) = join(&host, "alice").await;

    // both registered "bob"; wait for the second binding to land
    tokio::time::sleep(Duration::from_millis(100)).await;
    alice.request_pairing(id("bob")).await.unwrap();

    assert_eq!(
        next_event(&mut second_rx).await,
        RelayEvent::IncomingRequest { from: id("alice") }
    );
    assert_quiet(&mut first_rx).await;

    host.shutdown().await;
}

#[tokio::test]
async fn test_disconnect_ends_pairing() {
    let host = RelayHost::start(loopback(RouterConfig::default())).await.unwrap();
    let (alice, mut alice_rx) = join(&host, "alice").await;
    let (bob, mut bob_rx) = join(&host, "bob").await;

    alice.request_pairing(id("bob")).await.unwrap();
    next_event(&mut bob_rx).await;
    bob.accept().await.unwrap();
    next_event(&mut alice_rx).await;

    drop(bob);
    assert_eq!(
        next_event(&mut alice_rx).await,
        RelayEvent::PairingEnded { peer: id("bob") }
    );
    wait_until(|| host.router().registry().lookup(&id("bob")).is_none()).await;

    // alice's local state was reset by the relay's notice
    assert_eq!(alice.paired_with(), None);
    assert_quiet(&mut alice_rx).await;

    host.shutdown().await;
}

#[tokio::test]
async fn test_unanswered_request_expires() {
    let router = RouterConfig {
        request_timeout: Some(Duration::from_millis(100)),
        ..Default::default()
    };
    let host = RelayHost::start(loopback(router)).await.unwrap();
    let (alice, mut alice_rx) = join(&host, "alice").await;
    let (_bob, mut bob_rx) = join(&host, "bob").await;

    alice.request_pairing(id("bob")).await.unwrap();
    next_event(&mut bob_rx).await;

    assert_eq!(
        next_event(&mut alice_rx).await,
        RelayEvent::RequestExpired { to: id("bob") }
    );
    assert_eq!(alice.state(), PairingState::Idle);
    assert_eq!(host.router().stats().pending_requests, 0);

    host.shutdown().await;
}

#[tokio::test]
async fn test_require_pairing_blocks_strangers() {
    let router = RouterConfig {
        require_pairing: true,
        ..Default::default()
    };
    let host = RelayHost::start(loopback(router)).await.unwrap();
    let (_alice, mut alice_rx) = join(&host, "alice").await;
    let (mallory, _mallory_rx) = join(&host, "mallory").await;

    // mallory believes it is paired after a forged acceptance
    host.router().accept_request(id("alice"), id("mallory"));
    wait_until(|| mallory.paired_with().is_some()).await;
    mallory.send_text("let me in").await.unwrap();

    assert_quiet(&mut alice_rx).await;
    assert!(host.router().stats().events_dropped >= 1);

    host.shutdown().await;
}

#[tokio::test]
async fn test_new_pairing_displaces_old_partner() {
    let host = RelayHost::start(loopback(RouterConfig::default())).await.unwrap();
    let (alice, mut alice_rx) = join(&host, "alice").await;
    let (bob, mut bob_rx) = join(&host, "bob").await;
    let (carol, mut carol_rx) = join(&host, "carol").await;

    alice.request_pairing(id("bob")).await.unwrap();
    next_event(&mut bob_rx).await;
    bob.accept().await.unwrap();
    next_event(&mut alice_rx).await;

    // bob stays paired with alice while carol's request waits
    carol.request_pairing(id("bob")).await.unwrap();
    assert_eq!(
        next_event(&mut bob_rx).await,
        RelayEvent::IncomingRequest { from: id("carol") }
    );
    assert_eq!(bob.paired_with(), Some(id("alice")));
    assert_eq!(bob.pending_request().unwrap(), id("carol"));

    assert_eq!(bob.accept().await.unwrap(), id("carol"));
    assert_eq!(bob.paired_with(), Some(id("carol")));

    assert_eq!(
        next_event(&mut alice_rx).await,
        RelayEvent::PairingEnded { peer: id("bob") }
    );
    assert_eq!(alice.state(), PairingState::Idle);
    assert_eq!(
        next_event(&mut carol_rx).await,
        RelayEvent::RequestAccepted { from: id("bob") }
    );
    assert_eq!(carol.paired_with(), Some(id("bob")));
    assert!(host.router().are_paired(&id("bob"), &id("carol")));
    assert!(!host.router().are_paired(&id("alice"), &id("bob")));
    assert_quiet(&mut bob_rx).await;

    host.shutdown().await;
}

#[tokio::test]
async fn test_crossed_requests_pair_once() {
    let host = RelayHost::start(loopback(RouterConfig::default())).await.unwrap();
    let (alice, mut alice_rx) = join(&host, "alice").await;
    let (bob, mut bob_rx) = join(&host, "bob").await;

    alice.request_pairing(id("bob")).await.unwrap();
    bob.request_pairing(id("alice")).await.unwrap();
    assert_eq!(
        next_event(&mut bob_rx).await,
        RelayEvent::IncomingRequest { from: id("alice") }
    );
    assert_eq!(
        next_event(&mut alice_rx).await,
        RelayEvent::IncomingRequest { from: id("bob") }
    );

    assert_eq!(bob.accept().await.unwrap(), id("alice"));
    assert_eq!(
        next_event(&mut alice_rx).await,
        RelayEvent::RequestAccepted { from: id("bob") }
    );

    assert_eq!(alice.paired_with(), Some(id("bob")));
    assert_eq!(bob.paired_with(), Some(id("alice")));
    assert!(alice.pending_request().is_err());
    assert!(bob.pending_request().is_err());
    assert!(host.router().are_paired(&id("alice"), &id("bob")));

    alice.send_text("hi").await.unwrap();
    assert_eq!(
        next_event(&mut bob_rx).await,
        RelayEvent::Message {
            from: id("alice"),
            text: "hi".to_string(),
        }
    );

    host.shutdown().await;
}
