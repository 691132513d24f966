//! Multi-peer calls over the in-process network

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use lan_media_mesh::call::CallState;
use lan_media_mesh::config::AppConfig;
use lan_media_mesh::media::synthetic::{LogDisplay, NullSpeakers, ToneSource};
use lan_media_mesh::network::MemoryNetwork;
use lan_media_mesh::packet::Origin;
use lan_media_mesh::participant::{Devices, Participant, Transport};

fn config() -> AppConfig {
    let mut config = AppConfig::default();
    config.peer.address = "127.0.0.1:0".parse().unwrap();
    config.signaling.request_timeout_ms = 500;
    config.network.receive_poll_ms = 5;
    config.network.reconnect_backoff_ms = 5;
    config
}

fn listening() -> Devices {
    Devices::headless(Arc::new(NullSpeakers::default()), Arc::new(LogDisplay::new(1000)))
}

fn talking() -> Devices {
    let mut devices = listening();
    devices.microphone = Some(Box::new(ToneSource::new(48_000, 440.0)));
    devices
}

async fn start(network: &MemoryNetwork, devices: Devices) -> Participant {
    Participant::start(&config(), devices, Transport::Memory(network.clone()))
        .await
        .unwrap()
}

fn sorted(mut origins: Vec<Origin>) -> Vec<Origin> {
    origins.sort();
    origins
}

fn sorted_addrs(mut addrs: Vec<SocketAddr>) -> Vec<SocketAddr> {
    addrs.sort();
    addrs
}

async fn eventually(mut done: impl FnMut() -> bool) -> bool {
    for _ in 0..300 {
        if done() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    done()
}

#[tokio::test(flavor = "multi_thread")]
async fn test_two_party_call_carries_audio() {
    let network = MemoryNetwork::new();
    let a = start(&network, talking()).await;
    let b = start(&network, listening()).await;

    a.host().await.unwrap();
    b.join(a.address()).await.unwrap();

    assert_eq!(a.state(), CallState::Hosting);
    assert_eq!(b.state(), CallState::Joined);
    assert_eq!(a.members(), b.members());
    assert_eq!(a.members().len(), 2);
    assert_eq!(a.destinations(), vec![b.address()]);
    assert_eq!(b.destinations(), vec![a.address()]);

    assert!(eventually(|| b.speaker_lines().contains(a.origin())).await);
    assert!(b.receiver_stats().datagrams() > 0);
    assert!(a.sender_stats().packets_sent() > 0);

    b.shutdown().await;
    a.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_three_party_leave() {
    let network = MemoryNetwork::new();
    let a = start(&network, listening()).await;
    let b = start(&network, listening()).await;
    let c = start(&network, listening()).await;

    a.host().await.unwrap();
    b.join(a.address()).await.unwrap();
    c.join(a.address()).await.unwrap();

    // C announced itself to B
    assert_eq!(b.members().len(), 3);
    assert_eq!(b.destinations().len(), 2);

    b.leave().await.unwrap();

    assert_eq!(b.state(), CallState::Idle);
    assert!(b.members().is_empty());
    assert!(b.destinations().is_empty());

    let remaining = {
        let mut members = vec![a.origin(), c.origin()];
        members.sort();
        members
    };
    assert_eq!(a.members(), remaining);
    assert_eq!(c.members(), remaining);
    assert_eq!(a.destinations(), vec![c.address()]);
    assert_eq!(c.destinations(), vec![a.address()]);

    for peer in [a, b, c] {
        peer.shutdown().await;
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_join_through_member_reaches_anchor() {
    let network = MemoryNetwork::new();
    let a = start(&network, talking()).await;
    let b = start(&network, listening()).await;
    let c = start(&network, talking()).await;

    a.host().await.unwrap();
    b.join(a.address()).await.unwrap();
    // C only knows B
    c.join(b.address()).await.unwrap();

    let everyone = sorted(vec![a.origin(), b.origin(), c.origin()]);
    assert_eq!(a.members(), everyone);
    assert_eq!(b.members(), everyone);
    assert_eq!(c.members(), everyone);
    assert_eq!(a.destinations(), sorted_addrs(vec![b.address(), c.address()]));
    assert_eq!(c.destinations(), sorted_addrs(vec![a.address(), b.address()]));

    // Media flows both ways between the anchor and the late joiner
    assert!(eventually(|| a.speaker_lines().contains(c.origin())).await);
    assert!(eventually(|| c.speaker_lines().contains(a.origin())).await);

    for peer in [a, b, c] {
        peer.shutdown().await;
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_anchor_leaving_keeps_call_alive() {
    let network = MemoryNetwork::new();
    let a = start(&network, listening()).await;
    let b = start(&network, listening()).await;
    let c = start(&network, listening()).await;
    let d = start(&network, listening()).await;

    a.host().await.unwrap();
    b.join(a.address()).await.unwrap();
    c.join(a.address()).await.unwrap();

    a.leave().await.unwrap();
    assert_eq!(a.state(), CallState::Idle);

    let remaining = sorted(vec![b.origin(), c.origin()]);
    assert_eq!(b.members(), remaining);
    assert_eq!(c.members(), remaining);
    assert_eq!(b.destinations(), vec![c.address()]);
    assert_eq!(c.destinations(), vec![b.address()]);

    // Exactly one of the survivors anchors the call now
    let anchors = [&b, &c].iter().filter(|peer| peer.state() == CallState::Hosting).count();
    assert_eq!(anchors, 1);

    // A newcomer can still join through either survivor
    d.join(c.address()).await.unwrap();
    let everyone = sorted(vec![b.origin(), c.origin(), d.origin()]);
    assert_eq!(b.members(), everyone);
    assert_eq!(c.members(), everyone);
    assert_eq!(d.members(), everyone);
    assert!(a.members().is_empty());

    for peer in [a, b, c, d] {
        peer.shutdown().await;
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_leaving_peer_line_is_torn_down() {
    let network = MemoryNetwork::new();
    let a = start(&network, listening()).await;
    let b = start(&network, talking()).await;

    a.host().await.unwrap();
    b.join(a.address()).await.unwrap();
    let b_origin = b.origin();
    assert!(eventually(|| a.speaker_lines().contains(b_origin)).await);

    b.shutdown().await;

    assert!(eventually(|| !a.speaker_lines().contains(b_origin)).await);
    assert_eq!(a.members(), vec![a.origin()]);
    assert!(a.destinations().is_empty());

    // Packets still in flight must not reopen the line
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!a.speaker_lines().contains(b_origin));

    a.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_rejoin_after_leave_restores_media() {
    let network = MemoryNetwork::new();
    let a = start(&network, listening()).await;
    let b = start(&network, talking()).await;

    a.host().await.unwrap();
    b.join(a.address()).await.unwrap();
    assert!(eventually(|| a.speaker_lines().contains(b.origin())).await);

    b.leave().await.unwrap();
    assert!(eventually(|| !a.speaker_lines().contains(b.origin())).await);

    b.join(a.address()).await.unwrap();
    assert!(eventually(|| a.speaker_lines().contains(b.origin())).await);

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_receiver_recovers_from_outage() {
    let network = MemoryNetwork::new();
    let a = start(&network, talking()).await;
    let b = start(&network, listening()).await;

    a.host().await.unwrap();
    b.join(a.address()).await.unwrap();
    assert!(eventually(|| b.receiver_stats().datagrams() > 0).await);

    network.set_reachable(false);
    assert!(eventually(|| b.receiver_stats().reconnects() > 0).await);

    network.set_reachable(true);
    let before = b.receiver_stats().datagrams();
    assert!(eventually(|| b.receiver_stats().datagrams() > before).await);

    // Reopening never leaks endpoints
    assert!(eventually(|| network.open_endpoints() == 2).await);

    a.shutdown().await;
    b.shutdown().await;
    assert_eq!(network.open_endpoints(), 0);
}
