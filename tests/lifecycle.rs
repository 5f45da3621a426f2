//! Device registry and peer lifecycle tests

mod common;

use std::sync::Arc;

use zeroize::Zeroizing;

use common::{addr, init_tracing, small_config, standalone};
use secureguard_peer::crypto::x25519::generate_keypair;
use secureguard_peer::error::{NetworkError, PeerError, ProtocolError, QueueError};
use secureguard_peer::protocol::{HandshakeState, Keypair};
use secureguard_peer::{DeviceConfig, PeerEvent, SecureGuardError, SessionKeys, WireGuardConfig};

fn random_key() -> [u8; 32] {
    generate_keypair().1
}

#[tokio::test]
async fn test_peer_limit() {
    init_tracing();
    let node = standalone(
        52001,
        DeviceConfig {
            max_peers: 2,
            ..small_config()
        },
    );

    node.device.new_peer(random_key()).await.unwrap();
    node.device.new_peer(random_key()).await.unwrap();

    let err = node.device.new_peer(random_key()).await.unwrap_err();
    assert!(matches!(err, PeerError::PeerLimitExceeded { limit: 2 }));
    assert_eq!(node.device.peer_count(), 2);
}

#[tokio::test]
async fn test_duplicate_peer_rejected() {
    let node = standalone(52002, small_config());
    let key = random_key();

    node.device.new_peer(key).await.unwrap();
    let err = node.device.new_peer(key).await.unwrap_err();
    assert!(matches!(err, PeerError::DuplicatePeer { .. }));
    assert_eq!(node.device.peer_count(), 1);
}

#[tokio::test]
async fn test_closed_device_refuses_peers() {
    let node = standalone(52003, small_config());
    let peer = node.device.new_peer(random_key()).await.unwrap();
    node.device.up().await;
    assert!(peer.is_running());

    node.device.close().await;

    assert!(!peer.is_running());
    assert_eq!(node.device.peer_count(), 0);
    assert!(node.device.pipeline().is_closed());
    assert!(node.device.bind().is_none());

    let err = node.device.new_peer(random_key()).await.unwrap_err();
    assert!(matches!(err, PeerError::DeviceClosed));

    // Closing twice is harmless, and a closed device stays down
    node.device.close().await;
    node.device.up().await;
    assert!(!node.device.is_up());
}

#[tokio::test]
async fn test_start_and_stop_are_idempotent() {
    let node = standalone(52004, small_config());
    let peer = node.device.new_peer(random_key()).await.unwrap();
    assert!(!peer.is_running());

    node.device.up().await;
    peer.start().await;
    assert!(peer.is_running());
    // Device plus one running peer
    assert_eq!(node.device.pipeline().open_count(), 2);

    peer.stop().await;
    peer.stop().await;
    assert!(!peer.is_running());
    assert_eq!(node.device.pipeline().open_count(), 1);

    peer.start().await;
    assert!(peer.is_running());
    assert_eq!(node.device.pipeline().open_count(), 2);
}

#[tokio::test]
async fn test_stopped_peer_drops_packets() {
    let node = standalone(52005, small_config());
    let peer = node.device.new_peer(random_key()).await.unwrap();
    peer.set_endpoint(Some(addr(52999)));

    peer.send_packet(vec![1, 2, 3]).await;
    assert_eq!(peer.staged_len(), 0);
    assert!(node.bind.sent().is_empty());

    node.device.up().await;
    node.device.down().await;
    peer.send_packet(vec![1, 2, 3]).await;
    assert_eq!(peer.staged_len(), 0);
    assert!(node.bind.sent().is_empty());
}

#[tokio::test]
async fn test_first_packet_starts_handshake() {
    let node = standalone(52006, small_config());
    let peer = node.device.new_peer(random_key()).await.unwrap();
    peer.set_endpoint(Some(addr(52999)));
    node.device.up().await;

    peer.send_packet(vec![0xaa; 20]).await;

    let initiations = node.bind.sent_of_type(1);
    assert_eq!(initiations.len(), 1);
    assert_eq!(initiations[0].to, addr(52999));
    assert_eq!(peer.tx_bytes(), initiations[0].data.len() as u64);

    // The packet waits for the session
    assert_eq!(peer.staged_len(), 1);
    assert_eq!(node.device.index_table().len(), 1);
    peer.with_session(|handshake, keypairs| {
        assert_eq!(handshake.state(), HandshakeState::InitiationCreated);
        assert!(keypairs.is_empty());
    });

    // Further packets inside the rekey timeout do not resend the initiation
    peer.send_packet(vec![0xbb; 20]).await;
    assert_eq!(node.bind.sent_of_type(1).len(), 1);
    assert_eq!(peer.staged_len(), 2);
}

#[tokio::test]
async fn test_staged_queue_drops_oldest() {
    let node = standalone(
        52007,
        DeviceConfig {
            staged_queue_size: 4,
            ..small_config()
        },
    );
    let peer = node.device.new_peer(random_key()).await.unwrap();
    node.device.up().await;

    // No endpoint: the handshake cannot go out and everything stays staged
    for i in 0..6u8 {
        peer.send_packet(vec![i]).await;
    }
    assert_eq!(peer.staged_len(), 4);
    assert!(node.bind.sent().is_empty());
}

#[tokio::test]
async fn test_clear_all_wipes_session() {
    let node = standalone(52008, small_config());
    let peer = node.device.new_peer(random_key()).await.unwrap();
    peer.set_endpoint(Some(addr(52999)));
    node.device.up().await;

    peer.send_packet(vec![7; 10]).await;
    assert!(!peer.with_session(|handshake, _| handshake.is_zeroed()));

    peer.clear_all();

    assert!(peer.with_session(|handshake, keypairs| handshake.is_zeroed() && keypairs.is_empty()));
    assert_eq!(peer.staged_len(), 0);
    assert!(node.device.index_table().is_empty());
}

#[tokio::test]
async fn test_stop_releases_handshake_index() {
    let node = standalone(52009, small_config());
    let peer = node.device.new_peer(random_key()).await.unwrap();
    peer.set_endpoint(Some(addr(52999)));
    node.device.up().await;

    peer.send_packet(vec![7; 10]).await;
    assert_eq!(node.device.index_table().len(), 1);

    node.device.down().await;
    assert!(!peer.is_running());
    assert!(node.device.index_table().is_empty());
    assert_eq!(peer.staged_len(), 0);
    assert!(!peer.is_timer_pending(secureguard_peer::peer::TimerKind::RetransmitHandshake));
}

#[tokio::test]
async fn test_transport_for_stopped_peer_reports_closed_queue() {
    let node = standalone(52019, small_config());
    let peer = node.device.new_peer(random_key()).await.unwrap();
    node.device.up().await;
    assert!(peer.is_running());
    peer.stop().await;

    // An index that still routes to the stopped peer
    let index = node.device.index_table().new_index_for_handshake(&peer);
    let keypair = Arc::new(Keypair::new(
        SessionKeys {
            send: Zeroizing::new([4u8; 32]),
            receive: Zeroizing::new([4u8; 32]),
        },
        false,
        index,
        index,
    ));
    node.device.index_table().swap_index_for_keypair(index, &keypair);

    let msg = keypair.seal(0, b"late").unwrap();
    let err = node.device.handle_datagram(&msg, addr(52999)).await.unwrap_err();
    assert!(matches!(err, SecureGuardError::Queue(QueueError::Closed)));
    assert!(!err.is_recoverable());
}

#[tokio::test]
async fn test_remove_peer_emits_events() {
    let node = standalone(52010, small_config());
    let mut events = node.device.subscribe();
    let key = random_key();

    let peer = node.device.new_peer(key).await.unwrap();
    peer.set_endpoint(Some(addr(52999)));
    node.device.up().await;
    peer.send_packet(vec![1]).await;

    assert!(node.device.remove_peer(&key).await);
    assert!(!node.device.remove_peer(&key).await);
    assert!(node.device.lookup_peer(&key).is_none());
    assert!(node.device.index_table().is_empty());
    assert!(!peer.is_running());

    assert_eq!(events.recv().await.unwrap(), PeerEvent::Added { public_key: key });
    assert_eq!(events.recv().await.unwrap(), PeerEvent::Removed { public_key: key });
}

#[tokio::test]
async fn test_removing_never_started_peer_releases_index() {
    let node = standalone(52011, small_config());
    let key = random_key();
    let peer = node.device.new_peer(key).await.unwrap();
    peer.set_endpoint(Some(addr(52999)));

    // Handshakes may be initiated directly even while stopped
    peer.send_handshake_initiation(false).await.unwrap();
    assert_eq!(node.device.index_table().len(), 1);

    assert!(node.device.remove_peer(&key).await);
    assert!(node.device.index_table().is_empty());
}

#[tokio::test]
async fn test_send_raw_errors() {
    let node = standalone(52012, small_config());
    let peer = node.device.new_peer(random_key()).await.unwrap();

    let err = peer.send_raw(b"hello").await.unwrap_err();
    assert!(matches!(err, NetworkError::NoEndpoint));

    peer.set_endpoint(Some(addr(52999)));
    peer.send_raw(b"hello").await.unwrap();
    assert_eq!(peer.tx_bytes(), 5);

    node.device.bind_update(None);
    let err = peer.send_raw(b"hello").await.unwrap_err();
    assert!(matches!(err, NetworkError::NoBind));
    assert_eq!(peer.tx_bytes(), 5);
}

#[tokio::test]
async fn test_send_raw_after_close_is_silent() {
    let node = standalone(52013, small_config());
    let peer = node.device.new_peer(random_key()).await.unwrap();
    peer.set_endpoint(Some(addr(52999)));

    node.device.close().await;
    assert!(peer.send_raw(b"late").await.is_ok());
    assert_eq!(peer.tx_bytes(), 0);
}

#[tokio::test]
async fn test_endpoint_roaming() {
    let node = standalone(52014, small_config());
    let peer = node.device.new_peer(random_key()).await.unwrap();

    peer.set_endpoint_from_packet(addr(1000));
    assert_eq!(peer.endpoint(), Some(addr(1000)));

    peer.set_disable_roaming(true);
    peer.set_endpoint_from_packet(addr(2000));
    assert_eq!(peer.endpoint(), Some(addr(1000)));

    // Explicit configuration still applies
    peer.set_endpoint(Some(addr(3000)));
    assert_eq!(peer.endpoint(), Some(addr(3000)));
}

#[tokio::test]
async fn test_status_serializes() {
    let node = standalone(52015, small_config());
    let key = random_key();
    let peer = node.device.new_peer(key).await.unwrap();
    peer.set_endpoint(Some(addr(52999)));
    peer.set_persistent_keepalive_interval(25);

    let status = serde_json::to_value(node.device.status()).unwrap();
    let entry = &status[0];

    let encoded = {
        use base64::Engine;
        base64::engine::general_purpose::STANDARD.encode(key)
    };
    assert_eq!(entry["public_key"], encoded.as_str());
    assert_eq!(entry["endpoint"], "127.0.0.1:52999");
    assert_eq!(entry["running"], false);
    assert_eq!(entry["handshake_state"], "zeroed");
    assert_eq!(entry["has_session"], false);
    assert_eq!(entry["persistent_keepalive_interval"], 25);
    assert!(entry["last_handshake_unix_nanos"].is_null());
}

#[tokio::test]
async fn test_handle_datagram_rejects_unknown_traffic() {
    let node = standalone(52016, small_config());
    node.device.up().await;

    let err = node.device.handle_datagram(&[], addr(1)).await.unwrap_err();
    assert!(matches!(err, SecureGuardError::Protocol(_)));

    let err = node
        .device
        .handle_datagram(&[9, 0, 0, 0], addr(1))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        SecureGuardError::Protocol(ProtocolError::InvalidMessageType { msg_type: 9 })
    ));

    // Initiation from a key we do not know
    let mut initiation = vec![1u8, 0, 0, 0, 1, 0, 0, 0];
    initiation.extend_from_slice(&random_key());
    initiation.extend_from_slice(&[0u8; 64]);
    let err = node
        .device
        .handle_datagram(&initiation, addr(1))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        SecureGuardError::Protocol(ProtocolError::UnknownPeer)
    ));

    // Transport data for an index nobody owns
    let mut transport = vec![4u8, 0, 0, 0];
    transport.extend_from_slice(&77u32.to_le_bytes());
    transport.extend_from_slice(&0u64.to_le_bytes());
    transport.extend_from_slice(&[0u8; 16]);
    let err = node
        .device
        .handle_datagram(&transport, addr(1))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        SecureGuardError::Protocol(ProtocolError::InvalidReceiverIndex { index: 77 })
    ));

    // Cookie replies are accepted and ignored
    let cookie = vec![3u8; 64];
    node.device.handle_datagram(&cookie, addr(1)).await.unwrap();
}

#[tokio::test]
async fn test_apply_config() {
    let node = standalone(52017, small_config());
    let (private, public) = generate_keypair();
    let remote = random_key();

    let text = {
        use base64::Engine;
        let b64 = base64::engine::general_purpose::STANDARD;
        format!(
            "[Interface]\nPrivateKey = {}\nListenPort = 51820\n\n\
             [Peer]\nPublicKey = {}\nEndpoint = 10.0.0.1:51820\nPersistentKeepalive = 15\n",
            b64.encode(*private),
            b64.encode(remote)
        )
    };
    let config = WireGuardConfig::parse(&text).unwrap();

    node.device.apply_config(&config).await.unwrap();

    assert_eq!(node.device.public_key(), public);
    let peer = node.device.lookup_peer(&remote).unwrap();
    assert_eq!(peer.endpoint(), Some("10.0.0.1:51820".parse().unwrap()));
    assert_eq!(peer.persistent_keepalive_interval(), 15);
    assert!(!peer.disable_roaming());

    // Applying again updates in place
    node.device.apply_config(&config).await.unwrap();
    assert_eq!(node.device.peer_count(), 1);
}

#[tokio::test]
async fn test_byte_counters_survive_restart() {
    let node = standalone(52018, small_config());
    let peer = node.device.new_peer(random_key()).await.unwrap();
    peer.set_endpoint(Some(addr(52999)));
    node.device.up().await;

    peer.send_packet(vec![3; 8]).await;
    let sent = peer.tx_bytes();
    assert!(sent > 0);

    for _ in 0..3 {
        node.device.down().await;
        node.device.up().await;
    }

    assert!(peer.is_running());
    assert_eq!(peer.tx_bytes(), sent);
    assert!(peer.with_session(|handshake, keypairs| handshake.is_zeroed() && keypairs.is_empty()));
    assert_eq!(node.device.pipeline().open_count(), 2);
}
