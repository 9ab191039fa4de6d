//! End-to-end registry behaviour against in-memory fakes.

use std::sync::Arc;
use std::time::Duration;

use rtc_preview::signaling::{SignalMessage, SignalPeer};
use rtc_preview::testing::{FakeConnector, FakeFactory, FakeRelay};
use rtc_preview::{ConnectionStatus, PreviewConfig, PreviewManager, SourceInfo, TrackKind, Transport, MAX_POOL_SIZE};

struct Harness {
    factory: Arc<FakeFactory>,
    relay: Arc<FakeRelay>,
    connector: Arc<FakeConnector>,
    manager: PreviewManager,
}

fn harness() -> Harness {
    harness_with(150)
}

fn harness_with(track_timeout_ms: u64) -> Harness {
    let factory = Arc::new(FakeFactory::default());
    let relay = Arc::new(FakeRelay::default());
    let connector = Arc::new(FakeConnector::default());

    let mut config = PreviewConfig::default();
    config.ice_gather_grace_ms = 5;
    config.track_timeout_ms = track_timeout_ms;
    config.signaling_timeout_ms = 300;
    config.probe_ttl_ms = 60_000;

    let manager = PreviewManager::new(config, factory.clone(), relay.clone(), connector.clone());
    Harness {
        factory,
        relay,
        connector,
        manager,
    }
}

/// Plays the relay side of a message-based negotiation up to the answer.
async fn answer_offer(peer: &mut SignalPeer) {
    assert_eq!(peer.from_local.recv().await, Some(SignalMessage::Request));
    peer.to_local
        .send(Ok(SignalMessage::Offer {
            sdp: "v=0\r\no=- relay 1 IN IP4 127.0.0.1\r\n".into(),
        }))
        .unwrap();
    match peer.from_local.recv().await {
        Some(SignalMessage::Answer { sdp }) => assert!(sdp.starts_with("v=0")),
        other => panic!("Expected answer, got {:?}", other),
    }
}

#[tokio::test]
async fn test_double_start_negotiates_once() {
    let h = harness();
    h.relay.set_post_delay(Duration::from_millis(30));

    tokio::join!(h.manager.start_connection("cam-1"), h.manager.start_connection("cam-1"));

    assert_eq!(h.manager.get_status("cam-1"), ConnectionStatus::Playing);
    assert_eq!(h.relay.offers(), 1);
    assert_eq!(h.relay.start_calls(), 1);
    assert_eq!(h.factory.created(), 1);
}

#[tokio::test]
async fn test_start_while_playing_is_noop() {
    let h = harness();
    h.manager.start_connection("cam-1").await;
    let stream = h.manager.get_stream("cam-1").unwrap();

    h.manager.start_connection("cam-1").await;
    assert_eq!(h.relay.offers(), 1);
    assert_eq!(h.manager.get_stream("cam-1").unwrap().id(), stream.id());
}

#[tokio::test]
async fn test_unreachable_relay_is_unavailable() {
    let h = harness();
    h.relay.set_reachable(false);

    h.manager.start_connection("cam-1").await;

    assert_eq!(h.manager.get_status("cam-1"), ConnectionStatus::Unavailable);
    assert!(h.manager.get_error("cam-1").is_some());
    assert_eq!(h.relay.start_calls(), 0);
    assert_eq!(h.factory.created(), 0);
}

#[tokio::test]
async fn test_unproduceable_source_is_unavailable() {
    let h = harness();
    h.relay.set_source("cam-1", SourceInfo::unavailable());

    h.manager.start_connection("cam-1").await;

    assert_eq!(h.manager.get_status("cam-1"), ConnectionStatus::Unavailable);
    assert_eq!(h.factory.created(), 0);
}

#[tokio::test]
async fn test_request_response_success() {
    let h = harness();
    h.relay.set_source("cam-1", SourceInfo::whep("http://relay/whep/cam-1"));

    h.manager.start_connection("cam-1").await;

    let snapshot = h.manager.snapshot("cam-1").unwrap();
    assert_eq!(snapshot.status, ConnectionStatus::Playing);
    assert_eq!(snapshot.retry_count, 0);
    assert!(snapshot.has_media);
    assert!(snapshot.error_message.is_none());

    let stream = h.manager.get_stream("cam-1").unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(stream.has_kind(TrackKind::Video));
    assert!(stream.has_kind(TrackKind::Audio));
}

#[tokio::test]
async fn test_message_based_success() {
    let h = harness();
    h.relay.set_source("cam-2", SourceInfo::ws("ws://relay/api/ws?src=cam-2"));

    let relay_side = async {
        let mut peer = h.connector.next_peer().await;
        // A stale candidate before the offer, then the offer itself
        peer.to_local
            .send(Ok(SignalMessage::Candidate {
                candidate: "candidate:stale 1 udp 1 10.0.0.9 9 typ host".into(),
                sdp_mid: Some("0".into()),
                sdp_mline_index: Some(0),
            }))
            .unwrap();
        answer_offer(&mut peer).await;
        peer
    };

    let (_, mut peer) = tokio::join!(h.manager.start_connection("cam-2"), relay_side);

    assert_eq!(h.manager.get_status("cam-2"), ConnectionStatus::Playing);
    assert!(h.factory.transport(0).remote_candidates().is_empty());

    // Local candidates keep flowing to the relay, late remote ones are applied
    match peer.from_local.recv().await {
        Some(SignalMessage::Candidate { candidate, .. }) => assert!(candidate.starts_with("candidate:")),
        other => panic!("Expected candidate, got {:?}", other),
    }
    peer.to_local
        .send(Ok(SignalMessage::Candidate {
            candidate: "candidate:late 1 udp 2130706431 127.0.0.1 8555 typ host".into(),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
        }))
        .unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(h.factory.transport(0).remote_candidates().len(), 1);

    // Stopping closes the signaling channel
    h.manager.stop_connection("cam-2").await;
    let closed = tokio::time::timeout(Duration::from_secs(1), async {
        while peer.from_local.recv().await.is_some() {}
    })
    .await;
    assert!(closed.is_ok());
}

#[tokio::test]
async fn test_relay_rejection_is_error() {
    let h = harness();
    h.relay
        .set_answer(Err(rtc_preview::PreviewError::Protocol("WHEP server returned 500".into())));

    h.manager.start_connection("cam-1").await;

    assert_eq!(h.manager.get_status("cam-1"), ConnectionStatus::Error);
    assert!(h.manager.get_error("cam-1").unwrap().contains("500"));
    assert!(h.manager.get_stream("cam-1").is_none());
}

#[tokio::test]
async fn test_track_timeout_returns_transport_to_pool() {
    let h = harness();
    h.factory.set_track_after(None);

    h.manager.start_connection("cam-1").await;

    assert_eq!(h.manager.get_status("cam-1"), ConnectionStatus::Error);
    assert!(h.manager.get_error("cam-1").is_some());
    let stats = h.manager.pool_stats();
    assert_eq!(stats.created, 1);
    assert_eq!(stats.idle, 1);
    assert_eq!(h.factory.transport(0).strip_count(), 1);
}

#[tokio::test]
async fn test_stop_mid_negotiation_is_cancellation() {
    let h = harness();
    h.relay.set_post_delay(Duration::from_millis(200));

    let stopper = async {
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(h.manager.get_status("cam-1"), ConnectionStatus::Connecting);
        h.manager.stop_connection("cam-1").await;
    };
    tokio::join!(h.manager.start_connection("cam-1"), stopper);

    assert_eq!(h.manager.get_status("cam-1"), ConnectionStatus::Idle);
    assert!(h.manager.get_error("cam-1").is_none());
    assert!(h.manager.snapshot("cam-1").is_none());
    assert_eq!(h.manager.pool_stats().idle, 1);
    assert_eq!(h.relay.stops(), 1);
}

#[tokio::test]
async fn test_stop_then_start_uses_fresh_listeners() {
    let h = harness();
    h.manager.start_connection("cam-1").await;
    let first = h.manager.get_stream("cam-1").unwrap();
    h.manager.stop_connection("cam-1").await;
    assert!(h.manager.get_stream("cam-1").is_none());

    h.manager.start_connection("cam-1").await;
    let second = h.manager.get_stream("cam-1").unwrap();

    // Same pooled transport, rebound for the new attempt
    assert_eq!(h.factory.created(), 1);
    assert_eq!(h.factory.transport(0).bind_count(), 2);
    assert_ne!(first.id(), second.id());
    assert_eq!(second.id(), "stream-2");
}

#[tokio::test]
async fn test_restart_during_track_wait_ignores_old_track() {
    let h = harness_with(1_000);
    h.factory.set_track_after(Some(Duration::from_millis(300)));
    let t0 = tokio::time::Instant::now();

    let restarter = async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(h.manager.get_status("cam-1"), ConnectionStatus::Connecting);
        h.manager.stop_connection("cam-1").await;

        let observer = async {
            // The first attempt's track lands at ~300ms, the second's at ~350ms
            tokio::time::sleep_until(t0 + Duration::from_millis(325)).await;
            assert_eq!(h.manager.get_status("cam-1"), ConnectionStatus::Connecting);
            assert!(h.manager.get_stream("cam-1").is_none());
        };
        tokio::join!(h.manager.start_connection("cam-1"), observer);
    };
    tokio::join!(h.manager.start_connection("cam-1"), restarter);

    assert_eq!(h.manager.get_status("cam-1"), ConnectionStatus::Playing);
    assert_eq!(h.manager.get_stream("cam-1").unwrap().id(), "stream-2");
    assert_eq!(h.factory.created(), 1);
    assert_eq!(h.factory.transport(0).bind_count(), 2);
}

#[tokio::test]
async fn test_shutdown_mid_negotiation_closes_transport() {
    let h = harness();
    h.relay.set_post_delay(Duration::from_millis(200));

    let stopper = async {
        tokio::time::sleep(Duration::from_millis(30)).await;
        h.manager.shutdown().await;
        assert_eq!(h.manager.pool_stats().idle, 0);
    };
    tokio::join!(h.manager.start_connection("cam-1"), stopper);

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(h.manager.pool_stats().idle, 0);
    assert!(h.factory.transport(0).state().is_terminal());
    assert!(h.manager.source_ids().is_empty());
}

#[tokio::test]
async fn test_retry_counts_and_resets() {
    let h = harness();
    h.factory.set_track_after(None);

    h.manager.start_connection("cam-1").await;
    assert_eq!(h.manager.get_status("cam-1"), ConnectionStatus::Error);

    h.manager.retry_connection("cam-1").await;
    assert_eq!(h.manager.get_status("cam-1"), ConnectionStatus::Error);
    assert_eq!(h.manager.snapshot("cam-1").unwrap().retry_count, 1);

    h.factory.set_track_after(Some(Duration::from_millis(5)));
    h.manager.retry_connection("cam-1").await;
    let snapshot = h.manager.snapshot("cam-1").unwrap();
    assert_eq!(snapshot.status, ConnectionStatus::Playing);
    assert_eq!(snapshot.retry_count, 0);
    assert_eq!(h.factory.created(), 1);
}

#[tokio::test]
async fn test_retry_after_relay_returns() {
    let h = harness();
    h.relay.set_reachable(false);
    h.manager.start_connection("cam-1").await;
    assert_eq!(h.manager.get_status("cam-1"), ConnectionStatus::Unavailable);

    h.relay.set_reachable(true);
    h.manager.retry_connection("cam-1").await;
    assert_eq!(h.manager.get_status("cam-1"), ConnectionStatus::Playing);
}

#[tokio::test]
async fn test_stop_all_connections() {
    let h = harness();
    for id in ["cam-1", "cam-2", "cam-3"] {
        h.manager.start_connection(id).await;
    }
    assert_eq!(h.manager.source_ids().len(), 3);

    h.manager.stop_all_connections().await;

    for id in ["cam-1", "cam-2", "cam-3"] {
        assert_eq!(h.manager.get_status(id), ConnectionStatus::Idle);
    }
    assert!(h.manager.source_ids().is_empty());
    assert_eq!(h.manager.pool_stats().idle, 3);
    assert_eq!(h.relay.stops(), 3);
}

#[tokio::test]
async fn test_pool_bounded_across_many_sources() {
    let h = harness();
    let ids: Vec<String> = (0..MAX_POOL_SIZE + 3).map(|i| format!("cam-{}", i)).collect();
    for id in &ids {
        h.manager.start_connection(id).await;
    }
    h.manager.stop_all_connections().await;
    assert_eq!(h.manager.pool_stats().idle, MAX_POOL_SIZE);

    h.manager.shutdown().await;
    assert_eq!(h.manager.pool_stats().idle, 0);
    assert!(h.factory.transport(0).state().is_terminal());
}

#[tokio::test]
async fn test_failed_transport_not_reused() {
    let h = harness();
    h.manager.start_connection("cam-1").await;
    h.factory.transport(0).set_state(rtc_preview::TransportState::Failed);
    h.manager.stop_connection("cam-1").await;
    assert_eq!(h.manager.pool_stats().idle, 0);

    h.manager.start_connection("cam-1").await;
    assert_eq!(h.manager.get_status("cam-1"), ConnectionStatus::Playing);
    assert_eq!(h.factory.created(), 2);
}
